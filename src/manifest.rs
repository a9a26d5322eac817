//! Manifest verifier: an ordered file list, deletions, an optional
//! post-update hook identifier, and an HMAC-SHA-256 signature over the
//! manifest's canonical JSON form. Verification pops `signature`,
//! serializes the rest with sorted keys and no whitespace, recomputes
//! the HMAC, and compares in constant time.

use crate::error::OtaError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub sha256: Option<String>,
    pub crc32: Option<u32>,
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub files: Vec<ManifestFile>,
    #[serde(default)]
    pub deletes: Vec<String>,
    #[serde(default)]
    pub post_update: Option<String>,
    pub signature: Option<String>,
}

impl Manifest {
    pub fn from_json_str(s: &str) -> Result<Self, OtaError> {
        serde_json::from_str(s).map_err(|e| OtaError::Integrity(format!("invalid manifest json: {e}")))
    }

    /// The manifest's canonical bytes: its JSON value with `signature`
    /// removed and keys sorted, serialized without whitespace — matching
    /// Python's `json.dumps(tmp, sort_keys=True, separators=(",", ":"))`.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, OtaError> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| OtaError::Integrity(format!("manifest serialize failed: {e}")))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("signature");
        }
        let sorted = sort_keys(value);
        serde_json::to_vec(&sorted).map_err(|e| OtaError::Integrity(format!("canonicalize failed: {e}")))
    }

    /// A manifest entry missing both `sha256` and `crc32` cannot be
    /// verified after download (Design Notes (i)): rejected unless the
    /// caller has opted into `allow_unverified_files`.
    pub fn check_verifiable(&self, allow_unverified_files: bool) -> Result<(), OtaError> {
        if allow_unverified_files {
            return Ok(());
        }
        for file in &self.files {
            if file.sha256.is_none() && file.crc32.is_none() {
                return Err(OtaError::Integrity(format!(
                    "manifest entry '{}' has no sha256 or crc32 and allow_unverified_files is false",
                    file.path
                )));
            }
        }
        Ok(())
    }
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            serde_json::to_value(sorted).unwrap()
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

type HmacSha256 = Hmac<Sha256>;

/// Verifies `manifest`'s signature against `key`.
///
/// Absence of `key` skips verification entirely (unsigned manifests
/// trusted by configuration). Absence of a signature when `key` is
/// configured is a hard failure.
pub fn verify_signature(manifest: &Manifest, key: Option<&str>) -> Result<(), OtaError> {
    let Some(key) = key else {
        return Ok(());
    };
    let Some(signature_hex) = manifest.signature.as_deref() else {
        return Err(OtaError::Integrity("manifest missing signature".into()));
    };
    let expected_hex = hmac_sha256_hex(key.as_bytes(), &manifest.canonical_bytes()?);
    let actual = hex::decode(signature_hex)
        .map_err(|e| OtaError::Integrity(format!("invalid signature hex: {e}")))?;
    let expected = hex::decode(&expected_hex).expect("hex::encode output is valid hex");
    if actual.ct_eq(&expected).unwrap_u8() != 1 {
        return Err(OtaError::Integrity("manifest signature mismatch".into()));
    }
    Ok(())
}

fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(signature: Option<String>) -> Manifest {
        Manifest {
            version: "v1".into(),
            files: vec![ManifestFile {
                path: "app.py".into(),
                sha256: Some("deadbeef".into()),
                crc32: None,
                size: Some(4),
            }],
            deletes: vec![],
            post_update: None,
            signature,
        }
    }

    fn sign(manifest: &Manifest, key: &str) -> String {
        hmac_sha256_hex(key.as_bytes(), &manifest.canonical_bytes().unwrap())
    }

    #[test]
    fn accepts_correct_signature() {
        let mut manifest = sample_manifest(None);
        let sig = sign(&manifest, "k");
        manifest.signature = Some(sig);
        verify_signature(&manifest, Some("k")).unwrap();
    }

    #[test]
    fn rejects_tampered_signature() {
        let mut manifest = sample_manifest(None);
        let mut sig = sign(&manifest, "k");
        let last = sig.pop().unwrap();
        let flipped = if last == '0' { '1' } else { '0' };
        sig.push(flipped);
        manifest.signature = Some(sig);
        let err = verify_signature(&manifest, Some("k")).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }

    #[test]
    fn no_key_configured_skips_verification() {
        let manifest = sample_manifest(None);
        verify_signature(&manifest, None).unwrap();
    }

    #[test]
    fn key_configured_without_signature_rejected() {
        let manifest = sample_manifest(None);
        let err = verify_signature(&manifest, Some("k")).unwrap_err();
        assert!(matches!(err, OtaError::Integrity(_)));
    }

    #[test]
    fn canonicalization_is_stable_under_field_reordering() {
        let a = Manifest::from_json_str(
            r#"{"version":"v1","files":[],"deletes":[],"post_update":null,"signature":null}"#,
        )
        .unwrap();
        let b = Manifest::from_json_str(
            r#"{"signature":null,"post_update":null,"deletes":[],"files":[],"version":"v1"}"#,
        )
        .unwrap();
        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn unverifiable_entry_rejected_unless_allowed() {
        let manifest = Manifest {
            version: "v1".into(),
            files: vec![ManifestFile {
                path: "app.py".into(),
                sha256: None,
                crc32: None,
                size: Some(4),
            }],
            deletes: vec![],
            post_update: None,
            signature: None,
        };
        assert!(manifest.check_verifiable(false).is_err());
        assert!(manifest.check_verifiable(true).is_ok());
    }
}
