//! Injected environment collaborators (Design Notes: "no global `machine`
//! reach"). The engine never touches hardware directly; it calls into a
//! small capabilities record supplied by the embedding application.

/// Watchdog, LED and power-sensor side effects, fed during every
/// suspension point (network reads, retry sleeps, backoff sleeps).
pub trait Capabilities: Send + Sync {
    fn wdt_feed(&self) {}
    fn led_pattern(&self, _pattern: &str) {}
    fn cpu_mhz(&self) -> Option<u32> {
        None
    }
    fn mem_free(&self) -> Option<u64> {
        None
    }
    fn storage_free(&self) -> Option<u64> {
        None
    }
    fn battery_pct(&self) -> Option<u8> {
        None
    }
}

/// No-op capabilities: used for hosts without sensors and in tests, the
/// same role `ota.py`'s CPython `_Machine`/`network = None` shim plays
/// off-device.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCapabilities;

impl Capabilities for NullCapabilities {}
