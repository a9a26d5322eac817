//! Transport facade consumed (not implemented) by the engine core.
//!
//! The actual multi-link fallback (WiFi/cellular/LoRa) selection lives
//! outside this crate; the engine only needs to know roughly how
//! expensive and slow the active link is, to decide whether to prefer a
//! delta transfer over a full blob fetch.

use crate::error::OtaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bandwidth {
    High,
    Medium,
    Low,
    VeryLow,
}

pub trait Transport {
    fn connect(&mut self) -> Result<(), OtaError>;
    fn get_bandwidth(&self) -> Bandwidth;
    fn get_cost_per_kb(&self) -> f64;
    fn get_signal_strength(&self) -> Option<u8>;
}

/// Always-on, free, high-bandwidth transport. Used as the default when no
/// connectivity collaborator is wired in (desktop/server hosts, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnTransport;

impl Transport for AlwaysOnTransport {
    fn connect(&mut self) -> Result<(), OtaError> {
        Ok(())
    }
    fn get_bandwidth(&self) -> Bandwidth {
        Bandwidth::High
    }
    fn get_cost_per_kb(&self) -> f64 {
        0.0
    }
    fn get_signal_strength(&self) -> Option<u8> {
        None
    }
}

/// Whether the delta path should be preferred over a full blob fetch,
/// grounded in `ConnectivityManager.should_use_delta` from the original
/// connectivity manager: prefer delta on low/very-low bandwidth links or
/// any link with a nonzero per-KB cost.
pub fn should_prefer_delta(transport: &dyn Transport) -> bool {
    matches!(transport.get_bandwidth(), Bandwidth::Low | Bandwidth::VeryLow)
        || transport.get_cost_per_kb() > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LowBandwidth;
    impl Transport for LowBandwidth {
        fn connect(&mut self) -> Result<(), OtaError> {
            Ok(())
        }
        fn get_bandwidth(&self) -> Bandwidth {
            Bandwidth::Low
        }
        fn get_cost_per_kb(&self) -> f64 {
            0.0
        }
        fn get_signal_strength(&self) -> Option<u8> {
            Some(40)
        }
    }

    #[test]
    fn prefers_delta_on_low_bandwidth() {
        assert!(should_prefer_delta(&LowBandwidth));
        assert!(!should_prefer_delta(&AlwaysOnTransport));
    }

    #[test]
    fn prefers_delta_on_metered_link() {
        struct Metered;
        impl Transport for Metered {
            fn connect(&mut self) -> Result<(), OtaError> {
                Ok(())
            }
            fn get_bandwidth(&self) -> Bandwidth {
                Bandwidth::High
            }
            fn get_cost_per_kb(&self) -> f64 {
                0.01
            }
            fn get_signal_strength(&self) -> Option<u8> {
                None
            }
        }
        assert!(should_prefer_delta(&Metered));
    }
}
