//! Router configuration.

use std::time::Duration;

use crate::error::RelayError;

/// Tunables for a [`crate::RelayRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Largest frame accepted on submit; larger frames are dropped.
    pub frame_mtu: usize,
    /// Flows empty and silent this long are freed by the periodic sweep.
    /// The sweep runs once per window.
    pub inactivity_window: Duration,
    /// Frames queued per flow before the oldest is dropped.
    pub flow_queue_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            frame_mtu: 1500,
            inactivity_window: Duration::from_secs(60),
            flow_queue_capacity: 16,
        }
    }
}

impl RouterConfig {
    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.frame_mtu == 0 {
            return Err(RelayError::InvalidConfig("frame_mtu must be nonzero"));
        }
        if self.inactivity_window.is_zero() {
            return Err(RelayError::InvalidConfig("inactivity_window must be nonzero"));
        }
        if self.flow_queue_capacity == 0 {
            return Err(RelayError::InvalidConfig("flow_queue_capacity must be nonzero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(RouterConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_zero_fields_rejected() {
        let mut cfg = RouterConfig::default();
        cfg.frame_mtu = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RouterConfig::default();
        cfg.inactivity_window = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = RouterConfig::default();
        cfg.flow_queue_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
