use crate::error::TransportError;
use std::time::Duration;

/// How long a completed outbound handshake keeps its connection alive after
/// the payload was sent, so in-flight acknowledgments can still be delivered.
pub const DEFAULT_LINGER: Duration = Duration::from_millis(1000);

/// How long a handshake may take to reach its connected state before the
/// adapter forcibly closes it and reclaims the registry entry.
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

pub const EVENTS_CHANNEL_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub linger: Duration,
    pub establish_timeout: Duration,
    /// Capacity of the broadcast channel carrying transport events.
    pub events_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            linger: DEFAULT_LINGER,
            establish_timeout: DEFAULT_ESTABLISH_TIMEOUT,
            events_capacity: EVENTS_CHANNEL_SIZE,
        }
    }
}

impl TransportConfig {
    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        if self.linger.is_zero() {
            return Err(TransportError::InvalidConfig(
                "linger must be non-zero".to_string(),
            ));
        }
        if self.establish_timeout.is_zero() {
            return Err(TransportError::InvalidConfig(
                "establish timeout must be non-zero".to_string(),
            ));
        }
        if self.events_capacity == 0 {
            return Err(TransportError::InvalidConfig(
                "events capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
