use thiserror::Error;

use crate::capture::ResolutionTier;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Resolution {0} is not supported by the selected camera")]
    UnsupportedResolution(ResolutionTier),

    #[error("Signaling request '{event}' timed out after {timeout_ms}ms")]
    SignalingTimeout { event: &'static str, timeout_ms: u64 },

    #[error("Signaling connection closed")]
    SignalingClosed,

    #[error("Signaling transport error: {0}")]
    SignalingTransport(String),

    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Audio graph error: {0}")]
    AudioGraph(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Session was left while the operation was in flight")]
    SessionLeft,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Capture-side failures leave the session running in its previous state.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DeviceUnavailable(_) | Self::UnsupportedResolution(_) | Self::AudioGraph(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(Error::DeviceUnavailable("denied".to_string()).is_recoverable());
        assert!(Error::UnsupportedResolution(ResolutionTier::P720).is_recoverable());
        assert!(!Error::SignalingClosed.is_recoverable());
        assert!(!Error::Negotiation("produce rejected".to_string()).is_recoverable());
    }

    #[test]
    fn test_timeout_message_names_event() {
        let err = Error::SignalingTimeout {
            event: "consume",
            timeout_ms: 10_000,
        };
        assert_eq!(
            err.to_string(),
            "Signaling request 'consume' timed out after 10000ms"
        );
    }
}
