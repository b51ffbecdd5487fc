use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds the session core distinguishes.
///
/// The split between [`Error::ProviderTransient`] and [`Error::ProviderFatal`]
/// drives session recovery: transient faults surface as an apology utterance
/// and return the session to idle, fatal faults destroy the leased provider
/// set and terminate the session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("transient provider failure: {0}")]
    ProviderTransient(String),

    #[error("fatal provider failure: {0}")]
    ProviderFatal(String),

    #[error("provider busy: {0}")]
    ProviderBusy(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("pool closed")]
    PoolClosed,

    #[error("task quota exceeded for client {client_id} (limit {limit})")]
    QuotaExceeded { client_id: String, limit: usize },

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable discriminator used in `error` envelopes on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Protocol(_) => "protocol_error",
            Error::Auth(_) => "auth_error",
            Error::ProviderTransient(_) => "provider_transient",
            Error::ProviderFatal(_) => "provider_fatal",
            Error::ProviderBusy(_) => "provider_busy",
            Error::PoolExhausted(_) => "pool_exhausted",
            Error::PoolClosed => "pool_closed",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Config(_) => "config_error",
            Error::Internal(_) => "internal_error",
        }
    }

    /// Whether the owning session can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_)
                | Error::ProviderTransient(_)
                | Error::ProviderBusy(_)
                | Error::QuotaExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_recoverable() {
        assert!(Error::ProviderTransient("503".into()).is_recoverable());
        assert!(!Error::ProviderFatal("init failed".into()).is_recoverable());
        assert!(!Error::PoolExhausted("asr".into()).is_recoverable());
    }

    #[test]
    fn kind_is_stable_for_wire_use() {
        assert_eq!(Error::PoolExhausted("tts".into()).kind(), "pool_exhausted");
        assert_eq!(
            Error::QuotaExceeded {
                client_id: "c1".into(),
                limit: 4
            }
            .kind(),
            "quota_exceeded"
        );
    }
}
