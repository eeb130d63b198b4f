use fleet_exec::ExecError;
use fleet_store::StoreError;
use tracing::warn;

/// Why a callback could not be applied.
///
/// The variant decides what happens at the dispatcher boundary: remote-side
/// failures keep the state already written, everything else rolls back.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("invalid parameters for {command}: {reason}")]
    InvalidParameters { command: String, reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote dispatch failed: {0}")]
    Dispatch(#[from] ExecError),

    #[error("host unavailable: {0}")]
    HostUnavailable(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type HandlerResult<T> = Result<T, HandlerError>;

impl HandlerError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// False for failures on the remote side, whose already-written state is
    /// committed anyway.
    pub fn rolls_back(&self) -> bool {
        !matches!(self, Self::Dispatch(_) | Self::HostUnavailable(_))
    }

    /// Short class name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParameters { .. } => "invalid_parameters",
            Self::NotFound { .. } => "not_found",
            Self::Store(_) => "store",
            Self::Dispatch(_) => "dispatch",
            Self::HostUnavailable(_) => "host_unavailable",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// Accumulates best-effort failures so a handler can keep going after a
/// remote dispatch fails.
///
/// Remote-side errors are logged and the first one is kept for the final
/// result. Any other error is handed straight back for `?`.
#[derive(Debug, Default)]
pub struct Deferred {
    first: Option<HandlerError>,
}

impl Deferred {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb<T>(&mut self, result: HandlerResult<T>) -> HandlerResult<Option<T>> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(e) if !e.rolls_back() => {
                warn!(error = %e, "Best-effort step failed, continuing");
                if self.first.is_none() {
                    self.first = Some(e);
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.first.is_none()
    }

    /// The value, or the first absorbed error.
    pub fn finish<T>(self, value: T) -> HandlerResult<T> {
        match self.first {
            Some(e) => Err(e),
            None => Ok(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch_error() -> HandlerError {
        HandlerError::Dispatch(ExecError::Refused("add_fwrule.sh".to_string()))
    }

    #[test]
    fn test_rollback_classes() {
        assert!(HandlerError::protocol("terminal").rolls_back());
        assert!(HandlerError::not_found("instance", 42).rolls_back());
        assert!(HandlerError::Store(StoreError::not_found("task", 1)).rolls_back());
        assert!(!dispatch_error().rolls_back());
        assert!(!HandlerError::HostUnavailable("hv7 is down".to_string()).rolls_back());
    }

    #[test]
    fn test_not_found_message() {
        let err = HandlerError::not_found("instance", 42);
        assert_eq!(err.to_string(), "instance 42 not found");
        assert_eq!(err.kind(), "not_found");
    }

    #[test]
    fn test_deferred_keeps_first_remote_error() {
        let mut deferred = Deferred::new();
        assert_eq!(deferred.absorb(Ok(3)).unwrap(), Some(3));
        assert!(deferred.is_clean());
        assert!(deferred.absorb::<()>(Err(dispatch_error())).unwrap().is_none());
        assert!(
            deferred
                .absorb::<()>(Err(HandlerError::HostUnavailable("hv9".to_string())))
                .unwrap()
                .is_none()
        );
        let err = deferred.finish(()).unwrap_err();
        assert!(matches!(err, HandlerError::Dispatch(_)));
    }

    #[test]
    fn test_deferred_propagates_rollback_errors() {
        let mut deferred = Deferred::new();
        let err = deferred
            .absorb::<()>(Err(HandlerError::protocol("stale")))
            .unwrap_err();
        assert!(matches!(err, HandlerError::Protocol(_)));
        assert_eq!(deferred.finish(7).unwrap(), 7);
    }
}
