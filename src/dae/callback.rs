use std::panic::{self, AssertUnwindSafe};

use log::{error, warn};

use crate::error::{CallbackError, DaeError};

/// Run a user callback and translate its outcome at the callback boundary.
///
/// Recoverable failures are passed on as recoverable [DaeError::Callback] values so the
/// integration core can retry. Fatal failures, and panics raised inside the callback,
/// become fatal errors carrying the name of the operation.
pub fn guard<T>(
    operation: &'static str,
    f: impl FnOnce() -> Result<T, CallbackError>,
) -> Result<T, DaeError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(CallbackError::Recoverable(status))) => {
            warn!("{operation}: recoverable failure with status {status}");
            Err(DaeError::Callback {
                operation,
                source: CallbackError::Recoverable(status),
            })
        }
        Ok(Err(CallbackError::Fatal(msg))) => {
            error!("{operation} failed: {msg}");
            Err(DaeError::Callback {
                operation,
                source: CallbackError::Fatal(msg),
            })
        }
        Err(payload) => {
            let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "callback panicked".to_string()
            };
            error!("{operation} panicked: {msg}");
            Err(DaeError::Callback {
                operation,
                source: CallbackError::Fatal(msg),
            })
        }
    }
}
