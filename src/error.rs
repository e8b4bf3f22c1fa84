//! Unified error handling for the bridge
//!
//! Every fallible operation in the crate returns [`BridgeResult`]. The
//! bridge has no error channel towards its callers: the C entry points and
//! the engine trampolines turn an error into a process abort through
//! [`fatal`]. Internally errors stay values so they can be tested.

use std::fmt;

use crate::abi::Context;

/// Unified error type for the bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    // ========== Device Errors ==========
    /// Tensors of one call live on different devices
    #[error("Inconsistent context: source({current}) vs target({incoming})")]
    InconsistentContext { current: Context, incoming: Context },

    /// Host reported a device type the bridge does not know
    #[error("Unsupported device type: {0}")]
    UnsupportedDevice(i32),

    /// GPU task without a stream in its run context
    #[error("Engine run context carries no stream for a GPU task")]
    StreamUnavailable,

    // ========== Argument Errors ==========
    /// Argument slot that is neither POD nor a framework tensor
    #[error("Only POD types are allowed in an async call: argument {position} has type code {type_code}")]
    NonPodArgument { position: usize, type_code: i32 },

    /// Const argument position rejected by validation
    #[error("Invalid const argument position: {0}")]
    InvalidConstLocation(String),

    /// Malformed argument buffer or name
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ========== Host Errors ==========
    /// Host primitives were never installed
    #[error("Host API not registered; call RegisterMXAPI first")]
    HostNotRegistered,

    /// Host primitive returned a non-zero status
    #[error("Host call {call} failed with status {code}")]
    HostCallFailed { call: &'static str, code: i32 },

    /// Engine refused the task
    #[error("Engine push failed with status {0}")]
    EnginePushFailed(i32),

    // ========== Function Errors ==========
    /// User packed function returned a non-zero status
    #[error("Packed function failed with status {code}")]
    FunctionFailed { code: i32 },

    // ========== Internal Errors ==========
    /// Lock poisoned (a thread panicked while holding it)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Categorize the error for diagnostics
    pub fn category(&self) -> ErrorCategory {
        match self {
            BridgeError::NonPodArgument { .. }
            | BridgeError::InvalidConstLocation(_)
            | BridgeError::InvalidArgument(_)
            | BridgeError::FunctionFailed { .. } => ErrorCategory::User,

            BridgeError::InconsistentContext { .. }
            | BridgeError::UnsupportedDevice(_)
            | BridgeError::StreamUnavailable => ErrorCategory::Device,

            BridgeError::HostNotRegistered | BridgeError::HostCallFailed { .. } => {
                ErrorCategory::Host
            }

            BridgeError::EnginePushFailed(_) => ErrorCategory::Engine,

            BridgeError::LockPoisoned(_) | BridgeError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error points at the caller's input
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this error indicates a bug in the bridge
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid arguments or operator schema
    User,
    /// Device placement or stream problem
    Device,
    /// Host framework primitive failed or missing
    Host,
    /// Engine rejected the task
    Engine,
    /// Bug in the bridge
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Device => write!(f, "Device"),
            ErrorCategory::Host => write!(f, "Host"),
            ErrorCategory::Engine => write!(f, "Engine"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for BridgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        BridgeError::LockPoisoned(err.to_string())
    }
}

/// Result type using [`BridgeError`]
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Convert a host status code into a result
pub(crate) fn check_host(call: &'static str, code: i32) -> BridgeResult<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(BridgeError::HostCallFailed { call, code })
    }
}

/// Report an error and abort the process
///
/// Used only where no caller can receive the error: C entry points and
/// callbacks invoked by the host engine.
pub fn fatal(err: &BridgeError) -> ! {
    tracing::error!(category = %err.category(), "fatal bridge error: {}", err);
    eprintln!("mxtvm-bridge: {}", err);
    std::process::abort()
}

/// Turn a caught panic payload into an internal error
pub(crate) fn from_panic(context: &str, payload: Box<dyn std::any::Any + Send>) -> BridgeError {
    let message = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    };
    BridgeError::Internal(format!("panic in {}: {}", context, message))
}

/// Unwrap a result or abort the process
pub fn or_fatal<T>(result: BridgeResult<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(&err),
    }
}

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("param block for task {} already released", id));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::BridgeError::Internal($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::BridgeError::Internal(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-argument error with context
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::BridgeError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::BridgeError::InvalidArgument(format!($fmt, $($arg)*))
    };
}
