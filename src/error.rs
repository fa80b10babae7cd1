//! Unified error handling for denoiseforge
//!
//! Every fallible operation inside the crate returns [`DenoiseResult`]. The
//! error enum carries a message and maps onto the small, stable set of public
//! [`ErrorCode`]s that the handle layer stores in sticky error slots:
//! - User errors (bad arguments, unknown names, out-of-range regions)
//! - State errors (commit misuse, execute before commit, invalid weights)
//! - Resource errors (allocation failure, missing hardware support)
//! - Internal errors (violated contracts inside the core)

use std::fmt;

/// Public error codes observable through the sticky error slots.
///
/// The numeric values are stable and part of the handle-level contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ErrorCode {
    /// No error since the last query
    #[default]
    None = 0,
    /// Unknown or internal error
    Unknown = 1,
    /// Invalid argument (null pointer, bad name, out-of-range region)
    InvalidArgument = 2,
    /// Invalid operation for the current object state
    InvalidOperation = 3,
    /// Not enough memory to complete the operation
    OutOfMemory = 4,
    /// The requested hardware or backend is not supported
    UnsupportedHardware = 5,
    /// Execution was cancelled by the progress monitor
    Cancelled = 6,
}

impl ErrorCode {
    /// Convert from the raw integer representation
    pub fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(ErrorCode::None),
            1 => Some(ErrorCode::Unknown),
            2 => Some(ErrorCode::InvalidArgument),
            3 => Some(ErrorCode::InvalidOperation),
            4 => Some(ErrorCode::OutOfMemory),
            5 => Some(ErrorCode::UnsupportedHardware),
            6 => Some(ErrorCode::Cancelled),
            _ => None,
        }
    }

    /// Raw integer value of the code
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::None => "none",
            ErrorCode::Unknown => "unknown error",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::InvalidOperation => "invalid operation",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::UnsupportedHardware => "unsupported hardware",
            ErrorCode::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Unified error type for denoiseforge
#[derive(Debug, thiserror::Error)]
pub enum DenoiseError {
    // ========== User Errors ==========
    /// Bad, null or out-of-range argument
    #[error("{0}")]
    InvalidArgument(String),

    // ========== State Errors ==========
    /// Object state machine misuse
    #[error("{0}")]
    InvalidOperation(String),

    // ========== Resource Errors ==========
    /// Allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Backend not available in this build or on this machine
    #[error("unsupported hardware: {0}")]
    UnsupportedHardware(String),

    // ========== Cancellation ==========
    /// The progress monitor asked to stop
    #[error("execution was cancelled")]
    Cancelled,

    // ========== Internal Errors ==========
    /// A contract inside the core was violated (indicates a bug)
    #[error("logic error: {0}")]
    Logic(String),

    /// Lock poisoned by a panicking thread
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DenoiseError {
    /// Public error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DenoiseError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            DenoiseError::InvalidOperation(_) => ErrorCode::InvalidOperation,
            DenoiseError::OutOfMemory(_) => ErrorCode::OutOfMemory,
            DenoiseError::UnsupportedHardware(_) => ErrorCode::UnsupportedHardware,
            DenoiseError::Cancelled => ErrorCode::Cancelled,
            DenoiseError::Logic(_) | DenoiseError::LockPoisoned(_) | DenoiseError::Io(_) => {
                ErrorCode::Unknown
            }
        }
    }

    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            DenoiseError::InvalidArgument(_) => ErrorCategory::User,
            DenoiseError::InvalidOperation(_) => ErrorCategory::State,
            DenoiseError::OutOfMemory(_) | DenoiseError::UnsupportedHardware(_) => {
                ErrorCategory::Resource
            }
            DenoiseError::Cancelled => ErrorCategory::Cancelled,
            DenoiseError::Logic(_) | DenoiseError::LockPoisoned(_) | DenoiseError::Io(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this is a user-facing error (actionable by users)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User | ErrorCategory::State)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Message stored next to the code in sticky error slots
    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input supplied by the caller
    User,
    /// Call made in the wrong object state
    State,
    /// Memory or hardware could not be provided
    Resource,
    /// Run stopped by the caller
    Cancelled,
    /// Bug or system failure
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::State => write!(f, "State"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::Cancelled => write!(f, "Cancelled"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

// Note: From<std::io::Error> is derived by #[from] on the Io variant

impl<T> From<std::sync::PoisonError<T>> for DenoiseError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        DenoiseError::LockPoisoned(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type DenoiseResult<T> = std::result::Result<T, DenoiseError>;

// ========== Helper Macros ==========

/// Create an invalid-argument error
///
/// # Examples
/// ```ignore
/// return Err(invalid_argument!("image width {} exceeds the maximum", w));
/// ```
#[macro_export]
macro_rules! invalid_argument {
    ($msg:expr) => {
        $crate::error::DenoiseError::InvalidArgument($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DenoiseError::InvalidArgument(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-operation error
#[macro_export]
macro_rules! invalid_operation {
    ($msg:expr) => {
        $crate::error::DenoiseError::InvalidOperation($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DenoiseError::InvalidOperation(format!($fmt, $($arg)*))
    };
}

/// Create a logic error (violated internal contract)
#[macro_export]
macro_rules! logic_error {
    ($msg:expr) => {
        $crate::error::DenoiseError::Logic($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::DenoiseError::Logic(format!($fmt, $($arg)*))
    };
}

/// Wrap an IO error with context
pub fn io_context(err: std::io::Error, msg: &str) -> DenoiseError {
    DenoiseError::Io(std::io::Error::new(err.kind(), format!("{}: {}", msg, err)))
}
