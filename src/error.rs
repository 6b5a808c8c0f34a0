//! Unified error handling for MemForge
//!
//! A single error type covers every allocator layer. Allocation paths use
//! `AllocResult<Option<Allocation>>`: `Ok(None)` means the layer cannot serve
//! the request and the caller should try the next strategy, while `Err` is a
//! hard failure (backend fault, poisoned lock) that propagates to the facade.

use crate::backend::SegmentGroup;
use std::fmt;

/// Unified error type for MemForge
#[derive(Debug, thiserror::Error)]
pub enum MemForgeError {
    /// Request exceeds configured maxima or no memory could be obtained
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// Null-ish or inconsistent inputs, bad configuration
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Eviction could not reclaim enough budget
    #[error("budget exceeded in segment {segment:?}: needed {needed_bytes} bytes")]
    BudgetExceeded {
        segment: SegmentGroup,
        needed_bytes: u64,
    },

    /// Pass-through from the device backend
    #[error("backend error: {0}")]
    Backend(String),

    /// Lock poisoned (indicates a bug or concurrent access issue)
    #[error("internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl MemForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            MemForgeError::InvalidArgument(_) => ErrorCategory::User,
            MemForgeError::OutOfMemory(_) | MemForgeError::BudgetExceeded { .. } => {
                ErrorCategory::Recoverable
            }
            MemForgeError::Backend(_) => ErrorCategory::Backend,
            MemForgeError::LockPoisoned(_) => ErrorCategory::Internal,
        }
    }

    /// Check if this error is a temporary condition the caller may retry
    /// after freeing or unlocking memory
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Temporary condition, retry after releasing memory
    Recoverable,
    /// Indicates a bug
    Internal,
    /// Device backend failure
    Backend,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::Backend => write!(f, "Backend"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for MemForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        MemForgeError::LockPoisoned(err.to_string())
    }
}

pub type AllocResult<T> = std::result::Result<T, MemForgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            MemForgeError::InvalidArgument("bad".to_string()).category(),
            ErrorCategory::User
        );
        assert_eq!(
            MemForgeError::OutOfMemory("full".to_string()).category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            MemForgeError::BudgetExceeded {
                segment: SegmentGroup::Local,
                needed_bytes: 1024,
            }
            .category(),
            ErrorCategory::Recoverable
        );
        assert_eq!(
            MemForgeError::Backend("lost device".to_string()).category(),
            ErrorCategory::Backend
        );
        assert_eq!(
            MemForgeError::LockPoisoned("poison".to_string()).category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_is_recoverable() {
        assert!(MemForgeError::OutOfMemory("full".to_string()).is_recoverable());
        assert!(!MemForgeError::InvalidArgument("bad".to_string()).is_recoverable());
        assert!(!MemForgeError::LockPoisoned("poison".to_string()).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = MemForgeError::BudgetExceeded {
            segment: SegmentGroup::Local,
            needed_bytes: 4096,
        };
        assert_eq!(
            err.to_string(),
            "budget exceeded in segment Local: needed 4096 bytes"
        );

        let err = MemForgeError::OutOfMemory("request above maximum".to_string());
        assert_eq!(err.to_string(), "out of memory: request above maximum");
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> MemForgeError {
            MemForgeError::from(err)
        }

        let _ = convert::<i32> as fn(PoisonError<i32>) -> MemForgeError;
    }
}
