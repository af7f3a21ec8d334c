use thiserror::Error;

use crate::hierarchy::ClassId;

/// Builds an [`Error::Fatal`] carrying the source location of the violated contract.
macro_rules! fatal_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Fatal {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Fatal {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which covers every contract violation this library can report.
///
/// Only programming errors surface as `Error`. Lookup misses, exceeded visitation caps and
/// ambiguous implementer sets are ordinary return values (`None`, `false`, ...) because the
/// caller's only reaction to them is "do not speculate".
///
/// # Error Categories
///
/// ## Index faults
/// - [`Error::DuplicateClass`] - A class was announced as loaded twice
/// - [`Error::MissingClassInfo`] - An operation required a record that was never created
///
/// ## Guard commitment faults
/// - [`Error::GuardSiteWithoutLocation`] - A guard site has no patch address
///
/// ## Infrastructure
/// - [`Error::LockError`] - The hierarchy lock was poisoned
/// - [`Error::Fatal`] - Any other violated invariant, with source location
///
/// # Examples
///
/// ```rust
/// use hierscope::{Error, hierarchy::{ClassId, PersistentClassHierarchy}};
///
/// let hierarchy = PersistentClassHierarchy::new();
/// hierarchy.class_loaded(ClassId::new(0x1000))?;
///
/// match hierarchy.class_loaded(ClassId::new(0x1000)) {
///     Err(Error::DuplicateClass(class)) => assert_eq!(class, ClassId::new(0x1000)),
///     other => panic!("unexpected: {:?}", other.map(|_| ())),
/// }
/// # Ok::<(), hierscope::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// A class-load notification arrived for a class that already has a record.
    ///
    /// Every class gets exactly one record for the lifetime of the index. A second
    /// insertion means the VM hook layer delivered the same load twice, which would leave
    /// two records competing for one identity.
    #[error("Class {0} is already present in the hierarchy")]
    DuplicateClass(ClassId),

    /// No record exists for a class that the operation requires to be known.
    ///
    /// Raised when linking a subclass to an unknown class, or when a "should not be newly
    /// extended" assumption refers to a class that has no record at commit time.
    #[error("No class info for {0}")]
    MissingClassInfo(ClassId),

    /// A guard site reached the commit step without a patch location.
    ///
    /// Patching (or registering a hook for) such a site would rewrite an arbitrary address.
    #[error("Guard site has no recorded patch location")]
    GuardSiteWithoutLocation,

    /// Failed to lock target.
    ///
    /// The hierarchy lock is poisoned because a thread panicked while holding it; the
    /// table may be half-updated and must not be trusted.
    #[error("Failed to lock target")]
    LockError,

    /// A violated invariant that has no dedicated variant.
    ///
    /// # Fields
    ///
    /// * `message` - Description of the violated invariant
    /// * `file` - Source file where the violation was detected
    /// * `line` - Source line where the violation was detected
    #[error("Fatal - {file}:{line}: {message}")]
    Fatal {
        /// The message to be printed for the Fatal error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_carries_location() {
        let err = fatal_error!("slot {} unresolved", 7);
        match err {
            Error::Fatal {
                message,
                file,
                line,
            } => {
                assert_eq!(message, "slot 7 unresolved");
                assert!(file.ends_with("error.rs"));
                assert!(line > 0);
            }
            _ => panic!("expected Error::Fatal"),
        }
    }

    #[test]
    fn test_display() {
        let err = Error::DuplicateClass(ClassId::new(0x40));
        assert_eq!(err.to_string(), "Class 0x0000000000000040 is already present in the hierarchy");
    }
}
