//! Error types and context management for alignment operations

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main error type for all alignment operations
#[derive(Debug)]
pub enum AlignError {
    /// Failed to load a section image from the filesystem
    ImageLoad {
        /// Path to the image file
        path: PathBuf,
        /// Underlying image loading error
        source: image::ImageError,
    },

    /// Failed to write a section image to disk
    ImageExport {
        /// Path where export was attempted
        path: PathBuf,
        /// Underlying image export error
        source: image::ImageError,
    },

    /// Configuration or operation parameter failed validation
    InvalidParameter {
        /// Name of the invalid parameter
        parameter: &'static str,
        /// Provided value that failed validation
        value: String,
        /// Explanation of why the value is invalid
        reason: String,
    },

    /// Two tensors that must agree in shape do not
    ShapeMismatch {
        /// Operation that compared the shapes
        operation: &'static str,
        /// Shape the operation required
        expected: Vec<usize>,
        /// Shape that was supplied
        found: Vec<usize>,
    },

    /// A pairwise lookup needs an offset volume that was never registered
    MissingOffset {
        /// The offending offset (target z minus source z)
        offset: i64,
        /// Offsets that are registered with the store
        available: Vec<i64>,
    },

    /// Vector voting was asked to vote over nothing
    NoCandidates {
        /// Section the vote was for
        z: i64,
    },

    /// Numerical computation produced an invalid result
    Computation {
        /// Name of the computation that failed
        operation: &'static str,
        /// Description of the failure
        reason: String,
    },

    /// Storage backend is momentarily unavailable, the call may be retried
    Transient {
        /// Storage operation that failed
        operation: &'static str,
        /// Logical layer path involved
        path: String,
        /// Description of the failure
        reason: String,
    },

    /// Storage backend rejected the request for good
    Storage {
        /// Storage operation that failed
        operation: &'static str,
        /// Logical layer path involved
        path: String,
        /// Description of the failure
        reason: String,
    },

    /// General file system operation failure
    FileSystem {
        /// Path involved in the operation
        path: PathBuf,
        /// Description of the operation that failed
        operation: &'static str,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Task or configuration record could not be (de)serialized
    Serialization {
        /// What was being serialized
        context: &'static str,
        /// Underlying serde error
        source: serde_json::Error,
    },

    /// Completion markers for a phase did not all appear in time
    BarrierTimeout {
        /// Marker prefix of the phase
        prefix: String,
        /// Number of markers the phase must produce
        expected: usize,
        /// Number of markers present when the wait gave up
        found: usize,
        /// Total time spent waiting
        waited: Duration,
    },

    /// Tasks of a phase were still pending or leased when the wait gave up
    QueueNotDrained {
        /// Marker prefix of the phase
        prefix: String,
        /// Tasks pending or leased at the last poll
        outstanding: usize,
        /// Total time spent waiting
        waited: Duration,
    },

    /// A chunk task failed and aborted its phase
    TaskFailed {
        /// Human readable task description
        task: String,
        /// Underlying failure
        source: Box<AlignError>,
    },
}

impl AlignError {
    /// Whether the failure is worth retrying
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for AlignError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageLoad { path, source } => {
                write!(f, "Failed to load image '{}': {source}", path.display())
            }
            Self::ImageExport { path, source } => {
                write!(
                    f,
                    "Failed to export image to '{}': {source}",
                    path.display()
                )
            }
            Self::InvalidParameter {
                parameter,
                value,
                reason,
            } => {
                write!(f, "Invalid parameter '{parameter}' = '{value}': {reason}")
            }
            Self::ShapeMismatch {
                operation,
                expected,
                found,
            } => {
                write!(
                    f,
                    "Shape mismatch in {operation}: expected {expected:?}, found {found:?}"
                )
            }
            Self::MissingOffset { offset, available } => {
                write!(
                    f,
                    "Offset {offset} is not registered in the pairwise store (available: {available:?})"
                )
            }
            Self::NoCandidates { z } => {
                write!(f, "No candidate fields to vote on for section {z}")
            }
            Self::Computation { operation, reason } => {
                write!(f, "Computation error in {operation}: {reason}")
            }
            Self::Transient {
                operation,
                path,
                reason,
            } => {
                write!(f, "Transient storage error during {operation} on '{path}': {reason}")
            }
            Self::Storage {
                operation,
                path,
                reason,
            } => {
                write!(f, "Storage error during {operation} on '{path}': {reason}")
            }
            Self::FileSystem {
                path,
                operation,
                source,
            } => {
                write!(
                    f,
                    "File system error during {operation} on '{}': {source}",
                    path.display()
                )
            }
            Self::Serialization { context, source } => {
                write!(f, "Serialization error for {context}: {source}")
            }
            Self::BarrierTimeout {
                prefix,
                expected,
                found,
                waited,
            } => {
                write!(
                    f,
                    "Timed out after {:.1}s waiting for '{prefix}': {found}/{expected} markers present",
                    waited.as_secs_f64()
                )
            }
            Self::QueueNotDrained {
                prefix,
                outstanding,
                waited,
            } => {
                write!(
                    f,
                    "Timed out after {:.1}s waiting for the queue to drain after '{prefix}': {outstanding} tasks outstanding",
                    waited.as_secs_f64()
                )
            }
            Self::TaskFailed { task, source } => {
                write!(f, "Task {task} failed: {source}")
            }
        }
    }
}

impl std::error::Error for AlignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ImageLoad { source, .. } | Self::ImageExport { source, .. } => Some(source),
            Self::FileSystem { source, .. } => Some(source),
            Self::Serialization { source, .. } => Some(source),
            Self::TaskFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Convenience type alias for alignment results
pub type Result<T> = std::result::Result<T, AlignError>;

/// Additional context to enrich error messages
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    /// Section being processed
    pub z: Option<i64>,
    /// Resolution level being processed
    pub mip: Option<u32>,
    /// Operation being performed
    pub operation: Option<&'static str>,
}

/// Enriches error messages with pipeline state information
pub trait WithContext<T> {
    /// Add error context to a Result
    ///
    /// # Errors
    ///
    /// Propagates the original error with additional context applied
    fn with_context(self, context: ErrorContext) -> Result<T>;

    /// Add just the operation context
    ///
    /// # Errors
    ///
    /// Propagates the original error with the operation context applied
    fn with_operation(self, operation: &'static str) -> Result<T>;
}

impl<T, E> WithContext<T> for std::result::Result<T, E>
where
    E: Into<AlignError>,
{
    fn with_context(self, context: ErrorContext) -> Result<T> {
        self.map_err(|e| {
            let error = e.into();
            // Only task-level failures benefit from a location
            match (context.operation, context.z) {
                (Some(operation), z) if !matches!(error, AlignError::TaskFailed { .. }) => {
                    let location = match (z, context.mip) {
                        (Some(z), Some(mip)) => format!("{operation} z={z} mip={mip}"),
                        (Some(z), None) => format!("{operation} z={z}"),
                        _ => operation.to_string(),
                    };
                    AlignError::TaskFailed {
                        task: location,
                        source: Box::new(error),
                    }
                }
                _ => error,
            }
        })
    }

    fn with_operation(self, operation: &'static str) -> Result<T> {
        self.with_context(ErrorContext {
            operation: Some(operation),
            ..Default::default()
        })
    }
}

impl From<image::ImageError> for AlignError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageLoad {
            path: PathBuf::from("<unknown>"),
            source: err,
        }
    }
}

impl From<std::io::Error> for AlignError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("<unknown>"),
            operation: "unknown",
            source: err,
        }
    }
}

impl From<serde_json::Error> for AlignError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            context: "json",
            source: err,
        }
    }
}

/// Create an invalid parameter error
pub fn invalid_parameter(
    parameter: &'static str,
    value: &impl ToString,
    reason: &impl ToString,
) -> AlignError {
    AlignError::InvalidParameter {
        parameter,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Create a computation error
pub fn computation_error(operation: &'static str, reason: &impl ToString) -> AlignError {
    AlignError::Computation {
        operation,
        reason: reason.to_string(),
    }
}

/// Create a fatal storage error
pub fn storage_error(operation: &'static str, path: &str, reason: &impl ToString) -> AlignError {
    AlignError::Storage {
        operation,
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Create a file system error that remembers the path it happened on
pub fn fs_error(
    path: impl Into<PathBuf>,
    operation: &'static str,
    source: std::io::Error,
) -> AlignError {
    AlignError::FileSystem {
        path: path.into(),
        operation,
        source,
    }
}

/// Check that two tensor shapes agree
///
/// # Errors
///
/// Returns [`AlignError::ShapeMismatch`] when the shapes differ
pub fn ensure_shape(operation: &'static str, expected: &[usize], found: &[usize]) -> Result<()> {
    if expected == found {
        Ok(())
    } else {
        Err(AlignError::ShapeMismatch {
            operation,
            expected: expected.to_vec(),
            found: found.to_vec(),
        })
    }
}
