use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

/// Every failure a stream operation can report.
///
/// Errors are cloneable: a stored reason settles every future still waiting
/// on the stream, each exactly once.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// A reader or writer is already attached.
    #[error("Stream is locked")]
    Locked,
    /// The reader or writer used for the operation has released its lock.
    #[error("Lock was released")]
    LockReleased,
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream was canceled{}", with_reason(.0))]
    Canceled(Option<String>),
    #[error("Stream was aborted{}", with_reason(.0))]
    Aborted(Option<String>),
    /// The transform stream was terminated from its controller.
    #[error("Transform stream was terminated")]
    Terminated,
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

fn with_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    /// Usage errors: the operation was invalid for the stream's lock or
    /// lifecycle state, as opposed to a failure reported by an adapter.
    pub fn is_type_error(&self) -> bool {
        matches!(
            self,
            StreamError::Locked
                | StreamError::LockReleased
                | StreamError::Closing
                | StreamError::Closed
        )
    }

    /// Reason text carried into `cancel`/`abort` when this error propagates
    /// across a pipe or transform boundary.
    pub(crate) fn reason(&self) -> Option<String> {
        match self {
            StreamError::Canceled(reason) | StreamError::Aborted(reason) => reason.clone(),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use streamflow::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn example() -> Result<(), StreamError> {
///     Err(ParseError)?;
///     Ok(())
/// }
/// assert!(example().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
