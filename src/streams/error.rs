use std::{error::Error, fmt, sync::Arc};

pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced by streams, readers, writers and their controllers.
///
/// Cloning is cheap; a stored error is handed out to every pending and
/// future request that observes it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Misuse of a stream: locked streams, released readers, writes after close.
    #[error("TypeError: {0}")]
    Type(String),
    /// Out-of-range numbers: invalid chunk sizes, high-water marks, view bounds.
    #[error("RangeError: {0}")]
    Range(String),
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("{}", aborted_message(.0))]
    Aborted(Option<String>),
    #[error("Stream task was dropped")]
    TaskDropped,
    /// Reason handed to the source when both tee branches were canceled.
    #[error("{}", composite_message(.0))]
    Composite(Arc<(Option<StreamError>, Option<StreamError>)>),
    #[error(transparent)]
    Other(Arc<dyn Error + Send + Sync>),
}

fn aborted_message(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!("Stream was aborted: {}", reason),
        None => "Stream was aborted".to_string(),
    }
}

fn composite_message(reasons: &(Option<StreamError>, Option<StreamError>)) -> String {
    let describe = |reason: &Option<StreamError>| match reason {
        Some(reason) => reason.to_string(),
        None => "no reason".to_string(),
    };
    format!(
        "Both tee branches were canceled: [{}, {}]",
        describe(&reasons.0),
        describe(&reasons.1)
    )
}

impl StreamError {
    pub fn type_error(message: impl Into<String>) -> Self {
        StreamError::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        StreamError::Range(message.into())
    }

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

    /// Builds the reason passed to a tee source once both branches are canceled.
    pub fn composite(first: Option<StreamError>, second: Option<StreamError>) -> Self {
        StreamError::Composite(Arc::new((first, second)))
    }

    /// Returns the per-branch reasons if this is a composite tee reason.
    pub fn as_composite(&self) -> Option<(&Option<StreamError>, &Option<StreamError>)> {
        match self {
            StreamError::Composite(reasons) => Some((&reasons.0, &reasons.1)),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
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
/// ```rust,ignore
/// use whatwg_streams::impl_stream_error_from;
///
/// impl_stream_error_from!(serde_json::Error, my_crate::Error);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
