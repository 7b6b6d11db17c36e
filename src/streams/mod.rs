pub mod abort_signal;
pub mod byte_source_trait;
pub mod byte_state;
pub mod completion;
pub mod error;
pub mod pipe;
pub(crate) mod queue;
pub mod readable;
pub mod tee;
pub mod transform;
pub mod writable;

// Re-export main types
pub use abort_signal::*;
pub use byte_source_trait::*;
pub use byte_state::*;
pub use completion::Completion;
pub use error::*;
pub use pipe::*;
pub use readable::*;
pub use tee::*;
pub use transform::*;
pub use writable::*;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk. A failure errors the stream.
    fn size(&self, chunk: &T) -> StreamResult<f64>;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> f64;
}

/// Count-based strategy
#[derive(Clone, Debug)]
pub struct CountQueuingStrategy {
    high_water_mark: f64,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl Default for CountQueuingStrategy {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> StreamResult<f64> {
        Ok(1.0)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Clone, Debug)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: f64,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: f64) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

impl<'a> QueuingStrategy<&'a [u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&'a [u8]) -> StreamResult<f64> {
        Ok(chunk.len() as f64)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Strategy backed by a user sizing function.
///
/// ```
/// use whatwg_streams::{SizeFnStrategy, StreamResult};
///
/// let strategy = SizeFnStrategy::new(10.0, |chunk: &String| -> StreamResult<f64> {
///     Ok(chunk.chars().count() as f64)
/// });
/// # let _ = strategy;
/// ```
#[derive(Clone)]
pub struct SizeFnStrategy<F> {
    high_water_mark: f64,
    size: F,
}

impl<F> SizeFnStrategy<F> {
    pub fn new(high_water_mark: f64, size: F) -> Self {
        Self {
            high_water_mark,
            size,
        }
    }
}

impl<T, F> QueuingStrategy<T> for SizeFnStrategy<F>
where
    F: Fn(&T) -> StreamResult<f64>,
{
    fn size(&self, chunk: &T) -> StreamResult<f64> {
        (self.size)(chunk)
    }

    fn high_water_mark(&self) -> f64 {
        self.high_water_mark
    }
}

/// Rejects high-water marks that are NaN or negative. Positive infinity is allowed.
pub(crate) fn validate_high_water_mark(high_water_mark: f64) -> StreamResult<f64> {
    if high_water_mark.is_nan() || high_water_mark < 0.0 {
        return Err(StreamError::range_error(format!(
            "Invalid high water mark: {}",
            high_water_mark
        )));
    }
    Ok(high_water_mark)
}
