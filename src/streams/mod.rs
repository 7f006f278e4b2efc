pub mod byte_stream;
pub mod error;
mod lock;
pub mod pipe;
mod queue;
pub mod readable;
pub mod tee;
pub mod transform;
pub mod writable;

use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicU64, Ordering},
    task::Waker,
};

pub use byte_stream::{ReadableByteSource, ReadableByteStreamController, ReadableStreamBYOBReader};
pub use error::StreamError;
pub use pipe::{PipeBuilder, StreamPipeOptions};
pub use readable::{
    AsyncStreamSource, ByteStream, DefaultStream, IteratorSource, ReadableSource, ReadableStream,
    ReadableStreamBuilder, ReadableStreamDefaultController, ReadableStreamDefaultReader,
    StreamState, StreamTypeMarker,
};
pub use tee::TeeBuilder;
pub use transform::{
    IdentityTransformer, MapTransformer, TransformReadableSource, TransformStream,
    TransformStreamBuilder, TransformStreamDefaultController, TransformWritableSink, Transformer,
};
pub use writable::{
    WritableSink, WritableState, WritableStream, WritableStreamBuilder,
    WritableStreamDefaultController, WritableStreamDefaultWriter,
};

pub type StreamResult<T> = Result<T, StreamError>;

/// High water mark of a readable stream built without an explicit strategy.
pub const DEFAULT_READABLE_HIGH_WATER_MARK: usize = 1;
/// High water mark of a writable stream built without an explicit strategy.
pub const DEFAULT_WRITABLE_HIGH_WATER_MARK: usize = 1;
/// Readable side of a transform stream buffers nothing by default, so the
/// transformer only runs when a consumer is waiting.
pub const DEFAULT_TRANSFORM_READABLE_HIGH_WATER_MARK: usize = 0;
/// Byte streams pull on demand only.
pub const DEFAULT_BYTE_HIGH_WATER_MARK: usize = 0;
/// Size of the buffer handed to `ReadableByteSource::pull` when no BYOB read
/// is outstanding.
pub const DEFAULT_AUTO_ALLOCATE_CHUNK_SIZE: usize = 16 * 1024;

/// Generic queuing strategy trait
pub trait QueuingStrategy<T> {
    /// Return the size of the chunk
    fn size(&self, chunk: &T) -> usize;
    /// Return high water mark (desired max queue size)
    fn high_water_mark(&self) -> usize;
}

/// Count-based strategy
#[derive(Debug, Clone, Copy)]
pub struct CountQueuingStrategy {
    high_water_mark: usize,
}

impl CountQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl<T> QueuingStrategy<T> for CountQueuingStrategy {
    fn size(&self, _chunk: &T) -> usize {
        1
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// Byte length strategy for types with known byte sizes
#[derive(Debug, Clone, Copy)]
pub struct ByteLengthQueuingStrategy {
    high_water_mark: usize,
}

impl ByteLengthQueuingStrategy {
    pub const fn new(high_water_mark: usize) -> Self {
        Self { high_water_mark }
    }
}

impl QueuingStrategy<Vec<u8>> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &Vec<u8>) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<String> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &String) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

impl QueuingStrategy<&[u8]> for ByteLengthQueuingStrategy {
    fn size(&self, chunk: &&[u8]) -> usize {
        chunk.len()
    }

    fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }
}

/// A set of wakers without duplicates (based on `will_wake`).
#[derive(Default)]
pub(crate) struct WakerSet(Mutex<Vec<Waker>>);

impl WakerSet {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    pub(crate) fn register(&self, waker: &Waker) {
        let mut wakers = self.0.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }

    /// Wake all registered wakers and clear the set.
    pub(crate) fn wake_all(&self) {
        let wakers = std::mem::take(&mut *self.0.lock());
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Process-unique id used to correlate log events of one stream.
pub(crate) fn next_stream_id() -> u64 {
    static NEXT_ID: AtomicU64 = AtomicU64::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}
