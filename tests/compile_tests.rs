/// Compile-time checks that handle types carry the right Send/Sync bounds
/// for each feature.
///
/// Run with:
///   cargo test --features send  (default)
///   cargo test --no-default-features --features local
use streamflow::{
    IteratorSource, ReadableStream, StreamResult, WritableSink, WritableStream,
    WritableStreamDefaultController,
};

type VecStream = ReadableStream<i32, IteratorSource<std::vec::IntoIter<i32>>>;

struct DummySink;

impl WritableSink<String> for DummySink {
    async fn write(
        &mut self,
        _chunk: String,
        _controller: &mut WritableStreamDefaultController,
    ) -> StreamResult<()> {
        Ok(())
    }
}

#[cfg(feature = "send")]
#[test]
fn send_feature_handles_are_send_sync() {
    use streamflow::{TransformReadableSource, TransformWritableSink};

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    assert_send::<VecStream>();
    assert_sync::<VecStream>();
    assert_send::<WritableStream<String, DummySink>>();
    assert_sync::<WritableStream<String, DummySink>>();
    assert_send::<ReadableStream<u8, TransformReadableSource<u8>>>();
    assert_send::<WritableStream<u8, TransformWritableSink<u8>>>();
    assert_send::<streamflow::WritableStreamDefaultWriter<String, DummySink>>();
    assert_send::<streamflow::ReadableStreamDefaultReader<i32, IteratorSource<std::vec::IntoIter<i32>>>>();
}

#[cfg(feature = "local")]
#[test]
fn local_feature_accepts_non_send_chunks() {
    use std::rc::Rc;

    // Rc chunks only type-check when no Send bound is imposed.
    let _: Option<ReadableStream<Rc<i32>, IteratorSource<std::vec::IntoIter<Rc<i32>>>>> = None;
}

#[test]
fn handle_types_are_nameable() {
    let _: Option<VecStream> = None;
    let _: Option<WritableStream<String, DummySink>> = None;
}
