pub mod openai;
pub mod stub;

use crate::engine::error::EngineError;
use crate::engine::request::Request;
use crate::engine::result::{Delta, TurnResult};
use futures_core::stream::BoxStream;

pub type TransportFuture<T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, EngineError>> + Send>>;

pub type DeltaStream = BoxStream<'static, Result<Delta, EngineError>>;

/// Transport capability: the one network-facing seam the engine consumes.
///
/// `send` yields a single canonical result; `send_stream` yields deltas in
/// provider order, with end-of-stream signaled by stream termination,
/// distinct from per-delta errors.
pub trait Transport {
    fn name(&self) -> &'static str;

    fn send(&self, req: Request) -> TransportFuture<TurnResult>;

    fn send_stream(&self, req: Request) -> TransportFuture<DeltaStream>;
}
