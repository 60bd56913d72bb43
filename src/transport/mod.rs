//! Message delivery between cluster members.
//!
//! The consensus engine only sees `Transport`: it sends a `Request` to a
//! `Member` and awaits the `Response`. Each local member registers a
//! `RequestHandler` under its uri to serve inbound requests.

pub mod grpc;
pub mod local;

use std::sync::Arc;

use crate::error::Result;
use crate::member::Member;
use crate::message::{Request, Response};

pub use grpc::GrpcTransport;
pub use local::{LocalNetwork, LocalTransport};

/// Serves requests addressed to one local uri.
#[tonic::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response>;
}

#[tonic::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `request` to `member` and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns `Unreachable` (or a gRPC error) when the member cannot be
    /// reached, and whatever the remote handler failed with otherwise.
    async fn send(&self, member: &Member, request: Request) -> Result<Response>;

    /// Start accepting requests for `uri`. Returns once the endpoint is ready.
    async fn listen(&self, uri: &str) -> Result<()>;

    /// Stop accepting requests for `uri`.
    async fn shutdown(&self, uri: &str) -> Result<()>;

    /// Route requests for `uri` to `handler`, replacing any previous one.
    fn register(&self, uri: &str, handler: Arc<dyn RequestHandler>);

    fn unregister(&self, uri: &str);
}
