//! gRPC transport.
//!
//! Every consensus message travels through the single unary `Call` method as
//! a codec `Envelope`. Each listening uri runs its own tonic server on a
//! pre-bound listener; outbound clients are cached per remote uri.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::Status;

use crate::codec::{Codec, Envelope, ProtobufCodec};
use crate::error::{BallotError, Result};
use crate::member::Member;
use crate::message::{Request, Response};
use crate::proto::raft_transport_client::RaftTransportClient;
use crate::proto::raft_transport_server::{RaftTransport, RaftTransportServer};
use crate::transport::{RequestHandler, Transport};

type Handlers = Arc<RwLock<HashMap<String, Arc<dyn RequestHandler>>>>;

struct ServerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// gRPC service bound to one local uri.
struct RaftTransportService {
    uri: String,
    codec: Arc<dyn Codec>,
    handlers: Handlers,
}

#[tonic::async_trait]
impl RaftTransport for RaftTransportService {
    async fn call(
        &self,
        request: tonic::Request<Envelope>,
    ) -> std::result::Result<tonic::Response<Envelope>, Status> {
        let envelope = request.into_inner();
        let request = self.codec.decode_request(&envelope)?;
        tracing::trace!(
            uri = %self.uri,
            message = %request.message_type(),
            term = request.term(),
            "Received request"
        );

        let handler = self
            .handlers
            .read()
            .get(&self.uri)
            .cloned()
            .ok_or_else(|| Status::unavailable(format!("no handler registered for {}", self.uri)))?;

        let response = handler.handle(request).await?;
        Ok(tonic::Response::new(self.codec.encode_response(response)?))
    }
}

pub struct GrpcTransport {
    codec: Arc<dyn Codec>,
    handlers: Handlers,
    servers: RwLock<HashMap<String, ServerHandle>>,
    clients: RwLock<HashMap<String, RaftTransportClient<Channel>>>,
    connect_timeout: Duration,
}

impl GrpcTransport {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(ProtobufCodec::new()))
    }

    pub fn with_codec(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            servers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            connect_timeout: Duration::from_secs(1),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get or create a cached client for a remote uri. Channels connect
    /// lazily, so an unreachable member only fails the first request.
    fn client(&self, uri: &str) -> Result<RaftTransportClient<Channel>> {
        if let Some(client) = self.clients.read().get(uri) {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", uri))
            .map_err(|e| BallotError::InvalidConfig(format!("invalid uri {}: {}", uri, e)))?
            .connect_timeout(self.connect_timeout);
        let client = RaftTransportClient::new(endpoint.connect_lazy());

        self.clients
            .write()
            .entry(uri.to_string())
            .or_insert(client.clone());
        Ok(client)
    }
}

impl Default for GrpcTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, member: &Member, request: Request) -> Result<Response> {
        let mut client = self.client(member.uri())?;
        let envelope = self.codec.encode_request(request)?;

        let reply = client.call(envelope).await.map_err(|status| {
            if status.code() == tonic::Code::Unavailable {
                BallotError::Unreachable(member.uri().to_string())
            } else {
                BallotError::GrpcError(status)
            }
        })?;
        self.codec.decode_response(&reply.into_inner())
    }

    async fn listen(&self, uri: &str) -> Result<()> {
        if self.servers.read().contains_key(uri) {
            return Err(BallotError::AlreadyOpen("endpoint"));
        }

        // Bind before spawning so the endpoint is ready when this returns
        let listener = TcpListener::bind(uri).await?;
        let service = RaftTransportService {
            uri: uri.to_string(),
            codec: self.codec.clone(),
            handlers: self.handlers.clone(),
        };

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let addr = uri.to_string();
        let task = tokio::spawn(async move {
            let result = Server::builder()
                .add_service(RaftTransportServer::new(service))
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
                .await;
            if let Err(e) = result {
                tracing::error!(uri = %addr, error = %e, "gRPC server failed");
            }
        });

        tracing::info!(uri, "gRPC endpoint listening");
        self.servers
            .write()
            .insert(uri.to_string(), ServerHandle { token, task });
        Ok(())
    }

    async fn shutdown(&self, uri: &str) -> Result<()> {
        let handle = self
            .servers
            .write()
            .remove(uri)
            .ok_or(BallotError::NotOpen("endpoint"))?;
        handle.token.cancel();
        if let Err(e) = handle.task.await {
            tracing::warn!(uri, error = %e, "gRPC server task ended abnormally");
        }
        tracing::info!(uri, "gRPC endpoint stopped");
        Ok(())
    }

    fn register(&self, uri: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().insert(uri.to_string(), handler);
    }

    fn unregister(&self, uri: &str) {
        self.handlers.write().remove(uri);
    }
}
