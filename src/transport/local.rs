//! In-process transport for tests and single-binary clusters.
//!
//! All members of a `LocalNetwork` share one routing table. Every request and
//! response is passed through the codec so in-process traffic exercises the
//! same encoding as the wire. Links between members can be cut and restored
//! to simulate partitions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::codec::{Codec, ProtobufCodec};
use crate::error::{BallotError, Result};
use crate::member::Member;
use crate::message::{Request, Response};
use crate::transport::{RequestHandler, Transport};

#[derive(Default)]
struct Routes {
    nodes: BTreeSet<String>,
    listening: HashSet<String>,
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    // Unordered pairs stored with the smaller uri first
    disconnected: HashSet<(String, String)>,
}

fn link(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Shared routing table of an in-process cluster.
#[derive(Clone)]
pub struct LocalNetwork {
    routes: Arc<RwLock<Routes>>,
    codec: Arc<dyn Codec>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::with_codec(Arc::new(ProtobufCodec::new()))
    }

    pub fn with_codec(codec: Arc<dyn Codec>) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Routes::default())),
            codec,
        }
    }

    /// Transport endpoint for the member at `uri`.
    pub fn transport(&self, uri: impl Into<String>) -> Arc<LocalTransport> {
        let uri = uri.into();
        self.routes.write().nodes.insert(uri.clone());
        Arc::new(LocalTransport {
            uri,
            network: self.clone(),
        })
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn disconnect(&self, a: &str, b: &str) {
        if a != b {
            self.routes.write().disconnected.insert(link(a, b));
            tracing::debug!(a, b, "Link cut");
        }
    }

    pub fn reconnect(&self, a: &str, b: &str) {
        self.routes.write().disconnected.remove(&link(a, b));
        tracing::debug!(a, b, "Link restored");
    }

    /// Cut every link between members of different groups.
    pub fn partition(&self, group_a: &[&str], group_b: &[&str]) {
        for a in group_a {
            for b in group_b {
                self.disconnect(a, b);
            }
        }
    }

    pub fn heal(&self, group_a: &[&str], group_b: &[&str]) {
        for a in group_a {
            for b in group_b {
                self.reconnect(a, b);
            }
        }
    }

    /// Cut `uri` off from every other member of the network.
    pub fn isolate(&self, uri: &str) {
        let others: Vec<String> = self
            .routes
            .read()
            .nodes
            .iter()
            .filter(|n| n.as_str() != uri)
            .cloned()
            .collect();
        for other in others {
            self.disconnect(uri, &other);
        }
    }

    /// Reconnect `uri` to every other member of the network.
    pub fn rejoin(&self, uri: &str) {
        self.routes
            .write()
            .disconnected
            .retain(|(a, b)| a != uri && b != uri);
    }

    pub fn heal_all(&self) {
        self.routes.write().disconnected.clear();
    }

    pub fn is_connected(&self, a: &str, b: &str) -> bool {
        !self.routes.read().disconnected.contains(&link(a, b))
    }

    fn handler_for(&self, from: &str, to: &str) -> Result<Arc<dyn RequestHandler>> {
        let routes = self.routes.read();
        if routes.disconnected.contains(&link(from, to)) || !routes.listening.contains(to) {
            return Err(BallotError::Unreachable(to.to_string()));
        }
        routes
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| BallotError::Unreachable(to.to_string()))
    }

    async fn deliver(&self, from: &str, to: &str, request: Request) -> Result<Response> {
        let handler = self.handler_for(from, to)?;

        let envelope = self.codec.encode_request(request)?;
        let request = self.codec.decode_request(&envelope)?;
        let response = handler.handle(request).await?;

        // A link cut while the request was in flight loses the response
        if !self.is_connected(from, to) {
            return Err(BallotError::Unreachable(to.to_string()));
        }
        let envelope = self.codec.encode_response(response)?;
        self.codec.decode_response(&envelope)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One member's view of a `LocalNetwork`.
pub struct LocalTransport {
    uri: String,
    network: LocalNetwork,
}

impl LocalTransport {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }
}

#[tonic::async_trait]
impl Transport for LocalTransport {
    async fn send(&self, member: &Member, request: Request) -> Result<Response> {
        tracing::trace!(from = %self.uri, to = %member, message = %request.message_type(), "Local send");
        self.network.deliver(&self.uri, member.uri(), request).await
    }

    async fn listen(&self, uri: &str) -> Result<()> {
        let mut routes = self.network.routes.write();
        routes.nodes.insert(uri.to_string());
        if !routes.listening.insert(uri.to_string()) {
            return Err(BallotError::AlreadyOpen("endpoint"));
        }
        Ok(())
    }

    async fn shutdown(&self, uri: &str) -> Result<()> {
        if !self.network.routes.write().listening.remove(uri) {
            return Err(BallotError::NotOpen("endpoint"));
        }
        Ok(())
    }

    fn register(&self, uri: &str, handler: Arc<dyn RequestHandler>) {
        self.network
            .routes
            .write()
            .handlers
            .insert(uri.to_string(), handler);
    }

    fn unregister(&self, uri: &str) {
        self.network.routes.write().handlers.remove(uri);
    }
}
