//! Binds inbound RPCs for the local uri to the consensus engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{BallotError, Result};
use crate::message::{Request, Response};
use crate::raft::ConsensusHandle;
use crate::transport::{RequestHandler, Transport};

enum Routes {
    Created,
    Open { uri: String, closed: Arc<AtomicBool> },
    Closed,
}

/// Dispatches requests to the engine until the routes are destroyed.
struct RouteHandler {
    consensus: ConsensusHandle,
    closed: Arc<AtomicBool>,
}

#[tonic::async_trait]
impl RequestHandler for RouteHandler {
    async fn handle(&self, request: Request) -> Result<Response> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BallotError::RoutesClosed);
        }
        self.consensus.handle(request).await
    }
}

pub struct Router {
    transport: Arc<dyn Transport>,
    routes: Mutex<Routes>,
}

impl Router {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            routes: Mutex::new(Routes::Created),
        }
    }

    /// Register the engine as the handler for requests addressed to `uri`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyOpen` on a second call and `Closed` after
    /// `destroy_routes`.
    pub fn create_routes(&self, uri: &str, consensus: ConsensusHandle) -> Result<()> {
        let mut routes = self.routes.lock();
        match *routes {
            Routes::Open { .. } => return Err(BallotError::AlreadyOpen("routes")),
            Routes::Closed => return Err(BallotError::Closed("routes")),
            Routes::Created => {}
        }

        let closed = Arc::new(AtomicBool::new(false));
        let handler = RouteHandler {
            consensus,
            closed: closed.clone(),
        };
        self.transport.register(uri, Arc::new(handler));
        tracing::debug!(uri, "Routes created");

        *routes = Routes::Open {
            uri: uri.to_string(),
            closed,
        };
        Ok(())
    }

    /// Stop dispatching and unregister from the transport.
    ///
    /// Requests that reach the handler afterwards fail with `RoutesClosed`.
    pub fn destroy_routes(&self) -> Result<()> {
        let mut routes = self.routes.lock();
        match std::mem::replace(&mut *routes, Routes::Closed) {
            Routes::Created => {
                *routes = Routes::Created;
                Err(BallotError::NotOpen("routes"))
            }
            Routes::Closed => Err(BallotError::Closed("routes")),
            Routes::Open { uri, closed } => {
                closed.store(true, Ordering::Release);
                self.transport.unregister(&uri);
                tracing::debug!(uri = %uri, "Routes destroyed");
                Ok(())
            }
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(*self.routes.lock(), Routes::Open { .. })
    }
}
