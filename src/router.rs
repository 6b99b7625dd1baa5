//! Request routing: sticky index when the allocator yields a token, round
//! robin otherwise

use std::future::Future;
use std::sync::Arc;

use crate::core::{WorkerHandle, WorkerPool};
use crate::policies::{Allocator, RequestView, StickyToken};
use crate::supervisor::{SupervisorError, SupervisorHandle};

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}

/// Where a request goes, plus anything the response must carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub port: u16,
    pub set_cookie: Option<String>,
}

/// Pick the port for a request, `None` when no worker is active
///
/// A token maps to `active[token mod |active|]`, so it stays on the same
/// worker for as long as the active set does not change size.
pub fn select_target(pool: &mut WorkerPool, token: Option<&StickyToken>) -> Option<u16> {
    let active = pool.active_len();
    if active == 0 {
        return None;
    }
    match token {
        Some(token) => {
            let index = (token.value() % active as u64) as usize;
            pool.active_at(index).and_then(WorkerHandle::port)
        }
        None => pool.next_by_round_robin().and_then(WorkerHandle::port),
    }
}

/// Target provider consumed by distributors
#[derive(Clone)]
pub struct Router {
    allocator: Arc<dyn Allocator>,
    supervisor: SupervisorHandle,
}

impl Router {
    pub fn new(allocator: Arc<dyn Allocator>, supervisor: SupervisorHandle) -> Self {
        Self {
            allocator,
            supervisor,
        }
    }

    pub fn allocator_name(&self) -> &'static str {
        self.allocator.name()
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    /// Route a plain HTTP request
    ///
    /// The allocator runs immediately; the returned future resolves once a
    /// worker is available.
    pub fn route_http(
        &self,
        request: &dyn RequestView,
    ) -> impl Future<Output = Result<Route, RouteError>> + Send + use<> {
        self.route(request)
    }

    /// Route a WebSocket upgrade
    pub fn route_ws(
        &self,
        request: &dyn RequestView,
    ) -> impl Future<Output = Result<Route, RouteError>> + Send + use<> {
        self.route(request)
    }

    fn route(
        &self,
        request: &dyn RequestView,
    ) -> impl Future<Output = Result<Route, RouteError>> + Send + use<> {
        let allocation = self.allocator.allocate(request);
        let supervisor = self.supervisor.clone();
        async move {
            let port = supervisor.route(allocation.token).await?;
            Ok(Route {
                port,
                set_cookie: allocation.set_cookie,
            })
        }
    }
}
