//! Usage: HTTP boundary of the relay (inbound protocols, model listing, breaker admin).

mod errors;
mod handler;
mod manager;
mod routes;
mod streams;
mod util;

pub use manager::{GatewayManager, GatewayStartError};
pub use routes::build_router;

use crate::request_logs::OutcomeSender;
use crate::router::ModelRouter;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub base_url: Option<String>,
}

/// Everything a request handler needs; cloned per request.
#[derive(Clone)]
pub struct GatewayAppState {
    pub(crate) router: Arc<ModelRouter>,
    pub(crate) outcomes: OutcomeSender,
}

impl GatewayAppState {
    pub fn new(router: Arc<ModelRouter>, outcomes: OutcomeSender) -> Self {
        Self { router, outcomes }
    }
}
