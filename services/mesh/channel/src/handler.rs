//! Registry of request handlers for locally destined requests.

use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::{NetworkRequest, NetworkResponse, NodeId};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handles requests of one message type that arrived at their destination
#[async_trait]
pub trait NetworkRequestHandler: Send + Sync {
    /// Produce the response; an error becomes an "exception at destination" response
    async fn handle_request(
        &self,
        request: &NetworkRequest,
        last_hop: &NodeId,
    ) -> anyhow::Result<NetworkResponse>;
}

/// Maps message types to handlers
#[derive(Default)]
pub struct RequestHandlerRegistry {
    handlers: DashMap<String, Arc<dyn NetworkRequestHandler>>,
}

impl RequestHandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same type
    pub fn register(
        &self,
        message_type: impl Into<String>,
        handler: Arc<dyn NetworkRequestHandler>,
    ) {
        let message_type = message_type.into();
        if self.handlers.insert(message_type.clone(), handler).is_some() {
            warn!("Replaced request handler for message type '{}'", message_type);
        }
    }

    /// Remove the handler for a message type
    pub fn unregister(&self, message_type: &str) -> bool {
        self.handlers.remove(message_type).is_some()
    }

    /// Whether a handler exists for the message type
    pub fn has_handler(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Dispatch a request to its handler; never fails
    pub async fn dispatch(&self, request: &NetworkRequest, last_hop: &NodeId) -> NetworkResponse {
        // clone out of the map so no shard lock is held across the await
        let handler = self
            .handlers
            .get(&request.message_type)
            .map(|h| h.value().clone());

        let Some(handler) = handler else {
            debug!(
                "No handler for message type '{}' (request {})",
                request.message_type, request.request_id
            );
            return NetworkResponse::no_matching_handler(request);
        };

        match handler.handle_request(request, last_hop).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Handler for '{}' failed on request {}: {:#}",
                    request.message_type, request.request_id, e
                );
                NetworkResponse::exception_at_destination(request, format_args!("{e:#}"))
            }
        }
    }
}
