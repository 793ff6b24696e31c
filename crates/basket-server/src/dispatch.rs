//! Method table and the ack-then-broadcast contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use basket_core::Envelope;
use basket_store::Store;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::errors::{DispatchError, HandlerError};
use crate::hub::{ClientHandle, Frame, HubHandle};

/// Trait implemented by every protocol method.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    async fn handle(&self, payload: Value, ctx: &DispatchContext) -> Result<(), HandlerError>;
}

/// Per-connection state handed to handlers.
#[derive(Clone)]
pub struct DispatchContext {
    pub client: ClientHandle,
    pub store: Store,
}

impl DispatchContext {
    pub fn basket_key(&self) -> &str {
        self.client.basket.as_str()
    }
}

/// Routes inbound frames to handlers by method name.
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MethodHandler>>,
    hub: HubHandle,
}

impl Dispatcher {
    pub fn new(hub: HubHandle) -> Self {
        Self {
            handlers: HashMap::new(),
            hub,
        }
    }

    /// Register a handler for a method name. A later registration replaces an
    /// earlier one.
    pub fn register(&mut self, method: &str, handler: impl MethodHandler + 'static) {
        let _ = self.handlers.insert(method.to_owned(), Arc::new(handler));
    }

    /// Handle one raw frame from `ctx.client`.
    ///
    /// On success the client gets an ack and every other client of the basket
    /// gets `raw` unchanged, in that order. Any error means neither happens.
    #[instrument(skip_all, fields(client_id = %ctx.client.id, method = tracing::field::Empty))]
    pub async fn dispatch(&self, ctx: &DispatchContext, raw: &str) -> Result<(), DispatchError> {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return Err(DispatchError::Malformed(e.to_string()));
            }
        };
        let _ = tracing::Span::current().record("method", envelope.method.as_str());

        let Some(handler) = self.handlers.get(&envelope.method) else {
            warn!(message_id = %envelope.message_id, "no handler for method");
            return Err(DispatchError::UnknownMethod(envelope.method));
        };

        if let Err(e) = handler.handle(envelope.payload, ctx).await {
            warn!(
                message_id = %envelope.message_id,
                error = %e,
                code = e.code(),
                "handler failed"
            );
            return Err(e.into());
        }

        let ack = Envelope::ack(envelope.message_id.clone())
            .to_json()
            .map_err(HandlerError::from)?;
        let ack: Frame = Arc::from(ack);
        if !ctx.client.send(ack) {
            debug!(message_id = %envelope.message_id, "ack not queued");
        }
        self.hub
            .broadcast(ctx.client.id.clone(), ctx.client.basket.clone(), Arc::from(raw))
            .await;
        Ok(())
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }
}
