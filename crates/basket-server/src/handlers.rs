//! Basket protocol methods.

use std::sync::Arc;

use async_trait::async_trait;
use basket_core::protocol::{
    parse_item_updates, Envelope, ItemUpdate, METHOD_ITEM_UPDATE, METHOD_UNACKED_MESSAGES,
};
use basket_store::{ItemChange, Store};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::dispatch::{DispatchContext, Dispatcher, MethodHandler};
use crate::errors::HandlerError;
use crate::hub::{ClientHandle, Frame};

/// Register every basket method on the dispatcher.
pub fn register_all(dispatcher: &mut Dispatcher) {
    dispatcher.register(METHOD_ITEM_UPDATE, ItemUpdateHandler);
    dispatcher.register(METHOD_UNACKED_MESSAGES, UnackedMessagesHandler);
}

/// Send the client the current state of its basket.
pub fn send_snapshot(store: &Store, client: &ClientHandle) -> Result<(), HandlerError> {
    let items = store.items_for_basket(client.basket.as_str())?;
    let count = items.len();
    let frame: Frame = Arc::from(Envelope::snapshot(&items)?.to_json()?);
    if client.send(frame) {
        debug!(client_id = %client.id, items = count, "snapshot sent");
    } else {
        debug!(client_id = %client.id, "snapshot not queued");
    }
    Ok(())
}

/// `itemUpdate`: upsert titles and set completion flags.
pub struct ItemUpdateHandler;

impl ItemUpdateHandler {
    /// Apply every update of the payload as one batch. Nothing is written
    /// unless all of them succeed.
    #[instrument(skip(store, payload))]
    pub fn apply(store: &Store, basket_key: &str, payload: Value) -> Result<usize, HandlerError> {
        let changes = item_changes(payload)?;
        let _ = store.apply_changes(basket_key, &changes)?;
        Ok(changes.len())
    }
}

/// Decode an `itemUpdate` payload into store changes, rejecting entries that
/// name no item.
pub fn item_changes(payload: Value) -> Result<Vec<ItemChange>, HandlerError> {
    let updates =
        parse_item_updates(payload).map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
    updates.into_iter().map(to_change).collect()
}

fn to_change(update: ItemUpdate) -> Result<ItemChange, HandlerError> {
    match (update.title, update.id, update.completed) {
        (Some(title), _, completed) => Ok(ItemChange::Upsert { title, completed }),
        (None, Some(id), Some(completed)) => Ok(ItemChange::Complete { id, completed }),
        (None, Some(id), None) => Err(HandlerError::InvalidPayload(format!(
            "item {id}: update carries neither title nor completed"
        ))),
        (None, None, _) => Err(HandlerError::InvalidPayload(
            "update carries neither title nor id".into(),
        )),
    }
}

#[async_trait]
impl MethodHandler for ItemUpdateHandler {
    async fn handle(&self, payload: Value, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let applied = Self::apply(&ctx.store, ctx.basket_key(), payload)?;
        debug!(client_id = %ctx.client.id, applied, "item updates applied");
        Ok(())
    }
}

/// `unackedMessages`: replay item updates a client sent while disconnected,
/// then send it a fresh snapshot. All replayed updates commit together.
pub struct UnackedMessagesHandler;

#[async_trait]
impl MethodHandler for UnackedMessagesHandler {
    async fn handle(&self, payload: Value, ctx: &DispatchContext) -> Result<(), HandlerError> {
        let envelopes: Vec<Envelope> = serde_json::from_value(payload)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        let mut changes = Vec::new();
        let mut replayed = 0usize;
        for envelope in envelopes {
            if envelope.method != METHOD_ITEM_UPDATE {
                debug!(
                    message_id = %envelope.message_id,
                    method = %envelope.method,
                    "skipping replay of non-item method"
                );
                continue;
            }
            changes.extend(item_changes(envelope.payload)?);
            replayed += 1;
        }
        let _ = ctx.store.apply_changes(ctx.basket_key(), &changes)?;
        debug!(
            client_id = %ctx.client.id,
            replayed,
            changes = changes.len(),
            "unacked messages replayed"
        );

        send_snapshot(&ctx.store, &ctx.client)
    }
}
