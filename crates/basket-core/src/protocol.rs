//! Wire shapes exchanged over the WebSocket.
//!
//! Every frame is an [`Envelope`]. Field names are camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ItemId, MessageId};

pub const METHOD_ACK: &str = "ack";
pub const METHOD_ITEM_UPDATE: &str = "itemUpdate";
pub const METHOD_UNACKED_MESSAGES: &str = "unackedMessages";

/// `{ "messageId", "method", "payload"? }`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: MessageId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Envelope {
    /// Acknowledgement echoing the id of the handled message.
    pub fn ack(message_id: MessageId) -> Self {
        Self {
            message_id,
            method: METHOD_ACK.to_owned(),
            payload: Value::Null,
        }
    }

    /// Full basket state, sent under a fresh message id.
    pub fn snapshot(items: &[Item]) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message_id: MessageId::new(),
            method: METHOD_ITEM_UPDATE.to_owned(),
            payload: serde_json::to_value(items)?,
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// An item as clients see it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub completed: bool,
}

/// One client-side change. A title upserts; `completed` then applies to the
/// upserted item, or to `id` when no title is given.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ItemId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<bool>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    Many(Vec<ItemUpdate>),
    One(ItemUpdate),
}

/// Decode an `itemUpdate` payload, which may be a single object or an array.
pub fn parse_item_updates(payload: Value) -> Result<Vec<ItemUpdate>, serde_json::Error> {
    Ok(match serde_json::from_value(payload)? {
        OneOrMany::Many(updates) => updates,
        OneOrMany::One(update) => vec![update],
    })
}
