//! Types shared by the store, the server and the binary.

pub mod ids;
pub mod protocol;

pub use ids::{BasketKey, ItemId, KeyError, MessageId};
pub use protocol::{Envelope, Item, ItemUpdate};
