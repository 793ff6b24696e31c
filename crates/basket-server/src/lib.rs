pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod handlers;
pub mod hub;
pub mod server;

pub use config::ServerConfig;
pub use dispatch::{DispatchContext, Dispatcher, MethodHandler};
pub use errors::{DispatchError, HandlerError};
pub use hub::{mailbox, ClientHandle, ClientId, Frame, HubHandle, Mailbox, Outbound};
pub use server::{build_router, start, AppState, ServerHandle};
