use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use basket_core::BasketKey;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::dispatch::DispatchContext;
use crate::handlers;
use crate::hub::{self, ClientHandle, ClientId, Mailbox};
use crate::server::AppState;

/// How long the writer waits for a Close frame to go out once detached.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Drive one WebSocket from registration to unregistration.
///
/// The hub holds the strong end of the outbound queue; this side keeps a
/// weak sender for acks and snapshots. Once the hub drops the client
/// (unregister or eviction) the writer stops, even mid-write to a stalled
/// peer, and sends Close. Inbound frames are dispatched on this task, so a
/// dispatch that has started always runs to completion, broadcast included.
pub async fn handle_ws_connection(socket: WebSocket, basket: BasketKey, state: AppState) {
    let client_id = ClientId::new();
    let (outbound, mailbox) = hub::mailbox(state.max_send_queue);
    let client = ClientHandle::new(client_id.clone(), basket.clone(), &outbound);

    state.hub.register(client_id.clone(), basket.clone(), outbound).await;
    info!(client_id = %client_id, basket = %basket, "WebSocket client connected");

    if let Err(e) = handlers::send_snapshot(&state.store, &client) {
        warn!(client_id = %client_id, error = %e, "initial snapshot failed");
    }

    let (ws_tx, mut ws_rx) = socket.split();
    let mut writer = tokio::spawn(write_frames(ws_tx, mailbox, client_id.clone()));

    let ctx = DispatchContext {
        client,
        store: state.store.clone(),
    };
    loop {
        let msg = tokio::select! {
            _ = &mut writer => break,
            msg = ws_rx.next() => msg,
        };
        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                // Errors are logged by the dispatcher; the connection stays open.
                let _ = state.dispatcher.dispatch(&ctx, text.as_str()).await;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(client_id = %client_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    writer.abort();
    state.hub.unregister(client_id.clone()).await;
    info!(client_id = %client_id, "WebSocket client disconnected");
}

async fn write_frames(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mailbox: Mailbox,
    client_id: ClientId,
) {
    let Mailbox {
        frames: mut rx,
        mut detached,
    } = mailbox;

    loop {
        let frame = tokio::select! {
            biased;
            _ = &mut detached => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        tokio::select! {
            biased;
            _ = &mut detached => break,
            sent = ws_tx.send(WsMessage::Text(frame.to_string().into())) => {
                if sent.is_err() {
                    debug!(client_id = %client_id, "socket write failed");
                    return;
                }
            }
        }
    }

    debug!(client_id = %client_id, "detached from hub, closing socket");
    if tokio::time::timeout(CLOSE_GRACE, ws_tx.send(WsMessage::Close(None)))
        .await
        .is_err()
    {
        debug!(client_id = %client_id, "close frame not sent in time");
    }
}
