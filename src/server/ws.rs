use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use warp::ws::{Message, WebSocket};

use crate::hub::SubscriberHub;

/// Pump hub messages into one socket until either side goes away.
/// Anything the client sends is read and discarded.
pub(crate) async fn session(socket: WebSocket, hub: Arc<SubscriberHub>) {
    let (id, mut updates) = hub.subscribe().await;
    let (mut sink, mut incoming) = socket.split();

    let forward = async {
        while let Some(text) = updates.recv().await {
            if let Err(e) = sink.send(Message::text(text)).await {
                log::debug!("Subscriber {} send failed: {}", id, e);
                break;
            }
        }
        let _ = sink.close().await;
    };

    let drain = async {
        while let Some(frame) = incoming.next().await {
            match frame {
                Ok(msg) if msg.is_close() => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("Subscriber {} receive failed: {}", id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = forward => {}
        _ = drain => {}
    }
    hub.unsubscribe(id).await;
}
