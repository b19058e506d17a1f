//! Downstream WebSocket accept loop and per-connection protocol handling

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::messages::{ClientRequest, ServerMessage};
use super::registry::{ClientSender, ConnectionId, SubscriptionRegistry};
use crate::config::Config;
use crate::error::{MarketDataError, Result};

/// Shared per-connection context
#[derive(Clone)]
struct ServerContext {
    registry: Arc<SubscriptionRegistry>,
    shutdown: watch::Receiver<bool>,
}

/// Bind the fan-out WebSocket endpoint and serve until shutdown.
///
/// Binding happens before this returns, so a port conflict surfaces as a
/// startup failure rather than a background error.
pub async fn serve(
    config: &Config,
    registry: Arc<SubscriptionRegistry>,
    shutdown: watch::Receiver<bool>,
) -> Result<JoinHandle<()>> {
    let context = ServerContext {
        registry: Arc::clone(&registry),
        shutdown: shutdown.clone(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(context);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| MarketDataError::ServerError(format!("Failed to bind {addr}: {e}")))?;

    info!(addr = %addr, "Fan-out server listening");

    registry.spawn_dedup_sweeper();

    let mut signal = shutdown;
    let handle = tokio::spawn(async move {
        let serving = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = signal.changed().await;
        });

        if let Err(e) = serving.await {
            error!(error = %e, "Fan-out server error");
        }
        info!("Fan-out server stopped");
    });

    Ok(handle)
}

async fn ws_handler(ws: WebSocketUpgrade, State(context): State<ServerContext>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

/// Drive one downstream connection: welcome notice, subscription protocol,
/// and index cleanup on the way out
async fn handle_socket(socket: WebSocket, context: ServerContext) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let id = context.registry.register(tx.clone());
    debug!(connection = id, "Downstream client connected");

    send_frame(&tx, &ServerMessage::welcome());

    // Writer task: drains this connection's outbound queue into the socket.
    // Broadcasts never block on a slow socket; they fail the send and the
    // registry prunes the connection.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut shutdown = context.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_request(&text, id, &context.registry, &tx);
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = id, error = %e, "Downstream socket error");
                    break;
                }
            }
        }
    }

    context.registry.disconnect(id);
    drop(tx);
    writer.abort();

    debug!(connection = id, "Downstream client disconnected");
}

/// Apply one client frame. Malformed input yields an error frame to this
/// connection only and leaves its existing subscriptions untouched.
fn handle_request(
    text: &str,
    id: ConnectionId,
    registry: &SubscriptionRegistry,
    tx: &ClientSender,
) {
    match serde_json::from_str::<ClientRequest>(text) {
        Ok(ClientRequest::Subscribe { symbols }) => {
            let current = registry.subscribe(id, &symbols.into_vec());
            debug!(connection = id, symbols = ?current, "Client subscribed");
            send_frame(tx, &ServerMessage::subscription_ack(current));
        }
        Ok(ClientRequest::Unsubscribe { symbols }) => {
            let current = registry.unsubscribe(id, &symbols.into_vec());
            debug!(connection = id, symbols = ?current, "Client unsubscribed");
            send_frame(tx, &ServerMessage::subscription_ack(current));
        }
        Err(e) => {
            warn!(connection = id, error = %e, "Invalid subscription request");
            send_frame(tx, &ServerMessage::invalid_request());
        }
    }
}

fn send_frame(tx: &ClientSender, message: &ServerMessage) {
    match serde_json::to_string(message) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!(error = %e, "Frame serialization failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(
        registry: &SubscriptionRegistry,
    ) -> (ConnectionId, ClientSender, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.register(tx.clone());
        (id, tx, rx)
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> serde_json::Value {
        match rx.try_recv().expect("expected a frame") {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_scalar_subscribe_acks_uppercased_full_set() {
        let registry = SubscriptionRegistry::new();
        let (id, tx, mut rx) = connect(&registry);

        handle_request(r#"{"action":"subscribe","symbols":"btcusd"}"#, id, &registry, &tx);

        let ack = next_json(&mut rx);
        assert_eq!(ack["type"], "subscription");
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["symbols"], serde_json::json!(["BTCUSD"]));
    }

    #[test]
    fn test_malformed_request_gets_error_frame_and_keeps_subscriptions() {
        let registry = SubscriptionRegistry::new();
        let (id, tx, mut rx) = connect(&registry);

        registry.subscribe(id, &["BTCUSD".to_string()]);

        handle_request("not json", id, &registry, &tx);

        let error = next_json(&mut rx);
        assert_eq!(error["type"], "error");
        assert_eq!(error["message"], "Invalid subscription request");
        assert!(registry.is_subscribed(id, "BTCUSD"));
    }

    #[test]
    fn test_unsubscribe_ack_carries_remaining_set() {
        let registry = SubscriptionRegistry::new();
        let (id, tx, mut rx) = connect(&registry);

        registry.subscribe(id, &["BTCUSD".to_string(), "ETHUSD".to_string()]);

        handle_request(
            r#"{"action":"unsubscribe","symbols":["BTCUSD"]}"#,
            id,
            &registry,
            &tx,
        );

        let ack = next_json(&mut rx);
        assert_eq!(ack["symbols"], serde_json::json!(["ETHUSD"]));
    }
}
