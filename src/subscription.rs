//! Push-mode event delivery over WebSocket.
//!
//! The node's `starknet_subscribeEvents` method streams notification frames
//! after an initial acknowledgment. The connection task owns the socket and
//! publishes decoded frames on a channel; consumers never touch the stream
//! directly, which keeps reconnect policy in one place.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use starknet::core::types::Felt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::felt::normalize_felt;

/// Backoff between reconnect attempts after a dropped subscription.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A raw emitted event as delivered by the node, before any decoding.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub block_number: u64,
    pub from_address: Felt,
    pub transaction_hash: Felt,
    pub keys: Vec<Felt>,
    pub data: Vec<Felt>,
}

/// Request to start following a contract's events from a given block.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub address: Felt,
    pub from_block: u64,
}

#[derive(Debug, Deserialize)]
struct WsFrame {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    params: Option<WsParams>,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    result: WsEventPayload,
}

#[derive(Debug, Deserialize)]
struct WsEventPayload {
    block_number: u64,
    from_address: Felt,
    transaction_hash: Felt,
    keys: Vec<Felt>,
    data: Vec<Felt>,
}

/// An open event subscription.
pub struct EventStream {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: Option<RawEvent>,
}

/// Opens a WebSocket to the node and subscribes to events from `address`
/// starting at `from_block`. A subscription-level JSON-RPC error is fatal
/// here so the caller can fall back to polling.
pub async fn subscribe_events(
    ws_endpoint: &Url,
    from_block: u64,
    address: Felt,
    selector: Option<Felt>,
) -> Result<EventStream> {
    let (mut ws, _) = connect_async(ws_endpoint.as_str())
        .await
        .with_context(|| format!("failed to connect to {ws_endpoint}"))?;

    let mut params = json!({
        "block_id": { "block_number": from_block },
        "from_address": normalize_felt(&address),
    });
    if let Some(selector) = selector {
        params["keys"] = json!([[normalize_felt(&selector)]]);
    }
    let request = json!({
        "id": 1,
        "jsonrpc": "2.0",
        "method": "starknet_subscribeEvents",
        "params": params,
    });
    ws.send(Message::Text(request.to_string().into()))
        .await
        .context("failed to send starknet_subscribeEvents")?;

    // The first frame is the subscription acknowledgment; an error frame
    // here means the node rejected the subscription.
    let mut stream = EventStream { ws, pending: None };
    match stream.read_frame().await? {
        Frame::Ack(id) => {
            tracing::info!(
                target: "hasira::subscription",
                subscription = %id,
                address = %normalize_felt(&address),
                from_block,
                "Subscription confirmed"
            );
        }
        Frame::Event(event) => stream.pending = Some(event),
        Frame::Ignored => {}
    }
    Ok(stream)
}

enum Frame {
    Ack(String),
    Event(RawEvent),
    Ignored,
}

impl EventStream {
    /// Waits for the next event notification, skipping non-event frames.
    pub async fn next_event(&mut self) -> Result<RawEvent> {
        if let Some(event) = self.pending.take() {
            return Ok(event);
        }
        loop {
            if let Frame::Event(event) = self.read_frame().await? {
                return Ok(event);
            }
        }
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            let message = match self.ws.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(e).context("websocket read failed"),
                None => bail!("subscription stream ended"),
            };
            match message {
                Message::Text(text) => return classify_frame(text.as_str()),
                Message::Close(_) => bail!("subscription closed by node"),
                // Pings are answered by the transport; everything else is noise.
                _ => continue,
            }
        }
    }
}

fn classify_frame(text: &str) -> Result<Frame> {
    let frame: WsFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(target: "hasira::subscription", error = %e, "Unparseable frame");
            return Ok(Frame::Ignored);
        }
    };

    if let Some(error) = frame.error {
        bail!("subscription error from node: {error}");
    }

    match frame.method.as_deref() {
        Some("starknet_subscriptionEvents") => match frame.params {
            Some(params) => {
                let payload = params.result;
                Ok(Frame::Event(RawEvent {
                    block_number: payload.block_number,
                    from_address: payload.from_address,
                    transaction_hash: payload.transaction_hash,
                    keys: payload.keys,
                    data: payload.data,
                }))
            }
            None => {
                tracing::warn!(target: "hasira::subscription", "Notification without params");
                Ok(Frame::Ignored)
            }
        },
        Some(other) => {
            tracing::debug!(target: "hasira::subscription", method = other, "Ignoring frame");
            Ok(Frame::Ignored)
        }
        None => match frame.result {
            Some(result) => Ok(Frame::Ack(result.to_string())),
            None => Ok(Frame::Ignored),
        },
    }
}

/// Long-running subscription task: subscribes, forwards events to `events_tx`
/// and reconnects with a fixed backoff until shutdown. Resubscription resumes
/// from the highest block seen so far.
pub async fn run_subscription(
    ws_endpoint: Url,
    request: SubscribeRequest,
    events_tx: mpsc::UnboundedSender<RawEvent>,
    shutdown: CancellationToken,
) {
    let mut from_block = request.from_block;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let subscribed = tokio::select! {
            () = shutdown.cancelled() => return,
            result = subscribe_events(&ws_endpoint, from_block, request.address, None) => result,
        };
        let mut stream = match subscribed {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    target: "hasira::subscription",
                    address = %normalize_felt(&request.address),
                    error = %e,
                    "Subscribe failed, retrying"
                );
                tokio::select! {
                    () = shutdown.cancelled() => return,
                    () = tokio::time::sleep(RECONNECT_DELAY) => continue,
                }
            }
        };

        loop {
            let event = tokio::select! {
                () = shutdown.cancelled() => return,
                event = stream.next_event() => event,
            };
            match event {
                Ok(event) => {
                    from_block = from_block.max(event.block_number);
                    if events_tx.send(event).is_err() {
                        // Receiver dropped: the pipeline is shutting down.
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        target: "hasira::subscription",
                        address = %normalize_felt(&request.address),
                        error = %e,
                        "Subscription dropped, reconnecting"
                    );
                    break;
                }
            }
        }

        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
