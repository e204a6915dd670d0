//! Supabase Realtime (Phoenix-protocol) websocket client.
//!
//! One socket per domain, joined to its `realtime:public:<table>` topic.
//! The socket reconnects internally with exponential backoff; when the
//! backoff gives up the event channel closes, and the engine's listener
//! parks the domain in its error state with polling as the backstop.

use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, trace, warn};

use tidepool::{ChangeEvent, ChangeKind, ChannelFactory, Domain, SourceError};

use crate::SupabaseError;
use crate::client::table_for;

/// Phoenix heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Buffered events per domain channel. The transport drops events under
/// backpressure; a dropped event only delays a refresh until the poll.
const EVENT_CHANNEL_CAPACITY: usize = 256;

fn reconnect_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(60),
        max_elapsed_time: Some(Duration::from_secs(10 * 60)),
        ..ExponentialBackoff::default()
    }
}

/// One Phoenix frame, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    payload: Value,
    #[serde(rename = "ref")]
    reference: Option<String>,
}

impl Frame {
    fn join(topic: &str, table: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "postgres_changes": [
                        { "event": "*", "schema": "public", "table": table }
                    ]
                }
            }),
            reference: Some("1".to_string()),
        }
    }

    fn heartbeat(reference: u64) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            reference: Some(reference.to_string()),
        }
    }
}

/// Decode a `postgres_changes` frame into a change event, if it is one.
fn decode_change(frame: &Frame, domain: &Domain) -> Option<ChangeEvent> {
    if frame.event != "postgres_changes" {
        return None;
    }
    let data = frame.payload.get("data")?;
    let kind: ChangeKind = serde_json::from_value(data.get("type")?.clone()).ok()?;
    // Deletes only carry the old row.
    let row = match kind {
        ChangeKind::Delete => data.get("old_record"),
        _ => data.get("record"),
    };
    let row_id = row
        .and_then(|r| r.get("id"))
        .and_then(|id| id.as_str())
        .map(str::to_string);
    Some(ChangeEvent {
        domain: domain.clone(),
        kind,
        row_id,
    })
}

/// Factory for per-domain realtime channels.
pub struct RealtimeSocket {
    url: String,
    api_key: String,
}

impl RealtimeSocket {
    /// Create a factory for the given realtime endpoint
    /// (`wss://<project>.supabase.co/realtime/v1/websocket`) and anon key.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
        }
    }

    fn socket_url(&self) -> String {
        format!("{}?apikey={}&vsn=1.0.0", self.url, self.api_key)
    }
}

#[async_trait]
impl ChannelFactory for RealtimeSocket {
    async fn open(&self, domain: &Domain) -> Result<mpsc::Receiver<ChangeEvent>, SourceError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connection = Connection {
            url: self.socket_url(),
            domain: domain.clone(),
            topic: format!("realtime:public:{}", table_for(domain)),
            table: table_for(domain),
        };
        tokio::spawn(connection.run(events_tx));
        Ok(events_rx)
    }
}

/// One domain's socket, living as long as its event receiver.
struct Connection {
    url: String,
    domain: Domain,
    topic: String,
    table: String,
}

impl Connection {
    /// Connect and pump events, reconnecting with backoff.
    ///
    /// Returns when the receiver is dropped (unsubscribe) or the backoff
    /// gives up; dropping the sender is what closes the channel.
    #[tracing::instrument(skip(self, events), fields(domain = %self.domain))]
    async fn run(self, events: mpsc::Sender<ChangeEvent>) {
        let mut policy = reconnect_policy();
        loop {
            match self.connect_and_pump(&events, &mut policy).await {
                Ok(()) => {
                    debug!(domain = %self.domain, "realtime channel closed cleanly");
                    return;
                }
                Err(e) => {
                    warn!(domain = %self.domain, error = %e, "realtime connection error");
                    match policy.next_backoff() {
                        Some(wait) => {
                            debug!(wait_ms = wait.as_millis() as u64, "reconnecting after backoff");
                            tokio::time::sleep(wait).await;
                        }
                        None => {
                            error!(domain = %self.domain, "realtime channel giving up");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Connect, join the topic, and pump messages until error or
    /// unsubscribe.
    async fn connect_and_pump(
        &self,
        events: &mpsc::Sender<ChangeEvent>,
        policy: &mut ExponentialBackoff,
    ) -> Result<(), SupabaseError> {
        let (ws_stream, _) = connect_async(&self.url)
            .await
            .map_err(|e| SupabaseError::WebSocket(format!("connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&Frame::join(&self.topic, &self.table))?;
        write
            .send(Message::Text(join))
            .await
            .map_err(|e| SupabaseError::WebSocket(format!("join failed: {}", e)))?;
        info!(topic = %self.topic, "joining realtime topic");

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await; // first tick is immediate
        let mut heartbeat_ref = 1u64;

        loop {
            tokio::select! {
                biased;

                _ = events.closed() => {
                    debug!(topic = %self.topic, "receiver dropped, closing socket");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                _ = heartbeat.tick() => {
                    heartbeat_ref += 1;
                    let frame = serde_json::to_string(&Frame::heartbeat(heartbeat_ref))?;
                    write
                        .send(Message::Text(frame))
                        .await
                        .map_err(|e| SupabaseError::WebSocket(format!("heartbeat failed: {}", e)))?;
                }

                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text, events, policy),
                    Some(Ok(Message::Ping(_))) => {
                        // tungstenite auto-responds to pings
                        trace!("received ping");
                    }
                    Some(Ok(Message::Close(_))) => {
                        return Err(SupabaseError::WebSocket("connection closed".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(SupabaseError::WebSocket(format!("read error: {}", e)));
                    }
                    None => {
                        return Err(SupabaseError::WebSocket("stream ended".to_string()));
                    }
                }
            }
        }
    }

    fn handle_frame(
        &self,
        text: &str,
        events: &mpsc::Sender<ChangeEvent>,
        policy: &mut ExponentialBackoff,
    ) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed realtime frame");
                return;
            }
        };

        match frame.event.as_str() {
            "phx_reply" => {
                let status = frame.payload.get("status").and_then(|s| s.as_str());
                if status == Some("ok") {
                    trace!(topic = %frame.topic, "join/heartbeat acknowledged");
                    policy.reset();
                } else {
                    warn!(topic = %frame.topic, payload = %frame.payload, "phoenix reply error");
                }
            }
            "postgres_changes" => {
                if let Some(event) = decode_change(&frame, &self.domain) {
                    trace!(kind = %event.kind, "realtime change event");
                    if events.try_send(event).is_err() {
                        // Full buffer or dropped receiver; the poll bounds
                        // staleness either way.
                        warn!(domain = %self.domain, "realtime event dropped");
                    }
                }
            }
            "phx_error" => {
                warn!(topic = %frame.topic, "phoenix channel error frame");
            }
            other => {
                trace!(event = %other, "ignoring realtime frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change_frame(kind: &str, data_extra: Value) -> String {
        let mut data = json!({ "type": kind });
        if let (Value::Object(map), Value::Object(extra)) = (&mut data, data_extra) {
            map.extend(extra);
        }
        json!({
            "topic": "realtime:public:contacts",
            "event": "postgres_changes",
            "payload": { "data": data },
            "ref": null
        })
        .to_string()
    }

    #[test]
    fn test_join_frame_shape() {
        let frame = Frame::join("realtime:public:contacts", "contacts");
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["event"], "phx_join");
        assert_eq!(value["topic"], "realtime:public:contacts");
        assert_eq!(
            value["payload"]["config"]["postgres_changes"][0]["table"],
            "contacts"
        );
        assert_eq!(value["ref"], "1");
    }

    #[test]
    fn test_heartbeat_frame_shape() {
        let frame = Frame::heartbeat(7);
        let value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value["topic"], "phoenix");
        assert_eq!(value["event"], "heartbeat");
        assert_eq!(value["ref"], "7");
    }

    #[test]
    fn test_insert_frame_decodes_with_row_id() {
        let text = change_frame("INSERT", json!({ "record": { "id": "c42" } }));
        let frame: Frame = serde_json::from_str(&text).unwrap();

        let event = decode_change(&frame, &Domain::from("contacts")).unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.row_id.as_deref(), Some("c42"));
        assert_eq!(event.domain, Domain::from("contacts"));
    }

    #[test]
    fn test_delete_frame_uses_old_record() {
        let text = change_frame("DELETE", json!({ "old_record": { "id": "c9" } }));
        let frame: Frame = serde_json::from_str(&text).unwrap();

        let event = decode_change(&frame, &Domain::from("contacts")).unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.row_id.as_deref(), Some("c9"));
    }

    #[test]
    fn test_update_without_row_id_still_decodes() {
        let text = change_frame("UPDATE", json!({ "record": {} }));
        let frame: Frame = serde_json::from_str(&text).unwrap();

        let event = decode_change(&frame, &Domain::from("contacts")).unwrap();
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.row_id, None);
    }

    #[test]
    fn test_reply_frames_are_not_change_events() {
        let text = json!({
            "topic": "realtime:public:contacts",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": "1"
        })
        .to_string();
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert!(decode_change(&frame, &Domain::from("contacts")).is_none());
    }

    #[test]
    fn test_unknown_change_type_is_skipped() {
        let text = change_frame("TRUNCATE", json!({ "record": { "id": "x" } }));
        let frame: Frame = serde_json::from_str(&text).unwrap();
        assert!(decode_change(&frame, &Domain::from("contacts")).is_none());
    }

    #[test]
    fn test_topic_uses_underscored_table() {
        let socket = RealtimeSocket::new("wss://example.supabase.co/realtime/v1/websocket", "key");
        assert!(socket.socket_url().contains("apikey=key"));
        assert_eq!(table_for(&Domain::from("client-stats")), "client_stats");
    }
}
