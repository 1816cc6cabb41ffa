use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMsg};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AdmissionError, TransportDeliveryError};
use crate::fanout::{LogPublisher, ResultPublisher};
use crate::job::{CommandChainRequest, JobStatusRecord};
use crate::service::JobService;

/// Frames the server writes to a connection.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum OutboundFrame<'a> {
    Accepted {
        id: String,
        enqueued_at: DateTime<Utc>,
    },
    Error {
        message: String,
    },
    Result {
        connection_id: &'a str,
        result: &'a JobStatusRecord,
    },
    Log {
        connection_id: &'a str,
        job_id: &'a str,
        line: &'a str,
    },
}

impl OutboundFrame<'_> {
    fn to_message(&self) -> Result<WsMsg, serde_json::Error> {
        Ok(WsMsg::Text(serde_json::to_string(self)?.into()))
    }
}

/// Open connections by connection id.
#[derive(Default)]
pub struct SocketHub {
    connections: DashMap<String, UnboundedSender<WsMsg>>,
}

impl SocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn register(&self, connection_id: &str, sender: UnboundedSender<WsMsg>) {
        self.connections.insert(connection_id.to_string(), sender);
    }

    fn unregister(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    fn send(&self, connection_id: &str, frame: &OutboundFrame<'_>) -> Result<(), TransportDeliveryError> {
        let msg = frame
            .to_message()
            .map_err(|e| TransportDeliveryError::new("socket", e.to_string()))?;
        let sender = self
            .connections
            .get(connection_id)
            .ok_or_else(|| TransportDeliveryError::new("socket", format!("connection `{connection_id}` is gone")))?;
        sender
            .send(msg)
            .map_err(|_| TransportDeliveryError::new("socket", format!("connection `{connection_id}` is closing")))
    }
}

/// Delivers results and log lines to the connection named by the job's
/// callback id. Jobs without a callback id are skipped.
pub struct SocketPublisher {
    hub: Arc<SocketHub>,
}

impl SocketPublisher {
    pub fn new(hub: Arc<SocketHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl LogPublisher for SocketPublisher {
    fn name(&self) -> &str {
        "socket"
    }

    async fn publish_log(
        &self,
        callback_id: Option<&str>,
        job_id: &str,
        line: &str,
    ) -> Result<(), TransportDeliveryError> {
        let Some(connection_id) = callback_id else {
            return Ok(());
        };
        self.hub.send(connection_id, &OutboundFrame::Log { connection_id, job_id, line })
    }
}

#[async_trait]
impl ResultPublisher for SocketPublisher {
    fn name(&self) -> &str {
        "socket"
    }

    async fn publish_result(
        &self,
        callback_id: Option<&str>,
        result: &JobStatusRecord,
    ) -> Result<(), TransportDeliveryError> {
        let Some(connection_id) = callback_id else {
            return Ok(());
        };
        self.hub.send(connection_id, &OutboundFrame::Result { connection_id, result })
    }
}

/// Accepts WebSocket connections until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<SocketHub>,
    service: Arc<JobService>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "socket transport listening");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "socket connection accepted");
                    tokio::spawn(handle_connection(
                        stream,
                        Arc::clone(&hub),
                        Arc::clone(&service),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("socket accept failed: {e}"),
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    hub: Arc<SocketHub>,
    service: Arc<JobService>,
    shutdown: CancellationToken,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("WebSocket handshake failed: {e}");
            return;
        }
    };
    let connection_id = Uuid::new_v4().to_string();
    let (mut write, mut read) = ws_stream.split();
    let (tx_out, mut rx_out) = unbounded_channel();
    hub.register(&connection_id, tx_out.clone());
    info!(%connection_id, "socket client connected");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = read.next() => match msg {
                Some(Ok(WsMsg::Text(txt))) => {
                    let reply = match submit_frame(&service, &connection_id, &txt).await {
                        Ok(ticket) => OutboundFrame::Accepted { id: ticket.id, enqueued_at: ticket.enqueued_at },
                        Err(e) => OutboundFrame::Error { message: e.to_string() },
                    };
                    match reply.to_message() {
                        Ok(frame) => {
                            let _ = tx_out.send(frame);
                        }
                        Err(e) => warn!(%connection_id, "reply not encodable: {e}"),
                    }
                }
                Some(Ok(WsMsg::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%connection_id, "socket read failed: {e}");
                    break;
                }
            },
            frame = rx_out.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(frame).await {
                        debug!(%connection_id, "socket write failed: {e}");
                        break;
                    }
                }
                None => break,
            }
        }
    }

    hub.unregister(&connection_id);
    let _ = write.close().await;
    info!(%connection_id, "socket client disconnected");
}

async fn submit_frame(
    service: &JobService,
    connection_id: &str,
    text: &str,
) -> Result<crate::queue::JobTicket, AdmissionError> {
    let mut body: Value = serde_json::from_str(text).map_err(|e| AdmissionError::Malformed(e.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.entry("callbackConnectionId")
            .or_insert_with(|| Value::String(connection_id.to_string()));
    }
    let request = CommandChainRequest::from_json(body)?;
    service.submit(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use serde_json::json;

    fn record() -> JobStatusRecord {
        JobStatusRecord {
            id: "job-7".into(),
            status: JobState::Succeeded,
            commands: vec!["a".into()],
            outcomes: vec![None],
            requested_by: None,
            enqueued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn frames_carry_a_type_tag_and_camel_case_fields() {
        let log = serde_json::to_value(OutboundFrame::Log { connection_id: "c1", job_id: "j1", line: "hi" }).unwrap();
        assert_eq!(log, json!({"type": "log", "connectionId": "c1", "jobId": "j1", "line": "hi"}));

        let rec = record();
        let result = serde_json::to_value(OutboundFrame::Result { connection_id: "c1", result: &rec }).unwrap();
        assert_eq!(result["type"], "result");
        assert_eq!(result["result"]["id"], "job-7");
        assert_eq!(result["result"]["status"], "succeeded");
    }

    #[tokio::test]
    async fn publisher_routes_to_the_callback_connection() {
        let hub = Arc::new(SocketHub::new());
        let (tx, mut rx) = unbounded_channel();
        hub.register("c1", tx);
        let publisher = SocketPublisher::new(Arc::clone(&hub));

        publisher.publish_log(Some("c1"), "job-7", "line one").await.unwrap();
        publisher.publish_result(Some("c1"), &record()).await.unwrap();
        // no callback: nothing to do
        publisher.publish_log(None, "job-7", "dropped").await.unwrap();

        let WsMsg::Text(first) = rx.recv().await.unwrap() else { panic!("expected text") };
        assert!(first.contains("\"line\":\"line one\""));
        let WsMsg::Text(second) = rx.recv().await.unwrap() else { panic!("expected text") };
        assert!(second.contains("\"type\":\"result\""));
        assert!(rx.try_recv().is_err());

        hub.unregister("c1");
        assert!(publisher.publish_log(Some("c1"), "job-7", "late").await.is_err());
    }
}
