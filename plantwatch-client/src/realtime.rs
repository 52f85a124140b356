//! WebSocket realtime manager with reconnect backoff.

use crate::api_client::WsClient;
use crate::events::{PushMessage, SyncEvent};
use futures_util::StreamExt;
use plantwatch_core::TenantId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

/// Keep the tenant's confirmation socket open, forwarding confirmations to
/// `sender`. Stops when the receiving side is dropped or the task is aborted.
pub fn spawn_ws_manager(
    ws: WsClient,
    tenant_id: TenantId,
    sender: mpsc::Sender<SyncEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            match ws.connect(tenant_id).await {
                Ok(mut stream) => {
                    tracing::info!(tenant_id = %tenant_id, "Confirmation socket connected");
                    if sender.send(SyncEvent::Connected { tenant_id }).await.is_err() {
                        return;
                    }
                    attempt = 0;

                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Text(text)) => {
                                let event = match serde_json::from_str::<PushMessage>(&text) {
                                    Ok(PushMessage::CommandResponse(event)) => {
                                        SyncEvent::Confirmation(event)
                                    }
                                    Ok(PushMessage::Other) => continue,
                                    Err(err) => {
                                        SyncEvent::Error(format!("WS decode error: {}", err))
                                    }
                                };
                                if sender.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(err) => {
                                let _ = sender.send(SyncEvent::Error(err.to_string())).await;
                                break;
                            }
                        }
                    }

                    tracing::warn!(tenant_id = %tenant_id, "Confirmation socket closed");
                    let _ = sender
                        .send(SyncEvent::Disconnected {
                            reason: "connection closed".to_string(),
                        })
                        .await;
                }
                Err(err) => {
                    tracing::warn!(tenant_id = %tenant_id, error = %err, "Confirmation socket connect failed");
                    if sender.send(SyncEvent::Error(err.to_string())).await.is_err() {
                        return;
                    }
                }
            }

            let delay = ws.reconnect_config().delay(attempt);
            tracing::debug!(tenant_id = %tenant_id, attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    })
}
