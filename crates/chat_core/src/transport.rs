//! Push-channel plumbing: one long-lived websocket per client session, with
//! reconnection and post-reconnect reconciliation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::router::decode_frame;
use crate::ChatClient;

const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

impl ChatClient {
    /// Connect the push channel and keep it connected. The returned handle
    /// owns the reconnect loop; dropping or aborting it closes the channel.
    ///
    /// Events missed while disconnected are not replayed by the server, so
    /// every successful reconnect after the first triggers a reconciliation
    /// pass over the active conversation.
    pub fn connect_push(self: &Arc<Self>, server_url: &str) -> Result<JoinHandle<()>> {
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server url must start with http:// or https://"));
        };
        let ws_url = format!(
            "{}/ws?token={}",
            ws_url.trim_end_matches('/'),
            self.session.credential()
        );

        let client = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut delay = RECONNECT_INITIAL_DELAY;
            let mut connected_before = false;
            loop {
                match client.run_push_session(&ws_url, connected_before).await {
                    Ok(()) => {
                        info!("push channel closed by server");
                        delay = RECONNECT_INITIAL_DELAY;
                    }
                    Err(err) => {
                        warn!(error = %err, "push channel failed");
                    }
                }
                connected_before = true;
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }))
    }

    async fn run_push_session(
        self: &Arc<Self>,
        ws_url: &str,
        reconciliation_needed: bool,
    ) -> Result<()> {
        let (stream, _) = connect_async(ws_url)
            .await
            .context("failed to connect push channel")?;
        info!("push channel connected");
        let (mut writer, mut reader) = stream.split();

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.inner.lock().await;
            state.ack_tx = Some(ack_tx);
        }

        if reconciliation_needed {
            self.reconcile_after_reconnect().await;
        }

        let result = loop {
            tokio::select! {
                frame = reader.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(event) = decode_frame(&text) {
                            self.handle_server_event(event).await;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(err) = writer.send(Message::Pong(payload)).await {
                            break Err(err.into());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => break Err(err.into()),
                },
                ack = ack_rx.recv() => match ack {
                    Some(frame) => {
                        let text = serde_json::to_string(&frame)
                            .context("acknowledgment frame serialization")?;
                        if let Err(err) = writer.send(Message::Text(text)).await {
                            break Err(err.into());
                        }
                    }
                    None => break Ok(()),
                },
            }
        };

        let mut state = self.inner.lock().await;
        state.ack_tx = None;
        result
    }
}
