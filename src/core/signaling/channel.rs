//! Relay connection: one WebSocket, FIFO outbound queue, typed inbound events.
//!
//! The channel task owns the socket. Outbound envelopes arrive on an
//! unbounded mpsc and are written in order; inbound frames are decoded into
//! [`Envelope`]s and forwarded as [`SignalEvent`]s. `IDENTIFY` is always the
//! first frame written after a (re)connect.

use super::envelope::Envelope;
use crate::core::config::{RECONNECT_JITTER_MS, RECONNECT_MAX_RETRIES, RECONNECT_RETRY_DELAYS};
use crate::utils::sos::SignalOfStop;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

/// Events surfaced by the signaling channel to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A decoded inbound envelope.
    Envelope(Envelope),
    /// The relay connection was lost. Emitted once per loss.
    Disconnected,
    /// About to retry after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// The relay connection was re-established and re-identified.
    Reconnected,
    /// Retries exhausted (or disabled); the channel task has exited.
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub url: Url,
    pub username: String,
    pub reconnect: bool,
}

impl SignalingConfig {
    pub fn new(server: &str, username: impl Into<String>, reconnect: bool) -> Result<Self> {
        let url = Url::parse(server).with_context(|| format!("invalid server URL '{server}'"))?;
        anyhow::ensure!(
            matches!(url.scheme(), "ws" | "wss"),
            "server URL must use ws:// or wss:// (got '{}')",
            url.scheme()
        );
        Ok(Self {
            url,
            username: username.into(),
            reconnect,
        })
    }
}

/// Handle used by the rest of the app to push envelopes to the relay.
#[derive(Debug, Clone)]
pub struct SignalingChannel {
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl SignalingChannel {
    /// Wrap an outbound queue. The receiving half is drained by [`spawn`].
    pub fn new(outbound: mpsc::UnboundedSender<Envelope>) -> Self {
        Self { outbound }
    }

    /// Queue an envelope. Order is preserved; failures mean the channel
    /// task has exited and are only logged.
    pub fn send(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if self.outbound.send(envelope).is_err() {
            debug!(event = "signal_send_dropped", kind, "Signaling channel closed; envelope dropped");
        }
    }
}

/// Delay before retry number `attempt` (1-based), without jitter.
pub fn retry_delay(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(RECONNECT_RETRY_DELAYS.len() - 1);
    Duration::from_secs(RECONNECT_RETRY_DELAYS[idx])
}

fn jittered(delay: Duration) -> Duration {
    delay + Duration::from_millis(rand::random::<u64>() % (RECONNECT_JITTER_MS + 1))
}

/// Spawn the channel task.
pub fn spawn(
    config: SignalingConfig,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
    events_tx: mpsc::UnboundedSender<SignalEvent>,
    sos: SignalOfStop,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            if sos.cancelled() {
                break;
            }

            match connect_async(config.url.as_str()).await {
                Ok((ws_stream, _)) => {
                    info!(event = "relay_connected", url = %config.url, "Connected to signaling relay");
                    attempt = 0;

                    // Anything queued while offline belongs to the old session.
                    while let Ok(stale) = outbound_rx.try_recv() {
                        debug!(event = "signal_stale_dropped", kind = stale.kind(), "Dropping envelope queued while offline");
                    }

                    if ever_connected {
                        let _ = events_tx.send(SignalEvent::Reconnected);
                    }
                    ever_connected = true;

                    run_connection(ws_stream, &config, &mut outbound_rx, &events_tx, &sos).await;
                    if sos.cancelled() {
                        break;
                    }
                    let _ = events_tx.send(SignalEvent::Disconnected);
                }
                Err(e) => {
                    warn!(event = "relay_connect_failure", url = %config.url, error = %e, "Failed to connect to signaling relay");
                    if !ever_connected && attempt == 0 {
                        let _ = events_tx.send(SignalEvent::Disconnected);
                    }
                }
            }

            if !config.reconnect {
                let _ = events_tx.send(SignalEvent::GaveUp);
                break;
            }

            attempt += 1;
            if attempt > RECONNECT_MAX_RETRIES {
                error!(event = "relay_gave_up", attempts = RECONNECT_MAX_RETRIES, "Giving up on signaling relay");
                let _ = events_tx.send(SignalEvent::GaveUp);
                break;
            }

            let delay = jittered(retry_delay(attempt));
            info!(event = "relay_reconnecting", attempt, delay_ms = delay.as_millis() as u64, "Reconnecting to signaling relay");
            let _ = events_tx.send(SignalEvent::Reconnecting { attempt, delay });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = sos.wait() => break,
            }
        }

        debug!(event = "relay_task_exit", "Signaling task stopped");
    })
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one established connection until it closes or shutdown is requested.
async fn run_connection(
    ws_stream: WsStream,
    config: &SignalingConfig,
    outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    events_tx: &mpsc::UnboundedSender<SignalEvent>,
    sos: &SignalOfStop,
) {
    let (mut write, mut read) = ws_stream.split();

    if let Err(e) = write_envelope(&mut write, &Envelope::identify(&config.username)).await {
        warn!(event = "relay_identify_failure", error = %e, "Failed to identify with relay");
        return;
    }

    loop {
        tokio::select! {
            _ = sos.wait() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else {
                    // Every sender dropped: the app is shutting down.
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = write_envelope(&mut write, &envelope).await {
                    warn!(event = "relay_write_failure", kind = envelope.kind(), error = %e, "Failed to write to relay");
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => match Envelope::decode(&text) {
                        Ok(envelope) => {
                            debug!(event = "relay_envelope", kind = envelope.kind(), "Envelope received");
                            let _ = events_tx.send(SignalEvent::Envelope(envelope));
                        }
                        Err(e) => {
                            warn!(event = "relay_malformed", error = %e, "Dropping malformed relay frame");
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        info!(event = "relay_closed", frame = ?frame, "Relay closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(event = "relay_read_failure", error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        warn!(event = "relay_eof", "WebSocket closed");
                        break;
                    }
                }
            }
        }
    }
}

async fn write_envelope<S>(write: &mut S, envelope: &Envelope) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = envelope.encode().context("encoding envelope")?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}
