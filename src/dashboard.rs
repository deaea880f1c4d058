//! Socket side of the status notifier.
//!
//! Dashboards connect over WebSocket, receive the current
//! `{heartRate, actuationState}` snapshot and every change after it, and may
//! send `{"command": "manualOn" | "manualOff"}` overrides.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use actuation::ManualRequest;
use common::{ManualCommand, ManualReply, StatusUpdate};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("failed to bind dashboard listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dashboard transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("dashboard encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("dashboard listener error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct DashboardCommand {
    command: ManualCommand,
}

pub struct DashboardServer {
    listener: TcpListener,
    status: watch::Receiver<StatusUpdate>,
    manual: mpsc::Sender<ManualRequest>,
}

impl DashboardServer {
    pub async fn bind(
        addr: &str,
        status: watch::Receiver<StatusUpdate>,
        manual: mpsc::Sender<ManualRequest>,
    ) -> Result<Self, DashboardError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| DashboardError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { listener, status, manual })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DashboardError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, stop: CancellationToken) {
        let mut clients = JoinSet::new();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "dashboard listening");
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let status = self.status.clone();
                        let manual = self.manual.clone();
                        let stop = stop.clone();
                        clients.spawn(async move {
                            if let Err(e) = serve_client(stream, peer, status, manual, stop).await {
                                warn!(%peer, error = %e, "dashboard client ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept dashboard connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = clients.join_next(), if !clients.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "dashboard client task failed");
                    }
                }
            }
        }

        drop(self.listener);
        let drained =
            tokio::time::timeout(DRAIN_TIMEOUT, async { while clients.join_next().await.is_some() {} }).await;
        if drained.is_err() {
            warn!(remaining = clients.len(), "dashboard clients did not close in time; aborting");
            clients.shutdown().await;
        }
        info!("dashboard closed");
    }
}

async fn serve_client(
    stream: TcpStream,
    peer: SocketAddr,
    mut status: watch::Receiver<StatusUpdate>,
    manual: mpsc::Sender<ManualRequest>,
    stop: CancellationToken,
) -> Result<(), DashboardError> {
    let ws = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)) => match ws {
            Ok(ws) => ws?,
            Err(_) => {
                debug!(%peer, "dashboard handshake timed out");
                return Ok(());
            }
        },
    };
    let (mut sink, mut source) = ws.split();
    debug!(%peer, "dashboard connected");

    let current = *status.borrow_and_update();
    sink.send(Message::Text(serde_json::to_string(&current)?)).await?;
    let mut status_open = true;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                    Ok(closed) => closed?,
                    Err(_) => debug!(%peer, "dashboard did not take the close frame"),
                }
                break;
            }
            changed = status.changed(), if status_open => {
                if changed.is_err() {
                    status_open = false;
                    continue;
                }
                let update = *status.borrow_and_update();
                sink.send(Message::Text(serde_json::to_string(&update)?)).await?;
            }
            frame = source.next() => {
                let text = match frame {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };
                let command = match serde_json::from_str::<DashboardCommand>(&text) {
                    Ok(parsed) => parsed.command,
                    Err(e) => {
                        warn!(%peer, error = %e, "dropping malformed dashboard message");
                        continue;
                    }
                };
                let reply = forward_manual(&manual, command).await;
                sink.send(Message::Text(serde_json::to_string(&reply)?)).await?;
            }
        }
    }

    debug!(%peer, "dashboard disconnected");
    Ok(())
}

async fn forward_manual(manual: &mpsc::Sender<ManualRequest>, command: ManualCommand) -> ManualReply {
    let (reply, answer) = oneshot::channel();
    let outcome = match manual.send(ManualRequest { command, reply }).await {
        Ok(()) => answer.await.map_err(|_| "control loop stopped".to_string()),
        Err(_) => Err("control loop stopped".to_string()),
    };

    match outcome {
        Ok(Ok(_)) => ManualReply { command, success: true, error: None },
        Ok(Err(e)) => {
            warn!(?command, error = %e, "manual command failed");
            ManualReply { command, success: false, error: Some(e.to_string()) }
        }
        Err(e) => ManualReply { command, success: false, error: Some(e) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ActuationState, ActuatorError};
    use serde_json::{json, Value};
    use tokio_tungstenite::connect_async;

    async fn next_json<S>(client: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out")
                .expect("stream ended")
                .expect("transport error");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn pushes_status_and_answers_manual_commands() {
        let (status_tx, status_rx) = watch::channel(StatusUpdate {
            heart_rate: 72,
            actuation_state: ActuationState::Disengaged,
        });
        let (manual_tx, mut manual_rx) = mpsc::channel::<ManualRequest>(4);
        let server = DashboardServer::bind("127.0.0.1:0", status_rx, manual_tx).await.unwrap();
        let url = format!("ws://{}", server.local_addr().unwrap());
        let stop = CancellationToken::new();
        let handle = tokio::spawn(server.run(stop.clone()));

        // Stand-in for the control loop: accept on, refuse off.
        tokio::spawn(async move {
            while let Some(request) = manual_rx.recv().await {
                let result = match request.command {
                    ManualCommand::ManualOn => Ok(ActuationState::Engaged),
                    ManualCommand::ManualOff => Err(ActuatorError::NotReady),
                };
                let _ = request.reply.send(result);
            }
        });

        let (mut client, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_json(&mut client).await, json!({ "heartRate": 72, "actuationState": "off" }));

        status_tx.send_replace(StatusUpdate { heart_rate: 64, actuation_state: ActuationState::Engaged });
        assert_eq!(next_json(&mut client).await, json!({ "heartRate": 64, "actuationState": "on" }));

        client.send(Message::Text(json!({ "command": "manualOn" }).to_string())).await.unwrap();
        assert_eq!(next_json(&mut client).await, json!({ "command": "manualOn", "success": true }));

        client.send(Message::Text(json!({ "command": "manualOff" }).to_string())).await.unwrap();
        assert_eq!(
            next_json(&mut client).await,
            json!({ "command": "manualOff", "success": false, "error": "actuator is not ready" })
        );

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn manual_command_without_control_loop_fails() {
        let (manual_tx, manual_rx) = mpsc::channel::<ManualRequest>(1);
        drop(manual_rx);
        let reply = forward_manual(&manual_tx, ManualCommand::ManualOn).await;
        assert!(!reply.success);
        assert_eq!(reply.error.as_deref(), Some("control loop stopped"));
    }

    #[tokio::test]
    async fn stop_is_not_held_up_by_a_client_that_never_upgrades() {
        let (_status_tx, status_rx) = watch::channel(StatusUpdate::default());
        let (manual_tx, _manual_rx) = mpsc::channel::<ManualRequest>(1);
        let server = DashboardServer::bind("127.0.0.1:0", status_rx, manual_tx).await.unwrap();
        let addr = server.local_addr().unwrap();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(server.run(stop.clone()));

        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("dashboard still waiting on the idle connection")
            .unwrap();
    }
}
