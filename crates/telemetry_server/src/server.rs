use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{BridgeDiagnostics, HeartRateSample};

use crate::error::TelemetryError;
use crate::protocol::ClientMessage;
use crate::session::{FieldUpdate, ProtocolSession};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Listener accepting telemetry producers. One task per connection.
pub struct TelemetryServer {
    listener: TcpListener,
    field: Arc<str>,
    samples: mpsc::Sender<HeartRateSample>,
    diagnostics: Arc<BridgeDiagnostics>,
}

impl TelemetryServer {
    pub async fn bind(
        addr: &str,
        field: &str,
        samples: mpsc::Sender<HeartRateSample>,
        diagnostics: Arc<BridgeDiagnostics>,
    ) -> Result<Self, TelemetryError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| TelemetryError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self { listener, field: Arc::from(field), samples, diagnostics })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TelemetryError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts until `stop` fires, then closes every live session and waits
    /// up to [`DRAIN_TIMEOUT`] for their pending writes to flush. Sessions
    /// still running after that are aborted.
    pub async fn run(self, stop: CancellationToken) {
        let mut sessions = JoinSet::new();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, field = %self.field, "telemetry server listening");
        }

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "telemetry client connected");
                        let field = self.field.clone();
                        let samples = self.samples.clone();
                        let diagnostics = self.diagnostics.clone();
                        let stop = stop.clone();
                        sessions.spawn(async move {
                            if let Err(e) = run_session(stream, peer, field, samples, diagnostics, stop).await {
                                warn!(%peer, error = %e, "telemetry session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept telemetry connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "telemetry session task failed");
                    }
                }
            }
        }

        drop(self.listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "telemetry session task failed during close");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = sessions.len(), "telemetry sessions did not close in time; aborting");
            sessions.shutdown().await;
        }
        info!("telemetry server closed");
    }
}

async fn run_session(
    stream: TcpStream,
    peer: SocketAddr,
    field: Arc<str>,
    samples: mpsc::Sender<HeartRateSample>,
    diagnostics: Arc<BridgeDiagnostics>,
    stop: CancellationToken,
) -> Result<(), TelemetryError> {
    let ws = tokio::select! {
        _ = stop.cancelled() => return Ok(()),
        ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream)) => match ws {
            Ok(ws) => ws?,
            Err(_) => {
                debug!(%peer, "telemetry handshake timed out");
                return Ok(());
            }
        },
    };
    let (mut sink, mut source) = ws.split();
    let mut session = ProtocolSession::new(field);

    sink.send(Message::Text(session.greeting().to_json()?)).await?;

    loop {
        let frame = tokio::select! {
            _ = stop.cancelled() => {
                match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                    Ok(closed) => closed?,
                    Err(_) => debug!(%peer, "peer did not take the close frame"),
                }
                break;
            }
            frame = source.next() => frame,
        };

        let text = match frame {
            None | Some(Ok(Message::Close(_))) => break,
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(_))) => {
                warn!(%peer, "dropping binary telemetry frame");
                continue;
            }
            Some(Ok(_)) => continue,
        };

        let message = match ClientMessage::parse(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed telemetry message");
                continue;
            }
        };
        if let ClientMessage::Unsupported(op) = message {
            debug!(%peer, op, "ignoring unsupported opcode");
        }

        let handled = session.handle(message);
        match handled.update {
            Some(FieldUpdate::Accepted(bpm)) => {
                diagnostics.record_sample();
                debug!(%peer, bpm, "heart rate received");
                if samples.send(bpm).await.is_err() {
                    debug!(%peer, bpm, "control loop stopped; sample dropped");
                }
            }
            Some(FieldUpdate::Ignored(text)) => {
                diagnostics.record_ignored_sample();
                debug!(%peer, text = %text, "ignoring non-numeric heart rate");
            }
            None => {}
        }

        for reply in handled.replies {
            sink.send(Message::Text(reply.to_json()?)).await?;
        }
    }

    debug!(%peer, identified = session.is_identified(), "telemetry session closed");
    Ok(())
}
