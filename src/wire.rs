//! Line-delimited JSON front door.
//!
//! Every line a client writes is one request. `inbound` hands a customer's
//! message to the dispatcher; `subscribe` streams every outbound message of a
//! business back over the same connection, one JSON object per line.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::conversation::Dispatcher;
use crate::limits::MAX_LINE_LEN;
use crate::model::BusinessId;
use crate::outbox::{Envelope, OutboxHub};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Inbound {
        business_id: BusinessId,
        phone: String,
        text: String,
    },
    Subscribe {
        business_id: BusinessId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Reply {
    Accepted,
    Subscribed { business_id: BusinessId },
    Outbound(Envelope),
    Error { message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(LinesCodecError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<LinesCodecError> for WireError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::Io(io) => WireError::Io(io),
            other => WireError::Codec(other),
        }
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(
    socket: S,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<OutboxHub>,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut lines = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Envelope>(256);
    let mut forwarders: Vec<(BusinessId, JoinHandle<()>)> = Vec::new();

    let result = loop {
        tokio::select! {
            line = lines.next() => {
                let line = match line {
                    None => break Ok(()),
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        send(&mut lines, &Reply::Error { message: "line too long".into() }).await?;
                        continue;
                    }
                    Some(Err(e)) => break Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let reply = match serde_json::from_str::<Request>(&line) {
                    Err(e) => Reply::Error { message: format!("malformed request: {e}") },
                    Ok(Request::Inbound { business_id, phone, text }) => {
                        match dispatcher.handle_inbound_message(&business_id, &phone, &text).await {
                            Ok(()) => Reply::Accepted,
                            Err(e) => Reply::Error { message: e.to_string() },
                        }
                    }
                    Ok(Request::Subscribe { business_id }) => {
                        if !forwarders.iter().any(|(id, _)| *id == business_id) {
                            let rx = hub.subscribe(&business_id);
                            let handle = tokio::spawn(forward(rx, outbound_tx.clone()));
                            forwarders.push((business_id.clone(), handle));
                        }
                        Reply::Subscribed { business_id }
                    }
                };
                send(&mut lines, &reply).await?;
            }
            Some(envelope) = outbound_rx.recv() => {
                send(&mut lines, &Reply::Outbound(envelope)).await?;
            }
        }
    };

    for (business_id, handle) in forwarders {
        handle.abort();
        // Let the abort land before checking for remaining receivers.
        let _ = handle.await;
        hub.prune(&business_id);
    }
    result
}

async fn send<S>(lines: &mut Framed<S, LinesCodec>, reply: &Reply) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    lines.send(serde_json::to_string(reply)?).await?;
    Ok(())
}

async fn forward(mut rx: broadcast::Receiver<Envelope>, tx: mpsc::Sender<Envelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagging, outbound messages dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("outbox channel closed");
                return;
            }
        }
    }
}
