//! Wire protocol server
//!
//! One reader loop and one writer task per connection. Every `Request` frame
//! runs as its own task so exchanges on a connection progress independently;
//! their frames are funnelled through a single outbound queue, which keeps
//! each exchange's frames in production order.

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::codec::Framed;

use crate::orchestrator::Orchestrator;
use crate::protocol::{ContinuumCodec, ErrorPayload, Frame, RequestPayload, WireMessage};
use crate::{GatewayError, Result};

/// Frames buffered per connection before exchange tasks wait on the socket
const OUTBOUND_BUFFER: usize = 256;

type Exchanges = Arc<Mutex<HashMap<u64, AbortHandle>>>;

pub struct WireServer {
    orchestrator: Arc<Orchestrator>,
    codec: ContinuumCodec,
}

impl WireServer {
    pub fn new(orchestrator: Arc<Orchestrator>, max_frame_size: u32) -> Self {
        Self {
            orchestrator,
            codec: ContinuumCodec::new(max_frame_size),
        }
    }

    /// Bind and serve until the task is dropped.
    pub async fn start(&self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Continuum wire server listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            if let Err(e) = socket.set_nodelay(true) {
                tracing::debug!("set_nodelay failed for {}: {}", peer, e);
            }
            tokio::spawn(handle_connection(
                socket,
                peer,
                self.orchestrator.clone(),
                self.codec,
            ));
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    codec: ContinuumCodec,
) {
    tracing::info!("Wire connection from {}", peer);

    let (mut sink, mut frames) = Framed::new(socket, codec).split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Write to {} failed: {}", peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let exchanges: Exchanges = Arc::new(Mutex::new(HashMap::new()));

    while let Some(item) = frames.next().await {
        let violation = match item.and_then(|frame| {
            WireMessage::from_frame(&frame).map(|message| (frame.correlation_id, message))
        }) {
            Ok((id, WireMessage::Request(payload))) => {
                start_exchange(id, payload, &orchestrator, &outbound_tx, &exchanges).await;
                continue;
            }
            Ok((id, WireMessage::Cancel)) => {
                if let Some(handle) = exchanges.lock().remove(&id) {
                    handle.abort();
                    tracing::debug!("Exchange {} cancelled by {}", id, peer);
                }
                continue;
            }
            Ok((id, other)) => GatewayError::ProtocolViolation(format!(
                "clients may not send {:?} frames (correlation id {})",
                other.kind(),
                id
            )),
            Err(GatewayError::Io(e)) => {
                tracing::debug!("Read from {} failed: {}", peer, e);
                break;
            }
            Err(e) => e,
        };

        tracing::warn!("Closing wire connection {}: {}", peer, violation);
        if let Ok(frame) = WireMessage::Error(ErrorPayload::from(&violation)).to_frame(0) {
            let _ = outbound_tx.send(frame).await;
        }
        break;
    }

    // The connection is gone or condemned: nothing it started may keep running.
    for (_, handle) in exchanges.lock().drain() {
        handle.abort();
    }
    drop(outbound_tx);
    let _ = writer.await;

    tracing::info!("Wire connection {} closed", peer);
}

async fn start_exchange(
    id: u64,
    payload: RequestPayload,
    orchestrator: &Arc<Orchestrator>,
    outbound: &mpsc::Sender<Frame>,
    exchanges: &Exchanges,
) {
    let duplicate = {
        let mut open = exchanges.lock();
        if open.contains_key(&id) {
            true
        } else {
            let task = tokio::spawn(run_exchange(
                id,
                payload,
                orchestrator.clone(),
                outbound.clone(),
                exchanges.clone(),
            ));
            open.insert(id, task.abort_handle());
            false
        }
    };

    if duplicate {
        let err = GatewayError::ProtocolViolation(format!("correlation id {} is already in flight", id));
        tracing::warn!("{}", err);
        if let Ok(frame) = WireMessage::end(Some(&err)).to_frame(id) {
            let _ = outbound.send(frame).await;
        }
    }
}

async fn run_exchange(
    id: u64,
    payload: RequestPayload,
    orchestrator: Arc<Orchestrator>,
    outbound: mpsc::Sender<Frame>,
    exchanges: Exchanges,
) {
    let RequestPayload { token, request } = payload;

    let end = match orchestrator.complete(&token, request).await {
        Ok(mut chunks) => {
            let mut end = WireMessage::end(None);
            while let Some(chunk) = chunks.next().await {
                match WireMessage::Chunk(chunk).to_frame(id) {
                    Ok(frame) => {
                        if outbound.send(frame).await.is_err() {
                            // Writer is gone; dropping `chunks` releases the provider.
                            exchanges.lock().remove(&id);
                            return;
                        }
                    }
                    Err(e) => {
                        end = WireMessage::end(Some(&GatewayError::Internal(e.to_string())));
                        break;
                    }
                }
            }
            end
        }
        Err(e) => {
            tracing::debug!("Exchange {} rejected: {}", id, e);
            WireMessage::end(Some(&e))
        }
    };

    // Deregister before End so a client may reuse the id as soon as it sees End.
    exchanges.lock().remove(&id);
    if let Ok(frame) = end.to_frame(id) {
        let _ = outbound.send(frame).await;
    }
}
