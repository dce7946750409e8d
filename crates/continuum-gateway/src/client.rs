//! Client for the Continuum wire protocol
//!
//! A single connection multiplexes any number of completions. A reader task
//! routes incoming frames to the exchange that owns their correlation id.

use futures::stream::{SplitSink, Stream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::protocol::{ContinuumCodec, Frame, RequestPayload, WireMessage};
use crate::types::{CompletionChunk, CompletionRequest};
use crate::{GatewayError, Result};

type Pending = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Result<CompletionChunk>>>>>;

struct Connection {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Pending,
    next_id: AtomicU64,
}

/// Multiplexing connection to a wire server
#[derive(Clone)]
pub struct ContinuumClient {
    connection: Arc<Connection>,
}

impl ContinuumClient {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::connect_with(addr, ContinuumCodec::default()).await
    }

    pub async fn connect_with(addr: impl ToSocketAddrs, codec: ContinuumCodec) -> Result<Self> {
        let socket = TcpStream::connect(addr).await?;
        socket.set_nodelay(true)?;

        let (sink, frames) = Framed::new(socket, codec).split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(write_frames(sink, outbound_rx));
        tokio::spawn(read_frames(frames, pending.clone()));

        Ok(Self {
            connection: Arc::new(Connection {
                outbound,
                pending,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Start a completion. Gate rejections arrive as the stream's only item.
    pub fn complete(&self, token: &str, request: CompletionRequest) -> Result<Completion> {
        let id = self.connection.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = WireMessage::Request(RequestPayload {
            token: token.to_string(),
            request,
        })
        .to_frame(id)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.connection.pending.lock().insert(id, tx);

        if self.connection.outbound.send(frame).is_err() {
            self.connection.pending.lock().remove(&id);
            return Err(closed());
        }

        Ok(Completion {
            id,
            chunks: rx,
            connection: self.connection.clone(),
            done: false,
        })
    }

    /// Number of exchanges still waiting for `End`.
    pub fn in_flight(&self) -> usize {
        self.connection.pending.lock().len()
    }
}

/// Chunks of one exchange. Dropping it before the end cancels the exchange.
pub struct Completion {
    id: u64,
    chunks: mpsc::UnboundedReceiver<Result<CompletionChunk>>,
    connection: Arc<Connection>,
    done: bool,
}

impl Completion {
    pub fn correlation_id(&self) -> u64 {
        self.id
    }

    /// Stop the exchange. Consuming the handle sends `Cancel` if the server
    /// has not finished it yet.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Stream for Completion {
    type Item = Result<CompletionChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = self.chunks.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.done = true;
        }
        polled
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Still registered means the server has not sent End yet.
        if self.connection.pending.lock().remove(&self.id).is_some() {
            if let Ok(frame) = WireMessage::Cancel.to_frame(self.id) {
                let _ = self.connection.outbound.send(frame);
            }
        }
    }
}

async fn write_frames(
    mut sink: SplitSink<Framed<TcpStream, ContinuumCodec>, Frame>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!("Wire client write failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_frames(
    mut frames: futures::stream::SplitStream<Framed<TcpStream, ContinuumCodec>>,
    pending: Pending,
) {
    let reason = loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => break e,
            None => break closed(),
        };
        let id = frame.correlation_id;

        match WireMessage::from_frame(&frame) {
            Ok(WireMessage::Chunk(chunk)) => {
                if let Some(tx) = pending.lock().get(&id) {
                    let _ = tx.send(Ok(chunk));
                }
            }
            Ok(WireMessage::End(end)) => {
                let tx = pending.lock().remove(&id);
                if let (Some(tx), Some(error)) = (tx, end.error) {
                    let _ = tx.send(Err(error.into_error()));
                }
            }
            Ok(WireMessage::Error(error)) => {
                break GatewayError::ProtocolViolation(format!("{}: {}", error.code, error.message))
            }
            Ok(other) => {
                tracing::debug!("Ignoring unexpected {:?} frame from server", other.kind());
            }
            Err(e) => break e,
        }
    };

    tracing::debug!("Wire client connection ended: {}", reason);
    for (_, tx) in pending.lock().drain() {
        let _ = tx.send(Err(match &reason {
            GatewayError::ProtocolViolation(m) => GatewayError::ProtocolViolation(m.clone()),
            _ => closed(),
        }));
    }
}

fn closed() -> GatewayError {
    GatewayError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionAborted,
        "wire connection closed",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Identity, IdentityTable, Permissions, Quota};
    use crate::orchestrator::Orchestrator;
    use crate::providers::scripted::{ScriptedAdapter, Step};
    use crate::router::ModelRouter;
    use crate::server::WireServer;
    use crate::types::ChatMessage;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn serve(models: Vec<(&str, ScriptedAdapter)>) -> SocketAddr {
        let identities = IdentityTable::new(vec![
            Identity::new("token", "tester", Permissions::All, Quota::per_minute(100)),
            Identity::new(
                "local",
                "local",
                Permissions::from_list(["llama3:latest"]),
                Quota::per_minute(100),
            ),
        ])
        .unwrap();
        let mut router = ModelRouter::new(true);
        for (model, adapter) in models {
            router.bind(model, Arc::new(adapter)).unwrap();
        }
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(identities), Arc::new(router)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let server = WireServer::new(orchestrator, 1024 * 1024);
            let _ = server.serve(listener).await;
        });
        addr
    }

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest::new(model, vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn test_concurrent_completions_on_one_connection() {
        let addr = serve(vec![
            ("llama3:latest", ScriptedAdapter::replying(&["l1", "l2"])),
            ("gpt-4o", ScriptedAdapter::replying(&["g1", "g2", "g3"])),
        ])
        .await;
        let client = ContinuumClient::connect(addr).await.unwrap();

        let a = client.complete("token", request("llama3:latest")).unwrap();
        let b = client.complete("token", request("gpt-4o")).unwrap();
        assert_ne!(a.correlation_id(), b.correlation_id());

        let (a, b): (Vec<_>, Vec<_>) = tokio::join!(a.collect(), b.collect());
        let text = |chunks: Vec<Result<CompletionChunk>>| -> String {
            chunks.into_iter().map(|c| c.unwrap().delta).collect()
        };
        assert_eq!(text(a), "l1l2");
        assert_eq!(text(b), "g1g2g3");
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_rejection_surfaces_as_error() {
        let addr = serve(vec![("gpt-4o", ScriptedAdapter::replying(&["x"]))]).await;
        let client = ContinuumClient::connect(addr).await.unwrap();

        let mut forbidden = client.complete("local", request("gpt-4o")).unwrap();
        assert!(matches!(
            forbidden.next().await,
            Some(Err(GatewayError::Forbidden(_)))
        ));
        assert!(forbidden.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_frees_the_exchange() {
        let hanging = ScriptedAdapter::new(vec![Step::Chunk(CompletionChunk::delta("first"))]).hanging();
        let addr = serve(vec![("llama3:latest", hanging)]).await;
        let client = ContinuumClient::connect(addr).await.unwrap();

        let mut completion = client.complete("token", request("llama3:latest")).unwrap();
        let first = completion.next().await.unwrap().unwrap();
        assert_eq!(first.delta, "first");
        assert_eq!(client.in_flight(), 1);

        completion.cancel();
        assert_eq!(client.in_flight(), 0);

        // The connection stays usable after a cancel.
        let mut again = client.complete("token", request("llama3:latest")).unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(5), again.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(chunk.delta, "first");
    }
}
