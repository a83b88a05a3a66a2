//! WebSocket document backend
//!
//! Client side of the document service. One background task owns the socket:
//! it writes queued requests, routes replies back to their callers by id and
//! fans change events out to subscribers. Dropping the backend stops the task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::backend::{ChangeEvent, Document, DocumentBackend, Filter};
use super::credentials::Credentials;
use super::error::RemoteError;
use super::message::{ClientMessage, Reply, Request, ServerMessage};

/// Default time to wait for a reply
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Pending = (ClientMessage, oneshot::Sender<Reply>);

/// Document backend reached over a WebSocket
pub struct WsBackend {
    url: String,
    outgoing: mpsc::Sender<Pending>,
    changes: broadcast::Sender<ChangeEvent>,
    next_id: AtomicU64,
    timeout: Duration,
    task: JoinHandle<()>,
}

impl WsBackend {
    /// Connect to a document server
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        debug!("Connecting to {}", url);
        let (ws_stream, _response) = connect_async(url).await.map_err(|e| {
            RemoteError::Transport(format!("failed to connect to {}: {}", url, e))
        })?;
        info!("Connected to document server at {}", url);

        let (outgoing, requests) = mpsc::channel(64);
        let (changes, _) = broadcast::channel(1024);
        let task = tokio::spawn(connection_loop(ws_stream, requests, changes.clone()));

        Ok(Self {
            url: url.to_string(),
            outgoing,
            changes,
            next_id: AtomicU64::new(1),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            task,
        })
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, request: Request) -> Result<Reply, RemoteError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.outgoing
            .send((ClientMessage { id, request }, reply_tx))
            .await
            .map_err(|_| RemoteError::Transport("connection closed".into()))?;

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(Reply::Failed { error })) => Err(error),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RemoteError::Transport("connection closed".into())),
            Err(_) => Err(RemoteError::Transport(format!(
                "no reply from {} within {:?}",
                self.url, self.timeout
            ))),
        }
    }
}

impl Drop for WsBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn unexpected(reply: Reply) -> RemoteError {
    RemoteError::Protocol(format!("unexpected reply {:?}", reply))
}

#[async_trait]
impl DocumentBackend for WsBackend {
    async fn authenticate(&self, credentials: &Credentials) -> Result<(), RemoteError> {
        match self
            .call(Request::Authenticate {
                credentials: credentials.clone(),
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn ensure_expiry_index(&self, collection: &str, field: &str) -> Result<(), RemoteError> {
        match self
            .call(Request::EnsureExpiryIndex {
                collection: collection.to_string(),
                field: field.to_string(),
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<Document>, RemoteError> {
        match self
            .call(Request::Find {
                collection: collection.to_string(),
                filter: filter.clone(),
            })
            .await?
        {
            Reply::Documents { documents } => Ok(documents),
            other => Err(unexpected(other)),
        }
    }

    async fn insert(&self, collection: &str, document: Document) -> Result<String, RemoteError> {
        match self
            .call(Request::Insert {
                collection: collection.to_string(),
                document,
            })
            .await?
        {
            Reply::Inserted { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_ids(&self, collection: &str, ids: &[String]) -> Result<usize, RemoteError> {
        match self
            .call(Request::DeleteIds {
                collection: collection.to_string(),
                ids: ids.to_vec(),
            })
            .await?
        {
            Reply::Count { count } => Ok(count as usize),
            other => Err(unexpected(other)),
        }
    }

    async fn upsert_by(
        &self,
        collection: &str,
        key: &str,
        document: Document,
    ) -> Result<(), RemoteError> {
        match self
            .call(Request::UpsertBy {
                collection: collection.to_string(),
                key: key.to_string(),
                document,
            })
            .await?
        {
            Reply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn set_field_all(
        &self,
        collection: &str,
        field: &str,
        value: Value,
    ) -> Result<usize, RemoteError> {
        match self
            .call(Request::SetFieldAll {
                collection: collection.to_string(),
                field: field.to_string(),
                value,
            })
            .await?
        {
            Reply::Count { count } => Ok(count as usize),
            other => Err(unexpected(other)),
        }
    }

    async fn server_time(&self) -> Result<f64, RemoteError> {
        match self.call(Request::ServerTime).await? {
            Reply::Time { now } => Ok(now),
            other => Err(unexpected(other)),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

/// Own the socket until either side closes it
///
/// Callers still waiting when the loop ends see their reply channel close.
async fn connection_loop(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut requests: mpsc::Receiver<Pending>,
    changes: broadcast::Sender<ChangeEvent>,
) {
    let (mut write, mut read) = ws_stream.split();
    let mut pending: HashMap<u64, oneshot::Sender<Reply>> = HashMap::new();

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some((message, reply_tx)) = request else {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                };
                let bytes = match message.encode() {
                    Ok(bytes) => bytes,
                    Err(error) => {
                        let _ = reply_tx.send(Reply::Failed { error });
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Binary(bytes)).await {
                    warn!("Failed to send request: {}", e);
                    let _ = reply_tx.send(Reply::Failed { error: RemoteError::transport(e) });
                    break;
                }
                pending.insert(message.id, reply_tx);
            }

            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                        Ok(ServerMessage::Reply { id, reply }) => {
                            if let Some(reply_tx) = pending.remove(&id) {
                                let _ = reply_tx.send(reply);
                            } else {
                                debug!("Reply for unknown request {}", id);
                            }
                        }
                        Ok(ServerMessage::Change { event }) => {
                            // No subscribers is fine
                            let _ = changes.send(event);
                        }
                        Err(e) => warn!("Ignoring undecodable frame: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Document server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
}
