//! Document server
//!
//! Hosts any [`DocumentBackend`] over WebSocket for [`WsBackend`](super::WsBackend)
//! clients. Each connection must authenticate before touching collections and
//! receives every change event of the backend.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::backend::DocumentBackend;
use super::error::RemoteError;
use super::message::{ClientMessage, Reply, Request, ServerMessage};

/// Accept connections until the listener fails
pub async fn serve(listener: TcpListener, backend: Arc<dyn DocumentBackend>) -> Result<(), RemoteError> {
    let addr = listener.local_addr().map_err(RemoteError::transport)?;
    info!("Document server listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await.map_err(RemoteError::transport)?;
        let backend = backend.clone();
        tokio::spawn(async move {
            debug!("Accepted connection from {}", peer);
            match handle_connection(stream, backend).await {
                Ok(()) => debug!("Connection from {} closed", peer),
                Err(e) => warn!("Connection from {} failed: {}", peer, e),
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    backend: Arc<dyn DocumentBackend>,
) -> Result<(), RemoteError> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(RemoteError::transport)?;
    let (mut write, mut read) = ws_stream.split();
    let mut changes = backend.subscribe();
    let mut authenticated = false;

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Binary(data))) => {
                        let message = match ClientMessage::decode(&data) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("Ignoring undecodable request: {}", e);
                                continue;
                            }
                        };
                        let reply = if authenticated || permitted_before_login(&message.request) {
                            let is_login = matches!(message.request, Request::Authenticate { .. });
                            let reply = dispatch(backend.as_ref(), message.request).await;
                            if is_login && reply == Reply::Done {
                                authenticated = true;
                            }
                            reply
                        } else {
                            Reply::Failed {
                                error: RemoteError::AuthFailure("not authenticated".into()),
                            }
                        };
                        let frame = ServerMessage::Reply { id: message.id, reply }.encode()?;
                        write
                            .send(Message::Binary(frame))
                            .await
                            .map_err(RemoteError::transport)?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(RemoteError::transport(e)),
                }
            }

            event = changes.recv() => {
                match event {
                    Ok(event) => {
                        if !authenticated {
                            continue;
                        }
                        let frame = ServerMessage::Change { event }.encode()?;
                        write
                            .send(Message::Binary(frame))
                            .await
                            .map_err(RemoteError::transport)?;
                    }
                    Err(RecvError::Lagged(n)) => warn!("Connection missed {} change events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

fn permitted_before_login(request: &Request) -> bool {
    matches!(request, Request::Authenticate { .. } | Request::ServerTime)
}

async fn dispatch(backend: &dyn DocumentBackend, request: Request) -> Reply {
    let result = match request {
        Request::Authenticate { credentials } => {
            backend.authenticate(&credentials).await.map(|_| Reply::Done)
        }
        Request::EnsureExpiryIndex { collection, field } => backend
            .ensure_expiry_index(&collection, &field)
            .await
            .map(|_| Reply::Done),
        Request::Find { collection, filter } => backend
            .find(&collection, &filter)
            .await
            .map(|documents| Reply::Documents { documents }),
        Request::Insert {
            collection,
            document,
        } => backend
            .insert(&collection, document)
            .await
            .map(|id| Reply::Inserted { id }),
        Request::DeleteIds { collection, ids } => backend
            .delete_ids(&collection, &ids)
            .await
            .map(|count| Reply::Count {
                count: count as u64,
            }),
        Request::UpsertBy {
            collection,
            key,
            document,
        } => backend
            .upsert_by(&collection, &key, document)
            .await
            .map(|_| Reply::Done),
        Request::SetFieldAll {
            collection,
            field,
            value,
        } => backend
            .set_field_all(&collection, &field, value)
            .await
            .map(|count| Reply::Count {
                count: count as u64,
            }),
        Request::ServerTime => backend.server_time().await.map(|now| Reply::Time { now }),
    };

    result.unwrap_or_else(|error| Reply::Failed { error })
}
