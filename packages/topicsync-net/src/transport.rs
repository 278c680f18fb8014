//! Text links to a relay.
//!
//! A [`Link`] is a pair of channels carrying encoded envelopes. The session
//! never sees sockets: a [`Connector`] hands it a fresh link per attempt, and
//! a closed `incoming` channel means the connection is gone.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::{NetError, Result};
use crate::relay::RelayHub;

/// Messages buffered in each direction of a link.
pub const LINK_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

impl Link {
    /// Two ends wired to each other.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Link {
                outgoing: a_tx,
                incoming: a_rx,
            },
            Link {
                outgoing: b_tx,
                incoming: b_rx,
            },
        )
    }
}

/// Opens links. Called again after every disconnect.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Link>> + Send;
}

/// Pump a websocket through a [`Link`]. Pings are answered by tungstenite;
/// binary frames are accepted when they hold UTF-8.
pub fn websocket_link<S>(ws: WebSocketStream<S>) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (ours, theirs) = Link::pair(LINK_CAPACITY);
    let Link {
        outgoing: to_session,
        incoming: mut from_session,
    } = theirs;

    tokio::spawn(async move {
        while let Some(text) = from_session.recv().await {
            if let Err(err) = sink.send(Message::Text(text.into())).await {
                tracing::debug!("websocket write failed: {err}");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text.as_str().to_owned(),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::warn!("dropping non UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(err) => {
                    tracing::debug!("websocket read failed: {err}");
                    break;
                }
            };
            if to_session.send(text).await.is_err() {
                break;
            }
        }
    });

    ours
}

/// Connects to `url` over plain websockets.
#[derive(Clone, Debug)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self) -> impl Future<Output = Result<Link>> + Send {
        async move {
            let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
            tracing::debug!(url = %self.url, "websocket connected");
            Ok(websocket_link(ws))
        }
    }
}

/// Connects straight into an in-process [`RelayHub`].
///
/// Connections can be cut with [`sever`](Self::sever) and refused with
/// [`set_online`](Self::set_online), which makes reconnect behavior testable
/// without sockets.
#[derive(Clone, Debug)]
pub struct MemoryConnector {
    hub: RelayHub,
    room: String,
    online: Arc<AtomicBool>,
    kill: broadcast::Sender<()>,
}

impl MemoryConnector {
    pub fn new(hub: RelayHub, room: impl Into<String>) -> Self {
        let (kill, _) = broadcast::channel(1);
        Self {
            hub,
            room: room.into(),
            online: Arc::new(AtomicBool::new(true)),
            kill,
        }
    }

    /// While offline, connection attempts are refused.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Drop every live connection made through this connector.
    pub fn sever(&self) {
        let _ = self.kill.send(());
    }
}

impl Connector for MemoryConnector {
    fn connect(&self) -> impl Future<Output = Result<Link>> + Send {
        let online = self.online.load(Ordering::SeqCst);
        let hub = self.hub.clone();
        let room = self.room.clone();
        let mut kill = self.kill.subscribe();
        async move {
            if !online {
                return Err(NetError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "relay offline",
                )));
            }
            let (client, server) = Link::pair(LINK_CAPACITY);
            tokio::spawn(async move {
                tokio::select! {
                    _ = hub.serve(&room, server) => {}
                    _ = kill.recv() => tracing::debug!(room = %room, "memory link severed"),
                }
            });
            Ok(client)
        }
    }
}
