//! Room-routed relay.
//!
//! ```text
//! session A ──┐                      ┌── session A
//!             ├── Room ── TreeStore ─┤
//! session B ──┘      └── broadcast ──┴── session B
//! ```
//!
//! Every room keeps its own replica of the document so late joiners can
//! resync against it, and remembers the last presence of each connected
//! replica so newcomers see who is already there.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use topicsync_core::{
    AwarenessUpdate, Envelope, LamportClock, MemoryStorage, MessageKind, ReplicaId,
    ResyncRequest, TreeSnapshot, TreeStore,
};

use crate::config::{RelayConfig, SyncConfig};
use crate::error::Result;
use crate::transport::{websocket_link, Link};

type RoomStore = TreeStore<MemoryStorage, LamportClock>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Relayed {
    from: u64,
    text: String,
}

struct Presence {
    conn: u64,
    text: String,
}

struct Room {
    name: String,
    store: Mutex<RoomStore>,
    presence: Mutex<HashMap<ReplicaId, Presence>>,
    fanout: broadcast::Sender<Arc<Relayed>>,
}

impl Room {
    fn new(name: &str, replica: ReplicaId, capacity: usize) -> Self {
        let (fanout, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            store: Mutex::new(TreeStore::new(
                replica,
                MemoryStorage::default(),
                LamportClock::default(),
            )),
            presence: Mutex::new(HashMap::new()),
            fanout,
        }
    }

    fn broadcast(&self, from: u64, text: String) {
        // No receivers just means nobody else is connected.
        let _ = self.fanout.send(Arc::new(Relayed { from, text }));
    }

    fn presence_texts(&self) -> Vec<String> {
        lock(&self.presence)
            .values()
            .map(|p| p.text.clone())
            .collect()
    }

    /// Handle one inbound message; the return value goes back to the sender
    /// only.
    fn handle(&self, conn: u64, relay: &ReplicaId, text: String) -> Option<String> {
        let envelope = match Envelope::decode(&text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(room = %self.name, conn, "dropping undecodable message: {err}");
                return None;
            }
        };
        match envelope.kind {
            MessageKind::Op => {
                let batch = topicsync_core::decode_operations(&envelope.payload);
                if batch.operations.is_empty() {
                    return None;
                }
                let delta = lock(&self.store).apply_remote_batch(batch.operations);
                if delta.applied + delta.buffered > 0 {
                    self.broadcast(conn, text);
                }
                None
            }
            MessageKind::Awareness => {
                let update: AwarenessUpdate = match envelope.payload_as() {
                    Ok(update) => update,
                    Err(err) => {
                        tracing::warn!(room = %self.name, conn, "dropping awareness: {err}");
                        return None;
                    }
                };
                {
                    let mut presence = lock(&self.presence);
                    if update.state.is_some() {
                        presence.insert(
                            update.replica,
                            Presence {
                                conn,
                                text: text.clone(),
                            },
                        );
                    } else {
                        presence.remove(&update.replica);
                    }
                }
                self.broadcast(conn, text);
                None
            }
            MessageKind::ResyncRequest => {
                let request: ResyncRequest = match envelope.payload_as() {
                    Ok(request) => request,
                    Err(err) => {
                        tracing::warn!(room = %self.name, conn, "dropping resync request: {err}");
                        return None;
                    }
                };
                let response = lock(&self.store).answer_resync(&request);
                match response
                    .and_then(|response| Envelope::resync_response(relay, &response))
                    .and_then(|envelope| envelope.encode())
                {
                    Ok(reply) => Some(reply),
                    Err(err) => {
                        tracing::error!(room = %self.name, conn, "failed to answer resync: {err}");
                        None
                    }
                }
            }
            MessageKind::ResyncResponse => {
                tracing::debug!(room = %self.name, conn, "ignoring resync response sent to relay");
                None
            }
        }
    }

    /// Forget presence owned by `conn` and tell everyone else it left.
    fn depart(&self, conn: u64, relay: &ReplicaId) {
        let gone: Vec<ReplicaId> = {
            let mut presence = lock(&self.presence);
            let gone: Vec<ReplicaId> = presence
                .iter()
                .filter(|(_, p)| p.conn == conn)
                .map(|(replica, _)| replica.clone())
                .collect();
            for replica in &gone {
                presence.remove(replica);
            }
            gone
        };
        for replica in gone {
            let update = AwarenessUpdate {
                replica,
                state: None,
            };
            match Envelope::awareness(relay, &update).and_then(|e| e.encode()) {
                Ok(text) => self.broadcast(conn, text),
                Err(err) => tracing::error!(room = %self.name, "failed to encode departure: {err}"),
            }
        }
    }
}

struct HubInner {
    replica: ReplicaId,
    capacity: usize,
    next_conn: AtomicU64,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
}

/// Rooms by name. Cheap to clone; clones share rooms.
#[derive(Clone)]
pub struct RelayHub {
    inner: Arc<HubInner>,
}

impl Default for RelayHub {
    fn default() -> Self {
        Self::new(RelayConfig::default().broadcast_capacity)
    }
}

impl fmt::Debug for RelayHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayHub")
            .field("replica", &self.inner.replica)
            .field("rooms", &lock(&self.inner.rooms).len())
            .finish()
    }
}

impl RelayHub {
    pub fn new(broadcast_capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                replica: ReplicaId::random(),
                capacity: broadcast_capacity,
                next_conn: AtomicU64::new(1),
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.inner.replica
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.rooms).keys().cloned().collect();
        names.sort();
        names
    }

    /// The relay's view of a room, if anyone ever joined it.
    pub fn snapshot(&self, room: &str) -> Option<TreeSnapshot> {
        let room = lock(&self.inner.rooms).get(room).cloned()?;
        let snapshot = lock(&room.store).snapshot();
        Some(snapshot)
    }

    fn room(&self, name: &str) -> Arc<Room> {
        lock(&self.inner.rooms)
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::info!(room = name, "opening room");
                Arc::new(Room::new(
                    name,
                    self.inner.replica.clone(),
                    self.inner.capacity,
                ))
            })
            .clone()
    }

    /// Serve one connection until either side goes away.
    pub async fn serve(&self, room_name: &str, mut link: Link) {
        let room = self.room(room_name);
        let relay = self.inner.replica.clone();
        let conn = self.inner.next_conn.fetch_add(1, Ordering::Relaxed);
        let mut fanout = room.fanout.subscribe();
        tracing::debug!(room = room_name, conn, "peer joined");

        for text in room.presence_texts() {
            if link.outgoing.send(text).await.is_err() {
                room.depart(conn, &relay);
                return;
            }
        }

        loop {
            tokio::select! {
                incoming = link.incoming.recv() => {
                    let Some(text) = incoming else { break };
                    if let Some(reply) = room.handle(conn, &relay, text) {
                        if link.outgoing.send(reply).await.is_err() {
                            break;
                        }
                    }
                }
                relayed = fanout.recv() => match relayed {
                    Ok(message) if message.from == conn => {}
                    Ok(message) => {
                        if link.outgoing.send(message.text.clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // The peer missed operations; dropping it forces a resync.
                        tracing::warn!(room = room_name, conn, skipped, "peer lagged, disconnecting");
                        break;
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        room.depart(conn, &relay);
        tracing::debug!(room = room_name, conn, "peer left");
    }
}

/// Map a request path to a room. The bare prefix selects `default_room`;
/// anything outside the prefix is rejected.
pub fn room_from_path(path: &str, prefix: &str, default_room: &str) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?;
    let rest = rest.trim_matches('/');
    if rest.is_empty() {
        if path.len() > prefix.len() && !path[prefix.len()..].starts_with('/') {
            return None;
        }
        return Some(default_room.to_string());
    }
    if !path[prefix.len()..].starts_with('/') || rest.contains('/') {
        return None;
    }
    Some(rest.to_string())
}

/// Websocket front end for a [`RelayHub`].
pub struct RelayServer {
    hub: RelayHub,
    config: RelayConfig,
    default_room: String,
}

impl RelayServer {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            hub: RelayHub::new(config.relay.broadcast_capacity),
            config: config.relay.clone(),
            default_room: config.room.clone(),
        }
    }

    pub fn hub(&self) -> RelayHub {
        self.hub.clone()
    }

    /// Bind the configured address and serve forever.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            path = %self.config.path,
            "relay listening"
        );
        let server = Arc::new(self);
        loop {
            let (stream, addr) = listener.accept().await?;
            let server = server.clone();
            tokio::spawn(async move {
                if let Err(err) = server.accept(stream).await {
                    tracing::debug!(%addr, "connection ended with error: {err}");
                }
            });
        }
    }

    async fn accept(&self, stream: TcpStream) -> Result<()> {
        let mut room = None;
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| {
            match room_from_path(request.uri().path(), &self.config.path, &self.default_room) {
                Some(name) => {
                    room = Some(name);
                    Ok(response)
                }
                None => {
                    tracing::debug!(path = request.uri().path(), "rejecting unknown path");
                    let mut rejection = ErrorResponse::new(Some("unknown path".to_string()));
                    *rejection.status_mut() = StatusCode::NOT_FOUND;
                    Err(rejection)
                }
            }
        })
        .await?;
        let room = room.unwrap_or_else(|| self.default_room.clone());
        self.hub.serve(&room, websocket_link(ws)).await;
        Ok(())
    }
}
