//! Reconnecting sync session.
//!
//! ```text
//! Disconnected ─▶ Connecting ─▶ Syncing ─▶ Live
//!       ▲              │            │        │
//!       └──────────────┴────────────┴────────┘   (link lost, backoff)
//!
//! any state ── close() ──▶ Closed
//! ```
//!
//! A background task owns the link. Local edits land in the shared document
//! immediately and are flushed once the session is live; anything made while
//! offline reaches the relay through the resync push-back on the next
//! connection.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use topicsync_core::{
    AwarenessManager, AwarenessState, AwarenessUpdate, ChangeBatch, Direction, Document,
    Envelope, MessageKind, NodeId, ReplicaId, ResyncRequest, ResyncResponse, Selection,
    SubscriptionId, TopicStore, TreeSnapshot,
};

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{NetError, Result};
use crate::relay::lock;
use crate::transport::{Connector, Link};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Connected; waiting for the resync response.
    Syncing,
    Live,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Syncing => "syncing",
            ConnectionState::Live => "live",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
enum Command {
    Flush,
    Presence,
    Close(oneshot::Sender<()>),
}

/// The document behind a session. Mutations apply locally at once and are
/// queued for the relay.
///
/// Subscriber callbacks run while the document lock is held; they must not
/// call back into the same `SharedDocument`.
#[derive(Clone)]
pub struct SharedDocument {
    inner: Arc<Mutex<Document>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SharedDocument {
    /// Run `f` against the current document.
    pub fn read<R>(&self, f: impl FnOnce(&Document) -> R) -> R {
        f(&lock(&self.inner))
    }

    pub fn replica_id(&self) -> ReplicaId {
        lock(&self.inner).replica_id().clone()
    }

    fn flush(&self) {
        // A closed channel means the session ended; edits stay local.
        let _ = self.commands.send(Command::Flush);
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Document) -> topicsync_core::Result<R>) -> topicsync_core::Result<R> {
        let result = f(&mut lock(&self.inner));
        if result.is_ok() {
            self.flush();
        }
        result
    }
}

impl fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDocument")
            .field("replica", &self.replica_id())
            .finish()
    }
}

impl TopicStore for SharedDocument {
    fn create_application(&mut self, name: &str, description: &str) -> topicsync_core::Result<NodeId> {
        self.mutate(|doc| doc.create_application(name, description))
    }

    fn create_topic(
        &mut self,
        application: &NodeId,
        name: &str,
        proto: &str,
        direction: Direction,
        description: &str,
    ) -> topicsync_core::Result<NodeId> {
        self.mutate(|doc| doc.create_topic(application, name, proto, direction, description))
    }

    fn update(&mut self, node: &NodeId, attributes: Vec<(String, String)>) -> topicsync_core::Result<()> {
        self.mutate(|doc| doc.update(node, attributes))
    }

    fn remove(&mut self, node: &NodeId) -> topicsync_core::Result<()> {
        self.mutate(|doc| doc.remove(node))
    }

    fn snapshot(&self) -> TreeSnapshot {
        lock(&self.inner).snapshot()
    }

    fn subscribe(&mut self, callback: Box<dyn Fn(&ChangeBatch) + Send + Sync>) -> SubscriptionId {
        lock(&self.inner).subscribe(callback)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        lock(&self.inner).unsubscribe(id)
    }
}

/// Wall time anchored once and advanced by the runtime's monotonic clock,
/// so presence stamps never step backwards with the system clock.
#[derive(Clone, Copy, Debug)]
struct SessionClock {
    wall: DateTime<Utc>,
    started: Instant,
}

impl SessionClock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::MAX);
        self.wall.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    document: SharedDocument,
    clock: SessionClock,
    awareness: Arc<Mutex<AwarenessManager>>,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    /// Start syncing `document` through `connector`. Must be called inside a
    /// tokio runtime.
    pub fn spawn<C: Connector>(connector: C, document: Document, config: &SyncConfig) -> Self {
        let replica = document.replica_id().clone();
        let clock = SessionClock::start();
        let mut local = AwarenessState::new(replica.clone(), clock.now());
        if let Some(name) = &config.display_name {
            local = local.with_display_name(name.clone());
        }
        let awareness = Arc::new(Mutex::new(AwarenessManager::new(
            local,
            config.awareness.liveness(),
        )));
        let document = Arc::new(Mutex::new(document));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = Actor {
            connector: Arc::new(connector),
            document: document.clone(),
            awareness: awareness.clone(),
            commands: commands_rx,
            state: state_tx,
            backoff: Backoff::new(config.reconnect),
            config: config.clone(),
            replica,
            clock,
        };
        let task = tokio::spawn(actor.run());

        Self {
            document: SharedDocument {
                inner: document,
                commands: commands_tx.clone(),
            },
            clock,
            awareness,
            commands: commands_tx,
            state: state_rx,
            task: Some(task),
        }
    }

    pub fn document(&self) -> SharedDocument {
        self.document.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| NetError::Closed)
    }

    pub fn local_presence(&self) -> AwarenessState {
        lock(&self.awareness).local_state().clone()
    }

    /// Replace the local presence and broadcast it.
    pub fn set_local_presence(&self, state: AwarenessState) {
        lock(&self.awareness).set_local_state(state, self.clock.now());
        let _ = self.commands.send(Command::Presence);
    }

    pub fn set_selection(&self, selection: Option<Selection>) {
        {
            let mut awareness = lock(&self.awareness);
            let state = awareness
                .local_state()
                .clone()
                .with_selection(selection);
            awareness.set_local_state(state, self.clock.now());
        }
        let _ = self.commands.send(Command::Presence);
    }

    /// Remote presence, ordered by replica id.
    pub fn peers(&self) -> Vec<AwarenessState> {
        lock(&self.awareness).peers().into_iter().cloned().collect()
    }

    pub fn subscribe_presence(
        &self,
        callback: impl Fn(&topicsync_core::AwarenessChange) + Send + Sync + 'static,
    ) -> SubscriptionId {
        lock(&self.awareness).subscribe(callback)
    }

    pub fn unsubscribe_presence(&self, id: SubscriptionId) -> bool {
        lock(&self.awareness).unsubscribe(id)
    }

    /// Announce departure, stop reconnecting and wait for the task to end.
    pub async fn close(mut self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Close(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!("session task ended abnormally: {err}");
            }
        }
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum LinkEnd {
    Lost,
    Closed(Option<oneshot::Sender<()>>),
}

enum Step {
    Continue,
    Lost,
}

struct Actor<C: Connector> {
    connector: Arc<C>,
    document: Arc<Mutex<Document>>,
    awareness: Arc<Mutex<AwarenessManager>>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    config: SyncConfig,
    replica: ReplicaId,
    clock: SessionClock,
}

impl<C: Connector> Actor<C> {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "connection state");
        }
    }

    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);
            let connector = self.connector.clone();
            let connect = connector.connect();
            tokio::pin!(connect);
            let attempt = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = self.commands.recv() => match command {
                        Some(Command::Close(done)) => return self.finish(Some(done)),
                        None => return self.finish(None),
                        // Offline edits reach the relay through resync.
                        Some(Command::Flush) => self.discard_outbox(),
                        Some(Command::Presence) => {}
                    },
                }
            };

            match attempt {
                Ok(link) => match self.run_link(link).await {
                    LinkEnd::Closed(done) => return self.finish(done),
                    LinkEnd::Lost => {
                        tracing::info!(room = %self.config.room, "connection lost");
                        lock(&self.awareness).clear_remote();
                    }
                },
                Err(err) => {
                    let err = err.into_transport();
                    tracing::warn!(room = %self.config.room, "connect failed: {err}");
                }
            }

            self.set_state(ConnectionState::Disconnected);
            let delay = self.backoff.next_delay();
            tracing::debug!(?delay, "reconnecting after backoff");
            let wake = time::sleep(delay);
            tokio::pin!(wake);
            loop {
                tokio::select! {
                    _ = &mut wake => break,
                    command = self.commands.recv() => match command {
                        Some(Command::Close(done)) => return self.finish(Some(done)),
                        None => return self.finish(None),
                        Some(Command::Flush) => self.discard_outbox(),
                        Some(Command::Presence) => {}
                    },
                }
            }
        }
    }

    fn finish(&self, done: Option<oneshot::Sender<()>>) {
        lock(&self.awareness).clear_remote();
        self.set_state(ConnectionState::Closed);
        if let Some(done) = done {
            let _ = done.send(());
        }
    }

    fn discard_outbox(&self) {
        lock(&self.document).take_outbox();
    }

    async fn send(&self, link: &Link, envelope: topicsync_core::Result<Envelope>) -> bool {
        match envelope.and_then(|envelope| envelope.encode()) {
            Ok(text) => link.outgoing.send(text).await.is_ok(),
            Err(err) => {
                tracing::error!("failed to encode message: {err}");
                true
            }
        }
    }

    async fn send_resync_request(&self, link: &Link, request: &ResyncRequest) -> bool {
        tracing::debug!(bootstrap = request.is_bootstrap(), "requesting resync");
        self.send(link, Envelope::resync_request(&self.replica, request))
            .await
    }

    async fn run_link(&mut self, mut link: Link) -> LinkEnd {
        self.set_state(ConnectionState::Syncing);

        let hello = lock(&self.awareness).heartbeat(self.clock.now());
        if !self.send(&link, Envelope::awareness(&self.replica, &hello)).await {
            return LinkEnd::Lost;
        }
        let request = lock(&self.document).resync_request();
        if !self.send_resync_request(&link, &request).await {
            return LinkEnd::Lost;
        }

        let timeout = self.config.resync_timeout();
        let mut resync_deadline = Some(Instant::now() + timeout);
        let mut bootstrap_requested = request.is_bootstrap();
        let period = self.config.awareness.heartbeat();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);

        loop {
            let deadline = resync_deadline;
            tokio::select! {
                incoming = link.incoming.recv() => {
                    let Some(text) = incoming else { return LinkEnd::Lost };
                    match self.handle_incoming(&link, &text, &mut resync_deadline).await {
                        Step::Continue => {}
                        Step::Lost => return LinkEnd::Lost,
                    }
                }
                _ = until(deadline) => {
                    let err = topicsync_core::Error::ResyncTimeout(timeout.as_millis() as u64);
                    if bootstrap_requested {
                        tracing::warn!("{err}; dropping connection");
                        return LinkEnd::Lost;
                    }
                    tracing::warn!("{err}; falling back to bootstrap");
                    bootstrap_requested = true;
                    resync_deadline = Some(Instant::now() + timeout);
                    if !self.send_resync_request(&link, &ResyncRequest::bootstrap()).await {
                        return LinkEnd::Lost;
                    }
                }
                _ = heartbeat.tick() => {
                    let now = self.clock.now();
                    let update = lock(&self.awareness).heartbeat(now);
                    lock(&self.awareness).evict_stale(now);
                    if !self.send(&link, Envelope::awareness(&self.replica, &update)).await {
                        return LinkEnd::Lost;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(Command::Flush) => {
                        if !self.flush(&link).await {
                            return LinkEnd::Lost;
                        }
                    }
                    Some(Command::Presence) => {
                        let update = lock(&self.awareness).local_update();
                        if !self.send(&link, Envelope::awareness(&self.replica, &update)).await {
                            return LinkEnd::Lost;
                        }
                    }
                    // No handles left behaves like close().
                    command @ (Some(Command::Close(_)) | None) => {
                        let farewell = lock(&self.awareness).removal_update();
                        self.send(&link, Envelope::awareness(&self.replica, &farewell)).await;
                        return LinkEnd::Closed(match command {
                            Some(Command::Close(done)) => Some(done),
                            _ => None,
                        });
                    }
                },
            }
        }
    }

    /// Send the outbox once live. Before that the resync push-back carries it.
    async fn flush(&self, link: &Link) -> bool {
        let live = *self.state.borrow() == ConnectionState::Live;
        let ops = lock(&self.document).take_outbox();
        if !live || ops.is_empty() {
            return true;
        }
        tracing::trace!(count = ops.len(), "flushing local operations");
        self.send(link, Envelope::operations(&self.replica, &ops)).await
    }

    async fn handle_incoming(
        &mut self,
        link: &Link,
        text: &str,
        resync_deadline: &mut Option<Instant>,
    ) -> Step {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!("dropping undecodable message: {err}");
                return Step::Continue;
            }
        };
        if envelope.sender == self.replica {
            return Step::Continue;
        }

        match envelope.kind {
            MessageKind::Op => {
                let batch = topicsync_core::decode_operations(&envelope.payload);
                if !batch.operations.is_empty() {
                    let delta = lock(&self.document).apply_remote(batch.operations);
                    tracing::trace!(
                        applied = delta.applied,
                        buffered = delta.buffered,
                        duplicates = delta.duplicates,
                        "merged remote operations"
                    );
                }
                Step::Continue
            }
            MessageKind::Awareness => {
                match envelope.payload_as::<AwarenessUpdate>() {
                    Ok(update) => {
                        lock(&self.awareness).apply_remote(update, self.clock.now());
                    }
                    Err(err) => tracing::warn!("dropping awareness update: {err}"),
                }
                Step::Continue
            }
            MessageKind::ResyncResponse => {
                let response = match envelope.payload_as::<ResyncResponse>() {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!("dropping resync response: {err}");
                        return Step::Continue;
                    }
                };
                let outcome = {
                    let mut document = lock(&self.document);
                    let outcome = document.apply_resync(response);
                    // The push-back covers every local edit the relay lacks.
                    document.take_outbox();
                    outcome
                };
                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!("failed to apply resync response: {err}");
                        return Step::Lost;
                    }
                };
                if !outcome.push_back.is_empty()
                    && !self
                        .send(link, Envelope::operations(&self.replica, &outcome.push_back))
                        .await
                {
                    return Step::Lost;
                }
                tracing::info!(
                    room = %self.config.room,
                    applied = outcome.delta.applied,
                    pushed = outcome.push_back.len(),
                    "resync complete"
                );
                *resync_deadline = None;
                self.backoff.reset();
                self.set_state(ConnectionState::Live);
                Step::Continue
            }
            MessageKind::ResyncRequest => {
                let response = match envelope.payload_as::<ResyncRequest>() {
                    Ok(request) => lock(&self.document).answer_resync(&request),
                    Err(err) => {
                        tracing::warn!("dropping resync request: {err}");
                        return Step::Continue;
                    }
                };
                match response {
                    Ok(response) => {
                        if !self
                            .send(link, Envelope::resync_response(&self.replica, &response))
                            .await
                        {
                            return Step::Lost;
                        }
                    }
                    Err(err) => tracing::error!("failed to answer resync request: {err}"),
                }
                Step::Continue
            }
        }
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_display_lowercase() {
        assert_eq!(ConnectionState::Syncing.to_string(), "syncing");
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }
}
