//! Loopback-Broker - Vermittlung innerhalb eines Prozesses
//!
//! Ein [`LoopbackNetwork`] verbindet beliebig viele [`LoopbackBroker`]
//! Endpunkte. Kanäle und Calls werden direkt zwischen den Endpunkten
//! verdrahtet, unbekannte Gegenstellen schlagen als `PeerUnavailable` fehl.

use super::collaborator::{
    Broker, BrokerError, BrokerEvent, ControlChannel, Identity, MediaCall, RemoteStream,
};
use crate::media::MediaHandle;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use uuid::Uuid;

/// Kapazität des Event-Kanals pro Endpunkt
const EVENT_CAPACITY: usize = 100;

// ============================================================================
// CONTROL CHANNEL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum LinkState {
    Opening,
    Open,
    Closed,
    Failed(BrokerError),
}

impl LinkState {
    fn is_settled(&self) -> bool {
        !matches!(self, Self::Opening)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

/// Ein Ende eines Loopback-Control-Kanals
pub struct LoopbackChannel {
    remote: Identity,
    link: Arc<watch::Sender<LinkState>>,
    outbound: mpsc::UnboundedSender<String>,
    inbound: AsyncMutex<mpsc::UnboundedReceiver<String>>,
}

fn channel_pair(a: Identity, b: Identity) -> (Arc<LoopbackChannel>, Arc<LoopbackChannel>) {
    let (link, _) = watch::channel(LinkState::Opening);
    let link = Arc::new(link);
    let (to_b, from_a) = mpsc::unbounded_channel();
    let (to_a, from_b) = mpsc::unbounded_channel();

    let a_end = LoopbackChannel {
        remote: b,
        link: Arc::clone(&link),
        outbound: to_b,
        inbound: AsyncMutex::new(from_b),
    };
    let b_end = LoopbackChannel {
        remote: a,
        link,
        outbound: to_a,
        inbound: AsyncMutex::new(from_a),
    };
    (Arc::new(a_end), Arc::new(b_end))
}

async fn wait_terminal(link: &mut watch::Receiver<LinkState>) {
    let _ = link.wait_for(LinkState::is_terminal).await;
}

impl LoopbackChannel {
    fn settle(&self, state: LinkState) {
        self.link.send_if_modified(|current| {
            if current.is_settled() {
                return false;
            }
            *current = state;
            true
        });
    }
}

#[async_trait]
impl ControlChannel for LoopbackChannel {
    fn remote(&self) -> &Identity {
        &self.remote
    }

    async fn opened(&self) -> Result<(), BrokerError> {
        let mut rx = self.link.subscribe();
        let state = rx
            .wait_for(LinkState::is_settled)
            .await
            .map(|state| (*state).clone());

        match state {
            Ok(LinkState::Open) => Ok(()),
            Ok(LinkState::Failed(err)) => Err(err),
            _ => Err(BrokerError::ChannelClosed),
        }
    }

    fn is_open(&self) -> bool {
        *self.link.borrow() == LinkState::Open
    }

    fn send(&self, frame: String) -> Result<(), BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| BrokerError::ChannelClosed)
    }

    async fn recv(&self) -> Option<String> {
        let mut inbound = self.inbound.lock().await;
        let mut link = self.link.subscribe();

        tokio::select! {
            biased;
            frame = inbound.recv() => frame,
            _ = wait_terminal(&mut link) => None,
        }
    }

    fn close(&self) {
        self.link.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = LinkState::Closed;
            true
        });
    }
}

// ============================================================================
// MEDIA CALL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamState {
    Pending,
    Ready(RemoteStream),
    Closed,
    Failed(BrokerError),
}

impl StreamState {
    fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }
}

struct CallLink {
    /// Sicht des Anrufers auf die Gegenseite
    to_caller: watch::Sender<StreamState>,
    /// Sicht des Angerufenen auf die Gegenseite
    to_callee: watch::Sender<StreamState>,
    offer: RemoteStream,
    answered: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Caller,
    Callee,
}

/// Ein Ende eines Loopback-Media-Calls
pub struct LoopbackCall {
    local: Identity,
    remote: Identity,
    role: Role,
    link: Arc<CallLink>,
}

fn call_pair(
    caller: Identity,
    callee: Identity,
    offer: RemoteStream,
) -> (Arc<LoopbackCall>, Arc<LoopbackCall>) {
    let (to_caller, _) = watch::channel(StreamState::Pending);
    let (to_callee, _) = watch::channel(StreamState::Pending);
    let link = Arc::new(CallLink {
        to_caller,
        to_callee,
        offer,
        answered: AtomicBool::new(false),
    });

    let caller_end = LoopbackCall {
        local: caller.clone(),
        remote: callee.clone(),
        role: Role::Caller,
        link: Arc::clone(&link),
    };
    let callee_end = LoopbackCall {
        local: callee,
        remote: caller,
        role: Role::Callee,
        link,
    };
    (Arc::new(caller_end), Arc::new(callee_end))
}

fn settle_stream(view: &watch::Sender<StreamState>, state: StreamState) {
    view.send_if_modified(|current| {
        if *current != StreamState::Pending {
            return false;
        }
        *current = state;
        true
    });
}

impl LoopbackCall {
    fn own_view(&self) -> &watch::Sender<StreamState> {
        match self.role {
            Role::Caller => &self.link.to_caller,
            Role::Callee => &self.link.to_callee,
        }
    }

    fn fail(&self, err: BrokerError) {
        settle_stream(&self.link.to_caller, StreamState::Failed(err.clone()));
        settle_stream(&self.link.to_callee, StreamState::Failed(err));
    }
}

#[async_trait]
impl MediaCall for LoopbackCall {
    fn remote(&self) -> &Identity {
        &self.remote
    }

    fn answer(&self, local: Option<MediaHandle>) -> Result<(), BrokerError> {
        if self.role == Role::Caller {
            return Err(BrokerError::ConnectionFailed(
                "cannot answer an outgoing call".to_string(),
            ));
        }
        if self.link.to_callee.borrow().is_terminal() {
            return Err(BrokerError::CallClosed);
        }
        if self.link.answered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let answer = RemoteStream {
            peer: self.local.clone(),
            stream_id: local
                .as_ref()
                .map(|handle| handle.id().to_string())
                .unwrap_or_else(|| format!("recvonly-{}", Uuid::new_v4())),
            tracks: local.map(|handle| handle.track_kinds()).unwrap_or_default(),
        };

        settle_stream(&self.link.to_caller, StreamState::Ready(answer));
        settle_stream(
            &self.link.to_callee,
            StreamState::Ready(self.link.offer.clone()),
        );
        Ok(())
    }

    async fn remote_stream(&self) -> Result<RemoteStream, BrokerError> {
        let mut rx = self.own_view().subscribe();
        let state = rx
            .wait_for(|state| *state != StreamState::Pending)
            .await
            .map(|state| (*state).clone());

        match state {
            Ok(StreamState::Ready(stream)) => Ok(stream),
            Ok(StreamState::Failed(err)) => Err(err),
            _ => Err(BrokerError::CallClosed),
        }
    }

    fn close(&self) {
        for view in [&self.link.to_caller, &self.link.to_callee] {
            view.send_if_modified(|current| {
                if current.is_terminal() {
                    return false;
                }
                *current = StreamState::Closed;
                true
            });
        }
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Rendezvous-Punkt für Loopback-Endpunkte
#[derive(Default)]
pub struct LoopbackNetwork {
    peers: Mutex<HashMap<Identity, broadcast::Sender<BrokerEvent>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Endpunkt mit zufälliger Identität
    pub fn endpoint(self: &Arc<Self>) -> LoopbackBroker {
        LoopbackBroker::new(Arc::clone(self), None)
    }

    /// Endpunkt mit fester Identität
    pub fn endpoint_with_identity(self: &Arc<Self>, identity: impl Into<Identity>) -> LoopbackBroker {
        LoopbackBroker::new(Arc::clone(self), Some(identity.into()))
    }

    pub fn is_registered(&self, identity: &Identity) -> bool {
        self.peers.lock().contains_key(identity)
    }

    fn register(
        &self,
        identity: Identity,
        events: broadcast::Sender<BrokerEvent>,
    ) -> Result<(), BrokerError> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&identity) {
            return Err(BrokerError::ConnectionFailed(format!(
                "identity {} is already taken",
                identity
            )));
        }
        peers.insert(identity, events);
        Ok(())
    }

    fn unregister(&self, identity: &Identity) {
        self.peers.lock().remove(identity);
    }

    fn deliver(&self, to: &Identity, event: BrokerEvent) -> Result<(), BrokerError> {
        let peers = self.peers.lock();
        let events = peers
            .get(to)
            .ok_or_else(|| BrokerError::PeerUnavailable(to.clone()))?;
        events
            .send(event)
            .map(|_| ())
            .map_err(|_| BrokerError::PeerUnavailable(to.clone()))
    }
}

// ============================================================================
// BROKER ENDPOINT
// ============================================================================

/// Ein Endpunkt im Loopback-Netz
pub struct LoopbackBroker {
    network: Arc<LoopbackNetwork>,
    requested: Option<Identity>,
    identity: Mutex<Option<Identity>>,
    events: broadcast::Sender<BrokerEvent>,
    destroyed: AtomicBool,
    connects: AtomicUsize,
    calls: AtomicUsize,
    destroys: AtomicUsize,
}

impl LoopbackBroker {
    fn new(network: Arc<LoopbackNetwork>, requested: Option<Identity>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            network,
            requested,
            identity: Mutex::new(None),
            events,
            destroyed: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        }
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Anzahl der `connect()`-Aufrufe
    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Anzahl der `call()`-Aufrufe
    pub fn call_attempts(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Anzahl der `destroy()`-Aufrufe
    pub fn destroy_calls(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn local_identity(&self) -> Result<Identity, BrokerError> {
        if self.is_destroyed() {
            return Err(BrokerError::Destroyed);
        }
        self.identity
            .lock()
            .clone()
            .ok_or_else(|| BrokerError::ConnectionFailed("broker is not open".to_string()))
    }
}

#[async_trait]
impl Broker for LoopbackBroker {
    async fn open(&self) -> Result<Identity, BrokerError> {
        if self.is_destroyed() {
            return Err(BrokerError::Destroyed);
        }

        let mut identity = self.identity.lock();
        if let Some(existing) = identity.as_ref() {
            return Ok(existing.clone());
        }

        let assigned = self
            .requested
            .clone()
            .unwrap_or_else(|| Identity::new(Uuid::new_v4().to_string()));
        self.network.register(assigned.clone(), self.events.clone())?;

        tracing::info!("Loopback endpoint opened as {}", assigned);
        *identity = Some(assigned.clone());
        Ok(assigned)
    }

    fn connect(&self, remote: &Identity) -> Result<Arc<dyn ControlChannel>, BrokerError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let local = self.local_identity()?;

        let (near, far) = channel_pair(local, remote.clone());
        match self.network.deliver(remote, BrokerEvent::Connection(far)) {
            Ok(()) => near.settle(LinkState::Open),
            Err(err) => {
                tracing::warn!("Control channel to {} failed: {}", remote, err);
                near.settle(LinkState::Failed(err));
            }
        }

        Ok(near)
    }

    fn call(
        &self,
        remote: &Identity,
        local: MediaHandle,
    ) -> Result<Arc<dyn MediaCall>, BrokerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let me = self.local_identity()?;

        let offer = RemoteStream {
            peer: me.clone(),
            stream_id: local.id().to_string(),
            tracks: local.track_kinds(),
        };
        let (caller, callee) = call_pair(me, remote.clone(), offer);

        if let Err(err) = self.network.deliver(remote, BrokerEvent::Call(callee)) {
            tracing::warn!("Media call to {} failed: {}", remote, err);
            caller.fail(err);
        }

        Ok(caller)
    }

    fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    fn destroy(&self) {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(identity) = self.identity.lock().as_ref() {
            self.network.unregister(identity);
            tracing::info!("Loopback endpoint {} destroyed", identity);
        }
        let _ = self.events.send(BrokerEvent::Disconnected);
    }
}

impl std::fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("identity", &self.identity())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
