//! Call Engine - Session-Lebenszyklus
//!
//! Orchestriert ausgehende und eingehende Anrufe über den Broker, hält den
//! Control-Kanal und den Media-Call der aktuellen Session und gleicht
//! lokale und entfernte Schalter ab.
//!
//! Jede verzögerte Continuation (Kanal-Öffnung, Remote-Stream, verzögerte
//! Annahme, Timeout) prüft vor dem Handeln, ob ihre Session noch lebt.
//! `leave_call()` ist der einzige Abbruch-Mechanismus.

use super::error::SessionError;
use super::state::{CallStatus, Notice, SessionEvent, SessionState};
use crate::broker::{Broker, BrokerEvent, ControlChannel, Identity, MediaCall};
use crate::config::SessionConfig;
use crate::media::{CaptureDevice, MediaAcquisition, MediaError, MediaHandle, TrackKind};
use crate::protocol::{self, ControlMessage};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

// ============================================================================
// CLIPBOARD
// ============================================================================

/// Zwischenablage der umgebenden Anwendung
pub trait Clipboard: Send + Sync {
    fn write_text(&self, text: &str) -> Result<(), String>;
}

// ============================================================================
// CALL SESSION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SessionId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

/// Gepaarter Media-Call und Control-Kanal zu einer Gegenseite
struct CallSession {
    id: SessionId,
    remote: Identity,
    status: CallStatus,
    channel: Option<Arc<dyn ControlChannel>>,
    call: Option<Arc<dyn MediaCall>>,
    tasks: Vec<JoinHandle<()>>,
}

/// Aus einer beendeten Session gelöste Ressourcen
struct Detached {
    channel: Option<Arc<dyn ControlChannel>>,
    call: Option<Arc<dyn MediaCall>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Detached {
    fn close(self) {
        if let Some(channel) = self.channel {
            channel.close();
        }
        if let Some(call) = self.call {
            call.close();
        }
        for task in self.tasks {
            task.abort();
        }
    }
}

impl CallSession {
    fn new(id: SessionId, remote: Identity) -> Self {
        Self {
            id,
            remote,
            status: CallStatus::Idle,
            channel: None,
            call: None,
            tasks: Vec::new(),
        }
    }

    fn is_live(&self, id: SessionId) -> bool {
        self.id == id && self.status.is_live()
    }

    /// Beendet die Session und löst ihre Ressourcen
    fn end(&mut self) -> Detached {
        self.status = CallStatus::Ended;
        Detached {
            channel: self.channel.take(),
            call: self.call.take(),
            tasks: std::mem::take(&mut self.tasks),
        }
    }
}

fn same_channel(a: &Arc<dyn ControlChannel>, b: &Arc<dyn ControlChannel>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// ============================================================================
// ENGINE STATE
// ============================================================================

struct EngineInner {
    session: Option<CallSession>,
    next_session: u64,
    started: bool,
    destroyed: bool,
    /// Zuletzt gemeldeter Hardware-Fehler, bis Media verfügbar wird
    media_failure: Option<SessionError>,
    background: Vec<JoinHandle<()>>,
}

impl EngineInner {
    fn live_session(&mut self, id: SessionId) -> Option<&mut CallSession> {
        if self.destroyed {
            return None;
        }
        self.session.as_mut().filter(|s| s.is_live(id))
    }

    fn is_live(&self, id: SessionId) -> bool {
        !self.destroyed && self.session.as_ref().is_some_and(|s| s.is_live(id))
    }

    fn open_session(&mut self, remote: Identity) -> SessionId {
        let id = SessionId(self.next_session);
        self.next_session += 1;
        self.session = Some(CallSession::new(id, remote));
        id
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Session-Orchestrierung über dem Broker
pub struct CallEngine {
    config: SessionConfig,
    broker: Arc<dyn Broker>,
    media: MediaAcquisition,
    inner: Mutex<EngineInner>,
    state_tx: watch::Sender<SessionState>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl CallEngine {
    /// Erstellt eine neue CallEngine
    pub fn new(
        config: SessionConfig,
        broker: Arc<dyn Broker>,
        device: Arc<dyn CaptureDevice>,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::default());
        let media = MediaAcquisition::new(device, config.constraints.clone());

        Arc::new(Self {
            config,
            broker,
            media,
            inner: Mutex::new(EngineInner {
                session: None,
                next_session: 0,
                started: false,
                destroyed: false,
                media_failure: None,
                background: Vec::new(),
            }),
            state_tx,
            event_tx,
        })
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Read-only Sicht auf den Zustand
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state_tx.borrow().identity.clone()
    }

    /// Lokaler Stream für die Preview, falls bereits erworben
    pub fn local_stream(&self) -> Option<MediaHandle> {
        self.media.current()
    }

    /// Öffnet den Broker, fordert Media an und verarbeitet Broker-Events
    ///
    /// Mehrfacher Aufruf ist ein No-op.
    pub fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.started || inner.destroyed {
            return;
        }
        inner.started = true;

        tracing::info!("Starting call engine...");

        let events = self.broker.subscribe();
        let engine = Arc::clone(self);
        inner
            .background
            .push(tokio::spawn(engine.run_broker_events(events)));

        let engine = Arc::clone(self);
        inner.background.push(tokio::spawn(engine.open_identity()));

        let engine = Arc::clone(self);
        inner.background.push(tokio::spawn(engine.prepare_media()));
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    /// Startet einen ausgehenden Anruf
    ///
    /// Leere IDs und fehlende lokale Media werden synchron abgewiesen, bevor
    /// der Broker angesprochen wird.
    pub fn start_call(self: &Arc<Self>, remote_id: &str) -> Result<(), SessionError> {
        let remote_id = remote_id.trim();
        if remote_id.is_empty() {
            return Err(self.report(SessionError::EmptyRemoteId));
        }

        let Some(local) = self.media.current() else {
            return Err(self.report(SessionError::MediaNotReady));
        };

        let remote = Identity::from(remote_id);
        let id = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                drop(inner);
                return Err(self.report(SessionError::ConnectionFailed(
                    "broker connection was destroyed".to_string(),
                )));
            }
            if inner.session.as_ref().is_some_and(|s| s.status.is_live()) {
                drop(inner);
                return Err(self.report(SessionError::AlreadyInCall));
            }

            let id = inner.open_session(remote.clone());
            self.state_tx.send_modify(|s| {
                s.status = CallStatus::Idle;
                s.remote_peer = Some(remote.clone());
                s.remote_stream = None;
                s.last_error = None;
            });
            id
        };

        tracing::info!("Starting call to {}", remote);
        let _ = self.event_tx.send(SessionEvent::StateChanged(CallStatus::Idle));

        let channel = match self.broker.connect(&remote) {
            Ok(channel) => channel,
            Err(err) => {
                let err = SessionError::from(err);
                self.fail_session(id, err.clone());
                return Err(err);
            }
        };
        self.attach_channel(id, channel, Direction::Outgoing);

        let call = match self.broker.call(&remote, local) {
            Ok(call) => call,
            Err(err) => {
                let err = SessionError::from(err);
                self.fail_session(id, err.clone());
                return Err(err);
            }
        };
        if self.attach_call(id, &call) {
            let engine = Arc::clone(self);
            let task = tokio::spawn(async move { engine.await_remote_stream(id, call).await });
            self.track_task(id, task);
        }

        self.arm_handshake_timeout(id);
        Ok(())
    }

    /// Schaltet die Kamera um und informiert die Gegenseite, falls der
    /// Kanal offen ist
    ///
    /// Ist der Kanal nicht offen, bleibt die Änderung lokal; die Gegenseite
    /// wird später nicht nachträglich informiert.
    pub fn toggle_camera(&self) -> Result<bool, SessionError> {
        let enabled = self.toggle_track(TrackKind::Video)?;
        tracing::info!("Camera {}", if enabled { "on" } else { "off" });

        let channel = self
            .inner
            .lock()
            .session
            .as_ref()
            .and_then(|s| s.channel.clone());

        match channel.filter(|c| c.is_open()) {
            Some(channel) => {
                match protocol::encode(&ControlMessage::CameraState { enabled }) {
                    Ok(frame) => {
                        if let Err(err) = channel.send(frame) {
                            tracing::warn!("Failed to send camera state: {}", err);
                        }
                    }
                    Err(err) => tracing::error!("{}", err),
                }
            }
            None => tracing::debug!("Control channel not open, camera state stays local"),
        }

        Ok(enabled)
    }

    /// Schaltet das Mikrofon um (ohne Nachricht an die Gegenseite)
    pub fn toggle_mic(&self) -> Result<bool, SessionError> {
        let enabled = self.toggle_track(TrackKind::Audio)?;
        tracing::info!("Microphone {}", if enabled { "on" } else { "off" });
        Ok(enabled)
    }

    /// Beendet alles: Tracks, Kanal, Call und Broker
    ///
    /// Idempotent, auch ohne vorherige Session.
    pub fn leave_call(&self) {
        let (detached, background, first) = {
            let mut inner = self.inner.lock();
            let first = !inner.destroyed;
            inner.destroyed = true;

            let detached = inner.session.as_mut().map(CallSession::end);
            let background = std::mem::take(&mut inner.background);
            self.state_tx.send_modify(SessionState::reset);
            (detached, background, first)
        };

        if let Some(detached) = detached {
            detached.close();
        }
        for task in background {
            task.abort();
        }
        if self.media.release() {
            tracing::info!("Local media released");
        }

        if first {
            self.broker.destroy();
            tracing::info!("Left call, broker connection destroyed");
            let _ = self.event_tx.send(SessionEvent::StateChanged(CallStatus::Ended));
        } else {
            tracing::debug!("leave_call: nothing left to tear down");
        }
    }

    /// Kopiert die eigene Identität in die Zwischenablage
    pub fn copy_identity(&self, clipboard: &dyn Clipboard) -> Result<Identity, SessionError> {
        let identity = self.identity().ok_or(SessionError::IdentityUnavailable)?;
        clipboard
            .write_text(identity.as_str())
            .map_err(SessionError::Clipboard)?;
        self.notify(Notice::IdentityCopied);
        Ok(identity)
    }

    // ========================================================================
    // BACKGROUND TASKS
    // ========================================================================

    async fn open_identity(self: Arc<Self>) {
        match self.broker.open().await {
            Ok(identity) => {
                if self.is_destroyed() {
                    return;
                }
                tracing::info!("Identity assigned: {}", identity);
                self.state_tx.send_modify(|s| s.identity = Some(identity));
            }
            Err(err) => {
                tracing::error!("Failed to open broker connection: {}", err);
                if !self.is_destroyed() {
                    self.report(err.into());
                }
            }
        }
    }

    async fn prepare_media(self: Arc<Self>) {
        match self.media.acquire().await {
            Ok(_) => self.mark_media_ready(),
            Err(MediaError::Released) => tracing::debug!("Media released during startup"),
            Err(err) => {
                if !self.is_destroyed() {
                    self.report_media_failure(err.into());
                }
            }
        }
    }

    async fn run_broker_events(self: Arc<Self>, mut events: broadcast::Receiver<BrokerEvent>) {
        loop {
            match events.recv().await {
                Ok(BrokerEvent::Call(call)) => self.on_incoming_call(call),
                Ok(BrokerEvent::Connection(channel)) => self.on_incoming_connection(channel),
                Ok(BrokerEvent::Error(err)) => {
                    tracing::error!("Broker error: {}", err);
                    self.on_broker_error(err.into());
                }
                Ok(BrokerEvent::Disconnected) => {
                    tracing::info!("Broker disconnected");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} broker events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // ========================================================================
    // INCOMING
    // ========================================================================

    fn on_incoming_call(self: &Arc<Self>, call: Arc<dyn MediaCall>) {
        let remote = call.remote().clone();
        tracing::info!("Incoming call from {}", remote);

        let Some(id) = self.adopt_session(&remote) else {
            tracing::warn!("Rejecting call from {}: already in a call", remote);
            call.close();
            return;
        };
        if !self.attach_call(id, &call) {
            call.close();
            return;
        }

        let engine = Arc::clone(self);
        let task = tokio::spawn(engine.answer_call(id, call));
        self.track_task(id, task);
    }

    fn on_incoming_connection(self: &Arc<Self>, channel: Arc<dyn ControlChannel>) {
        let remote = channel.remote().clone();
        tracing::info!("Incoming control channel from {}", remote);

        let Some(id) = self.adopt_session(&remote) else {
            tracing::warn!("Rejecting control channel from {}: already in a call", remote);
            channel.close();
            return;
        };
        self.attach_channel(id, channel, Direction::Incoming);
    }

    /// Beantwortet einen eingehenden Anruf, notfalls nach der Media-Anforderung
    ///
    /// Fehlt der Stream, wird die Hardware erneut angefragt (eine Berechtigung
    /// kann inzwischen erteilt sein). Derselbe Hardware-Fehler wird dabei nur
    /// einmal gemeldet.
    async fn answer_call(self: Arc<Self>, id: SessionId, call: Arc<dyn MediaCall>) {
        let local = match self.media.current() {
            Some(handle) => Some(handle),
            None => {
                tracing::info!("Local media not ready, deferring answer to {}", call.remote());
                match self.media.acquire().await {
                    Ok(handle) => {
                        self.mark_media_ready();
                        Some(handle)
                    }
                    Err(MediaError::Released) => {
                        tracing::debug!("Media released before answering {}", call.remote());
                        return;
                    }
                    Err(err) => {
                        if self.is_live(id) {
                            self.report_media_failure(err.into());
                        }
                        None
                    }
                }
            }
        };

        if !self.is_live(id) {
            tracing::debug!("Session ended before answering {}", call.remote());
            return;
        }
        if let Err(err) = call.answer(local) {
            tracing::error!("Failed to answer call from {}: {}", call.remote(), err);
            self.fail_session(id, err.into());
            return;
        }

        tracing::info!("Answered call from {}", call.remote());
        self.await_remote_stream(id, call).await;
    }

    /// Existierende Session zur selben Gegenseite oder eine neue
    fn adopt_session(self: &Arc<Self>, remote: &Identity) -> Option<SessionId> {
        let id = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return None;
            }
            if let Some(session) = inner.session.as_ref() {
                if session.status.is_live() {
                    return (session.remote == *remote).then_some(session.id);
                }
            }

            let id = inner.open_session(remote.clone());
            self.state_tx.send_modify(|s| {
                s.status = CallStatus::Idle;
                s.remote_peer = Some(remote.clone());
                s.remote_stream = None;
                s.last_error = None;
            });
            id
        };

        let _ = self.event_tx.send(SessionEvent::StateChanged(CallStatus::Idle));
        self.arm_handshake_timeout(id);
        Some(id)
    }

    // ========================================================================
    // SESSION PLUMBING
    // ========================================================================

    fn attach_channel(
        self: &Arc<Self>,
        id: SessionId,
        channel: Arc<dyn ControlChannel>,
        direction: Direction,
    ) {
        let attached = {
            let mut inner = self.inner.lock();
            match inner.live_session(id) {
                Some(session) => {
                    if session.channel.as_ref().is_some_and(|c| c.is_open()) {
                        false
                    } else {
                        if let Some(stale) = session.channel.replace(Arc::clone(&channel)) {
                            stale.close();
                        }
                        true
                    }
                }
                None => false,
            }
        };

        if !attached {
            tracing::warn!("Dropping extra control channel from {}", channel.remote());
            channel.close();
            return;
        }

        let engine = Arc::clone(self);
        let task = tokio::spawn(engine.run_control_channel(id, channel, direction));
        self.track_task(id, task);
    }

    fn attach_call(&self, id: SessionId, call: &Arc<dyn MediaCall>) -> bool {
        let mut inner = self.inner.lock();
        match inner.live_session(id) {
            Some(session) if session.call.is_none() => {
                session.call = Some(Arc::clone(call));
                true
            }
            Some(_) => {
                tracing::warn!("Session already has a media call, dropping {}", call.remote());
                false
            }
            None => false,
        }
    }

    async fn run_control_channel(
        self: Arc<Self>,
        id: SessionId,
        channel: Arc<dyn ControlChannel>,
        direction: Direction,
    ) {
        let peer = channel.remote().clone();

        if let Err(err) = channel.opened().await {
            if self.owns_channel(id, &channel) {
                tracing::error!("Control channel to {} failed: {}", peer, err);
                self.fail_session(id, err.into());
            } else {
                tracing::debug!("Replaced control channel to {} closed: {}", peer, err);
            }
            return;
        }
        if !self.owns_channel(id, &channel) {
            return;
        }

        tracing::info!("Control channel to {} open", peer);
        if direction == Direction::Outgoing {
            match protocol::encode(&ControlMessage::JoinNotice) {
                Ok(frame) => {
                    if let Err(err) = channel.send(frame) {
                        tracing::warn!("Failed to send join notice: {}", err);
                    }
                }
                Err(err) => tracing::error!("{}", err),
            }
            self.notify(Notice::Joined {
                peer: peer.clone(),
                at: Utc::now(),
            });
        }
        self.transition(id, CallStatus::Connecting, |_| {});

        while let Some(frame) = channel.recv().await {
            if !self.owns_channel(id, &channel) {
                break;
            }
            match protocol::decode(&frame) {
                Ok(message) => self.apply_control(id, &peer, message),
                Err(err) => tracing::warn!("Ignoring control frame from {}: {}", peer, err),
            }
        }

        if self.owns_channel(id, &channel) {
            tracing::info!("{} left the call", peer);
            self.end_session(id, None);
            self.notify(Notice::PeerLeft {
                peer,
                at: Utc::now(),
            });
        } else {
            tracing::debug!("Control channel to {} closed", peer);
        }
    }

    fn apply_control(&self, id: SessionId, peer: &Identity, message: ControlMessage) {
        match message {
            ControlMessage::CameraState { enabled } => {
                {
                    let inner = self.inner.lock();
                    if !inner.is_live(id) {
                        return;
                    }
                    self.state_tx.send_modify(|s| {
                        s.apply_control(&message);
                    });
                }
                tracing::debug!("Remote camera of {}: {}", peer, enabled);
                let _ = self.event_tx.send(SessionEvent::RemoteCamera(enabled));
            }
            ControlMessage::JoinNotice => {
                tracing::info!("{} has joined", peer);
                self.notify(Notice::PeerJoined {
                    peer: peer.clone(),
                    at: Utc::now(),
                });
            }
        }
    }

    async fn await_remote_stream(&self, id: SessionId, call: Arc<dyn MediaCall>) {
        match call.remote_stream().await {
            Ok(stream) => {
                let exposed = stream.clone();
                if !self.transition(id, CallStatus::Active, |s| s.remote_stream = Some(exposed)) {
                    tracing::debug!("Ignoring remote stream from {}", stream.peer);
                    return;
                }
                tracing::info!("Remote stream {} from {}", stream.stream_id, stream.peer);
                let _ = self.event_tx.send(SessionEvent::RemoteStream(stream));
            }
            Err(err) => {
                tracing::error!("Media call to {} failed: {}", call.remote(), err);
                self.fail_session(id, err.into());
            }
        }
    }

    fn arm_handshake_timeout(self: &Arc<Self>, id: SessionId) {
        let Some(timeout) = self.config.handshake_timeout else {
            return;
        };

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let stalled = {
                let inner = engine.inner.lock();
                !inner.destroyed
                    && inner.session.as_ref().is_some_and(|s| {
                        s.id == id && matches!(s.status, CallStatus::Idle | CallStatus::Connecting)
                    })
            };
            if stalled {
                tracing::warn!("Handshake did not complete within {:?}", timeout);
                engine.fail_session(
                    id,
                    SessionError::ConnectionFailed(format!(
                        "no remote stream within {:?}",
                        timeout
                    )),
                );
            }
        });
        self.track_task(id, task);
    }

    fn track_task(&self, id: SessionId, task: JoinHandle<()>) {
        let mut inner = self.inner.lock();
        match inner.live_session(id) {
            Some(session) => session.tasks.push(task),
            None => task.abort(),
        }
    }

    // ========================================================================
    // STATE HELPERS
    // ========================================================================

    /// Geführter Statusübergang, ungültige Übergänge werden abgewiesen
    fn transition(
        &self,
        id: SessionId,
        next: CallStatus,
        update: impl FnOnce(&mut SessionState),
    ) -> bool {
        {
            let mut inner = self.inner.lock();
            match inner.live_session(id) {
                Some(session) if session.status.can_transition_to(next) => {
                    session.status = next;
                    self.state_tx.send_modify(|s| {
                        s.status = next;
                        update(s);
                    });
                }
                _ => {
                    tracing::debug!("Rejected transition to {:?} for {:?}", next, id);
                    return false;
                }
            }
        }

        tracing::info!("Call state changed: {:?}", next);
        let _ = self.event_tx.send(SessionEvent::StateChanged(next));
        true
    }

    /// Beendet eine Session nach einem Verbindungsfehler
    fn fail_session(&self, id: SessionId, err: SessionError) {
        self.end_session(id, Some(err));
    }

    fn end_session(&self, id: SessionId, err: Option<SessionError>) {
        let detached = {
            let mut inner = self.inner.lock();
            let Some(session) = inner.live_session(id) else {
                return;
            };
            let detached = session.end();
            self.state_tx.send_modify(|s| {
                s.status = CallStatus::Ended;
                s.remote_stream = None;
                if let Some(err) = &err {
                    s.last_error = Some(err.clone());
                }
            });
            detached
        };

        let _ = self.event_tx.send(SessionEvent::StateChanged(CallStatus::Ended));
        match err {
            Some(err) => {
                tracing::error!("Call ended: {}", err);
                let _ = self.event_tx.send(SessionEvent::Error(err));
            }
            None => tracing::info!("Call ended"),
        }
        detached.close();
    }

    /// Broker-Fehler beenden nur eine noch nicht aktive Session
    fn on_broker_error(&self, err: SessionError) {
        let pending = {
            let inner = self.inner.lock();
            if inner.destroyed {
                return;
            }
            inner
                .session
                .as_ref()
                .filter(|s| matches!(s.status, CallStatus::Idle | CallStatus::Connecting))
                .map(|s| s.id)
        };

        match pending {
            Some(id) => self.fail_session(id, err),
            None => {
                self.report(err);
            }
        }
    }

    fn toggle_track(&self, kind: TrackKind) -> Result<bool, SessionError> {
        let local = self.media.current().ok_or(SessionError::MediaNotReady)?;
        if !local.has_track(kind) {
            return Err(SessionError::MediaNotReady);
        }

        let mut enabled = true;
        self.state_tx.send_modify(|s| {
            let flag = match kind {
                TrackKind::Video => &mut s.local.camera_enabled,
                TrackKind::Audio => &mut s.local.mic_enabled,
            };
            *flag = !*flag;
            enabled = *flag;
        });
        local.set_enabled(kind, enabled);
        Ok(enabled)
    }

    fn mark_media_ready(&self) {
        let mut inner = self.inner.lock();
        if !inner.destroyed {
            inner.media_failure = None;
            self.state_tx.send_modify(|s| s.media_ready = true);
        }
    }

    fn report_media_failure(&self, err: SessionError) {
        {
            let mut inner = self.inner.lock();
            if inner.media_failure.as_ref() == Some(&err) {
                tracing::debug!("Already reported: {}", err);
                return;
            }
            inner.media_failure = Some(err.clone());
        }
        self.report(err);
    }

    fn report(&self, err: SessionError) -> SessionError {
        tracing::warn!("{}", err);
        self.state_tx
            .send_modify(|s| s.last_error = Some(err.clone()));
        let _ = self.event_tx.send(SessionEvent::Error(err.clone()));
        err
    }

    fn notify(&self, notice: Notice) {
        let _ = self.event_tx.send(SessionEvent::Notice(notice));
    }

    fn is_live(&self, id: SessionId) -> bool {
        self.inner.lock().is_live(id)
    }

    /// Ob `channel` noch der Kanal der lebenden Session `id` ist
    fn owns_channel(&self, id: SessionId, channel: &Arc<dyn ControlChannel>) -> bool {
        let mut inner = self.inner.lock();
        inner
            .live_session(id)
            .and_then(|s| s.channel.as_ref())
            .is_some_and(|current| same_channel(current, channel))
    }

    fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .field("media", &self.media)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::loopback::{LoopbackBroker, LoopbackNetwork};
    use crate::media::synthetic::SyntheticCapture;
    use crate::broker::BrokerError;
    use crate::media::MediaConstraints;
    use async_trait::async_trait;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Endpoint {
        engine: Arc<CallEngine>,
        broker: Arc<LoopbackBroker>,
        capture: Arc<SyntheticCapture>,
    }

    fn endpoint_with(
        network: &Arc<LoopbackNetwork>,
        identity: &str,
        capture: SyntheticCapture,
        config: SessionConfig,
    ) -> Endpoint {
        let broker = Arc::new(network.endpoint_with_identity(identity));
        let capture = Arc::new(capture);
        let engine = CallEngine::new(config, broker.clone(), capture.clone());
        engine.start();
        Endpoint {
            engine,
            broker,
            capture,
        }
    }

    async fn ready_endpoint(network: &Arc<LoopbackNetwork>, identity: &str) -> Endpoint {
        let endpoint = endpoint_with(
            network,
            identity,
            SyntheticCapture::new(),
            SessionConfig::default(),
        );
        wait_until(&endpoint.engine, |s| s.media_ready && s.identity.is_some()).await;
        endpoint
    }

    async fn wait_until(
        engine: &CallEngine,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> SessionState {
        let mut rx = engine.watch_state();
        let state = tokio::time::timeout(WAIT, rx.wait_for(predicate))
            .await
            .expect("timed out waiting for session state")
            .expect("state channel closed")
            .clone();
        state
    }

    async fn expect_event(
        events: &mut broadcast::Receiver<SessionEvent>,
        mut matches: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                let event = events.recv().await.expect("event channel closed");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected session event not seen")
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Gegenstelle ohne Engine, steuert Frames und Annahme von Hand
    async fn raw_peer(
        network: &Arc<LoopbackNetwork>,
        identity: &str,
    ) -> (Arc<LoopbackBroker>, broadcast::Receiver<BrokerEvent>) {
        let broker = Arc::new(network.endpoint_with_identity(identity));
        let events = broker.subscribe();
        broker.open().await.unwrap();
        (broker, events)
    }

    async fn accept(
        events: &mut broadcast::Receiver<BrokerEvent>,
    ) -> (Arc<dyn ControlChannel>, Arc<dyn MediaCall>) {
        let mut channel = None;
        let mut call = None;
        while channel.is_none() || call.is_none() {
            let event = tokio::time::timeout(WAIT, events.recv())
                .await
                .expect("no broker event")
                .expect("broker event channel closed");
            match event {
                BrokerEvent::Connection(c) => channel = Some(c),
                BrokerEvent::Call(c) => call = Some(c),
                other => panic!("unexpected broker event: {:?}", other),
            }
        }
        (channel.unwrap(), call.unwrap())
    }

    async fn next_message(channel: &Arc<dyn ControlChannel>) -> ControlMessage {
        let frame = tokio::time::timeout(WAIT, channel.recv())
            .await
            .expect("no control frame")
            .expect("control channel closed");
        protocol::decode(&frame).unwrap()
    }

    async fn active_pair(network: &Arc<LoopbackNetwork>) -> (Endpoint, Endpoint) {
        let alice = ready_endpoint(network, "alice").await;
        let bob = ready_endpoint(network, "bob").await;

        bob.engine.start_call("alice").unwrap();
        wait_until(&bob.engine, |s| s.status == CallStatus::Active).await;
        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
        (alice, bob)
    }

    #[derive(Default)]
    struct MemoryClipboard {
        text: Mutex<Option<String>>,
    }

    impl Clipboard for MemoryClipboard {
        fn write_text(&self, text: &str) -> Result<(), String> {
            *self.text.lock() = Some(text.to_string());
            Ok(())
        }
    }

    struct BrokenClipboard;

    impl Clipboard for BrokenClipboard {
        fn write_text(&self, _text: &str) -> Result<(), String> {
            Err("permission denied".to_string())
        }
    }

    /// Ausgehender Kanal, der erst nach `release()` als offen gilt
    struct HeldChannel {
        inner: Arc<dyn ControlChannel>,
        gate: watch::Sender<Option<bool>>,
    }

    impl HeldChannel {
        fn release(&self) {
            self.gate.send_if_modified(|gate| {
                if gate.is_some() {
                    return false;
                }
                *gate = Some(true);
                true
            });
        }

        fn is_closed(&self) -> bool {
            *self.gate.borrow() == Some(false)
        }
    }

    #[async_trait]
    impl ControlChannel for HeldChannel {
        fn remote(&self) -> &Identity {
            self.inner.remote()
        }

        async fn opened(&self) -> Result<(), BrokerError> {
            let mut gate = self.gate.subscribe();
            let released = gate
                .wait_for(|g| g.is_some())
                .await
                .map(|g| *g == Some(true))
                .unwrap_or(false);
            if !released {
                return Err(BrokerError::ChannelClosed);
            }
            self.inner.opened().await
        }

        fn is_open(&self) -> bool {
            *self.gate.borrow() == Some(true) && self.inner.is_open()
        }

        fn send(&self, frame: String) -> Result<(), BrokerError> {
            if !self.is_open() {
                return Err(BrokerError::ChannelClosed);
            }
            self.inner.send(frame)
        }

        async fn recv(&self) -> Option<String> {
            self.inner.recv().await
        }

        fn close(&self) {
            self.gate.send_replace(Some(false));
            self.inner.close();
        }
    }

    /// Loopback-Endpunkt, dessen `connect()` offen bleibt bis zur Freigabe
    struct HeldBroker {
        inner: LoopbackBroker,
        held: Mutex<Vec<Arc<HeldChannel>>>,
    }

    impl HeldBroker {
        fn new(inner: LoopbackBroker) -> Self {
            Self {
                inner,
                held: Mutex::new(Vec::new()),
            }
        }

        fn held(&self, index: usize) -> Arc<HeldChannel> {
            Arc::clone(&self.held.lock()[index])
        }
    }

    #[async_trait]
    impl Broker for HeldBroker {
        async fn open(&self) -> Result<Identity, BrokerError> {
            self.inner.open().await
        }

        fn connect(&self, remote: &Identity) -> Result<Arc<dyn ControlChannel>, BrokerError> {
            let (gate, _) = watch::channel(None);
            let held = Arc::new(HeldChannel {
                inner: self.inner.connect(remote)?,
                gate,
            });
            self.held.lock().push(Arc::clone(&held));
            let channel: Arc<dyn ControlChannel> = held;
            Ok(channel)
        }

        fn call(
            &self,
            remote: &Identity,
            local: MediaHandle,
        ) -> Result<Arc<dyn MediaCall>, BrokerError> {
            self.inner.call(remote, local)
        }

        fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
            self.inner.subscribe()
        }

        fn destroy(&self) {
            self.inner.destroy();
        }
    }

    async fn held_endpoint(
        network: &Arc<LoopbackNetwork>,
        identity: &str,
    ) -> (Arc<CallEngine>, Arc<HeldBroker>) {
        let broker = Arc::new(HeldBroker::new(network.endpoint_with_identity(identity)));
        let engine = CallEngine::new(
            SessionConfig::default(),
            broker.clone(),
            Arc::new(SyntheticCapture::new()),
        );
        engine.start();
        wait_until(&engine, |s| s.media_ready && s.identity.is_some()).await;
        (engine, broker)
    }

    // ------------------------------------------------------------------------
    // toggles
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_toggle_camera_parity() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let video = alice.capture.track(TrackKind::Video).unwrap();

        for n in 1..=5 {
            let on = alice.engine.toggle_camera().unwrap();
            assert_eq!(on, n % 2 == 0);
            assert_eq!(alice.engine.state().camera_on(), on);
            assert_eq!(video.is_enabled(), on);
        }
        assert!(alice.engine.state().mic_on());
    }

    #[tokio::test]
    async fn test_toggle_mic_parity() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let audio = alice.capture.track(TrackKind::Audio).unwrap();

        assert!(!alice.engine.toggle_mic().unwrap());
        assert!(!audio.is_enabled());
        assert!(alice.engine.toggle_mic().unwrap());
        assert!(audio.is_enabled());
        assert!(alice.engine.state().camera_on());
    }

    #[tokio::test]
    async fn test_toggle_without_media_is_rejected() {
        let network = LoopbackNetwork::new();
        let (capture, _gate) = SyntheticCapture::gated();
        let alice = endpoint_with(&network, "alice", capture, SessionConfig::default());

        assert_eq!(alice.engine.toggle_camera(), Err(SessionError::MediaNotReady));
        assert_eq!(alice.engine.toggle_mic(), Err(SessionError::MediaNotReady));

        let state = alice.engine.state();
        assert!(state.camera_on());
        assert!(state.mic_on());
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_toggle_mic_without_audio_track() {
        let network = LoopbackNetwork::new();
        let config = SessionConfig {
            constraints: MediaConstraints {
                video: true,
                audio: None,
            },
            ..SessionConfig::default()
        };
        let alice = endpoint_with(&network, "alice", SyntheticCapture::new(), config);
        wait_until(&alice.engine, |s| s.media_ready).await;

        assert_eq!(alice.engine.toggle_mic(), Err(SessionError::MediaNotReady));
        assert!(alice.engine.state().mic_on());
        assert_eq!(alice.engine.toggle_camera(), Ok(false));
    }

    // ------------------------------------------------------------------------
    // start_call validation
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_start_call_rejects_blank_id() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;

        for remote in ["", "   "] {
            assert_eq!(
                alice.engine.start_call(remote),
                Err(SessionError::EmptyRemoteId)
            );
        }

        assert_eq!(alice.broker.connect_attempts(), 0);
        assert_eq!(alice.broker.call_attempts(), 0);
        let state = alice.engine.state();
        assert_eq!(state.last_error, Some(SessionError::EmptyRemoteId));
        assert_eq!(state.status, CallStatus::Idle);
    }

    #[tokio::test]
    async fn test_start_call_before_media_ready() {
        let network = LoopbackNetwork::new();
        let (capture, _gate) = SyntheticCapture::gated();
        let alice = endpoint_with(&network, "alice", capture, SessionConfig::default());
        wait_until(&alice.engine, |s| s.identity.is_some()).await;

        assert_eq!(
            alice.engine.start_call("bob"),
            Err(SessionError::MediaNotReady)
        );
        assert_eq!(alice.broker.connect_attempts(), 0);
        assert_eq!(alice.broker.call_attempts(), 0);
        assert_eq!(
            alice.engine.state().last_error,
            Some(SessionError::MediaNotReady)
        );
    }

    #[tokio::test]
    async fn test_start_call_while_in_call() {
        let network = LoopbackNetwork::new();
        let (_alice, bob) = active_pair(&network).await;

        assert_eq!(
            bob.engine.start_call("carol"),
            Err(SessionError::AlreadyInCall)
        );
        assert_eq!(bob.broker.connect_attempts(), 1);
        assert_eq!(bob.engine.state().status, CallStatus::Active);
    }

    // ------------------------------------------------------------------------
    // handshake
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outgoing_call_becomes_active() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "abc123").await;
        let bob = ready_endpoint(&network, "bob").await;
        let mut alice_events = alice.engine.subscribe();
        let mut bob_events = bob.engine.subscribe();

        bob.engine.start_call("abc123").unwrap();

        let state = wait_until(&bob.engine, |s| s.status == CallStatus::Active).await;
        assert_eq!(state.remote_peer, Some(Identity::from("abc123")));
        assert!(state.remote_camera_on());
        let stream = state.remote_stream.unwrap();
        assert_eq!(stream.peer.as_str(), "abc123");
        assert!(stream.tracks.contains(&TrackKind::Video));

        expect_event(&mut bob_events, |e| {
            matches!(e, SessionEvent::Notice(Notice::Joined { peer, .. }) if peer.as_str() == "abc123")
        })
        .await;
        expect_event(&mut alice_events, |e| {
            matches!(e, SessionEvent::Notice(Notice::PeerJoined { peer, .. }) if peer.as_str() == "bob")
        })
        .await;

        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
        assert_eq!(state.remote_peer, Some(Identity::from("bob")));
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_call_to_unknown_peer_ends_with_error() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;

        alice.engine.start_call("nobody").unwrap();

        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Ended).await;
        assert!(matches!(
            state.last_error,
            Some(SessionError::ConnectionFailed(_))
        ));
        assert!(state.remote_stream.is_none());
    }

    #[tokio::test]
    async fn test_handshake_timeout_fails_fast() {
        let network = LoopbackNetwork::new();
        let config = SessionConfig::default().with_handshake_timeout(Duration::from_millis(100));
        let alice = endpoint_with(&network, "alice", SyntheticCapture::new(), config);
        wait_until(&alice.engine, |s| s.media_ready && s.identity.is_some()).await;
        let (_silent, mut silent_events) = raw_peer(&network, "silent").await;

        alice.engine.start_call("silent").unwrap();
        let (channel, _call) = accept(&mut silent_events).await;
        assert_eq!(next_message(&channel).await, ControlMessage::JoinNotice);
        wait_until(&alice.engine, |s| s.status == CallStatus::Connecting).await;

        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Ended).await;
        assert!(matches!(
            state.last_error,
            Some(SessionError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_deferred_answer_waits_for_media() {
        let network = LoopbackNetwork::new();
        let (capture, gate) = SyntheticCapture::gated();
        let alice = endpoint_with(&network, "alice", capture, SessionConfig::default());
        wait_until(&alice.engine, |s| s.identity.is_some()).await;
        let bob = ready_endpoint(&network, "bob").await;

        bob.engine.start_call("alice").unwrap();
        wait_until(&alice.engine, |s| s.status == CallStatus::Connecting).await;
        settle().await;

        assert_eq!(alice.engine.state().status, CallStatus::Connecting);
        assert_eq!(bob.engine.state().status, CallStatus::Connecting);
        assert!(bob.engine.state().remote_stream.is_none());

        gate.open();

        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
        let state = wait_until(&bob.engine, |s| s.status == CallStatus::Active).await;
        assert_eq!(alice.capture.requests(), 1);
        assert!(alice.engine.state().media_ready);
        let tracks = state.remote_stream.unwrap().tracks;
        assert!(tracks.contains(&TrackKind::Video));
        assert!(tracks.contains(&TrackKind::Audio));
    }

    #[tokio::test]
    async fn test_incoming_call_answered_without_media() {
        let network = LoopbackNetwork::new();
        let alice = endpoint_with(
            &network,
            "alice",
            SyntheticCapture::failing("permission denied"),
            SessionConfig::default(),
        );
        let state = wait_until(&alice.engine, |s| s.last_error.is_some()).await;
        assert_eq!(
            state.last_error,
            Some(SessionError::MediaUnavailable("permission denied".to_string()))
        );
        assert_eq!(
            alice.engine.start_call("bob"),
            Err(SessionError::MediaNotReady)
        );

        let bob = ready_endpoint(&network, "bob").await;
        bob.engine.start_call("alice").unwrap();

        let state = wait_until(&bob.engine, |s| s.status == CallStatus::Active).await;
        assert!(state.remote_stream.unwrap().tracks.is_empty());
        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
    }

    #[tokio::test]
    async fn test_second_caller_is_rejected() {
        let network = LoopbackNetwork::new();
        let (alice, _bob) = active_pair(&network).await;
        let carol = ready_endpoint(&network, "carol").await;

        carol.engine.start_call("alice").unwrap();

        wait_until(&carol.engine, |s| s.status == CallStatus::Ended).await;
        let state = alice.engine.state();
        assert_eq!(state.status, CallStatus::Active);
        assert_eq!(state.remote_peer, Some(Identity::from("bob")));
    }

    // ------------------------------------------------------------------------
    // control messages
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_camera_off_reaches_remote() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = active_pair(&network).await;
        assert!(bob.engine.state().remote_camera_on());

        assert_eq!(alice.engine.toggle_camera(), Ok(false));

        let state = wait_until(&bob.engine, |s| !s.remote_camera_on()).await;
        assert!(state.camera_on());
        assert!(!alice.engine.state().camera_on());
        assert!(alice.engine.state().remote_camera_on());
    }

    #[tokio::test]
    async fn test_mic_toggle_is_not_sent() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let (_peer, mut peer_events) = raw_peer(&network, "peer").await;

        alice.engine.start_call("peer").unwrap();
        let (channel, call) = accept(&mut peer_events).await;
        assert_eq!(next_message(&channel).await, ControlMessage::JoinNotice);
        call.answer(None).unwrap();
        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;

        alice.engine.toggle_mic().unwrap();
        alice.engine.toggle_camera().unwrap();

        assert_eq!(
            next_message(&channel).await,
            ControlMessage::CameraState { enabled: false }
        );
    }

    #[tokio::test]
    async fn test_remote_camera_follows_last_delivered() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let (_peer, mut peer_events) = raw_peer(&network, "peer").await;

        alice.engine.start_call("peer").unwrap();
        let (channel, call) = accept(&mut peer_events).await;
        call.answer(None).unwrap();
        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;

        channel
            .send(r#"{"type":"camera","enabled":false}"#.to_string())
            .unwrap();
        wait_until(&alice.engine, |s| !s.remote_camera_on()).await;

        channel.send("not json".to_string()).unwrap();
        channel
            .send(r#"{"type":"camera","enabled":true}"#.to_string())
            .unwrap();
        wait_until(&alice.engine, |s| s.remote_camera_on()).await;

        // toggled off then on at the sender, delivered the other way round
        channel
            .send(r#"{"type":"camera","enabled":true}"#.to_string())
            .unwrap();
        channel
            .send(r#"{"type":"camera","enabled":false}"#.to_string())
            .unwrap();
        wait_until(&alice.engine, |s| !s.remote_camera_on()).await;
        settle().await;

        let state = alice.engine.state();
        assert!(!state.remote_camera_on());
        assert_eq!(state.status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_peer_join_notices_repeat() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let (_peer, mut peer_events) = raw_peer(&network, "peer").await;
        let mut events = alice.engine.subscribe();

        alice.engine.start_call("peer").unwrap();
        let (channel, _call) = accept(&mut peer_events).await;

        let joined = r#"{"type":"joined"}"#;
        channel.send(joined.to_string()).unwrap();
        channel.send(joined.to_string()).unwrap();

        for _ in 0..2 {
            expect_event(&mut events, |e| {
                matches!(e, SessionEvent::Notice(Notice::PeerJoined { .. }))
            })
            .await;
        }
        assert!(alice.engine.state().remote_camera_on());
    }

    #[tokio::test]
    async fn test_remote_hangup_ends_session() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let (_peer, mut peer_events) = raw_peer(&network, "peer").await;
        let mut events = alice.engine.subscribe();

        alice.engine.start_call("peer").unwrap();
        let (channel, call) = accept(&mut peer_events).await;
        call.answer(None).unwrap();
        wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;

        channel.close();

        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Ended).await;
        assert!(state.last_error.is_none());
        expect_event(&mut events, |e| {
            matches!(e, SessionEvent::Notice(Notice::PeerLeft { .. }))
        })
        .await;
        assert!(alice.engine.local_stream().is_some());
    }

    #[tokio::test]
    async fn test_camera_toggle_before_channel_open_stays_local() {
        let network = LoopbackNetwork::new();
        let (alice, broker) = held_endpoint(&network, "alice").await;
        let bob = ready_endpoint(&network, "bob").await;
        let mut bob_events = bob.engine.subscribe();

        alice.start_call("bob").unwrap();
        assert_eq!(alice.toggle_camera(), Ok(false));

        wait_until(&alice, |s| s.status == CallStatus::Active).await;
        let channel = broker.held(0);
        assert!(!channel.is_open());

        channel.release();
        expect_event(&mut bob_events, |e| {
            matches!(e, SessionEvent::Notice(Notice::PeerJoined { .. }))
        })
        .await;
        settle().await;

        assert!(channel.is_open());
        assert!(bob.engine.state().remote_camera_on());
        assert!(!alice.state().camera_on());
        assert_eq!(alice.state().status, CallStatus::Active);
    }

    #[tokio::test]
    async fn test_pending_channel_replaced_by_incoming() {
        let network = LoopbackNetwork::new();
        let (alice, broker) = held_endpoint(&network, "alice").await;
        let (peer, mut peer_events) = raw_peer(&network, "peer").await;

        alice.start_call("peer").unwrap();
        let (_first, call) = accept(&mut peer_events).await;

        let channel = peer.connect(&Identity::from("alice")).unwrap();
        wait_until(&alice, |s| s.status == CallStatus::Connecting).await;
        settle().await;

        assert!(broker.held(0).is_closed());
        let state = alice.state();
        assert_eq!(state.status, CallStatus::Connecting);
        assert!(state.last_error.is_none());

        channel
            .send(r#"{"type":"camera","enabled":false}"#.to_string())
            .unwrap();
        wait_until(&alice, |s| !s.remote_camera_on()).await;

        call.answer(None).unwrap();
        let state = wait_until(&alice, |s| s.status == CallStatus::Active).await;
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_incoming_session_clears_previous_error() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let bob = ready_endpoint(&network, "bob").await;

        assert_eq!(
            alice.engine.start_call(" "),
            Err(SessionError::EmptyRemoteId)
        );
        bob.engine.start_call("alice").unwrap();

        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
        assert!(state.last_error.is_none());
    }

    #[tokio::test]
    async fn test_media_failure_reported_once() {
        let network = LoopbackNetwork::new();
        let alice = endpoint_with(
            &network,
            "alice",
            SyntheticCapture::failing("permission denied"),
            SessionConfig::default(),
        );
        wait_until(&alice.engine, |s| s.last_error.is_some()).await;
        let mut events = alice.engine.subscribe();

        let bob = ready_endpoint(&network, "bob").await;
        bob.engine.start_call("alice").unwrap();
        let state = wait_until(&alice.engine, |s| s.status == CallStatus::Active).await;
        settle().await;

        assert!(state.last_error.is_none());
        assert_eq!(alice.capture.requests(), 2);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, SessionEvent::Error(_)), "{:?}", event);
        }
    }

    // ------------------------------------------------------------------------
    // leave_call
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_leave_without_session_is_harmless() {
        let network = LoopbackNetwork::new();
        let broker = Arc::new(network.endpoint());
        let engine = CallEngine::new(
            SessionConfig::default(),
            broker.clone(),
            Arc::new(SyntheticCapture::new()),
        );

        engine.leave_call();
        engine.leave_call();

        let state = engine.state();
        assert_eq!(state.status, CallStatus::Ended);
        assert!(state.camera_on() && state.mic_on() && state.remote_camera_on());
        assert_eq!(broker.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_leave_releases_everything_once() {
        let network = LoopbackNetwork::new();
        let (alice, bob) = active_pair(&network).await;
        alice.engine.toggle_camera().unwrap();

        alice.engine.leave_call();
        alice.engine.leave_call();

        for track in alice.capture.tracks() {
            assert_eq!(track.stop_calls(), 1);
        }
        assert_eq!(alice.broker.destroy_calls(), 1);
        assert!(alice.broker.is_destroyed());
        assert!(!network.is_registered(&Identity::from("alice")));

        let state = alice.engine.state();
        assert_eq!(state.status, CallStatus::Ended);
        assert_eq!(state.identity, Some(Identity::from("alice")));
        assert!(state.camera_on());
        assert!(state.remote_peer.is_none());
        assert!(!state.media_ready);

        wait_until(&bob.engine, |s| s.status == CallStatus::Ended).await;
        assert_eq!(
            alice.engine.start_call("bob"),
            Err(SessionError::MediaNotReady)
        );
    }

    #[tokio::test]
    async fn test_leave_during_deferred_answer() {
        let network = LoopbackNetwork::new();
        let (capture, gate) = SyntheticCapture::gated();
        let alice = endpoint_with(&network, "alice", capture, SessionConfig::default());
        wait_until(&alice.engine, |s| s.identity.is_some()).await;
        let bob = ready_endpoint(&network, "bob").await;

        bob.engine.start_call("alice").unwrap();
        wait_until(&alice.engine, |s| s.status == CallStatus::Connecting).await;

        alice.engine.leave_call();
        gate.open();
        settle().await;

        let state = alice.engine.state();
        assert_eq!(state.status, CallStatus::Ended);
        assert!(state.remote_stream.is_none());
        assert!(!state.media_ready);
        assert!(alice.engine.local_stream().is_none());
        for track in alice.capture.tracks() {
            assert!(track.stop_calls() <= 1);
        }

        wait_until(&bob.engine, |s| s.status == CallStatus::Ended).await;
    }

    // ------------------------------------------------------------------------
    // identity
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_copy_identity() {
        let network = LoopbackNetwork::new();
        let alice = ready_endpoint(&network, "alice").await;
        let mut events = alice.engine.subscribe();
        let clipboard = MemoryClipboard::default();

        let copied = alice.engine.copy_identity(&clipboard).unwrap();

        assert_eq!(copied.as_str(), "alice");
        assert_eq!(clipboard.text.lock().as_deref(), Some("alice"));
        expect_event(&mut events, |e| {
            matches!(e, SessionEvent::Notice(Notice::IdentityCopied))
        })
        .await;

        assert_eq!(
            alice.engine.copy_identity(&BrokenClipboard),
            Err(SessionError::Clipboard("permission denied".to_string()))
        );
    }

    #[tokio::test]
    async fn test_copy_identity_before_open() {
        let network = LoopbackNetwork::new();
        let engine = CallEngine::new(
            SessionConfig::default(),
            Arc::new(network.endpoint()),
            Arc::new(SyntheticCapture::new()),
        );

        assert_eq!(
            engine.copy_identity(&MemoryClipboard::default()),
            Err(SessionError::IdentityUnavailable)
        );
    }
}
