//! In-memory collaborators for driving call engines without a network,
//! a media stack or a call-log server.

#![allow(dead_code)]

use async_trait::async_trait;
use callflow_core::call::{self, CallDeps};
use callflow_core::media::{LocalMedia, LocalTrack, MediaAcquirer, TrackKind};
use callflow_core::peer::{PeerConnector, PeerEvent, PeerEventSink, PeerSession};
use callflow_core::sound::SoundCues;
use callflow_core::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

// ============================================================================
// Signaling
// ============================================================================

/// Routes envelopes between fake transports by recipient id and records
/// everything that was sent.
#[derive(Default)]
pub struct Switchboard {
    lines: Mutex<HashMap<String, broadcast::Sender<RealtimeEvent>>>,
    sent: Mutex<Vec<(String, SignalingEnvelope)>>,
}

impl Switchboard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn line(self: &Arc<Self>, user: &str) -> Arc<FakeTransport> {
        let (events, _) = broadcast::channel(256);
        self.lines.lock().insert(user.to_string(), events.clone());
        Arc::new(FakeTransport {
            user: user.to_string(),
            board: self.clone(),
            events,
            online: AtomicBool::new(true),
        })
    }

    pub fn sent_by(&self, user: &str) -> Vec<SignalingEnvelope> {
        self.sent
            .lock()
            .iter()
            .filter(|(sender, _)| sender == user)
            .map(|(_, envelope)| envelope.clone())
            .collect()
    }

    pub fn kinds_sent_by(&self, user: &str) -> Vec<&'static str> {
        self.sent_by(user).iter().map(|e| e.signal.kind()).collect()
    }

    pub fn count(&self, user: &str, kind: &str) -> usize {
        self.kinds_sent_by(user).iter().filter(|k| **k == kind).count()
    }
}

pub struct FakeTransport {
    user: String,
    board: Arc<Switchboard>,
    events: broadcast::Sender<RealtimeEvent>,
    online: AtomicBool,
}

impl FakeTransport {
    /// Deliver `envelope` to this user as if the relay forwarded it.
    pub fn inject(&self, envelope: SignalingEnvelope) {
        let _ = self.events.send(RealtimeEvent::Signal(envelope));
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl SignalingTransport for FakeTransport {
    fn send(&self, mut envelope: SignalingEnvelope) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::WebSocket("offline".to_string()));
        }
        envelope.sender = Some(self.user.clone());

        self.board
            .sent
            .lock()
            .push((self.user.clone(), envelope.clone()));
        if let Some(line) = self.board.lines.lock().get(&envelope.to) {
            let _ = line.send(RealtimeEvent::Signal(envelope));
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Peer sessions
// ============================================================================

pub struct FakePeer {
    owner: String,
    sink: PeerEventSink,
    local_tracks: AtomicUsize,
    remote_sets: AtomicUsize,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    fn new(owner: &str, sink: PeerEventSink) -> Self {
        Self {
            owner: owner.to_string(),
            sink,
            local_tracks: AtomicUsize::new(0),
            remote_sets: AtomicUsize::new(0),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Fire a peer callback into the owning engine.
    pub fn emit(&self, event: PeerEvent) {
        (self.sink)(event);
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn remote_sets(&self) -> usize {
        self.remote_sets.load(Ordering::SeqCst)
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn local_tracks(&self) -> usize {
        self.local_tracks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerSession for FakePeer {
    async fn add_local_tracks(&self, media: &LocalMedia) -> Result<()> {
        self.local_tracks
            .fetch_add(media.tracks().len(), Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("v=0 o={} offer", self.owner)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.remote.lock().is_none() {
            return Err(Error::Signaling("no remote offer".to_string()));
        }
        Ok(SessionDescription::answer(format!("v=0 o={} answer", self.owner)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Signaling("closed".to_string()));
        }
        if !description.sdp.starts_with("v=0") {
            return Err(Error::Signaling("invalid SDP".to_string()));
        }
        self.remote_sets.fetch_add(1, Ordering::SeqCst);
        *self.remote.lock() = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !self.is_closed() {
            self.candidates.lock().push(candidate);
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeConnector {
    owner: String,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeConnector {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers.lock().last().cloned().expect("no peer session created")
    }

    pub fn created(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: PeerEventSink,
    ) -> Result<Arc<dyn PeerSession>> {
        let peer = Arc::new(FakePeer::new(&self.owner, events));
        self.peers.lock().push(peer.clone());
        let session: Arc<dyn PeerSession> = peer;
        Ok(session)
    }
}

// ============================================================================
// Media, sound and call log
// ============================================================================

#[derive(Default)]
pub struct FakeMedia {
    deny: AtomicBool,
    tracks: Mutex<Vec<Arc<LocalTrack>>>,
}

impl FakeMedia {
    pub fn deny(&self) {
        self.deny.store(true, Ordering::SeqCst);
    }

    pub fn track(&self, kind: TrackKind) -> Arc<LocalTrack> {
        self.tracks
            .lock()
            .iter()
            .rev()
            .find(|t| t.kind() == kind)
            .cloned()
            .expect("no track of that kind")
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().iter().filter(|t| t.is_live()).count()
    }

    pub fn acquired(&self) -> usize {
        self.tracks.lock().len()
    }
}

#[async_trait]
impl MediaAcquirer for FakeMedia {
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }
        let media = LocalMedia::new(call_type);
        self.tracks.lock().extend(media.tracks().iter().cloned());
        Ok(media)
    }
}

#[derive(Default)]
pub struct RecordingCues {
    ringing: AtomicBool,
    played: Mutex<Vec<&'static str>>,
}

impl RecordingCues {
    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<&'static str> {
        self.played.lock().clone()
    }
}

impl SoundCues for RecordingCues {
    fn play_ringtone(&self) {
        if !self.ringing.swap(true, Ordering::SeqCst) {
            self.played.lock().push("ringtone");
        }
    }

    fn stop_ringtone(&self) {
        self.ringing.store(false, Ordering::SeqCst);
    }

    fn play_connect_cue(&self) {
        self.played.lock().push("connect");
    }

    fn play_end_cue(&self) {
        self.played.lock().push("end");
    }
}

#[derive(Default)]
pub struct FakeCallLog {
    next_id: AtomicU64,
    fail_start: AtomicBool,
    starts: Mutex<Vec<StartCallRequest>>,
    updates: Mutex<Vec<(String, StatusUpdate)>>,
}

impl FakeCallLog {
    pub fn fail_starts(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn starts(&self) -> Vec<StartCallRequest> {
        self.starts.lock().clone()
    }

    pub fn updates_for(&self, call_id: &str) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .iter()
            .filter(|(id, _)| id == call_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    pub fn statuses_for(&self, call_id: &str) -> Vec<CallLogStatus> {
        self.updates_for(call_id).iter().map(|u| u.status).collect()
    }
}

#[async_trait]
impl CallLogApi for FakeCallLog {
    async fn start_call(&self, request: &StartCallRequest) -> Result<CallLogRecord> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::Persistence("call log unavailable".to_string()));
        }
        self.starts.lock().push(request.clone());
        let id = 100 + self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CallLogRecord {
            id: id.to_string(),
            status: Some(CallLogStatus::Ringing),
        })
    }

    async fn update_status(&self, call_id: &str, update: &StatusUpdate) -> Result<()> {
        self.updates
            .lock()
            .push((call_id.to_string(), update.clone()));
        Ok(())
    }
}

// ============================================================================
// Parties
// ============================================================================

pub struct Party {
    pub user: Participant,
    pub calls: CallHandle,
    pub transport: Arc<FakeTransport>,
    pub peers: Arc<FakeConnector>,
    pub media: Arc<FakeMedia>,
    pub cues: Arc<RecordingCues>,
}

impl Party {
    pub fn join(board: &Arc<Switchboard>, log: &Arc<FakeCallLog>, id: &str, name: &str) -> Self {
        let transport = board.line(id);
        let peers = Arc::new(FakeConnector::new(id));
        let media = Arc::new(FakeMedia::default());
        let cues = Arc::new(RecordingCues::default());

        let deps = CallDeps {
            transport: transport.clone(),
            peers: peers.clone(),
            media: media.clone(),
            sounds: cues.clone(),
            call_log: log.clone(),
        };
        let user = Participant::new(id, name);
        let calls = call::spawn(user.clone(), CallConfig::default(), deps);

        Self {
            user,
            calls,
            transport,
            peers,
            media,
            cues,
        }
    }

    pub fn status(&self) -> CallStatus {
        self.calls.snapshot().status
    }

    pub fn call_id(&self) -> String {
        self.calls.snapshot().call_id.expect("no live call")
    }
}

/// Let every queued event run to completion. Needs a paused clock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn drain(notices: &mut broadcast::Receiver<CallNotice>) -> Vec<CallNotice> {
    let mut out = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        out.push(notice);
    }
    out
}

/// The sequence of statuses a call walked through, starting state first.
pub fn status_path(notices: &[CallNotice]) -> Vec<CallStatus> {
    let mut path = Vec::new();
    for notice in notices {
        if let CallNotice::StatusChanged { from, to, .. } = notice {
            if path.is_empty() {
                path.push(*from);
            }
            path.push(*to);
        }
    }
    path
}

pub fn end_reason(notices: &[CallNotice]) -> Option<(EndReason, u64)> {
    notices.iter().find_map(|notice| match notice {
        CallNotice::Ended {
            reason,
            duration_seconds,
            ..
        } => Some((reason.clone(), *duration_seconds)),
        _ => None,
    })
}

/// Alice calls Bob, Bob accepts and both peers report remote media.
pub async fn connect_pair(alice: &Party, bob: &Party, call_type: CallType) {
    alice
        .calls
        .start_call("room-1", &bob.user.id, bob.user.clone(), call_type)
        .await
        .unwrap();
    settle().await;

    bob.calls.accept_call().await.unwrap();
    settle().await;

    alice.peers.last().emit(PeerEvent::RemoteTrack(TrackKind::Audio));
    bob.peers.last().emit(PeerEvent::RemoteTrack(TrackKind::Audio));
    settle().await;

    assert_eq!(alice.status(), CallStatus::Connected);
    assert_eq!(bob.status(), CallStatus::Connected);
}
