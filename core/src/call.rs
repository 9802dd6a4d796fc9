//! Call state machine
//!
//! `CallMachine` owns at most one live `CallSession`. Everything that can move
//! a call forward (user commands, inbound signals, peer callbacks, timers) is
//! turned into a `CallEvent` and pushed onto one queue. A single task drains
//! that queue, so each transition finishes before the next event is examined
//! and no locking is needed around the session.

use crate::config::CallConfig;
use crate::error::{Error, Result};
use crate::media::{LocalMedia, MediaAcquirer, TrackKind};
use crate::models::*;
use crate::network::{CallLogApi, RealtimeEvent, SignalingTransport};
use crate::peer::{PeerConnectionState, PeerConnector, PeerEvent, PeerEventSink, PeerSession};
use crate::sound::SoundCues;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const NOTICE_BUFFER: usize = 64;

/// The collaborators a call engine talks to.
#[derive(Clone)]
pub struct CallDeps {
    pub transport: Arc<dyn SignalingTransport>,
    pub peers: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaAcquirer>,
    pub sounds: Arc<dyn SoundCues>,
    pub call_log: Arc<dyn CallLogApi>,
}

#[derive(Debug, Clone)]
pub enum CallCommand {
    Start {
        room_id: String,
        receiver_id: String,
        counterpart: Participant,
        call_type: CallType,
    },
    Accept,
    Decline,
    End,
    ToggleMute,
    ToggleVideo,
}

pub enum CallEvent {
    Command {
        command: CallCommand,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    Signal(SignalingEnvelope),
    Peer {
        call_id: String,
        event: PeerEvent,
    },
    RingingTimeout {
        call_id: String,
    },
    Tick {
        call_id: String,
    },
    /// Hang up whatever is live and stop the engine.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// This side hung up.
    Hangup,
    RemoteHangup,
    /// This side declined the incoming call.
    Declined,
    RemoteDeclined,
    /// Nobody answered before the ringing timeout.
    Missed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    StatusChanged {
        call_id: String,
        from: CallStatus,
        to: CallStatus,
    },
    /// Always follows the Ended/Idle status pair. `duration_seconds` is the
    /// connected time frozen at teardown, since the snapshot is already reset.
    Ended {
        call_id: String,
        reason: EndReason,
        duration_seconds: u64,
    },
    /// An offer arrived while another call was live and was declined.
    Busy { call_id: String, from: Participant },
}

struct CallSession {
    call_id: String,
    room_id: String,
    remote_user: String,
    counterpart: Participant,
    call_type: CallType,
    direction: CallDirection,
    status: CallStatus,
    duration_seconds: u64,
    connected: bool,
    is_muted: bool,
    is_video_enabled: bool,
    /// Whether the counterpart knows this call exists and must be told it ended.
    counterpart_aware: bool,
    media: Option<LocalMedia>,
    peer: Option<Arc<dyn PeerSession>>,
    remote_offer: Option<SessionDescription>,
    remote_applied: bool,
    pending_candidates: Vec<IceCandidate>,
    ringing_timer: Option<JoinHandle<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(
        call_id: String,
        room_id: String,
        remote_user: String,
        counterpart: Participant,
        call_type: CallType,
        direction: CallDirection,
    ) -> Self {
        Self {
            call_id,
            room_id,
            remote_user,
            counterpart,
            call_type,
            direction,
            status: CallStatus::Idle,
            duration_seconds: 0,
            connected: false,
            is_muted: false,
            is_video_enabled: call_type.has_video(),
            counterpart_aware: false,
            media: None,
            peer: None,
            remote_offer: None,
            remote_applied: false,
            pending_candidates: Vec::new(),
            ringing_timer: None,
            ticker: None,
        }
    }

    fn is_ringing(&self, direction: CallDirection) -> bool {
        self.status == CallStatus::Ringing && self.direction == direction
    }

    fn envelope(&self, signal: Signal) -> SignalingEnvelope {
        SignalingEnvelope::new(&self.room_id, &self.call_id, &self.remote_user, signal)
    }

    fn cancel_ringing_timer(&mut self) {
        if let Some(timer) = self.ringing_timer.take() {
            timer.abort();
        }
    }

    fn stop_timers(&mut self) {
        self.cancel_ringing_timer();
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: Some(self.call_id.clone()),
            room_id: Some(self.room_id.clone()),
            status: self.status,
            call_type: Some(self.call_type),
            direction: Some(self.direction),
            counterpart: Some(self.counterpart.clone()),
            duration_seconds: self.duration_seconds,
            is_muted: self.is_muted,
            is_video_enabled: self.is_video_enabled,
        }
    }
}

fn no_session() -> Error {
    Error::InvalidState("no call in progress".to_string())
}

pub struct CallMachine {
    profile: Participant,
    config: CallConfig,
    deps: CallDeps,
    session: Option<CallSession>,
    events: mpsc::UnboundedSender<CallEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallMachine {
    /// Build an engine for the signed-in user `profile`. The returned queue
    /// must be handed to `run`.
    pub fn new(
        profile: Participant,
        config: CallConfig,
        deps: CallDeps,
    ) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, queue) = mpsc::unbounded_channel();
        let (snapshot, _) = watch::channel(CallSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let machine = Self {
            profile,
            config,
            deps,
            session: None,
            events,
            snapshot,
            notices,
        };
        (machine, queue)
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            events: self.events.clone(),
            snapshot: self.snapshot.subscribe(),
            notices: self.notices.clone(),
        }
    }

    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<CallEvent>) {
        while let Some(event) = queue.recv().await {
            if let CallEvent::Shutdown = event {
                break;
            }
            self.handle_event(event).await;
        }

        self.hang_up().await;
        log::info!("Call engine stopped");
    }

    pub async fn handle_event(&mut self, event: CallEvent) {
        match event {
            CallEvent::Command { command, reply } => {
                let result = self.handle_command(command).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            log::warn!("Call command failed: {}", e);
                        }
                    }
                }
            }
            CallEvent::Signal(envelope) => self.handle_signal(envelope).await,
            CallEvent::Peer { call_id, event } => {
                if self.is_current(&call_id) {
                    self.handle_peer_event(event).await;
                } else {
                    log::debug!("Dropping stale peer event for call {}", call_id);
                }
            }
            CallEvent::RingingTimeout { call_id } => {
                if self.is_current(&call_id) {
                    self.ringing_timed_out().await;
                }
            }
            CallEvent::Tick { call_id } => {
                if self.is_current(&call_id) {
                    self.tick();
                }
            }
            CallEvent::Shutdown => self.hang_up().await,
        }
    }

    fn is_current(&self, call_id: &str) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.call_id == call_id)
    }

    async fn handle_command(&mut self, command: CallCommand) -> Result<()> {
        match command {
            CallCommand::Start {
                room_id,
                receiver_id,
                counterpart,
                call_type,
            } => {
                self.start_call(room_id, receiver_id, counterpart, call_type)
                    .await
            }
            CallCommand::Accept => self.accept_call().await,
            CallCommand::Decline => self.decline_call().await,
            CallCommand::End => {
                self.hang_up().await;
                Ok(())
            }
            CallCommand::ToggleMute => {
                self.toggle_mute();
                Ok(())
            }
            CallCommand::ToggleVideo => {
                self.toggle_video();
                Ok(())
            }
        }
    }

    // ========================================================================
    // User actions
    // ========================================================================

    async fn start_call(
        &mut self,
        room_id: String,
        receiver_id: String,
        counterpart: Participant,
        call_type: CallType,
    ) -> Result<()> {
        if let Some(ref session) = self.session {
            return Err(Error::InvalidState(format!(
                "call {} is still {:?}",
                session.call_id, session.status
            )));
        }

        let request = StartCallRequest {
            room_id: room_id.clone(),
            receiver_id: receiver_id.clone(),
            call_type,
        };
        let call_id = match self.deps.call_log.start_call(&request).await {
            Ok(record) => record.id,
            Err(e) => {
                let fallback = uuid::Uuid::new_v4().to_string();
                log::warn!("Failed to create call log, continuing as {}: {}", fallback, e);
                fallback
            }
        };

        log::info!("Starting {:?} call {} to {}", call_type, call_id, receiver_id);
        self.session = Some(CallSession::new(
            call_id,
            room_id,
            receiver_id,
            counterpart,
            call_type,
            CallDirection::Outgoing,
        ));
        self.transition(CallStatus::Initiating);

        if let Err(e) = self.send_offer().await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_offer(&mut self) -> Result<()> {
        let call_type = self.session.as_ref().ok_or_else(no_session)?.call_type;
        let peer = self.prepare_peer(call_type).await?;

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer.clone()).await?;

        let from = self.profile.clone();
        let session = self.session.as_mut().ok_or_else(no_session)?;
        self.deps.transport.send(session.envelope(Signal::CallOffer {
            call_type,
            offer,
            from,
        }))?;

        session.counterpart_aware = true;
        session.ringing_timer = Some(spawn_ringing_timer(
            self.events.clone(),
            session.call_id.clone(),
            self.config.ringing_timeout(),
        ));

        self.transition(CallStatus::Ringing);
        self.deps.sounds.play_ringtone();
        Ok(())
    }

    async fn accept_call(&mut self) -> Result<()> {
        match self.session {
            Some(ref session) if session.is_ringing(CallDirection::Incoming) => {}
            _ => return Err(Error::InvalidState("no incoming call to accept".to_string())),
        }

        self.deps.sounds.stop_ringtone();
        self.transition(CallStatus::Connecting);

        if let Err(e) = self.send_answer().await {
            self.fail(&e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn send_answer(&mut self) -> Result<()> {
        let session = self.session.as_mut().ok_or_else(no_session)?;
        let call_type = session.call_type;
        let offer = session
            .remote_offer
            .take()
            .ok_or_else(|| Error::Signaling("incoming call carries no offer".to_string()))?;

        let peer = self.prepare_peer(call_type).await?;
        peer.set_remote_description(offer).await?;
        self.flush_candidates(&peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer.clone()).await?;

        let from = self.profile.clone();
        let session = self.session.as_ref().ok_or_else(no_session)?;
        self.deps
            .transport
            .send(session.envelope(Signal::CallAnswer { answer, from }))?;
        Ok(())
    }

    async fn decline_call(&mut self) -> Result<()> {
        match self.session {
            Some(ref session) if session.is_ringing(CallDirection::Incoming) => {}
            _ => return Err(Error::InvalidState("no incoming call to decline".to_string())),
        }

        self.finish(
            EndReason::Declined,
            Some(Signal::CallDecline),
            Some(CallLogStatus::Declined),
        )
        .await;
        Ok(())
    }

    /// Manual hangup from any state. A no-op once the call is gone.
    async fn hang_up(&mut self) {
        let farewell = match self.session {
            Some(ref session) => session.counterpart_aware.then_some(Signal::CallEnd),
            None => return,
        };
        self.finish(EndReason::Hangup, farewell, Some(CallLogStatus::Ended))
            .await;
    }

    fn toggle_mute(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        let Some(ref media) = session.media else { return };

        session.is_muted = !session.is_muted;
        media.set_audio_enabled(!session.is_muted);
        self.publish();
    }

    fn toggle_video(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        let Some(ref media) = session.media else { return };
        if !media.has_video() {
            return;
        }

        session.is_video_enabled = !session.is_video_enabled;
        media.set_video_enabled(session.is_video_enabled);
        self.publish();
    }

    // ========================================================================
    // Inbound signaling
    // ========================================================================

    async fn handle_signal(&mut self, envelope: SignalingEnvelope) {
        if let Signal::CallOffer { ref from, .. } = envelope.signal {
            if !envelope.is_from(&from.id) {
                log::warn!(
                    "Dropping offer for call {}: sent by {:?} on behalf of {}",
                    envelope.call_id,
                    envelope.sender,
                    from.id
                );
                return;
            }
        }

        let from_counterpart = match self.session {
            Some(ref session) if session.call_id == envelope.call_id => {
                envelope.is_from(&session.remote_user)
            }
            _ => false,
        };

        let SignalingEnvelope {
            room_id,
            call_id,
            sender,
            signal,
            ..
        } = envelope;

        let signal = match signal {
            Signal::CallOffer {
                call_type,
                offer,
                from,
            } => {
                self.incoming_offer(room_id, call_id, call_type, offer, from);
                return;
            }
            other => other,
        };

        if !from_counterpart {
            log::debug!(
                "Dropping stale {} for call {} from {:?}",
                signal.kind(),
                call_id,
                sender
            );
            return;
        }

        match signal {
            Signal::CallAnswer { answer, .. } => self.remote_answer(answer).await,
            Signal::IceCandidate { candidate } => self.remote_candidate(candidate).await,
            Signal::CallEnd => self.finish(EndReason::RemoteHangup, None, None).await,
            Signal::CallDecline => self.finish(EndReason::RemoteDeclined, None, None).await,
            Signal::CallOffer { .. } => {}
        }
    }

    fn incoming_offer(
        &mut self,
        room_id: String,
        call_id: String,
        call_type: CallType,
        offer: SessionDescription,
        from: Participant,
    ) {
        if let Some(ref session) = self.session {
            if session.call_id == call_id {
                log::debug!("Duplicate offer for call {}", call_id);
                return;
            }

            log::info!("Busy with call {}, declining {} from {}", session.call_id, call_id, from.id);
            let decline = SignalingEnvelope::new(&room_id, &call_id, &from.id, Signal::CallDecline);
            if let Err(e) = self.deps.transport.send(decline) {
                log::warn!("Failed to decline concurrent call {}: {}", call_id, e);
            }
            let _ = self.notices.send(CallNotice::Busy { call_id, from });
            return;
        }

        log::info!("Incoming {:?} call {} from {}", call_type, call_id, from.id);
        let mut session = CallSession::new(
            call_id,
            room_id,
            from.id.clone(),
            from,
            call_type,
            CallDirection::Incoming,
        );
        session.remote_offer = Some(offer);
        session.counterpart_aware = true;

        self.session = Some(session);
        self.transition(CallStatus::Ringing);
        self.deps.sounds.play_ringtone();
    }

    async fn remote_answer(&mut self, answer: SessionDescription) {
        let peer = match self.session.as_mut() {
            Some(session) if session.is_ringing(CallDirection::Outgoing) => {
                match session.peer.clone() {
                    Some(peer) => {
                        session.cancel_ringing_timer();
                        peer
                    }
                    None => return,
                }
            }
            _ => {
                log::debug!("Ignoring call_answer outside outgoing ringing");
                return;
            }
        };

        self.transition(CallStatus::Connecting);
        match peer.set_remote_description(answer).await {
            Ok(()) => self.flush_candidates(&peer).await,
            Err(e) => self.fail(&e).await,
        }
    }

    async fn remote_candidate(&mut self, candidate: IceCandidate) {
        let max_pending = self.config.max_pending_candidates;
        let Some(session) = self.session.as_mut() else { return };

        match session.peer.clone() {
            Some(peer) if session.remote_applied => {
                if let Err(e) = peer.add_remote_candidate(candidate).await {
                    log::warn!("Failed to add remote candidate: {}", e);
                }
            }
            _ if session.pending_candidates.len() < max_pending => {
                session.pending_candidates.push(candidate);
            }
            _ => log::warn!("Candidate buffer full for call {}, dropping", session.call_id),
        }
    }

    async fn flush_candidates(&mut self, peer: &Arc<dyn PeerSession>) {
        let pending = match self.session.as_mut() {
            Some(session) => {
                session.remote_applied = true;
                std::mem::take(&mut session.pending_candidates)
            }
            None => return,
        };

        for candidate in pending {
            if let Err(e) = peer.add_remote_candidate(candidate).await {
                log::warn!("Failed to add buffered candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // Peer session and timers
    // ========================================================================

    /// Acquire local media and attach it to a fresh peer session. Both are
    /// stored on the session as soon as they exist so teardown releases them.
    async fn prepare_peer(&mut self, call_type: CallType) -> Result<Arc<dyn PeerSession>> {
        let media = self.deps.media.acquire(call_type).await?;

        let session = self.session.as_mut().ok_or_else(no_session)?;
        session.is_muted = false;
        session.is_video_enabled = media.has_video();
        session.media = Some(media);
        let call_id = session.call_id.clone();

        let sink = peer_sink(self.events.clone(), call_id);
        let peer = self.deps.peers.create(&self.config.ice_servers, sink).await?;

        let session = self.session.as_mut().ok_or_else(no_session)?;
        session.peer = Some(peer.clone());
        if let Some(ref media) = session.media {
            peer.add_local_tracks(media).await?;
        }

        self.publish();
        Ok(peer)
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let Some(ref session) = self.session else { return };
                let envelope = session.envelope(Signal::IceCandidate { candidate });
                if let Err(e) = self.deps.transport.send(envelope) {
                    log::warn!("Failed to send local candidate: {}", e);
                }
            }
            PeerEvent::RemoteTrack(kind) => self.media_flowing(kind).await,
            PeerEvent::StateChanged(state) => self.peer_state_changed(state).await,
        }
    }

    async fn media_flowing(&mut self, kind: TrackKind) {
        let Some(session) = self.session.as_mut() else { return };
        if session.status != CallStatus::Connecting {
            log::debug!("Remote {:?} track while {:?}", kind, session.status);
            return;
        }

        session.connected = true;
        session.ticker = Some(spawn_ticker(
            self.events.clone(),
            session.call_id.clone(),
            self.config.tick_interval(),
        ));
        let call_id = session.call_id.clone();

        self.transition(CallStatus::Connected);
        self.deps.sounds.stop_ringtone();
        self.deps.sounds.play_connect_cue();
        self.patch_log(&call_id, CallLogStatus::Connected, None).await;
    }

    async fn peer_state_changed(&mut self, state: PeerConnectionState) {
        let status = match self.session {
            Some(ref session) => session.status,
            None => return,
        };
        log::debug!("Peer connection {:?} while {:?}", state, status);

        if state.is_terminal() && matches!(status, CallStatus::Connecting | CallStatus::Connected) {
            let e = Error::PeerConnection(format!("connection {:?}", state).to_lowercase());
            self.fail(&e).await;
        }
    }

    async fn ringing_timed_out(&mut self) {
        match self.session {
            Some(ref session) if session.is_ringing(CallDirection::Outgoing) => {
                log::info!(
                    "Call {} unanswered after {:?}",
                    session.call_id,
                    self.config.ringing_timeout()
                );
            }
            _ => return,
        }

        self.finish(
            EndReason::Missed,
            Some(Signal::CallEnd),
            Some(CallLogStatus::Missed),
        )
        .await;
    }

    fn tick(&mut self) {
        match self.session.as_mut() {
            Some(session) if session.status == CallStatus::Connected => {
                session.duration_seconds += 1;
            }
            _ => return,
        }
        self.publish();
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    async fn fail(&mut self, error: &Error) {
        let farewell = match self.session {
            Some(ref session) => {
                log::warn!("Call {} failed: {}", session.call_id, error);
                session.counterpart_aware.then_some(Signal::CallEnd)
            }
            None => return,
        };

        self.finish(
            EndReason::Failed(error.to_string()),
            farewell,
            Some(CallLogStatus::Ended),
        )
        .await;
    }

    /// Ended is never stored: the session is released and the snapshot goes
    /// straight back to Idle. The call-log update runs last.
    async fn finish(
        &mut self,
        reason: EndReason,
        farewell: Option<Signal>,
        log_status: Option<CallLogStatus>,
    ) {
        let Some(mut session) = self.session.take() else { return };

        if let Some(signal) = farewell {
            let kind = signal.kind();
            if let Err(e) = self.deps.transport.send(session.envelope(signal)) {
                log::warn!("Failed to send {}: {}", kind, e);
            }
        }

        session.stop_timers();
        if let Some(peer) = session.peer.take() {
            peer.close().await;
        }
        if let Some(media) = session.media.take() {
            media.stop_all();
        }
        session.pending_candidates.clear();
        self.deps.sounds.stop_ringtone();
        self.deps.sounds.play_end_cue();

        let call_id = session.call_id.clone();
        let duration = session.duration_seconds;
        log::info!("Call {} ended ({:?}) after {}s", call_id, reason, duration);

        for (from, to) in [
            (session.status, CallStatus::Ended),
            (CallStatus::Ended, CallStatus::Idle),
        ] {
            let _ = self.notices.send(CallNotice::StatusChanged {
                call_id: call_id.clone(),
                from,
                to,
            });
        }
        let _ = self.notices.send(CallNotice::Ended {
            call_id: call_id.clone(),
            reason,
            duration_seconds: duration,
        });
        self.publish();

        if let Some(status) = log_status {
            let duration = session.connected.then_some(duration);
            self.patch_log(&call_id, status, duration).await;
        }
    }

    fn transition(&mut self, to: CallStatus) {
        let Some(session) = self.session.as_mut() else { return };
        let from = session.status;
        if from == to {
            return;
        }

        session.status = to;
        log::debug!("Call {}: {:?} -> {:?}", session.call_id, from, to);
        let _ = self.notices.send(CallNotice::StatusChanged {
            call_id: session.call_id.clone(),
            from,
            to,
        });
        self.publish();
    }

    fn publish(&self) {
        let snapshot = self
            .session
            .as_ref()
            .map(CallSession::snapshot)
            .unwrap_or_default();
        self.snapshot.send_replace(snapshot);
    }

    async fn patch_log(&self, call_id: &str, status: CallLogStatus, duration: Option<u64>) {
        let update = StatusUpdate { status, duration };
        if let Err(e) = self.deps.call_log.update_status(call_id, &update).await {
            log::warn!("Failed to mark call {} as {:?}: {}", call_id, status, e);
        }
    }
}

fn peer_sink(events: mpsc::UnboundedSender<CallEvent>, call_id: String) -> PeerEventSink {
    Arc::new(move |event| {
        let _ = events.send(CallEvent::Peer {
            call_id: call_id.clone(),
            event,
        });
    })
}

fn spawn_ringing_timer(
    events: mpsc::UnboundedSender<CallEvent>,
    call_id: String,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        let _ = events.send(CallEvent::RingingTimeout { call_id });
    })
}

fn spawn_ticker(
    events: mpsc::UnboundedSender<CallEvent>,
    call_id: String,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            interval.tick().await;
            if events
                .send(CallEvent::Tick {
                    call_id: call_id.clone(),
                })
                .is_err()
            {
                break;
            }
        }
    })
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable front door to a running `CallMachine`.
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<CallEvent>,
    snapshot: watch::Receiver<CallSnapshot>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallHandle {
    pub async fn start_call(
        &self,
        room_id: &str,
        receiver_id: &str,
        counterpart: Participant,
        call_type: CallType,
    ) -> Result<()> {
        self.command(CallCommand::Start {
            room_id: room_id.to_string(),
            receiver_id: receiver_id.to_string(),
            counterpart,
            call_type,
        })
        .await
    }

    pub async fn accept_call(&self) -> Result<()> {
        self.command(CallCommand::Accept).await
    }

    pub async fn decline_call(&self) -> Result<()> {
        self.command(CallCommand::Decline).await
    }

    pub async fn end_call(&self) -> Result<()> {
        self.command(CallCommand::End).await
    }

    pub async fn toggle_mute(&self) -> Result<()> {
        self.command(CallCommand::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<()> {
        self.command(CallCommand::ToggleVideo).await
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Hang up any live call, then stop the engine.
    pub async fn shutdown(&self) {
        if let Err(e) = self.end_call().await {
            log::debug!("Hangup on shutdown skipped: {}", e);
        }
        let _ = self.events.send(CallEvent::Shutdown);
    }

    async fn command(&self, command: CallCommand) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.events
            .send(CallEvent::Command {
                command,
                reply: Some(tx),
            })
            .map_err(|_| Error::EngineStopped)?;

        rx.await.map_err(|_| Error::EngineStopped)?
    }
}

/// Start a call engine on the current runtime, fed by `deps.transport`.
pub fn spawn(profile: Participant, config: CallConfig, deps: CallDeps) -> CallHandle {
    let inbound = deps.transport.subscribe();
    let (machine, queue) = CallMachine::new(profile, config, deps);
    let handle = machine.handle();

    tokio::spawn(forward_signals(inbound, handle.events.clone()));
    tokio::spawn(machine.run(queue));
    handle
}

async fn forward_signals(
    mut inbound: broadcast::Receiver<RealtimeEvent>,
    events: mpsc::UnboundedSender<CallEvent>,
) {
    loop {
        match inbound.recv().await {
            Ok(RealtimeEvent::Signal(envelope)) => {
                if events.send(CallEvent::Signal(envelope)).is_err() {
                    break;
                }
            }
            Ok(RealtimeEvent::Disconnected) => {
                log::debug!("Signaling offline, live calls continue on the peer connection");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Call engine missed {} realtime events", missed);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_snapshot_mirrors_fields() {
        let mut session = CallSession::new(
            "c-1".to_string(),
            "room".to_string(),
            "bob".to_string(),
            Participant::new("bob", "Bob"),
            CallType::Video,
            CallDirection::Outgoing,
        );
        session.status = CallStatus::Connected;
        session.duration_seconds = 12;
        session.is_muted = true;

        let snapshot = session.snapshot();
        assert_eq!(snapshot.call_id.as_deref(), Some("c-1"));
        assert_eq!(snapshot.status, CallStatus::Connected);
        assert_eq!(snapshot.duration_seconds, 12);
        assert!(snapshot.is_muted);
        assert!(snapshot.is_video_enabled);
    }

    #[test]
    fn envelope_routes_to_remote_user() {
        let session = CallSession::new(
            "c-2".to_string(),
            "room".to_string(),
            "bob".to_string(),
            Participant::new("bob", "Bob"),
            CallType::Audio,
            CallDirection::Incoming,
        );

        let envelope = session.envelope(Signal::CallEnd);
        assert_eq!(envelope.to, "bob");
        assert_eq!(envelope.call_id, "c-2");
        assert!(!session.is_ringing(CallDirection::Incoming));
    }
}
