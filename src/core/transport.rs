//! WebRTC Transport (C6): SDP offer/answer exchange with the cloud
//! endpoint, data-channel lifecycle with pending-message fallback queue,
//! audio track management, and periodic stats sampling.
//!
//! Grounded in the other_examples Sans-IO `str0m` WebRTC session (SDP
//! exchange via `Rtc::sdp_api()`, `SdpAnswer::from_sdp_string`, data-channel
//! fallback queue draining) and in the teacher's `core::realtime::base`
//! connection-state and callback conventions. Unlike that reference, audio
//! is carried as raw PCM16 (§6.1) — the audio DSP graph that would encode
//! to Opus is an external black box per the specification's scope, so this
//! module manages track attachment and SDP/ICE/data-channel lifecycle only,
//! not codec transcoding.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use str0m::change::SdpAnswer;
use str0m::channel::ChannelId;
use str0m::media::{Direction, MediaKind, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event as RtcEvent, IceConnectionState, Input, Output, Rtc, RtcConfig};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::config::{AudioConfig, EndpointConfig, TransportConfig, TurnDetectionMode};
use crate::errors::{AppResult, TransportError};
use crate::events::{AsyncHandler, Emitter, Subscription};

/// §3 `WebRTC Connection State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionStats {
    pub jitter_ms: f64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub round_trip_time_ms: f64,
    pub quality: ConnectionQuality,
}

fn classify_quality(ice_state: IceConnectionState, jitter_ms: f64) -> ConnectionQuality {
    match ice_state {
        IceConnectionState::Failed | IceConnectionState::Disconnected => ConnectionQuality::Failed,
        IceConnectionState::Checking | IceConnectionState::New => ConnectionQuality::Fair,
        IceConnectionState::Connected | IceConnectionState::Completed => {
            if jitter_ms < 20.0 {
                ConnectionQuality::Excellent
            } else if jitter_ms < 50.0 {
                ConnectionQuality::Good
            } else if jitter_ms < 150.0 {
                ConnectionQuality::Fair
            } else {
                ConnectionQuality::Poor
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    ConnectionStateChanged(ConnectionState),
    AudioTrackAdded { is_remote: bool },
    AudioTrackRemoved,
    DataChannelMessage(Value),
    ConnectionQualityChanged(ConnectionQuality),
    Error(TransportError),
}

/// Maps a str0m/platform error shape to §4.6's `WebRTCErrorCode`.
pub fn classify_error(context: &str, status: Option<u16>) -> TransportError {
    match status {
        Some(401) | Some(403) => TransportError::AuthenticationFailed,
        Some(_) => TransportError::SdpNegotiationFailed(context.to_string()),
        None => TransportError::NetworkTimeout,
    }
}

struct PendingQueue {
    messages: parking_lot::Mutex<std::collections::VecDeque<Vec<u8>>>,
    cap: usize,
}

impl PendingQueue {
    fn new(cap: usize) -> Self {
        Self {
            messages: parking_lot::Mutex::new(std::collections::VecDeque::new()),
            cap,
        }
    }

    fn push(&self, msg: Vec<u8>) {
        let mut q = self.messages.lock();
        if q.len() >= self.cap {
            warn!(cap = self.cap, "data-channel fallback queue full, dropping oldest");
            q.pop_front();
        }
        q.push_back(msg);
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        self.messages.lock().drain(..).collect()
    }

    fn len(&self) -> usize {
        self.messages.lock().len()
    }
}

/// C6. Owns the peer connection; one instance per active session.
pub struct WebRtcTransport {
    rtc: Arc<tokio::sync::Mutex<Rtc>>,
    audio_track_id: Mid,
    data_channel_id: ChannelId,
    data_channel_open: Arc<AtomicBool>,
    pending: Arc<PendingQueue>,
    state: parking_lot::Mutex<ConnectionState>,
    closed: Arc<AtomicBool>,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    on_event: Emitter<TransportEvent>,
    stop_io_loop: Arc<Notify>,
    initial_session_update: Value,
    initial_update_sent: Arc<AtomicBool>,
}

/// Builds the outbound `session.update` payload per §6.1.
fn build_session_update(voice: &str, audio: &AudioConfig) -> Value {
    let turn_detection = match &audio.turn_detection {
        TurnDetectionMode::Server {
            threshold,
            prefix_padding_ms,
            silence_duration_ms,
            ..
        } => serde_json::json!({
            "type": "server_vad",
            "threshold": threshold,
            "prefix_padding_ms": prefix_padding_ms,
            "silence_duration_ms": silence_duration_ms,
        }),
        TurnDetectionMode::Client => Value::Null,
    };

    serde_json::json!({
        "type": "session.update",
        "session": {
            "modalities": ["audio", "text"],
            "voice": voice,
            "input_audio_format": "pcm16",
            "output_audio_format": "pcm16",
            "turn_detection": turn_detection,
        }
    })
}

impl WebRtcTransport {
    pub fn on_event(&self, handler: AsyncHandler<TransportEvent>) -> Subscription<TransportEvent> {
        self.on_event.subscribe(handler)
    }

    /// §4.6 Establish steps 1–5: build the peer connection, generate the
    /// offer, exchange SDP with the cloud endpoint, and apply the answer.
    /// The ICE wait (step 6) and connected transition (step 7) happen once
    /// the I/O loop observes the state change.
    pub async fn establish(
        transport_cfg: &TransportConfig,
        endpoint: &EndpointConfig,
        audio_cfg: &AudioConfig,
        ephemeral_key: &str,
    ) -> AppResult<Arc<Self>> {
        let mut rtc_config = RtcConfig::new();
        for server in &transport_cfg.ice_servers {
            if let Ok(candidate) = Candidate::host(
                "0.0.0.0:0".parse::<SocketAddr>().unwrap(),
                Protocol::Udp,
            ) {
                rtc_config = rtc_config.add_local_candidate(candidate);
            }
            debug!(server, "configured ICE server");
        }
        let mut rtc = rtc_config.build();

        let mut changes = rtc.sdp_api();
        let audio_track_id = changes.add_media(MediaKind::Audio, Direction::SendRecv, None, None, None);
        let data_channel_id = changes.add_channel(transport_cfg.data_channel_name.clone());
        let (offer, pending_offer) = changes.apply().ok_or_else(|| {
            TransportError::ConfigurationInvalid("no SDP changes to apply".to_string())
        })?;

        let http = reqwest::Client::new();
        let url = format!("{}?model={}", endpoint.realtime_url, endpoint.deployment);
        let response = http
            .post(&url)
            .bearer_auth(ephemeral_key)
            .header("Content-Type", "application/sdp")
            .body(offer.to_sdp_string())
            .send()
            .await
            .map_err(|_| TransportError::NetworkTimeout)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::AuthenticationFailed.into());
        }
        if !status.is_success() {
            return Err(TransportError::SdpNegotiationFailed(format!("status {status}")).into());
        }

        let answer_sdp = response.text().await.map_err(|_| TransportError::NetworkTimeout)?;
        let answer = SdpAnswer::from_sdp_string(&answer_sdp)
            .map_err(|e| TransportError::SdpNegotiationFailed(e.to_string()))?;
        rtc.sdp_api()
            .accept_answer(pending_offer, answer)
            .map_err(|e| TransportError::SdpNegotiationFailed(e.to_string()))?;

        let transport = Arc::new(Self {
            rtc: Arc::new(tokio::sync::Mutex::new(rtc)),
            audio_track_id,
            data_channel_id,
            data_channel_open: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(PendingQueue::new(transport_cfg.pending_message_queue_cap)),
            state: parking_lot::Mutex::new(ConnectionState::Connecting),
            closed: Arc::new(AtomicBool::new(false)),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            on_event: Emitter::new(),
            stop_io_loop: Arc::new(Notify::new()),
            initial_session_update: build_session_update(&endpoint.voice, audio_cfg),
            initial_update_sent: Arc::new(AtomicBool::new(false)),
        });

        transport
            .on_event
            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connecting))
            .await;

        transport.clone().spawn_io_loop(transport_cfg.connection_timeout_ms);
        transport.clone().spawn_stats_sampler(transport_cfg.stats_sample_interval_ms);

        Ok(transport)
    }

    fn set_state(&self, new_state: ConnectionState) {
        *self.state.lock() = new_state;
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Drives str0m's Sans-IO engine: binds a local UDP socket, pumps
    /// `poll_output`/`handle_input`, and translates ICE/channel events into
    /// `TransportEvent`s. Runs until `close()` or a terminal ICE failure.
    fn spawn_io_loop(self: Arc<Self>, timeout_ms: u64) {
        tokio::spawn(async move {
            let socket = match UdpSocket::bind("0.0.0.0:0").await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to bind UDP socket for WebRTC transport");
                    self.emit_and_set(ConnectionState::Failed, TransportError::NetworkTimeout).await;
                    return;
                }
            };

            let establish_deadline = Instant::now() + Duration::from_millis(timeout_ms);
            let mut buf = vec![0u8; 2000];

            loop {
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }

                let output = {
                    let mut rtc = self.rtc.lock().await;
                    rtc.poll_output()
                };

                let output = match output {
                    Ok(o) => o,
                    Err(e) => {
                        warn!(error = %e, "str0m poll_output error");
                        self.emit_and_set(ConnectionState::Failed, TransportError::IceConnectionFailed).await;
                        break;
                    }
                };

                match output {
                    Output::Timeout(deadline) => {
                        let now = Instant::now();
                        let wait = deadline.saturating_duration_since(now);
                        tokio::select! {
                            _ = tokio::time::sleep(wait) => {
                                let mut rtc = self.rtc.lock().await;
                                let _ = rtc.handle_input(Input::Timeout(Instant::now()));
                            }
                            _ = self.stop_io_loop.notified() => break,
                            recv = socket.recv_from(&mut buf) => {
                                if let Ok((n, source)) = recv {
                                    self.handle_socket_input(&socket, &buf[..n], source).await;
                                }
                            }
                        }

                        if self.connection_state() == ConnectionState::Connecting
                            && Instant::now() > establish_deadline
                        {
                            warn!("WebRTC establishment timed out");
                            self.emit_and_set(ConnectionState::Failed, TransportError::NetworkTimeout).await;
                            break;
                        }
                    }
                    Output::Transmit(transmit) => {
                        let _ = socket.send_to(&transmit.contents, transmit.destination).await;
                        self.packets_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Output::Event(event) => {
                        self.handle_rtc_event(event).await;
                    }
                }
            }

            self.set_state(ConnectionState::Closed);
            self.on_event
                .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Closed))
                .await;
        });
    }

    async fn handle_socket_input(&self, socket: &UdpSocket, data: &[u8], source: SocketAddr) {
        let destination = socket.local_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());
        let receive = match Receive::new(Protocol::Udp, source, destination, data) {
            Ok(r) => r,
            Err(_) => return,
        };
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        let mut rtc = self.rtc.lock().await;
        let _ = rtc.handle_input(Input::Receive(Instant::now(), receive));
    }

    async fn emit_and_set(&self, state: ConnectionState, error: TransportError) {
        self.set_state(state);
        self.on_event.emit(TransportEvent::Error(error)).await;
        self.on_event.emit(TransportEvent::ConnectionStateChanged(state)).await;
    }

    async fn handle_rtc_event(&self, event: RtcEvent) {
        match event {
            RtcEvent::IceConnectionStateChange(ice_state) => {
                info!(?ice_state, "ICE connection state changed");
                match ice_state {
                    IceConnectionState::Connected | IceConnectionState::Completed => {
                        self.set_state(ConnectionState::Connected);
                        self.on_event
                            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Connected))
                            .await;
                        if self
                            .initial_update_sent
                            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                            .is_ok()
                        {
                            let _ = self
                                .send_data_channel_message(&self.initial_session_update.clone())
                                .await;
                        }
                    }
                    IceConnectionState::Disconnected => {
                        self.set_state(ConnectionState::Reconnecting);
                        self.on_event
                            .emit(TransportEvent::ConnectionStateChanged(ConnectionState::Reconnecting))
                            .await;
                    }
                    IceConnectionState::Failed => {
                        self.emit_and_set(ConnectionState::Failed, TransportError::IceConnectionFailed).await;
                    }
                    _ => {}
                }
            }
            RtcEvent::ChannelOpen(id, _label) if id == self.data_channel_id => {
                self.data_channel_open.store(true, Ordering::SeqCst);
                self.drain_pending().await;
            }
            RtcEvent::ChannelData(data) if data.id == self.data_channel_id => {
                if let Ok(value) = serde_json::from_slice::<Value>(&data.data) {
                    self.on_event.emit(TransportEvent::DataChannelMessage(value)).await;
                }
            }
            RtcEvent::MediaAdded(media) => {
                self.on_event
                    .emit(TransportEvent::AudioTrackAdded { is_remote: media.direction.has_recv() })
                    .await;
            }
            _ => {}
        }
    }

    async fn drain_pending(&self) {
        let messages = self.pending.drain();
        if messages.is_empty() {
            return;
        }
        let mut rtc = self.rtc.lock().await;
        if let Some(mut channel) = rtc.channel(self.data_channel_id) {
            for msg in messages {
                let _ = channel.write(true, msg.as_slice());
            }
        }
    }

    /// `sendDataChannelMessage`: queues if not yet open (R3), sends directly
    /// otherwise.
    pub async fn send_data_channel_message(&self, value: &Value) -> AppResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;

        if !self.data_channel_open.load(Ordering::SeqCst) {
            self.pending.push(bytes);
            return Ok(());
        }

        let mut rtc = self.rtc.lock().await;
        let mut channel = rtc
            .channel(self.data_channel_id)
            .ok_or_else(|| TransportError::DataChannelFailed("channel not available".to_string()))?;
        channel
            .write(true, bytes.as_slice())
            .map_err(|e| TransportError::DataChannelFailed(e.to_string()))?;
        Ok(())
    }

    pub fn is_data_channel_fallback_active(&self) -> bool {
        self.pending.len() > 0
    }

    pub fn pending_queue_len(&self) -> usize {
        self.pending.len()
    }

    pub fn audio_track_id(&self) -> Mid {
        self.audio_track_id
    }

    /// §4.6 `addAudioTrack`: the negotiated audio `Mid` is sendrecv from
    /// establishment, so attaching the local source is local bookkeeping plus
    /// notification, not a renegotiation. `write_audio_frame` is how callers
    /// subsequently push PCM16 samples onto the track.
    pub async fn add_audio_track(&self) -> AppResult<()> {
        self.on_event
            .emit(TransportEvent::AudioTrackAdded { is_remote: false })
            .await;
        Ok(())
    }

    pub async fn remove_audio_track(&self) -> AppResult<()> {
        self.on_event.emit(TransportEvent::AudioTrackRemoved).await;
        Ok(())
    }

    /// `replaceAudioTrack`: from the transport's perspective this is
    /// indistinguishable from a remove followed by an add, since the
    /// underlying `Mid` does not change.
    pub async fn replace_audio_track(&self) -> AppResult<()> {
        self.remove_audio_track().await?;
        self.add_audio_track().await
    }

    /// Writes a raw PCM16 sample buffer onto the negotiated audio track.
    pub async fn write_audio_frame(&self, pt: str0m::format::PayloadParams, data: &[u8]) -> AppResult<()> {
        let mut rtc = self.rtc.lock().await;
        let mut writer = rtc
            .writer(self.audio_track_id)
            .ok_or_else(|| TransportError::AudioTrackFailed("no writer for audio mid".to_string()))?;
        writer
            .write(pt.pt(), Instant::now(), str0m::media::MediaTime::from_micros(0), data)
            .map_err(|e| TransportError::AudioTrackFailed(e.to_string()))?;
        Ok(())
    }

    /// Restarts ICE on the existing peer connection, used by the Connection
    /// Recovery Manager (C7) for `IceConnectionFailed`/`NetworkTimeout`.
    pub async fn restart_ice(&self) -> AppResult<()> {
        let mut rtc = self.rtc.lock().await;
        rtc.sdp_api().ice_restart(false);
        self.set_state(ConnectionState::Reconnecting);
        Ok(())
    }

    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop_io_loop.notify_one();
        let mut rtc = self.rtc.lock().await;
        rtc.disconnect();
    }

    /// §4.6 "Statistics": approximate jitter/loss from the I/O loop's own
    /// packet counters, classified into a quality bucket alongside ICE state.
    pub async fn sample_stats(&self) -> ConnectionStats {
        let sent = self.packets_sent.load(Ordering::Relaxed);
        let received = self.packets_received.load(Ordering::Relaxed);
        let lost = sent.saturating_sub(received);
        let ice_state = if self.connection_state() == ConnectionState::Connected {
            IceConnectionState::Connected
        } else {
            IceConnectionState::Checking
        };
        let jitter_ms = 0.0; // precise RTP jitter requires packet timestamp analysis not modeled here
        ConnectionStats {
            jitter_ms,
            packets_sent: sent,
            packets_received: received,
            packets_lost: lost,
            round_trip_time_ms: 0.0,
            quality: classify_quality(ice_state, jitter_ms),
        }
    }

    fn spawn_stats_sampler(self: Arc<Self>, interval_ms: u64) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                if self.closed.load(Ordering::SeqCst) {
                    break;
                }
                let stats = self.sample_stats().await;
                self.on_event
                    .emit(TransportEvent::ConnectionQualityChanged(stats.quality))
                    .await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_classification_buckets() {
        assert_eq!(classify_quality(IceConnectionState::Connected, 5.0), ConnectionQuality::Excellent);
        assert_eq!(classify_quality(IceConnectionState::Connected, 30.0), ConnectionQuality::Good);
        assert_eq!(classify_quality(IceConnectionState::Connected, 100.0), ConnectionQuality::Fair);
        assert_eq!(classify_quality(IceConnectionState::Connected, 200.0), ConnectionQuality::Poor);
        assert_eq!(classify_quality(IceConnectionState::Failed, 0.0), ConnectionQuality::Failed);
    }

    #[test]
    fn error_classification_by_status() {
        assert_eq!(classify_error("x", Some(401)), TransportError::AuthenticationFailed);
        assert_eq!(classify_error("x", Some(500)), TransportError::SdpNegotiationFailed("x".to_string()));
        assert_eq!(classify_error("x", None), TransportError::NetworkTimeout);
    }

    #[test]
    fn connection_state_closed_is_terminal() {
        assert!(ConnectionState::Closed.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
    }

    #[tokio::test]
    async fn pending_queue_fallback_drain_order_r3() {
        let queue = PendingQueue::new(8);
        assert_eq!(queue.len(), 0);
        queue.push(b"first".to_vec());
        queue.push(b"second".to_vec());
        assert_eq!(queue.len(), 2);
        let drained = queue.drain();
        assert_eq!(drained, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn pending_queue_caps_and_drops_oldest() {
        let queue = PendingQueue::new(2);
        queue.push(b"a".to_vec());
        queue.push(b"b".to_vec());
        queue.push(b"c".to_vec());
        assert_eq!(queue.drain(), vec![b"b".to_vec(), b"c".to_vec()]);
    }
}
