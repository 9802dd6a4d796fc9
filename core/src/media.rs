//! Local capture streams and media acquisition

use crate::config::MediaConfig;
use crate::error::{Error, Result};
use crate::models::CallType;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One local capture track. Samples written while the track is disabled
/// or stopped are dropped, which is what mute means on the wire.
pub struct LocalTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let (codec, id) = match kind {
            TrackKind::Audio => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_OPUS.to_owned(),
                    clock_rate: 48000,
                    channels: 2,
                    ..Default::default()
                },
                "audio",
            ),
            TrackKind::Video => (
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_VP8.to_owned(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video",
            ),
        };

        Self {
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
            rtp: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_owned(),
                stream_id.to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.rtp.clone()
    }

    /// Feed one encoded frame from the capture pipeline.
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        self.rtp.write_sample(sample).await?;
        Ok(())
    }
}

/// The local capture stream of one call.
pub struct LocalMedia {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalMedia {
    pub fn new(call_type: CallType) -> Self {
        let stream_id = format!("callflow-{}", uuid::Uuid::new_v4());
        let mut tracks = vec![Arc::new(LocalTrack::new(TrackKind::Audio, &stream_id))];
        if call_type.has_video() {
            tracks.push(Arc::new(LocalTrack::new(TrackKind::Video, &stream_id)));
        }
        Self { stream_id, tracks }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[async_trait]
pub trait MediaAcquirer: Send + Sync {
    /// Open local capture for `call_type`. Fails with `Error::MediaAccess`
    /// when permission is denied or no matching device exists.
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia>;
}

pub struct DeviceMediaAcquirer {
    config: MediaConfig,
}

impl DeviceMediaAcquirer {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    #[cfg(feature = "devices")]
    async fn start_capture(&self, media: &LocalMedia) -> Result<()> {
        let Some(audio) = media
            .tracks()
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .cloned()
        else {
            return Ok(());
        };

        match microphone::start(audio).await {
            Ok(()) => Ok(()),
            Err(e) if self.config.require_microphone => Err(e),
            Err(e) => {
                log::warn!("Continuing without microphone: {}", e);
                Ok(())
            }
        }
    }

    #[cfg(not(feature = "devices"))]
    async fn start_capture(&self, media: &LocalMedia) -> Result<()> {
        log::warn!(
            "Built without capture devices, stream {} carries no media",
            media.stream_id()
        );
        Ok(())
    }
}

#[async_trait]
impl MediaAcquirer for DeviceMediaAcquirer {
    async fn acquire(&self, call_type: CallType) -> Result<LocalMedia> {
        if call_type.has_video() {
            if let Some(ref camera) = self.config.camera_device {
                if !camera.exists() {
                    return Err(Error::MediaAccess(format!(
                        "camera {} not found",
                        camera.display()
                    )));
                }
            }
        }

        let media = LocalMedia::new(call_type);
        if let Err(e) = self.start_capture(&media).await {
            media.stop_all();
            return Err(e);
        }
        log::info!(
            "Acquired local media {} ({} tracks)",
            media.stream_id(),
            media.tracks().len()
        );
        Ok(media)
    }
}

/// Microphone capture: cpal input on a dedicated thread, Opus encoding there,
/// and a tokio task writing the packets into the audio track.
#[cfg(feature = "devices")]
mod microphone {
    use super::LocalTrack;
    use crate::error::{Error, Result};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{SampleRate, StreamConfig};
    use opus::{Application, Channels, Encoder};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot};
    use webrtc::media::Sample;

    pub(super) const SAMPLE_RATE: u32 = 48_000;
    /// 20 ms at 48 kHz
    pub(super) const FRAME_SAMPLES: usize = 960;
    const FRAME_DURATION: Duration = Duration::from_millis(20);
    const MAX_PACKET_BYTES: usize = 1275;

    /// Capture into `track` until the track is stopped.
    pub(super) async fn start(track: Arc<LocalTrack>) -> Result<()> {
        let (packets_tx, mut packets_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let capture_track = track.clone();
        std::thread::Builder::new()
            .name("callflow-capture".into())
            .spawn(move || capture_thread(capture_track, packets_tx, ready_tx))
            .map_err(|e| Error::MediaAccess(format!("failed to start capture: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::MediaAccess("capture thread exited".to_string()))??;

        tokio::spawn(async move {
            while let Some(packet) = packets_rx.recv().await {
                let sample = Sample {
                    data: packet.into(),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    log::warn!("Dropping captured frame: {}", e);
                }
            }
            log::debug!("Capture pump finished");
        });
        Ok(())
    }

    fn capture_thread(
        track: Arc<LocalTrack>,
        packets: mpsc::UnboundedSender<Vec<u8>>,
        ready: oneshot::Sender<Result<()>>,
    ) {
        let pcm = Arc::new(Mutex::new(Vec::with_capacity(FRAME_SAMPLES * 2)));
        let opened = open_input(pcm.clone()).and_then(|stream| {
            let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
                .map_err(|e| Error::MediaAccess(format!("opus encoder: {}", e)))?;
            encoder
                .set_bitrate(opus::Bitrate::Bits(32_000))
                .map_err(|e| Error::MediaAccess(format!("opus encoder: {}", e)))?;
            Ok((stream, encoder))
        });

        let (stream, mut encoder) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));
        log::info!("Microphone capture started");

        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        while track.is_live() {
            let frame = take_frame(&mut pcm.lock());
            let Some(frame) = frame else {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            };
            match encoder.encode_float(&frame, &mut packet) {
                Ok(len) => {
                    if packets.send(packet[..len].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("Opus encode failed: {}", e),
            }
        }

        drop(stream);
        log::info!("Microphone capture stopped");
    }

    fn open_input(pcm: Arc<Mutex<Vec<f32>>>) -> Result<cpal::Stream> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| Error::MediaAccess("no microphone available".to_string()))?;

        let config: StreamConfig = device
            .supported_input_configs()
            .map_err(|e| Error::MediaAccess(e.to_string()))?
            .filter(|c| c.channels() <= 2)
            .filter(|c| c.min_sample_rate().0 <= SAMPLE_RATE && c.max_sample_rate().0 >= SAMPLE_RATE)
            .min_by_key(|c| c.channels())
            .map(|c| c.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
            .ok_or_else(|| Error::MediaAccess("microphone cannot capture at 48 kHz".to_string()))?;
        let channels = config.channels as usize;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    push_mono(&mut pcm.lock(), data, channels);
                },
                |e| log::error!("Microphone stream error: {}", e),
                None,
            )
            .map_err(|e| Error::MediaAccess(e.to_string()))?;
        stream
            .play()
            .map_err(|e| Error::MediaAccess(e.to_string()))?;
        Ok(stream)
    }

    pub(super) fn push_mono(buffer: &mut Vec<f32>, data: &[f32], channels: usize) {
        if channels <= 1 {
            buffer.extend_from_slice(data);
        } else {
            buffer.extend(
                data.chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
            );
        }
    }

    pub(super) fn take_frame(buffer: &mut Vec<f32>) -> Option<Vec<f32>> {
        (buffer.len() >= FRAME_SAMPLES).then(|| buffer.drain(..FRAME_SAMPLES).collect())
    }
}
