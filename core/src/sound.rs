//! Call sound cues

use crate::config::SoundConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundCue {
    Ringtone,
    Connect,
    End,
}

/// Ringtone and status cues. Every method is idempotent and safe to call
/// from any call state.
pub trait SoundCues: Send + Sync {
    fn play_ringtone(&self);
    fn stop_ringtone(&self);
    fn play_connect_cue(&self);
    fn play_end_cue(&self);
}

/// Picks the device-backed player when available, otherwise logs cues.
pub fn cue_player(config: &SoundConfig) -> Arc<dyn SoundCues> {
    #[cfg(feature = "devices")]
    if config.enabled {
        return Arc::new(DeviceCues::new(config.clone()));
    }

    Arc::new(LogCues::new(config.enabled))
}

pub struct LogCues {
    enabled: bool,
    ringing: AtomicBool,
}

impl LogCues {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ringing: AtomicBool::new(false),
        }
    }

    pub fn is_ringing(&self) -> bool {
        self.ringing.load(Ordering::SeqCst)
    }

    fn cue(&self, cue: SoundCue) {
        if self.enabled {
            log::debug!("Sound cue: {:?}", cue);
        }
    }
}

impl SoundCues for LogCues {
    fn play_ringtone(&self) {
        if !self.ringing.swap(true, Ordering::SeqCst) {
            self.cue(SoundCue::Ringtone);
        }
    }

    fn stop_ringtone(&self) {
        if self.ringing.swap(false, Ordering::SeqCst) {
            log::debug!("Ringtone stopped");
        }
    }

    fn play_connect_cue(&self) {
        self.cue(SoundCue::Connect);
    }

    fn play_end_cue(&self) {
        self.cue(SoundCue::End);
    }
}

#[cfg(feature = "devices")]
pub use self::device::DeviceCues;

#[cfg(feature = "devices")]
mod device {
    use super::{SoundCue, SoundCues};
    use crate::config::SoundConfig;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use parking_lot::Mutex;
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    enum CueCommand {
        Play(SoundCue),
        StopRingtone,
    }

    /// Plays WAV cue files through the default output device. The cpal stream
    /// is not `Send`, so it lives on a dedicated audio thread.
    pub struct DeviceCues {
        commands: mpsc::UnboundedSender<CueCommand>,
    }

    impl DeviceCues {
        pub fn new(config: SoundConfig) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();

            let spawned = std::thread::Builder::new()
                .name("callflow-sounds".to_string())
                .spawn(move || audio_thread(config, rx));
            if let Err(e) = spawned {
                log::warn!("Failed to start audio thread: {}", e);
            }

            Self { commands: tx }
        }

        fn send(&self, command: CueCommand) {
            // The audio thread is gone only if the output device failed.
            let _ = self.commands.send(command);
        }
    }

    impl SoundCues for DeviceCues {
        fn play_ringtone(&self) {
            self.send(CueCommand::Play(SoundCue::Ringtone));
        }

        fn stop_ringtone(&self) {
            self.send(CueCommand::StopRingtone);
        }

        fn play_connect_cue(&self) {
            self.send(CueCommand::Play(SoundCue::Connect));
        }

        fn play_end_cue(&self) {
            self.send(CueCommand::Play(SoundCue::End));
        }
    }

    struct Playback {
        samples: Arc<Vec<f32>>,
        position: usize,
        looped: bool,
    }

    impl Playback {
        fn next_sample(&mut self) -> Option<f32> {
            if self.position >= self.samples.len() {
                if !self.looped || self.samples.is_empty() {
                    return None;
                }
                self.position = 0;
            }
            let sample = self.samples[self.position];
            self.position += 1;
            Some(sample)
        }
    }

    fn audio_thread(config: SoundConfig, mut rx: mpsc::UnboundedReceiver<CueCommand>) {
        let Some(device) = cpal::default_host().default_output_device() else {
            log::warn!("No audio output, sound cues disabled");
            return;
        };
        let stream_config: cpal::StreamConfig = match device.default_output_config() {
            Ok(supported) => supported.config(),
            Err(e) => {
                log::warn!("No usable output format, sound cues disabled: {}", e);
                return;
            }
        };
        let rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        let load = |path: &Option<std::path::PathBuf>| {
            let path = path.as_ref()?;
            match load_wav(path, rate, channels, config.volume) {
                Ok(samples) => Some(Arc::new(samples)),
                Err(e) => {
                    log::warn!("Failed to load cue {}: {}", path.display(), e);
                    None
                }
            }
        };
        let ringtone = load(&config.ringtone);
        let connect = load(&config.connect);
        let end = load(&config.end);

        let current: Arc<Mutex<Option<Playback>>> = Arc::new(Mutex::new(None));
        let playing = current.clone();
        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let mut playback = playing.lock();
                for sample in data.iter_mut() {
                    *sample = match playback.as_mut().and_then(Playback::next_sample) {
                        Some(value) => value,
                        None => {
                            *playback = None;
                            0.0
                        }
                    };
                }
            },
            |err| log::warn!("Audio output error: {}", err),
            None,
        );
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to open audio output: {}", e);
                return;
            }
        };
        if let Err(e) = stream.play() {
            log::warn!("Failed to start audio output: {}", e);
            return;
        }

        while let Some(command) = rx.blocking_recv() {
            let mut playback = current.lock();
            match command {
                CueCommand::Play(SoundCue::Ringtone) => {
                    let already_ringing = playback.as_ref().map_or(false, |p| p.looped);
                    if let (false, Some(samples)) = (already_ringing, ringtone.as_ref()) {
                        *playback = Some(Playback {
                            samples: samples.clone(),
                            position: 0,
                            looped: true,
                        });
                    }
                }
                CueCommand::Play(cue) => {
                    let samples = match cue {
                        SoundCue::Connect => connect.as_ref(),
                        _ => end.as_ref(),
                    };
                    if let Some(samples) = samples {
                        *playback = Some(Playback {
                            samples: samples.clone(),
                            position: 0,
                            looped: false,
                        });
                    }
                }
                CueCommand::StopRingtone => {
                    if playback.as_ref().map_or(false, |p| p.looped) {
                        *playback = None;
                    }
                }
            }
        }
    }

    /// Decode a WAV file into interleaved f32 frames at the output's rate
    /// and channel count.
    pub(super) fn load_wav(
        path: &Path,
        out_rate: u32,
        out_channels: usize,
        volume: f32,
    ) -> Result<Vec<f32>, String> {
        let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
        let spec = reader.spec();

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| e.to_string())?
            }
        };

        let mono: Vec<f32> = interleaved
            .chunks(spec.channels.max(1) as usize)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        if mono.is_empty() || out_rate == 0 {
            return Ok(Vec::new());
        }

        // Nearest-neighbour resampling is plenty for short cues
        let ratio = spec.sample_rate as f64 / out_rate as f64;
        let frames = (mono.len() as f64 / ratio) as usize;
        let mut out = Vec::with_capacity(frames * out_channels);
        for i in 0..frames {
            let source = ((i as f64 * ratio) as usize).min(mono.len() - 1);
            let value = mono[source] * volume;
            out.extend(std::iter::repeat(value).take(out_channels));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ringtone_start_and_stop_are_idempotent() {
        let cues = LogCues::new(true);
        cues.play_ringtone();
        cues.play_ringtone();
        assert!(cues.is_ringing());

        cues.stop_ringtone();
        cues.stop_ringtone();
        assert!(!cues.is_ringing());
    }

    #[cfg(feature = "devices")]
    #[test]
    fn wav_cues_are_converted_to_output_format() {
        let path = std::env::temp_dir().join(format!("callflow-cue-{}.wav", uuid::Uuid::new_v4()));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..800 {
            writer.write_sample(i16::MAX / 2).unwrap();
        }
        writer.finalize().unwrap();

        let samples = device::load_wav(&path, 16000, 2, 1.0).unwrap();
        std::fs::remove_file(&path).ok();

        // 0.1 s at 16 kHz, stereo
        assert_eq!(samples.len(), 1600 * 2);
        assert!((samples[0] - 0.5).abs() < 0.01);
        assert_eq!(samples[0], samples[1]);
    }
}
