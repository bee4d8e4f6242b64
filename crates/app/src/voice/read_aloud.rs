use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{AbortHandle, Abortable};
use lexi_llm::{BoxFuture, SpeechSynthesizer, SynthesizedAudio};
use snafu::{ResultExt, Snafu};
use tokio::sync::watch;
use uuid::Uuid;

use crate::chat::MessageId;
use crate::services::Capability;

/// Read-aloud state of one bot message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading(MessageId),
    Playing(MessageId),
    Error(MessageId),
}

impl PlaybackState {
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Idle => None,
            Self::Loading(id) | Self::Playing(id) | Self::Error(id) => Some(*id),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Loading(_) | Self::Playing(_))
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AudioError {
    #[snafu(display("failed to create audio directory at {path:?} on `{stage}`: {source}"))]
    CreateAudioDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to write audio file at {path:?} on `{stage}`: {source}"))]
    WriteAudio {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Where synthesized audio goes once it is ready.
pub trait AudioSink: Send + Sync {
    fn play<'a>(&'a self, audio: &'a SynthesizedAudio) -> BoxFuture<'a, Result<(), AudioError>>;
}

/// Renders each clip to a 16-bit PCM WAV file for an external player.
pub struct WavFileSink {
    output_dir: PathBuf,
    last_written: Mutex<Option<PathBuf>>,
}

impl WavFileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            last_written: Mutex::new(None),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn last_written(&self) -> Option<PathBuf> {
        self.last_written
            .lock()
            .ok()
            .and_then(|path| path.clone())
    }

    async fn write(&self, audio: &SynthesizedAudio) -> Result<PathBuf, AudioError> {
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .context(CreateAudioDirSnafu {
                stage: "wav-create-directory",
                path: self.output_dir.clone(),
            })?;

        let path = self.output_dir.join(format!("{}.wav", Uuid::now_v7()));
        tokio::fs::write(&path, encode_wav(audio))
            .await
            .context(WriteAudioSnafu {
                stage: "wav-write-file",
                path: path.clone(),
            })?;

        if let Ok(mut last) = self.last_written.lock() {
            *last = Some(path.clone());
        }
        Ok(path)
    }
}

impl AudioSink for WavFileSink {
    fn play<'a>(&'a self, audio: &'a SynthesizedAudio) -> BoxFuture<'a, Result<(), AudioError>> {
        Box::pin(async move {
            let path = self.write(audio).await?;
            tracing::info!(
                path = %path.display(),
                duration_secs = audio.duration_secs(),
                "rendered read-aloud audio"
            );
            Ok(())
        })
    }
}

/// RIFF/WAVE container around little-endian 16-bit PCM.
pub fn encode_wav(audio: &SynthesizedAudio) -> Vec<u8> {
    const BITS_PER_SAMPLE: u16 = 16;

    let data_len = u32::try_from(audio.pcm.len()).unwrap_or(u32::MAX);
    let block_align = audio.channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = audio.sample_rate * u32::from(block_align);

    let mut wav = Vec::with_capacity(44 + audio.pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36u32.saturating_add(data_len)).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&audio.channels.to_le_bytes());
    wav.extend_from_slice(&audio.sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&BITS_PER_SAMPLE.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(&audio.pcm);
    wav
}

struct ActivePlayback {
    message_id: MessageId,
    abort: AbortHandle,
}

/// Plays bot replies through a speech synthesizer, one message at a time.
///
/// Toggling the message that is loading or playing stops it; toggling another
/// message stops the current one and starts the new one.
pub struct ReadAloud {
    synthesizer: Capability<Arc<dyn SpeechSynthesizer>>,
    sink: Arc<dyn AudioSink>,
    state: watch::Sender<PlaybackState>,
    active: Mutex<Option<ActivePlayback>>,
    generation: AtomicU64,
}

impl ReadAloud {
    pub fn new(
        synthesizer: Capability<Arc<dyn SpeechSynthesizer>>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            synthesizer,
            sink,
            state,
            active: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    pub fn is_available(&self) -> bool {
        self.synthesizer.is_available()
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state.subscribe()
    }

    /// Starts or stops reading `text` aloud and resolves with the resulting state.
    pub async fn toggle(&self, message_id: MessageId, text: &str) -> PlaybackState {
        if let Some(stopped) = self.stop() {
            if stopped == message_id {
                return PlaybackState::Idle;
            }
        }

        let synthesizer = match &self.synthesizer {
            Capability::Available(synthesizer) => Arc::clone(synthesizer),
            Capability::Unavailable { reason } => {
                tracing::debug!(reason = %reason, "read-aloud unavailable");
                self.state.send_replace(PlaybackState::Error(message_id));
                return PlaybackState::Error(message_id);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (abort, registration) = AbortHandle::new_pair();
        if let Ok(mut active) = self.active.lock() {
            *active = Some(ActivePlayback { message_id, abort });
        }
        self.state.send_replace(PlaybackState::Loading(message_id));

        let playback = Abortable::new(
            self.play(generation, message_id, synthesizer, text),
            registration,
        );
        match playback.await {
            Ok(state) => state,
            Err(_aborted) => {
                tracing::debug!(message_id = %message_id, "read-aloud stopped");
                PlaybackState::Idle
            }
        }
    }

    /// Stops the current playback, if any, and returns the message it belonged to.
    pub fn stop(&self) -> Option<MessageId> {
        let previous = self.active.lock().ok().and_then(|mut active| active.take())?;
        previous.abort.abort();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(PlaybackState::Idle);
        Some(previous.message_id)
    }

    async fn play(
        &self,
        generation: u64,
        message_id: MessageId,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        text: &str,
    ) -> PlaybackState {
        let final_state = match synthesizer.synthesize(text).await {
            Some(audio) => {
                self.transition(generation, PlaybackState::Playing(message_id));
                match self.sink.play(&audio).await {
                    Ok(()) => PlaybackState::Idle,
                    Err(error) => {
                        tracing::warn!(message_id = %message_id, error = %error, "audio playback failed");
                        PlaybackState::Error(message_id)
                    }
                }
            }
            None => PlaybackState::Error(message_id),
        };

        if self.transition(generation, final_state) {
            if let Ok(mut active) = self.active.lock() {
                active.take();
            }
        }
        final_state
    }

    // A stale generation means the playback was stopped or superseded.
    fn transition(&self, generation: u64, next: PlaybackState) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.state.send_replace(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Notify;

    use super::*;

    struct FakeSynthesizer {
        audio: Option<SynthesizedAudio>,
        gate: Option<Arc<Notify>>,
    }

    impl FakeSynthesizer {
        fn returning(audio: Option<SynthesizedAudio>) -> Arc<Self> {
            Arc::new(Self {
                audio,
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                audio: Some(SynthesizedAudio::mono_24khz(vec![0; 4])),
                gate: Some(gate),
            })
        }
    }

    impl SpeechSynthesizer for FakeSynthesizer {
        fn synthesize<'a>(&'a self, _text: &'a str) -> BoxFuture<'a, Option<SynthesizedAudio>> {
            Box::pin(async move {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                self.audio.clone()
            })
        }
    }

    fn read_aloud(synthesizer: Arc<FakeSynthesizer>, dir: &Path) -> (ReadAloud, Arc<WavFileSink>) {
        let sink = Arc::new(WavFileSink::new(dir));
        let player = ReadAloud::new(
            Capability::Available(synthesizer as Arc<dyn SpeechSynthesizer>),
            Arc::clone(&sink) as Arc<dyn AudioSink>,
        );
        (player, sink)
    }

    #[test]
    fn wav_header_describes_mono_24khz_pcm() {
        let wav = encode_wav(&SynthesizedAudio::mono_24khz(vec![1, 0, 2, 0]));

        assert_eq!(wav.len(), 48);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[4], wav[5], wav[6], wav[7]]), 40);
        assert_eq!(&wav[8..16], b"WAVEfmt ");
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        assert_eq!(
            u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]),
            24_000
        );
        assert_eq!(
            u32::from_le_bytes([wav[28], wav[29], wav[30], wav[31]]),
            48_000
        );
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(&wav[44..], &[1, 0, 2, 0]);
    }

    #[tokio::test]
    async fn playback_renders_audio_and_returns_to_idle() {
        let dir = tempfile::tempdir().expect("tempdir");
        let synthesizer = FakeSynthesizer::returning(Some(SynthesizedAudio::mono_24khz(vec![0; 8])));
        let (player, sink) = read_aloud(synthesizer, dir.path());
        let id = MessageId::new_v7();

        assert_eq!(player.toggle(id, "Tenants have rights.").await, PlaybackState::Idle);

        assert_eq!(player.state(), PlaybackState::Idle);
        let path = sink.last_written().expect("wav written");
        assert_eq!(std::fs::read(path).expect("read").len(), 52);
    }

    #[tokio::test]
    async fn synthesis_failure_is_an_error_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (player, sink) = read_aloud(FakeSynthesizer::returning(None), dir.path());
        let id = MessageId::new_v7();

        assert_eq!(player.toggle(id, "text").await, PlaybackState::Error(id));
        assert_eq!(player.state(), PlaybackState::Error(id));
        assert!(sink.last_written().is_none());
    }

    #[tokio::test]
    async fn toggling_while_loading_stops_playback() {
        let dir = tempfile::tempdir().expect("tempdir");
        let gate = Arc::new(Notify::new());
        let (player, sink) = read_aloud(FakeSynthesizer::gated(Arc::clone(&gate)), dir.path());
        let player = Arc::new(player);
        let id = MessageId::new_v7();

        let mut states = player.subscribe();
        let first = {
            let player = Arc::clone(&player);
            tokio::spawn(async move { player.toggle(id, "text").await })
        };
        states
            .wait_for(|state| *state == PlaybackState::Loading(id))
            .await
            .expect("loading");

        assert_eq!(player.toggle(id, "text").await, PlaybackState::Idle);
        assert_eq!(first.await.expect("join"), PlaybackState::Idle);
        assert_eq!(player.state(), PlaybackState::Idle);

        gate.notify_waiters();
        assert!(sink.last_written().is_none());
    }

    #[tokio::test]
    async fn unavailable_synthesizer_reports_error() {
        let player = ReadAloud::new(
            Capability::unavailable("speech disabled"),
            Arc::new(WavFileSink::new(std::env::temp_dir())),
        );
        let id = MessageId::new_v7();

        assert!(!player.is_available());
        assert_eq!(player.toggle(id, "text").await, PlaybackState::Error(id));
    }
}
