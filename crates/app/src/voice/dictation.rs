use std::sync::Arc;

use snafu::Snafu;
use tokio::sync::mpsc;

use crate::services::Capability;

#[derive(Debug, Snafu)]
pub enum DictationError {
    #[snafu(display("speech recognition is unavailable on `{stage}`: {reason}"))]
    RecognizerUnavailable { stage: &'static str, reason: String },
    #[snafu(display("speech recognition failed to start on `{stage}`: {message}"))]
    StartRecognizer { stage: &'static str, message: String },
}

/// What a recognizer reports while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Every result of the session so far, in order.
    Results(Vec<String>),
    End,
    Error(String),
}

pub type RecognitionEvents = mpsc::UnboundedReceiver<RecognitionEvent>;

/// Platform speech recognizer. Each session reports through the returned channel,
/// which closes after `End` or `Error`.
pub trait SpeechRecognizer: Send + Sync {
    fn start(&self) -> Result<RecognitionEvents, DictationError>;
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictationState {
    Idle,
    Listening,
    /// Recognition ended on its own with a transcript awaiting confirm or re-record.
    Confirming,
}

/// Voice input state machine around a [`SpeechRecognizer`].
pub struct Dictation {
    recognizer: Capability<Arc<dyn SpeechRecognizer>>,
    state: DictationState,
    transcript: String,
    manually_stopped: bool,
    events: Option<RecognitionEvents>,
}

impl Dictation {
    pub fn new(recognizer: Capability<Arc<dyn SpeechRecognizer>>) -> Self {
        Self {
            recognizer,
            state: DictationState::Idle,
            transcript: String::new(),
            manually_stopped: false,
            events: None,
        }
    }

    pub fn is_available(&self) -> bool {
        self.recognizer.is_available()
    }

    pub fn state(&self) -> DictationState {
        self.state
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    /// Mic button: starts listening, or stops a session in progress.
    pub fn toggle(&mut self) -> Result<DictationState, DictationError> {
        match self.state {
            DictationState::Listening => {
                self.manually_stopped = true;
                if let Capability::Available(recognizer) = &self.recognizer {
                    recognizer.stop();
                }
                Ok(self.state)
            }
            DictationState::Idle | DictationState::Confirming => self.start(),
        }
    }

    /// Replaces the transcript with the concatenation of all results so far.
    pub fn on_result<I, S>(&mut self, results: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.state != DictationState::Listening {
            return;
        }
        self.transcript = results
            .into_iter()
            .map(|part| part.as_ref().to_string())
            .collect();
    }

    pub fn on_end(&mut self) -> DictationState {
        if self.state != DictationState::Listening {
            return self.state;
        }

        self.state = if !self.manually_stopped && !self.transcript.trim().is_empty() {
            DictationState::Confirming
        } else {
            DictationState::Idle
        };
        self.manually_stopped = false;
        self.state
    }

    /// Applies recognizer events until the session leaves `Listening`.
    /// A channel that closes early counts as the end of the session.
    pub async fn listen(&mut self) -> DictationState {
        while self.state == DictationState::Listening {
            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };
            match event {
                Some(RecognitionEvent::Results(results)) => self.on_result(results),
                Some(RecognitionEvent::End) | None => {
                    self.on_end();
                }
                Some(RecognitionEvent::Error(error)) => self.on_error(&error),
            }
        }
        self.events = None;
        self.state
    }

    pub fn on_error(&mut self, error: &str) {
        tracing::warn!(error = %error, "speech recognition error");
        self.state = DictationState::Idle;
        self.manually_stopped = false;
    }

    /// Accepts the transcript for sending. Returns `None` when it is blank.
    pub fn confirm(&mut self) -> Option<String> {
        self.state = DictationState::Idle;
        let transcript = std::mem::take(&mut self.transcript);
        (!transcript.trim().is_empty()).then_some(transcript)
    }

    /// Discards the transcript and listens again.
    pub fn rerecord(&mut self) -> Result<DictationState, DictationError> {
        self.start()
    }

    fn start(&mut self) -> Result<DictationState, DictationError> {
        let recognizer = match &self.recognizer {
            Capability::Available(recognizer) => Arc::clone(recognizer),
            Capability::Unavailable { reason } => {
                return RecognizerUnavailableSnafu {
                    stage: "dictation-start",
                    reason: reason.clone(),
                }
                .fail();
            }
        };

        self.transcript.clear();
        let events = recognizer.start().inspect_err(|_| {
            self.state = DictationState::Idle;
        })?;
        self.events = Some(events);
        self.manually_stopped = false;
        self.state = DictationState::Listening;
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FakeRecognizer {
        starts: AtomicUsize,
        stops: AtomicUsize,
        refuse: AtomicBool,
        session: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
    }

    impl FakeRecognizer {
        fn emit(&self, event: RecognitionEvent) {
            if let Some(sender) = self.session.lock().expect("session lock").as_ref() {
                sender.send(event).expect("session open");
            }
        }
    }

    impl SpeechRecognizer for FakeRecognizer {
        fn start(&self) -> Result<RecognitionEvents, DictationError> {
            if self.refuse.load(Ordering::SeqCst) {
                return StartRecognizerSnafu {
                    stage: "fake-start",
                    message: "microphone denied",
                }
                .fail();
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            let (sender, events) = mpsc::unbounded_channel();
            *self.session.lock().expect("session lock") = Some(sender);
            Ok(events)
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn dictation() -> (Dictation, Arc<FakeRecognizer>) {
        let recognizer = Arc::new(FakeRecognizer::default());
        let dictation = Dictation::new(Capability::Available(
            Arc::clone(&recognizer) as Arc<dyn SpeechRecognizer>
        ));
        (dictation, recognizer)
    }

    #[test]
    fn natural_end_with_speech_asks_for_confirmation() {
        let (mut dictation, recognizer) = dictation();

        assert_eq!(dictation.toggle().expect("start"), DictationState::Listening);
        dictation.on_result(["Can my landlord ", "keep my deposit?"]);
        assert_eq!(dictation.on_end(), DictationState::Confirming);

        assert_eq!(
            dictation.confirm().as_deref(),
            Some("Can my landlord keep my deposit?")
        );
        assert_eq!(dictation.state(), DictationState::Idle);
        assert_eq!(recognizer.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manual_stop_returns_to_idle_keeping_the_transcript() {
        let (mut dictation, recognizer) = dictation();
        dictation.toggle().expect("start");
        dictation.on_result(["overtime pay"]);

        dictation.toggle().expect("stop");
        assert_eq!(recognizer.stops.load(Ordering::SeqCst), 1);
        assert_eq!(dictation.on_end(), DictationState::Idle);
        assert_eq!(dictation.transcript(), "overtime pay");
    }

    #[test]
    fn silence_or_errors_return_to_idle() {
        let (mut dictation, _) = dictation();
        dictation.toggle().expect("start");
        assert_eq!(dictation.on_end(), DictationState::Idle);

        dictation.toggle().expect("start");
        dictation.on_error("no-speech");
        assert_eq!(dictation.state(), DictationState::Idle);
    }

    #[test]
    fn rerecord_clears_the_transcript_and_listens_again() {
        let (mut dictation, recognizer) = dictation();
        dictation.toggle().expect("start");
        dictation.on_result(["first try"]);
        dictation.on_end();

        assert_eq!(dictation.rerecord().expect("restart"), DictationState::Listening);
        assert_eq!(dictation.transcript(), "");
        assert_eq!(recognizer.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listening_applies_recognizer_events_until_the_session_ends() {
        let (mut dictation, recognizer) = dictation();
        dictation.toggle().expect("start");
        recognizer.emit(RecognitionEvent::Results(vec!["Is my ".to_string()]));
        recognizer.emit(RecognitionEvent::Results(vec![
            "Is my ".to_string(),
            "contract binding?".to_string(),
        ]));
        recognizer.emit(RecognitionEvent::End);

        assert_eq!(dictation.listen().await, DictationState::Confirming);
        assert_eq!(dictation.transcript(), "Is my contract binding?");
    }

    #[tokio::test]
    async fn recognizer_errors_and_dropped_sessions_end_listening() {
        let (mut dictation, recognizer) = dictation();
        dictation.toggle().expect("start");
        recognizer.emit(RecognitionEvent::Error("audio-capture".to_string()));
        assert_eq!(dictation.listen().await, DictationState::Idle);

        dictation.toggle().expect("start");
        recognizer.session.lock().expect("session lock").take();
        assert_eq!(dictation.listen().await, DictationState::Idle);
    }

    #[test]
    fn missing_or_failing_recognizer_stays_idle() {
        let mut unavailable = Dictation::new(Capability::unavailable("no microphone"));
        assert!(!unavailable.is_available());
        assert!(matches!(
            unavailable.toggle(),
            Err(DictationError::RecognizerUnavailable { .. })
        ));

        let (mut dictation, recognizer) = dictation();
        recognizer.refuse.store(true, Ordering::SeqCst);
        assert!(matches!(
            dictation.toggle(),
            Err(DictationError::StartRecognizer { .. })
        ));
        assert_eq!(dictation.state(), DictationState::Idle);
    }
}
