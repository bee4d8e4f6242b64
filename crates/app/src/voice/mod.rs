pub mod dictation;
pub mod read_aloud;

pub use dictation::{
    Dictation, DictationError, DictationState, RecognitionEvent, RecognitionEvents,
    SpeechRecognizer,
};
pub use read_aloud::{AudioError, AudioSink, PlaybackState, ReadAloud, WavFileSink, encode_wav};
