use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use crate::attachment::ImageAttachment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub endpoint: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
        }
    }
}

/// Speaker of one prior turn sent as conversation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: TurnRole,
    pub text: String,
}

impl HistoryTurn {
    pub fn new(role: TurnRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub prompt: String,
    pub history: Vec<HistoryTurn>,
    pub image: Option<ImageAttachment>,
    pub preamble: Option<String>,
    pub search_grounding: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamRequest {
    pub fn new(
        model_id: impl Into<String>,
        prompt: impl Into<String>,
        history: Vec<HistoryTurn>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            history,
            image: None,
            preamble: None,
            search_grounding: false,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_image(mut self, image: Option<ImageAttachment>) -> Self {
        self.image = image;
        self
    }

    pub fn with_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.preamble = Some(preamble.into());
        self
    }

    pub fn with_search_grounding(mut self, enabled: bool) -> Self {
        self.search_grounding = enabled;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// Source attribution as reported by the provider; fields may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Citation {
    pub uri: String,
    pub title: String,
}

impl Citation {
    pub fn new(uri: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            title: title.into(),
        }
    }

    pub fn is_well_formed(&self) -> bool {
        !self.uri.is_empty() && !self.title.is_empty()
    }
}

/// One increment of model output. Either field may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModelChunk {
    pub text: Option<String>,
    pub citations: Vec<Citation>,
}

impl ModelChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            citations: Vec::new(),
        }
    }

    pub fn citations(citations: Vec<Citation>) -> Self {
        Self {
            text: None,
            citations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.citations.is_empty()
    }
}

/// Coarse cause of a failed exchange, used to pick user-facing wording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Network,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFailure {
    pub class: FailureClass,
    pub detail: String,
}

impl StreamFailure {
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

impl From<&ProviderError> for StreamFailure {
    fn from(error: &ProviderError) -> Self {
        Self::new(error.failure_class(), error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(ModelChunk),
    Done,
    Error(StreamFailure),
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;
pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request has an empty prompt"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("provider returned status {status} on `{stage}`: {body}"))]
    ProviderStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("provider reported an error on `{stage}`: {message}"))]
    ProviderReported {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("failed to decode provider payload on `{stage}`, {source}"))]
    DecodePayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("provider stream contained invalid UTF-8 on `{stage}`"))]
    InvalidUtf8 {
        stage: &'static str,
        source: std::str::Utf8Error,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}

impl ProviderError {
    /// Transport-level failures (no route, timeouts, dropped bodies) are network class.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::HttpRequest { source, .. }
                if source.is_connect()
                    || source.is_timeout()
                    || source.is_request()
                    || source.is_body() =>
            {
                FailureClass::Network
            }
            Self::CompletionsFailed { source, .. } if mentions_transport(&source.to_string()) => {
                FailureClass::Network
            }
            _ => FailureClass::Service,
        }
    }
}

// rig flattens transport errors into its own error text, so only the message is left to inspect.
fn mentions_transport(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    ["connect", "timed out", "timeout", "dns", "network", "connection reset"]
        .iter()
        .any(|needle| message.contains(needle))
}

pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(events: mpsc::UnboundedReceiver<StreamEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    /// Whether the provider can attach search-grounding citations to its output.
    fn supports_grounding(&self) -> bool;
    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Creates the channel triple a provider worker uses to publish events.
///
/// Public so that providers living outside this crate follow the same contract.
pub fn event_channel() -> (EventSender, ProviderEventStream, oneshot::Receiver<()>) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
