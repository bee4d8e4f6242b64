use std::sync::Arc;

use lexi_llm::{
    Citation, FailureClass, LlmProvider, ProviderEventStream, ProviderStreamHandle, StreamEvent,
    StreamFailure, StreamRequest,
};

use super::message::{ExchangeRequest, RetryCommand, Source};
use super::sentinel::{SentinelSplitter, parse_suggestions};
use super::store::MessageHandle;

pub const NETWORK_ERROR_TEXT: &str =
    "A network error occurred. Please check your internet connection and try again.";
pub const GENERIC_ERROR_TEXT: &str = "An unexpected error occurred. Please try again.";

/// User-facing classification of a failed exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Generic,
}

impl ErrorCategory {
    pub fn user_message(self) -> &'static str {
        match self {
            Self::Network => NETWORK_ERROR_TEXT,
            Self::Generic => GENERIC_ERROR_TEXT,
        }
    }
}

impl From<FailureClass> for ErrorCategory {
    fn from(class: FailureClass) -> Self {
        match class {
            FailureClass::Network => Self::Network,
            FailureClass::Service => Self::Generic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed,
    Failed(ErrorCategory),
}

/// Model parameters applied to every exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub model_id: String,
    pub system_instruction: Option<String>,
    pub search_grounding: bool,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl StreamOptions {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            system_instruction: None,
            search_grounding: false,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Text and citations gathered from one successful stream.
struct CollectedReply {
    splitter: SentinelSplitter,
    citations: Vec<Citation>,
}

/// Runs one exchange and drives its bot placeholder to a final state.
pub struct ResponseStreamer {
    provider: Arc<dyn LlmProvider>,
    options: StreamOptions,
}

impl ResponseStreamer {
    pub fn new(provider: Arc<dyn LlmProvider>, options: StreamOptions) -> Self {
        Self { provider, options }
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    fn build_request(&self, request: &ExchangeRequest) -> StreamRequest {
        let model_id = if self.options.model_id.trim().is_empty() {
            self.provider.default_model().to_string()
        } else {
            self.options.model_id.clone()
        };

        let grounding = self.options.search_grounding && self.provider.supports_grounding();
        let mut stream_request =
            StreamRequest::new(model_id, request.prompt(), request.history.clone())
                .with_image(request.image.clone())
                .with_search_grounding(grounding);

        if let Some(instruction) = &self.options.system_instruction {
            stream_request = stream_request.with_preamble(instruction.clone());
        }
        if let Some(temperature) = self.options.temperature {
            stream_request = stream_request.with_temperature(temperature);
        }
        if let Some(max_tokens) = self.options.max_tokens {
            stream_request = stream_request.with_max_tokens(max_tokens);
        }

        stream_request
    }

    /// Streams the reply for `request` into the message behind `handle`.
    ///
    /// The message ends either completed or errored with a retry command; nothing is
    /// propagated to the caller beyond the outcome.
    pub async fn run(&self, handle: MessageHandle, request: ExchangeRequest) -> ExchangeOutcome {
        tracing::debug!(
            message_id = %handle.id(),
            provider_id = %self.provider.id(),
            history_turns = request.history.len(),
            has_image = request.image.is_some(),
            "opening exchange"
        );

        let ProviderStreamHandle { stream, worker } =
            match self.provider.stream_chat(self.build_request(&request)) {
                Ok(opened) => opened,
                Err(error) => {
                    return Self::fail(&handle, request, StreamFailure::from(&error));
                }
            };

        let ((), collected) = tokio::join!(worker, Self::collect(stream, &handle));

        match collected {
            Ok(reply) => Self::complete(&handle, reply),
            Err(failure) => Self::fail(&handle, request, failure),
        }
    }

    /// Reads events in arrival order, publishing the displayable text after each text chunk.
    async fn collect(
        mut stream: ProviderEventStream,
        handle: &MessageHandle,
    ) -> Result<CollectedReply, StreamFailure> {
        let mut splitter = SentinelSplitter::new();
        let mut citations = Vec::new();

        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Chunk(chunk) => {
                    if let Some(text) = chunk.text.as_deref().filter(|text| !text.is_empty()) {
                        splitter.push(text);
                        let displayable = splitter.displayable();
                        handle.update(|message| {
                            message.text = displayable.to_string();
                            message.is_loading = true;
                            message.is_error = false;
                        });
                    }
                    citations.extend(chunk.citations);
                }
                StreamEvent::Done => return Ok(CollectedReply { splitter, citations }),
                StreamEvent::Error(failure) => return Err(failure),
            }
        }

        Err(StreamFailure::new(
            FailureClass::Service,
            "provider stream closed without a terminal event",
        ))
    }

    fn complete(handle: &MessageHandle, reply: CollectedReply) -> ExchangeOutcome {
        let CollectedReply {
            splitter,
            citations,
        } = reply;
        let split = splitter.finish();

        let suggestions = split.trailer.as_deref().and_then(|trailer| {
            parse_suggestions(trailer).unwrap_or_else(|error| {
                tracing::warn!(
                    message_id = %handle.id(),
                    error = %error,
                    "discarding malformed suggestions payload"
                );
                None
            })
        });

        let citation_count = citations.len();
        let sources = citations
            .into_iter()
            .filter_map(Source::from_citation)
            .collect::<Vec<_>>();
        if sources.len() < citation_count {
            tracing::debug!(
                message_id = %handle.id(),
                dropped = citation_count - sources.len(),
                "dropped malformed citations"
            );
        }
        let sources = (!sources.is_empty()).then_some(sources);

        tracing::info!(
            message_id = %handle.id(),
            reply_chars = split.body.chars().count(),
            suggestion_count = suggestions.as_ref().map_or(0, Vec::len),
            source_count = sources.as_ref().map_or(0, Vec::len),
            "exchange completed"
        );

        handle.update(|message| {
            message.text = split.body.clone();
            message.suggestions = suggestions.clone();
            message.sources = sources.clone();
            message.is_loading = false;
            message.is_error = false;
            message.retry_request = None;
        });

        ExchangeOutcome::Completed
    }

    fn fail(
        handle: &MessageHandle,
        request: ExchangeRequest,
        failure: StreamFailure,
    ) -> ExchangeOutcome {
        let category = ErrorCategory::from(failure.class);
        tracing::warn!(
            message_id = %handle.id(),
            category = ?category,
            detail = %failure.detail,
            "exchange failed"
        );

        let retry = RetryCommand {
            message_id: handle.id(),
            request,
        };
        handle.update(|message| {
            message.text = category.user_message().to_string();
            message.is_loading = false;
            message.is_error = true;
            message.suggestions = None;
            message.sources = None;
            message.retry_request = Some(retry.clone());
        });

        ExchangeOutcome::Failed(category)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use lexi_llm::{ModelChunk, ProviderError, ProviderResult, ProviderWorker, event_channel};

    use super::*;
    use crate::chat::message::{ChatMessage, MessageId};
    use crate::chat::store::MessageStore;

    /// What one scripted `stream_chat` call does.
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        /// Emits the events in order, then closes the stream.
        Events(Vec<StreamEvent>),
        /// Fails before any stream exists, with a service-class error.
        OpenFailure,
        /// Keeps the stream open without emitting anything until it is cancelled.
        Stall,
    }

    impl Script {
        pub(crate) fn text_reply(chunks: &[&str]) -> Self {
            let mut events = chunks
                .iter()
                .map(|chunk| StreamEvent::Chunk(ModelChunk::text(*chunk)))
                .collect::<Vec<_>>();
            events.push(StreamEvent::Done);
            Self::Events(events)
        }

        pub(crate) fn network_failure() -> Self {
            Self::Events(vec![StreamEvent::Error(StreamFailure::new(
                FailureClass::Network,
                "error sending request: connection refused",
            ))])
        }
    }

    /// Provider that replays one script per call and records the requests it saw.
    pub(crate) struct ScriptedProvider {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<StreamRequest>>,
    }

    impl ScriptedProvider {
        pub(crate) fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().expect("requests lock").clone()
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "Scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        fn supports_grounding(&self) -> bool {
            true
        }

        fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
            self.requests.lock().expect("requests lock").push(request);
            let script = self
                .scripts
                .lock()
                .expect("scripts lock")
                .pop_front()
                .unwrap_or_else(|| Script::text_reply(&[]));

            let events = match script {
                Script::OpenFailure => {
                    return Err(ProviderError::ProviderStatus {
                        stage: "scripted-open",
                        status: 500,
                        body: "boom".to_string(),
                    });
                }
                Script::Stall => {
                    let (event_tx, stream, cancel_rx) = event_channel();
                    let worker: ProviderWorker = Box::pin(async move {
                        let _ = cancel_rx.await;
                        drop(event_tx);
                    });
                    return Ok(ProviderStreamHandle { stream, worker });
                }
                Script::Events(events) => events,
            };

            let (event_tx, stream, _cancel_rx) = event_channel();
            let worker: ProviderWorker = Box::pin(async move {
                for event in events {
                    tokio::task::yield_now().await;
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            });

            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    fn exchange(text: &str, jurisdiction: &str) -> ExchangeRequest {
        ExchangeRequest {
            text: text.to_string(),
            image: None,
            jurisdiction: jurisdiction.to_string(),
            history: Vec::new(),
        }
    }

    type Fixture = (
        Arc<ScriptedProvider>,
        ResponseStreamer,
        Arc<MessageStore>,
        MessageHandle,
    );

    fn setup(scripts: Vec<Script>) -> Fixture {
        let provider = ScriptedProvider::new(scripts);
        let mut options = StreamOptions::new("");
        options.system_instruction = Some("be brief".to_string());
        options.search_grounding = true;
        let streamer = ResponseStreamer::new(provider.clone(), options);

        let placeholder = ChatMessage::placeholder(MessageId::new_v7());
        let store = Arc::new(MessageStore::new(vec![placeholder.clone()]));
        let handle = MessageHandle::new(Arc::clone(&store), placeholder.id);
        (provider, streamer, store, handle)
    }

    #[tokio::test]
    async fn tenant_rights_reply_is_split_into_text_and_suggestions() {
        let (provider, streamer, _store, handle) = setup(vec![Script::text_reply(&[
            "## Tenant",
            " Rights\n",
            "...",
            "---SUGGESTIONS---",
            "[\"Can my landlord evict me without notice?\"]",
        ])]);

        let outcome = streamer
            .run(handle.clone(), exchange("What are my tenant rights?", "California"))
            .await;
        assert_eq!(outcome, ExchangeOutcome::Completed);

        let message = handle.current().expect("message");
        assert_eq!(message.text, "## Tenant Rights\n...");
        assert_eq!(
            message.suggestions,
            Some(vec!["Can my landlord evict me without notice?".to_string()])
        );
        assert!(!message.is_loading);
        assert!(!message.is_error);
        assert_eq!(message.sources, None);

        let request = &provider.requests()[0];
        assert_eq!(
            request.prompt,
            "Jurisdiction: California\n\nUser Question: What are my tenant rights?"
        );
        assert_eq!(request.model_id, "scripted-model");
        assert_eq!(request.preamble.as_deref(), Some("be brief"));
        assert!(request.search_grounding);
        assert!(request.history.is_empty());
    }

    #[tokio::test]
    async fn reply_without_sentinel_is_the_concatenation() {
        let (_, streamer, _, handle) =
            setup(vec![Script::text_reply(&["  Hello", ", ", "world  "])]);

        streamer.run(handle.clone(), exchange("hi", "")).await;

        let message = handle.current().expect("message");
        assert_eq!(message.text, "  Hello, world  ");
        assert_eq!(message.suggestions, None);
    }

    #[tokio::test]
    async fn invalid_suggestions_json_still_completes() {
        let (_, streamer, _, handle) = setup(vec![Script::text_reply(&[
            "Answer body ",
            "---SUGGESTIONS---[\"broken",
        ])]);

        let outcome = streamer.run(handle.clone(), exchange("q", "")).await;

        assert_eq!(outcome, ExchangeOutcome::Completed);
        let message = handle.current().expect("message");
        assert_eq!(message.text, "Answer body");
        assert_eq!(message.suggestions, None);
        assert!(!message.is_error);
    }

    #[tokio::test]
    async fn only_well_formed_citations_become_sources() {
        let (_, streamer, _, handle) = setup(vec![Script::Events(vec![
            StreamEvent::Chunk(ModelChunk::text("See sources.")),
            StreamEvent::Chunk(ModelChunk::citations(vec![
                Citation::new("a", "A"),
                Citation::new("", "B"),
            ])),
            StreamEvent::Chunk(ModelChunk::citations(vec![Citation::new("c", "")])),
            StreamEvent::Done,
        ])]);

        streamer.run(handle.clone(), exchange("q", "")).await;

        let message = handle.current().expect("message");
        assert_eq!(
            message.sources,
            Some(vec![Source {
                uri: "a".to_string(),
                title: "A".to_string(),
            }])
        );
    }

    #[tokio::test]
    async fn repeated_citations_are_kept_in_arrival_order() {
        let (_, streamer, _, handle) = setup(vec![Script::Events(vec![
            StreamEvent::Chunk(ModelChunk::citations(vec![
                Citation::new("b", "B"),
                Citation::new("a", "A"),
            ])),
            StreamEvent::Chunk(ModelChunk::text("Cited.")),
            StreamEvent::Chunk(ModelChunk::citations(vec![Citation::new("b", "B")])),
            StreamEvent::Done,
        ])]);

        streamer.run(handle.clone(), exchange("q", "")).await;

        let uris = handle
            .current()
            .and_then(|message| message.sources)
            .map(|sources| sources.into_iter().map(|source| source.uri).collect::<Vec<_>>());
        assert_eq!(
            uris,
            Some(vec!["b".to_string(), "a".to_string(), "b".to_string()])
        );
    }

    #[tokio::test]
    async fn empty_model_output_completes_with_empty_text() {
        let (_, streamer, _, handle) = setup(vec![Script::Events(vec![StreamEvent::Done])]);

        let outcome = streamer.run(handle.clone(), exchange("q", "")).await;

        assert_eq!(outcome, ExchangeOutcome::Completed);
        let message = handle.current().expect("message");
        assert_eq!(message.text, "");
        assert_eq!(message.suggestions, None);
        assert_eq!(message.sources, None);
        assert!(!message.is_loading);
        assert!(!message.is_error);
        assert_eq!(message.retry_request, None);
    }

    #[tokio::test]
    async fn partial_text_is_visible_while_streaming() {
        let (_, streamer, store, handle) = setup(vec![Script::text_reply(&[
            "Partial",
            " answer---SUGGES",
            "TIONS---[\"x\"]",
        ])]);
        let mut revisions = store.subscribe();

        let observer = {
            let handle = handle.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while revisions.changed().await.is_ok() {
                    let Some(message) = handle.current() else {
                        break;
                    };
                    seen.push((message.text.clone(), message.is_loading));
                    if !message.is_loading {
                        break;
                    }
                }
                seen
            })
        };

        streamer.run(handle, exchange("q", "")).await;
        let seen = observer.await.expect("observer");

        assert!(seen.iter().all(|(text, _)| !text.contains("---")));
        assert_eq!(seen.last(), Some(&("Partial answer".to_string(), false)));
    }

    #[tokio::test]
    async fn network_failure_sets_error_and_retry_command() {
        let (_, streamer, _, handle) = setup(vec![Script::network_failure()]);
        let request = exchange("What are my tenant rights?", "California");

        let outcome = streamer.run(handle.clone(), request.clone()).await;

        assert_eq!(outcome, ExchangeOutcome::Failed(ErrorCategory::Network));
        let message = handle.current().expect("message");
        assert!(message.is_error);
        assert!(!message.is_loading);
        assert_eq!(message.text, NETWORK_ERROR_TEXT);
        assert_eq!(
            message.retry_request,
            Some(RetryCommand {
                message_id: handle.id(),
                request,
            })
        );
    }

    #[tokio::test]
    async fn setup_failures_are_generic() {
        let (_, streamer, _, handle) = setup(vec![Script::OpenFailure]);

        let outcome = streamer.run(handle.clone(), exchange("q", "")).await;

        assert_eq!(outcome, ExchangeOutcome::Failed(ErrorCategory::Generic));
        assert_eq!(handle.current().expect("message").text, GENERIC_ERROR_TEXT);
    }

    #[tokio::test]
    async fn stream_closing_without_done_is_a_failure() {
        let (_, streamer, _, handle) = setup(vec![Script::Events(vec![StreamEvent::Chunk(
            ModelChunk::text("cut off"),
        )])]);

        let outcome = streamer.run(handle.clone(), exchange("q", "")).await;

        assert_eq!(outcome, ExchangeOutcome::Failed(ErrorCategory::Generic));
        assert!(handle.current().expect("message").retry_request.is_some());
    }
}
