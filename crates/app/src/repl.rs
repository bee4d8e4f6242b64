use std::path::PathBuf;
use std::sync::Arc;

use lexi_llm::ImageAttachment;
use snafu::Snafu;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::app::LexiApp;
use crate::chat::{
    ChatMessage, ChatOrchestrator, Feedback, LocateOutcome, SendOutcome, Sender,
};
use crate::services::Coordinates;
use crate::voice::{DictationError, DictationState, PlaybackState};

pub const HELP_TEXT: &str = "\
Type a question and press enter. Commands:
  /up, /down              rate the last answer
  /retry                  retry the last failed answer
  /suggest <n>            send suggestion number n
  /attach <path>          attach an image to the next message
  /jurisdiction [text]    show or set your jurisdiction
  /locate <lat> <lon>     look up your jurisdiction from coordinates
  /speak                  read the last answer aloud
  /dictate                ask by voice, or record again
  /send                   send the dictated question
  /clear                  clear the conversation
  /help                   show this help
  /quit                   exit";

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    UnknownCommand { name: String },
    #[snafu(display("usage: {usage}"))]
    Usage { usage: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Rate(Feedback),
    Retry,
    Suggest(usize),
    Attach(PathBuf),
    Jurisdiction(Option<String>),
    Locate(Coordinates),
    Speak,
    Dictate,
    SendDictation,
    Clear,
    Help,
    Quit,
}

impl Command {
    /// Parses one input line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Option<Result<Self, CommandError>> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Some(Ok(Self::Send(line.to_string())));
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));

        let parsed = match name {
            "up" => Ok(Self::Rate(Feedback::Up)),
            "down" => Ok(Self::Rate(Feedback::Down)),
            "retry" => Ok(Self::Retry),
            "suggest" => rest
                .parse::<usize>()
                .ok()
                .filter(|index| *index > 0)
                .map(Self::Suggest)
                .ok_or(CommandError::Usage {
                    usage: "/suggest <n>",
                }),
            "attach" if !rest.is_empty() => Ok(Self::Attach(PathBuf::from(rest))),
            "attach" => UsageSnafu {
                usage: "/attach <path>",
            }
            .fail(),
            "jurisdiction" => Ok(Self::Jurisdiction(
                (!rest.is_empty()).then(|| rest.to_string()),
            )),
            "locate" => parse_coordinates(rest).map(Self::Locate).ok_or(CommandError::Usage {
                usage: "/locate <lat> <lon>",
            }),
            "speak" => Ok(Self::Speak),
            "dictate" => Ok(Self::Dictate),
            "send" => Ok(Self::SendDictation),
            "clear" => Ok(Self::Clear),
            "help" => Ok(Self::Help),
            "quit" | "exit" => Ok(Self::Quit),
            other => UnknownCommandSnafu { name: other }.fail(),
        };
        Some(parsed)
    }
}

fn parse_coordinates(input: &str) -> Option<Coordinates> {
    let mut parts = input
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty());
    let latitude = parts.next()?.parse::<f64>().ok()?;
    let longitude = parts.next()?.parse::<f64>().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Coordinates::new(latitude, longitude)
}

/// Plain-text rendering of a finished message.
pub fn render_message(message: &ChatMessage) -> String {
    let header = match message.sender {
        Sender::User => format!("you> {}", message.text),
        Sender::Bot if message.is_error => format!("lexi! {}", message.text),
        Sender::Bot => format!("lexi> {}", message.text),
    };
    header + &render_details(message)
}

/// Attachment, retry hint, sources, follow-ups and rating, one indented line each.
fn render_details(message: &ChatMessage) -> String {
    let mut rendered = String::new();
    if message.image.is_some() {
        rendered.push_str("\n  [image attached]");
    }
    if message.is_error && message.retry_request.is_some() {
        rendered.push_str("\n  (type /retry to try again)");
    }
    if let Some(sources) = &message.sources {
        rendered.push_str("\n  Sources:");
        for source in sources {
            rendered.push_str(&format!("\n    - {} <{}>", source.title, source.uri));
        }
    }
    if let Some(suggestions) = &message.suggestions {
        rendered.push_str("\n  Follow-ups:");
        for (index, suggestion) in suggestions.iter().enumerate() {
            rendered.push_str(&format!("\n    [{}] {}", index + 1, suggestion));
        }
    }
    if let Some(feedback) = message.feedback {
        let label = match feedback {
            Feedback::Up => "helpful",
            Feedback::Down => "not helpful",
        };
        rendered.push_str(&format!("\n  (rated {label})"));
    }
    rendered
}

pub fn render_quick_suggestions(chips: &[String]) -> String {
    let mut rendered = String::from("Try one of these:");
    for (index, chip) in chips.iter().enumerate() {
        rendered.push_str(&format!("\n  [{}] {}", index + 1, chip));
    }
    rendered
}

fn last_bot_message(chat: &ChatOrchestrator) -> Option<ChatMessage> {
    chat.messages()
        .iter()
        .rev()
        .find(|message| message.sender == Sender::Bot)
        .cloned()
}

/// Line-oriented terminal front-end over a [`LexiApp`].
pub struct Repl<R, W> {
    app: LexiApp,
    input: R,
    output: W,
    pending_image: Option<ImageAttachment>,
}

impl<R, W> Repl<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(app: LexiApp, input: R, output: W) -> Self {
        Self {
            app,
            input,
            output,
            pending_image: None,
        }
    }

    pub fn into_output(self) -> W {
        self.output
    }

    pub async fn run(&mut self) -> std::io::Result<()> {
        self.print_transcript().await?;

        let mut line = String::new();
        loop {
            self.write("\n> ").await?;
            line.clear();
            if self.input.read_line(&mut line).await? == 0 {
                break;
            }

            let command = match Command::parse(&line) {
                None => continue,
                Some(Ok(command)) => command,
                Some(Err(error)) => {
                    self.writeln(&error.to_string()).await?;
                    continue;
                }
            };
            if command == Command::Quit {
                break;
            }
            self.execute(command).await?;
        }

        self.output.flush().await
    }

    async fn print_transcript(&mut self) -> std::io::Result<()> {
        let chat = Arc::clone(self.app.chat());
        for message in chat.messages().iter() {
            self.writeln(&render_message(message)).await?;
        }
        let jurisdiction = chat.jurisdiction();
        if !jurisdiction.is_empty() {
            self.writeln(&format!("(jurisdiction: {jurisdiction})")).await?;
        }
        if chat.show_quick_suggestions() {
            self.writeln(&render_quick_suggestions(chat.quick_suggestions()))
                .await?;
        }
        Ok(())
    }

    async fn execute(&mut self, command: Command) -> std::io::Result<()> {
        let chat = Arc::clone(self.app.chat());
        match command {
            Command::Send(text) => {
                let image = self.pending_image.take();
                self.stream_exchange(&chat, text, image).await
            }
            Command::Rate(feedback) => {
                let rated = match last_bot_message(&chat) {
                    Some(message) => chat.give_feedback(message.id, feedback).await,
                    None => false,
                };
                let reply = if rated {
                    "Thanks for the feedback."
                } else {
                    "Nothing to rate."
                };
                self.writeln(reply).await
            }
            Command::Retry => {
                let failed = last_bot_message(&chat).filter(|message| message.is_error);
                let Some(failed) = failed else {
                    return self.writeln("Nothing to retry.").await;
                };
                let retry = {
                    let chat = Arc::clone(&chat);
                    tokio::spawn(async move { chat.retry(failed.id).await })
                };
                self.follow_exchange(&chat, retry).await
            }
            Command::Suggest(index) => {
                let suggestions = if chat.show_quick_suggestions() {
                    chat.quick_suggestions().to_vec()
                } else {
                    last_bot_message(&chat)
                        .and_then(|message| message.suggestions)
                        .unwrap_or_default()
                };
                match index.checked_sub(1).and_then(|index| suggestions.get(index)) {
                    Some(suggestion) => {
                        let suggestion = suggestion.clone();
                        self.writeln(&format!("you> {suggestion}")).await?;
                        self.stream_exchange(&chat, suggestion, None).await
                    }
                    None => self.writeln("No such suggestion.").await,
                }
            }
            Command::Attach(path) => match ImageAttachment::from_path(&path) {
                Ok(image) => {
                    let note = format!(
                        "Attached {} ({}). It will be sent with your next message.",
                        path.display(),
                        image.mime_type()
                    );
                    self.pending_image = Some(image);
                    self.writeln(&note).await
                }
                Err(error) => self.writeln(&format!("Could not attach image: {error}")).await,
            },
            Command::Jurisdiction(None) => {
                let current = chat.jurisdiction();
                let reply = if current.is_empty() {
                    "No jurisdiction set.".to_string()
                } else {
                    format!("Jurisdiction: {current}")
                };
                self.writeln(&reply).await
            }
            Command::Jurisdiction(Some(jurisdiction)) => {
                chat.set_jurisdiction(&jurisdiction).await;
                self.writeln(&format!("Jurisdiction set to {}.", chat.jurisdiction()))
                    .await
            }
            Command::Locate(coordinates) => {
                let reply = match chat.locate_jurisdiction(coordinates).await {
                    LocateOutcome::Located(jurisdiction) => {
                        format!("Jurisdiction set to {jurisdiction}.")
                    }
                    LocateOutcome::NotFound => "Could not determine your location.".to_string(),
                    LocateOutcome::Unavailable { reason } => {
                        format!("Location lookup is unavailable: {reason}")
                    }
                };
                self.writeln(&reply).await
            }
            Command::Speak => {
                let Some(message) = last_bot_message(&chat).filter(|message| {
                    !message.is_loading && !message.is_error && !message.text.is_empty()
                }) else {
                    return self.writeln("Nothing to read aloud.").await;
                };
                let state = self.app.read_aloud().toggle(message.id, &message.text).await;
                let reply = match state {
                    PlaybackState::Idle => "Read-aloud audio saved.",
                    PlaybackState::Error(_) => "Read-aloud is unavailable right now.",
                    PlaybackState::Loading(_) | PlaybackState::Playing(_) => "Reading aloud...",
                };
                self.writeln(reply).await
            }
            Command::Dictate => {
                match self.app.dictation().toggle() {
                    Ok(_) => {}
                    Err(DictationError::RecognizerUnavailable { reason, .. }) => {
                        return self
                            .writeln(&format!("Voice input is unavailable: {reason}"))
                            .await;
                    }
                    Err(DictationError::StartRecognizer { message, .. }) => {
                        return self
                            .writeln(&format!("Could not start voice input: {message}"))
                            .await;
                    }
                }
                self.writeln("Listening...").await?;
                let reply = match self.app.dictation().listen().await {
                    DictationState::Confirming => format!(
                        "Heard: {}\n  /send to send it, /dictate to record again",
                        self.app.dictation().transcript()
                    ),
                    DictationState::Idle | DictationState::Listening => {
                        "Heard nothing.".to_string()
                    }
                };
                self.writeln(&reply).await
            }
            Command::SendDictation => {
                let dictation = self.app.dictation();
                let transcript = if dictation.state() == DictationState::Confirming {
                    dictation.confirm()
                } else {
                    None
                };
                let Some(text) = transcript else {
                    return self.writeln("Nothing dictated.").await;
                };
                self.writeln(&format!("you> {text}")).await?;
                let image = self.pending_image.take();
                self.stream_exchange(&chat, text, image).await
            }
            Command::Clear => {
                if !chat.clear_history().await {
                    return self.writeln("Wait for the current answer to finish.").await;
                }
                self.pending_image = None;
                self.writeln("Conversation cleared.").await?;
                self.print_transcript().await
            }
            Command::Help => self.writeln(HELP_TEXT).await,
            Command::Quit => Ok(()),
        }
    }

    async fn stream_exchange(
        &mut self,
        chat: &Arc<ChatOrchestrator>,
        text: String,
        image: Option<ImageAttachment>,
    ) -> std::io::Result<()> {
        let exchange = {
            let chat = Arc::clone(chat);
            tokio::spawn(async move { chat.send(&text, image).await })
        };
        self.follow_exchange(chat, exchange).await
    }

    /// Echoes the reply as it streams, then prints the finished message.
    async fn follow_exchange(
        &mut self,
        chat: &Arc<ChatOrchestrator>,
        mut exchange: tokio::task::JoinHandle<SendOutcome>,
    ) -> std::io::Result<()> {
        let mut revisions = chat.subscribe();
        let mut printed = String::new();
        let mut streaming = false;

        let outcome = loop {
            tokio::select! {
                joined = &mut exchange => break joined,
                changed = revisions.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let Some(id) = chat.store().in_flight() else {
                        continue;
                    };
                    let Some(message) = chat.store().get(id) else {
                        continue;
                    };
                    if let Some(delta) = message.text.strip_prefix(printed.as_str()) {
                        if !delta.is_empty() {
                            if !streaming {
                                self.write("lexi> ").await?;
                                streaming = true;
                            }
                            self.write(delta).await?;
                            printed = message.text.clone();
                        }
                    }
                }
            }
        };

        match outcome {
            Ok(SendOutcome::Completed { message_id } | SendOutcome::Failed { message_id, .. }) => {
                let Some(message) = chat.store().get(message_id) else {
                    return Ok(());
                };
                // The finished body is trimmed, so the echo may carry whitespace it lacks.
                let rest = message
                    .text
                    .trim()
                    .strip_prefix(printed.trim())
                    .filter(|_| streaming && !message.is_error);
                match rest {
                    Some(rest) => {
                        let echoed_tail = &printed[printed.trim_end().len()..];
                        let rest = rest.strip_prefix(echoed_tail).unwrap_or(rest);
                        self.write(rest).await?;
                        if !printed.ends_with('\n') || !rest.is_empty() {
                            self.write("\n").await?;
                        }
                        let details = render_details(&message);
                        if !details.is_empty() {
                            self.writeln(details.trim_start_matches('\n')).await?;
                        }
                        Ok(())
                    }
                    None => {
                        if streaming && !printed.ends_with('\n') {
                            self.write("\n").await?;
                        }
                        self.writeln(&render_message(&message)).await
                    }
                }
            }
            Ok(SendOutcome::Busy) => self.writeln("Wait for the current answer to finish.").await,
            Ok(SendOutcome::Empty | SendOutcome::NothingToRetry) => Ok(()),
            Err(error) => {
                if streaming {
                    self.write("\n").await?;
                }
                tracing::error!(error = %error, "chat exchange task failed");
                self.writeln("The request could not be completed.").await
            }
        }
    }

    async fn write(&mut self, text: &str) -> std::io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.flush().await
    }

    async fn writeln(&mut self, text: &str) -> std::io::Result<()> {
        self.output.write_all(text.as_bytes()).await?;
        self.output.write_all(b"\n").await?;
        self.output.flush().await
    }
}

#[cfg(test)]
mod tests {
    use lexi_storage::MemoryKeyValueStore;

    use super::*;
    use crate::app::{AppOverrides, Services};
    use crate::chat::controller::tests::{Script, ScriptedProvider};
    use crate::chat::{MessageId, Source};
    use crate::services::Capability;
    use crate::settings::Settings;
    use crate::voice::{RecognitionEvent, RecognitionEvents, SpeechRecognizer, WavFileSink};

    #[test]
    fn plain_lines_are_messages_and_slashes_are_commands() {
        assert_eq!(Command::parse("   "), None);
        assert_eq!(
            Command::parse(" Can I be fired for this? "),
            Some(Ok(Command::Send("Can I be fired for this?".to_string())))
        );
        assert_eq!(Command::parse("/up"), Some(Ok(Command::Rate(Feedback::Up))));
        assert_eq!(Command::parse("/suggest 2"), Some(Ok(Command::Suggest(2))));
        assert_eq!(
            Command::parse("/jurisdiction  New York, United States "),
            Some(Ok(Command::Jurisdiction(Some(
                "New York, United States".to_string()
            ))))
        );
        assert_eq!(Command::parse("/jurisdiction"), Some(Ok(Command::Jurisdiction(None))));
        assert_eq!(
            Command::parse("/locate 40.7, -74.0"),
            Some(Ok(Command::Locate(
                Coordinates::new(40.7, -74.0).expect("coordinates")
            )))
        );
    }

    #[test]
    fn malformed_commands_report_usage() {
        assert_eq!(
            Command::parse("/suggest zero"),
            Some(Err(CommandError::Usage {
                usage: "/suggest <n>"
            }))
        );
        assert!(matches!(
            Command::parse("/locate 100 0"),
            Some(Err(CommandError::Usage { .. }))
        ));
        assert_eq!(
            Command::parse("/frobnicate"),
            Some(Err(CommandError::UnknownCommand {
                name: "frobnicate".to_string()
            }))
        );
    }

    #[test]
    fn finished_reply_lists_sources_and_follow_ups() {
        let mut message = ChatMessage::placeholder(MessageId::new_v7());
        message.is_loading = false;
        message.text = "You may be owed overtime.".to_string();
        message.sources = Some(vec![Source {
            uri: "https://dol.gov".to_string(),
            title: "DOL".to_string(),
        }]);
        message.suggestions = Some(vec!["How do I file a claim?".to_string()]);
        message.feedback = Some(Feedback::Up);

        assert_eq!(
            render_message(&message),
            "lexi> You may be owed overtime.\n  Sources:\n    - DOL <https://dol.gov>\n  \
             Follow-ups:\n    [1] How do I file a claim?\n  (rated helpful)"
        );
    }

    /// Recognizer whose every session hears the same phrase and then ends.
    struct HeardPhrase(&'static str);

    impl SpeechRecognizer for HeardPhrase {
        fn start(&self) -> Result<RecognitionEvents, DictationError> {
            let (sender, events) = tokio::sync::mpsc::unbounded_channel();
            sender
                .send(RecognitionEvent::Results(vec![self.0.to_string()]))
                .expect("receiver alive");
            sender.send(RecognitionEvent::End).expect("receiver alive");
            Ok(events)
        }

        fn stop(&self) {}
    }

    async fn offline_app(
        provider: Arc<ScriptedProvider>,
        recognizer: Capability<Arc<dyn SpeechRecognizer>>,
    ) -> LexiApp {
        LexiApp::with_components(
            Arc::new(Settings::default().normalized()),
            AppOverrides::default(),
            provider,
            Arc::new(MemoryKeyValueStore::new()),
            Services {
                locator: Capability::unavailable("offline"),
                synthesizer: Capability::unavailable("offline"),
                audio_sink: Arc::new(WavFileSink::new(std::env::temp_dir())),
                recognizer,
            },
        )
        .await
    }

    async fn transcript_of(provider: Arc<ScriptedProvider>, input: &str) -> String {
        transcript_with_recognizer(provider, Capability::unavailable("no microphone"), input).await
    }

    async fn transcript_with_recognizer(
        provider: Arc<ScriptedProvider>,
        recognizer: Capability<Arc<dyn SpeechRecognizer>>,
        input: &str,
    ) -> String {
        let app = offline_app(provider, recognizer).await;
        let mut repl = Repl::new(app, input.as_bytes(), Vec::new());
        repl.run().await.expect("repl");
        String::from_utf8(repl.into_output()).expect("utf8")
    }

    #[tokio::test]
    async fn session_transcript_streams_replies_and_handles_commands() {
        let provider = ScriptedProvider::new([
            Script::text_reply(&["Tenants ", "have rights.---SUGGESTIONS---[\"Deposits?\"]"]),
            Script::text_reply(&["Deposits are regulated."]),
        ]);
        let input = "/jurisdiction Ohio\nWhat are my rights?\n/suggest 1\n/up\n/locate 1 2\n/quit\n";

        let transcript = transcript_of(provider.clone(), input).await;

        assert!(transcript.contains("[1] Consumer Rights"));
        assert!(transcript.contains("Jurisdiction set to Ohio."));
        assert!(transcript.contains("lexi> Tenants have rights."));
        assert!(transcript.contains("[1] Deposits?"));
        assert!(transcript.contains("lexi> Deposits are regulated."));
        assert!(transcript.contains("Thanks for the feedback."));
        assert!(transcript.contains("Location lookup is unavailable: offline"));
        assert!(!transcript.contains("---SUGGESTIONS---"));

        let requests = provider.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].prompt,
            "Jurisdiction: Ohio\n\nUser Question: Deposits?"
        );
    }

    #[tokio::test]
    async fn reply_ending_in_newline_before_suggestions_is_printed_once() {
        let provider = ScriptedProvider::new([Script::text_reply(&[
            "You have rights.\n",
            "---SUGGESTIONS---[\"Next?\"]",
        ])]);

        let transcript = transcript_of(provider, "Q?\n/quit\n").await;

        assert_eq!(transcript.matches("You have rights.").count(), 1);
        assert!(transcript.contains("lexi> You have rights.\n  Follow-ups:\n    [1] Next?\n"));
    }

    #[tokio::test]
    async fn welcome_message_can_be_rated_before_any_question() {
        let transcript = transcript_of(ScriptedProvider::new([]), "/up\n/up\n/quit\n").await;

        assert!(transcript.contains("Thanks for the feedback."));
        assert!(transcript.contains("Nothing to rate."));
    }

    #[tokio::test]
    async fn dictated_question_is_confirmed_then_sent() {
        let provider = ScriptedProvider::new([Script::text_reply(&["Usually not."])]);
        let recognizer: Arc<dyn SpeechRecognizer> =
            Arc::new(HeardPhrase("Can I break my lease early?"));

        let transcript = transcript_with_recognizer(
            provider.clone(),
            Capability::Available(recognizer),
            "/send\n/dictate\n/send\n/quit\n",
        )
        .await;

        assert!(transcript.contains("Nothing dictated."));
        assert!(transcript.contains("Heard: Can I break my lease early?"));
        assert!(transcript.contains("you> Can I break my lease early?"));
        assert!(transcript.contains("lexi> Usually not."));
        assert_eq!(provider.requests()[0].prompt, "Can I break my lease early?");
    }

    #[tokio::test]
    async fn dictation_without_a_recognizer_says_why() {
        let transcript = transcript_of(ScriptedProvider::new([]), "/dictate\n/quit\n").await;

        assert!(transcript.contains("Voice input is unavailable: no microphone"));
        assert!(!transcript.contains("Listening..."));
    }
}
