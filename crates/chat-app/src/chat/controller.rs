//! Drives one provider stream per triggering user message.
//!
//! The controller registers a [`GenerationGuard`] synchronously, so an abort issued
//! right after [`GenerationController::start`] returns always finds a live handle. The
//! stream itself runs on a spawned task that forwards deltas as [`ChatEvent`]s, persists
//! the assistant reply and releases the handle before emitting the terminal event.

use std::sync::Arc;

use arbor_llm::{
    LlmProvider, ProviderEventStream, ProviderMessage, Role, StreamEventPayload, StreamRequest,
    StreamTarget,
};
use arbor_storage::{ConversationId, MessageId, MessageRecord, MessageRole, NewMessage, Storage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::generation::{GenerationGuard, GenerationRegistry, GenerationTransition};
use super::protocol::ChatEvent;
use crate::error::ChatResult;
use crate::settings::{GenerationSettings, PartialPolicy};

/// Everything needed to answer one user message.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub conversation_id: ConversationId,
    /// Already persisted; the reply becomes its child.
    pub user_message: MessageRecord,
    /// Root-to-`user_message` chain sent to the provider as context.
    pub history: Vec<MessageRecord>,
    pub model: Option<String>,
}

/// Receiving side of a running generation.
#[derive(Debug)]
pub struct GenerationStream {
    pub handle_id: StreamTarget,
    pub message_id: MessageId,
    pub events: mpsc::Receiver<ChatEvent>,
}

#[derive(Clone)]
pub struct GenerationController {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn LlmProvider>,
    registry: GenerationRegistry,
    settings: GenerationSettings,
    preamble: Option<String>,
    max_tokens: Option<u64>,
}

#[derive(Debug, Default)]
struct Accumulated {
    text: String,
    reasoning: String,
}

impl Accumulated {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.reasoning.is_empty()
    }
}

#[derive(Debug)]
enum StreamEnd {
    Completed,
    Failed(String),
    Aborted,
}

impl GenerationController {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn LlmProvider>,
        registry: GenerationRegistry,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            storage,
            provider,
            registry,
            settings,
            preamble: None,
            max_tokens: None,
        }
    }

    pub fn with_preamble(mut self, preamble: Option<String>) -> Self {
        self.preamble = preamble;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u64>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn registry(&self) -> &GenerationRegistry {
        &self.registry
    }

    pub fn provider(&self) -> &Arc<dyn LlmProvider> {
        &self.provider
    }

    /// Registers the handle and spawns the stream task.
    ///
    /// Fails with `GenerationConflict` when the user message already has a live handle.
    pub fn start(&self, request: GenerationRequest) -> ChatResult<GenerationStream> {
        let message_id = request.user_message.id;
        let guard = self.registry.register(request.conversation_id, message_id)?;
        let handle_id = guard.handle_id();
        let (events_tx, events_rx) = mpsc::channel(self.settings.channel_capacity.max(1));

        tokio::spawn(self.clone().run(guard, request, events_tx));

        Ok(GenerationStream {
            handle_id,
            message_id,
            events: events_rx,
        })
    }

    async fn run(
        self,
        guard: GenerationGuard,
        request: GenerationRequest,
        events: mpsc::Sender<ChatEvent>,
    ) {
        let conversation_id = request.conversation_id;
        let user_message_id = request.user_message.id;
        let handle_id = guard.handle_id();
        let model = request
            .model
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| self.provider.default_model())
            .to_string();

        let token = guard.token().clone();
        let opening = [
            ChatEvent::UserMessage {
                message: request.user_message.clone(),
            },
            ChatEvent::GenerationStarted {
                handle_id: handle_id.0,
                message_id: user_message_id,
            },
        ];
        let mut announced = true;
        for event in opening {
            if !emit_until_cancelled(&events, &token, event).await {
                announced = false;
                break;
            }
        }

        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %user_message_id,
            handle_id = handle_id.0,
            provider = self.provider.id(),
            model = %model,
            "generation started"
        );

        let stream_request = self.stream_request(handle_id, &model, &request.history);
        let mut buffers = Accumulated::default();
        let end = if announced {
            match self.provider.stream_chat(stream_request) {
                Ok(handle) => {
                    tokio::spawn(handle.worker);
                    self.drive(&guard, handle.stream, &mut buffers, &events).await
                }
                Err(error) => {
                    tracing::warn!(
                        message_id = %user_message_id,
                        handle_id = handle_id.0,
                        stage = error.stage(),
                        error = %error,
                        "provider stream failed to open"
                    );
                    fail(&guard, error.to_string())
                }
            }
        } else {
            StreamEnd::Aborted
        };

        let terminal = match end {
            StreamEnd::Completed => {
                self.finish_completed(conversation_id, user_message_id, &model, buffers)
                    .await
            }
            StreamEnd::Failed(message) => {
                tracing::warn!(
                    message_id = %user_message_id,
                    handle_id = handle_id.0,
                    error = %message,
                    "generation failed"
                );
                let partial = self
                    .persist_partial(conversation_id, user_message_id, &model, buffers)
                    .await;
                ChatEvent::Error { message, partial }
            }
            StreamEnd::Aborted => {
                tracing::info!(
                    message_id = %user_message_id,
                    handle_id = handle_id.0,
                    "generation aborted"
                );
                let partial = self
                    .persist_partial(conversation_id, user_message_id, &model, buffers)
                    .await;
                ChatEvent::Aborted { partial }
            }
        };

        // Free the slot before the client sees the end, so a follow-up request never
        // races a stale handle.
        guard.release();
        emit(&events, terminal).await;
    }

    fn stream_request(
        &self,
        handle_id: StreamTarget,
        model: &str,
        history: &[MessageRecord],
    ) -> StreamRequest {
        let messages = history
            .iter()
            .filter(|message| !message.content.trim().is_empty())
            .map(|message| ProviderMessage::new(provider_role(message.role), &message.content))
            .collect();

        let mut request = StreamRequest::new(handle_id, model, messages);
        if let Some(preamble) = &self.preamble {
            request = request.with_preamble(preamble);
        }
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    async fn drive(
        &self,
        guard: &GenerationGuard,
        mut stream: ProviderEventStream,
        buffers: &mut Accumulated,
        events: &mpsc::Sender<ChatEvent>,
    ) -> StreamEnd {
        let idle_timeout = self.settings.idle_timeout();
        let token = guard.token().clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    stream.cancel();
                    return StreamEnd::Aborted;
                }
                next = tokio::time::timeout(idle_timeout, stream.recv()) => next,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return fail(guard, "provider stream ended before a terminal event".to_string());
                }
                Err(_) => {
                    stream.cancel();
                    return fail(
                        guard,
                        format!(
                            "provider produced no output for {}s",
                            idle_timeout.as_secs()
                        ),
                    );
                }
            };

            if event.target != guard.handle_id() {
                continue;
            }

            let (delta, chunk) = match event.payload {
                StreamEventPayload::Delta(delta) => {
                    let chunk = ChatEvent::text(delta.as_str());
                    buffers.text.push_str(&delta);
                    (delta, chunk)
                }
                StreamEventPayload::ReasoningDelta(delta) => {
                    let chunk = ChatEvent::reasoning(delta.as_str());
                    buffers.reasoning.push_str(&delta);
                    (delta, chunk)
                }
                StreamEventPayload::Done => {
                    return match guard.transition(GenerationTransition::Complete) {
                        Ok(_) => StreamEnd::Completed,
                        Err(_) => StreamEnd::Aborted,
                    };
                }
                StreamEventPayload::Error(message) => return fail(guard, message),
            };

            if delta.is_empty() {
                continue;
            }
            if guard.transition(GenerationTransition::Delta).is_err() {
                // Only an abort can move the handle out from under the stream task.
                stream.cancel();
                return StreamEnd::Aborted;
            }
            if !emit_until_cancelled(events, &token, chunk).await {
                stream.cancel();
                return StreamEnd::Aborted;
            }
        }
    }

    async fn finish_completed(
        &self,
        conversation_id: ConversationId,
        user_message_id: MessageId,
        model: &str,
        buffers: Accumulated,
    ) -> ChatEvent {
        if buffers.is_empty() {
            tracing::info!(message_id = %user_message_id, "generation completed without output");
            return ChatEvent::NoOutput {
                message_id: user_message_id,
            };
        }

        let reply = assistant_message(user_message_id, model, buffers);
        match self.storage.append_message(conversation_id, reply).await {
            Ok(message) => {
                tracing::info!(
                    conversation_id = %conversation_id,
                    message_id = %user_message_id,
                    reply_id = %message.id,
                    "generation completed"
                );
                ChatEvent::Complete { message }
            }
            Err(error) => {
                tracing::error!(
                    message_id = %user_message_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to persist assistant reply"
                );
                ChatEvent::Error {
                    message: error.to_string(),
                    partial: None,
                }
            }
        }
    }

    async fn persist_partial(
        &self,
        conversation_id: ConversationId,
        user_message_id: MessageId,
        model: &str,
        buffers: Accumulated,
    ) -> Option<MessageRecord> {
        if buffers.is_empty() {
            return None;
        }

        if self.settings.partial_policy == PartialPolicy::Discard {
            tracing::info!(
                message_id = %user_message_id,
                text_chars = buffers.text.chars().count(),
                reasoning_chars = buffers.reasoning.chars().count(),
                "discarding partial generation output"
            );
            return None;
        }

        let partial = assistant_message(user_message_id, model, buffers).partial(true);
        match self.storage.append_message(conversation_id, partial).await {
            Ok(message) => {
                tracing::info!(
                    message_id = %user_message_id,
                    reply_id = %message.id,
                    "persisted partial generation output"
                );
                Some(message)
            }
            Err(error) => {
                tracing::error!(
                    message_id = %user_message_id,
                    stage = error.stage(),
                    error = %error,
                    "failed to persist partial generation output"
                );
                None
            }
        }
    }
}

fn fail(guard: &GenerationGuard, message: String) -> StreamEnd {
    match guard.transition(GenerationTransition::Fail(message.clone())) {
        Ok(_) => StreamEnd::Failed(message),
        Err(_) => StreamEnd::Aborted,
    }
}

fn assistant_message(parent_id: MessageId, model: &str, buffers: Accumulated) -> NewMessage {
    let mut message = NewMessage::assistant(parent_id, buffers.text).with_model_name(model);
    if !buffers.reasoning.is_empty() {
        message = message.with_reasoning(buffers.reasoning);
    }
    message
}

fn provider_role(role: MessageRole) -> Role {
    match role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    }
}

/// A closed receiver means the client went away; the generation keeps running.
async fn emit(events: &mpsc::Sender<ChatEvent>, event: ChatEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("generation event receiver closed");
    }
}

/// Like [`emit`], but stops waiting for channel capacity once `token` is cancelled, so a
/// reader that never polls cannot pin the handle. Returns `false` when the event was
/// dropped because of the cancellation.
async fn emit_until_cancelled(
    events: &mpsc::Sender<ChatEvent>,
    token: &CancellationToken,
    event: ChatEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = emit(events, event) => true,
        _ = token.cancelled() => false,
    }
}
