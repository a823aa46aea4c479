//! Deterministic provider that replays a fixed script.
//!
//! Used by tests and by offline runs (`provider_id = "scripted"`), where it echoes the
//! last user turn back word by word.

use std::time::Duration;

use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

use super::provider::{
    EmptyMessageSetSnafu, LlmProvider, ProviderResult, ProviderStreamHandle, ProviderWorker,
    StreamEventMapped, StreamEventPayload, StreamRequest, make_event_stream,
};

pub const SCRIPTED_PROVIDER_ID: &str = "scripted";
pub const SCRIPTED_MODEL: &str = "scripted-echo";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Text(String),
    Reasoning(String),
    Wait(Duration),
    /// Emits an error event and ends the stream.
    Fail(String),
    /// Produces nothing until cancelled.
    Hang,
}

#[derive(Debug, Clone)]
enum Script {
    Steps(Vec<ScriptStep>),
    Echo { delay: Duration },
}

#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    script: Script,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            script: Script::Steps(steps),
        }
    }

    pub fn echo(delay: Duration) -> Self {
        Self {
            script: Script::Echo { delay },
        }
    }

    fn steps_for(&self, request: &StreamRequest) -> Vec<ScriptStep> {
        match &self.script {
            Script::Steps(steps) => steps.clone(),
            Script::Echo { delay } => {
                let prompt = request.last_user_content().unwrap_or_default();
                let mut steps = vec![ScriptStep::Reasoning(format!(
                    "replaying {} message(s)",
                    request.messages.len()
                ))];
                for (index, word) in prompt.split_whitespace().enumerate() {
                    if !delay.is_zero() {
                        steps.push(ScriptStep::Wait(*delay));
                    }
                    let chunk = if index == 0 {
                        word.to_string()
                    } else {
                        format!(" {word}")
                    };
                    steps.push(ScriptStep::Text(chunk));
                }
                steps
            }
        }
    }

    async fn run_script(
        steps: Vec<ScriptStep>,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;

        for step in steps {
            let payload = match step {
                ScriptStep::Text(text) => StreamEventPayload::Delta(text),
                ScriptStep::Reasoning(text) => StreamEventPayload::ReasoningDelta(text),
                ScriptStep::Fail(message) => {
                    let _ = event_tx.send(StreamEventMapped::new(
                        target,
                        StreamEventPayload::Error(message),
                    ));
                    return;
                }
                ScriptStep::Wait(duration) => {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            tracing::debug!(target = ?target, "scripted stream cancelled");
                            return;
                        }
                        _ = tokio::time::sleep(duration) => continue,
                    }
                }
                ScriptStep::Hang => {
                    let _ = (&mut cancel_rx).await;
                    tracing::debug!(target = ?target, "scripted stream cancelled while hanging");
                    return;
                }
            };

            // Cancellation wins over any step that is ready at the same time.
            if cancel_rx.try_recv().is_ok() {
                tracing::debug!(target = ?target, "scripted stream cancelled");
                return;
            }
            if event_tx.send(StreamEventMapped::new(target, payload)).is_err() {
                return;
            }
            tokio::task::yield_now().await;
        }

        let _ = event_tx.send(StreamEventMapped::new(target, StreamEventPayload::Done));
    }
}

impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        SCRIPTED_PROVIDER_ID
    }

    fn default_model(&self) -> &str {
        SCRIPTED_MODEL
    }

    fn stream_chat(&self, request: StreamRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "scripted-stream-chat",
                target: request.target,
            }
        );

        let steps = self.steps_for(&request);
        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker =
            Box::pin(Self::run_script(steps, request, event_tx, cancel_rx));
        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderMessage, Role, StreamTarget};

    fn request(content: &str) -> StreamRequest {
        StreamRequest::new(
            StreamTarget::new(9),
            SCRIPTED_MODEL,
            vec![ProviderMessage::new(Role::User, content)],
        )
    }

    async fn drain(provider: &ScriptedProvider, content: &str) -> Vec<StreamEventPayload> {
        let ProviderStreamHandle { mut stream, worker } =
            provider.stream_chat(request(content)).unwrap();
        tokio::spawn(worker);

        let mut payloads = Vec::new();
        while let Some(event) = stream.recv().await {
            assert_eq!(event.target, StreamTarget::new(9));
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test]
    async fn steps_replay_in_order_then_done() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::Reasoning("thinking".to_string()),
            ScriptStep::Text("hel".to_string()),
            ScriptStep::Text("lo".to_string()),
        ]);

        assert_eq!(
            drain(&provider, "hi").await,
            vec![
                StreamEventPayload::ReasoningDelta("thinking".to_string()),
                StreamEventPayload::Delta("hel".to_string()),
                StreamEventPayload::Delta("lo".to_string()),
                StreamEventPayload::Done,
            ]
        );
    }

    #[tokio::test]
    async fn failure_ends_stream_without_done() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::Text("partial".to_string()),
            ScriptStep::Fail("upstream 500".to_string()),
            ScriptStep::Text("never".to_string()),
        ]);

        assert_eq!(
            drain(&provider, "hi").await,
            vec![
                StreamEventPayload::Delta("partial".to_string()),
                StreamEventPayload::Error("upstream 500".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn cancel_stops_a_hanging_stream() {
        let provider = ScriptedProvider::new(vec![
            ScriptStep::Text("before".to_string()),
            ScriptStep::Hang,
        ]);
        let ProviderStreamHandle { mut stream, worker } =
            provider.stream_chat(request("hi")).unwrap();
        let worker = tokio::spawn(worker);

        assert_eq!(
            stream.recv().await.map(|event| event.payload),
            Some(StreamEventPayload::Delta("before".to_string()))
        );
        assert!(stream.cancel());
        worker.await.unwrap();
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn echo_repeats_last_user_turn() {
        let provider = ScriptedProvider::echo(Duration::ZERO);
        let payloads = drain(&provider, "tree shaped chat").await;

        let text = payloads
            .iter()
            .filter_map(|payload| match payload {
                StreamEventPayload::Delta(delta) => Some(delta.as_str()),
                _ => None,
            })
            .collect::<String>();
        assert_eq!(text, "tree shaped chat");
        assert!(matches!(payloads[0], StreamEventPayload::ReasoningDelta(_)));
        assert_eq!(payloads.last(), Some(&StreamEventPayload::Done));
    }
}
