use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_llm::StreamTarget;
use arbor_storage::{ConversationId, MessageId};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ChatResult, GenerationConflictSnafu};

/// Lifecycle of one generation handle.
///
/// `Started` is entered at registration, before the provider produces anything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GenerationState {
    #[default]
    Idle,
    Started,
    Streaming,
    Completed,
    Errored(String),
    Aborted,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored(_) | Self::Aborted)
    }

    pub fn apply(&self, transition: GenerationTransition) -> GenerationTransitionResult {
        match (self, transition) {
            (Self::Idle, GenerationTransition::Start) => Ok(Self::Started),
            (Self::Idle, _) => Err(GenerationTransitionRejection::NotStarted),
            (Self::Started | Self::Streaming, GenerationTransition::Start) => {
                Err(GenerationTransitionRejection::AlreadyStarted)
            }
            (Self::Started | Self::Streaming, GenerationTransition::Delta) => Ok(Self::Streaming),
            (Self::Started | Self::Streaming, GenerationTransition::Complete) => {
                Ok(Self::Completed)
            }
            (Self::Started | Self::Streaming, GenerationTransition::Fail(message)) => {
                Ok(Self::Errored(message))
            }
            (Self::Started | Self::Streaming, GenerationTransition::Abort) => Ok(Self::Aborted),
            (Self::Completed | Self::Errored(_) | Self::Aborted, _) => {
                Err(GenerationTransitionRejection::AlreadyFinished {
                    state: self.clone(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTransition {
    Start,
    Delta,
    Complete,
    Fail(String),
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationTransitionRejection {
    NotStarted,
    AlreadyStarted,
    AlreadyFinished { state: GenerationState },
    /// The guard's handle no longer owns the registry slot.
    Released,
}

pub type GenerationTransitionResult = Result<GenerationState, GenerationTransitionRejection>;

#[derive(Debug)]
struct LiveGeneration {
    handle_id: StreamTarget,
    conversation_id: ConversationId,
    token: CancellationToken,
    state: GenerationState,
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_handle_id: AtomicU64,
    live: Mutex<HashMap<MessageId, LiveGeneration>>,
}

/// Live generation handles keyed by the user message that triggered them.
///
/// At most one handle exists per key; registering a second one is rejected.
#[derive(Debug, Clone, Default)]
pub struct GenerationRegistry {
    inner: Arc<RegistryInner>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> ChatResult<GenerationGuard> {
        let mut live = self.inner.live.lock();
        if live.contains_key(&message_id) {
            return GenerationConflictSnafu {
                stage: "generation-register",
                message_id: message_id.to_string(),
            }
            .fail();
        }

        let handle_id =
            StreamTarget::new(self.inner.next_handle_id.fetch_add(1, Ordering::Relaxed) + 1);
        let token = CancellationToken::new();
        let state = GenerationState::Idle
            .apply(GenerationTransition::Start)
            .unwrap_or(GenerationState::Started);
        live.insert(
            message_id,
            LiveGeneration {
                handle_id,
                conversation_id,
                token: token.clone(),
                state,
            },
        );
        drop(live);

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            handle_id = handle_id.0,
            "generation handle registered"
        );

        Ok(GenerationGuard {
            registry: self.clone(),
            message_id,
            handle_id,
            token,
            released: false,
        })
    }

    /// Requests cancellation of the live handle for `message_id`.
    ///
    /// Returns `false` when there is no live handle or it already reached a terminal
    /// state; aborting a finished generation is a no-op.
    pub fn abort(&self, message_id: MessageId) -> bool {
        let mut live = self.inner.live.lock();
        let Some(entry) = live.get_mut(&message_id) else {
            return false;
        };

        match entry.state.apply(GenerationTransition::Abort) {
            Ok(next) => {
                entry.state = next;
                entry.token.cancel();
                tracing::info!(
                    conversation_id = %entry.conversation_id,
                    message_id = %message_id,
                    handle_id = entry.handle_id.0,
                    "generation abort requested"
                );
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_live(&self, message_id: MessageId) -> bool {
        self.inner.live.lock().contains_key(&message_id)
    }

    pub fn state(&self, message_id: MessageId) -> Option<GenerationState> {
        self.inner
            .live
            .lock()
            .get(&message_id)
            .map(|entry| entry.state.clone())
    }

    pub fn live_count(&self) -> usize {
        self.inner.live.lock().len()
    }

    fn transition(
        &self,
        message_id: MessageId,
        handle_id: StreamTarget,
        transition: GenerationTransition,
    ) -> GenerationTransitionResult {
        let mut live = self.inner.live.lock();
        let entry = live
            .get_mut(&message_id)
            .filter(|entry| entry.handle_id == handle_id)
            .ok_or(GenerationTransitionRejection::Released)?;
        let next = entry.state.apply(transition)?;
        entry.state = next.clone();
        Ok(next)
    }

    fn release(&self, message_id: MessageId, handle_id: StreamTarget) -> bool {
        let mut live = self.inner.live.lock();
        match live.get(&message_id) {
            Some(entry) if entry.handle_id == handle_id => {
                live.remove(&message_id);
                true
            }
            _ => false,
        }
    }
}

/// Ownership of one registry slot. The slot is freed exactly once, on [`release`] or drop.
///
/// [`release`]: GenerationGuard::release
#[derive(Debug)]
pub struct GenerationGuard {
    registry: GenerationRegistry,
    message_id: MessageId,
    handle_id: StreamTarget,
    token: CancellationToken,
    released: bool,
}

impl GenerationGuard {
    pub fn handle_id(&self) -> StreamTarget {
        self.handle_id
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn transition(&self, transition: GenerationTransition) -> GenerationTransitionResult {
        self.registry
            .transition(self.message_id, self.handle_id, transition)
    }

    /// Frees the slot. Returns `false` if this guard no longer owned it.
    pub fn release(mut self) -> bool {
        self.release_once()
    }

    fn release_once(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        let removed = self.registry.release(self.message_id, self.handle_id);
        tracing::debug!(
            message_id = %self.message_id,
            handle_id = self.handle_id.0,
            removed,
            "generation handle released"
        );
        removed
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.release_once();
    }
}
