use std::sync::Arc;
use std::time::Duration;

use arbor::chat::{
    ChatEvent, ChatService, ChunkPart, EditRequest, GenerationController, GenerationRegistry,
    GenerationStream, PathTier, SubmitRequest, UploadRequest,
};
use arbor::error::ChatError;
use arbor::settings::{GenerationSettings, PartialPolicy};
use arbor_llm::{SCRIPTED_MODEL, ScriptStep, ScriptedProvider};
use arbor_storage::{
    ConversationId, MessageId, MessageRecord, MessageRole, MessageTreeStore, SqliteStorage,
    StorageOptions,
};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nbranch attachment";
const GIF_BYTES: &[u8] = b"GIF89a branch attachment";

struct Harness {
    service: ChatService,
    storage: Arc<SqliteStorage>,
    conversation_id: ConversationId,
    _dir: tempfile::TempDir,
}

fn settings(partial_policy: PartialPolicy) -> GenerationSettings {
    GenerationSettings {
        partial_policy,
        idle_timeout_secs: 5,
        channel_capacity: 16,
    }
}

async fn harness_with(provider: ScriptedProvider, settings: GenerationSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(
        SqliteStorage::open(
            dir.path().join("arbor.db").to_str().unwrap(),
            StorageOptions::new(dir.path().join("blobs")),
        )
        .await
        .unwrap(),
    );
    let controller = GenerationController::new(
        storage.clone(),
        Arc::new(provider),
        GenerationRegistry::new(),
        settings,
    );
    let service = ChatService::new(storage.clone(), controller, 1024 * 1024);
    let conversation_id = service.create_conversation("generation").await.unwrap().id;

    Harness {
        service,
        storage,
        conversation_id,
        _dir: dir,
    }
}

async fn harness(steps: Vec<ScriptStep>) -> Harness {
    harness_with(ScriptedProvider::new(steps), settings(PartialPolicy::Persist)).await
}

fn text(value: &str) -> ScriptStep {
    ScriptStep::Text(value.to_string())
}

async fn next_event(stream: &mut GenerationStream) -> Option<ChatEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.events.recv())
        .await
        .expect("generation stalled")
}

async fn drain(stream: &mut GenerationStream) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    while let Some(event) = next_event(stream).await {
        events.push(event);
    }
    events
}

fn terminal(events: &[ChatEvent]) -> &ChatEvent {
    let last = events.last().expect("stream produced no events");
    assert!(last.is_terminal(), "last event was {last:?}");
    assert_eq!(
        events.iter().filter(|event| event.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );
    last
}

fn completed_reply(events: &[ChatEvent]) -> MessageRecord {
    match terminal(events) {
        ChatEvent::Complete { message } => message.clone(),
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn submit_streams_deltas_and_persists_reply_under_user_message() {
    let h = harness(vec![
        ScriptStep::Reasoning("thinking".to_string()),
        text("Hel"),
        text("lo"),
    ])
    .await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("hi there"))
        .await
        .unwrap();
    let user_id = stream.message_id;
    let events = drain(&mut stream).await;

    match &events[0] {
        ChatEvent::UserMessage { message } => {
            assert_eq!(message.id, user_id);
            assert_eq!(message.role, MessageRole::User);
            assert_eq!(message.content, "hi there");
        }
        other => panic!("expected user_message first, got {other:?}"),
    }
    assert_eq!(
        events[1],
        ChatEvent::GenerationStarted {
            handle_id: stream.handle_id.0,
            message_id: user_id
        }
    );
    assert_eq!(
        &events[2..5],
        &[
            ChatEvent::reasoning("thinking"),
            ChatEvent::text("Hel"),
            ChatEvent::text("lo"),
        ]
    );

    let reply = completed_reply(&events);
    assert_eq!(reply.parent_id, Some(user_id));
    assert_eq!(reply.role, MessageRole::Assistant);
    assert_eq!(reply.content, "Hello");
    assert_eq!(reply.reasoning.as_deref(), Some("thinking"));
    assert_eq!(reply.model_name.as_deref(), Some(SCRIPTED_MODEL));
    assert!(!reply.partial);

    assert_eq!(h.storage.get_children(user_id).await.unwrap(), vec![reply.id]);
    assert_eq!(h.service.registry().live_count(), 0);
}

#[tokio::test]
async fn reasoning_and_text_accumulate_independently_when_interleaved() {
    let h = harness(vec![
        text("A"),
        ScriptStep::Reasoning("x".to_string()),
        text("B"),
        ScriptStep::Reasoning("y".to_string()),
    ])
    .await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("interleave"))
        .await
        .unwrap();
    let events = drain(&mut stream).await;

    let parts = events
        .iter()
        .filter_map(|event| match event {
            ChatEvent::Chunk { part, .. } => Some(*part),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        parts,
        vec![
            ChunkPart::Text,
            ChunkPart::Reasoning,
            ChunkPart::Text,
            ChunkPart::Reasoning
        ]
    );

    let reply = completed_reply(&events);
    assert_eq!(reply.content, "AB");
    assert_eq!(reply.reasoning.as_deref(), Some("xy"));
}

#[tokio::test]
async fn empty_generation_reports_no_output_and_persists_nothing() {
    let h = harness(Vec::new()).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("say nothing"))
        .await
        .unwrap();
    let user_id = stream.message_id;
    let events = drain(&mut stream).await;

    assert_eq!(terminal(&events), &ChatEvent::NoOutput { message_id: user_id });
    assert!(h.storage.get_children(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn provider_failure_persists_partial_reply() {
    let h = harness(vec![text("par"), ScriptStep::Fail("upstream exploded".to_string())]).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("fail please"))
        .await
        .unwrap();
    let user_id = stream.message_id;
    let events = drain(&mut stream).await;

    let ChatEvent::Error { message, partial } = terminal(&events) else {
        panic!("expected error event, got {events:?}");
    };
    assert_eq!(message, "upstream exploded");
    let partial = partial.clone().expect("partial reply persisted");
    assert!(partial.partial);
    assert_eq!(partial.content, "par");
    assert_eq!(partial.parent_id, Some(user_id));
    assert_eq!(h.storage.get_children(user_id).await.unwrap(), vec![partial.id]);
    assert_eq!(h.service.registry().live_count(), 0);
}

#[tokio::test]
async fn discard_policy_drops_partial_output() {
    let h = harness_with(
        ScriptedProvider::new(vec![text("par"), ScriptStep::Fail("boom".to_string())]),
        settings(PartialPolicy::Discard),
    )
    .await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("fail please"))
        .await
        .unwrap();
    let user_id = stream.message_id;
    let events = drain(&mut stream).await;

    assert_eq!(
        terminal(&events),
        &ChatEvent::Error {
            message: "boom".to_string(),
            partial: None
        }
    );
    assert!(h.storage.get_children(user_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn abort_mid_stream_keeps_emitted_text_as_partial() {
    let h = harness(vec![text("half"), ScriptStep::Hang]).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("long answer"))
        .await
        .unwrap();
    let user_id = stream.message_id;

    loop {
        match next_event(&mut stream).await {
            Some(ChatEvent::Chunk { .. }) => break,
            Some(_) => continue,
            None => panic!("stream ended before the first chunk"),
        }
    }

    assert!(h.service.abort(user_id));
    let events = drain(&mut stream).await;

    let ChatEvent::Aborted { partial } = terminal(&events) else {
        panic!("expected aborted event, got {events:?}");
    };
    let partial = partial.clone().expect("partial reply persisted");
    assert!(partial.partial);
    assert_eq!(partial.content, "half");

    assert!(!h.service.abort(user_id));
    assert_eq!(h.service.registry().live_count(), 0);
}

#[tokio::test]
async fn abort_right_after_submit_finds_the_live_handle() {
    let h = harness(vec![ScriptStep::Hang]).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("instant cancel"))
        .await
        .unwrap();

    assert!(h.service.abort(stream.message_id));
    let events = drain(&mut stream).await;

    assert!(matches!(events[0], ChatEvent::UserMessage { .. }));
    assert!(matches!(events[1], ChatEvent::GenerationStarted { .. }));
    assert_eq!(terminal(&events), &ChatEvent::Aborted { partial: None });
    assert!(
        h.storage
            .get_children(stream.message_id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn abort_releases_the_handle_while_the_reader_is_stalled() {
    let mut steps = (0..50).map(|_| text("x")).collect::<Vec<_>>();
    steps.push(ScriptStep::Hang);
    let h = harness_with(
        ScriptedProvider::new(steps),
        GenerationSettings {
            channel_capacity: 4,
            ..settings(PartialPolicy::Persist)
        },
    )
    .await;

    // Held but never read, so the event channel fills up.
    let stalled = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("flood"))
        .await
        .unwrap();
    let user_id = stalled.message_id;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(h.service.abort(user_id));

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.service.registry().is_live(user_id) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("aborted handle was never released");

    let children = h.storage.get_children(user_id).await.unwrap();
    assert_eq!(children.len(), 1);
    let partial = h.storage.get_message(children[0]).await.unwrap().unwrap();
    assert!(partial.partial);
    assert!(!partial.content.is_empty());

    let mut again = h.service.regenerate(user_id, None).await.unwrap();
    assert!(h.service.abort(user_id));
    let events = drain(&mut again).await;
    assert!(matches!(terminal(&events), ChatEvent::Aborted { .. }));
    drop(stalled);
}

#[tokio::test]
async fn abort_after_completion_is_a_noop() {
    let h = harness(vec![text("done")]).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("quick"))
        .await
        .unwrap();
    let events = drain(&mut stream).await;
    let reply = completed_reply(&events);

    assert!(!h.service.abort(stream.message_id));
    assert!(!h.service.abort(stream.message_id));
    let stored = h.storage.get_message(reply.id).await.unwrap().unwrap();
    assert!(!stored.partial);
}

#[tokio::test]
async fn regenerate_rejects_a_second_live_generation_for_the_same_message() {
    let h = harness(vec![ScriptStep::Hang]).await;

    let mut first = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("busy"))
        .await
        .unwrap();
    let user_id = first.message_id;

    let conflict = h.service.regenerate(user_id, None).await;
    assert!(matches!(conflict, Err(ChatError::GenerationConflict { .. })));

    assert!(h.service.abort(user_id));
    drain(&mut first).await;

    let mut second = h.service.regenerate(user_id, None).await.unwrap();
    assert_ne!(second.handle_id, first.handle_id);
    assert!(h.service.abort(user_id));
    let events = drain(&mut second).await;
    assert_eq!(terminal(&events), &ChatEvent::Aborted { partial: None });
}

#[tokio::test]
async fn regenerate_adds_a_sibling_reply() {
    let h = harness(vec![text("answer")]).await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("question"))
        .await
        .unwrap();
    let user_id = stream.message_id;
    let first = completed_reply(&drain(&mut stream).await);

    let mut again = h.service.regenerate(user_id, None).await.unwrap();
    let events = drain(&mut again).await;
    let second = completed_reply(&events);

    assert_eq!(
        h.storage.get_children(user_id).await.unwrap(),
        vec![first.id, second.id]
    );
    // The same user message is replayed, not duplicated.
    match &events[0] {
        ChatEvent::UserMessage { message } => assert_eq!(message.id, user_id),
        other => panic!("expected user_message, got {other:?}"),
    }

    let assistant_regenerate = h.service.regenerate(first.id, None).await;
    assert!(matches!(
        assistant_regenerate,
        Err(ChatError::InvalidRequest { .. })
    ));
}

#[tokio::test]
async fn idle_provider_times_out_as_provider_failure() {
    let h = harness_with(
        ScriptedProvider::new(vec![ScriptStep::Hang]),
        GenerationSettings {
            idle_timeout_secs: 1,
            ..settings(PartialPolicy::Persist)
        },
    )
    .await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("anyone there?"))
        .await
        .unwrap();
    let events = drain(&mut stream).await;

    let ChatEvent::Error { message, partial } = terminal(&events) else {
        panic!("expected error event, got {events:?}");
    };
    assert!(message.contains("no output"), "{message}");
    assert!(partial.is_none());
    assert_eq!(h.service.registry().live_count(), 0);
}

#[tokio::test]
async fn echo_provider_sees_the_branch_ancestry() {
    let h = harness_with(
        ScriptedProvider::echo(Duration::ZERO),
        settings(PartialPolicy::Persist),
    )
    .await;

    let mut stream = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("hello branching world"))
        .await
        .unwrap();
    let events = drain(&mut stream).await;

    // One reasoning line naming the context size, then the prompt echoed back.
    assert_eq!(
        events[2],
        ChatEvent::reasoning("replaying 1 message(s)")
    );
    let reply = completed_reply(&events);
    assert_eq!(reply.content, "hello branching world");

    let mut follow_up = h
        .service
        .submit(
            h.conversation_id,
            SubmitRequest::new("second turn").with_parent(reply.id),
        )
        .await
        .unwrap();
    let events = drain(&mut follow_up).await;
    assert_eq!(events[2], ChatEvent::reasoning("replaying 3 message(s)"));
}

#[tokio::test]
async fn submit_rejects_blank_content_and_unknown_parent() {
    let h = harness(vec![text("unused")]).await;

    assert!(matches!(
        h.service
            .submit(h.conversation_id, SubmitRequest::new("   "))
            .await,
        Err(ChatError::InvalidRequest { .. })
    ));
    assert!(matches!(
        h.service
            .submit(
                h.conversation_id,
                SubmitRequest::new("orphan").with_parent(MessageId::new_v7()),
            )
            .await,
        Err(ChatError::Storage {
            source: arbor_storage::StorageError::ParentNotFound { .. },
            ..
        })
    ));
    assert!(h.storage.list_messages(h.conversation_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn editing_forks_a_sibling_and_keeps_the_original_subtree() {
    let h = harness(vec![text("reply")]).await;

    let mut root = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("P"))
        .await
        .unwrap();
    let parent = completed_reply(&drain(&mut root).await);

    let mut original = h
        .service
        .submit(
            h.conversation_id,
            SubmitRequest::new("foo").with_parent(parent.id),
        )
        .await
        .unwrap();
    let original_id = original.message_id;
    let original_reply = completed_reply(&drain(&mut original).await);

    let first = h
        .service
        .upload(UploadRequest {
            message_id: Some(original_id),
            ..UploadRequest::new(PNG_BYTES.to_vec(), "image/png")
        })
        .await
        .unwrap()
        .attachment;
    let second = h
        .service
        .upload(UploadRequest::new(GIF_BYTES.to_vec(), "image/gif"))
        .await
        .unwrap()
        .attachment;

    let mut edit = h
        .service
        .edit(
            EditRequest {
                added_attachments: vec![second.id],
                ..EditRequest::new(original_id, "bar")
            },
            None,
        )
        .await
        .unwrap();
    let sibling_id = edit.message_id;
    let edit_events = drain(&mut edit).await;
    let sibling_reply = completed_reply(&edit_events);

    let sibling = h.storage.get_message(sibling_id).await.unwrap().unwrap();
    assert_eq!(sibling.parent_id, Some(parent.id));
    assert_eq!(sibling.content, "bar");
    assert_eq!(sibling.role, MessageRole::User);
    assert_eq!(sibling_reply.parent_id, Some(sibling_id));

    let original_after = h.storage.get_message(original_id).await.unwrap().unwrap();
    assert_eq!(original_after.content, "foo");
    assert_eq!(original_after.children_ids, vec![original_reply.id]);
    assert_eq!(
        h.storage.get_children(parent.id).await.unwrap(),
        vec![original_id, sibling_id]
    );

    let carried = h
        .service
        .attachments(sibling_id, false)
        .await
        .unwrap()
        .into_iter()
        .map(|payload| payload.attachment.id)
        .collect::<Vec<_>>();
    assert_eq!(carried, vec![first.id, second.id]);
    assert_eq!(h.service.attachments(original_id, false).await.unwrap().len(), 1);

    // Both branches stay displayable.
    let old_branch = h
        .service
        .resolve_path(
            h.conversation_id,
            Some(&[parent.id, original_id, original_reply.id]),
        )
        .await
        .unwrap();
    assert_eq!(old_branch.tier, PathTier::Explicit);
    let everything = h.service.resolve_path(h.conversation_id, None).await.unwrap();
    assert_eq!(everything.tier, PathTier::Fallback);
    assert_eq!(everything.messages.len(), 6);
}

#[tokio::test]
async fn editing_a_root_creates_another_root() {
    let h = harness(vec![text("reply")]).await;

    let mut root = h
        .service
        .submit(h.conversation_id, SubmitRequest::new("first root"))
        .await
        .unwrap();
    drain(&mut root).await;

    let mut edit = h
        .service
        .edit(EditRequest::new(root.message_id, "second root"), None)
        .await
        .unwrap();
    drain(&mut edit).await;

    let tree = h.service.tree(h.conversation_id).await.unwrap();
    assert_eq!(tree.id, None);
    let roots = tree
        .children
        .iter()
        .map(|node| node.id)
        .collect::<Vec<_>>();
    assert_eq!(roots, vec![Some(root.message_id), Some(edit.message_id)]);
    assert!(tree.children.iter().all(|node| node.children.len() == 1));
}

#[tokio::test]
async fn attachment_payload_skips_unreadable_bytes() {
    let h = harness(vec![text("unused")]).await;
    let message = h
        .storage
        .append_message(
            h.conversation_id,
            arbor_storage::NewMessage::user(None, "with images"),
        )
        .await
        .unwrap();

    let readable = h
        .service
        .upload(UploadRequest {
            message_id: Some(message.id),
            ..UploadRequest::new(PNG_BYTES.to_vec(), "image/png")
        })
        .await
        .unwrap()
        .attachment;
    let broken = h
        .service
        .upload(UploadRequest {
            message_id: Some(message.id),
            ..UploadRequest::new(GIF_BYTES.to_vec(), "image/gif")
        })
        .await
        .unwrap()
        .attachment;
    assert!(h.storage.blobs().delete(&broken.content_hash).unwrap());

    let payloads = h.service.attachments(message.id, true).await.unwrap();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].attachment.id, readable.id);
    assert!(payloads[0].content_base64.is_some());

    // Metadata listing is unaffected.
    assert_eq!(h.service.attachments(message.id, false).await.unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_upload_is_rejected_before_storage() {
    let h = harness(vec![text("unused")]).await;

    let error = h
        .service
        .upload(UploadRequest::new(vec![0u8; 1024 * 1024 + 1], "image/png"))
        .await
        .unwrap_err();
    assert!(matches!(error, ChatError::PayloadTooLarge { .. }));
}
