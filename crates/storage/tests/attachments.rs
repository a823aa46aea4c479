use arbor_storage::{
    AttachmentStore, BlobStore, ConversationId, ConversationStore, MessageId, MessageTreeStore,
    NewAttachment, NewConversation, NewMessage, OrphanPolicy, SqliteStorage, StorageError,
    StorageMode, StorageOptions,
};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake image payload";

async fn open_storage(orphan_policy: OrphanPolicy) -> (SqliteStorage, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let options = StorageOptions::new(dir.path().join("blobs")).with_orphan_policy(orphan_policy);
    let storage = SqliteStorage::open(
        dir.path().join("arbor.db").to_str().unwrap(),
        options,
    )
    .await
    .unwrap();
    (storage, dir)
}

async fn seed_messages(storage: &SqliteStorage) -> (ConversationId, MessageId, MessageId) {
    let conversation_id = storage
        .create_conversation(NewConversation {
            title: "attachments".to_string(),
        })
        .await
        .unwrap()
        .id;
    let first = storage
        .append_message(conversation_id, NewMessage::user(None, "first"))
        .await
        .unwrap();
    let second = storage
        .append_message(conversation_id, NewMessage::user(Some(first.id), "second"))
        .await
        .unwrap();
    (conversation_id, first.id, second.id)
}

#[tokio::test]
async fn identical_uploads_share_one_row_with_two_links() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let (_, first, second) = seed_messages(&storage).await;

    let upload_a = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png").linked_to(first))
        .await
        .unwrap();
    let upload_b = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png").linked_to(second))
        .await
        .unwrap();

    assert!(!upload_a.deduplicated);
    assert!(upload_b.deduplicated);
    assert!(upload_a.linked && upload_b.linked);
    assert_eq!(upload_a.attachment.id, upload_b.attachment.id);
    assert_eq!(
        upload_a.attachment.content_hash,
        BlobStore::compute_hash(PNG_BYTES)
    );

    let row_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 1);
    assert_eq!(
        storage
            .count_attachment_links(upload_a.attachment.id)
            .await
            .unwrap(),
        2
    );
    assert!(storage.blobs().exists(&upload_a.attachment.content_hash));
}

#[tokio::test]
async fn links_are_unique_and_keep_insertion_order() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let (_, first, _) = seed_messages(&storage).await;

    let red = storage
        .create_attachment(NewAttachment::new(b"red".to_vec(), "image/png").with_dimensions(4, 2))
        .await
        .unwrap()
        .attachment;
    let blue = storage
        .create_attachment(NewAttachment::new(b"blue".to_vec(), "image/jpeg"))
        .await
        .unwrap()
        .attachment;

    assert!(storage.link_to_message(blue.id, first).await.unwrap());
    assert!(storage.link_to_message(red.id, first).await.unwrap());
    assert!(!storage.link_to_message(blue.id, first).await.unwrap());

    let listed = storage.list_attachments_for_message(first).await.unwrap();
    let ids = listed.iter().map(|attachment| attachment.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![blue.id, red.id]);
    assert_eq!(listed[1].width_px, Some(4));
    assert_eq!(listed[1].height_px, Some(2));
}

#[tokio::test]
async fn non_image_uploads_are_rejected() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;

    let error = storage
        .create_attachment(NewAttachment::new(b"%PDF".to_vec(), "application/pdf"))
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::UnsupportedAttachment { .. }));
}

#[tokio::test]
async fn retain_policy_keeps_unlinked_attachment() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let (_, first, second) = seed_messages(&storage).await;
    let attachment = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png").linked_to(first))
        .await
        .unwrap()
        .attachment;
    storage.link_to_message(attachment.id, second).await.unwrap();

    let outcome = storage.unlink_from_message(attachment.id, first).await.unwrap();
    assert!(outcome.unlinked);
    assert!(!outcome.attachment_collected);
    assert_eq!(storage.count_attachment_links(attachment.id).await.unwrap(), 1);

    let outcome = storage.unlink_from_message(attachment.id, second).await.unwrap();
    assert!(outcome.unlinked);
    assert!(!outcome.attachment_collected);
    assert!(storage.get_attachment(attachment.id).await.unwrap().is_some());
    assert!(storage.blobs().exists(&attachment.content_hash));

    let again = storage.unlink_from_message(attachment.id, second).await.unwrap();
    assert!(!again.unlinked);

    let collected = storage.collect_orphans().await.unwrap();
    assert_eq!(collected, vec![attachment.id]);
    assert!(storage.get_attachment(attachment.id).await.unwrap().is_none());
    assert!(!storage.blobs().exists(&attachment.content_hash));
}

#[tokio::test]
async fn collect_policy_removes_attachment_with_last_link() {
    let (storage, _dir) = open_storage(OrphanPolicy::Collect).await;
    let (_, first, second) = seed_messages(&storage).await;
    let attachment = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png").linked_to(first))
        .await
        .unwrap()
        .attachment;
    storage.link_to_message(attachment.id, second).await.unwrap();

    let outcome = storage.unlink_from_message(attachment.id, first).await.unwrap();
    assert!(!outcome.attachment_collected);
    assert!(storage.blobs().exists(&attachment.content_hash));

    let outcome = storage.unlink_from_message(attachment.id, second).await.unwrap();
    assert!(outcome.unlinked);
    assert!(outcome.attachment_collected);
    assert!(storage.get_attachment(attachment.id).await.unwrap().is_none());
    assert!(!storage.blobs().exists(&attachment.content_hash));
}

#[tokio::test]
async fn collect_policy_follows_cascade_delete() {
    let (storage, _dir) = open_storage(OrphanPolicy::Collect).await;
    let (_, first, second) = seed_messages(&storage).await;
    let shared = storage
        .create_attachment(NewAttachment::new(b"shared".to_vec(), "image/png").linked_to(first))
        .await
        .unwrap()
        .attachment;
    storage.link_to_message(shared.id, second).await.unwrap();
    let only_second = storage
        .create_attachment(NewAttachment::new(b"only".to_vec(), "image/png").linked_to(second))
        .await
        .unwrap()
        .attachment;

    assert!(storage.delete_message(second).await.unwrap());

    assert!(storage.get_attachment(shared.id).await.unwrap().is_some());
    assert_eq!(storage.count_attachment_links(shared.id).await.unwrap(), 1);
    assert!(storage.get_attachment(only_second.id).await.unwrap().is_none());
    assert!(!storage.blobs().exists(&only_second.content_hash));
}

#[tokio::test]
async fn read_reports_missing_blob_as_attachment_read_failure() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let attachment = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png"))
        .await
        .unwrap()
        .attachment;

    assert_eq!(
        storage.read_attachment_bytes(attachment.id).await.unwrap(),
        PNG_BYTES
    );

    storage.blobs().delete(&attachment.content_hash).unwrap();
    let error = storage
        .read_attachment_bytes(attachment.id)
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::AttachmentRead { .. }));
}

#[tokio::test]
async fn external_attachments_keep_only_the_hash() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let upload = storage
        .create_attachment(
            NewAttachment::new(PNG_BYTES.to_vec(), "image/png")
                .with_external_url("https://cdn.example.com/cat.png"),
        )
        .await
        .unwrap();

    assert_eq!(upload.attachment.storage_mode, StorageMode::External);
    assert!(!storage.blobs().exists(&upload.attachment.content_hash));
    let error = storage
        .read_attachment_bytes(upload.attachment.id)
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::AttachmentRead { .. }));
}

#[tokio::test]
async fn append_with_attachments_links_atomically() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let (conversation_id, first, _) = seed_messages(&storage).await;
    let attachment = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png"))
        .await
        .unwrap()
        .attachment;

    let message = storage
        .append_message_with_attachments(
            conversation_id,
            NewMessage::user(Some(first), "with image"),
            vec![attachment.id, attachment.id],
        )
        .await
        .unwrap();
    assert_eq!(
        storage
            .list_attachments_for_message(message.id)
            .await
            .unwrap()
            .len(),
        1
    );

    let before = storage.list_messages(conversation_id).await.unwrap().len();
    let error = storage
        .append_message_with_attachments(
            conversation_id,
            NewMessage::user(Some(first), "missing image"),
            vec![arbor_storage::AttachmentId::new_v7()],
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::NotFound { entity: "attachment", .. }));
    assert_eq!(
        storage.list_messages(conversation_id).await.unwrap().len(),
        before
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_uploads_resolve_to_one_row() {
    const UPLOADERS: usize = 32;
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;

    let tasks = (0..UPLOADERS)
        .map(|_| {
            let storage = storage.clone();
            tokio::spawn(async move {
                storage
                    .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png"))
                    .await
                    .unwrap()
            })
        })
        .collect::<Vec<_>>();

    let mut ids = std::collections::BTreeSet::new();
    let mut fresh = 0;
    for task in tasks {
        let upload = task.await.unwrap();
        ids.insert(upload.attachment.id);
        if !upload.deduplicated {
            fresh += 1;
        }
    }

    assert_eq!(ids.len(), 1);
    assert_eq!(fresh, 1);
    let row_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 1);
    assert_eq!(
        storage
            .read_attachment_bytes(ids.into_iter().next().unwrap())
            .await
            .unwrap(),
        PNG_BYTES
    );
}

#[tokio::test]
async fn inline_upload_promotes_an_external_row() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;
    let external = storage
        .create_attachment(
            NewAttachment::new(PNG_BYTES.to_vec(), "image/png")
                .with_external_url("https://cdn.example.com/cat.png"),
        )
        .await
        .unwrap();
    assert_eq!(external.attachment.storage_mode, StorageMode::External);

    let inline = storage
        .create_attachment(NewAttachment::new(PNG_BYTES.to_vec(), "image/png"))
        .await
        .unwrap();

    assert!(inline.deduplicated);
    assert_eq!(inline.attachment.id, external.attachment.id);
    assert_eq!(inline.attachment.storage_mode, StorageMode::Inline);
    assert_eq!(inline.attachment.external_url, None);
    assert_eq!(
        storage
            .read_attachment_bytes(external.attachment.id)
            .await
            .unwrap(),
        PNG_BYTES
    );

    // A later external upload of the same bytes keeps the local copy.
    let again = storage
        .create_attachment(
            NewAttachment::new(PNG_BYTES.to_vec(), "image/png")
                .with_external_url("https://cdn.example.com/other.png"),
        )
        .await
        .unwrap();
    assert_eq!(again.attachment.storage_mode, StorageMode::Inline);
}

#[tokio::test]
async fn failed_link_leaves_no_row_or_blob_behind() {
    let (storage, _dir) = open_storage(OrphanPolicy::Retain).await;

    let error = storage
        .create_attachment(
            NewAttachment::new(PNG_BYTES.to_vec(), "image/png").linked_to(MessageId::new_v7()),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, StorageError::NotFound { .. }));

    let row_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM attachments")
        .fetch_one(storage.pool())
        .await
        .unwrap();
    assert_eq!(row_count, 0);
    assert!(!storage.blobs().exists(&BlobStore::compute_hash(PNG_BYTES)));
}
