//! Integration tests for the metadata store.

use chrono::Utc;
use nimbus_core::domain::change::ChangeOp;
use nimbus_core::domain::ids::{ContentHash, DeltaLink, ETag, ItemId};
use nimbus_core::domain::item::{Inode, ItemState};
use nimbus_store::metadata::SessionCheckpoint;
use nimbus_store::{DatabasePool, MetadataStore};

async fn store() -> MetadataStore {
    let pool = DatabasePool::in_memory().await.unwrap();
    MetadataStore::new(pool.pool().clone())
}

fn root_id() -> ItemId {
    ItemId::new("ROOT").unwrap()
}

fn sample_file(id: &str, name: &str) -> Inode {
    let mut inode = Inode::new_file(
        ItemId::new(id).unwrap(),
        root_id(),
        name,
        1024,
        Utc::now(),
    )
    .unwrap();
    inode.set_remote_hash(Some(ContentHash::new("aGFzaA==").unwrap()));
    inode.set_etag(Some(ETag::new("\"v1\"")));
    inode
}

#[tokio::test]
async fn test_inode_roundtrip() {
    let store = store().await;
    let inode = sample_file("F1", "notes.txt");
    store.save_inode(&inode).await.unwrap();

    let loaded = store.load_all_inodes().await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0], inode);
}

#[tokio::test]
async fn test_inode_roundtrip_preserves_dirty_state() {
    let store = store().await;
    let mut inode = sample_file("F1", "notes.txt");
    inode
        .mark_dirty(Some(ContentHash::new("bmV3").unwrap()), 2048, Utc::now())
        .unwrap();
    store.save_inode(&inode).await.unwrap();

    let loaded = &store.load_all_inodes().await.unwrap()[0];
    assert!(loaded.has_changes());
    assert_eq!(*loaded.state(), ItemState::DirtyLocal);
    assert_eq!(loaded.local_hash().unwrap().as_str(), "bmV3");
    assert_eq!(loaded.size(), 2048);
}

#[tokio::test]
async fn test_error_state_roundtrip() {
    let store = store().await;
    let mut inode = sample_file("F1", "broken.txt");
    inode
        .transition_to(ItemState::Error("hash mismatch".to_string()))
        .unwrap();
    store.save_inode(&inode).await.unwrap();

    let loaded = &store.load_all_inodes().await.unwrap()[0];
    assert_eq!(
        *loaded.state(),
        ItemState::Error("hash mismatch".to_string())
    );
}

#[tokio::test]
async fn test_virtual_inodes_not_persisted() {
    let store = store().await;
    let virt = Inode::new_virtual(root_id(), ".xdg-volume-info", b"x".to_vec()).unwrap();
    store.save_inode(&virt).await.unwrap();
    assert!(store.load_all_inodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_inode() {
    let store = store().await;
    let inode = sample_file("F1", "gone.txt");
    store.save_inode(&inode).await.unwrap();
    store.delete_inode(inode.id()).await.unwrap();
    assert!(store.load_all_inodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rewrite_id_touches_every_bucket() {
    let store = store().await;
    let local = ItemId::local();

    // Inode row under the local id, plus a child referencing it.
    let mut parent =
        Inode::new_directory(local.clone(), Some(root_id()), "newdir", Utc::now()).unwrap();
    parent.set_children_loaded(true);
    store.save_inode(&parent).await.unwrap();
    let child = Inode::new_file(
        ItemId::new("C1").unwrap(),
        local.clone(),
        "inside.txt",
        1,
        Utc::now(),
    )
    .unwrap();
    store.save_inode(&child).await.unwrap();

    // A pending change and a session checkpoint keyed by the local id.
    store
        .append_change(&local, &ChangeOp::Write)
        .await
        .unwrap();
    store
        .save_session(&SessionCheckpoint {
            item_id: local.clone(),
            upload_url: "https://u".to_string(),
            total_size: 10,
            next_offset: 0,
            expires: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let server = ItemId::new("SRV1").unwrap();
    store.rewrite_id(&local, &server).await.unwrap();

    let inodes = store.load_all_inodes().await.unwrap();
    assert!(inodes.iter().any(|i| i.id() == &server));
    assert!(inodes
        .iter()
        .any(|i| i.parent() == Some(&server) && i.name() == "inside.txt"));

    let changes = store.list_changes().await.unwrap();
    assert_eq!(changes[0].target, server);

    assert!(store.load_session(&server).await.unwrap().is_some());
    assert!(store.load_session(&local).await.unwrap().is_none());
}

#[tokio::test]
async fn test_change_log_ordering_and_removal() {
    let store = store().await;
    let target = ItemId::new("T1").unwrap();

    let s1 = store.append_change(&target, &ChangeOp::Write).await.unwrap();
    let s2 = store
        .append_change(
            &target,
            &ChangeOp::Rename {
                new_parent: root_id(),
                new_name: "moved.txt".to_string(),
            },
        )
        .await
        .unwrap();
    let s3 = store.append_change(&target, &ChangeOp::Delete).await.unwrap();
    assert!(s1 < s2 && s2 < s3);

    let changes = store.changes_for(&target).await.unwrap();
    assert_eq!(changes.len(), 3);
    assert_eq!(changes[0].op.name(), "write");
    assert_eq!(changes[2].op.name(), "delete");

    store.remove_change(s2).await.unwrap();
    assert_eq!(store.changes_for(&target).await.unwrap().len(), 2);

    store.remove_changes_for(&target).await.unwrap();
    assert!(store.list_changes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delta_link_persistence() {
    let store = store().await;
    assert!(store.delta_link().await.unwrap().is_none());

    store
        .set_delta_link(&DeltaLink::new("https://delta?token=A"))
        .await
        .unwrap();
    assert_eq!(
        store.delta_link().await.unwrap().unwrap().as_str(),
        "https://delta?token=A"
    );

    // Overwrite keeps exactly one link.
    store
        .set_delta_link(&DeltaLink::new("https://delta?token=B"))
        .await
        .unwrap();
    assert_eq!(
        store.delta_link().await.unwrap().unwrap().as_str(),
        "https://delta?token=B"
    );
}

#[tokio::test]
async fn test_session_checkpoint_roundtrip() {
    let store = store().await;
    let item = ItemId::new("BIG1").unwrap();
    let checkpoint = SessionCheckpoint {
        item_id: item.clone(),
        upload_url: "https://upload/session/1".to_string(),
        total_size: 50_000_000,
        next_offset: 10_485_760,
        expires: None,
        created_at: Utc::now(),
    };
    store.save_session(&checkpoint).await.unwrap();

    let loaded = store.load_session(&item).await.unwrap().unwrap();
    assert_eq!(loaded.upload_url, checkpoint.upload_url);
    assert_eq!(loaded.next_offset, 10_485_760);

    store.delete_session(&item).await.unwrap();
    assert!(store.load_session(&item).await.unwrap().is_none());
}

#[tokio::test]
async fn test_meta_bucket() {
    let store = store().await;
    store.set_meta("principal", "ada@example.com").await.unwrap();
    assert_eq!(
        store.meta("principal").await.unwrap().unwrap(),
        "ada@example.com"
    );
    assert!(store.meta("missing").await.unwrap().is_none());
}
