mod common;

use std::sync::Arc;

use clipbox::service::{IntegrityValidationService, TransactionCoordinator};
use clipbox::storage::history::{HistoryTokenStore, RemoteChangeMonitor};
use clipbox::storage::images::{FsImageStorage, ImageStorage};
use clipbox::storage::models::{Tag, TagId, TagRecipe};
use clipbox::storage::sqlite::SqliteStorage;
use clipbox::storage::{ClipReader, ClipStorage, Transactional};
use common::clip_recipe;
use tempfile::TempDir;

struct Replicas {
    dir: TempDir,
    local: Arc<SqliteStorage>,
    peer: SqliteStorage,
    service: IntegrityValidationService<SqliteStorage, FsImageStorage>,
    monitor: RemoteChangeMonitor,
}

fn replicas() -> Replicas {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("clips.sqlite");
    let local = Arc::new(SqliteStorage::open(&db, "local").unwrap());
    let peer = SqliteStorage::open(&db, "peer").unwrap();
    let service = IntegrityValidationService::new(
        local.clone(),
        FsImageStorage::new(dir.path().join("images")),
        Arc::new(TransactionCoordinator::new()),
    );
    let monitor = RemoteChangeMonitor::new(HistoryTokenStore::new(dir.path().join("token.json")));
    Replicas {
        dir,
        local,
        peer,
        service,
        monitor,
    }
}

fn commit<T>(storage: &SqliteStorage, f: impl FnOnce(&SqliteStorage) -> clipbox::errors::Result<T>) -> T {
    storage.begin_transaction().unwrap();
    let value = f(storage).unwrap();
    storage.commit_transaction().unwrap();
    value
}

#[test]
fn test_remote_duplicate_tag_wins() {
    let r = replicas();
    let local_tag = commit(&r.local, |s| s.create_tag(&TagRecipe::named("travel")));
    let clip = commit(&r.local, |s| s.create_clip(&clip_recipe(&["a.png"]), false)).clip;
    commit(&r.local, |s| s.update_clips_adding_tags(&[clip.id], &[local_tag.id]));
    // Local writes are skipped by the monitor.
    assert!(r.service.poll_and_repair(&r.monitor).unwrap().removed_tags.is_empty());

    let remote_tag = Tag {
        id: TagId::new(),
        name: "travel".into(),
        is_hidden: false,
    };
    r.peer.import_remote_tags("peer", std::slice::from_ref(&remote_tag)).unwrap();

    let report = r.service.poll_and_repair(&r.monitor).unwrap();
    assert_eq!(report.removed_tags, vec![local_tag.id]);
    assert_eq!(r.local.read_all_tags().unwrap(), vec![remote_tag.clone()]);
    assert_eq!(r.local.read_clip(clip.id).unwrap().unwrap().tag_ids(), vec![remote_tag.id]);

    assert_eq!(r.service.poll_and_repair(&r.monitor).unwrap(), Default::default());
}

#[test]
fn test_remote_clip_deletion_removes_images() {
    let r = replicas();
    let clip = commit(&r.local, |s| s.create_clip(&clip_recipe(&["a.png"]), false)).clip;
    r.service.poll_and_repair(&r.monitor).unwrap();
    let images = FsImageStorage::new(r.dir.path().join("images"));
    images.save(b"png", "a.png", clip.id).unwrap();

    commit(&r.peer, |s| s.delete_clips(&[clip.id]));

    let report = r.service.poll_and_repair(&r.monitor).unwrap();
    assert_eq!(report.removed_image_dirs, vec![clip.id]);
    assert!(images.clip_ids().unwrap().is_empty());
    assert_eq!(report.skipped, 0);
}

#[test]
fn test_purge_consumed_history() {
    let r = replicas();
    commit(&r.peer, |s| s.create_tag(&TagRecipe::named("a")));
    assert_eq!(r.monitor.purge_consumed(&r.local).unwrap(), 0);

    r.service.poll_and_repair(&r.monitor).unwrap();
    assert!(r.monitor.purge_consumed(&r.local).unwrap() > 0);
    assert!(r.local.changes_since(None).unwrap().is_empty());
}
