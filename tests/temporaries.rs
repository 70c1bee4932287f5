mod common;

use std::sync::Arc;

use clipbox::service::{ClipCommandService, TemporariesPersistService, TransactionCoordinator};
use clipbox::storage::images::{FsImageStorage, ImageStorage};
use clipbox::storage::models::{ClipRecipe, TagRecipe};
use clipbox::storage::object_store::ObjectStore;
use clipbox::storage::sqlite::SqliteStorage;
use clipbox::storage::{ClipReader, ClipStorage, Transactional};
use common::clip_recipe;
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    temporaries: Arc<ObjectStore>,
    temporary_images: Arc<FsImageStorage>,
    commands: Arc<ClipCommandService<SqliteStorage, FsImageStorage>>,
    service: TemporariesPersistService<SqliteStorage, FsImageStorage>,
}

fn setup() -> Setup {
    let dir = TempDir::new().unwrap();
    let temporaries = Arc::new(ObjectStore::open(dir.path().join("temporaries/clips.json")).unwrap());
    let temporary_images = Arc::new(FsImageStorage::new(dir.path().join("temporaries/images")));
    let commands = Arc::new(ClipCommandService::new(
        Arc::new(SqliteStorage::open(&dir.path().join("clips.sqlite"), "test").unwrap()),
        FsImageStorage::new(dir.path().join("images")),
        Arc::new(TransactionCoordinator::new()),
    ));
    let service = TemporariesPersistService::new(temporaries.clone(), temporary_images.clone(), commands.clone());
    Setup {
        _dir: dir,
        temporaries,
        temporary_images,
        commands,
        service,
    }
}

fn stage(s: &Setup, recipe: &ClipRecipe) {
    s.temporaries.begin_transaction().unwrap();
    s.temporaries.create_clip(recipe, false).unwrap();
    s.temporaries.commit_transaction().unwrap();
    for item in &recipe.items {
        s.temporary_images
            .save(item.image_file_name.as_bytes(), &item.image_file_name, recipe.id)
            .unwrap();
    }
}

#[test]
fn test_persists_clips_and_maps_tags() {
    let s = setup();
    let existing = s.commands.create_tag("travel").unwrap();
    s.temporaries.begin_transaction().unwrap();
    let clashing = s.temporaries.create_tag(&TagRecipe::named("travel")).unwrap();
    let fresh = s.temporaries.create_tag(&TagRecipe::named("food")).unwrap();
    s.temporaries.commit_transaction().unwrap();

    let mut recipe = clip_recipe(&["a.png", "b.png"]);
    recipe.tag_ids = vec![clashing.id, fresh.id];
    stage(&s, &recipe);

    let report = s.service.persist_all().unwrap();
    assert_eq!(report.persisted, vec![recipe.id]);
    assert!(report.dropped.is_empty() && report.failed.is_empty());

    let storage = s.commands.storage();
    let clip = storage.read_clip(recipe.id).unwrap().unwrap();
    let mut tag_ids = clip.tag_ids();
    tag_ids.sort();
    let mut expected = vec![existing.id, fresh.id];
    expected.sort();
    assert_eq!(tag_ids, expected);
    assert_eq!(storage.read_all_tags().unwrap().len(), 2);
    assert_eq!(s.commands.images().read("b.png", recipe.id).unwrap(), b"b.png".to_vec());

    assert!(s.temporaries.read_all_clips().unwrap().is_empty());
    assert!(s.temporary_images.clip_ids().unwrap().is_empty());
}

#[test]
fn test_already_persisted_clip_is_dropped() {
    let s = setup();
    let recipe = clip_recipe(&["a.png"]);
    stage(&s, &recipe);
    s.service.persist_all().unwrap();

    stage(&s, &recipe);
    let report = s.service.persist_all().unwrap();
    assert_eq!(report.dropped, vec![recipe.id]);
    assert!(s.temporaries.read_all_clips().unwrap().is_empty());
}

#[test]
fn test_clip_with_missing_image_stays_staged() {
    let s = setup();
    let good = clip_recipe(&["a.png"]);
    stage(&s, &good);
    let broken = clip_recipe(&["lost.png"]);
    stage(&s, &broken);
    s.temporary_images.delete_all(broken.id).unwrap();

    let report = s.service.persist_all().unwrap();
    assert_eq!(report.persisted, vec![good.id]);
    assert_eq!(report.failed, vec![broken.id]);
    let staged: Vec<_> = s.temporaries.read_all_clips().unwrap().iter().map(|c| c.id).collect();
    assert_eq!(staged, vec![broken.id]);
    assert!(s.commands.storage().read_clip(broken.id).unwrap().is_none());
}

#[test]
fn test_nothing_staged() {
    let s = setup();
    assert_eq!(s.service.persist_all().unwrap(), Default::default());
}
