//! Embedded object store.
//!
//! Records live in an in-memory arena of plain structs with an explicit
//! reverse index for the relationships. The arena is persisted as one JSON
//! document, rewritten atomically on every commit. Writes go to a working copy
//! that exists only between `begin_transaction` and commit/cancel; reads always
//! see the last committed state.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use super::models::{
    Album, AlbumId, AlbumItem, AlbumItemId, AlbumRecipe, Clip, ClipCreation, ClipId, ClipItem,
    ClipItemId, ClipItemRecipe, ClipMerge, ClipPurge, ClipRecipe, Tag, TagId, TagRecipe,
};
use super::ordering;
use super::{ClipReader, ClipStorage, Transactional};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClipObject {
    id: ClipId,
    description: Option<String>,
    tag_ids: BTreeSet<TagId>,
    is_hidden: bool,
    images_size: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlbumObject {
    id: AlbumId,
    title: String,
    is_hidden: bool,
    index: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// On-disk layout.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectFile {
    version: u32,
    clips: Vec<ClipObject>,
    items: Vec<ClipItem>,
    tags: Vec<Tag>,
    albums: Vec<AlbumObject>,
    album_items: Vec<AlbumItem>,
}

/// Relationship lookups derived from the arena. Rebuilt on load, never persisted.
#[derive(Debug, Clone, Default)]
struct ReverseIndex {
    items_by_clip: HashMap<ClipId, BTreeSet<ClipItemId>>,
    clips_by_tag: HashMap<TagId, BTreeSet<ClipId>>,
    album_items_by_album: HashMap<AlbumId, BTreeSet<AlbumItemId>>,
    album_items_by_clip: HashMap<ClipId, BTreeSet<AlbumItemId>>,
}

#[derive(Debug, Clone, Default)]
struct Arena {
    clips: HashMap<ClipId, ClipObject>,
    items: HashMap<ClipItemId, ClipItem>,
    tags: HashMap<TagId, Tag>,
    albums: HashMap<AlbumId, AlbumObject>,
    album_items: HashMap<AlbumItemId, AlbumItem>,
    index: ReverseIndex,
}

fn detach<K: Ord, V: Eq + std::hash::Hash + Copy>(map: &mut HashMap<V, BTreeSet<K>>, key: V, member: &K) {
    if let Some(set) = map.get_mut(&key) {
        set.remove(member);
        if set.is_empty() {
            map.remove(&key);
        }
    }
}

impl Arena {
    fn from_file(file: ObjectFile) -> Self {
        let mut arena = Arena {
            clips: file.clips.into_iter().map(|c| (c.id, c)).collect(),
            items: file.items.into_iter().map(|i| (i.id, i)).collect(),
            tags: file.tags.into_iter().map(|t| (t.id, t)).collect(),
            albums: file.albums.into_iter().map(|a| (a.id, a)).collect(),
            album_items: file.album_items.into_iter().map(|i| (i.id, i)).collect(),
            index: ReverseIndex::default(),
        };
        arena.rebuild_index();
        arena
    }

    fn to_file(&self) -> ObjectFile {
        let mut file = ObjectFile {
            version: FORMAT_VERSION,
            clips: self.clips.values().cloned().collect(),
            items: self.items.values().cloned().collect(),
            tags: self.tags.values().cloned().collect(),
            albums: self.albums.values().cloned().collect(),
            album_items: self.album_items.values().cloned().collect(),
        };
        file.clips.sort_by_key(|c| c.id);
        file.items.sort_by_key(|i| i.id);
        file.tags.sort_by_key(|t| t.id);
        file.albums.sort_by_key(|a| a.id);
        file.album_items.sort_by_key(|i| i.id);
        file
    }

    fn rebuild_index(&mut self) {
        let mut index = ReverseIndex::default();
        let mut dangling = 0usize;
        for item in self.items.values() {
            index.items_by_clip.entry(item.clip_id).or_default().insert(item.id);
        }
        for clip in self.clips.values_mut() {
            let before = clip.tag_ids.len();
            clip.tag_ids.retain(|id| self.tags.contains_key(id));
            dangling += before - clip.tag_ids.len();
            for tag_id in &clip.tag_ids {
                index.clips_by_tag.entry(*tag_id).or_default().insert(clip.id);
            }
        }
        for item in self.album_items.values() {
            index.album_items_by_album.entry(item.album_id).or_default().insert(item.id);
            index.album_items_by_clip.entry(item.clip_id).or_default().insert(item.id);
        }
        if dangling > 0 {
            warn!(dangling, "dropped tag links to missing tags while loading");
        }
        self.index = index;
    }

    // --- Projections ---

    fn sorted_items(&self, clip_id: ClipId) -> Vec<&ClipItem> {
        let mut items: Vec<&ClipItem> = self
            .index
            .items_by_clip
            .get(&clip_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.items.get(id))
            .collect();
        items.sort_by_key(|i| (i.index, i.id));
        items
    }

    fn sorted_album_items(&self, album_id: AlbumId) -> Vec<&AlbumItem> {
        let mut items: Vec<&AlbumItem> = self
            .index
            .album_items_by_album
            .get(&album_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.album_items.get(id))
            .collect();
        items.sort_by_key(|i| (i.index, i.id));
        items
    }

    fn clip(&self, id: ClipId) -> Option<Clip> {
        let object = self.clips.get(&id)?;
        let mut tags: Vec<Tag> = object
            .tag_ids
            .iter()
            .filter_map(|t| self.tags.get(t).cloned())
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Some(Clip {
            id,
            description: object.description.clone(),
            items: self.sorted_items(id).into_iter().cloned().collect(),
            tags,
            is_hidden: object.is_hidden,
            images_size: object.images_size,
            created_at: object.created_at,
            updated_at: object.updated_at,
        })
    }

    fn album(&self, id: AlbumId) -> Option<Album> {
        let object = self.albums.get(&id)?;
        Some(Album {
            id,
            title: object.title.clone(),
            is_hidden: object.is_hidden,
            index: object.index,
            items: self.sorted_album_items(id).into_iter().cloned().collect(),
            created_at: object.created_at,
            updated_at: object.updated_at,
        })
    }

    fn all_clips(&self) -> Vec<Clip> {
        let mut clips: Vec<Clip> = self.clips.keys().filter_map(|id| self.clip(*id)).collect();
        clips.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        clips
    }

    fn all_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self.tags.values().cloned().collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        tags
    }

    fn all_albums(&self) -> Vec<Album> {
        let mut albums: Vec<Album> = self.albums.keys().filter_map(|id| self.album(*id)).collect();
        albums.sort_by_key(|a| (a.index, a.id));
        albums
    }

    fn require_clip(&self, id: ClipId) -> Result<Clip> {
        self.clip(id).ok_or_else(|| StorageError::NotFound(format!("clip {}", id)))
    }

    fn require_album(&self, id: AlbumId) -> Result<Album> {
        self.album(id).ok_or_else(|| StorageError::NotFound(format!("album {}", id)))
    }

    fn require_tag(&self, id: TagId) -> Result<Tag> {
        self.tags
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("tag {}", id)))
    }

    fn album_ids_containing(&self, clip_id: ClipId) -> Vec<AlbumId> {
        let mut ids: Vec<AlbumId> = self
            .index
            .album_items_by_clip
            .get(&clip_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.album_items.get(id).map(|i| i.album_id))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn tag_ids_named(&self, name: &str) -> Vec<TagId> {
        let mut ids: Vec<TagId> = self
            .tags
            .values()
            .filter(|t| t.name == name)
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    // --- Primitive mutations keeping the reverse index in step ---

    fn insert_item(&mut self, item: ClipItem) {
        self.index.items_by_clip.entry(item.clip_id).or_default().insert(item.id);
        self.items.insert(item.id, item);
    }

    fn remove_item(&mut self, id: ClipItemId) -> Option<ClipItem> {
        let item = self.items.remove(&id)?;
        detach(&mut self.index.items_by_clip, item.clip_id, &id);
        Some(item)
    }

    fn move_item(&mut self, id: ClipItemId, clip_id: ClipId, index: i64, now: DateTime<Utc>) {
        if let Some(mut item) = self.remove_item(id) {
            item.clip_id = clip_id;
            item.index = index;
            item.updated_at = now;
            self.insert_item(item);
        }
    }

    fn link_tag(&mut self, clip_id: ClipId, tag_id: TagId) -> bool {
        let Some(clip) = self.clips.get_mut(&clip_id) else {
            return false;
        };
        if !clip.tag_ids.insert(tag_id) {
            return false;
        }
        self.index.clips_by_tag.entry(tag_id).or_default().insert(clip_id);
        true
    }

    fn unlink_tag(&mut self, clip_id: ClipId, tag_id: TagId) -> bool {
        let Some(clip) = self.clips.get_mut(&clip_id) else {
            return false;
        };
        if !clip.tag_ids.remove(&tag_id) {
            return false;
        }
        detach(&mut self.index.clips_by_tag, tag_id, &clip_id);
        true
    }

    fn insert_album_item(&mut self, album_id: AlbumId, clip_id: ClipId, index: i64, now: DateTime<Utc>) {
        let item = AlbumItem {
            id: AlbumItemId::new(),
            album_id,
            clip_id,
            index,
            created_at: now,
            updated_at: now,
        };
        self.index.album_items_by_album.entry(album_id).or_default().insert(item.id);
        self.index.album_items_by_clip.entry(clip_id).or_default().insert(item.id);
        self.album_items.insert(item.id, item);
    }

    fn remove_album_item(&mut self, id: AlbumItemId) {
        if let Some(item) = self.album_items.remove(&id) {
            detach(&mut self.index.album_items_by_album, item.album_id, &id);
            detach(&mut self.index.album_items_by_clip, item.clip_id, &id);
        }
    }

    fn set_album_item_index(&mut self, id: AlbumItemId, index: i64, now: DateTime<Utc>) {
        if let Some(item) = self.album_items.get_mut(&id) {
            item.index = index;
            item.updated_at = now;
        }
    }

    fn touch_clip(&mut self, id: ClipId, now: DateTime<Utc>) {
        if let Some(clip) = self.clips.get_mut(&id) {
            clip.updated_at = now;
        }
    }

    fn touch_album(&mut self, id: AlbumId, now: DateTime<Utc>) {
        if let Some(album) = self.albums.get_mut(&id) {
            album.updated_at = now;
        }
    }

    fn refresh_images_size(&mut self, id: ClipId) {
        let total: i64 = self.sorted_items(id).iter().map(|i| i.image_data_size).sum();
        if let Some(clip) = self.clips.get_mut(&id) {
            clip.images_size = total;
        }
    }

    fn renumber_clip_items(&mut self, clip_id: ClipId, now: DateTime<Utc>) {
        let entries: Vec<(ClipItemId, i64)> = self
            .sorted_items(clip_id)
            .iter()
            .map(|i| (i.id, i.index))
            .collect();
        for (id, index) in ordering::renumber(&entries) {
            if let Some(item) = self.items.get_mut(&id) {
                item.index = index;
                item.updated_at = now;
            }
        }
    }

    fn renumber_album_items(&mut self, album_id: AlbumId, now: DateTime<Utc>) {
        let entries: Vec<(AlbumItemId, i64)> = self
            .sorted_album_items(album_id)
            .iter()
            .map(|i| (i.id, i.index))
            .collect();
        for (id, index) in ordering::renumber(&entries) {
            self.set_album_item_index(id, index, now);
        }
    }

    fn renumber_albums(&mut self, now: DateTime<Utc>) {
        let mut entries: Vec<(AlbumId, i64)> = self.albums.values().map(|a| (a.id, a.index)).collect();
        entries.sort_by_key(|(id, index)| (*index, *id));
        for (id, index) in ordering::renumber(&entries) {
            if let Some(album) = self.albums.get_mut(&id) {
                album.index = index;
                album.updated_at = now;
            }
        }
    }

    fn rewrite_album_members(&mut self, album_id: AlbumId, order: &[ClipId], now: DateTime<Utc>) {
        let existing: Vec<AlbumItem> = self
            .sorted_album_items(album_id)
            .into_iter()
            .cloned()
            .collect();
        for item in existing.iter().filter(|i| !order.contains(&i.clip_id)) {
            self.remove_album_item(item.id);
        }
        for (clip_id, index) in ordering::dense_positions(order) {
            match existing.iter().find(|i| i.clip_id == clip_id) {
                Some(item) if item.index == index => {}
                Some(item) => self.set_album_item_index(item.id, index, now),
                None => self.insert_album_item(album_id, clip_id, index, now),
            }
        }
        self.touch_album(album_id, now);
    }

    /// Removes a clip with its items, tag links and album memberships.
    /// Returns the albums that lost a member.
    fn remove_clip(&mut self, id: ClipId) -> Vec<AlbumId> {
        let albums = self.album_ids_containing(id);
        let item_ids: Vec<ClipItemId> = self
            .index
            .items_by_clip
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for item_id in item_ids {
            self.remove_item(item_id);
        }
        let album_item_ids: Vec<AlbumItemId> = self
            .index
            .album_items_by_clip
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        for album_item_id in album_item_ids {
            self.remove_album_item(album_item_id);
        }
        if let Some(clip) = self.clips.remove(&id) {
            for tag_id in &clip.tag_ids {
                detach(&mut self.index.clips_by_tag, *tag_id, &id);
            }
        }
        albums
    }

    // --- Contract operations ---

    fn create_clip(&mut self, recipe: &ClipRecipe, overwrite: bool) -> Result<ClipCreation> {
        let items = recipe.normalized_items();
        let images_size: i64 = items.iter().map(|i| i.image_data_size).sum();
        let existing = self.clip(recipe.id);
        if existing.is_some() && !overwrite {
            return Err(StorageError::Duplicated(format!("clip {}", recipe.id)));
        }
        for item in &items {
            if let Some(other) = self.items.get(&item.id)
                && !(overwrite && other.clip_id == recipe.id)
            {
                return Err(StorageError::Duplicated(format!("clip item {}", item.id)));
            }
        }

        let now = Utc::now();
        let to_item = |r: &ClipItemRecipe| ClipItem {
            id: r.id,
            clip_id: recipe.id,
            site_url: r.site_url.clone(),
            image_id: r.image_id,
            image_file_name: r.image_file_name.clone(),
            image_url: r.image_url.clone(),
            image_size: r.image_size,
            image_data_size: r.image_data_size,
            index: r.index,
            created_at: r.created_at,
            updated_at: r.updated_at,
        };

        if let Some(existing) = existing {
            for item in &existing.items {
                self.remove_item(item.id);
            }
            for item in &items {
                self.insert_item(to_item(item));
            }
            // Tag links survive an overwrite.
            if let Some(clip) = self.clips.get_mut(&recipe.id) {
                clip.description = recipe.description.clone();
                clip.is_hidden = recipe.is_hidden;
                clip.images_size = images_size;
                clip.updated_at = now;
            }
            return Ok(ClipCreation {
                clip: self.require_clip(recipe.id)?,
                replaced: Some(existing),
            });
        }

        self.clips.insert(
            recipe.id,
            ClipObject {
                id: recipe.id,
                description: recipe.description.clone(),
                tag_ids: BTreeSet::new(),
                is_hidden: recipe.is_hidden,
                images_size,
                created_at: recipe.created_at,
                updated_at: recipe.updated_at,
            },
        );
        for item in &items {
            self.insert_item(to_item(item));
        }
        for tag_id in ordering::unique(&recipe.tag_ids) {
            if !self.tags.contains_key(&tag_id) {
                warn!(clip = %recipe.id, tag = %tag_id, "dropping link to missing tag");
                continue;
            }
            self.link_tag(recipe.id, tag_id);
        }
        Ok(ClipCreation {
            clip: self.require_clip(recipe.id)?,
            replaced: None,
        })
    }

    fn create_tag(&mut self, recipe: &TagRecipe) -> Result<Tag> {
        if self.tags.contains_key(&recipe.id) {
            return Err(StorageError::Duplicated(format!("tag {}", recipe.id)));
        }
        if !self.tag_ids_named(&recipe.name).is_empty() {
            return Err(StorageError::Duplicated(format!("tag named {:?}", recipe.name)));
        }
        let tag = Tag {
            id: recipe.id,
            name: recipe.name.clone(),
            is_hidden: recipe.is_hidden,
        };
        self.tags.insert(tag.id, tag.clone());
        Ok(tag)
    }

    fn create_album(&mut self, recipe: &AlbumRecipe) -> Result<Album> {
        if self.albums.contains_key(&recipe.id) {
            return Err(StorageError::Duplicated(format!("album {}", recipe.id)));
        }
        if self.albums.values().any(|a| a.title == recipe.title) {
            return Err(StorageError::Duplicated(format!("album titled {:?}", recipe.title)));
        }
        let now = Utc::now();
        let index = ordering::next_index(self.albums.values().map(|a| a.index));
        self.albums.insert(
            recipe.id,
            AlbumObject {
                id: recipe.id,
                title: recipe.title.clone(),
                is_hidden: recipe.is_hidden,
                index,
                created_at: now,
                updated_at: now,
            },
        );
        self.require_album(recipe.id)
    }

    fn resolve_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        ordering::resolve_all(ids, "clip", |id| Ok(self.clip(id)))
    }

    fn resolve_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        ordering::resolve_all(ids, "tag", |id| Ok(self.tags.get(&id).cloned()))
    }

    fn reread_clips(&self, clips: &[Clip]) -> Result<Vec<Clip>> {
        clips.iter().map(|c| self.require_clip(c.id)).collect()
    }

    fn update_clips_hiding(&mut self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>> {
        let clips = self.resolve_clips(ids)?;
        let now = Utc::now();
        for clip in &clips {
            if let Some(object) = self.clips.get_mut(&clip.id) {
                object.is_hidden = is_hidden;
                object.updated_at = now;
            }
        }
        self.reread_clips(&clips)
    }

    fn update_clips_adding_tags(&mut self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let clips = self.resolve_clips(ids)?;
        let tags = self.resolve_tags(tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            let mut changed = false;
            for tag in &tags {
                changed |= self.link_tag(clip.id, tag.id);
            }
            if changed {
                self.touch_clip(clip.id, now);
            }
        }
        self.reread_clips(&clips)
    }

    fn update_clips_deleting_tags(&mut self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let clips = self.resolve_clips(ids)?;
        let tags = self.resolve_tags(tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            let mut changed = false;
            for tag in &tags {
                changed |= self.unlink_tag(clip.id, tag.id);
            }
            if changed {
                self.touch_clip(clip.id, now);
            }
        }
        self.reread_clips(&clips)
    }

    fn update_clips_replacing_tags(&mut self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        let clips = self.resolve_clips(ids)?;
        let tags = self.resolve_tags(tag_ids)?;
        let now = Utc::now();
        for clip in &clips {
            for old in clip.tag_ids() {
                self.unlink_tag(clip.id, old);
            }
            for tag in &tags {
                self.link_tag(clip.id, tag.id);
            }
            self.touch_clip(clip.id, now);
        }
        self.reread_clips(&clips)
    }

    fn update_clip_reordering_items(&mut self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip> {
        let clip = self.require_clip(id)?;
        ordering::require_same_members(item_ids, &clip.item_ids(), "clip item")?;
        let now = Utc::now();
        for (item_id, index) in ordering::dense_positions(item_ids) {
            if let Some(item) = self.items.get_mut(&item_id)
                && item.index != index
            {
                item.index = index;
                item.updated_at = now;
            }
        }
        self.touch_clip(id, now);
        self.require_clip(id)
    }

    fn update_clip_items_site_url(&mut self, item_ids: &[ClipItemId], site_url: Option<&str>) -> Result<Vec<ClipItem>> {
        let items = ordering::resolve_all(item_ids, "clip item", |id| Ok(self.items.get(&id).cloned()))?;
        let now = Utc::now();
        let mut updated = Vec::with_capacity(items.len());
        for item in items {
            if let Some(stored) = self.items.get_mut(&item.id) {
                stored.site_url = site_url.map(str::to_string);
                stored.updated_at = now;
                updated.push(stored.clone());
            }
        }
        Ok(updated)
    }

    fn update_album_adding_clips(&mut self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = self.require_album(id)?;
        let clips = self.resolve_clips(clip_ids)?;
        if let Some(existing) = clips.iter().find(|c| album.contains(c.id)) {
            return Err(StorageError::Duplicated(format!(
                "clip {} already in album {}",
                existing.id, id
            )));
        }
        let now = Utc::now();
        let start = ordering::next_index(album.items.iter().map(|i| i.index));
        for (offset, clip) in clips.iter().enumerate() {
            self.insert_album_item(id, clip.id, start + offset as i64, now);
        }
        self.touch_album(id, now);
        self.require_album(id)
    }

    fn update_album_deleting_clips(&mut self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = self.require_album(id)?;
        if let Some(missing) = clip_ids.iter().find(|cid| !album.contains(**cid)) {
            return Err(StorageError::NotFound(format!("clip {} in album {}", missing, id)));
        }
        let now = Utc::now();
        for item in album.items.iter().filter(|i| clip_ids.contains(&i.clip_id)) {
            self.remove_album_item(item.id);
        }
        self.renumber_album_items(id, now);
        self.touch_album(id, now);
        self.require_album(id)
    }

    fn update_album_reordering_clips(&mut self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        let album = self.require_album(id)?;
        ordering::require_same_members(clip_ids, &album.clip_ids(), "album clip")?;
        let now = Utc::now();
        for (clip_id, index) in ordering::dense_positions(clip_ids) {
            if let Some(item) = album.items.iter().find(|i| i.clip_id == clip_id)
                && item.index != index
            {
                self.set_album_item_index(item.id, index, now);
            }
        }
        self.touch_album(id, now);
        self.require_album(id)
    }

    fn update_album_title(&mut self, id: AlbumId, title: &str) -> Result<Album> {
        self.require_album(id)?;
        if self.albums.values().any(|a| a.id != id && a.title == title) {
            return Err(StorageError::Duplicated(format!("album titled {:?}", title)));
        }
        if let Some(album) = self.albums.get_mut(&id) {
            album.title = title.to_string();
            album.updated_at = Utc::now();
        }
        self.require_album(id)
    }

    fn update_album_hiding(&mut self, id: AlbumId, is_hidden: bool) -> Result<Album> {
        self.require_album(id)?;
        if let Some(album) = self.albums.get_mut(&id) {
            album.is_hidden = is_hidden;
            album.updated_at = Utc::now();
        }
        self.require_album(id)
    }

    fn update_albums_reordering(&mut self, ids: &[AlbumId]) -> Result<Vec<Album>> {
        let current: Vec<AlbumId> = self.albums.keys().copied().collect();
        ordering::require_same_members(ids, &current, "album")?;
        let now = Utc::now();
        for (id, index) in ordering::dense_positions(ids) {
            if let Some(album) = self.albums.get_mut(&id)
                && album.index != index
            {
                album.index = index;
                album.updated_at = now;
            }
        }
        Ok(self.all_albums())
    }

    fn update_tag_name(&mut self, id: TagId, name: &str) -> Result<Tag> {
        self.require_tag(id)?;
        if self.tag_ids_named(name).iter().any(|other| *other != id) {
            return Err(StorageError::Duplicated(format!("tag named {:?}", name)));
        }
        if let Some(tag) = self.tags.get_mut(&id) {
            tag.name = name.to_string();
        }
        self.require_tag(id)
    }

    fn update_tag_hiding(&mut self, id: TagId, is_hidden: bool) -> Result<Tag> {
        self.require_tag(id)?;
        if let Some(tag) = self.tags.get_mut(&id) {
            tag.is_hidden = is_hidden;
        }
        self.require_tag(id)
    }

    fn delete_clips(&mut self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        let clips = self.resolve_clips(ids)?;
        let mut affected: Vec<AlbumId> = Vec::new();
        for clip in &clips {
            for album_id in self.remove_clip(clip.id) {
                if !affected.contains(&album_id) {
                    affected.push(album_id);
                }
            }
        }
        let now = Utc::now();
        for album_id in affected {
            self.renumber_album_items(album_id, now);
        }
        Ok(clips)
    }

    fn delete_clip_item(&mut self, id: ClipItemId) -> Result<ClipItem> {
        let item = self
            .remove_item(id)
            .ok_or_else(|| StorageError::NotFound(format!("clip item {}", id)))?;
        let now = Utc::now();
        self.renumber_clip_items(item.clip_id, now);
        self.refresh_images_size(item.clip_id);
        self.touch_clip(item.clip_id, now);
        Ok(item)
    }

    fn delete_album(&mut self, id: AlbumId) -> Result<Album> {
        let album = self.require_album(id)?;
        for item in &album.items {
            self.remove_album_item(item.id);
        }
        self.albums.remove(&id);
        self.renumber_albums(Utc::now());
        Ok(album)
    }

    fn delete_tags(&mut self, ids: &[TagId]) -> Result<Vec<Tag>> {
        let tags = self.resolve_tags(ids)?;
        for tag in &tags {
            let clip_ids: Vec<ClipId> = self
                .index
                .clips_by_tag
                .get(&tag.id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for clip_id in clip_ids {
                self.unlink_tag(clip_id, tag.id);
            }
            self.tags.remove(&tag.id);
        }
        Ok(tags)
    }

    fn purge_clip_items(&mut self, id: ClipId) -> Result<ClipPurge> {
        let original = self.require_clip(id)?;
        if original.items.is_empty() {
            return Err(StorageError::InvalidParameter(format!("clip {} has no items", id)));
        }
        let now = Utc::now();
        let mut created_ids = Vec::with_capacity(original.items.len());
        for item in &original.items {
            let new_id = ClipId::new();
            self.clips.insert(
                new_id,
                ClipObject {
                    id: new_id,
                    description: original.description.clone(),
                    tag_ids: BTreeSet::new(),
                    is_hidden: original.is_hidden,
                    images_size: item.image_data_size,
                    created_at: original.created_at,
                    updated_at: now,
                },
            );
            self.move_item(item.id, new_id, 1, now);
            for tag in &original.tags {
                self.link_tag(new_id, tag.id);
            }
            created_ids.push(new_id);
        }
        for album_id in self.album_ids_containing(id) {
            let album = self.require_album(album_id)?;
            if let Some(order) = ordering::splice_members(&album.clip_ids(), &[id], &created_ids) {
                self.rewrite_album_members(album_id, &order, now);
            }
        }
        self.remove_clip(id);
        let created = created_ids
            .iter()
            .map(|cid| self.require_clip(*cid))
            .collect::<Result<Vec<_>>>()?;
        Ok(ClipPurge { original, created })
    }

    fn merge_clip_items(&mut self, item_ids: &[ClipItemId], tag_ids: &[TagId], clip_ids: &[ClipId]) -> Result<ClipMerge> {
        if clip_ids.is_empty() {
            return Err(StorageError::InvalidParameter("no clips to merge".into()));
        }
        let sources = self.resolve_clips(clip_ids)?;
        let tags = self.resolve_tags(tag_ids)?;
        let all_items: Vec<ClipItemId> = sources.iter().flat_map(|c| c.item_ids()).collect();
        ordering::require_same_members(item_ids, &all_items, "merged item")?;
        // Merged blobs share one directory.
        ordering::require_distinct(
            sources
                .iter()
                .flat_map(|c| c.items.iter().map(|i| i.image_file_name.as_str())),
            "merged image file name",
        )?;

        let now = Utc::now();
        let merged_id = ClipId::new();
        let source_ids: Vec<ClipId> = sources.iter().map(|c| c.id).collect();
        self.clips.insert(
            merged_id,
            ClipObject {
                id: merged_id,
                description: None,
                tag_ids: BTreeSet::new(),
                is_hidden: false,
                images_size: 0,
                created_at: now,
                updated_at: now,
            },
        );
        for (item_id, index) in ordering::dense_positions(item_ids) {
            self.move_item(item_id, merged_id, index, now);
        }
        self.refresh_images_size(merged_id);
        for tag in &tags {
            self.link_tag(merged_id, tag.id);
        }

        let mut albums: Vec<AlbumId> = Vec::new();
        for source in &source_ids {
            for album_id in self.album_ids_containing(*source) {
                if !albums.contains(&album_id) {
                    albums.push(album_id);
                }
            }
        }
        for album_id in albums {
            let album = self.require_album(album_id)?;
            if let Some(order) = ordering::splice_members(&album.clip_ids(), &source_ids, &[merged_id]) {
                self.rewrite_album_members(album_id, &order, now);
            }
        }
        for source in &source_ids {
            self.remove_clip(*source);
        }
        Ok(ClipMerge {
            merged: self.require_clip(merged_id)?,
            removed: sources,
        })
    }

    fn deduplicate_tag(&mut self, id: TagId) -> Result<Vec<TagId>> {
        let winner = self.require_tag(id)?;
        let losers: Vec<TagId> = self
            .tag_ids_named(&winner.name)
            .into_iter()
            .filter(|other| *other != id)
            .collect();
        for loser in &losers {
            let clip_ids: Vec<ClipId> = self
                .index
                .clips_by_tag
                .get(loser)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for clip_id in clip_ids {
                self.unlink_tag(clip_id, *loser);
                self.link_tag(clip_id, id);
            }
            self.tags.remove(loser);
        }
        if !losers.is_empty() {
            debug!(tag = %id, removed = losers.len(), "collapsed duplicated tags");
        }
        Ok(losers)
    }

    fn import_tags(&mut self, tags: &[Tag]) {
        for tag in tags {
            self.tags.insert(tag.id, tag.clone());
        }
    }
}

struct State {
    committed: Arena,
    working: Option<Arena>,
}

/// Embedded object database. Writes require an explicit transaction.
pub struct ObjectStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
}

impl ObjectStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State {
                committed: Arena::default(),
                working: None,
            }),
        }
    }

    /// Loads the document at `path`, or starts empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = match fs::read(&path) {
            Ok(bytes) => {
                let file: ObjectFile = serde_json::from_slice(&bytes)?;
                if file.version > FORMAT_VERSION {
                    return Err(StorageError::Internal(format!(
                        "object store {} has unsupported version {}",
                        path.display(),
                        file.version
                    )));
                }
                Arena::from_file(file)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Arena::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), clips = committed.clips.len(), "opened object store");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(State {
                committed,
                working: None,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn persist(&self, arena: &Arena) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&arena.to_file())?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Arena) -> T) -> T {
        f(&self.state.lock().committed)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Arena) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        let working = state
            .working
            .as_mut()
            .ok_or_else(|| StorageError::Internal("object store write outside a transaction".into()))?;
        f(working)
    }

    /// Stores tags as given, without the name uniqueness check.
    pub fn import_tags(&self, tags: &[Tag]) -> Result<()> {
        self.write(|arena| {
            arena.import_tags(tags);
            Ok(())
        })
    }
}

impl Transactional for ObjectStore {
    fn is_in_transaction(&self) -> bool {
        self.state.lock().working.is_some()
    }

    fn begin_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.working.is_some() {
            return Err(StorageError::Internal("object store transaction already open".into()));
        }
        state.working = Some(state.committed.clone());
        Ok(())
    }

    fn commit_transaction(&self) -> Result<()> {
        let mut state = self.state.lock();
        let Some(working) = state.working.take() else {
            return Err(StorageError::Internal("no object store transaction to commit".into()));
        };
        if let Err(e) = self.persist(&working) {
            state.working = Some(working);
            return Err(e);
        }
        state.committed = working;
        Ok(())
    }

    fn cancel_transaction_if_needed(&self) -> Result<()> {
        self.state.lock().working = None;
        Ok(())
    }
}

impl ClipReader for ObjectStore {
    fn read_clip(&self, id: ClipId) -> Result<Option<Clip>> {
        Ok(self.read(|a| a.clip(id)))
    }

    fn read_all_clips(&self) -> Result<Vec<Clip>> {
        Ok(self.read(Arena::all_clips))
    }

    fn read_clip_item(&self, id: ClipItemId) -> Result<Option<ClipItem>> {
        Ok(self.read(|a| a.items.get(&id).cloned()))
    }

    fn read_tag(&self, id: TagId) -> Result<Option<Tag>> {
        Ok(self.read(|a| a.tags.get(&id).cloned()))
    }

    fn read_all_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.read(Arena::all_tags))
    }

    fn read_album(&self, id: AlbumId) -> Result<Option<Album>> {
        Ok(self.read(|a| a.album(id)))
    }

    fn read_all_albums(&self) -> Result<Vec<Album>> {
        Ok(self.read(Arena::all_albums))
    }
}

impl ClipStorage for ObjectStore {
    fn create_clip(&self, recipe: &ClipRecipe, overwrite: bool) -> Result<ClipCreation> {
        self.write(|a| a.create_clip(recipe, overwrite))
    }

    fn create_tag(&self, recipe: &TagRecipe) -> Result<Tag> {
        self.write(|a| a.create_tag(recipe))
    }

    fn create_album(&self, recipe: &AlbumRecipe) -> Result<Album> {
        self.write(|a| a.create_album(recipe))
    }

    fn update_clips_hiding(&self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>> {
        self.write(|a| a.update_clips_hiding(ids, is_hidden))
    }

    fn update_clips_adding_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|a| a.update_clips_adding_tags(ids, tag_ids))
    }

    fn update_clips_deleting_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|a| a.update_clips_deleting_tags(ids, tag_ids))
    }

    fn update_clips_replacing_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>> {
        self.write(|a| a.update_clips_replacing_tags(ids, tag_ids))
    }

    fn update_clip_reordering_items(&self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip> {
        self.write(|a| a.update_clip_reordering_items(id, item_ids))
    }

    fn update_clip_items_site_url(&self, item_ids: &[ClipItemId], site_url: Option<&str>) -> Result<Vec<ClipItem>> {
        self.write(|a| a.update_clip_items_site_url(item_ids, site_url))
    }

    fn update_album_adding_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|a| a.update_album_adding_clips(id, clip_ids))
    }

    fn update_album_deleting_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|a| a.update_album_deleting_clips(id, clip_ids))
    }

    fn update_album_reordering_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album> {
        self.write(|a| a.update_album_reordering_clips(id, clip_ids))
    }

    fn update_album_title(&self, id: AlbumId, title: &str) -> Result<Album> {
        self.write(|a| a.update_album_title(id, title))
    }

    fn update_album_hiding(&self, id: AlbumId, is_hidden: bool) -> Result<Album> {
        self.write(|a| a.update_album_hiding(id, is_hidden))
    }

    fn update_albums_reordering(&self, ids: &[AlbumId]) -> Result<Vec<Album>> {
        self.write(|a| a.update_albums_reordering(ids))
    }

    fn update_tag_name(&self, id: TagId, name: &str) -> Result<Tag> {
        self.write(|a| a.update_tag_name(id, name))
    }

    fn update_tag_hiding(&self, id: TagId, is_hidden: bool) -> Result<Tag> {
        self.write(|a| a.update_tag_hiding(id, is_hidden))
    }

    fn delete_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>> {
        self.write(|a| a.delete_clips(ids))
    }

    fn delete_clip_item(&self, id: ClipItemId) -> Result<ClipItem> {
        self.write(|a| a.delete_clip_item(id))
    }

    fn delete_album(&self, id: AlbumId) -> Result<Album> {
        self.write(|a| a.delete_album(id))
    }

    fn delete_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>> {
        self.write(|a| a.delete_tags(ids))
    }

    fn purge_clip_items(&self, id: ClipId) -> Result<ClipPurge> {
        self.write(|a| a.purge_clip_items(id))
    }

    fn merge_clip_items(&self, item_ids: &[ClipItemId], tag_ids: &[TagId], clip_ids: &[ClipId]) -> Result<ClipMerge> {
        self.write(|a| a.merge_clip_items(item_ids, tag_ids, clip_ids))
    }

    fn deduplicate_tag(&self, id: TagId) -> Result<Vec<TagId>> {
        self.write(|a| a.deduplicate_tag(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn recipe(names: &[&str]) -> ClipRecipe {
        ClipRecipe::new(
            names
                .iter()
                .enumerate()
                .map(|(i, name)| ClipItemRecipe::new(*name, i as i64 + 1, 5))
                .collect(),
        )
    }

    #[test]
    fn test_write_outside_transaction_fails() {
        let store = ObjectStore::in_memory();
        let result = store.create_tag(&TagRecipe::named("x"));
        assert!(matches!(result, Err(StorageError::Internal(_))));
    }

    #[test]
    fn test_nested_begin_fails() {
        let store = ObjectStore::in_memory();
        store.begin_transaction().unwrap();
        assert!(matches!(store.begin_transaction(), Err(StorageError::Internal(_))));
    }

    #[test]
    fn test_reads_see_committed_state_only() {
        let store = ObjectStore::in_memory();
        store.begin_transaction().unwrap();
        let tag = store.create_tag(&TagRecipe::named("pending")).unwrap();
        assert!(store.read_tag(tag.id).unwrap().is_none());
        store.commit_transaction().unwrap();
        assert_eq!(store.read_tag(tag.id).unwrap(), Some(tag));
    }

    #[test]
    fn test_cancel_discards_working_copy() {
        let store = ObjectStore::in_memory();
        store.begin_transaction().unwrap();
        store.create_clip(&recipe(&["a"]), false).unwrap();
        store.cancel_transaction_if_needed().unwrap();
        assert!(!store.is_in_transaction());
        assert!(store.read_all_clips().unwrap().is_empty());
        assert!(store.cancel_transaction_if_needed().is_ok());
    }

    #[test]
    fn test_commit_persists_and_reopen_restores() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("temporaries/objects.json");
        let store = ObjectStore::open(&path).unwrap();
        store.begin_transaction().unwrap();
        let tag = store.create_tag(&TagRecipe::named("kept")).unwrap();
        let mut r = recipe(&["a", "b"]);
        r.tag_ids = vec![tag.id];
        let clip = store.create_clip(&r, false).unwrap().clip;
        let album = store.create_album(&AlbumRecipe::titled("trip")).unwrap();
        store.update_album_adding_clips(album.id, &[clip.id]).unwrap();
        store.commit_transaction().unwrap();

        let reopened = ObjectStore::open(&path).unwrap();
        assert_eq!(reopened.read_clip(clip.id).unwrap(), store.read_clip(clip.id).unwrap());
        assert_eq!(reopened.read_album(album.id).unwrap().unwrap().clip_ids(), vec![clip.id]);
    }

    #[test]
    fn test_open_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = ObjectStore::open(dir.path().join("none.json")).unwrap();
        assert!(store.read_all_tags().unwrap().is_empty());
    }

    #[test]
    fn test_load_drops_dangling_tag_links() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("objects.json");
        let now = Utc::now();
        let clip_id = ClipId::new();
        let file = ObjectFile {
            version: FORMAT_VERSION,
            clips: vec![ClipObject {
                id: clip_id,
                description: None,
                tag_ids: [TagId::new()].into_iter().collect(),
                is_hidden: false,
                images_size: 0,
                created_at: now,
                updated_at: now,
            }],
            ..ObjectFile::default()
        };
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        let store = ObjectStore::open(&path).unwrap();
        assert!(store.read_clip(clip_id).unwrap().unwrap().tags.is_empty());
    }

    #[test]
    fn test_reverse_index_follows_moves() {
        let store = ObjectStore::in_memory();
        store.begin_transaction().unwrap();
        let clip = store.create_clip(&recipe(&["a", "b"]), false).unwrap().clip;
        let purge = store.purge_clip_items(clip.id).unwrap();
        store.commit_transaction().unwrap();
        assert_eq!(purge.created.len(), 2);
        for created in &purge.created {
            let stored = store.read_clip(created.id).unwrap().unwrap();
            assert_eq!(stored.items.len(), 1);
            assert_eq!(stored.items[0].clip_id, created.id);
        }
        assert!(store.read_clip(clip.id).unwrap().is_none());
    }
}
