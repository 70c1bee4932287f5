pub mod container;
pub mod history;
pub mod images;
pub mod models;
pub mod object_store;
pub mod ordering;
pub mod schema;
pub mod sqlite;

use crate::errors::Result;
use models::{
    Album, AlbumId, AlbumRecipe, Clip, ClipCreation, ClipId, ClipItem, ClipItemId, ClipMerge,
    ClipPurge, ClipRecipe, Tag, TagId, TagRecipe,
};

/// Explicit transaction scope shared by both backends.
pub trait Transactional {
    fn is_in_transaction(&self) -> bool;
    fn begin_transaction(&self) -> Result<()>;
    fn commit_transaction(&self) -> Result<()>;
    fn cancel_transaction_if_needed(&self) -> Result<()>;
}

/// Read-only projections. Valid with or without an open transaction.
pub trait ClipReader: Send + Sync {
    fn read_clip(&self, id: ClipId) -> Result<Option<Clip>>;
    fn read_all_clips(&self) -> Result<Vec<Clip>>;
    fn read_clip_item(&self, id: ClipItemId) -> Result<Option<ClipItem>>;
    fn read_tag(&self, id: TagId) -> Result<Option<Tag>>;
    fn read_all_tags(&self) -> Result<Vec<Tag>>;
    fn read_album(&self, id: AlbumId) -> Result<Option<Album>>;
    fn read_all_albums(&self) -> Result<Vec<Album>>;
}

/// Transactional CRUD contract implemented by the relational store and the object store.
///
/// Bulk operations resolve every identity before mutating anything, so a single
/// missing id fails the whole call with no partial writes.
pub trait ClipStorage: Transactional + ClipReader {
    /// Inserts a clip. An existing clip with the same id fails with `Duplicated`
    /// unless `overwrite` is set, in which case its items are replaced while its
    /// id, creation date and tag links are kept.
    fn create_clip(&self, recipe: &ClipRecipe, overwrite: bool) -> Result<ClipCreation>;
    fn create_tag(&self, recipe: &TagRecipe) -> Result<Tag>;
    fn create_album(&self, recipe: &AlbumRecipe) -> Result<Album>;

    fn update_clips_hiding(&self, ids: &[ClipId], is_hidden: bool) -> Result<Vec<Clip>>;
    fn update_clips_adding_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>>;
    fn update_clips_deleting_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>>;
    fn update_clips_replacing_tags(&self, ids: &[ClipId], tag_ids: &[TagId]) -> Result<Vec<Clip>>;
    fn update_clip_reordering_items(&self, id: ClipId, item_ids: &[ClipItemId]) -> Result<Clip>;
    fn update_clip_items_site_url(
        &self,
        item_ids: &[ClipItemId],
        site_url: Option<&str>,
    ) -> Result<Vec<ClipItem>>;

    fn update_album_adding_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album>;
    fn update_album_deleting_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album>;
    fn update_album_reordering_clips(&self, id: AlbumId, clip_ids: &[ClipId]) -> Result<Album>;
    fn update_album_title(&self, id: AlbumId, title: &str) -> Result<Album>;
    fn update_album_hiding(&self, id: AlbumId, is_hidden: bool) -> Result<Album>;
    fn update_albums_reordering(&self, ids: &[AlbumId]) -> Result<Vec<Album>>;

    fn update_tag_name(&self, id: TagId, name: &str) -> Result<Tag>;
    fn update_tag_hiding(&self, id: TagId, is_hidden: bool) -> Result<Tag>;

    fn delete_clips(&self, ids: &[ClipId]) -> Result<Vec<Clip>>;
    fn delete_clip_item(&self, id: ClipItemId) -> Result<ClipItem>;
    fn delete_album(&self, id: AlbumId) -> Result<Album>;
    fn delete_tags(&self, ids: &[TagId]) -> Result<Vec<Tag>>;

    /// Splits a clip into one new clip per item.
    fn purge_clip_items(&self, id: ClipId) -> Result<ClipPurge>;
    /// Merges `clip_ids` into a new clip holding `item_ids` in the given order.
    fn merge_clip_items(
        &self,
        item_ids: &[ClipItemId],
        tag_ids: &[TagId],
        clip_ids: &[ClipId],
    ) -> Result<ClipMerge>;
    /// Collapses every other tag named like `id` into it. Returns the removed ids.
    fn deduplicate_tag(&self, id: TagId) -> Result<Vec<TagId>>;
}
