use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{Result, StorageError};
use crate::observers::ObserverRegistry;
use crate::storage::container::{ContextObserver, PersistentContainer};
use crate::storage::models::{Album, AlbumId, Clip, ClipId, ClipItem, ClipItemId, Tag, TagId};
use crate::storage::sqlite::SqliteStorage;
use crate::storage::ClipReader;
use super::ChangeObserver;
use super::search::{self, NameMatcher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ClipSortKey {
    #[default]
    CreatedDate,
    UpdatedDate,
    Size,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Keyword search over clip site URLs with optional tag and album filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClipSearchQuery {
    pub text: String,
    /// Clips must carry every one of these tags.
    pub tag_ids: Vec<TagId>,
    pub album_id: Option<AlbumId>,
    pub sort_key: ClipSortKey,
    pub sort_order: SortOrder,
}

impl ClipSearchQuery {
    pub fn keywords(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn matches(&self, clip: &Clip, tokens: &[String], album: Option<&Album>) -> bool {
        let urls: Vec<String> = clip
            .items
            .iter()
            .filter_map(|i| i.site_url.as_deref())
            .map(search::fold)
            .collect();
        let text_ok = tokens
            .iter()
            .all(|token| urls.iter().any(|url| url.contains(token.as_str())));
        let tags_ok = self
            .tag_ids
            .iter()
            .all(|id| clip.tags.iter().any(|t| t.id == *id));
        let album_ok = album.is_none_or(|a| a.contains(clip.id));
        text_ok && tags_ok && album_ok
    }

    fn sort(&self, clips: &mut [Clip]) {
        clips.sort_by(|a, b| {
            let ordering = match self.sort_key {
                ClipSortKey::CreatedDate => a.created_at.cmp(&b.created_at),
                ClipSortKey::UpdatedDate => a.updated_at.cmp(&b.updated_at),
                ClipSortKey::Size => a.images_size.cmp(&b.images_size),
            };
            match self.sort_order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }
}

fn clip_visible(clip: &Clip, show_hidden: bool) -> bool {
    show_hidden || (!clip.is_hidden && !clip.has_hidden_tag())
}

/// What a query reads from: the current context and the hidden-items setting.
struct QueryScope<S: ?Sized> {
    context: RwLock<Arc<S>>,
    show_hidden_items: AtomicBool,
}

impl<S: ClipReader + ?Sized> QueryScope<S> {
    fn storage(&self) -> Arc<S> {
        self.context.read().clone()
    }

    fn show_hidden(&self) -> bool {
        self.show_hidden_items.load(Ordering::SeqCst)
    }

    fn visible_clips(&self, clips: Vec<Clip>) -> Vec<Clip> {
        let show = self.show_hidden();
        clips.into_iter().filter(|c| clip_visible(c, show)).collect()
    }

    fn read_clip(&self, id: ClipId) -> Result<Clip> {
        self.storage()
            .read_clip(id)?
            .ok_or_else(|| StorageError::NotFound(format!("clip {}", id)))
    }

    fn read_clip_optional(&self, id: ClipId) -> Result<Option<Clip>> {
        self.storage().read_clip(id)
    }

    fn read_album(&self, id: AlbumId) -> Result<Album> {
        self.storage()
            .read_album(id)?
            .ok_or_else(|| StorageError::NotFound(format!("album {}", id)))
    }

    fn all_clips(&self) -> Result<Vec<Clip>> {
        Ok(self.visible_clips(self.storage().read_all_clips()?))
    }

    fn uncategorized_clips(&self) -> Result<Vec<Clip>> {
        Ok(self
            .all_clips()?
            .into_iter()
            .filter(|c| c.tags.is_empty())
            .collect())
    }

    fn clips_tagged(&self, tag_id: TagId) -> Result<Vec<Clip>> {
        let storage = self.storage();
        if storage.read_tag(tag_id)?.is_none() {
            return Err(StorageError::NotFound(format!("tag {}", tag_id)));
        }
        Ok(self.visible_clips(
            storage
                .read_all_clips()?
                .into_iter()
                .filter(|c| c.tags.iter().any(|t| t.id == tag_id))
                .collect(),
        ))
    }

    fn album_clips(&self, album_id: AlbumId) -> Result<Vec<Clip>> {
        let storage = self.storage();
        let album = self.read_album(album_id)?;
        let mut clips = Vec::with_capacity(album.items.len());
        for clip_id in album.clip_ids() {
            match storage.read_clip(clip_id)? {
                Some(clip) => clips.push(clip),
                None => warn!(album = %album_id, clip = %clip_id, "album refers to a missing clip"),
            }
        }
        Ok(self.visible_clips(clips))
    }

    fn all_tags(&self) -> Result<Vec<Tag>> {
        let show = self.show_hidden();
        Ok(self
            .storage()
            .read_all_tags()?
            .into_iter()
            .filter(|t| show || !t.is_hidden)
            .collect())
    }

    fn all_albums(&self) -> Result<Vec<Album>> {
        let show = self.show_hidden();
        Ok(self
            .storage()
            .read_all_albums()?
            .into_iter()
            .filter(|a| show || !a.is_hidden)
            .collect())
    }

    fn search_clips(&self, query: &ClipSearchQuery) -> Result<Vec<Clip>> {
        let tokens = search::tokens(&query.text);
        let album = match query.album_id {
            Some(id) => Some(self.read_album(id)?),
            None => None,
        };
        let mut clips: Vec<Clip> = self
            .all_clips()?
            .into_iter()
            .filter(|c| query.matches(c, &tokens, album.as_ref()))
            .collect();
        query.sort(&mut clips);
        Ok(clips)
    }

    fn search_tags(&self, text: &str) -> Result<Vec<Tag>> {
        let matcher = NameMatcher::new(text);
        Ok(self
            .all_tags()?
            .into_iter()
            .filter(|t| matcher.matches(&t.name))
            .collect())
    }

    fn search_albums(&self, text: &str) -> Result<Vec<Album>> {
        let matcher = NameMatcher::new(text);
        Ok(self
            .all_albums()?
            .into_iter()
            .filter(|a| matcher.matches(&a.title))
            .collect())
    }
}

/// Re-fetch hook the service calls on every registered live query.
pub trait QueryRefresh: Send + Sync {
    fn refresh(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Fetch<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;
type Subscriber<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A query result that refreshes itself.
///
/// It re-fetches when the service's context is replaced, when a command
/// commits, or when the hidden-items setting changes, and then hands the new
/// value to every subscriber. After `invalidate` it stays empty and silent.
pub struct LiveQuery<T> {
    fetch: Fetch<T>,
    value: Mutex<Option<T>>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_subscription: AtomicU64,
    invalidated: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> LiveQuery<T> {
    fn start(fetch: Fetch<T>) -> Result<Arc<Self>> {
        let initial = fetch()?;
        Ok(Arc::new(Self {
            fetch,
            value: Mutex::new(Some(initial)),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
        }))
    }

    /// Latest value, `None` once invalidated.
    pub fn current(&self) -> Option<T> {
        self.value.lock().clone()
    }

    pub fn subscribe(&self, subscriber: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers.lock().push((id, Arc::new(subscriber)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|(other, _)| *other != id);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
        self.subscribers.lock().clear();
        *self.value.lock() = None;
    }
}

impl<T: Clone + Send + Sync + 'static> QueryRefresh for LiveQuery<T> {
    fn refresh(&self) {
        if self.is_invalidated() {
            return;
        }
        let value = match (self.fetch)() {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "live query refresh failed, keeping last value");
                return;
            }
        };
        *self.value.lock() = Some(value.clone());
        let subscribers: Vec<Subscriber<T>> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for subscriber in subscribers {
            subscriber(&value);
        }
    }
}

/// Read-only projections over one clip store.
pub struct ClipQueryService<S: ClipReader + ?Sized> {
    scope: Arc<QueryScope<S>>,
    live: ObserverRegistry<dyn QueryRefresh>,
}

impl<S: ClipReader + ?Sized + 'static> ClipQueryService<S> {
    pub fn new(context: Arc<S>, show_hidden_items: bool) -> Self {
        Self {
            scope: Arc::new(QueryScope {
                context: RwLock::new(context),
                show_hidden_items: AtomicBool::new(show_hidden_items),
            }),
            live: ObserverRegistry::new(),
        }
    }

    pub fn show_hidden_items(&self) -> bool {
        self.scope.show_hidden()
    }

    pub fn set_show_hidden_items(&self, show: bool) {
        if self.scope.show_hidden_items.swap(show, Ordering::SeqCst) != show {
            self.refresh_live_queries();
        }
    }

    /// Binds the service to a new context and refreshes every live query.
    pub fn replace_context(&self, context: Arc<S>) {
        *self.scope.context.write() = context;
        self.refresh_live_queries();
    }

    fn refresh_live_queries(&self) {
        let queries = self.live.live();
        debug!(count = queries.len(), "refreshing live queries");
        for query in queries {
            query.refresh();
        }
    }

    pub fn live_query_count(&self) -> usize {
        self.live.len()
    }

    fn make_live<T>(&self, f: impl Fn(&QueryScope<S>) -> Result<T> + Send + Sync + 'static) -> Result<Arc<LiveQuery<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        let scope: Weak<QueryScope<S>> = Arc::downgrade(&self.scope);
        let fetch: Fetch<T> = Box::new(move || {
            let scope = scope
                .upgrade()
                .ok_or_else(|| StorageError::Internal("query service is gone".into()))?;
            f(&scope)
        });
        let query = LiveQuery::start(fetch)?;
        let as_refresh: Arc<dyn QueryRefresh> = query.clone();
        self.live.register(&as_refresh);
        Ok(query)
    }

    // --- Point lookups ---

    pub fn read_clip(&self, id: ClipId) -> Result<Clip> {
        self.scope.read_clip(id)
    }

    /// Newest clip with an item whose site URL equals `url`.
    pub fn read_clip_by_url(&self, url: &str) -> Result<Option<Clip>> {
        Ok(self
            .scope
            .storage()
            .read_all_clips()?
            .into_iter()
            .find(|c| c.items.iter().any(|i| i.site_url.as_deref() == Some(url))))
    }

    pub fn read_clip_item(&self, id: ClipItemId) -> Result<ClipItem> {
        self.scope
            .storage()
            .read_clip_item(id)?
            .ok_or_else(|| StorageError::NotFound(format!("clip item {}", id)))
    }

    pub fn read_clip_items(&self, clip_id: ClipId) -> Result<Vec<ClipItem>> {
        Ok(self.scope.read_clip(clip_id)?.items)
    }

    pub fn read_albums_containing(&self, clip_id: ClipId) -> Result<Vec<Album>> {
        Ok(self
            .scope
            .all_albums()?
            .into_iter()
            .filter(|a| a.contains(clip_id))
            .collect())
    }

    // --- Lists ---

    pub fn clips(&self) -> Result<Vec<Clip>> {
        self.scope.all_clips()
    }

    pub fn uncategorized_clips(&self) -> Result<Vec<Clip>> {
        self.scope.uncategorized_clips()
    }

    pub fn clips_tagged(&self, tag_id: TagId) -> Result<Vec<Clip>> {
        self.scope.clips_tagged(tag_id)
    }

    pub fn album_clips(&self, album_id: AlbumId) -> Result<Vec<Clip>> {
        self.scope.album_clips(album_id)
    }

    pub fn tags(&self) -> Result<Vec<Tag>> {
        self.scope.all_tags()
    }

    pub fn albums(&self) -> Result<Vec<Album>> {
        self.scope.all_albums()
    }

    // --- Search ---

    pub fn search_clips(&self, query: &ClipSearchQuery) -> Result<Vec<Clip>> {
        self.scope.search_clips(query)
    }

    pub fn search_tags(&self, text: &str) -> Result<Vec<Tag>> {
        self.scope.search_tags(text)
    }

    pub fn search_albums(&self, text: &str) -> Result<Vec<Album>> {
        self.scope.search_albums(text)
    }

    // --- Live queries ---

    /// Fails with `NotFound` when the clip does not exist yet; afterwards the
    /// value turns `None` once the clip is deleted.
    pub fn query_clip(&self, id: ClipId) -> Result<Arc<LiveQuery<Option<Clip>>>> {
        self.scope.read_clip(id)?;
        self.make_live(move |scope| scope.read_clip_optional(id))
    }

    pub fn query_all_clips(&self) -> Result<Arc<LiveQuery<Vec<Clip>>>> {
        self.make_live(|scope| scope.all_clips())
    }

    pub fn query_uncategorized_clips(&self) -> Result<Arc<LiveQuery<Vec<Clip>>>> {
        self.make_live(|scope| scope.uncategorized_clips())
    }

    pub fn query_clips_tagged(&self, tag_id: TagId) -> Result<Arc<LiveQuery<Vec<Clip>>>> {
        self.make_live(move |scope| scope.clips_tagged(tag_id))
    }

    pub fn query_album_clips(&self, album_id: AlbumId) -> Result<Arc<LiveQuery<Vec<Clip>>>> {
        self.make_live(move |scope| scope.album_clips(album_id))
    }

    pub fn query_all_tags(&self) -> Result<Arc<LiveQuery<Vec<Tag>>>> {
        self.make_live(|scope| scope.all_tags())
    }

    pub fn query_all_albums(&self) -> Result<Arc<LiveQuery<Vec<Album>>>> {
        self.make_live(|scope| scope.all_albums())
    }

    pub fn query_search_clips(&self, query: ClipSearchQuery) -> Result<Arc<LiveQuery<Vec<Clip>>>> {
        self.make_live(move |scope| scope.search_clips(&query))
    }
}

impl<S: ClipReader + ?Sized + 'static> ChangeObserver for ClipQueryService<S> {
    fn records_did_change(&self) {
        self.refresh_live_queries();
    }
}

impl ContextObserver for ClipQueryService<SqliteStorage> {
    fn context_did_change(&self, container: &PersistentContainer) {
        self.replace_context(container.view_context());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::models::{AlbumRecipe, ClipItemRecipe, ClipRecipe, TagRecipe};
    use crate::storage::object_store::ObjectStore;
    use crate::storage::{ClipStorage, Transactional};
    use std::sync::atomic::AtomicUsize;

    fn seeded() -> (Arc<ObjectStore>, Clip, Clip, Tag) {
        let store = Arc::new(ObjectStore::in_memory());
        store.begin_transaction().unwrap();
        let tag = store.create_tag(&TagRecipe::named("ネコ")).unwrap();
        let mut item = ClipItemRecipe::new("a.png", 1, 100);
        item.site_url = Some("https://example.com/Café".into());
        let mut first = ClipRecipe::new(vec![item]);
        first.tag_ids = vec![tag.id];
        first.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
        let first = store.create_clip(&first, false).unwrap().clip;
        let mut item = ClipItemRecipe::new("b.png", 1, 5);
        item.site_url = Some("https://other.org/dog".into());
        let second = store.create_clip(&ClipRecipe::new(vec![item]), false).unwrap().clip;
        store.commit_transaction().unwrap();
        (store, first, second, tag)
    }

    #[test]
    fn test_search_clips_is_diacritic_insensitive() {
        let (store, first, _, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let found = service.search_clips(&ClipSearchQuery::keywords("EXAMPLE cafe")).unwrap();
        assert_eq!(found.iter().map(|c| c.id).collect::<Vec<_>>(), vec![first.id]);
    }

    #[test]
    fn test_search_clips_sorts_by_size() {
        let (store, first, second, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let query = ClipSearchQuery {
            sort_key: ClipSortKey::Size,
            sort_order: SortOrder::Ascending,
            ..ClipSearchQuery::default()
        };
        let ids: Vec<ClipId> = service.search_clips(&query).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_search_tags_matches_other_kana_script() {
        let (store, _, _, tag) = seeded();
        let service = ClipQueryService::new(store, false);
        assert_eq!(service.search_tags("ねこ").unwrap(), vec![tag]);
    }

    #[test]
    fn test_hidden_tag_hides_clip() {
        let (store, first, second, tag) = seeded();
        store.begin_transaction().unwrap();
        store.update_tag_hiding(tag.id, true).unwrap();
        store.commit_transaction().unwrap();
        let service = ClipQueryService::new(store, false);
        let ids: Vec<ClipId> = service.clips().unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id]);
        assert!(service.tags().unwrap().is_empty());
        service.set_show_hidden_items(true);
        assert_eq!(service.clips().unwrap().len(), 2);
        assert!(service.read_clip(first.id).is_ok());
    }

    #[test]
    fn test_uncategorized_and_tagged() {
        let (store, first, second, tag) = seeded();
        let service = ClipQueryService::new(store, false);
        assert_eq!(service.uncategorized_clips().unwrap()[0].id, second.id);
        assert_eq!(service.clips_tagged(tag.id).unwrap()[0].id, first.id);
        assert!(service.clips_tagged(TagId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_read_clip_by_url() {
        let (store, _, second, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let found = service.read_clip_by_url("https://other.org/dog").unwrap();
        assert_eq!(found.map(|c| c.id), Some(second.id));
        assert!(service.read_clip_by_url("https://nowhere").unwrap().is_none());
    }

    #[test]
    fn test_live_query_refreshes_on_context_replacement() {
        let (store, _, _, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let query = service.query_all_clips().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        query.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(query.current().unwrap().len(), 2);

        service.replace_context(Arc::new(ObjectStore::in_memory()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(query.current().unwrap().is_empty());
    }

    #[test]
    fn test_invalidated_query_stays_silent() {
        let (store, _, _, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let query = service.query_all_tags().unwrap();
        query.invalidate();
        service.replace_context(Arc::new(ObjectStore::in_memory()));
        assert!(query.current().is_none());
    }

    #[test]
    fn test_dropped_queries_are_pruned() {
        let (store, _, _, _) = seeded();
        let service = ClipQueryService::new(store, false);
        let kept = service.query_all_albums().unwrap();
        drop(service.query_all_tags().unwrap());
        assert_eq!(service.live_query_count(), 1);
        drop(kept);
    }

    #[test]
    fn test_album_clips_follow_album_order() {
        let (store, first, second, _) = seeded();
        store.begin_transaction().unwrap();
        let album = store.create_album(&AlbumRecipe::titled("mix")).unwrap();
        store.update_album_adding_clips(album.id, &[second.id, first.id]).unwrap();
        store.commit_transaction().unwrap();
        let service = ClipQueryService::new(store, false);
        let ids: Vec<ClipId> = service.album_clips(album.id).unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(service.read_albums_containing(first.id).unwrap().len(), 1);
    }
}
