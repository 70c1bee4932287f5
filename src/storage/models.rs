use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_id!(ClipId);
define_id!(ClipItemId);
define_id!(TagId);
define_id!(AlbumId);
define_id!(AlbumItemId);
define_id!(
    /// Identity of the image a clip item displays; independent of the file name.
    ImageId
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub name: String,
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipItem {
    pub id: ClipItemId,
    pub clip_id: ClipId,
    pub site_url: Option<String>,
    pub image_id: ImageId,
    pub image_file_name: String,
    pub image_url: Option<String>,
    pub image_size: ImageSize,
    pub image_data_size: i64,
    pub index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clip {
    pub id: ClipId,
    pub description: Option<String>,
    pub items: Vec<ClipItem>,
    pub tags: Vec<Tag>,
    pub is_hidden: bool,
    pub images_size: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Clip {
    pub fn tag_ids(&self) -> Vec<TagId> {
        self.tags.iter().map(|t| t.id).collect()
    }

    pub fn item_ids(&self) -> Vec<ClipItemId> {
        self.items.iter().map(|i| i.id).collect()
    }

    pub fn has_hidden_tag(&self) -> bool {
        self.tags.iter().any(|t| t.is_hidden)
    }

    /// First item by index, used as the clip's cover.
    pub fn primary_item(&self) -> Option<&ClipItem> {
        self.items.iter().min_by_key(|i| i.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumItem {
    pub id: AlbumItemId,
    pub album_id: AlbumId,
    pub clip_id: ClipId,
    pub index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Album {
    pub id: AlbumId,
    pub title: String,
    pub is_hidden: bool,
    pub index: i64,
    pub items: Vec<AlbumItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Album {
    /// Member clip ids in album order.
    pub fn clip_ids(&self) -> Vec<ClipId> {
        let mut items: Vec<&AlbumItem> = self.items.iter().collect();
        items.sort_by_key(|i| i.index);
        items.iter().map(|i| i.clip_id).collect()
    }

    pub fn contains(&self, clip_id: ClipId) -> bool {
        self.items.iter().any(|i| i.clip_id == clip_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipItemRecipe {
    pub id: ClipItemId,
    pub site_url: Option<String>,
    pub image_id: ImageId,
    pub image_file_name: String,
    pub image_url: Option<String>,
    pub image_size: ImageSize,
    pub image_data_size: i64,
    pub index: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClipItemRecipe {
    pub fn new(image_file_name: impl Into<String>, index: i64, image_data_size: i64) -> Self {
        let now = Utc::now();
        Self {
            id: ClipItemId::new(),
            site_url: None,
            image_id: ImageId::new(),
            image_file_name: image_file_name.into(),
            image_url: None,
            image_size: ImageSize::default(),
            image_data_size,
            index,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_item(item: &ClipItem) -> Self {
        Self {
            id: item.id,
            site_url: item.site_url.clone(),
            image_id: item.image_id,
            image_file_name: item.image_file_name.clone(),
            image_url: item.image_url.clone(),
            image_size: item.image_size,
            image_data_size: item.image_data_size,
            index: item.index,
            created_at: item.created_at,
            updated_at: item.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRecipe {
    pub id: ClipId,
    pub description: Option<String>,
    pub items: Vec<ClipItemRecipe>,
    pub tag_ids: Vec<TagId>,
    pub is_hidden: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClipRecipe {
    pub fn new(items: Vec<ClipItemRecipe>) -> Self {
        let now = Utc::now();
        Self {
            id: ClipId::new(),
            description: None,
            items,
            tag_ids: Vec::new(),
            is_hidden: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn from_clip(clip: &Clip) -> Self {
        Self {
            id: clip.id,
            description: clip.description.clone(),
            items: clip.items.iter().map(ClipItemRecipe::from_item).collect(),
            tag_ids: clip.tag_ids(),
            is_hidden: clip.is_hidden,
            created_at: clip.created_at,
            updated_at: clip.updated_at,
        }
    }

    pub fn images_size(&self) -> i64 {
        self.items.iter().map(|i| i.image_data_size).sum()
    }

    /// Items sorted by their declared index and renumbered 1..N.
    pub fn normalized_items(&self) -> Vec<ClipItemRecipe> {
        let mut items = self.items.clone();
        items.sort_by_key(|i| i.index);
        for (offset, item) in items.iter_mut().enumerate() {
            item.index = offset as i64 + 1;
        }
        items
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecipe {
    pub id: TagId,
    pub name: String,
    pub is_hidden: bool,
}

impl TagRecipe {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            id: TagId::new(),
            name: name.into(),
            is_hidden: false,
        }
    }
}

impl From<&Tag> for TagRecipe {
    fn from(tag: &Tag) -> Self {
        Self {
            id: tag.id,
            name: tag.name.clone(),
            is_hidden: tag.is_hidden,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlbumRecipe {
    pub id: AlbumId,
    pub title: String,
    pub is_hidden: bool,
}

impl AlbumRecipe {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            id: AlbumId::new(),
            title: title.into(),
            is_hidden: false,
        }
    }
}

/// Raw image bytes paired with the file name they are stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageData {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
        }
    }
}

/// Outcome of `create_clip`: the stored clip and, on overwrite, the clip it replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipCreation {
    pub clip: Clip,
    pub replaced: Option<Clip>,
}

/// Outcome of splitting a clip into one clip per item.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipPurge {
    pub original: Clip,
    pub created: Vec<Clip>,
}

/// Outcome of merging several clips into one.
#[derive(Debug, Clone, PartialEq)]
pub struct ClipMerge {
    pub merged: Clip,
    pub removed: Vec<Clip>,
}
