//! Item identity and cache keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Anything that can be displayed through the image manager.
///
/// The manager never owns items beyond the lifetime of a pending request;
/// the identifier is only used as a map key and must be stable.
pub trait ImageItem: Send + Sync {
    /// Returns a stable identifier, unique among all items of a manager.
    fn unique_identifier(&self) -> &str;
}

/// Plain string identifier for an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Creates a new `ItemId` from any string-like input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl ImageItem for ItemId {
    fn unique_identifier(&self) -> &str {
        &self.0
    }
}

/// Identifies one cache bucket: an item rendered in one format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Identifier of the item.
    pub item_id: ItemId,
    /// Name of the image format.
    pub format: String,
}

impl CacheKey {
    /// Creates a key from an item identifier and a format name.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, format: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            format: format.into(),
        }
    }

    /// Builds the key for an item in the given format.
    #[must_use]
    pub fn for_item(item: &dyn ImageItem, format: &super::ImageFormat) -> Self {
        Self::new(item.unique_identifier(), format.name())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.item_id, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_is_its_own_identifier() {
        let id = ItemId::new("photo-42");
        assert_eq!(id.unique_identifier(), "photo-42");
    }

    #[test]
    fn test_cache_keys_differ_by_format() {
        let thumb = CacheKey::new("a", "thumb");
        let full = CacheKey::new("a", "full");
        assert_ne!(thumb, full);
        assert_eq!(thumb.to_string(), "a/thumb");
    }
}
