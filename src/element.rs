//! Cache element and key definitions
//!
//! Keys are scoped to a region. A key is either a plain name, which can be
//! used as a hierarchical prefix when it ends with [`NAME_COMPONENT_DELIMITER`],
//! or a group member addressed by `(group id, attribute name)`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A name key ending with this character removes every key it prefixes
pub const NAME_COMPONENT_DELIMITER: char = ':';

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Keys
// =============================================================================

/// Identifies a group of elements inside a region
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    pub region: String,
    pub name: String,
}

impl GroupId {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.region, self.name)
    }
}

/// One attribute of a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupAttrName {
    pub group: GroupId,
    pub attr: String,
}

/// Logical key of a cached element
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
    /// Plain opaque name
    Name(String),

    /// Attribute of a group
    Group(GroupAttrName),
}

impl CacheKey {
    pub fn name(name: impl Into<String>) -> Self {
        CacheKey::Name(name.into())
    }

    pub fn group(group: GroupId, attr: impl Into<String>) -> Self {
        CacheKey::Group(GroupAttrName {
            group,
            attr: attr.into(),
        })
    }

    /// True when removing this key means removing every key it prefixes
    pub fn is_prefix(&self) -> bool {
        matches!(self, CacheKey::Name(name) if name.ends_with(NAME_COMPONENT_DELIMITER))
    }

    /// True when `self` is a name key starting with the literal `prefix`
    pub fn has_prefix(&self, prefix: &str) -> bool {
        matches!(self, CacheKey::Name(name) if name.starts_with(prefix))
    }

    /// Group this key belongs to, if any
    pub fn group_id(&self) -> Option<&GroupId> {
        match self {
            CacheKey::Name(_) => None,
            CacheKey::Group(attr) => Some(&attr.group),
        }
    }

    /// True when `self` is matched by the removal target `pattern`
    ///
    /// A prefix pattern matches every name key it prefixes; any other pattern
    /// matches only itself.
    pub fn matched_by(&self, pattern: &CacheKey) -> bool {
        match pattern {
            CacheKey::Name(prefix) if pattern.is_prefix() => self.has_prefix(prefix),
            _ => self == pattern,
        }
    }
}

impl From<&str> for CacheKey {
    fn from(name: &str) -> Self {
        CacheKey::Name(name.to_string())
    }
}

impl From<String> for CacheKey {
    fn from(name: String) -> Self {
        CacheKey::Name(name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Name(name) => write!(f, "{}", name),
            CacheKey::Group(attr) => write!(f, "{}:{}", attr.group, attr.attr),
        }
    }
}

// =============================================================================
// Element Attributes
// =============================================================================

/// Per-element lifetime and routing attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementAttributes {
    /// Creation time (unix millis)
    pub create_time_ms: u64,

    /// Last access time (unix millis), used for idle expiry
    pub last_access_ms: u64,

    /// Maximum life in seconds (0 = no limit)
    pub max_life_secs: u64,

    /// Maximum idle time in seconds (0 = no limit)
    pub idle_time_secs: u64,

    /// Eternal elements never expire regardless of the limits above
    pub is_eternal: bool,

    /// Whether the element may be written to a disk tier
    pub is_spool: bool,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        Self {
            create_time_ms: 0,
            last_access_ms: 0,
            max_life_secs: 0,
            idle_time_secs: 0,
            is_eternal: true,
            is_spool: true,
        }
    }
}

impl ElementAttributes {
    /// Copy of these attributes with creation and access time set to `now_ms`
    pub fn stamped(&self, now_ms: u64) -> Self {
        Self {
            create_time_ms: now_ms,
            last_access_ms: now_ms,
            ..self.clone()
        }
    }

    /// Set the maximum life (also clears the eternal flag)
    pub fn with_max_life_secs(mut self, secs: u64) -> Self {
        self.max_life_secs = secs;
        self.is_eternal = false;
        self
    }

    /// Set the maximum idle time (also clears the eternal flag)
    pub fn with_idle_time_secs(mut self, secs: u64) -> Self {
        self.idle_time_secs = secs;
        self.is_eternal = false;
        self
    }

    pub fn with_spool(mut self, is_spool: bool) -> Self {
        self.is_spool = is_spool;
        self
    }

    /// Check both the max-life and idle limits against `now_ms`
    pub fn is_expired(&self, now_ms: u64) -> bool {
        if self.is_eternal {
            return false;
        }

        if self.max_life_secs > 0
            && now_ms.saturating_sub(self.create_time_ms) > self.max_life_secs.saturating_mul(1000)
        {
            return true;
        }

        self.idle_time_secs > 0
            && now_ms.saturating_sub(self.last_access_ms) > self.idle_time_secs.saturating_mul(1000)
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.last_access_ms = now_ms;
    }
}

// =============================================================================
// Cache Element
// =============================================================================

/// An element as stored by every tier
///
/// `value` is the already-serialized user payload; the cache never
/// interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheElement {
    pub region: String,
    pub key: CacheKey,
    pub value: Bytes,
    pub attributes: ElementAttributes,
}

impl CacheElement {
    /// Create an element with default attributes stamped with the current time
    pub fn new(region: impl Into<String>, key: impl Into<CacheKey>, value: impl Into<Bytes>) -> Self {
        Self::with_attributes(region, key, value, &ElementAttributes::default())
    }

    /// Create an element whose attributes are copied from `attributes` and
    /// stamped with the current time
    pub fn with_attributes(
        region: impl Into<String>,
        key: impl Into<CacheKey>,
        value: impl Into<Bytes>,
        attributes: &ElementAttributes,
    ) -> Self {
        Self {
            region: region.into(),
            key: key.into(),
            value: value.into(),
            attributes: attributes.stamped(now_millis()),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.attributes.is_expired(now_ms)
    }
}
