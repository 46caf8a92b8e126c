use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

const SQLITE_CANTOPEN: i32 = 14;

/// Errors raised by the object store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage location is missing or cannot be opened at all
    #[error("Storage is unavailable: {0}")]
    Unavailable(String),

    /// Connecting to the storage backend failed
    #[error("Failed to open storage: {0}")]
    OpenFailed(#[source] sqlx::Error),

    /// An operation was issued before `Database::open` resolved
    #[error("Storage has not been initialized; call open() first")]
    NotInitialized,

    /// A primary key or unique index value already exists
    #[error("Constraint violation in '{collection}': {message}")]
    ConstraintViolation {
        collection: &'static str,
        message: String,
    },

    /// Schema migration failed
    #[error("Storage migration failed: {0}")]
    Migration(String),

    /// A stored record could not be encoded or decoded
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The index does not belong to the record's collection
    #[error("Collection '{collection}' has no index named '{index}'")]
    UnknownIndex {
        collection: &'static str,
        index: &'static str,
    },

    /// Generic backend error
    #[error("Storage error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Classify a failed write, surfacing unique-constraint failures as
    /// [`StorageError::ConstraintViolation`].
    pub(crate) fn from_write(collection: Collection, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return StorageError::ConstraintViolation {
                    collection: collection.name(),
                    message: db_err.message().to_owned(),
                };
            }
        }
        StorageError::Other(err)
    }

    /// Classify a connection error raised while opening the pool.
    pub(crate) fn from_connect(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // Extended result codes carry the primary code in the low byte
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| code & 0xff);
            if primary == Some(SQLITE_CANTOPEN) {
                return StorageError::Unavailable(db_err.message().to_owned());
            }
        }
        StorageError::OpenFailed(err)
    }

    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StorageError::ConstraintViolation { .. })
    }
}

// ============================================================================
// Collections and Indexes
// ============================================================================

/// A named collection of records in the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Feeds,
    Articles,
    Folders,
}

impl Collection {
    pub const ALL: [Collection; 3] = [Collection::Feeds, Collection::Articles, Collection::Folders];

    pub fn name(self) -> &'static str {
        match self {
            Collection::Feeds => "feeds",
            Collection::Articles => "articles",
            Collection::Folders => "folders",
        }
    }

    /// Backing table. Identical to the collection name today.
    pub(crate) fn table(self) -> &'static str {
        self.name()
    }

    pub fn indexes(self) -> &'static [Index] {
        match self {
            Collection::Feeds => &[Index::Url],
            Collection::Articles => &[Index::FeedId],
            Collection::Folders => &[],
        }
    }
}

/// A secondary index over one field of a collection's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    /// Unique index on `Feed.url`
    Url,
    /// Owner index on `Article.feedId`
    FeedId,
}

impl Index {
    pub fn name(self) -> &'static str {
        match self {
            Index::Url => "url",
            Index::FeedId => "feedId",
        }
    }

    pub fn collection(self) -> Collection {
        match self {
            Index::Url => Collection::Feeds,
            Index::FeedId => Collection::Articles,
        }
    }

    pub fn is_unique(self) -> bool {
        matches!(self, Index::Url)
    }

    pub(crate) fn column(self) -> &'static str {
        match self {
            Index::Url => "url",
            Index::FeedId => "feed_id",
        }
    }
}

/// A value that lives in exactly one collection, keyed by a string id.
///
/// Records are stored as JSON; index columns are extracted from the record
/// on every write so lookups never need to decode the payload.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {
    const COLLECTION: Collection;

    /// Primary key
    fn key(&self) -> &str;

    /// Value of `index` for this record, `None` if the record does not carry it.
    fn index_value(&self, _index: Index) -> Option<&str> {
        None
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Placeholder URL used when a parsed feed does not announce its own address.
pub const UNKNOWN_FEED_URL: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedImage {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// A subscribed source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feed {
    pub id: String,
    pub url: String,
    /// User-assigned display name, overrides `title` in front ends
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<FeedImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,
    /// Article ids in feed order
    #[serde(default)]
    pub articles: Vec<String>,
}

impl Feed {
    /// A bare subscription with no fetched metadata yet.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: None,
            title: None,
            description: None,
            image: None,
            folder_id: None,
            articles: Vec::new(),
        }
    }

    /// Name shown to the user: `name`, then `title`, then the URL.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.title.as_deref())
            .unwrap_or(&self.url)
    }
}

impl Record for Feed {
    const COLLECTION: Collection = Collection::Feeds;

    fn key(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: Index) -> Option<&str> {
        match index {
            Index::Url => Some(&self.url),
            Index::FeedId => None,
        }
    }
}

/// A single entry of a feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub feed_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pub_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_snippet: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl Record for Article {
    const COLLECTION: Collection = Collection::Articles;

    fn key(&self) -> &str {
        &self.id
    }

    fn index_value(&self, index: Index) -> Option<&str> {
        match index {
            Index::FeedId => Some(&self.feed_id),
            Index::Url => None,
        }
    }
}

/// An optional grouping label for feeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Record for Folder {
    const COLLECTION: Collection = Collection::Folders;

    fn key(&self) -> &str {
        &self.id
    }
}
