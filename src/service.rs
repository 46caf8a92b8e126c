//! Feed subscriptions on top of the object store.
//!
//! [`FeedService`] owns the rules that tie the pieces together: one feed per
//! URL, articles replaced atomically on refresh, and refreshes that fail one
//! feed at a time instead of all at once.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::Config;
use crate::feed::{
    export_opml, normalize, parse_opml, reconcile_article_ids, FeedSource, FetchError,
    NormalizedFeed, OpmlError, OpmlOutline, RawFeed,
};
use crate::storage::{Article, Database, Feed, Folder, Index, StorageError, UNKNOWN_FEED_URL};
use crate::util::validate_feed_url;

const DEFAULT_MAX_CONCURRENT_REFRESHES: usize = 10;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to fetch feed '{url}': {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: FetchError,
    },

    #[error("A feed with URL '{0}' already exists")]
    DuplicateFeed(String),

    #[error(transparent)]
    Opml(#[from] OpmlError),

    #[error("Not supported: {0}")]
    Unsupported(&'static str),
}

// ============================================================================
// Options and Results
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOptions {
    /// Feeds fetched at the same time during [`FeedService::refresh_feeds`]
    pub max_concurrent_refreshes: usize,
    /// Upper bound on fetching a single feed
    pub refresh_deadline: Option<Duration>,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            max_concurrent_refreshes: DEFAULT_MAX_CONCURRENT_REFRESHES,
            refresh_deadline: None,
        }
    }
}

impl From<&Config> for ServiceOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_refreshes: config.max_concurrent_refreshes,
            refresh_deadline: config.refresh_deadline(),
        }
    }
}

/// Caller-chosen fields for a new subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddFeedOptions {
    pub name: Option<String>,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The feed was re-synced; `new_articles` of `articles` were not stored before.
    Updated { articles: usize, new_articles: usize },
    /// The feed no longer exists. Nothing was written.
    Removed,
}

#[derive(Debug)]
pub struct RefreshResult {
    pub feed_id: String,
    pub url: String,
    pub result: Result<RefreshOutcome, FeedError>,
}

/// Settlement of every feed in a [`FeedService::refresh_feeds`] run, in
/// completion order.
#[derive(Debug, Default)]
pub struct RefreshReport {
    pub results: Vec<RefreshResult>,
}

impl RefreshReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &RefreshResult> {
        self.results.iter().filter(|r| r.result.is_err())
    }

    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }
}

#[derive(Debug, Default)]
pub struct ImportSummary {
    /// Feeds created by the import, in document order
    pub imported: Vec<Feed>,
    pub already_subscribed: usize,
    /// Outlines repeating a URL seen earlier in the same document
    pub duplicates: usize,
    /// Outlines whose URL was malformed or pointed at a local address
    pub invalid: usize,
}

// ============================================================================
// FeedService
// ============================================================================

/// Subscription management over a shared [`Database`] and a [`FeedSource`].
#[derive(Debug)]
pub struct FeedService<S> {
    db: Database,
    source: S,
    options: ServiceOptions,
}

impl<S: FeedSource> FeedService<S> {
    pub fn new(db: Database, source: S) -> Self {
        Self {
            db,
            source,
            options: ServiceOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ServiceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Open the underlying store. Safe to call more than once.
    pub async fn init(&self) -> Result<(), FeedError> {
        self.db.open().await?;
        Ok(())
    }

    async fn fetch(&self, url: &str) -> Result<RawFeed, FeedError> {
        let fetch = self.source.fetch(url);
        let result = match self.options.refresh_deadline {
            Some(deadline) => tokio::time::timeout(deadline, fetch)
                .await
                .unwrap_or(Err(FetchError::Timeout)),
            None => fetch.await,
        };
        result.map_err(|source| FeedError::FetchFailed {
            url: url.to_owned(),
            source,
        })
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribe to the feed at `url`.
    ///
    /// Returns the stored feed unchanged, without fetching, if `url` is
    /// already subscribed. Otherwise the feed is fetched and stored with its
    /// articles in one transaction. If the fetched document names a
    /// canonical address that is already subscribed, that feed is returned
    /// instead.
    ///
    /// # Errors
    ///
    /// - [`FeedError::FetchFailed`] if the feed cannot be fetched or parsed;
    ///   nothing is written.
    /// - [`FeedError::DuplicateFeed`] if a concurrent add stored the same URL
    ///   first.
    pub async fn add_feed(&self, url: &str, options: AddFeedOptions) -> Result<Feed, FeedError> {
        if let Some(existing) = self.db.get_feed_by_url(url).await? {
            tracing::debug!(url = %url, feed_id = %existing.id, "Feed already subscribed");
            return Ok(existing);
        }

        let raw = self.fetch(url).await?;
        let NormalizedFeed { mut feed, articles } = normalize(raw, None);

        if feed.url == UNKNOWN_FEED_URL {
            feed.url = url.to_owned();
        } else if feed.url != url {
            if let Some(existing) = self.db.get_feed_by_url(&feed.url).await? {
                tracing::debug!(
                    url = %url,
                    canonical = %feed.url,
                    feed_id = %existing.id,
                    "Feed already subscribed under its canonical URL"
                );
                return Ok(existing);
            }
        }
        feed.name = options.name;
        feed.folder_id = options.folder_id;

        let mut tx = self.db.begin().await?;
        if let Err(e) = tx.insert(&feed).await {
            return Err(match e {
                e if e.is_constraint_violation() => FeedError::DuplicateFeed(feed.url),
                e => e.into(),
            });
        }
        tx.insert_all(&articles).await?;
        tx.commit().await?;

        tracing::info!(
            feed_id = %feed.id,
            url = %feed.url,
            articles = articles.len(),
            "Added feed"
        );
        Ok(feed)
    }

    /// Delete a feed and its articles. Unknown ids are not an error.
    pub async fn remove_feed(&self, feed_id: &str) -> Result<(), FeedError> {
        let articles = self.db.delete_feed(feed_id).await?;
        tracing::info!(feed_id = %feed_id, articles = articles, "Removed feed");
        Ok(())
    }

    pub async fn remove_all_feeds(&self) -> Result<(), FeedError> {
        let feeds = self.db.delete_all_feeds().await?;
        tracing::info!(feeds = feeds, "Removed all feeds");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Refresh
    // ------------------------------------------------------------------------

    /// Re-fetch every subscribed feed.
    ///
    /// Feeds are refreshed concurrently and independently: a feed that fails
    /// is reported in the returned [`RefreshReport`] and leaves its stored
    /// state untouched, while the others are still updated. Only failing to
    /// enumerate the feeds is an error.
    pub async fn refresh_feeds(&self) -> Result<RefreshReport, FeedError> {
        let feeds = self.db.get_all_feeds().await?;
        let total = feeds.len();

        let results: Vec<RefreshResult> = stream::iter(feeds)
            .map(|feed| async move {
                let feed_id = feed.id.clone();
                let url = feed.url.clone();
                let result = self.refresh_stored(feed).await;
                if let Err(e) = &result {
                    tracing::warn!(feed_id = %feed_id, url = %url, error = %e, "Feed refresh failed");
                }
                RefreshResult {
                    feed_id,
                    url,
                    result,
                }
            })
            .buffer_unordered(self.options.max_concurrent_refreshes.max(1))
            .collect()
            .await;

        let report = RefreshReport { results };
        tracing::info!(
            total = total,
            succeeded = report.succeeded(),
            failed = total - report.succeeded(),
            "Refreshed feeds"
        );
        Ok(report)
    }

    /// Re-fetch a single feed. An unknown id yields [`RefreshOutcome::Removed`].
    pub async fn refresh_feed(&self, feed_id: &str) -> Result<RefreshOutcome, FeedError> {
        match self.db.get_by_key::<Feed>(feed_id).await? {
            Some(feed) => self.refresh_stored(feed).await,
            None => Ok(RefreshOutcome::Removed),
        }
    }

    async fn refresh_stored(&self, stored: Feed) -> Result<RefreshOutcome, FeedError> {
        let raw = self.fetch(&stored.url).await?;
        let mut normalized = normalize(raw, Some(&stored.id));

        let mut tx = self.db.begin().await?;

        // User-owned fields survive; feed metadata follows the source
        let updated = Feed {
            title: normalized.feed.title.take(),
            description: normalized.feed.description.take(),
            image: normalized.feed.image.take(),
            ..stored
        };
        // Takes the write lock before anything is read. If the feed was
        // removed meanwhile the transaction is dropped and rolls back.
        if !tx.update(&updated).await? {
            tracing::debug!(feed_id = %updated.id, "Feed removed during refresh");
            return Ok(RefreshOutcome::Removed);
        }

        let previous: Vec<Article> = tx.get_all_by_index(Index::FeedId, &updated.id).await?;
        let reused = reconcile_article_ids(&mut normalized, &previous);

        let current: HashSet<&str> = normalized.articles.iter().map(|a| a.id.as_str()).collect();
        let mut stale = 0;
        for article in previous.iter().filter(|a| !current.contains(a.id.as_str())) {
            tx.delete::<Article>(&article.id).await?;
            stale += 1;
        }
        tx.upsert_all(&normalized.articles).await?;

        let updated = Feed {
            articles: normalized.feed.articles,
            ..updated
        };
        tx.update(&updated).await?;
        tx.commit().await?;

        let articles = normalized.articles.len();
        tracing::debug!(
            feed_id = %updated.id,
            articles = articles,
            new = articles - reused,
            stale = stale,
            "Refreshed feed"
        );
        Ok(RefreshOutcome::Updated {
            articles,
            new_articles: articles - reused,
        })
    }

    // ------------------------------------------------------------------------
    // OPML
    // ------------------------------------------------------------------------

    /// All subscriptions as an OPML document, in storage order.
    pub async fn export_feeds(&self) -> Result<String, FeedError> {
        let feeds = self.db.get_all_feeds().await?;
        let outlines: Vec<OpmlOutline> = feeds.iter().map(OpmlOutline::from).collect();
        Ok(export_opml(&outlines)?)
    }

    /// Subscribe to every feed listed in an OPML document.
    ///
    /// Nothing is fetched: new feeds are stored with the outline title and no
    /// articles, and pick up their content on the next refresh. Invalid,
    /// repeated and already subscribed URLs are skipped and counted. The
    /// new feeds are inserted in one transaction.
    pub async fn import_feeds(&self, opml: &str) -> Result<ImportSummary, FeedError> {
        let outlines = parse_opml(opml)?;

        let subscribed: HashSet<String> = self
            .db
            .get_all_feeds()
            .await?
            .into_iter()
            .map(|feed| feed.url)
            .collect();

        let mut summary = ImportSummary::default();
        let mut seen = HashSet::new();

        for outline in outlines {
            let url = outline.xml_url.trim().to_owned();
            if let Err(e) = validate_feed_url(&url) {
                tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL in OPML");
                summary.invalid += 1;
                continue;
            }
            if subscribed.contains(&url) {
                summary.already_subscribed += 1;
                continue;
            }
            if !seen.insert(url.clone()) {
                summary.duplicates += 1;
                continue;
            }

            let mut feed = Feed::new(Uuid::new_v4().to_string(), url);
            feed.title = outline.title;
            summary.imported.push(feed);
        }

        self.db.bulk_insert(&summary.imported).await?;
        tracing::info!(
            imported = summary.imported.len(),
            already_subscribed = summary.already_subscribed,
            duplicates = summary.duplicates,
            invalid = summary.invalid,
            "Imported OPML"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Reads and edits
    // ------------------------------------------------------------------------

    pub async fn get_feed(&self, feed_id: &str) -> Result<Option<Feed>, FeedError> {
        Ok(self.db.get_by_key(feed_id).await?)
    }

    pub async fn get_all_feeds(&self) -> Result<Vec<Feed>, FeedError> {
        Ok(self.db.get_all_feeds().await?)
    }

    /// Articles of a feed in feed order; empty for an unknown feed.
    pub async fn get_articles(&self, feed_id: &str) -> Result<Vec<Article>, FeedError> {
        match self.db.get_by_key::<Feed>(feed_id).await? {
            Some(feed) => Ok(self.db.articles_for_feed(&feed).await?),
            None => Ok(Vec::new()),
        }
    }

    /// Set or clear the user-assigned name. `None` if the feed does not exist.
    pub async fn rename_feed(
        &self,
        feed_id: &str,
        name: Option<String>,
    ) -> Result<Option<Feed>, FeedError> {
        self.edit_feed(feed_id, |feed| feed.name = name).await
    }

    /// Put a feed in a folder, or take it out with `None`. The folder id is
    /// not checked against stored folders.
    pub async fn move_feed_to_folder(
        &self,
        feed_id: &str,
        folder_id: Option<String>,
    ) -> Result<Option<Feed>, FeedError> {
        self.edit_feed(feed_id, |feed| feed.folder_id = folder_id).await
    }

    async fn edit_feed(
        &self,
        feed_id: &str,
        edit: impl FnOnce(&mut Feed),
    ) -> Result<Option<Feed>, FeedError> {
        let Some(mut feed) = self.db.get_by_key::<Feed>(feed_id).await? else {
            return Ok(None);
        };
        edit(&mut feed);
        Ok(self.db.update(&feed).await?.then_some(feed))
    }

    // ------------------------------------------------------------------------
    // Folders
    // ------------------------------------------------------------------------

    pub async fn create_folder(&self, name: &str) -> Result<Folder, FeedError> {
        let folder = Folder {
            id: Uuid::new_v4().to_string(),
            name: Some(name.to_owned()),
        };
        self.db.insert(&folder).await?;
        tracing::debug!(folder_id = %folder.id, name = %name, "Created folder");
        Ok(folder)
    }

    pub async fn rename_folder(
        &self,
        folder_id: &str,
        name: &str,
    ) -> Result<Option<Folder>, FeedError> {
        let folder = Folder {
            id: folder_id.to_owned(),
            name: Some(name.to_owned()),
        };
        Ok(self.db.update(&folder).await?.then_some(folder))
    }

    pub async fn get_all_folders(&self) -> Result<Vec<Folder>, FeedError> {
        Ok(self.db.get_all_folders().await?)
    }

    /// Delete a folder; feeds in it are kept and moved out of it.
    /// Returns how many feeds were moved out.
    pub async fn delete_folder(&self, folder_id: &str) -> Result<usize, FeedError> {
        Ok(self.db.delete_folder(folder_id).await?)
    }

    // ------------------------------------------------------------------------
    // Read state
    // ------------------------------------------------------------------------

    pub async fn mark_article_as_read(&self, _article_id: &str) -> Result<(), FeedError> {
        Err(FeedError::Unsupported("read/unread tracking"))
    }

    pub async fn mark_article_as_unread(&self, _article_id: &str) -> Result<(), FeedError> {
        Err(FeedError::Unsupported("read/unread tracking"))
    }
}
