use std::collections::HashMap;

use super::schema::Database;
use super::types::{Article, Feed, Index, StorageError};

impl Database {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// Look up the subscription for `url` through the unique URL index.
    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, StorageError> {
        self.get_by_index(Index::Url, url).await
    }

    pub async fn get_all_feeds(&self) -> Result<Vec<Feed>, StorageError> {
        self.get_all().await
    }

    /// Articles of `feed`, in the order listed by `feed.articles`.
    ///
    /// Ids listed on the feed without a stored article are skipped; stored
    /// articles the feed no longer lists are not returned.
    pub async fn articles_for_feed(&self, feed: &Feed) -> Result<Vec<Article>, StorageError> {
        let mut by_id: HashMap<String, Article> = self
            .get_all_by_index::<Article>(Index::FeedId, &feed.id)
            .await?
            .into_iter()
            .map(|article| (article.id.clone(), article))
            .collect();

        Ok(feed
            .articles
            .iter()
            .filter_map(|id| by_id.remove(id))
            .collect())
    }

    /// Delete a feed together with every article it owns, atomically.
    /// Returns the number of articles removed.
    pub async fn delete_feed(&self, feed_id: &str) -> Result<u64, StorageError> {
        let mut tx = self.begin().await?;
        let removed = tx.delete_by_index::<Article>(Index::FeedId, feed_id).await?;
        tx.delete::<Feed>(feed_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Delete every feed and article, atomically.
    pub async fn delete_all_feeds(&self) -> Result<u64, StorageError> {
        let mut tx = self.begin().await?;
        tx.clear::<Article>().await?;
        let removed = tx.clear::<Feed>().await?;
        tx.commit().await?;
        Ok(removed)
    }
}
