use super::schema::Database;
use super::types::{Feed, Folder, StorageError};

impl Database {
    // ========================================================================
    // Folder Operations
    // ========================================================================

    pub async fn get_all_folders(&self) -> Result<Vec<Folder>, StorageError> {
        self.get_all().await
    }

    /// Delete a folder and detach every feed that referenced it.
    ///
    /// Feeds are kept; their `folder_id` is cleared in the same transaction.
    /// Returns the number of feeds that were detached.
    pub async fn delete_folder(&self, folder_id: &str) -> Result<usize, StorageError> {
        let mut tx = self.begin().await?;

        // Write first so the transaction takes the write lock up front
        let removed = tx.delete::<Folder>(folder_id).await?;

        let mut detached = 0;
        for mut feed in tx.get_all::<Feed>().await? {
            if feed.folder_id.as_deref() == Some(folder_id) {
                feed.folder_id = None;
                tx.update(&feed).await?;
                detached += 1;
            }
        }

        tx.commit().await?;
        tracing::debug!(
            folder_id = %folder_id,
            removed = removed,
            detached = detached,
            "Deleted folder"
        );
        Ok(detached)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, Feed, Folder};

    async fn test_db() -> Database {
        let db = Database::in_memory();
        db.open().await.unwrap();
        db
    }

    fn feed_in(id: &str, folder: Option<&str>) -> Feed {
        let mut feed = Feed::new(id, format!("https://{}.example.com/rss", id));
        feed.folder_id = folder.map(str::to_owned);
        feed
    }

    #[tokio::test]
    async fn test_insert_update_and_list_folders() {
        let db = test_db().await;
        let mut folder = Folder {
            id: "d1".to_string(),
            name: Some("My Folder".to_string()),
        };
        db.insert(&folder).await.unwrap();

        folder.name = Some("Renamed".to_string());
        db.upsert(&folder).await.unwrap();

        let folders = db.get_all_folders().await.unwrap();
        assert_eq!(folders, vec![folder]);
    }

    #[tokio::test]
    async fn test_delete_folder_detaches_feeds() {
        let db = test_db().await;
        db.insert(&Folder {
            id: "tech".to_string(),
            name: Some("Tech".to_string()),
        })
        .await
        .unwrap();
        db.bulk_insert(&[
            feed_in("a", Some("tech")),
            feed_in("b", Some("other")),
            feed_in("c", None),
        ])
        .await
        .unwrap();

        assert_eq!(db.delete_folder("tech").await.unwrap(), 1);

        assert!(db.get_all_folders().await.unwrap().is_empty());
        let feeds = db.get_all_feeds().await.unwrap();
        assert_eq!(feeds.len(), 3, "feeds must survive folder deletion");
        assert_eq!(feeds[0].folder_id, None);
        assert_eq!(feeds[1].folder_id.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_delete_missing_folder_is_noop() {
        let db = test_db().await;
        assert_eq!(db.delete_folder("ghost").await.unwrap(), 0);
    }
}
