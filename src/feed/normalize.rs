use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

use crate::feed::parser::{RawFeed, RawItem};
use crate::storage::{Article, Feed, FeedImage, UNKNOWN_FEED_URL};

/// A parsed feed shaped into the records the store keeps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedFeed {
    pub feed: Feed,
    /// Articles in feed order; `feed.articles` lists the same ids
    pub articles: Vec<Article>,
}

fn fresh_id() -> String {
    Uuid::new_v4().to_string()
}

/// Convert a parsed feed into a [`Feed`] and its [`Article`]s.
///
/// The feed keeps `existing_id` when given, otherwise it gets a fresh id.
/// Every article gets a fresh id; see [`reconcile_article_ids`] to carry ids
/// over from a previous refresh. When the document does not announce its own
/// address, `url` is [`UNKNOWN_FEED_URL`] and the caller fills it in.
pub fn normalize(raw: RawFeed, existing_id: Option<&str>) -> NormalizedFeed {
    let feed_id = existing_id.map_or_else(fresh_id, str::to_owned);

    let articles: Vec<Article> = raw
        .items
        .into_iter()
        .map(|item| to_article(item, &feed_id))
        .collect();

    let feed = Feed {
        id: feed_id,
        url: raw.feed_url.unwrap_or_else(|| UNKNOWN_FEED_URL.to_owned()),
        name: None,
        title: raw.title,
        description: raw.description,
        image: raw.image.map(|image| FeedImage {
            url: image.url,
            link: image.link,
            title: image.title,
        }),
        folder_id: None,
        articles: articles.iter().map(|a| a.id.clone()).collect(),
    };

    NormalizedFeed { feed, articles }
}

fn to_article(item: RawItem, feed_id: &str) -> Article {
    Article {
        id: fresh_id(),
        feed_id: feed_id.to_owned(),
        link: item.link,
        guid: item.guid,
        title: item.title,
        pub_date: item.pub_date,
        iso_date: item.iso_date,
        creator: item.creator,
        summary: item.summary,
        content: item.content,
        content_snippet: item.content_snippet,
        categories: item.categories,
    }
}

/// Stable identity of an article across refreshes.
///
/// The trimmed `guid` when present, else the `link`, else a SHA-256 digest of
/// title and publication date.
pub fn article_identity(article: &Article) -> String {
    if let Some(guid) = article.guid.as_deref().map(str::trim) {
        if !guid.is_empty() {
            return format!("guid:{}", guid);
        }
    }
    if let Some(link) = article.link.as_deref().map(str::trim) {
        if !link.is_empty() {
            return format!("link:{}", link);
        }
    }

    let input = format!(
        "{}|{}",
        article.title.as_deref().unwrap_or(""),
        article.pub_date.as_deref().unwrap_or("")
    );
    format!("hash:{:x}", Sha256::digest(input.as_bytes()))
}

/// Give articles that were already stored their previous ids back.
///
/// Each previous id is handed out at most once, so entries sharing an
/// identity within one fetch still get distinct ids. `feed.articles` is
/// rewritten to match. Returns how many ids were reused.
pub fn reconcile_article_ids(normalized: &mut NormalizedFeed, previous: &[Article]) -> usize {
    let mut known: HashMap<String, &str> = HashMap::with_capacity(previous.len());
    for article in previous {
        known
            .entry(article_identity(article))
            .or_insert(article.id.as_str());
    }

    let mut reused = 0;
    for article in &mut normalized.articles {
        if let Some(id) = known.remove(&article_identity(article)) {
            article.id = id.to_owned();
            reused += 1;
        }
    }

    normalized.feed.articles = normalized.articles.iter().map(|a| a.id.clone()).collect();
    reused
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::parser::RawImage;
    use pretty_assertions::assert_eq;

    fn item(guid: Option<&str>, link: Option<&str>, title: &str) -> RawItem {
        RawItem {
            guid: guid.map(str::to_owned),
            link: link.map(str::to_owned),
            title: Some(title.to_owned()),
            ..RawItem::default()
        }
    }

    fn raw_feed(items: Vec<RawItem>) -> RawFeed {
        RawFeed {
            feed_url: Some("http://jalammar.github.io/feed.xml".to_string()),
            title: Some("Jay Alammar".to_string()),
            description: Some("Visualizing machine learning".to_string()),
            link: Some("http://jalammar.github.io/".to_string()),
            image: Some(RawImage {
                url: "http://jalammar.github.io/logo.png".to_string(),
                link: None,
                title: Some("logo".to_string()),
            }),
            items,
        }
    }

    #[test]
    fn test_normalize_maps_feed_fields() {
        let normalized = normalize(raw_feed(vec![]), None);
        let feed = &normalized.feed;

        assert!(Uuid::parse_str(&feed.id).is_ok());
        assert_eq!(feed.url, "http://jalammar.github.io/feed.xml");
        assert_eq!(feed.title.as_deref(), Some("Jay Alammar"));
        assert_eq!(
            feed.description.as_deref(),
            Some("Visualizing machine learning")
        );
        assert_eq!(
            feed.image,
            Some(FeedImage {
                url: "http://jalammar.github.io/logo.png".to_string(),
                link: None,
                title: Some("logo".to_string()),
            })
        );
        assert_eq!(feed.name, None);
        assert_eq!(feed.folder_id, None);
        assert!(normalized.articles.is_empty());
    }

    #[test]
    fn test_normalize_uses_existing_id() {
        let normalized = normalize(raw_feed(vec![item(Some("a"), None, "A")]), Some("feed-1"));
        assert_eq!(normalized.feed.id, "feed-1");
        assert_eq!(normalized.articles[0].feed_id, "feed-1");
    }

    #[test]
    fn test_normalize_without_self_url_uses_placeholder() {
        let mut raw = raw_feed(vec![]);
        raw.feed_url = None;
        assert_eq!(normalize(raw, None).feed.url, UNKNOWN_FEED_URL);
    }

    #[test]
    fn test_articles_get_fresh_ids_in_order() {
        let normalized = normalize(
            raw_feed(vec![
                item(Some("1"), None, "First"),
                item(Some("2"), None, "Second"),
            ]),
            None,
        );

        let titles: Vec<_> = normalized
            .articles
            .iter()
            .map(|a| a.title.as_deref().unwrap_or_default())
            .collect();
        assert_eq!(titles, vec!["First", "Second"]);
        assert_ne!(normalized.articles[0].id, normalized.articles[1].id);

        let ids: Vec<String> = normalized.articles.iter().map(|a| a.id.clone()).collect();
        assert_eq!(normalized.feed.articles, ids);
    }

    #[test]
    fn test_article_identity_precedence() {
        let mut normalized = normalize(
            raw_feed(vec![
                item(Some("  guid-1 "), Some("https://a"), "A"),
                item(Some("   "), Some("https://b"), "B"),
                item(None, None, "C"),
            ]),
            None,
        );

        assert_eq!(article_identity(&normalized.articles[0]), "guid:guid-1");
        assert_eq!(article_identity(&normalized.articles[1]), "link:https://b");

        let hashed = article_identity(&normalized.articles[2]);
        assert!(hashed.starts_with("hash:"));
        assert_eq!(hashed.len(), "hash:".len() + 64);

        normalized.articles[2].pub_date = Some("Mon, 01 Jan 2024 12:00:00 +0000".into());
        assert_ne!(article_identity(&normalized.articles[2]), hashed);
    }

    #[test]
    fn test_reconcile_reuses_previous_ids() {
        let previous = normalize(
            raw_feed(vec![item(Some("1"), None, "Old one"), item(Some("2"), None, "Two")]),
            Some("f"),
        )
        .articles;

        let mut next = normalize(
            raw_feed(vec![item(Some("3"), None, "Three"), item(Some("1"), None, "One v2")]),
            Some("f"),
        );

        assert_eq!(reconcile_article_ids(&mut next, &previous), 1);
        assert_eq!(next.articles[1].id, previous[0].id);
        assert_ne!(next.articles[0].id, previous[1].id);
        assert_eq!(next.feed.articles[1], previous[0].id);
    }

    #[test]
    fn test_reconcile_hands_out_each_id_once() {
        let previous = normalize(raw_feed(vec![item(Some("dup"), None, "A")]), Some("f")).articles;
        let mut next = normalize(
            raw_feed(vec![item(Some("dup"), None, "A"), item(Some("dup"), None, "A")]),
            Some("f"),
        );

        assert_eq!(reconcile_article_ids(&mut next, &previous), 1);
        assert_ne!(next.articles[0].id, next.articles[1].id);
    }
}
