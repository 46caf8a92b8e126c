//! Integration tests for the feed service: subscribe, refresh, export, import.
//!
//! Each test creates its own in-memory store. Remote feeds are served by
//! wiremock and fetched through the real HTTP source.

use feedbox::feed::HttpFeedSource;
use feedbox::storage::{Article, Database, Feed};
use feedbox::{AddFeedOptions, FeedError, FeedService, RefreshOutcome};
use pretty_assertions::assert_eq;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn rss(title: &str, guids: &[&str]) -> String {
    let items: String = guids
        .iter()
        .map(|guid| {
            format!(
                "<item><guid>{guid}</guid><title>Post {guid}</title>\
                 <link>https://example.com/{guid}</link>\
                 <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0"?><rss version="2.0"><channel><title>{title}</title><description>About {title}</description>{items}</channel></rss>"#
    )
}

async fn serve(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

async fn test_service() -> FeedService<HttpFeedSource> {
    let source = HttpFeedSource::new(reqwest::Client::new())
        .with_retry_backoff(Duration::from_millis(1))
        .with_max_retries(1);
    let service = FeedService::new(Database::in_memory(), source);
    service.init().await.unwrap();
    service
}

// ============================================================================
// Subscribe
// ============================================================================

#[tokio::test]
async fn test_add_feed_over_http() {
    let server = MockServer::start().await;
    serve(&server, "/feed", rss("CleanTechnica", &["1", "2", "3"])).await;
    let service = test_service().await;
    let url = format!("{}/feed", server.uri());

    let feed = service.add_feed(&url, AddFeedOptions::default()).await.unwrap();

    assert_eq!(feed.url, url);
    assert_eq!(feed.title.as_deref(), Some("CleanTechnica"));
    assert_eq!(feed.description.as_deref(), Some("About CleanTechnica"));

    let articles = service.get_articles(&feed.id).await.unwrap();
    assert_eq!(articles.len(), 3);
    assert_eq!(articles[0].guid.as_deref(), Some("1"));
    assert_eq!(articles[0].iso_date.as_deref(), Some("2024-01-01T12:00:00.000Z"));
}

#[tokio::test]
async fn test_add_feed_twice_returns_same_feed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("Once", &["1"])))
        .expect(1)
        .mount(&server)
        .await;
    let service = test_service().await;
    let url = format!("{}/feed", server.uri());

    let first = service.add_feed(&url, AddFeedOptions::default()).await.unwrap();
    let second = service.add_feed(&url, AddFeedOptions::default()).await.unwrap();

    assert_eq!(first.id, second.id);
    let feeds = service.get_all_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].url, url);
}

#[tokio::test]
async fn test_add_unreachable_feed_fails_cleanly() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let service = test_service().await;

    let err = service
        .add_feed(&format!("{}/gone", server.uri()), AddFeedOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, FeedError::FetchFailed { .. }), "got {:?}", err);
    assert!(service.get_all_feeds().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_feed_deletes_articles_and_is_idempotent() {
    let server = MockServer::start().await;
    serve(&server, "/a", rss("A", &["1", "2"])).await;
    serve(&server, "/b", rss("B", &["3"])).await;
    let service = test_service().await;

    let a = service
        .add_feed(&format!("{}/a", server.uri()), AddFeedOptions::default())
        .await
        .unwrap();
    let b = service
        .add_feed(&format!("{}/b", server.uri()), AddFeedOptions::default())
        .await
        .unwrap();

    service.remove_feed(&a.id).await.unwrap();
    service.remove_feed(&a.id).await.unwrap();

    let feeds = service.get_all_feeds().await.unwrap();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].id, b.id);
    assert_eq!(service.database().count::<Article>().await.unwrap(), 1);

    service.remove_all_feeds().await.unwrap();
    assert!(service.get_all_feeds().await.unwrap().is_empty());
    assert_eq!(service.database().count::<Article>().await.unwrap(), 0);
}

// ============================================================================
// Refresh
// ============================================================================

#[tokio::test]
async fn test_refresh_failure_is_isolated() {
    let server = MockServer::start().await;
    serve(&server, "/a", rss("Feed A", &["a1", "a2"])).await;
    serve(&server, "/b", rss("Feed B", &["b1"])).await;
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let service = test_service().await;
    let db = service.database();
    for name in ["a", "b", "c"] {
        db.insert(&Feed::new(name, format!("{}/{}", server.uri(), name)))
            .await
            .unwrap();
    }

    let report = service.refresh_feeds().await.unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.succeeded(), 2);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].feed_id, "c");
    assert!(matches!(
        failures[0].result,
        Err(FeedError::FetchFailed { .. })
    ));

    let a = service.get_feed("a").await.unwrap().unwrap();
    assert_eq!(a.title.as_deref(), Some("Feed A"));
    assert_eq!(a.articles.len(), 2);
    let b = service.get_feed("b").await.unwrap().unwrap();
    assert_eq!(b.title.as_deref(), Some("Feed B"));
    let c = service.get_feed("c").await.unwrap().unwrap();
    assert_eq!(c, Feed::new("c", format!("{}/c", server.uri())));
}

#[tokio::test]
async fn test_refresh_feed_replaces_articles() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/feed"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rss("Blog", &["1", "2"])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    serve(&server, "/feed", rss("Blog", &["2", "3", "4"])).await;

    let service = test_service().await;
    let feed = service
        .add_feed(&format!("{}/feed", server.uri()), AddFeedOptions::default())
        .await
        .unwrap();
    let original = service.get_articles(&feed.id).await.unwrap();

    let outcome = service.refresh_feed(&feed.id).await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Updated {
            articles: 3,
            new_articles: 2
        }
    );

    let articles = service.get_articles(&feed.id).await.unwrap();
    let guids: Vec<_> = articles.iter().map(|a| a.guid.clone().unwrap()).collect();
    assert_eq!(guids, vec!["2", "3", "4"]);
    assert_eq!(articles[0].id, original[1].id);
    assert_eq!(service.database().count::<Article>().await.unwrap(), 3);
}

// ============================================================================
// OPML
// ============================================================================

#[tokio::test]
async fn test_export_shape() {
    let service = test_service().await;
    let mut clean = Feed::new("f1", "https://cleantechnica.com/feed/");
    clean.title = Some("CleanTechnica".to_string());
    let mut jay = Feed::new("f2", "http://jalammar.github.io/feed.xml");
    jay.title = Some("Jay Alammar".to_string());
    service.database().bulk_insert(&[clean, jay]).await.unwrap();

    let opml = service.export_feeds().await.unwrap();

    assert_eq!(
        opml,
        r#"<?xml version="1.0"?><opml version="2.0"><head><title>My RSS Feeds</title><body><outline type="rss" text="CleanTechnica" title="CleanTechnica" xmlUrl="https://cleantechnica.com/feed/"/><outline type="rss" text="Jay Alammar" title="Jay Alammar" xmlUrl="http://jalammar.github.io/feed.xml"/></body></head></opml>"#
    );
}

#[tokio::test]
async fn test_import_skips_invalid_duplicate_and_existing() {
    let service = test_service().await;
    service
        .database()
        .insert(&Feed::new("existing", "https://cleantechnica.com/feed/"))
        .await
        .unwrap();

    let opml = r#"<?xml version="1.0"?>
<opml version="2.0"><head><title>Mine</title></head><body>
  <outline text="Energy">
    <outline text="CleanTechnica" xmlUrl="https://cleantechnica.com/feed/"/>
    <outline text="Jay Alammar" xmlUrl="http://jalammar.github.io/feed.xml"/>
  </outline>
  <outline text="Again" xmlUrl="http://jalammar.github.io/feed.xml"/>
  <outline text="Local" xmlUrl="http://127.0.0.1:8080/rss"/>
  <outline text="Weird" xmlUrl="file:///etc/passwd"/>
</body></opml>"#;

    let summary = service.import_feeds(opml).await.unwrap();

    assert_eq!(summary.imported.len(), 1);
    assert_eq!(summary.already_subscribed, 1);
    assert_eq!(summary.duplicates, 1);
    assert_eq!(summary.invalid, 2);

    let feeds = service.get_all_feeds().await.unwrap();
    assert_eq!(feeds.len(), 2);
    assert_eq!(feeds[1].url, "http://jalammar.github.io/feed.xml");
    assert_eq!(feeds[1].title.as_deref(), Some("Jay Alammar"));
    assert!(feeds[1].articles.is_empty());
}

#[tokio::test]
async fn test_export_then_import_into_fresh_store() {
    let source = test_service().await;
    let mut feed = Feed::new("f1", "https://cleantechnica.com/feed/");
    feed.title = Some("CleanTechnica".to_string());
    source.database().insert(&feed).await.unwrap();
    let opml = source.export_feeds().await.unwrap();

    let target = test_service().await;
    let summary = target.import_feeds(&opml).await.unwrap();

    assert_eq!(summary.imported.len(), 1);
    let imported = &target.get_all_feeds().await.unwrap()[0];
    assert_eq!(imported.url, feed.url);
    assert_eq!(imported.title, feed.title);
    assert_ne!(imported.id, feed.id);
}

#[tokio::test]
async fn test_import_malformed_opml_fails() {
    let service = test_service().await;
    let err = service
        .import_feeds("<opml><body><outline></body>")
        .await
        .unwrap_err();
    assert!(matches!(err, FeedError::Opml(_)), "got {:?}", err);
}
