use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use feed_rs::parser;

use crate::util::html_to_snippet;

/// Image advertised by a feed (`<image>` in RSS, `<logo>`/`<icon>` in Atom).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawImage {
    pub url: String,
    pub link: Option<String>,
    pub title: Option<String>,
}

/// One entry of a parsed feed, fields as published upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawItem {
    pub link: Option<String>,
    pub guid: Option<String>,
    pub title: Option<String>,
    /// RFC 2822 publication date
    pub pub_date: Option<String>,
    /// RFC 3339 publication date, UTC with millisecond precision
    pub iso_date: Option<String>,
    pub creator: Option<String>,
    pub summary: Option<String>,
    pub content: Option<String>,
    /// Plain-text rendering of `content` (or `summary`)
    pub content_snippet: Option<String>,
    pub categories: Vec<String>,
}

/// A feed as parsed from the wire, before it is shaped into stored records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFeed {
    /// The feed's own address (`rel="self"` link), if it announces one
    pub feed_url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// Address of the site the feed belongs to
    pub link: Option<String>,
    pub image: Option<RawImage>,
    pub items: Vec<RawItem>,
}

/// Parse RSS 0.9x/1.0/2.0, Atom or JSON Feed bytes into a [`RawFeed`].
pub fn parse_feed(bytes: &[u8]) -> Result<RawFeed> {
    // feed-rs synthesizes ids for entries without one; keep those absent
    let feed = parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build()
        .parse(bytes)?;

    let feed_url = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() == Some("self"))
        .map(|l| l.href.clone());
    let link = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .map(|l| l.href.clone());

    let image = feed.logo.or(feed.icon).map(|image| RawImage {
        url: image.uri,
        link: image.link.map(|l| l.href),
        title: image.title,
    });

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let published = entry.published.or(entry.updated);
            let summary = entry.summary.map(|s| s.content);
            let content = entry.content.and_then(|c| c.body);
            let content_snippet = content
                .as_deref()
                .or(summary.as_deref())
                .map(html_to_snippet)
                .filter(|s| !s.is_empty());
            let guid = Some(entry.id.trim().to_owned()).filter(|id| !id.is_empty());

            RawItem {
                link: entry.links.first().map(|l| l.href.clone()),
                guid,
                title: entry.title.map(|t| t.content),
                pub_date: published.map(|dt| dt.to_rfc2822()),
                iso_date: published.map(iso_date),
                creator: entry.authors.first().map(|p| p.name.clone()),
                summary,
                content,
                content_snippet,
                categories: entry
                    .categories
                    .into_iter()
                    .map(|c| c.label.unwrap_or(c.term))
                    .collect(),
            }
        })
        .collect();

    Ok(RawFeed {
        feed_url,
        title: feed.title.map(|t| t.content),
        description: feed.description.map(|t| t.content),
        link,
        image,
        items,
    })
}

fn iso_date(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}
