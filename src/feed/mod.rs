//! Everything between a remote feed and the records the store keeps.
//!
//! - `parser` - RSS/Atom/JSON Feed parsing via `feed-rs`
//! - `fetcher` - the [`FeedSource`] seam and its HTTP implementation
//! - `normalize` - parsed feed → [`Feed`](crate::storage::Feed) and
//!   [`Article`](crate::storage::Article) records
//! - `opml` - subscription list export and import

mod fetcher;
mod normalize;
mod opml;
mod parser;

pub use fetcher::{FeedSource, FetchError, HttpFeedSource};
pub use normalize::{article_identity, normalize, reconcile_article_ids, NormalizedFeed};
pub use opml::{export_opml, parse_opml, write_to_file, OpmlError, OpmlOutline};
pub use parser::{parse_feed, RawFeed, RawImage, RawItem};
