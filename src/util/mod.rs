//! Small helpers shared by the feed pipeline.
//!
//! - **Text**: HTML to plain-text snippets for article previews
//! - **URLs**: validation of subscription addresses taken from untrusted input

mod feed_url;
mod text;

pub use feed_url::{validate_feed_url, FeedUrlError};
pub use text::html_to_snippet;
