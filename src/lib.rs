//! Local-first RSS/Atom feed store.
//!
//! Feeds are fetched through a [`feed::FeedSource`], normalized into
//! [`storage::Feed`] and [`storage::Article`] records and kept in a SQLite
//! object store. [`service::FeedService`] is the entry point.

pub mod config;
pub mod feed;
pub mod service;
pub mod storage;
pub mod util;

pub use service::{
    AddFeedOptions, FeedError, FeedService, ImportSummary, RefreshOutcome, RefreshReport,
    RefreshResult, ServiceOptions,
};
