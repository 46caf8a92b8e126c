mod feeds;
mod folders;
mod schema;
mod store;
mod types;

pub use schema::{Database, IN_MEMORY};
pub use store::WriteTx;
pub use types::{
    Article, Collection, Feed, FeedImage, Folder, Index, Record, StorageError, UNKNOWN_FEED_URL,
};
