pub mod config;
pub mod error;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{ScoreError, TweetFilterError};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use types::*;
