pub mod cache;
pub mod context;
pub mod describer;
pub mod prompt;
pub mod rate_limit;
pub mod relationships;
pub mod scheduler;
pub mod snapshot;
pub mod thread_mapper;
pub mod view;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cache::RatingCache;
pub use context::{ContextError, ContextResolver};
pub use describer::{CompletionDescriber, DisabledDescriber, MediaDescriber};
pub use rate_limit::RateLimiter;
pub use relationships::RelationshipTable;
pub use scheduler::{RatingScheduler, SchedulerDeps};
pub use snapshot::{FeedSnapshot, SnapshotScraper, SnapshotView};
pub use thread_mapper::{MappingOutcome, ThreadMapper};
pub use view::{Cell, FeedView, MarkupScraper};
