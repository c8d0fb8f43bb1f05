//! Feedline cache layer
//!
//! Everything here is derived state that can be dropped and rebuilt from the
//! store at any time:
//!
//! - **Feed windows**: the newest entries of each subscriber's feed
//! - **Counters**: like and comment counts, cache-aside over the store
//! - **Objects**: entity snapshots kept until their owner mutates them
//! - **Followings**: the ids a user follows
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! list_limit = 1000
//! default_page_size = 10
//! max_page_size = 20
//! ```

mod config;
mod counters;
mod error;
mod feed;
mod followings;
mod invalidation;
mod keys;
mod kv;
mod lock;
mod objects;

pub use config::CacheConfig;
pub use counters::CounterCache;
pub use error::CacheError;
pub use feed::{CachedWindow, FeedCache, MaterializeError, PushOutcome};
pub use followings::FollowingsCache;
pub use invalidation::{Epoch, InvalidationBus, MutationEvent, MutationTarget};
pub use keys::CacheKey;
pub use kv::{KvStore, KvTxn, KvValue};
pub use objects::ObjectCache;
