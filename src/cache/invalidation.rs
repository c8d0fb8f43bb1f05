//! Invalidation bus.
//!
//! Owning modules call the bus directly after every create, update or delete
//! of a cached entity, and after every follow-edge change. The bus only
//! knows `(kind, id)` pairs and which derived keys hang off them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::entities::{FollowEdge, ObjectRef};
use crate::domain::types::MutationKind;

use super::followings::FollowingsCache;
use super::lock::mutex_lock;
use super::objects::ObjectCache;

const SOURCE: &str = "cache::invalidation";
const HISTORY_LIMIT: usize = 256;

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationTarget {
    Object {
        object: ObjectRef,
        mutation: MutationKind,
    },
    Relationship(FollowEdge),
}

/// Record of one invalidation, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct MutationEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub target: MutationTarget,
    pub timestamp: OffsetDateTime,
    /// Whether a cached key was actually removed.
    pub evicted: bool,
}

pub struct InvalidationBus {
    objects: Arc<ObjectCache>,
    followings: Arc<FollowingsCache>,
    epoch_counter: AtomicU64,
    history: Mutex<VecDeque<MutationEvent>>,
}

impl InvalidationBus {
    pub fn new(objects: Arc<ObjectCache>, followings: Arc<FollowingsCache>) -> Self {
        Self {
            objects,
            followings,
            epoch_counter: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
        }
    }

    /// Drop the cached snapshot of a mutated entity.
    pub fn on_mutation(&self, object: ObjectRef, mutation: MutationKind) {
        let evicted = match self.objects.invalidate(object) {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    kind = %object.kind,
                    id = %object.id,
                    error = %err,
                    "Object invalidation failed"
                );
                false
            }
        };
        self.record(MutationTarget::Object { object, mutation }, evicted);
    }

    /// Drop the follower's cached following-id set.
    pub fn on_relationship_changed(&self, edge: FollowEdge) {
        let evicted = match self.followings.invalidate(edge.from_user_id) {
            Ok(evicted) => evicted,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    from_user_id = %edge.from_user_id,
                    to_user_id = %edge.to_user_id,
                    error = %err,
                    "Followings invalidation failed"
                );
                false
            }
        };
        self.record(MutationTarget::Relationship(edge), evicted);
    }

    fn record(&self, target: MutationTarget, evicted: bool) {
        let event = MutationEvent {
            id: Uuid::new_v4(),
            epoch: self.epoch_counter.fetch_add(1, Ordering::SeqCst),
            target,
            timestamp: OffsetDateTime::now_utc(),
            evicted,
        };

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_target = ?event.target,
            evicted,
            "Cache invalidation applied"
        );

        let mut history = mutex_lock(&self.history, SOURCE, "record");
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Most recent events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<MutationEvent> {
        let history = mutex_lock(&self.history, SOURCE, "recent_events");
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}
