//! Closed enumerations shared across the pipeline.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Kinds of mutable entities held in the object cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    User,
    Post,
    Comment,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::User => "user",
            ObjectKind::Post => "post",
            ObjectKind::Comment => "comment",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(ObjectKind::User),
            "post" => Ok(ObjectKind::Post),
            "comment" => Ok(ObjectKind::Comment),
            other => Err(DomainError::validation(format!(
                "unknown object kind `{other}`"
            ))),
        }
    }
}

/// Objects that can be liked and therefore carry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterTarget {
    Post,
    Comment,
}

impl CounterTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterTarget::Post => "post",
            CounterTarget::Comment => "comment",
        }
    }

    pub fn object_kind(self) -> ObjectKind {
        match self {
            CounterTarget::Post => ObjectKind::Post,
            CounterTarget::Comment => ObjectKind::Comment,
        }
    }
}

impl FromStr for CounterTarget {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "post" => Ok(CounterTarget::Post),
            "comment" => Ok(CounterTarget::Comment),
            other => Err(DomainError::validation(format!(
                "unsupported counter target `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterName {
    Likes,
    Comments,
}

impl CounterName {
    pub fn as_str(self) -> &'static str {
        match self {
            CounterName::Likes => "likes",
            CounterName::Comments => "comments",
        }
    }
}

impl FromStr for CounterName {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "likes" => Ok(CounterName::Likes),
            "comments" => Ok(CounterName::Comments),
            other => Err(DomainError::validation(format!(
                "unknown counter `{other}`"
            ))),
        }
    }
}

/// Identifies one counter: `(target kind, target id, counter name)`.
///
/// Only posts carry a comment counter; the constructor rejects every other
/// pairing so callers cannot address a counter that has no durable source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    target: CounterTarget,
    target_id: uuid::Uuid,
    name: CounterName,
}

impl CounterKey {
    pub fn new(
        target: CounterTarget,
        target_id: uuid::Uuid,
        name: CounterName,
    ) -> Result<Self, DomainError> {
        if target == CounterTarget::Comment && name == CounterName::Comments {
            return Err(DomainError::validation(
                "comments are only counted on posts",
            ));
        }
        Ok(Self {
            target,
            target_id,
            name,
        })
    }

    pub fn likes(target: CounterTarget, target_id: uuid::Uuid) -> Self {
        Self {
            target,
            target_id,
            name: CounterName::Likes,
        }
    }

    pub fn comments(post_id: uuid::Uuid) -> Self {
        Self {
            target: CounterTarget::Post,
            target_id: post_id,
            name: CounterName::Comments,
        }
    }

    pub fn target(&self) -> CounterTarget {
        self.target
    }

    pub fn target_id(&self) -> uuid::Uuid {
        self.target_id
    }

    pub fn name(&self) -> CounterName {
        self.name
    }
}

/// What happened to a cached entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    FanoutPost,
    FanoutBatch,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::FanoutPost => "fanout_post",
            JobType::FanoutBatch => "fanout_batch",
        }
    }
}

impl TryFrom<&str> for JobType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "fanout_post" => Ok(JobType::FanoutPost),
            "fanout_batch" => Ok(JobType::FanoutBatch),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn counter_target_rejects_unknown_kind() {
        assert_eq!(
            "comment".parse::<CounterTarget>().expect("comment target"),
            CounterTarget::Comment
        );
        let err = "tweet".parse::<CounterTarget>().expect_err("unknown kind");
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[test]
    fn comment_counter_only_exists_on_posts() {
        let id = Uuid::new_v4();
        assert!(CounterKey::new(CounterTarget::Post, id, CounterName::Comments).is_ok());
        assert!(CounterKey::new(CounterTarget::Comment, id, CounterName::Likes).is_ok());
        assert!(CounterKey::new(CounterTarget::Comment, id, CounterName::Comments).is_err());
    }

    #[test]
    fn job_type_round_trips_through_queue_name() {
        for job_type in [JobType::FanoutPost, JobType::FanoutBatch] {
            assert_eq!(JobType::try_from(job_type.as_str()), Ok(job_type));
        }
        assert!(JobType::try_from("render_post").is_err());
    }
}
