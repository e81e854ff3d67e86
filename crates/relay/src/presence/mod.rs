// Presence store (per-document active-user sets with sliding expiry) and the
// cross-node presence bus.

mod memory;
mod redis_store;

use std::{collections::BTreeSet, time::Duration};

use futures_util::stream::BoxStream;
use quire_common::protocol::presence::PresenceDelta;
use thiserror::Error;

pub use memory::MemoryPresence;
pub use redis_store::RedisPresence;

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("presence backend error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("failed to encode presence delta: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: String,
}

pub type BusStream = BoxStream<'static, BusMessage>;

/// Presence store and bus, selected at startup.
///
/// Every relay node in a deployment must point at the same backend; clones of
/// one `Memory` backend share state so several nodes can live in one process.
#[derive(Clone)]
pub enum PresenceBackend {
    Memory(MemoryPresence),
    Redis(RedisPresence),
}

impl PresenceBackend {
    pub fn memory() -> Self {
        Self::Memory(MemoryPresence::default())
    }

    /// Connects to Redis when a URL is configured, otherwise falls back to the
    /// in-process backend.
    pub async fn connect(redis_url: Option<&str>) -> Result<Self, PresenceError> {
        match redis_url {
            Some(url) => Ok(Self::Redis(RedisPresence::connect(url).await?)),
            None => Ok(Self::memory()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Redis(_) => "redis",
        }
    }

    /// Adds `agent_id` to the document's set and resets its expiry.
    pub async fn join(
        &self,
        doc_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<PresenceDelta, PresenceError> {
        match self {
            Self::Memory(store) => Ok(store.join(doc_id, agent_id, ttl).await),
            Self::Redis(store) => store.join(doc_id, agent_id, ttl).await,
        }
    }

    pub async fn leave(&self, doc_id: &str, agent_id: &str) -> Result<PresenceDelta, PresenceError> {
        match self {
            Self::Memory(store) => Ok(store.leave(doc_id, agent_id).await),
            Self::Redis(store) => store.leave(doc_id, agent_id).await,
        }
    }

    /// Extends the expiry of an existing member. Returns false when the agent
    /// was no longer present; nothing is added in that case.
    pub async fn refresh(
        &self,
        doc_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        match self {
            Self::Memory(store) => Ok(store.refresh(doc_id, agent_id, ttl).await),
            Self::Redis(store) => store.refresh(doc_id, agent_id, ttl).await,
        }
    }

    pub async fn members(&self, doc_id: &str) -> Result<BTreeSet<String>, PresenceError> {
        match self {
            Self::Memory(store) => Ok(store.members(doc_id).await),
            Self::Redis(store) => store.members(doc_id).await,
        }
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), PresenceError> {
        match self {
            Self::Memory(store) => {
                store.publish(topic, payload);
                Ok(())
            }
            Self::Redis(store) => store.publish(topic, payload).await,
        }
    }

    /// Subscribes to every topic matching a glob `pattern` (`*` wildcard).
    pub async fn subscribe(&self, pattern: &str) -> Result<BusStream, PresenceError> {
        match self {
            Self::Memory(store) => Ok(store.subscribe(pattern)),
            Self::Redis(store) => store.subscribe(pattern).await,
        }
    }
}

/// Glob match supporting `*` as "any run of characters".
pub(crate) fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return topic.is_empty();
    };
    let Some(mut rest) = topic.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
