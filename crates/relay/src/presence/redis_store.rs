use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use futures_util::StreamExt;
use quire_common::protocol::presence::{active_users_key, PresenceDelta};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use tracing::warn;

use super::{BusMessage, BusStream, PresenceError};

/// Redis-backed presence.
///
/// Each document's active users live in a sorted set scored by the member's
/// expiry deadline (unix millis). Expired members are trimmed inside the same
/// `MULTI` as every read or write; the key also carries an `EXPIRE` so an
/// abandoned document's set disappears on its own.
#[derive(Clone)]
pub struct RedisPresence {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisPresence {
    pub async fn connect(url: &str) -> Result<Self, PresenceError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { client, conn })
    }

    pub async fn join(
        &self,
        doc_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<PresenceDelta, PresenceError> {
        let key = active_users_key(doc_id);
        let now = unix_millis();
        let mut conn = self.conn.clone();
        let (before, after): (Vec<String>, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now.saturating_add(duration_millis(ttl)))
            .arg(agent_id)
            .ignore()
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(PresenceDelta::between(doc_id, &into_set(before), &into_set(after)))
    }

    pub async fn leave(&self, doc_id: &str, agent_id: &str) -> Result<PresenceDelta, PresenceError> {
        let key = active_users_key(doc_id);
        let now = unix_millis();
        let mut conn = self.conn.clone();
        let (before, after): (Vec<String>, Vec<String>) = redis::pipe()
            .atomic()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZREM")
            .arg(&key)
            .arg(agent_id)
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(PresenceDelta::between(doc_id, &into_set(before), &into_set(after)))
    }

    pub async fn refresh(
        &self,
        doc_id: &str,
        agent_id: &str,
        ttl: Duration,
    ) -> Result<bool, PresenceError> {
        let key = active_users_key(doc_id);
        let now = unix_millis();
        let mut conn = self.conn.clone();
        // ZADD XX CH reports 1 only when an existing member's score changed.
        let (changed,): (i64,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg("XX")
            .arg("CH")
            .arg(now.saturating_add(duration_millis(ttl)))
            .arg(agent_id)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl.as_secs().max(1))
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(changed > 0)
    }

    pub async fn members(&self, doc_id: &str) -> Result<BTreeSet<String>, PresenceError> {
        let key = active_users_key(doc_id);
        let mut conn = self.conn.clone();
        let (members,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(unix_millis())
            .ignore()
            .cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;

        Ok(into_set(members))
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    /// Opens a dedicated pub/sub connection and pattern-subscribes to it.
    pub async fn subscribe(&self, pattern: &str) -> Result<BusStream, PresenceError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;

        let stream = pubsub.into_on_message().filter_map(|message| async move {
            let topic = message.get_channel_name().to_owned();
            match message.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { topic, payload }),
                Err(error) => {
                    warn!(topic = %topic, error = %error, "dropping non-text presence bus payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(duration_millis).unwrap_or(0)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn into_set(members: Vec<String>) -> BTreeSet<String> {
    members.into_iter().collect()
}
