//! Per-user message history storage, keyed by `(network, entity, time)`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use buoy_database::Network;
use buoy_irc::{format_server_time, now, parse_server_time, Message, Tag};
use chrono::{DateTime, Utc};

use crate::Result;

/// A per-user store for IRC messages.
///
/// Instances are owned by the user actor and accessed serially; they are not
/// required to be safe for concurrent use.
#[async_trait]
pub trait MessageStore: Send {
    async fn close(&mut self) -> Result<()>;

    /// The last message ID for the given network, entity and time. The
    /// returned ID may not refer to a valid message, but can be used in
    /// history queries.
    async fn last_msg_id(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
    ) -> Result<String>;

    async fn load_before_time(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    async fn load_after_time(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Messages newer than `msg_id`, oldest first. An unknown or empty ID
    /// yields the latest `limit` messages.
    async fn load_latest_id(
        &mut self,
        network: &Network,
        entity: &str,
        msg_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Append a message, returning its internal message ID
    async fn append(&mut self, network: &Network, entity: &str, msg: &Message) -> Result<String>;
}

const MEMORY_STORE_CAP: usize = 4096;

#[derive(Debug)]
struct StoredMessage {
    id: String,
    time: DateTime<Utc>,
    msg: Message,
}

/// An in-memory ring per `(network, entity)`. The default backend when no
/// durable message store is configured, and the test double.
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    rings: HashMap<(i64, String), VecDeque<StoredMessage>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring(&mut self, network: &Network, entity: &str) -> &mut VecDeque<StoredMessage> {
        self.rings
            .entry((network.id, entity.to_string()))
            .or_default()
    }
}

fn message_time(msg: &Message) -> DateTime<Utc> {
    msg.tag("time")
        .and_then(|t| t.value.as_deref())
        .and_then(parse_server_time)
        .unwrap_or_else(now)
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }

    async fn last_msg_id(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
    ) -> Result<String> {
        let ring = self.ring(network, entity);
        Ok(ring
            .iter()
            .rev()
            .find(|m| m.time <= t)
            .map(|m| m.id.clone())
            .unwrap_or_default())
    }

    async fn load_before_time(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let ring = self.ring(network, entity);
        let mut out: Vec<Message> = ring
            .iter()
            .rev()
            .filter(|m| m.time < t)
            .take(limit)
            .map(|m| m.msg.clone())
            .collect();
        out.reverse();
        Ok(out)
    }

    async fn load_after_time(
        &mut self,
        network: &Network,
        entity: &str,
        t: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let ring = self.ring(network, entity);
        Ok(ring
            .iter()
            .filter(|m| m.time > t)
            .take(limit)
            .map(|m| m.msg.clone())
            .collect())
    }

    async fn load_latest_id(
        &mut self,
        network: &Network,
        entity: &str,
        msg_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let ring = self.ring(network, entity);
        let start = match ring.iter().position(|m| m.id == msg_id) {
            Some(i) => i + 1,
            None => ring.len().saturating_sub(limit),
        };
        Ok(ring
            .iter()
            .skip(start)
            .take(limit)
            .map(|m| m.msg.clone())
            .collect())
    }

    async fn append(&mut self, network: &Network, entity: &str, msg: &Message) -> Result<String> {
        let id = crate::random_id();
        let time = message_time(msg);

        // Replay needs the reception time, so stamp messages that arrived
        // without a server-time tag
        let mut msg = msg.clone();
        if msg.tag("time").is_none() {
            msg.tags.push(Tag::new("time", Some(format_server_time(time))));
        }

        let ring = self.ring(network, entity);
        if ring.len() >= MEMORY_STORE_CAP {
            ring.pop_front();
        }
        ring.push_back(StoredMessage {
            id: id.clone(),
            time,
            msg,
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> Network {
        Network {
            id: 1,
            addr: "ircs://irc.example.org".to_string(),
            ..Default::default()
        }
    }

    fn msg(text: &str, t: &str) -> Message {
        Message::new("PRIVMSG", vec!["#chan".into(), text.into()])
            .with_tag(Tag::new("time", Some(t.to_string())))
    }

    #[tokio::test]
    async fn append_and_load() {
        let mut store = MemoryMessageStore::new();
        let net = network();

        let id1 = store
            .append(&net, "#chan", &msg("one", "2021-06-01T12:00:00.000Z"))
            .await
            .unwrap();
        let _id2 = store
            .append(&net, "#chan", &msg("two", "2021-06-01T12:00:01.000Z"))
            .await
            .unwrap();
        assert_ne!(id1, "");

        let after = store
            .load_latest_id(&net, "#chan", &id1, 100)
            .await
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].params[1], "two");

        let t = parse_server_time("2021-06-01T12:00:00.500Z").unwrap();
        let before = store.load_before_time(&net, "#chan", t, 100).await.unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].params[1], "one");

        let after_time = store.load_after_time(&net, "#chan", t, 100).await.unwrap();
        assert_eq!(after_time.len(), 1);
        assert_eq!(after_time[0].params[1], "two");
    }

    #[tokio::test]
    async fn last_msg_id_tracks_appends() {
        let mut store = MemoryMessageStore::new();
        let net = network();

        let id = store
            .append(&net, "#chan", &msg("one", "2021-06-01T12:00:00.000Z"))
            .await
            .unwrap();
        let bookmark = store.last_msg_id(&net, "#chan", now()).await.unwrap();
        assert_eq!(bookmark, id);

        let id2 = store
            .append(&net, "#chan", &msg("two", "2021-06-01T12:00:01.000Z"))
            .await
            .unwrap();
        let bookmark = store.last_msg_id(&net, "#chan", now()).await.unwrap();
        assert_eq!(bookmark, id2);
    }

    #[tokio::test]
    async fn unknown_id_yields_latest() {
        let mut store = MemoryMessageStore::new();
        let net = network();
        for i in 0..10 {
            store
                .append(
                    &net,
                    "#chan",
                    &msg(&format!("m{i}"), "2021-06-01T12:00:00.000Z"),
                )
                .await
                .unwrap();
        }
        let latest = store.load_latest_id(&net, "#chan", "", 3).await.unwrap();
        assert_eq!(latest.len(), 3);
        assert_eq!(latest[2].params[1], "m9");
    }
}
