//! The per-user actor: one task owning the user's networks, upstream
//! sessions, attached downstreams and message store. A single event inbox
//! serialises every mutation.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use buoy_database::{Channel, Network, User};
use buoy_irc::{Message, Prefix};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::downstream::{AttachedDownstream, DownstreamState};
use crate::msgstore::MessageStore;
use crate::server::ServerShared;
use crate::upstream::{self, UpstreamSession};
use crate::{Error, Result, SERVICE_NICK};

pub(crate) type DownstreamId = u64;

/// Capacity of a user actor's inbox
pub(crate) const INBOX_CAPACITY: usize = 64;

pub(crate) fn service_prefix() -> Prefix {
    Prefix::full(SERVICE_NICK, SERVICE_NICK, SERVICE_NICK)
}

/// Everything that can happen to a user, delivered through the actor inbox.
/// Handling an event is the only way state mutates.
pub enum Event {
    DownstreamAttached(AttachedDownstream),
    DownstreamDetached {
        id: DownstreamId,
    },
    DownstreamMessage {
        id: DownstreamId,
        msg: Message,
    },
    UpstreamConnected {
        network_id: i64,
        outbound: mpsc::Sender<Message>,
    },
    UpstreamMessage {
        network_id: i64,
        msg: Message,
    },
    UpstreamDisconnected {
        network_id: i64,
        error: Option<String>,
    },
    ChannelDetachTimeout {
        network_id: i64,
        channel: String,
    },
    UserUpdate {
        password: Option<String>,
        admin: Option<bool>,
        done: oneshot::Sender<Result<()>>,
    },
    Broadcast(Message),
    Stop,
}

/// One of the user's networks, persistent record plus ephemeral session
pub(crate) struct NetworkState {
    pub record: Network,
    /// Persistent channels, keyed by casemapped name
    pub channels: HashMap<String, Channel>,
    /// The live session, while connected
    pub conn: Option<UpstreamSession>,
    pub last_error: Option<String>,
    pub registered: Arc<AtomicBool>,
    pub detach_timers: HashMap<String, JoinHandle<()>>,
    task: Option<JoinHandle<()>>,
    task_stop: CancellationToken,
}

impl NetworkState {
    #[cfg(test)]
    pub(crate) fn for_test(record: Network, channels: HashMap<String, Channel>) -> Self {
        Self {
            record,
            channels,
            conn: None,
            last_error: None,
            registered: Arc::new(AtomicBool::new(false)),
            detach_timers: HashMap::new(),
            task: None,
            task_stop: CancellationToken::new(),
        }
    }

    pub fn stop(&mut self) {
        self.task_stop.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        for (_, timer) in self.detach_timers.drain() {
            timer.abort();
        }
        self.conn = None;
    }
}

pub struct UserActor {
    pub(crate) record: User,
    pub(crate) server: Arc<ServerShared>,
    pub(crate) networks: HashMap<i64, NetworkState>,
    pub(crate) downstreams: HashMap<DownstreamId, DownstreamState>,
    pub(crate) msgstore: Box<dyn MessageStore>,
    pub(crate) inbox_tx: mpsc::Sender<Event>,
    inbox_rx: mpsc::Receiver<Event>,
    pub(crate) stop: CancellationToken,
    next_downstream_id: DownstreamId,
}

/// The sending side of a user actor, held by the server
#[derive(Clone)]
pub struct UserHandle {
    pub id: i64,
    pub username: String,
    pub inbox: mpsc::Sender<Event>,
}

impl UserActor {
    /// Create the actor for `record` and run it as its own task
    pub(crate) fn spawn(
        record: User,
        server: Arc<ServerShared>,
        msgstore: Box<dyn MessageStore>,
    ) -> UserHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let handle = UserHandle {
            id: record.id,
            username: record.username.clone(),
            inbox: inbox_tx.clone(),
        };

        let stop = server.stop.child_token();
        let actor = UserActor {
            record,
            server,
            networks: HashMap::new(),
            downstreams: HashMap::new(),
            msgstore,
            inbox_tx,
            inbox_rx,
            stop,
            next_downstream_id: 1,
        };
        tokio::spawn(actor.run());
        handle
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> UserActor {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let server = Arc::new(crate::server::ServerShared {
            config: crate::config::Config::default(),
            db: Box::new(buoy_database::SqliteDb::open(":memory:").unwrap()),
            users: parking_lot::Mutex::new(HashMap::new()),
            downstream_count: std::sync::atomic::AtomicI64::new(0),
            stop: CancellationToken::new(),
        });
        UserActor {
            record: User {
                id: 1,
                username: "alice".to_string(),
                ..Default::default()
            },
            server,
            networks: HashMap::new(),
            downstreams: HashMap::new(),
            msgstore: Box::new(crate::msgstore::MemoryMessageStore::new()),
            inbox_tx,
            inbox_rx,
            stop: CancellationToken::new(),
            next_downstream_id: 1,
        }
    }

    async fn run(mut self) {
        if let Err(err) = self.load_networks().await {
            tracing::error!(user = %self.record.username, %err, "failed to load networks");
        }

        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => break,
                event = self.inbox_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Database failures abort the in-flight event only; the actor
            // keeps running
            match event {
                Event::DownstreamAttached(attached) => {
                    self.handle_downstream_attached(attached).await;
                }
                Event::DownstreamDetached { id } => {
                    self.handle_downstream_detached(id).await;
                }
                Event::DownstreamMessage { id, msg } => {
                    self.handle_downstream_message(id, msg).await;
                }
                Event::UpstreamConnected {
                    network_id,
                    outbound,
                } => {
                    self.handle_upstream_connected(network_id, outbound).await;
                }
                Event::UpstreamMessage { network_id, msg } => {
                    self.handle_upstream_message(network_id, msg).await;
                }
                Event::UpstreamDisconnected { network_id, error } => {
                    self.handle_upstream_disconnected(network_id, error).await;
                }
                Event::ChannelDetachTimeout {
                    network_id,
                    channel,
                } => {
                    self.handle_detach_timeout(network_id, channel).await;
                }
                Event::UserUpdate {
                    password,
                    admin,
                    done,
                } => {
                    let result = self.apply_user_update(password, admin).await;
                    let _ = done.send(result);
                }
                Event::Broadcast(msg) => {
                    self.broadcast_to_downstreams(&msg);
                }
                Event::Stop => break,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        tracing::debug!(user = %self.record.username, "stopping user actor");
        for net in self.networks.values_mut() {
            net.stop();
        }
        for ds in self.downstreams.values() {
            ds.send(&Message::new("ERROR", vec!["Closing link".into()]));
        }
        self.downstreams.clear();
        if let Err(err) = self.msgstore.close().await {
            tracing::warn!(%err, "failed to close message store");
        }
    }

    async fn load_networks(&mut self) -> Result<()> {
        let networks = self.server.db.list_networks(self.record.id).await?;
        for record in networks {
            let channels = self.server.db.list_channels(record.id).await?;
            self.insert_network(record, channels);
        }
        Ok(())
    }

    /// Install the network and, when enabled, start its scheduler task
    pub(crate) fn insert_network(&mut self, record: Network, channels: Vec<Channel>) {
        let network_id = record.id;
        let channel_map = channels
            .into_iter()
            .map(|ch| (ch.name.to_ascii_lowercase(), ch))
            .collect();

        let task_stop = self.stop.child_token();
        let registered = Arc::new(AtomicBool::new(false));
        let task = if record.enabled {
            Some(tokio::spawn(upstream::network_task(
                network_id,
                record.clone(),
                self.inbox_tx.clone(),
                task_stop.clone(),
                Arc::clone(&registered),
            )))
        } else {
            None
        };

        self.networks.insert(
            network_id,
            NetworkState {
                record,
                channels: channel_map,
                conn: None,
                last_error: None,
                registered,
                detach_timers: HashMap::new(),
                task,
                task_stop,
            },
        );
    }

    /// Stop and restart the network's scheduler task, used after a record
    /// mutation that affects the connection
    pub(crate) fn restart_network(&mut self, network_id: i64) {
        let Some(mut net) = self.networks.remove(&network_id) else {
            return;
        };
        net.stop();
        let record = net.record.clone();
        let channels = net.channels.into_values().collect();
        self.insert_network(record, channels);
    }

    /// Drop the live session so the scheduler redials with back-off
    pub(crate) async fn reset_network(&mut self, network_id: i64, reason: &str) {
        if let Some(net) = self.networks.get_mut(&network_id) {
            tracing::warn!(network = %net.record.name(), %reason, "resetting upstream session");
            net.last_error = Some(reason.to_string());
            net.conn = None;
        }
    }

    pub(crate) fn next_downstream_id(&mut self) -> DownstreamId {
        let id = self.next_downstream_id;
        self.next_downstream_id += 1;
        id
    }

    pub(crate) fn get_network_id(&self, name: &str) -> Option<i64> {
        self.networks
            .values()
            .find(|net| net.record.name() == name)
            .map(|net| net.record.id)
    }

    async fn apply_user_update(
        &mut self,
        password: Option<String>,
        admin: Option<bool>,
    ) -> Result<()> {
        let mut record = self.record.clone();
        if let Some(password) = password {
            record.password = password;
        }
        if let Some(admin) = admin {
            record.admin = admin;
        }
        self.server.db.store_user(&mut record).await?;
        self.record = record;
        Ok(())
    }

    // -- network CRUD used by the service handlers ------------------------

    pub(crate) async fn create_network(&mut self, mut record: Network) -> Result<String> {
        upstream::parse_server_addr(&record.addr)?;
        self.check_network_conflicts(&record, None)?;

        self.server
            .db
            .store_network(self.record.id, &mut record)
            .await?;
        let name = record.name().to_string();
        self.insert_network(record, Vec::new());
        Ok(name)
    }

    pub(crate) async fn update_network(
        &mut self,
        network_id: i64,
        mut record: Network,
    ) -> Result<String> {
        upstream::parse_server_addr(&record.addr)?;
        self.check_network_conflicts(&record, Some(network_id))?;

        self.server
            .db
            .store_network(self.record.id, &mut record)
            .await?;
        let name = record.name().to_string();
        if let Some(net) = self.networks.get_mut(&network_id) {
            net.record = record;
        }
        // Reconcile: the endpoint or identity may have changed
        self.restart_network(network_id);
        Ok(name)
    }

    pub(crate) async fn delete_network(&mut self, network_id: i64) -> Result<String> {
        let Some(net) = self.networks.get(&network_id) else {
            return Err(Error::not_found("unknown network"));
        };
        let name = net.record.name().to_string();

        self.server.db.delete_network(network_id).await?;
        if let Some(mut net) = self.networks.remove(&network_id) {
            net.stop();
        }
        Ok(name)
    }

    fn check_network_conflicts(&self, record: &Network, skip_id: Option<i64>) -> Result<()> {
        for net in self.networks.values() {
            if Some(net.record.id) == skip_id {
                continue;
            }
            if !record.name.is_empty() && net.record.name == record.name {
                return Err(Error::Conflict(format!(
                    "a network named {:?} already exists",
                    record.name
                )));
            }
            if net.record.addr == record.addr && net.record.nick == record.nick {
                return Err(Error::Conflict(format!(
                    "a network with address {:?} and nick {:?} already exists",
                    record.addr, record.nick
                )));
            }
        }
        Ok(())
    }
}
