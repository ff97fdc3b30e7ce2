//! The server: accepts downstream connections, routes authenticated
//! sessions to their user actor, and fans administrative broadcasts out to
//! every user inbox.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buoy_database::{Database, User};
use buoy_irc::Message;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::downstream::{self, AttachedDownstream, BoxedReader, BoxedWriter};
use crate::msgstore::MemoryMessageStore;
use crate::user::{Event, UserActor, UserHandle};
use crate::{Error, Result};

const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub users: usize,
    pub downstreams: usize,
}

/// State shared between the listener, the user actors and the service
/// handlers
pub struct ServerShared {
    pub config: Config,
    pub db: Box<dyn Database>,
    pub(crate) users: parking_lot::Mutex<HashMap<String, UserHandle>>,
    pub(crate) downstream_count: AtomicI64,
    pub stop: CancellationToken,
}

impl ServerShared {
    pub(crate) fn get_user(&self, username: &str) -> Option<UserHandle> {
        self.users.lock().get(username).cloned()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            users: self.users.lock().len(),
            downstreams: self.downstream_count.load(Ordering::Relaxed).max(0) as usize,
        }
    }

    /// Run `f` for every known user
    pub fn for_each_user(&self, mut f: impl FnMut(&UserHandle)) {
        let handles: Vec<UserHandle> = {
            let users = self.users.lock();
            let mut handles: Vec<_> = users.values().cloned().collect();
            handles.sort_by(|a, b| a.username.cmp(&b.username));
            handles
        };
        for handle in &handles {
            f(handle);
        }
    }

    /// Deliver a broadcast through every user actor's inbox. A blocking
    /// send is always selectable against the shutdown signal; the first
    /// failure stops the fan-out and is returned, but users whose inbox
    /// already accepted the event still deliver it.
    pub async fn broadcast(&self, msg: Message) -> Result<()> {
        let handles: Vec<UserHandle> = {
            let users = self.users.lock();
            let mut handles: Vec<_> = users.values().cloned().collect();
            handles.sort_by(|a, b| a.username.cmp(&b.username));
            handles
        };

        for handle in handles {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Err(Error::Cancelled),
                sent = handle.inbox.send(Event::Broadcast(msg.clone())) => {
                    if sent.is_err() {
                        return Err(Error::not_found(format!(
                            "user {:?} is gone",
                            handle.username
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Create a user record and start its actor
    pub async fn create_user(self: &Arc<Self>, mut record: User) -> Result<UserHandle> {
        if self.get_user(&record.username).is_some() {
            return Err(Error::Conflict(format!(
                "user {:?} already exists",
                record.username
            )));
        }
        self.db.store_user(&mut record).await?;
        let handle = UserActor::spawn(
            record,
            Arc::clone(self),
            Box::new(MemoryMessageStore::new()),
        );
        self.users
            .lock()
            .insert(handle.username.clone(), handle.clone());
        Ok(handle)
    }

    /// Stop a user's actor and forget its handle. The database record is
    /// left to the caller.
    pub async fn stop_user(&self, username: &str) {
        let handle = self.users.lock().remove(username);
        if let Some(handle) = handle {
            let _ = handle.inbox.send(Event::Stop).await;
        }
    }
}

pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Open the server over an already-opened database: load every user
    /// and start their actors.
    pub async fn new(config: Config, db: Box<dyn Database>) -> Result<Self> {
        let shared = Arc::new(ServerShared {
            config,
            db,
            users: parking_lot::Mutex::new(HashMap::new()),
            downstream_count: AtomicI64::new(0),
            stop: CancellationToken::new(),
        });

        let records = shared.db.list_users().await?;
        for record in records {
            let handle = UserActor::spawn(
                record,
                Arc::clone(&shared),
                Box::new(MemoryMessageStore::new()),
            );
            shared
                .users
                .lock()
                .insert(handle.username.clone(), handle);
        }
        tracing::info!(users = shared.users.lock().len(), "server ready");

        Ok(Self { shared })
    }

    pub fn handle(&self) -> Arc<ServerShared> {
        Arc::clone(&self.shared)
    }

    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// Bind the configured listeners and accept connections until the
    /// shutdown signal fires
    pub async fn run(&self) -> Result<()> {
        let acceptor = match &self.shared.config.tls {
            Some(tls) => Some(load_tls_acceptor(&tls.cert, &tls.key)?),
            None => None,
        };

        let mut listeners = Vec::new();
        for addr in &self.shared.config.listen {
            let addr = if addr.starts_with(':') {
                format!("0.0.0.0{addr}")
            } else {
                addr.clone()
            };
            let listener = TcpListener::bind(&addr).await?;
            tracing::info!(%addr, tls = acceptor.is_some(), "listening");
            listeners.push(listener);
        }

        let mut accept_tasks = Vec::new();
        for listener in listeners {
            let shared = Arc::clone(&self.shared);
            let acceptor = acceptor.clone();
            accept_tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shared.stop.cancelled() => return,
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                tracing::debug!(%peer, "accepted downstream connection");
                                let shared = Arc::clone(&shared);
                                let acceptor = acceptor.clone();
                                tokio::spawn(async move {
                                    if let Err(err) =
                                        handle_conn(shared, acceptor, stream).await
                                    {
                                        tracing::debug!(%peer, %err, "downstream connection ended");
                                    }
                                });
                            }
                            Err(err) => {
                                tracing::warn!(%err, "accept failed");
                            }
                        },
                    }
                }
            }));
        }

        self.shared.stop.cancelled().await;
        for task in accept_tasks {
            task.abort();
        }
        Ok(())
    }
}

fn load_tls_acceptor(
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(File::open(cert_path)?))
        .map_err(|e| Error::FatalConfig(format!("cannot read TLS certificate: {e}")))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();

    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut StdBufReader::new(File::open(key_path)?))
            .map_err(|e| Error::FatalConfig(format!("cannot read TLS key: {e}")))?;
    let key = keys
        .pop()
        .map(rustls::PrivateKey)
        .ok_or_else(|| Error::FatalConfig("no PKCS#8 private key found".to_string()))?;

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::FatalConfig(format!("invalid TLS configuration: {e}")))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Drive one accepted connection: optional TLS, the registration
/// handshake, then hand-off to the user actor
async fn handle_conn(
    shared: Arc<ServerShared>,
    acceptor: Option<TlsAcceptor>,
    stream: TcpStream,
) -> Result<()> {
    let (reader, writer): (BoxedReader, BoxedWriter) = match acceptor {
        Some(acceptor) => {
            let tls = acceptor.accept(stream).await?;
            let (reader, writer) = tokio::io::split(tls);
            (Box::new(reader), Box::new(writer))
        }
        None => {
            let (reader, writer) = tokio::io::split(stream);
            (Box::new(reader), Box::new(writer))
        }
    };

    let mut lines = BufReader::new(reader).lines();
    let mut writer = writer;

    let registration = tokio::time::timeout(
        REGISTRATION_TIMEOUT,
        downstream::register(&mut lines, &mut writer, &shared),
    )
    .await
    .map_err(|_| Error::TransientIo("registration timed out".to_string()))??;

    let Some(handle) = shared.get_user(&registration.user.username) else {
        // The record exists but no actor is running for it; treat like a
        // bad login
        return Err(Error::Auth(format!(
            "no running user for {:?}",
            registration.user.username
        )));
    };

    let attached = AttachedDownstream {
        lines,
        writer,
        registration,
    };
    tokio::select! {
        _ = shared.stop.cancelled() => Err(Error::Cancelled),
        sent = handle.inbox.send(Event::DownstreamAttached(attached)) => {
            sent.map_err(|_| Error::Cancelled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buoy_database::SqliteDb;
    use tokio::sync::mpsc;

    fn test_shared() -> Arc<ServerShared> {
        Arc::new(ServerShared {
            config: Config::default(),
            db: Box::new(SqliteDb::open(":memory:").unwrap()),
            users: parking_lot::Mutex::new(HashMap::new()),
            downstream_count: AtomicI64::new(0),
            stop: CancellationToken::new(),
        })
    }

    fn fake_user(
        shared: &Arc<ServerShared>,
        username: &str,
        capacity: usize,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        shared.users.lock().insert(
            username.to_string(),
            UserHandle {
                id: 1,
                username: username.to_string(),
                inbox: tx,
            },
        );
        rx
    }

    #[tokio::test]
    async fn broadcast_reaches_all_users() {
        let shared = test_shared();
        let mut alice_rx = fake_user(&shared, "alice", 4);
        let mut bob_rx = fake_user(&shared, "bob", 4);

        let msg = Message::new("NOTICE", vec!["$localhost".into(), "hello".into()]);
        shared.broadcast(msg).await.unwrap();

        assert!(matches!(alice_rx.recv().await, Some(Event::Broadcast(_))));
        assert!(matches!(bob_rx.recv().await, Some(Event::Broadcast(_))));
    }

    #[tokio::test]
    async fn broadcast_under_cancellation() {
        let shared = test_shared();
        let mut alice_rx = fake_user(&shared, "alice", 4);
        // bob's inbox is full: the broadcast will block on it
        let bob_rx = fake_user(&shared, "bob", 1);
        shared
            .users
            .lock()
            .get("bob")
            .unwrap()
            .inbox
            .try_send(Event::Stop)
            .unwrap();

        let stop = shared.stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        });

        let msg = Message::new("NOTICE", vec!["$localhost".into(), "hello".into()]);
        let err = shared.broadcast(msg).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        // alice's inbox accepted the event before the cancellation
        assert!(matches!(alice_rx.recv().await, Some(Event::Broadcast(_))));
        drop(bob_rx);
    }

    #[tokio::test]
    async fn stats_counts_users() {
        let shared = test_shared();
        let _rx = fake_user(&shared, "alice", 4);
        let stats = shared.stats();
        assert_eq!(stats.users, 1);
        assert_eq!(stats.downstreams, 0);
    }
}
