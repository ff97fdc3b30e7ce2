//! SQLite backend. Migrations are an ordered list of scripts recorded by
//! `PRAGMA user_version`; a database newer than this list is fatal.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{named_params, Connection, OptionalExtension};

use crate::{
    Channel, Database, DatabaseError, DeliveryReceipt, MessageFilter, Network, Result, Sasl,
    SaslExternal, SaslMechanism, SaslPlain, Stats, User,
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE User (
    id INTEGER PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password TEXT,
    admin INTEGER NOT NULL DEFAULT 0,
    realname TEXT
);

CREATE TABLE Network (
    id INTEGER PRIMARY KEY,
    name TEXT,
    user INTEGER NOT NULL,
    addr TEXT NOT NULL,
    nick TEXT,
    username TEXT,
    realname TEXT,
    pass TEXT,
    connect_commands TEXT,
    sasl_mechanism TEXT,
    sasl_plain_username TEXT,
    sasl_plain_password TEXT,
    sasl_external_cert BLOB,
    sasl_external_key BLOB,
    enabled INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(user) REFERENCES User(id),
    UNIQUE(user, addr, nick),
    UNIQUE(user, name)
);

CREATE TABLE Channel (
    id INTEGER PRIMARY KEY,
    network INTEGER NOT NULL,
    name TEXT NOT NULL,
    key TEXT,
    detached INTEGER NOT NULL DEFAULT 0,
    detached_internal_msgid TEXT,
    relay_detached INTEGER NOT NULL DEFAULT 0,
    reattach_on INTEGER NOT NULL DEFAULT 0,
    detach_after INTEGER NOT NULL DEFAULT 0,
    detach_on INTEGER NOT NULL DEFAULT 0,
    FOREIGN KEY(network) REFERENCES Network(id),
    UNIQUE(network, name)
);

CREATE TABLE DeliveryReceipt (
    id INTEGER PRIMARY KEY,
    network INTEGER NOT NULL,
    target TEXT NOT NULL,
    client TEXT,
    internal_msgid TEXT NOT NULL,
    FOREIGN KEY(network) REFERENCES Network(id),
    UNIQUE(network, target, client)
);
"#;

// Slot 0 is reserved for initialising the full schema above.
const MIGRATIONS: &[&str] = &[
    "",
    "ALTER TABLE Network ADD COLUMN enabled INTEGER NOT NULL DEFAULT 1",
    "ALTER TABLE User ADD COLUMN realname TEXT",
    "ALTER TABLE Channel ADD COLUMN detached_internal_msgid TEXT",
];

pub struct SqliteDb {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDb {
    pub fn open(source: &str) -> Result<Self> {
        let conn = Connection::open(source).map_err(box_err)?;
        conn.busy_timeout(QUERY_TIMEOUT).map_err(box_err)?;
        Self::upgrade(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn upgrade(conn: &Connection) -> Result<()> {
        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(box_err)?;
        let supported = MIGRATIONS.len() as i64;

        if version == supported {
            return Ok(());
        } else if version > supported {
            return Err(DatabaseError::SchemaTooNew(version, supported));
        }

        let tx = conn.unchecked_transaction().map_err(box_err)?;
        if version == 0 {
            tx.execute_batch(SCHEMA).map_err(box_err)?;
        } else {
            for migration in &MIGRATIONS[version as usize..] {
                tx.execute_batch(migration).map_err(box_err)?;
            }
        }
        tx.execute_batch(&format!("PRAGMA user_version = {supported}"))
            .map_err(box_err)?;
        tx.commit().map_err(box_err)?;
        Ok(())
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut *conn)
        });
        match tokio::time::timeout(QUERY_TIMEOUT, task).await {
            Err(_) => Err(DatabaseError::Timeout),
            Ok(Err(join)) => Err(DatabaseError::Backend(Box::new(join))),
            Ok(Ok(result)) => result.map_err(|e| DatabaseError::Backend(Box::new(e))),
        }
    }
}

fn box_err(e: rusqlite::Error) -> DatabaseError {
    DatabaseError::Backend(Box::new(e))
}

fn to_null(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn to_null_blob(b: &[u8]) -> Option<&[u8]> {
    if b.is_empty() {
        None
    } else {
        Some(b)
    }
}

fn read_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        username: row.get("username")?,
        password: row.get::<_, Option<String>>("password")?.unwrap_or_default(),
        admin: row.get("admin")?,
        realname: row.get::<_, Option<String>>("realname")?.unwrap_or_default(),
    })
}

fn read_network(row: &rusqlite::Row<'_>) -> rusqlite::Result<Network> {
    let connect_commands: Option<String> = row.get("connect_commands")?;
    let mechanism: Option<String> = row.get("sasl_mechanism")?;
    Ok(Network {
        id: row.get("id")?,
        name: row.get::<_, Option<String>>("name")?.unwrap_or_default(),
        addr: row.get("addr")?,
        nick: row.get::<_, Option<String>>("nick")?.unwrap_or_default(),
        username: row.get::<_, Option<String>>("username")?.unwrap_or_default(),
        realname: row.get::<_, Option<String>>("realname")?.unwrap_or_default(),
        pass: row.get::<_, Option<String>>("pass")?.unwrap_or_default(),
        connect_commands: connect_commands
            .map(|s| s.split("\r\n").map(String::from).collect())
            .unwrap_or_default(),
        sasl: Sasl {
            mechanism: mechanism.and_then(|m| m.parse::<SaslMechanism>().ok()),
            plain: SaslPlain {
                username: row
                    .get::<_, Option<String>>("sasl_plain_username")?
                    .unwrap_or_default(),
                password: row
                    .get::<_, Option<String>>("sasl_plain_password")?
                    .unwrap_or_default(),
            },
            external: SaslExternal {
                cert_blob: row
                    .get::<_, Option<Vec<u8>>>("sasl_external_cert")?
                    .unwrap_or_default(),
                priv_key_blob: row
                    .get::<_, Option<Vec<u8>>>("sasl_external_key")?
                    .unwrap_or_default(),
            },
        },
        enabled: row.get("enabled")?,
    })
}

fn read_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let detach_after_secs: i64 = row.get("detach_after")?;
    Ok(Channel {
        id: row.get("id")?,
        name: row.get("name")?,
        key: row.get::<_, Option<String>>("key")?.unwrap_or_default(),
        detached: row.get("detached")?,
        detached_internal_msgid: row
            .get::<_, Option<String>>("detached_internal_msgid")?
            .unwrap_or_default(),
        relay_detached: read_filter(row, "relay_detached")?,
        reattach_on: read_filter(row, "reattach_on")?,
        detach_after: Duration::from_secs(detach_after_secs.max(0) as u64),
        detach_on: read_filter(row, "detach_on")?,
    })
}

fn read_filter(row: &rusqlite::Row<'_>, column: &str) -> rusqlite::Result<MessageFilter> {
    let raw: i64 = row.get(column)?;
    Ok(MessageFilter::from_repr(raw).unwrap_or_default())
}

#[async_trait]
impl Database for SqliteDb {
    async fn close(&self) -> Result<()> {
        // Connection closes on drop; flush WAL-style state by checkpointing
        // is unnecessary for the rollback journal default.
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, username, password, admin, realname FROM User")?;
            let users = stmt
                .query_map([], read_user)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(users)
        })
        .await
    }

    async fn get_user(&self, username: &str) -> Result<Option<User>> {
        let username = username.to_string();
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, username, password, admin, realname FROM User WHERE username = ?1",
                [&username],
                read_user,
            )
            .optional()
        })
        .await
    }

    async fn store_user(&self, user: &mut User) -> Result<()> {
        let record = user.clone();
        let id = self
            .call(move |conn| {
                if record.id != 0 {
                    conn.execute(
                        "UPDATE User SET username = :username, password = :password,
                            admin = :admin, realname = :realname WHERE id = :id",
                        named_params! {
                            ":id": record.id,
                            ":username": record.username,
                            ":password": to_null(&record.password),
                            ":admin": record.admin,
                            ":realname": to_null(&record.realname),
                        },
                    )?;
                    Ok(record.id)
                } else {
                    conn.execute(
                        "INSERT INTO User (username, password, admin, realname)
                            VALUES (:username, :password, :admin, :realname)",
                        named_params! {
                            ":username": record.username,
                            ":password": to_null(&record.password),
                            ":admin": record.admin,
                            ":realname": to_null(&record.realname),
                        },
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            })
            .await?;
        user.id = id;
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM DeliveryReceipt WHERE id IN (
                    SELECT DeliveryReceipt.id
                    FROM DeliveryReceipt
                    JOIN Network ON DeliveryReceipt.network = Network.id
                    WHERE Network.user = ?1
                )",
                [id],
            )?;
            tx.execute(
                "DELETE FROM Channel WHERE id IN (
                    SELECT Channel.id
                    FROM Channel
                    JOIN Network ON Channel.network = Network.id
                    WHERE Network.user = ?1
                )",
                [id],
            )?;
            tx.execute("DELETE FROM Network WHERE user = ?1", [id])?;
            tx.execute("DELETE FROM User WHERE id = ?1", [id])?;
            tx.commit()
        })
        .await
    }

    async fn list_networks(&self, user_id: i64) -> Result<Vec<Network>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, addr, nick, username, realname, pass,
                    connect_commands, sasl_mechanism, sasl_plain_username,
                    sasl_plain_password, sasl_external_cert, sasl_external_key,
                    enabled
                FROM Network WHERE user = ?1",
            )?;
            let networks = stmt
                .query_map([user_id], read_network)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(networks)
        })
        .await
    }

    async fn store_network(&self, user_id: i64, network: &mut Network) -> Result<()> {
        // Only the credentials matching the mechanism are persisted
        let mut record = network.clone();
        match record.sasl.mechanism {
            Some(SaslMechanism::Plain) => record.sasl.external = SaslExternal::default(),
            Some(SaslMechanism::External) => record.sasl.plain = SaslPlain::default(),
            None => {
                record.sasl.plain = SaslPlain::default();
                record.sasl.external = SaslExternal::default();
            }
        }
        network.sasl = record.sasl.clone();

        let id = self
            .call(move |conn| {
                let joined_commands = record.connect_commands.join("\r\n");
                let mechanism = record.sasl.mechanism.map(|m| m.to_string());
                let name = to_null(&record.name);
                let nick = to_null(&record.nick);
                let username = to_null(&record.username);
                let realname = to_null(&record.realname);
                let pass = to_null(&record.pass);
                let connect_commands = to_null(&joined_commands);
                let plain_username = to_null(&record.sasl.plain.username);
                let plain_password = to_null(&record.sasl.plain.password);
                let external_cert = to_null_blob(&record.sasl.external.cert_blob);
                let external_key = to_null_blob(&record.sasl.external.priv_key_blob);
                let common: [(&str, &dyn rusqlite::ToSql); 13] = [
                    (":name", &name),
                    (":addr", &record.addr),
                    (":nick", &nick),
                    (":username", &username),
                    (":realname", &realname),
                    (":pass", &pass),
                    (":connect_commands", &connect_commands),
                    (":sasl_mechanism", &mechanism),
                    (":sasl_plain_username", &plain_username),
                    (":sasl_plain_password", &plain_password),
                    (":sasl_external_cert", &external_cert),
                    (":sasl_external_key", &external_key),
                    (":enabled", &record.enabled),
                ];
                let mut params = common.to_vec();
                if record.id != 0 {
                    params.push((":id", &record.id));
                    conn.execute(
                        "UPDATE Network
                        SET name = :name, addr = :addr, nick = :nick,
                            username = :username, realname = :realname, pass = :pass,
                            connect_commands = :connect_commands,
                            sasl_mechanism = :sasl_mechanism,
                            sasl_plain_username = :sasl_plain_username,
                            sasl_plain_password = :sasl_plain_password,
                            sasl_external_cert = :sasl_external_cert,
                            sasl_external_key = :sasl_external_key,
                            enabled = :enabled
                        WHERE id = :id",
                        &params[..],
                    )?;
                    Ok(record.id)
                } else {
                    params.push((":user", &user_id));
                    conn.execute(
                        "INSERT INTO Network (user, name, addr, nick, username, realname,
                            pass, connect_commands, sasl_mechanism, sasl_plain_username,
                            sasl_plain_password, sasl_external_cert, sasl_external_key,
                            enabled)
                        VALUES (:user, :name, :addr, :nick, :username, :realname,
                            :pass, :connect_commands, :sasl_mechanism, :sasl_plain_username,
                            :sasl_plain_password, :sasl_external_cert, :sasl_external_key,
                            :enabled)",
                        &params[..],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            })
            .await?;
        network.id = id;
        Ok(())
    }

    async fn delete_network(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM DeliveryReceipt WHERE network = ?1", [id])?;
            tx.execute("DELETE FROM Channel WHERE network = ?1", [id])?;
            tx.execute("DELETE FROM Network WHERE id = ?1", [id])?;
            tx.commit()
        })
        .await
    }

    async fn list_channels(&self, network_id: i64) -> Result<Vec<Channel>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, key, detached, detached_internal_msgid,
                    relay_detached, reattach_on, detach_after, detach_on
                FROM Channel WHERE network = ?1",
            )?;
            let channels = stmt
                .query_map([network_id], read_channel)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(channels)
        })
        .await
    }

    async fn store_channel(&self, network_id: i64, channel: &mut Channel) -> Result<()> {
        let record = channel.clone();
        let id = self
            .call(move |conn| {
                let detach_after_secs = record.detach_after.as_secs_f64().ceil() as i64;
                let relay_detached = record.relay_detached as i64;
                let reattach_on = record.reattach_on as i64;
                let detach_on = record.detach_on as i64;
                let key = to_null(&record.key);
                let detached_internal_msgid = to_null(&record.detached_internal_msgid);
                let common: [(&str, &dyn rusqlite::ToSql); 9] = [
                    (":network", &network_id),
                    (":name", &record.name),
                    (":key", &key),
                    (":detached", &record.detached),
                    (":detached_internal_msgid", &detached_internal_msgid),
                    (":relay_detached", &relay_detached),
                    (":reattach_on", &reattach_on),
                    (":detach_after", &detach_after_secs),
                    (":detach_on", &detach_on),
                ];
                let mut params = common.to_vec();
                if record.id != 0 {
                    params.push((":id", &record.id));
                    conn.execute(
                        "UPDATE Channel
                        SET network = :network, name = :name, key = :key,
                            detached = :detached,
                            detached_internal_msgid = :detached_internal_msgid,
                            relay_detached = :relay_detached, reattach_on = :reattach_on,
                            detach_after = :detach_after, detach_on = :detach_on
                        WHERE id = :id",
                        &params[..],
                    )?;
                    Ok(record.id)
                } else {
                    conn.execute(
                        "INSERT INTO Channel (network, name, key, detached,
                            detached_internal_msgid, relay_detached, reattach_on,
                            detach_after, detach_on)
                        VALUES (:network, :name, :key, :detached,
                            :detached_internal_msgid, :relay_detached, :reattach_on,
                            :detach_after, :detach_on)",
                        &params[..],
                    )?;
                    Ok(conn.last_insert_rowid())
                }
            })
            .await?;
        channel.id = id;
        Ok(())
    }

    async fn delete_channel(&self, id: i64) -> Result<()> {
        self.call(move |conn| {
            conn.execute("DELETE FROM Channel WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }

    async fn list_delivery_receipts(&self, network_id: i64) -> Result<Vec<DeliveryReceipt>> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, target, client, internal_msgid
                FROM DeliveryReceipt WHERE network = ?1",
            )?;
            let receipts = stmt
                .query_map([network_id], |row| {
                    Ok(DeliveryReceipt {
                        id: row.get("id")?,
                        target: row.get("target")?,
                        client: row.get::<_, Option<String>>("client")?.unwrap_or_default(),
                        internal_msgid: row.get("internal_msgid")?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(receipts)
        })
        .await
    }

    async fn store_client_delivery_receipts(
        &self,
        network_id: i64,
        client: &str,
        receipts: &mut [DeliveryReceipt],
    ) -> Result<()> {
        let client = client.to_string();
        let client_for_query = client.clone();
        let records: Vec<DeliveryReceipt> = receipts.to_vec();
        let ids = self
            .call(move |conn| {
                let client = client_for_query;
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM DeliveryReceipt WHERE network = ?1 AND client IS ?2",
                    rusqlite::params![network_id, to_null(&client)],
                )?;
                let mut ids = Vec::with_capacity(records.len());
                for rcpt in &records {
                    tx.execute(
                        "INSERT INTO DeliveryReceipt (network, target, client, internal_msgid)
                        VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![
                            network_id,
                            rcpt.target,
                            to_null(&client),
                            rcpt.internal_msgid
                        ],
                    )?;
                    ids.push(tx.last_insert_rowid());
                }
                tx.commit()?;
                Ok(ids)
            })
            .await?;
        for (rcpt, id) in receipts.iter_mut().zip(ids) {
            rcpt.id = id;
            rcpt.client = client.to_string();
        }
        Ok(())
    }

    async fn stats(&self) -> Result<Stats> {
        self.call(|conn| {
            conn.query_row(
                "SELECT
                    (SELECT COUNT(*) FROM User) AS users,
                    (SELECT COUNT(*) FROM Network) AS networks,
                    (SELECT COUNT(*) FROM Channel) AS channels",
                [],
                |row| {
                    Ok(Stats {
                        users: row.get(0)?,
                        networks: row.get(1)?,
                        channels: row.get(2)?,
                    })
                },
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_memory() -> SqliteDb {
        SqliteDb::open(":memory:").unwrap()
    }

    fn sample_network() -> Network {
        Network {
            addr: "ircs://irc.example.org".to_string(),
            nick: "bob".to_string(),
            connect_commands: vec!["JOIN #x".to_string()],
            enabled: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn store_and_get_user() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            password: "$2b$10$hash".to_string(),
            admin: true,
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        assert_ne!(user.id, 0);

        let got = db.get_user("alice").await.unwrap().unwrap();
        assert_eq!(got, user);
        assert!(db.get_user("nobody").await.unwrap().is_none());

        user.realname = "Alice".to_string();
        db.store_user(&mut user).await.unwrap();
        let got = db.get_user("alice").await.unwrap().unwrap();
        assert_eq!(got.realname, "Alice");
        assert_eq!(db.list_users().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_network_round_trip() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();

        let mut network = sample_network();
        network.sasl.mechanism = Some(SaslMechanism::Plain);
        network.sasl.plain = SaslPlain {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
        };
        db.store_network(user.id, &mut network).await.unwrap();
        assert_ne!(network.id, 0);

        let listed = db.list_networks(user.id).await.unwrap();
        assert_eq!(listed, vec![network.clone()]);

        // Switching to EXTERNAL drops the PLAIN credentials
        network.sasl.mechanism = Some(SaslMechanism::External);
        network.sasl.external.cert_blob = vec![1, 2, 3];
        network.sasl.external.priv_key_blob = vec![4, 5, 6];
        db.store_network(user.id, &mut network).await.unwrap();
        let listed = db.list_networks(user.id).await.unwrap();
        assert_eq!(listed[0].sasl.plain, SaslPlain::default());
        assert_eq!(listed[0].sasl.external.cert_blob, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn channel_round_trip() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();

        let mut channel = Channel {
            name: "#chan".to_string(),
            key: "key".to_string(),
            relay_detached: MessageFilter::Highlight,
            detach_after: Duration::from_secs(300),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();
        let listed = db.list_channels(network.id).await.unwrap();
        assert_eq!(listed, vec![channel]);
    }

    #[tokio::test]
    async fn delivery_receipts_replace_set() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();

        let mut receipts = vec![DeliveryReceipt {
            target: "#chan".to_string(),
            internal_msgid: "msg-1".to_string(),
            ..Default::default()
        }];
        db.store_client_delivery_receipts(network.id, "laptop", &mut receipts)
            .await
            .unwrap();
        assert_ne!(receipts[0].id, 0);

        let mut replacement = vec![
            DeliveryReceipt {
                target: "#chan".to_string(),
                internal_msgid: "msg-2".to_string(),
                ..Default::default()
            },
            DeliveryReceipt {
                target: "#other".to_string(),
                internal_msgid: "msg-3".to_string(),
                ..Default::default()
            },
        ];
        db.store_client_delivery_receipts(network.id, "laptop", &mut replacement)
            .await
            .unwrap();

        let listed = db.list_delivery_receipts(network.id).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.client == "laptop"));
        assert!(listed.iter().any(|r| r.internal_msgid == "msg-2"));
    }

    #[tokio::test]
    async fn delete_user_cascades() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();
        let mut channel = Channel {
            name: "#chan".to_string(),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();
        let mut receipts = vec![DeliveryReceipt {
            target: "#chan".to_string(),
            internal_msgid: "msg-1".to_string(),
            ..Default::default()
        }];
        db.store_client_delivery_receipts(network.id, "", &mut receipts)
            .await
            .unwrap();

        db.delete_user(user.id).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats, Stats::default());
        assert!(db
            .list_delivery_receipts(network.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_network_cascades() {
        let db = open_memory();
        let mut user = User {
            username: "alice".to_string(),
            ..Default::default()
        };
        db.store_user(&mut user).await.unwrap();
        let mut network = sample_network();
        db.store_network(user.id, &mut network).await.unwrap();
        let mut channel = Channel {
            name: "#chan".to_string(),
            ..Default::default()
        };
        db.store_channel(network.id, &mut channel).await.unwrap();

        db.delete_network(network.id).await.unwrap();
        let stats = db.stats().await.unwrap();
        assert_eq!(stats.networks, 0);
        assert_eq!(stats.channels, 0);
        assert_eq!(stats.users, 1);
    }

    #[test]
    fn schema_newer_than_binary_is_fatal() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 9999").unwrap();
        match SqliteDb::upgrade(&conn) {
            Err(DatabaseError::SchemaTooNew(9999, _)) => (),
            other => panic!("expected SchemaTooNew, got {other:?}"),
        }
    }
}
