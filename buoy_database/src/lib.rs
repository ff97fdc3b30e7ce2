//! Strongly-typed persistence for bouncer users, networks, channels and
//! delivery receipts, behind a provider trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteDb;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database query timed out")]
    Timeout,
    #[error("schema version {0} is newer than this binary supports ({1})")]
    SchemaTooNew(i64, i64),
    #[error("unknown database driver {0:?}")]
    UnknownDriver(String),
    #[error("cannot store network: unsupported SASL state")]
    BadSaslState,
    #[error("{0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// bcrypt hash, never the cleartext
    pub password: String,
    pub realname: String,
    pub admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum SaslMechanism {
    #[strum(serialize = "PLAIN")]
    Plain,
    #[strum(serialize = "EXTERNAL")]
    External,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslPlain {
    pub username: String,
    pub password: String,
}

/// TLS client certificate authentication material
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaslExternal {
    /// X.509 certificate in DER form; empty when unset
    pub cert_blob: Vec<u8>,
    /// PKCS#8 private key in DER form; empty when unset
    pub priv_key_blob: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sasl {
    pub mechanism: Option<SaslMechanism>,
    pub plain: SaslPlain,
    pub external: SaslExternal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Network {
    pub id: i64,
    pub name: String,
    pub addr: String,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub pass: String,
    pub connect_commands: Vec<String>,
    pub sasl: Sasl,
    pub enabled: bool,
}

impl Network {
    /// The display name: the configured name, falling back to the address
    /// without its URL scheme
    pub fn name(&self) -> &str {
        if !self.name.is_empty() {
            return &self.name;
        }
        match self.addr.split_once("://") {
            Some((_, rest)) => rest,
            None => &self.addr,
        }
    }
}

/// Which inbound messages count, for the detach/reattach/relay policies
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::FromRepr,
)]
#[strum(serialize_all = "lowercase")]
#[repr(i64)]
pub enum MessageFilter {
    #[default]
    Default = 0,
    None = 1,
    Highlight = 2,
    Message = 3,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub detached: bool,
    /// Message-store bookmark taken at the moment of detach
    pub detached_internal_msgid: String,
    pub relay_detached: MessageFilter,
    pub reattach_on: MessageFilter,
    /// Zero disables auto-detach
    pub detach_after: Duration,
    pub detach_on: MessageFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub id: i64,
    pub target: String,
    /// Empty means "no specific client"
    pub client: String,
    pub internal_msgid: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub users: i64,
    pub networks: i64,
    pub channels: i64,
}

/// A database provider. Every operation runs under an internal deadline and
/// returns [`DatabaseError::Timeout`] when it expires.
#[async_trait]
pub trait Database: Send + Sync {
    async fn close(&self) -> Result<()>;

    async fn list_users(&self) -> Result<Vec<User>>;
    async fn get_user(&self, username: &str) -> Result<Option<User>>;
    /// Insert when `user.id` is zero (writing the fresh id back), update
    /// otherwise
    async fn store_user(&self, user: &mut User) -> Result<()>;
    /// Cascades through networks, channels and delivery receipts in a
    /// single transaction
    async fn delete_user(&self, id: i64) -> Result<()>;

    async fn list_networks(&self, user_id: i64) -> Result<Vec<Network>>;
    async fn store_network(&self, user_id: i64, network: &mut Network) -> Result<()>;
    /// Cascades through channels and delivery receipts in a single
    /// transaction
    async fn delete_network(&self, id: i64) -> Result<()>;

    async fn list_channels(&self, network_id: i64) -> Result<Vec<Channel>>;
    async fn store_channel(&self, network_id: i64, channel: &mut Channel) -> Result<()>;
    async fn delete_channel(&self, id: i64) -> Result<()>;

    async fn list_delivery_receipts(&self, network_id: i64) -> Result<Vec<DeliveryReceipt>>;
    /// Atomically replace the receipt set for `(network, client)`. An empty
    /// `client` means "no specific client".
    async fn store_client_delivery_receipts(
        &self,
        network_id: i64,
        client: &str,
        receipts: &mut [DeliveryReceipt],
    ) -> Result<()>;

    async fn stats(&self) -> Result<Stats>;
}

/// Open a database by driver name, as named in the server config
pub fn open(driver: &str, source: &str) -> Result<Box<dyn Database>> {
    match driver {
        "sqlite3" => Ok(Box::new(SqliteDb::open(source)?)),
        _ => Err(DatabaseError::UnknownDriver(driver.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_display_name() {
        let mut network = Network {
            addr: "ircs://irc.example.org".to_string(),
            ..Default::default()
        };
        assert_eq!(network.name(), "irc.example.org");

        network.name = "libera".to_string();
        assert_eq!(network.name(), "libera");

        let bare = Network {
            addr: "irc.example.org".to_string(),
            ..Default::default()
        };
        assert_eq!(bare.name(), "irc.example.org");
    }

    #[test]
    fn filters_parse_and_display() {
        assert_eq!(
            "highlight".parse::<MessageFilter>().unwrap(),
            MessageFilter::Highlight
        );
        assert!("loud".parse::<MessageFilter>().is_err());
        assert_eq!(MessageFilter::Message.to_string(), "message");
        assert_eq!(MessageFilter::from_repr(2), Some(MessageFilter::Highlight));
        assert_eq!(MessageFilter::from_repr(9), None);
    }

    #[test]
    fn unknown_driver() {
        assert!(matches!(
            open("postgres", ""),
            Err(DatabaseError::UnknownDriver(_))
        ));
    }
}
