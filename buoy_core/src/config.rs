//! Server configuration, produced by the external config loader and
//! consumed by the core.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_listen() -> Vec<String> {
    vec![":6667".to_string()]
}

fn default_sql_driver() -> String {
    "sqlite3".to_string()
}

fn default_sql_source() -> String {
    "buoy.db".to_string()
}

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Addresses to listen on, `host:port`; an empty host binds all
    /// interfaces
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,

    /// The hostname the bouncer presents as message source
    #[serde(default = "default_hostname")]
    pub hostname: String,

    pub tls: Option<TlsConfig>,

    #[serde(default = "default_sql_driver")]
    pub sql_driver: String,

    #[serde(default = "default_sql_source")]
    pub sql_source: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            hostname: default_hostname(),
            tls: None,
            sql_driver: default_sql_driver(),
            sql_source: default_sql_source(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| crate::Error::FatalConfig(format!("cannot open config file: {e}")))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| crate::Error::FatalConfig(format!("cannot parse config file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.listen, vec![":6667"]);
        assert_eq!(config.sql_driver, "sqlite3");
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = serde_json::from_str::<Config>(r#"{"no-such-field": 1}"#);
        assert!(err.is_err());
    }
}
