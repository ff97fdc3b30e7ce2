//! Handlers for the service command surface.

use buoy_database::{MessageFilter, Network, SaslMechanism, User};
use buoy_irc::Message;
use sha1::Digest;

use crate::certfp;
use crate::service::FlagSet;
use crate::upstream::SessionState;
use crate::user::{service_prefix, DownstreamId, Event, UserActor};
use crate::{Error, Result};

fn network_flag_set() -> FlagSet {
    FlagSet::new()
        .string_flag("addr")
        .string_flag("name")
        .string_flag("nick")
        .string_flag("username")
        .string_flag("pass")
        .string_flag("realname")
        .bool_flag("enabled")
        .repeated_flag("connect-command")
}

fn apply_network_flags(fs: &FlagSet, record: &mut Network) -> Result<()> {
    if let Some(addr) = fs.string("addr") {
        if let Some((scheme, _)) = addr.split_once("://") {
            match scheme {
                "ircs" | "irc+insecure" | "unix" => (),
                _ => {
                    return Err(Error::parse(format!(
                        "unknown scheme {scheme:?} (supported schemes: ircs, irc+insecure, unix)"
                    )))
                }
            }
        }
        record.addr = addr;
    }
    if let Some(name) = fs.string("name") {
        record.name = name;
    }
    if let Some(nick) = fs.string("nick") {
        record.nick = nick;
    }
    if let Some(username) = fs.string("username") {
        record.username = username;
    }
    if let Some(pass) = fs.string("pass") {
        record.pass = pass;
    }
    if let Some(realname) = fs.string("realname") {
        record.realname = realname;
    }
    if let Some(enabled) = fs.boolean("enabled") {
        record.enabled = enabled;
    }
    if let Some(commands) = fs.repeated("connect-command") {
        if commands.len() == 1 && commands[0].is_empty() {
            record.connect_commands.clear();
        } else {
            for command in &commands {
                command.parse::<Message>().map_err(|err| {
                    Error::parse(format!(
                        "flag -connect-command must be a valid raw irc command string: {command:?}: {err}"
                    ))
                })?;
            }
            record.connect_commands = commands;
        }
    }
    Ok(())
}

fn parse_filter(s: &str) -> Result<MessageFilter> {
    s.parse()
        .map_err(|_| Error::parse(format!("unknown filter: {s:?}")))
}

fn parse_detach_duration(s: &str) -> Result<std::time::Duration> {
    let parsed = if s == "0" {
        Ok(std::time::Duration::ZERO)
    } else {
        humantime::parse_duration(s).map_err(|_| ())
    };
    parsed.map_err(|_| {
        Error::parse(format!(
            "unknown duration for -detach-after {s:?} (duration format: 0, 300s, 22h30m, ...)"
        ))
    })
}

impl UserActor {
    // -- network ----------------------------------------------------------

    pub(super) async fn service_network_create(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let fs = network_flag_set().parse(&params)?;
        let Some(addr) = fs.string("addr") else {
            return Err(Error::parse("flag -addr is required"));
        };

        let mut record = Network {
            addr,
            enabled: true,
            ..Default::default()
        };
        apply_network_flags(&fs, &mut record)?;

        let name = self
            .create_network(record)
            .await
            .map_err(|err| Error::parse(format!("could not create network: {err}")))?;

        self.service_reply(ds_id, &format!("created network {name:?}"));
        Ok(())
    }

    pub(super) async fn service_network_status(
        &mut self,
        ds_id: DownstreamId,
        _params: Vec<String>,
    ) -> Result<()> {
        let (ds_nick, ds_network) = match self.downstreams.get(&ds_id) {
            Some(ds) => (ds.nick.clone(), ds.network_id),
            None => return Ok(()),
        };

        let mut network_ids: Vec<i64> = self.networks.keys().copied().collect();
        network_ids.sort_unstable();

        let mut lines = Vec::new();
        for network_id in network_ids {
            let net = &self.networks[&network_id];
            let mut statuses = Vec::new();
            let mut details = String::new();

            match net.conn.as_ref().filter(|c| c.state == SessionState::Running) {
                Some(conn) => {
                    if ds_nick != conn.nick {
                        statuses.push(format!("connected as {}", conn.nick));
                    } else {
                        statuses.push("connected".to_string());
                    }
                    details = format!("{} channels", conn.channels.len());
                }
                None if !net.record.enabled => statuses.push("disabled".to_string()),
                None => {
                    statuses.push("disconnected".to_string());
                    if let Some(err) = &net.last_error {
                        details = err.clone();
                    }
                }
            }

            if ds_network == Some(network_id) {
                statuses.push("current".to_string());
            }

            let mut name = net.record.name().to_string();
            if name != net.record.addr {
                name = format!("{} ({})", name, net.record.addr);
            }

            let mut line = format!("{} [{}]", name, statuses.join(", "));
            if !details.is_empty() {
                line.push_str(": ");
                line.push_str(&details);
            }
            lines.push(line);
        }

        if lines.is_empty() {
            self.service_reply(
                ds_id,
                r#"No network configured, add one with "network create"."#,
            );
        } else {
            for line in lines {
                self.service_reply(ds_id, &line);
            }
        }
        Ok(())
    }

    pub(super) async fn service_network_update(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let Some((name, rest)) = params.split_first() else {
            return Err(Error::parse("expected at least one argument"));
        };
        let fs = network_flag_set().parse(rest)?;

        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let mut record = self.networks[&network_id].record.clone();
        apply_network_flags(&fs, &mut record)?;

        let name = self
            .update_network(network_id, record)
            .await
            .map_err(|err| Error::parse(format!("could not update network: {err}")))?;

        self.service_reply(ds_id, &format!("updated network {name:?}"));
        Ok(())
    }

    pub(super) async fn service_network_delete(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [name] = params.as_slice() else {
            return Err(Error::parse("expected exactly one argument"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let name = self.delete_network(network_id).await?;
        self.service_reply(ds_id, &format!("deleted network {name:?}"));
        Ok(())
    }

    pub(super) async fn service_network_quote(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [name, raw] = params.as_slice() else {
            return Err(Error::parse("expected exactly two arguments"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let msg: Message = raw
            .parse()
            .map_err(|err| Error::parse(format!("failed to parse command {raw:?}: {err}")))?;

        let net = &self.networks[&network_id];
        let Some(conn) = net.conn.as_ref() else {
            return Err(Error::UpstreamDisconnected);
        };
        conn.send(msg)?;

        let display = net.record.name().to_string();
        self.service_reply(ds_id, &format!("sent command to {display:?}"));
        Ok(())
    }

    // -- certfp -----------------------------------------------------------

    fn send_certfp_fingerprints(&mut self, ds_id: DownstreamId, cert: &[u8]) {
        let sha1_sum = sha1::Sha1::digest(cert);
        self.service_reply(
            ds_id,
            &format!("SHA-1 fingerprint: {}", certfp::hex_digest(&sha1_sum)),
        );
        let sha256_sum = sha2::Sha256::digest(cert);
        self.service_reply(
            ds_id,
            &format!("SHA-256 fingerprint: {}", certfp::hex_digest(&sha256_sum)),
        );
        let sha512_sum = sha2::Sha512::digest(cert);
        self.service_reply(
            ds_id,
            &format!("SHA-512 fingerprint: {}", certfp::hex_digest(&sha512_sum)),
        );
    }

    pub(super) async fn service_certfp_generate(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let fs = FlagSet::new()
            .string_flag("key-type")
            .string_flag("bits")
            .parse(&params)?;
        let key_type = fs.string_or("key-type", "rsa");
        let bits = fs.int_or("bits", 3072)?;

        let [name] = fs.args() else {
            return Err(Error::parse("exactly one argument is required"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        if bits <= 0 || bits > certfp::MAX_RSA_BITS as i64 {
            return Err(Error::parse("invalid value for -bits"));
        }

        let generated = certfp::generate(&key_type, bits as u32)?;

        let mut record = self.networks[&network_id].record.clone();
        record.sasl.external.cert_blob = generated.cert.clone();
        record.sasl.external.priv_key_blob = generated.priv_key;
        record.sasl.mechanism = Some(SaslMechanism::External);

        self.server
            .db
            .store_network(self.record.id, &mut record)
            .await?;
        self.networks.get_mut(&network_id).unwrap().record = record;

        self.service_reply(ds_id, "certificate generated");
        self.send_certfp_fingerprints(ds_id, &generated.cert);
        Ok(())
    }

    pub(super) async fn service_certfp_fingerprint(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [name] = params.as_slice() else {
            return Err(Error::parse("expected exactly one argument"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let net = &self.networks[&network_id];
        if net.record.sasl.mechanism != Some(SaslMechanism::External) {
            return Err(Error::parse("CertFP not set up"));
        }

        let cert = net.record.sasl.external.cert_blob.clone();
        self.send_certfp_fingerprints(ds_id, &cert);
        Ok(())
    }

    // -- sasl -------------------------------------------------------------

    pub(super) async fn service_sasl_set_plain(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [name, username, password] = params.as_slice() else {
            return Err(Error::parse("expected exactly 3 arguments"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let mut record = self.networks[&network_id].record.clone();
        record.sasl.plain.username = username.clone();
        record.sasl.plain.password = password.clone();
        record.sasl.mechanism = Some(SaslMechanism::Plain);

        self.server
            .db
            .store_network(self.record.id, &mut record)
            .await?;
        self.networks.get_mut(&network_id).unwrap().record = record;

        self.service_reply(ds_id, "credentials saved");
        Ok(())
    }

    pub(super) async fn service_sasl_reset(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [name] = params.as_slice() else {
            return Err(Error::parse("expected exactly one argument"));
        };
        let Some(network_id) = self.get_network_id(name) else {
            return Err(Error::not_found(format!("unknown network {name:?}")));
        };

        let mut record = self.networks[&network_id].record.clone();
        record.sasl = Default::default();

        self.server
            .db
            .store_network(self.record.id, &mut record)
            .await?;
        self.networks.get_mut(&network_id).unwrap().record = record;

        self.service_reply(ds_id, "credentials reset");
        Ok(())
    }

    // -- user -------------------------------------------------------------

    pub(super) async fn service_user_create(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let fs = FlagSet::new()
            .string_flag("username")
            .string_flag("password")
            .string_flag("realname")
            .presence_flag("admin")
            .parse(&params)?;

        let username = fs.string("username").unwrap_or_default();
        let password = fs.string("password").unwrap_or_default();
        if username.is_empty() {
            return Err(Error::parse("flag -username is required"));
        }
        if password.is_empty() {
            return Err(Error::parse("flag -password is required"));
        }

        let hashed = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
            .map_err(|err| Error::parse(format!("failed to hash password: {err}")))?;

        let record = User {
            username: username.clone(),
            password: hashed,
            realname: fs.string("realname").unwrap_or_default(),
            admin: fs.is_present("admin"),
            ..Default::default()
        };
        self.server
            .create_user(record)
            .await
            .map_err(|err| Error::parse(format!("could not create user: {err}")))?;

        self.service_reply(ds_id, &format!("created user {username:?}"));
        Ok(())
    }

    pub(super) async fn service_user_update(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        // a leading non-flag argument names the target user
        let (username, rest) = match params.first() {
            Some(first) if !first.starts_with('-') => {
                (Some(first.clone()), &params[1..])
            }
            _ => (None, params.as_slice()),
        };

        let fs = FlagSet::new()
            .string_flag("password")
            .string_flag("realname")
            .bool_flag("admin")
            .parse(rest)?;
        if !fs.args().is_empty() {
            return Err(Error::parse("unexpected argument"));
        }

        let password = fs.string("password");
        let realname = fs.string("realname");
        let admin = fs.boolean("admin");

        let hashed = match password {
            Some(password) => Some(
                bcrypt::hash(&password, bcrypt::DEFAULT_COST)
                    .map_err(|err| Error::parse(format!("failed to hash password: {err}")))?,
            ),
            None => None,
        };

        match username {
            Some(username) if username != self.record.username => {
                if !self.record.admin {
                    return Err(Error::Auth(
                        "you must be an admin to update other users".to_string(),
                    ));
                }
                if realname.is_some() {
                    return Err(Error::parse("cannot update -realname of other user"));
                }

                let Some(target) = self.server.get_user(&username) else {
                    return Err(Error::not_found(format!("unknown username {username:?}")));
                };

                let (done_tx, done_rx) = tokio::sync::oneshot::channel();
                let event = Event::UserUpdate {
                    password: hashed,
                    admin,
                    done: done_tx,
                };
                tokio::select! {
                    _ = self.stop.cancelled() => return Err(Error::Cancelled),
                    sent = target.inbox.send(event) => {
                        if sent.is_err() {
                            return Err(Error::not_found(format!("unknown username {username:?}")));
                        }
                    }
                }
                done_rx.await.map_err(|_| Error::Cancelled)??;

                self.service_reply(ds_id, &format!("updated user {username:?}"));
            }
            _ => {
                if admin.is_some() {
                    return Err(Error::parse("cannot update -admin of own user"));
                }

                let mut record = self.record.clone();
                if let Some(hashed) = hashed {
                    record.password = hashed;
                }
                if let Some(realname) = realname {
                    record.realname = realname;
                }
                self.server.db.store_user(&mut record).await?;
                self.record = record;

                let username = self.record.username.clone();
                self.service_reply(ds_id, &format!("updated user {username:?}"));
            }
        }
        Ok(())
    }

    pub(super) async fn service_user_delete(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [username] = params.as_slice() else {
            return Err(Error::parse("expected exactly one argument"));
        };
        if *username == self.record.username {
            return Err(Error::parse("cannot delete your own user"));
        }
        let Some(target) = self.server.get_user(username) else {
            return Err(Error::not_found(format!("unknown username {username:?}")));
        };

        self.server.stop_user(&target.username).await;
        self.server
            .db
            .delete_user(target.id)
            .await
            .map_err(|err| Error::parse(format!("failed to delete user: {err}")))?;

        self.service_reply(ds_id, &format!("deleted user {username:?}"));
        Ok(())
    }

    // -- channel ----------------------------------------------------------

    pub(super) async fn service_channel_status(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let bound_name = self
            .downstreams
            .get(&ds_id)
            .and_then(|ds| ds.network_id)
            .and_then(|id| self.networks.get(&id))
            .map(|net| net.record.name().to_string())
            .unwrap_or_default();

        let fs = FlagSet::new().string_flag("network").parse(&params)?;
        let network_name = fs.string_or("network", &bound_name);

        let network_ids: Vec<i64> = if network_name.is_empty() {
            let mut ids: Vec<i64> = self.networks.keys().copied().collect();
            ids.sort_unstable();
            ids
        } else {
            match self.get_network_id(&network_name) {
                Some(id) => vec![id],
                None => {
                    return Err(Error::not_found(format!(
                        "unknown network {network_name:?}"
                    )))
                }
            }
        };

        let mut lines = Vec::new();
        for network_id in network_ids {
            let net = &self.networks[&network_id];
            let mut channels: Vec<_> = net.channels.values().collect();
            channels.sort_by_key(|ch| ch.name.replace('#', ""));

            for channel in channels {
                let folded = channel.name.to_ascii_lowercase();
                let joined = net
                    .conn
                    .as_ref()
                    .is_some_and(|c| c.channels.contains_key(&folded));

                let mut name = channel.name.clone();
                if network_name.is_empty() {
                    name = format!("{}/{}", name, net.record.name());
                }

                let mut status = if joined {
                    "joined"
                } else if net.conn.is_some() {
                    "parted"
                } else {
                    "disconnected"
                }
                .to_string();
                if channel.detached {
                    status.push_str(", detached");
                }

                lines.push(format!("{name} [{status}]"));
            }
        }

        if lines.is_empty() {
            self.service_reply(ds_id, "No channel configured.");
        } else {
            for line in lines {
                self.service_reply(ds_id, &line);
            }
        }
        Ok(())
    }

    pub(super) async fn service_channel_update(
        &mut self,
        ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let Some((name, rest)) = params.split_first() else {
            return Err(Error::parse("expected at least one argument"));
        };
        let fs = FlagSet::new()
            .string_flag("relay-detached")
            .string_flag("reattach-on")
            .string_flag("detach-after")
            .string_flag("detach-on")
            .parse(rest)?;

        let Some(ds) = self.downstreams.get(&ds_id) else {
            return Ok(());
        };
        let (network_id, upstream_name) = self
            .unmarshal_entity(ds, name)
            .map_err(|_| Error::not_found(format!("unknown channel {name:?}")))?;
        let folded = self.fold_for(network_id, &upstream_name);

        let mut record = self
            .networks
            .get(&network_id)
            .and_then(|net| net.channels.get(&folded))
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown channel {name:?}")))?;

        if let Some(filter) = fs.string("relay-detached") {
            record.relay_detached = parse_filter(&filter)?;
        }
        if let Some(filter) = fs.string("reattach-on") {
            record.reattach_on = parse_filter(&filter)?;
        }
        if let Some(duration) = fs.string("detach-after") {
            record.detach_after = parse_detach_duration(&duration)?;
        }
        if let Some(filter) = fs.string("detach-on") {
            record.detach_on = parse_filter(&filter)?;
        }

        self.server
            .db
            .store_channel(network_id, &mut record)
            .await
            .map_err(|err| Error::parse(format!("failed to update channel: {err}")))?;
        self.networks
            .get_mut(&network_id)
            .unwrap()
            .channels
            .insert(folded.clone(), record);
        self.reset_detach_timer(network_id, &folded);

        self.service_reply(ds_id, &format!("updated channel {name:?}"));
        Ok(())
    }

    // -- server -----------------------------------------------------------

    pub(super) async fn service_server_status(
        &mut self,
        ds_id: DownstreamId,
        _params: Vec<String>,
    ) -> Result<()> {
        let db_stats = self.server.db.stats().await?;
        let server_stats = self.server.stats();
        self.service_reply(
            ds_id,
            &format!(
                "{}/{} users, {} downstreams, {} networks, {} channels",
                server_stats.users,
                db_stats.users,
                server_stats.downstreams,
                db_stats.networks,
                db_stats.channels
            ),
        );
        Ok(())
    }

    pub(super) async fn service_server_notice(
        &mut self,
        _ds_id: DownstreamId,
        params: Vec<String>,
    ) -> Result<()> {
        let [text] = params.as_slice() else {
            return Err(Error::parse("expected exactly one argument"));
        };

        tracing::info!(user = %self.record.username, "broadcasting bouncer-wide NOTICE");
        let msg = Message::new(
            "NOTICE",
            vec![
                format!("${}", self.server.config.hostname),
                text.clone(),
            ],
        )
        .with_prefix(service_prefix());

        self.server.broadcast(msg).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn network_create_flags_build_record() {
        let fs = network_flag_set()
            .parse(&params(&[
                "-addr",
                "ircs://irc.example.org",
                "-nick",
                "bob",
                "-connect-command",
                "JOIN #x",
            ]))
            .unwrap();
        let mut record = Network {
            addr: fs.string("addr").unwrap(),
            enabled: true,
            ..Default::default()
        };
        apply_network_flags(&fs, &mut record).unwrap();

        assert_eq!(record.addr, "ircs://irc.example.org");
        assert_eq!(record.nick, "bob");
        assert_eq!(record.connect_commands, vec!["JOIN #x".to_string()]);
        assert!(record.enabled);
        assert_eq!(record.name(), "irc.example.org");
    }

    #[test]
    fn bad_scheme_rejected() {
        let fs = network_flag_set()
            .parse(&params(&["-addr", "http://irc.example.org"]))
            .unwrap();
        let mut record = Network::default();
        let err = apply_network_flags(&fs, &mut record).unwrap_err();
        assert!(err.to_string().contains("unknown scheme"));
    }

    #[test]
    fn connect_command_must_parse() {
        let fs = network_flag_set()
            .parse(&params(&["-connect-command", ""]))
            .unwrap();
        let mut record = Network {
            connect_commands: vec!["JOIN #x".to_string()],
            ..Default::default()
        };
        apply_network_flags(&fs, &mut record).unwrap();
        assert!(record.connect_commands.is_empty());
    }

    #[test]
    fn detach_durations() {
        assert_eq!(
            parse_detach_duration("300s").unwrap(),
            std::time::Duration::from_secs(300)
        );
        assert_eq!(
            parse_detach_duration("22h30m").unwrap(),
            std::time::Duration::from_secs(22 * 3600 + 30 * 60)
        );
        assert_eq!(parse_detach_duration("0").unwrap(), std::time::Duration::ZERO);
        assert!(parse_detach_duration("-300s").is_err());
        assert!(parse_detach_duration("soon").is_err());
    }

    #[test]
    fn filter_parsing() {
        assert_eq!(parse_filter("none").unwrap(), MessageFilter::None);
        assert!(parse_filter("sometimes").is_err());
    }
}
