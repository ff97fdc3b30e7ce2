//! The downstream side: client registration and authentication, entity
//! name marshaling across networks, state replay and command proxying.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use base64::prelude::*;
use buoy_database::{Channel, DeliveryReceipt, User};
use buoy_irc::numeric::*;
use buoy_irc::{
    now, server_time_tag, ChannelStatus, Message, Prefix, Tag, MAX_MESSAGE_LEN,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::cap::{downstream_ls, Cap, CapSet};
use crate::server::ServerShared;
use crate::upstream::SessionState;
use crate::user::{service_prefix, DownstreamId, Event, UserActor};
use crate::{is_service_nick, Error, Result};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type LineReader = tokio::io::Lines<BufReader<BoxedReader>>;

const BACKLOG_LIMIT: usize = 500;
const CHATHISTORY_LIMIT: usize = 100;

/// A downstream connection that completed registration and is ready to be
/// attached to its user actor
pub struct AttachedDownstream {
    pub(crate) lines: LineReader,
    pub(crate) writer: BoxedWriter,
    pub(crate) registration: Registration,
}

/// The outcome of the pre-registration handshake
pub struct Registration {
    pub user: User,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub client_name: String,
    pub network_name: Option<String>,
    pub caps: CapSet,
}

/// Ephemeral state for one attached downstream, owned by the user actor
pub(crate) struct DownstreamState {
    pub id: DownstreamId,
    pub nick: String,
    pub username: String,
    pub realname: String,
    pub client_name: String,
    pub caps: CapSet,
    pub network_id: Option<i64>,
    sender: mpsc::UnboundedSender<String>,
}

impl DownstreamState {
    pub fn supports(&self, cap: Cap) -> bool {
        self.caps.has(cap)
    }

    /// Source prefix for messages that appear to come from this client
    pub fn prefix(&self, hostname: &str) -> Prefix {
        Prefix::full(&self.nick, &self.username, hostname)
    }

    /// Send a message, dropping tags (and extended-join arguments) the
    /// client did not negotiate
    pub fn send(&self, msg: &Message) {
        let mut msg = msg.clone();
        msg.tags.retain(|tag| match tag.name.as_str() {
            "time" => self.supports(Cap::ServerTime),
            "batch" => self.supports(Cap::Batch),
            "label" => self.supports(Cap::LabeledResponse),
            _ => self.supports(Cap::MessageTags),
        });
        if msg.command == "JOIN" && msg.params.len() > 1 && !self.supports(Cap::ExtendedJoin) {
            msg.params.truncate(1);
        }
        let _ = self.sender.send(format!("{msg}\r\n"));
    }
}

// ---------------------------------------------------------------------------
// Pre-registration: CAP negotiation and authentication

/// `"alice/libera@laptop"` → `("alice", Some("libera"), "laptop")`
fn split_username(raw: &str) -> (String, Option<String>, String) {
    let (rest, client) = match raw.split_once('@') {
        Some((rest, client)) => (rest, client.to_string()),
        None => (raw, String::new()),
    };
    match rest.split_once('/') {
        Some((name, network)) => (name.to_string(), Some(network.to_string()), client),
        None => (rest.to_string(), None, client),
    }
}

struct PendingRegistration {
    nick: Option<String>,
    username: Option<String>,
    realname: String,
    pass: Option<String>,
    caps: CapSet,
    negotiating: bool,
    sasl_user: Option<User>,
    sasl_in_flight: bool,
}

/// Drive the IRC registration handshake on a fresh connection until the
/// client has authenticated, in any CAP/PASS/NICK/USER order.
pub(crate) async fn register(
    lines: &mut LineReader,
    writer: &mut BoxedWriter,
    server: &Arc<ServerShared>,
) -> Result<Registration> {
    let hostname = server.config.hostname.clone();
    let mut reg = PendingRegistration {
        nick: None,
        username: None,
        realname: String::new(),
        pass: None,
        caps: CapSet::new(),
        negotiating: false,
        sasl_user: None,
        sasl_in_flight: false,
    };

    loop {
        let line = lines
            .next_line()
            .await?
            .ok_or_else(|| Error::TransientIo("connection closed".to_string()))?;
        let Ok(msg) = line.parse::<Message>() else {
            continue;
        };

        match msg.command.as_str() {
            "CAP" => {
                let sub = msg.param(0).unwrap_or_default().to_ascii_uppercase();
                match sub.as_str() {
                    "LS" => {
                        reg.negotiating = true;
                        let line = format!(":{hostname} CAP * LS :{}\r\n", downstream_ls());
                        writer.write_all(line.as_bytes()).await?;
                    }
                    "LIST" => {
                        let caps = reg
                            .caps
                            .iter()
                            .map(Cap::name)
                            .collect::<Vec<_>>()
                            .join(" ");
                        let line = format!(":{hostname} CAP * LIST :{caps}\r\n");
                        writer.write_all(line.as_bytes()).await?;
                    }
                    "REQ" => {
                        reg.negotiating = true;
                        let requested = msg.params.last().cloned().unwrap_or_default();
                        let mut changes = Vec::new();
                        let mut ok = true;
                        for token in requested.split_whitespace() {
                            let (remove, name) = match token.strip_prefix('-') {
                                Some(name) => (true, name),
                                None => (false, token),
                            };
                            match Cap::from_name(name) {
                                Some(cap) => changes.push((remove, cap)),
                                None => ok = false,
                            }
                        }
                        if ok {
                            for (remove, cap) in changes {
                                if remove {
                                    reg.caps.unset(cap);
                                } else {
                                    reg.caps.set(cap);
                                }
                            }
                        }
                        let verb = if ok { "ACK" } else { "NAK" };
                        let line = format!(":{hostname} CAP * {verb} :{requested}\r\n");
                        writer.write_all(line.as_bytes()).await?;
                    }
                    "END" => reg.negotiating = false,
                    _ => {
                        let line =
                            format!(":{hostname} {ERR_INVALIDCAPCMD} * {sub} :Invalid CAP command\r\n");
                        writer.write_all(line.as_bytes()).await?;
                    }
                }
            }
            "PASS" => reg.pass = msg.param(0).map(str::to_string),
            "NICK" => reg.nick = msg.param(0).map(str::to_string),
            "USER" => {
                reg.username = msg.param(0).map(str::to_string);
                reg.realname = msg.param(3).unwrap_or_default().to_string();
            }
            "AUTHENTICATE" => {
                handle_authenticate(&mut reg, &msg, writer, server, &hostname).await?;
            }
            "QUIT" => {
                return Err(Error::TransientIo("client quit".to_string()));
            }
            "PING" => {
                let cookie = msg.param(0).unwrap_or_default();
                let line = format!(":{hostname} PONG {hostname} :{cookie}\r\n");
                writer.write_all(line.as_bytes()).await?;
            }
            _ => (),
        }

        if reg.negotiating || reg.sasl_in_flight {
            continue;
        }
        let (Some(nick), Some(raw_username)) = (reg.nick.clone(), reg.username.clone()) else {
            continue;
        };

        let (username, network_name, client_name) = split_username(&raw_username);

        let user = match reg.sasl_user.take() {
            Some(user) => user,
            None => {
                let Some(pass) = reg.pass.as_deref() else {
                    return fail_auth(writer, &hostname, &nick).await;
                };
                match lookup_and_verify(server, &username, pass).await {
                    Some(user) => user,
                    None => return fail_auth(writer, &hostname, &nick).await,
                }
            }
        };

        return Ok(Registration {
            user,
            nick,
            username,
            realname: reg.realname.clone(),
            client_name,
            network_name,
            caps: reg.caps.clone(),
        });
    }
}

async fn handle_authenticate(
    reg: &mut PendingRegistration,
    msg: &Message,
    writer: &mut BoxedWriter,
    server: &Arc<ServerShared>,
    hostname: &str,
) -> Result<()> {
    let arg = msg.param(0).unwrap_or_default().to_string();

    if !reg.sasl_in_flight {
        match arg.to_ascii_uppercase().as_str() {
            "PLAIN" => {
                reg.sasl_in_flight = true;
                writer.write_all(b"AUTHENTICATE +\r\n").await?;
            }
            _ => {
                let line = format!(
                    ":{hostname} {ERR_SASLFAIL} * :SASL authentication failed: unsupported mechanism\r\n"
                );
                writer.write_all(line.as_bytes()).await?;
            }
        }
        return Ok(());
    }

    reg.sasl_in_flight = false;
    let sasl_fail = |reason: &str| {
        format!(":{hostname} {ERR_SASLFAIL} * :SASL authentication failed: {reason}\r\n")
    };

    let Ok(payload) = BASE64_STANDARD.decode(arg.as_bytes()) else {
        writer.write_all(sasl_fail("invalid base64").as_bytes()).await?;
        return Ok(());
    };
    let parts: Vec<&[u8]> = payload.split(|b| *b == 0).collect();
    if parts.len() != 3 {
        writer
            .write_all(sasl_fail("invalid response").as_bytes())
            .await?;
        return Ok(());
    }
    let authcid = String::from_utf8_lossy(parts[1]).to_string();
    let password = String::from_utf8_lossy(parts[2]).to_string();

    // The authcid may carry the same suffixes as the USER field
    let (username, network_name, client_name) = split_username(&authcid);
    match lookup_and_verify(server, &username, &password).await {
        Some(user) => {
            if reg.username.is_none() {
                reg.username = Some(authcid.clone());
            } else if network_name.is_some() || !client_name.is_empty() {
                reg.username = Some(authcid.clone());
            }
            let account = &user.username;
            let line = format!(
                ":{hostname} {RPL_LOGGEDIN} * *!*@* {account} :You are now logged in as {account}\r\n"
            );
            writer.write_all(line.as_bytes()).await?;
            let line = format!(":{hostname} {RPL_SASLSUCCESS} * :SASL authentication successful\r\n");
            writer.write_all(line.as_bytes()).await?;
            reg.sasl_user = Some(user);
        }
        None => {
            writer
                .write_all(sasl_fail("invalid credentials").as_bytes())
                .await?;
        }
    }
    Ok(())
}

async fn lookup_and_verify(server: &Arc<ServerShared>, username: &str, pass: &str) -> Option<User> {
    let user = server.db.get_user(username).await.ok().flatten()?;
    match bcrypt::verify(pass, &user.password) {
        Ok(true) => Some(user),
        _ => None,
    }
}

async fn fail_auth(
    writer: &mut BoxedWriter,
    hostname: &str,
    nick: &str,
) -> Result<Registration> {
    let line = format!(":{hostname} {ERR_PASSWDMISMATCH} {nick} :Password incorrect\r\n");
    writer.write_all(line.as_bytes()).await?;
    let _ = writer
        .write_all(b"ERROR :Authentication failed\r\n")
        .await;
    Err(Error::Auth(format!("authentication failed for {nick:?}")))
}

// ---------------------------------------------------------------------------
// Attached downstream handling, inside the user actor

impl UserActor {
    pub(crate) async fn handle_downstream_attached(&mut self, attached: AttachedDownstream) {
        let AttachedDownstream {
            lines,
            writer,
            registration,
        } = attached;

        // Resolve the network binding before wiring anything up
        let network_id = match &registration.network_name {
            None => None,
            Some(name) => match self.get_network_id(name) {
                Some(id) => Some(id),
                None => {
                    let mut writer = writer;
                    let _ = writer
                        .write_all(format!("ERROR :Unknown network {name:?}\r\n").as_bytes())
                        .await;
                    return;
                }
            },
        };

        let id = self.next_downstream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(writer, rx));
        tokio::spawn(reader_task(lines, id, self.inbox_tx.clone(), self.stop.clone()));

        let ds = DownstreamState {
            id,
            nick: registration.nick,
            username: registration.username,
            realname: registration.realname,
            client_name: registration.client_name,
            caps: registration.caps,
            network_id,
            sender: tx,
        };
        tracing::info!(user = %self.record.username, nick = %ds.nick, id, "downstream attached");
        self.downstreams.insert(id, ds);
        self.server.downstream_count.fetch_add(1, Ordering::Relaxed);

        self.send_welcome(id).await;
        self.replay_state(id).await;
        self.replay_receipts(id).await;
    }

    pub(crate) async fn handle_downstream_detached(&mut self, ds_id: DownstreamId) {
        let Some(ds) = self.downstreams.remove(&ds_id) else {
            return;
        };
        self.server.downstream_count.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(user = %self.record.username, id = ds_id, "downstream detached");

        // Once the last downstream of this client is gone, remember how far
        // it has read
        let client_name = ds.client_name.clone();
        let last_of_client = !self
            .downstreams
            .values()
            .any(|other| other.client_name == client_name);
        if last_of_client {
            self.store_delivery_receipts(&client_name).await;
        }
    }

    async fn store_delivery_receipts(&mut self, client_name: &str) {
        let network_ids: Vec<i64> = self.networks.keys().copied().collect();
        for network_id in network_ids {
            let net = self.networks.get(&network_id).unwrap();
            let record = net.record.clone();
            let targets: Vec<String> = net
                .channels
                .values()
                .filter(|ch| !ch.detached)
                .map(|ch| ch.name.clone())
                .collect();

            let mut receipts = Vec::new();
            for target in targets {
                let folded = self.fold_for(network_id, &target);
                match self.msgstore.last_msg_id(&record, &folded, now()).await {
                    Ok(msgid) if !msgid.is_empty() => receipts.push(DeliveryReceipt {
                        target,
                        internal_msgid: msgid,
                        ..Default::default()
                    }),
                    _ => (),
                }
            }
            if receipts.is_empty() {
                continue;
            }
            if let Err(err) = self
                .server
                .db
                .store_client_delivery_receipts(network_id, client_name, &mut receipts)
                .await
            {
                tracing::warn!(%err, "failed to store delivery receipts");
            }
        }
    }

    async fn send_welcome(&mut self, ds_id: DownstreamId) {
        let hostname = self.server.config.hostname.clone();
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let nick = ds.nick.clone();
        let prefix = Prefix::new(&hostname);

        let network_token = ds.network_id.and_then(|id| {
            self.networks
                .get(&id)
                .map(|net| format!("NETWORK={}", net.record.name()))
        });

        let send_numeric = |code: &str, params: Vec<String>| {
            let mut all = vec![nick.clone()];
            all.extend(params);
            Message::new(code, all).with_prefix(prefix.clone())
        };

        let mut burst = vec![
            send_numeric(
                RPL_WELCOME,
                vec![format!("Welcome to buoy, {nick}")],
            ),
            send_numeric(
                RPL_YOURHOST,
                vec![format!("Your host is {hostname}, running buoy")],
            ),
            send_numeric(RPL_CREATED, vec!["Who cares when the server was created?".into()]),
            send_numeric(
                RPL_MYINFO,
                vec![hostname.clone(), "buoy".into(), "aiwroO".into(), "OovaimnqpsrtklbeI".into()],
            ),
        ];
        let mut isupport_tokens = vec![
            "CASEMAPPING=ascii".to_string(),
            format!("CHATHISTORY={CHATHISTORY_LIMIT}"),
        ];
        if let Some(token) = network_token {
            isupport_tokens.push(token);
        }
        isupport_tokens.push("are supported by this server".to_string());
        burst.push(send_numeric(RPL_ISUPPORT, isupport_tokens));
        burst.push(send_numeric(ERR_NOMOTD, vec!["No MOTD".into()]));

        for msg in burst {
            ds.send(&msg);
        }
    }

    /// JOIN + topic + NAMES for every joined channel visible to this
    /// downstream
    async fn replay_state(&mut self, ds_id: DownstreamId) {
        let mut to_forward = Vec::new();
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        for (network_id, net) in &self.networks {
            if let Some(bound) = ds.network_id {
                if bound != *network_id {
                    continue;
                }
            }
            let Some(conn) = net.conn.as_ref() else {
                continue;
            };
            for (folded, channel) in &conn.channels {
                if !channel.complete {
                    continue;
                }
                if net.channels.get(folded).is_some_and(|c| c.detached) {
                    continue;
                }
                to_forward.push((*network_id, folded.clone()));
            }
        }
        for (network_id, folded) in to_forward {
            self.forward_channel(ds_id, network_id, &folded).await;
        }
    }

    /// Replay messages that arrived after the client's delivery receipts
    async fn replay_receipts(&mut self, ds_id: DownstreamId) {
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        if ds.supports(Cap::ChatHistory) {
            // The client will pull its own history
            return;
        }
        let client_name = ds.client_name.clone();
        let bound = ds.network_id;

        let network_ids: Vec<i64> = self.networks.keys().copied().collect();
        for network_id in network_ids {
            if let Some(bound) = bound {
                if bound != network_id {
                    continue;
                }
            }
            let record = match self.networks.get(&network_id) {
                Some(net) => net.record.clone(),
                None => continue,
            };
            let receipts = match self.server.db.list_delivery_receipts(network_id).await {
                Ok(receipts) => receipts,
                Err(err) => {
                    tracing::warn!(%err, "failed to load delivery receipts");
                    continue;
                }
            };
            for receipt in receipts {
                if receipt.client != client_name {
                    continue;
                }
                let folded = self.fold_for(network_id, &receipt.target);
                let history = match self
                    .msgstore
                    .load_latest_id(&record, &folded, &receipt.internal_msgid, BACKLOG_LIMIT)
                    .await
                {
                    Ok(history) => history,
                    Err(_) => continue,
                };
                for msg in history {
                    let Some(ds) = self.downstreams.get(&ds_id) else {
                        return;
                    };
                    let marshaled = self.marshal_message(ds, network_id, msg, &[0]);
                    ds.send(&marshaled);
                }
            }
        }
    }

    // -- marshaling -------------------------------------------------------

    pub(crate) fn fold_for(&self, network_id: i64, name: &str) -> String {
        match self.networks.get(&network_id).and_then(|n| n.conn.as_ref()) {
            Some(conn) => conn.fold(name),
            None => name.to_ascii_lowercase(),
        }
    }

    /// Suffix an entity name with `/network` for downstreams not bound to
    /// a network
    pub(crate) fn marshal_entity(
        &self,
        ds: &DownstreamState,
        network_id: i64,
        name: &str,
    ) -> String {
        if ds.network_id.is_some() {
            return name.to_string();
        }
        match self.networks.get(&network_id) {
            Some(net) => format!("{}/{}", name, net.record.name()),
            None => name.to_string(),
        }
    }

    /// Reverse of [`Self::marshal_entity`]: consume the rightmost `/` after
    /// which a known network name follows. Network names may themselves
    /// contain slashes.
    pub(crate) fn unmarshal_entity(
        &self,
        ds: &DownstreamState,
        name: &str,
    ) -> Result<(i64, String)> {
        if let Some(network_id) = ds.network_id {
            return Ok((network_id, name.to_string()));
        }
        for (i, _) in name.match_indices('/').rev() {
            let suffix = &name[i + 1..];
            if let Some(network_id) = self.get_network_id(suffix) {
                return Ok((network_id, name[..i].to_string()));
            }
        }
        Err(Error::not_found(format!("unknown entity {name:?}")))
    }

    fn marshal_message(
        &self,
        ds: &DownstreamState,
        network_id: i64,
        mut msg: Message,
        param_idxs: &[usize],
    ) -> Message {
        if ds.network_id.is_some() {
            return msg;
        }
        if let Some(prefix) = &mut msg.prefix {
            // Server prefixes contain a dot and stay as they are; user
            // prefixes get the network suffix on the nick
            if !prefix.name.contains('.') {
                prefix.name = self.marshal_entity(ds, network_id, &prefix.name);
            }
        }
        for idx in param_idxs {
            if let Some(param) = msg.params.get_mut(*idx) {
                // Entities addressed to ourselves are left alone
                if ds.nick != *param {
                    *param = self.marshal_entity(ds, network_id, &param.clone());
                }
            }
        }
        msg
    }

    /// Marshal an entity that may carry leading membership prefixes, as in
    /// NAMES members (`@nick`) or WHOIS channel lists (`@#chan`)
    fn marshal_prefixed_entity(
        &self,
        ds: &DownstreamState,
        network_id: i64,
        token: &str,
    ) -> String {
        let split = token
            .find(|c: char| !"~&@%+!".contains(c))
            .unwrap_or(token.len());
        let (prefixes, bare) = token.split_at(split);
        format!("{}{}", prefixes, self.marshal_entity(ds, network_id, bare))
    }

    /// Marshal every entity in a space-separated prefixed list
    fn marshal_prefixed_list(
        &self,
        ds: &DownstreamState,
        network_id: i64,
        list: &str,
    ) -> String {
        list.split_whitespace()
            .map(|token| self.marshal_prefixed_entity(ds, network_id, token))
            .collect::<Vec<_>>()
            .join(" ")
    }

    // -- send helpers -----------------------------------------------------

    pub(crate) fn service_reply(&mut self, ds_id: DownstreamId, text: &str) {
        if let Some(ds) = self.downstreams.get(&ds_id) {
            let msg = Message::new("PRIVMSG", vec![ds.nick.clone(), text.to_string()])
                .with_prefix(service_prefix());
            ds.send(&msg);
        }
    }

    pub(crate) fn service_notice(&mut self, ds_id: DownstreamId, text: &str) {
        if let Some(ds) = self.downstreams.get(&ds_id) {
            let msg = Message::new("NOTICE", vec![ds.nick.clone(), text.to_string()])
                .with_prefix(service_prefix());
            ds.send(&msg);
        }
    }

    pub(crate) fn broadcast_to_downstreams(&mut self, msg: &Message) {
        for ds in self.downstreams.values() {
            ds.send(msg);
        }
    }

    /// Relay an upstream message to every eligible downstream, marshaling
    /// the prefix and the listed entity parameters
    pub(crate) async fn relay_marshaled(
        &mut self,
        network_id: i64,
        msg: Message,
        param_idxs: &[usize],
    ) {
        let ds_ids: Vec<DownstreamId> = self
            .downstreams
            .values()
            .filter(|ds| ds.network_id.is_none() || ds.network_id == Some(network_id))
            .map(|ds| ds.id)
            .collect();
        for ds_id in ds_ids {
            let Some(ds) = self.downstreams.get(&ds_id) else {
                continue;
            };
            let marshaled = self.marshal_message(ds, network_id, msg.clone(), param_idxs);
            ds.send(&marshaled);
        }
    }

    /// Route a numeric reply (WHO/WHOIS/NAMES) to a single downstream,
    /// retargeting it and marshaling the entity parameters it carries
    pub(crate) fn send_numeric_to(&mut self, ds_id: DownstreamId, network_id: i64, msg: Message) {
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let param_idxs: &[usize] = match msg.command.as_str() {
            "352" => &[1, 5],
            "311" | "312" | "313" | "317" | "318" | "319" | "330" | "338" | "671" | "401" => &[1],
            "353" => &[2],
            "366" | "315" => &[1],
            _ => &[],
        };
        let mut marshaled = self.marshal_message(ds, network_id, msg, param_idxs);

        // The trailing lists carry entities too: WHOIS channels in 319,
        // NAMES members in 353
        if ds.network_id.is_none() {
            let list_idx = match marshaled.command.as_str() {
                "319" => Some(2),
                "353" => Some(3),
                _ => None,
            };
            if let Some(idx) = list_idx {
                if let Some(list) = marshaled.params.get(idx).cloned() {
                    marshaled.params[idx] = self.marshal_prefixed_list(ds, network_id, &list);
                }
            }
        }

        if let Some(target) = marshaled.params.get_mut(0) {
            *target = ds.nick.clone();
        }
        ds.send(&marshaled);
    }

    pub(crate) async fn send_part_to_downstreams(&mut self, network_id: i64, channel: &str) {
        let hostname = self.server.config.hostname.clone();
        let ds_ids: Vec<DownstreamId> = self
            .downstreams
            .values()
            .filter(|ds| ds.network_id.is_none() || ds.network_id == Some(network_id))
            .map(|ds| ds.id)
            .collect();
        for ds_id in ds_ids {
            let Some(ds) = self.downstreams.get(&ds_id) else {
                continue;
            };
            let name = self.marshal_entity(ds, network_id, channel);
            let msg = Message::new("PART", vec![name, "Detached".into()])
                .with_prefix(ds.prefix(&hostname));
            ds.send(&msg);
        }
    }

    /// Send JOIN, topic and NAMES for one complete upstream channel, as
    /// seen from this downstream
    pub(crate) async fn forward_channel(
        &mut self,
        ds_id: DownstreamId,
        network_id: i64,
        folded: &str,
    ) {
        let hostname = self.server.config.hostname.clone();
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        if ds.network_id.is_some() && ds.network_id != Some(network_id) {
            return;
        }
        let Some(conn) = self.networks.get(&network_id).and_then(|n| n.conn.as_ref()) else {
            return;
        };
        let Some(channel) = conn.channels.get(folded) else {
            return;
        };
        debug_assert!(channel.complete, "tried to forward a partial channel");

        let name = self.marshal_entity(ds, network_id, &channel.name);
        let nick = ds.nick.clone();
        let prefix = Prefix::new(&hostname);
        let multi_prefix = ds.supports(Cap::MultiPrefix);

        ds.send(&Message::new("JOIN", vec![name.clone()]).with_prefix(ds.prefix(&hostname)));

        if channel.topic.is_empty() {
            ds.send(
                &Message::new(
                    RPL_NOTOPIC,
                    vec![nick.clone(), name.clone(), "No topic is set".into()],
                )
                .with_prefix(prefix.clone()),
            );
        } else {
            ds.send(
                &Message::new(
                    RPL_TOPIC,
                    vec![nick.clone(), name.clone(), channel.topic.clone()],
                )
                .with_prefix(prefix.clone()),
            );
            if let Some(who) = &channel.topic_who {
                let who = self.marshal_entity(ds, network_id, &who.name);
                ds.send(
                    &Message::new(
                        RPL_TOPICWHOTIME,
                        vec![
                            nick.clone(),
                            name.clone(),
                            who,
                            buoy_irc::unix_time(channel.topic_time).to_string(),
                        ],
                    )
                    .with_prefix(prefix.clone()),
                );
            }
        }

        self.send_names(ds_id, network_id, folded, &name, channel.status, {
            let mut members: Vec<String> = channel
                .members
                .iter()
                .map(|(member, memberships)| {
                    format!("{}{}", memberships.format(multi_prefix), member)
                })
                .collect();
            members.sort();
            members
        });
    }

    /// Emit RPL_NAMREPLY lines under the wire limit, then RPL_ENDOFNAMES
    pub(crate) fn send_names(
        &self,
        ds_id: DownstreamId,
        network_id: i64,
        _folded: &str,
        marshaled_name: &str,
        status: ChannelStatus,
        members: Vec<String>,
    ) {
        let hostname = self.server.config.hostname.clone();
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let prefix = Prefix::new(&hostname);
        let nick = ds.nick.clone();
        let status = status.symbol().to_string();

        let empty_reply = Message::new(
            RPL_NAMREPLY,
            vec![
                nick.clone(),
                status.clone(),
                marshaled_name.to_string(),
                String::new(),
            ],
        )
        .with_prefix(prefix.clone());
        let max_length = MAX_MESSAGE_LEN - 2 - empty_reply.to_string().len();

        let mut buf = String::new();
        for member in &members {
            let member = self.marshal_prefixed_entity(ds, network_id, member);
            if !buf.is_empty() && buf.len() + 1 + member.len() > max_length {
                let mut reply = empty_reply.clone();
                reply.params[3] = std::mem::take(&mut buf);
                ds.send(&reply);
            }
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(&member);
        }
        if !buf.is_empty() {
            let mut reply = empty_reply.clone();
            reply.params[3] = buf;
            ds.send(&reply);
        }

        ds.send(
            &Message::new(
                RPL_ENDOFNAMES,
                vec![
                    nick,
                    marshaled_name.to_string(),
                    "End of /NAMES list".into(),
                ],
            )
            .with_prefix(prefix),
        );
    }

    fn send_downstream_numeric(&self, ds_id: DownstreamId, code: &str, params: Vec<String>) {
        let hostname = &self.server.config.hostname;
        if let Some(ds) = self.downstreams.get(&ds_id) {
            let mut all = vec![ds.nick.clone()];
            all.extend(params);
            let msg = Message::new(code, all).with_prefix(Prefix::new(hostname));
            ds.send(&msg);
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_test_downstream(
        &mut self,
        id: DownstreamId,
        sender: mpsc::UnboundedSender<String>,
    ) {
        self.downstreams.insert(
            id,
            DownstreamState {
                id,
                nick: "alice".to_string(),
                username: "alice".to_string(),
                realname: String::new(),
                client_name: String::new(),
                caps: CapSet::new(),
                network_id: None,
                sender,
            },
        );
    }

    // -- command proxying -------------------------------------------------

    pub(crate) async fn handle_downstream_message(&mut self, ds_id: DownstreamId, msg: Message) {
        if !self.downstreams.contains_key(&ds_id) {
            return;
        }

        // Labeled commands get their ACK up front; replies correlated
        // through an upstream round-trip arrive as regular traffic
        if let Some(label) = msg.tag("label").and_then(|t| t.value.clone()) {
            let hostname = self.server.config.hostname.clone();
            if let Some(ds) = self.downstreams.get(&ds_id) {
                if ds.supports(crate::cap::Cap::LabeledResponse) {
                    let ack = Message::new("ACK", Vec::new())
                        .with_prefix(Prefix::new(&hostname))
                        .with_tag(Tag::new("label", Some(label)));
                    ds.send(&ack);
                }
            }
        }

        let command = msg.command.clone();
        match command.as_str() {
            "PING" => {
                let hostname = self.server.config.hostname.clone();
                let cookie = msg.param(0).unwrap_or_default().to_string();
                if let Some(ds) = self.downstreams.get(&ds_id) {
                    let pong = Message::new("PONG", vec![hostname.clone(), cookie])
                        .with_prefix(Prefix::new(&hostname));
                    ds.send(&pong);
                }
            }
            "PONG" => (),
            "QUIT" => {
                if let Some(ds) = self.downstreams.get(&ds_id) {
                    ds.send(&Message::new("ERROR", vec!["Closing link".into()]));
                }
                self.handle_downstream_detached(ds_id).await;
            }
            "CAP" => self.downstream_cap(ds_id, &msg),
            "AUTHENTICATE" => {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_ALREADYREGISTERED,
                    vec!["You are already connected and cannot handshake again".into()],
                );
            }
            "NICK" => {
                if let Some(new_nick) = msg.param(0).map(str::to_string) {
                    let hostname = self.server.config.hostname.clone();
                    if let Some(ds) = self.downstreams.get_mut(&ds_id) {
                        let old_prefix = ds.prefix(&hostname);
                        ds.nick = new_nick.clone();
                        let ack =
                            Message::new("NICK", vec![new_nick]).with_prefix(old_prefix);
                        ds.send(&ack);
                    }
                }
            }
            "PRIVMSG" | "NOTICE" | "TAGMSG" => self.downstream_privmsg(ds_id, msg).await,
            "JOIN" => self.downstream_join(ds_id, &msg).await,
            "PART" => self.downstream_part(ds_id, &msg).await,
            "TOPIC" => self.downstream_topic(ds_id, &msg).await,
            "MODE" => self.downstream_mode(ds_id, &msg).await,
            "NAMES" => self.downstream_names(ds_id, &msg).await,
            "WHO" => self.downstream_who(ds_id, &msg).await,
            "WHOIS" => self.downstream_whois(ds_id, &msg).await,
            "CHATHISTORY" => self.downstream_chathistory(ds_id, &msg).await,
            command => {
                tracing::debug!(%command, "unknown downstream command");
                self.send_downstream_numeric(
                    ds_id,
                    ERR_UNKNOWNCOMMAND,
                    vec![command.to_string(), "Unknown command".into()],
                );
            }
        }
    }

    fn downstream_cap(&mut self, ds_id: DownstreamId, msg: &Message) {
        let hostname = self.server.config.hostname.clone();
        let Some(ds) = self.downstreams.get_mut(&ds_id) else {
            return;
        };
        let sub = msg.param(0).unwrap_or_default().to_ascii_uppercase();
        match sub.as_str() {
            "LS" => {
                let reply = Message::new(
                    "CAP",
                    vec![ds.nick.clone(), "LS".into(), downstream_ls()],
                )
                .with_prefix(Prefix::new(&hostname));
                ds.send(&reply);
            }
            "LIST" => {
                let caps = ds.caps.iter().map(Cap::name).collect::<Vec<_>>().join(" ");
                let reply = Message::new("CAP", vec![ds.nick.clone(), "LIST".into(), caps])
                    .with_prefix(Prefix::new(&hostname));
                ds.send(&reply);
            }
            "REQ" => {
                let requested = msg.params.last().cloned().unwrap_or_default();
                let tokens: Vec<(bool, Option<Cap>)> = requested
                    .split_whitespace()
                    .map(|token| match token.strip_prefix('-') {
                        Some(name) => (true, Cap::from_name(name)),
                        None => (false, Cap::from_name(token)),
                    })
                    .collect();
                let ok = tokens.iter().all(|(_, cap)| cap.is_some());
                if ok {
                    for (remove, cap) in tokens {
                        let cap = cap.unwrap();
                        if remove {
                            ds.caps.unset(cap);
                        } else {
                            ds.caps.set(cap);
                        }
                    }
                }
                let verb = if ok { "ACK" } else { "NAK" };
                let reply = Message::new(
                    "CAP",
                    vec![ds.nick.clone(), verb.into(), requested],
                )
                .with_prefix(Prefix::new(&hostname));
                ds.send(&reply);
            }
            "END" => (),
            _ => {
                let reply = Message::new(
                    ERR_INVALIDCAPCMD,
                    vec![ds.nick.clone(), sub, "Invalid CAP command".into()],
                )
                .with_prefix(Prefix::new(&hostname));
                ds.send(&reply);
            }
        }
    }

    async fn downstream_privmsg(&mut self, ds_id: DownstreamId, msg: Message) {
        let Some(targets) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec![msg.command.clone(), "Not enough parameters".into()],
            );
            return;
        };
        let text = msg.param(1).unwrap_or_default().to_string();

        for target in targets.split(',') {
            // The service is local; NOTICEs to it are dropped
            if is_service_nick(target.split('/').next().unwrap_or(target)) {
                if msg.command == "PRIVMSG" {
                    self.handle_service_privmsg(ds_id, &text).await;
                }
                continue;
            }

            let Some(ds) = self.downstreams.get(&ds_id) else {
                return;
            };
            let (network_id, upstream_name) = match self.unmarshal_entity(ds, target) {
                Ok(resolved) => resolved,
                Err(_) => {
                    self.send_downstream_numeric(
                        ds_id,
                        ERR_NOSUCHCHANNEL,
                        vec![target.to_string(), "No such channel".into()],
                    );
                    continue;
                }
            };

            let connected = self
                .networks
                .get(&network_id)
                .and_then(|n| n.conn.as_ref())
                .is_some_and(|c| c.state == SessionState::Running);
            if !connected {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target.to_string(), "Disconnected from network".into()],
                );
                continue;
            }

            let mut upstream_msg = Message::new(
                msg.command.clone(),
                if msg.command == "TAGMSG" {
                    vec![upstream_name.clone()]
                } else {
                    vec![upstream_name.clone(), text.clone()]
                },
            );
            upstream_msg.tags = msg.client_tags();

            let net = self.networks.get(&network_id).unwrap();
            let conn = net.conn.as_ref().unwrap();
            let self_nick = conn.nick.clone();
            if !conn.caps.has(Cap::MessageTags) {
                upstream_msg.tags.clear();
            }
            if conn.send(upstream_msg.clone()).is_err() {
                self.reset_network(network_id, "outbound queue overflow").await;
                continue;
            }

            let folded = self.fold_for(network_id, &upstream_name);

            // Outgoing activity resets the auto-detach timer and re-attaches
            // a detached channel
            let detached = self
                .networks
                .get(&network_id)
                .and_then(|n| n.channels.get(&folded))
                .is_some_and(|c| c.detached);
            if detached {
                self.attach_channel(network_id, &folded).await;
            } else {
                self.reset_detach_timer(network_id, &folded);
            }

            // Record our own message and echo it to the user's other clients
            let Some(ds) = self.downstreams.get(&ds_id) else {
                return;
            };
            let mut echo = upstream_msg.clone();
            echo.prefix = Some(Prefix::full(
                &self_nick,
                &ds.username,
                &self.server.config.hostname,
            ));
            echo.tags.push(server_time_tag(now()));

            let record = self.networks.get(&network_id).unwrap().record.clone();
            if msg.command != "TAGMSG" {
                if let Err(err) = self.msgstore.append(&record, &folded, &echo).await {
                    tracing::warn!(%err, "failed to append outgoing message");
                }
            }

            let others: Vec<DownstreamId> = self
                .downstreams
                .values()
                .filter(|other| {
                    other.id != ds_id
                        && (other.network_id.is_none() || other.network_id == Some(network_id))
                })
                .map(|other| other.id)
                .collect();
            for other_id in others {
                let Some(other) = self.downstreams.get(&other_id) else {
                    continue;
                };
                let marshaled = self.marshal_message(other, network_id, echo.clone(), &[0]);
                other.send(&marshaled);
            }
        }
    }

    async fn downstream_join(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(channels) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec!["JOIN".into(), "Not enough parameters".into()],
            );
            return;
        };
        let keys: Vec<String> = msg
            .param(1)
            .map(|k| k.split(',').map(str::to_string).collect())
            .unwrap_or_default();

        for (i, target) in channels.split(',').enumerate() {
            let key = keys.get(i).cloned().unwrap_or_default();
            let Some(ds) = self.downstreams.get(&ds_id) else {
                return;
            };
            let (network_id, upstream_name) = match self.unmarshal_entity(ds, target) {
                Ok(resolved) => resolved,
                Err(_) => {
                    self.send_downstream_numeric(
                        ds_id,
                        ERR_NOSUCHCHANNEL,
                        vec![target.to_string(), "No such channel".into()],
                    );
                    continue;
                }
            };
            let folded = self.fold_for(network_id, &upstream_name);

            // Update or create the persistent channel record
            let net = self.networks.get_mut(&network_id).unwrap();
            let mut record = net
                .channels
                .get(&folded)
                .cloned()
                .unwrap_or_else(|| Channel {
                    name: upstream_name.clone(),
                    ..Default::default()
                });
            let was_detached = record.detached;
            record.detached = false;
            if !key.is_empty() {
                record.key = key.clone();
            }
            if let Err(err) = self.server.db.store_channel(network_id, &mut record).await {
                tracing::warn!(%err, "failed to store channel");
            }
            let net = self.networks.get_mut(&network_id).unwrap();
            net.channels.insert(folded.clone(), record);

            if was_detached {
                // restore the flag so attach_channel replays the backlog
                net.channels.get_mut(&folded).unwrap().detached = true;
                self.attach_channel(network_id, &folded).await;
                continue;
            }

            let joined = net
                .conn
                .as_ref()
                .and_then(|c| c.channels.get(&folded))
                .is_some_and(|c| c.complete);
            if joined {
                self.forward_channel(ds_id, network_id, &folded).await;
            } else if let Some(conn) = self.networks.get(&network_id).unwrap().conn.as_ref() {
                let mut params = vec![upstream_name.clone()];
                if !key.is_empty() {
                    params.push(key);
                }
                if conn.send(Message::new("JOIN", params)).is_err() {
                    self.reset_network(network_id, "outbound queue overflow").await;
                }
            } else {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target.to_string(), "Disconnected from network".into()],
                );
            }
        }
    }

    async fn downstream_part(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(channels) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec!["PART".into(), "Not enough parameters".into()],
            );
            return;
        };
        let reason = msg.param(1).map(str::to_string);

        for target in channels.split(',') {
            let Some(ds) = self.downstreams.get(&ds_id) else {
                return;
            };
            let Ok((network_id, upstream_name)) = self.unmarshal_entity(ds, target) else {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target.to_string(), "No such channel".into()],
                );
                continue;
            };
            let folded = self.fold_for(network_id, &upstream_name);

            let net = self.networks.get_mut(&network_id).unwrap();
            if let Some(handle) = net.detach_timers.remove(&folded) {
                handle.abort();
            }
            if let Some(channel) = net.channels.remove(&folded) {
                if let Err(err) = self.server.db.delete_channel(channel.id).await {
                    tracing::warn!(%err, "failed to delete channel");
                }
            }

            if let Some(conn) = self.networks.get(&network_id).unwrap().conn.as_ref() {
                let mut params = vec![upstream_name];
                if let Some(reason) = &reason {
                    params.push(reason.clone());
                }
                let _ = conn.send(Message::new("PART", params));
            }
        }
    }

    async fn downstream_topic(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(target) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec!["TOPIC".into(), "Not enough parameters".into()],
            );
            return;
        };
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let Ok((network_id, upstream_name)) = self.unmarshal_entity(ds, &target) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NOSUCHCHANNEL,
                vec![target.clone(), "No such channel".into()],
            );
            return;
        };

        if let Some(new_topic) = msg.param(1) {
            // setting the topic is proxied upstream
            if let Some(conn) = self.networks.get(&network_id).and_then(|n| n.conn.as_ref()) {
                let _ = conn.send(Message::new(
                    "TOPIC",
                    vec![upstream_name, new_topic.to_string()],
                ));
            } else {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target, "Disconnected from network".into()],
                );
            }
            return;
        }

        // reading it is answered from cache
        let folded = self.fold_for(network_id, &upstream_name);
        let topic = self
            .networks
            .get(&network_id)
            .and_then(|n| n.conn.as_ref())
            .and_then(|c| c.channels.get(&folded))
            .map(|ch| ch.topic.clone());
        match topic {
            Some(topic) if !topic.is_empty() => {
                self.send_downstream_numeric(ds_id, RPL_TOPIC, vec![target, topic]);
            }
            Some(_) => {
                self.send_downstream_numeric(
                    ds_id,
                    RPL_NOTOPIC,
                    vec![target, "No topic is set".into()],
                );
            }
            None => {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target, "No such channel".into()],
                );
            }
        }
    }

    async fn downstream_mode(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(target) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec!["MODE".into(), "Not enough parameters".into()],
            );
            return;
        };
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };

        if target == ds.nick {
            // own user modes: reported from the bound network when there is
            // one, not proxied
            let modes = ds
                .network_id
                .and_then(|id| self.networks.get(&id))
                .and_then(|n| n.conn.as_ref())
                .map(|c| c.modes.to_string())
                .unwrap_or_else(|| "+".to_string());
            self.send_downstream_numeric(ds_id, RPL_UMODEIS, vec![modes]);
            return;
        }

        let Ok((network_id, upstream_name)) = self.unmarshal_entity(ds, &target) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NOSUCHCHANNEL,
                vec![target.clone(), "No such channel".into()],
            );
            return;
        };
        let folded = self.fold_for(network_id, &upstream_name);

        if msg.params.len() == 1 {
            // mode query answered from cache
            let cached = self
                .networks
                .get(&network_id)
                .and_then(|n| n.conn.as_ref())
                .and_then(|c| c.channels.get(&folded))
                .map(|ch| ch.modes.format());
            if let Some((modestring, args)) = cached {
                let mut params = vec![target, modestring];
                params.extend(args);
                self.send_downstream_numeric(ds_id, RPL_CHANNELMODEIS, params);
            } else {
                self.send_downstream_numeric(
                    ds_id,
                    ERR_NOSUCHCHANNEL,
                    vec![target, "No such channel".into()],
                );
            }
            return;
        }

        if let Some(conn) = self.networks.get(&network_id).and_then(|n| n.conn.as_ref()) {
            let mut params = vec![upstream_name];
            params.extend(msg.params.iter().skip(1).cloned());
            let _ = conn.send(Message::new("MODE", params));
        } else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NOSUCHCHANNEL,
                vec![target, "Disconnected from network".into()],
            );
        }
    }

    async fn downstream_names(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(target) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                RPL_ENDOFNAMES,
                vec!["*".into(), "End of /NAMES list".into()],
            );
            return;
        };
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let Ok((network_id, upstream_name)) = self.unmarshal_entity(ds, &target) else {
            self.send_downstream_numeric(
                ds_id,
                RPL_ENDOFNAMES,
                vec![target.clone(), "End of /NAMES list".into()],
            );
            return;
        };
        let folded = self.fold_for(network_id, &upstream_name);

        let cached = self
            .networks
            .get(&network_id)
            .and_then(|n| n.conn.as_ref())
            .and_then(|c| c.channels.get(&folded))
            .filter(|ch| ch.complete)
            .map(|ch| {
                let multi_prefix = ds.supports(Cap::MultiPrefix);
                let mut members: Vec<String> = ch
                    .members
                    .iter()
                    .map(|(member, memberships)| {
                        format!("{}{}", memberships.format(multi_prefix), member)
                    })
                    .collect();
                members.sort();
                (ch.status, members)
            });

        if let Some((status, members)) = cached {
            self.send_names(ds_id, network_id, &folded, &target, status, members);
            return;
        }

        // unknown channel: proxy the NAMES upstream
        if let Some(conn) = self
            .networks
            .get_mut(&network_id)
            .and_then(|n| n.conn.as_mut())
        {
            if conn.send(Message::new("NAMES", vec![upstream_name])).is_ok() {
                conn.pending_names.push_back(ds_id);
                return;
            }
        }
        self.send_downstream_numeric(
            ds_id,
            RPL_ENDOFNAMES,
            vec![target, "End of /NAMES list".into()],
        );
    }

    async fn downstream_who(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(mask) = msg.param(0).map(str::to_string) else {
            self.send_downstream_numeric(
                ds_id,
                "315",
                vec!["*".into(), "End of /WHO list".into()],
            );
            return;
        };
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let Ok((network_id, upstream_mask)) = self.unmarshal_entity(ds, &mask) else {
            self.send_downstream_numeric(
                ds_id,
                "315",
                vec![mask.clone(), "End of /WHO list".into()],
            );
            return;
        };

        if let Some(conn) = self
            .networks
            .get_mut(&network_id)
            .and_then(|n| n.conn.as_mut())
        {
            let mut params = vec![upstream_mask];
            params.extend(msg.params.iter().skip(1).cloned());
            if conn.send(Message::new("WHO", params)).is_ok() {
                conn.pending_who.push_back(ds_id);
                return;
            }
        }
        self.send_downstream_numeric(ds_id, "315", vec![mask, "End of /WHO list".into()]);
    }

    async fn downstream_whois(&mut self, ds_id: DownstreamId, msg: &Message) {
        let Some(mask) = msg.params.last().cloned() else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NEEDMOREPARAMS,
                vec!["WHOIS".into(), "Not enough parameters".into()],
            );
            return;
        };
        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let Ok((network_id, upstream_mask)) = self.unmarshal_entity(ds, &mask) else {
            self.send_downstream_numeric(
                ds_id,
                ERR_NOSUCHNICK,
                vec![mask.clone(), "No such nick/channel".into()],
            );
            return;
        };

        if let Some(conn) = self
            .networks
            .get_mut(&network_id)
            .and_then(|n| n.conn.as_mut())
        {
            if conn
                .send(Message::new("WHOIS", vec![upstream_mask]))
                .is_ok()
            {
                conn.pending_whois.push_back(ds_id);
                return;
            }
        }
        self.send_downstream_numeric(
            ds_id,
            ERR_NOSUCHNICK,
            vec![mask, "No such nick/channel".into()],
        );
    }

    async fn downstream_chathistory(&mut self, ds_id: DownstreamId, msg: &Message) {
        let fail = |actor: &Self, ds_id, code: &str, sub: &str, target: &str| {
            if let Some(ds) = actor.downstreams.get(&ds_id) {
                let reply = Message::new(
                    "FAIL",
                    vec![
                        "CHATHISTORY".into(),
                        code.to_string(),
                        sub.to_string(),
                        target.to_string(),
                        "Messages could not be retrieved".into(),
                    ],
                );
                ds.send(&reply);
            }
        };

        let sub = msg.param(0).unwrap_or_default().to_ascii_uppercase();
        let Some(target) = msg.param(1).map(str::to_string) else {
            fail(self, ds_id, "INVALID_PARAMS", &sub, "*");
            return;
        };
        let criterion = msg.param(2).unwrap_or_default().to_string();
        let limit = msg
            .param(3)
            .or(msg.param(2))
            .and_then(|l| l.parse::<usize>().ok())
            .unwrap_or(CHATHISTORY_LIMIT)
            .min(CHATHISTORY_LIMIT);

        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let Ok((network_id, upstream_name)) = self.unmarshal_entity(ds, &target) else {
            fail(self, ds_id, "INVALID_TARGET", &sub, &target);
            return;
        };
        let folded = self.fold_for(network_id, &upstream_name);
        let record = match self.networks.get(&network_id) {
            Some(net) => net.record.clone(),
            None => {
                fail(self, ds_id, "INVALID_TARGET", &sub, &target);
                return;
            }
        };

        let parse_ts = |criterion: &str| {
            criterion
                .strip_prefix("timestamp=")
                .and_then(buoy_irc::parse_server_time)
        };

        let history = match sub.as_str() {
            "BEFORE" => match parse_ts(&criterion) {
                Some(t) => {
                    self.msgstore
                        .load_before_time(&record, &folded, t, limit)
                        .await
                }
                None => {
                    fail(self, ds_id, "INVALID_PARAMS", &sub, &target);
                    return;
                }
            },
            "AFTER" => match parse_ts(&criterion) {
                Some(t) => {
                    self.msgstore
                        .load_after_time(&record, &folded, t, limit)
                        .await
                }
                None => {
                    fail(self, ds_id, "INVALID_PARAMS", &sub, &target);
                    return;
                }
            },
            "LATEST" => {
                let msgid = criterion.strip_prefix("msgid=").unwrap_or_default();
                if criterion == "*" || !msgid.is_empty() {
                    self.msgstore
                        .load_latest_id(&record, &folded, msgid, limit)
                        .await
                } else {
                    fail(self, ds_id, "INVALID_PARAMS", &sub, &target);
                    return;
                }
            }
            _ => {
                fail(self, ds_id, "UNKNOWN_COMMAND", &sub, &target);
                return;
            }
        };

        let history = match history {
            Ok(history) => history,
            Err(_) => {
                fail(self, ds_id, "MESSAGE_ERROR", &sub, &target);
                return;
            }
        };

        let Some(ds) = self.downstreams.get(&ds_id) else {
            return;
        };
        let batch_id = crate::random_id();
        let use_batch = ds.supports(Cap::Batch);
        if use_batch {
            let start = Message::new(
                "BATCH",
                vec![
                    format!("+{batch_id}"),
                    "chathistory".into(),
                    target.clone(),
                ],
            );
            ds.send(&start);
        }
        for msg in history {
            let Some(ds) = self.downstreams.get(&ds_id) else {
                return;
            };
            let mut marshaled = self.marshal_message(ds, network_id, msg, &[0]);
            if use_batch {
                marshaled.tags.push(Tag::new("batch", Some(batch_id.clone())));
            }
            ds.send(&marshaled);
        }
        if use_batch {
            if let Some(ds) = self.downstreams.get(&ds_id) {
                ds.send(&Message::new("BATCH", vec![format!("-{batch_id}")]));
            }
        }
    }
}

async fn writer_task(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
}

async fn reader_task(
    mut lines: LineReader,
    id: DownstreamId,
    inbox: mpsc::Sender<Event>,
    stop: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Ok(msg) = line.parse::<Message>() {
                        if inbox.send(Event::DownstreamMessage { id, msg }).await.is_err() {
                            return;
                        }
                    }
                }
                _ => break,
            },
        }
    }
    let _ = inbox.send(Event::DownstreamDetached { id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::UpstreamSession;
    use crate::user::NetworkState;
    use buoy_database::Network;
    use std::collections::HashMap;

    fn network(id: i64, name: &str) -> Network {
        Network {
            id,
            name: name.to_string(),
            addr: format!("ircs://irc.{name}.example"),
            enabled: true,
            ..Default::default()
        }
    }

    fn attach_test_downstream(
        actor: &mut UserActor,
        id: DownstreamId,
        network_id: Option<i64>,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        actor.downstreams.insert(
            id,
            DownstreamState {
                id,
                nick: "alice".to_string(),
                username: "alice".to_string(),
                realname: "Alice".to_string(),
                client_name: String::new(),
                caps: CapSet::new(),
                network_id,
                sender: tx,
            },
        );
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line.trim_end().to_string());
        }
        out
    }

    #[tokio::test]
    async fn marshal_and_unmarshal_entities() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        actor
            .networks
            .insert(2, NetworkState::for_test(network(2, "oftc"), HashMap::new()));
        let _rx = attach_test_downstream(&mut actor, 1, None);
        let _bound_rx = attach_test_downstream(&mut actor, 2, Some(1));

        let ds = actor.downstreams.get(&1).unwrap();
        assert_eq!(actor.marshal_entity(ds, 1, "#chan"), "#chan/libera");
        assert_eq!(actor.marshal_entity(ds, 2, "#chan"), "#chan/oftc");
        assert_eq!(
            actor.unmarshal_entity(ds, "#chan/libera").unwrap(),
            (1, "#chan".to_string())
        );
        assert!(actor.unmarshal_entity(ds, "#chan/unknown").is_err());

        // bound downstreams pass names through unchanged
        let bound = actor.downstreams.get(&2).unwrap();
        assert_eq!(actor.marshal_entity(bound, 1, "#chan"), "#chan");
        assert_eq!(
            actor.unmarshal_entity(bound, "#chan").unwrap(),
            (1, "#chan".to_string())
        );
    }

    #[tokio::test]
    async fn relay_marshals_for_unbound_downstreams() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        actor
            .networks
            .insert(2, NetworkState::for_test(network(2, "oftc"), HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, None);

        let msg: Message = ":bob!b@host PRIVMSG #chan :hi there".parse().unwrap();
        actor.relay_marshaled(1, msg, &[0]).await;

        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![":bob/libera!b@host PRIVMSG #chan/libera :hi there"]
        );
    }

    #[tokio::test]
    async fn privmsg_routed_to_unmarshaled_upstream() {
        let mut actor = UserActor::for_test();
        let record = network(1, "libera");
        let mut net = NetworkState::for_test(record.clone(), HashMap::new());
        let (up_tx, mut up_rx) = mpsc::channel(16);
        let mut session = UpstreamSession::new(&record, "alice", up_tx);
        session.state = SessionState::Running;
        net.conn = Some(session);
        actor.networks.insert(1, net);
        let _rx = attach_test_downstream(&mut actor, 1, None);

        let msg: Message = "PRIVMSG #chan/libera :hello there".parse().unwrap();
        actor.downstream_privmsg(1, msg).await;

        let sent = up_rx.try_recv().unwrap();
        assert_eq!(sent.to_string(), "PRIVMSG #chan :hello there");
    }

    #[tokio::test]
    async fn messages_to_disconnected_networks_are_rejected() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, None);

        let msg: Message = "PRIVMSG #chan/libera :hello".parse().unwrap();
        actor.downstream_privmsg(1, msg).await;

        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains(ERR_NOSUCHCHANNEL));
    }

    #[tokio::test]
    async fn proxied_namreply_marshals_members() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, None);

        let msg: Message = ":irc.libera.example 353 alice = #chan :@bob +carol dave"
            .parse()
            .unwrap();
        actor.send_numeric_to(1, 1, msg);

        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![
                ":irc.libera.example 353 alice = #chan/libera :@bob/libera +carol/libera dave/libera"
            ]
        );
    }

    #[tokio::test]
    async fn proxied_whois_channels_marshals_channel_list() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, None);

        let msg: Message = ":irc.libera.example 319 alice bob :@#chan #other"
            .parse()
            .unwrap();
        actor.send_numeric_to(1, 1, msg);

        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![":irc.libera.example 319 alice bob/libera :@#chan/libera #other/libera"]
        );
    }

    #[tokio::test]
    async fn proxied_numerics_pass_through_for_bound_downstreams() {
        let mut actor = UserActor::for_test();
        actor
            .networks
            .insert(1, NetworkState::for_test(network(1, "libera"), HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, Some(1));

        let msg: Message = ":irc.libera.example 353 alice = #chan :@bob +carol"
            .parse()
            .unwrap();
        actor.send_numeric_to(1, 1, msg);

        let lines = drain(&mut rx);
        assert_eq!(
            lines,
            vec![":irc.libera.example 353 alice = #chan :@bob +carol"]
        );
    }

    #[tokio::test]
    async fn prefix_dispatch_reaches_network_status() {
        let mut actor = UserActor::for_test();
        let mut record = network(1, "libera");
        record.enabled = false;
        actor
            .networks
            .insert(1, NetworkState::for_test(record, HashMap::new()));
        let mut rx = attach_test_downstream(&mut actor, 1, None);

        actor.handle_service_privmsg(1, "net stat").await;

        let lines = drain(&mut rx);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(":BouncerServ!BouncerServ@BouncerServ PRIVMSG alice :"));
        assert!(lines[0].contains("libera"));
        assert!(lines[0].contains("disabled"));
    }

    #[tokio::test]
    async fn auto_detach_marks_channel_once_and_bookmarks() {
        let mut actor = UserActor::for_test();
        let record = network(1, "libera");
        let mut channels = HashMap::new();
        channels.insert(
            "#chan".to_string(),
            Channel {
                name: "#chan".to_string(),
                detach_after: std::time::Duration::from_secs(60),
                ..Default::default()
            },
        );
        actor
            .networks
            .insert(1, NetworkState::for_test(record.clone(), channels));

        let msg: Message = ":bob!b@h PRIVMSG #chan :one".parse().unwrap();
        actor.msgstore.append(&record, "#chan", &msg).await.unwrap();
        let msg: Message = ":bob!b@h PRIVMSG #chan :two".parse().unwrap();
        let last_id = actor.msgstore.append(&record, "#chan", &msg).await.unwrap();

        actor.handle_detach_timeout(1, "#chan".to_string()).await;

        let channel = &actor.networks[&1].channels["#chan"];
        assert!(channel.detached);
        assert_eq!(channel.detached_internal_msgid, last_id);

        // a second expiry is a no-op
        let before = channel.clone();
        actor.handle_detach_timeout(1, "#chan".to_string()).await;
        assert_eq!(actor.networks[&1].channels["#chan"], before);
    }

    #[test]
    fn split_username_forms() {
        assert_eq!(
            split_username("alice"),
            ("alice".to_string(), None, String::new())
        );
        assert_eq!(
            split_username("alice/libera"),
            ("alice".to_string(), Some("libera".to_string()), String::new())
        );
        assert_eq!(
            split_username("alice/libera@laptop"),
            (
                "alice".to_string(),
                Some("libera".to_string()),
                "laptop".to_string()
            )
        );
        // network names may contain slashes
        assert_eq!(
            split_username("alice/net/with/slashes"),
            (
                "alice".to_string(),
                Some("net/with/slashes".to_string()),
                String::new()
            )
        );
    }
}
