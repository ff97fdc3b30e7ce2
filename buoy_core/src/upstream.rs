//! The upstream side: one IRC client session per enabled network, with
//! registration, capability and SASL negotiation, channel state tracking
//! and reconnection with back-off.
//!
//! Socket I/O runs in the per-network scheduler task; all protocol state
//! lives in the user actor and is mutated only through its inbox.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use buoy_database::{Channel, MessageFilter, Network, SaslMechanism};
use buoy_irc::numeric::*;
use buoy_irc::{
    now, server_time_tag, ChannelModeType, ChannelModes, ChannelStatus, Isupport, Membership,
    Memberships, Message, Prefix, UserModes,
};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cap::{upstream_request, Cap, CapSet};
use crate::user::{Event, UserActor};
use crate::{Error, Result};

/// High-water mark for the outbound queue; exceeding it resets the session
pub(crate) const OUTBOUND_QUEUE: usize = 512;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// A dialable upstream address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Ircs { host: String, port: u16 },
    Insecure { host: String, port: u16 },
    Unix { path: String },
}

/// Parse a network address. A bare `host[:port]` means `ircs`.
pub fn parse_server_addr(addr: &str) -> Result<ServerAddr> {
    let (scheme, rest) = match addr.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("ircs", addr),
    };

    let host_port = |default_port: u16| -> Result<(String, u16)> {
        match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse()
                    .map_err(|_| Error::FatalConfig(format!("invalid port in address {addr:?}")))?;
                Ok((host.to_string(), port))
            }
            None => Ok((rest.to_string(), default_port)),
        }
    };

    match scheme {
        "ircs" => {
            let (host, port) = host_port(6697)?;
            Ok(ServerAddr::Ircs { host, port })
        }
        "irc+insecure" => {
            let (host, port) = host_port(6667)?;
            Ok(ServerAddr::Insecure { host, port })
        }
        "unix" => Ok(ServerAddr::Unix {
            path: rest.to_string(),
        }),
        _ => Err(Error::FatalConfig(format!(
            "unknown scheme {scheme:?} (supported schemes: ircs, irc+insecure, unix)"
        ))),
    }
}

/// Ephemeral per-channel state tracked while the upstream session runs
#[derive(Debug)]
pub struct UpstreamChannel {
    pub name: String,
    pub topic: String,
    pub topic_who: Option<Prefix>,
    pub topic_time: DateTime<Utc>,
    pub status: ChannelStatus,
    pub members: HashMap<String, Memberships>,
    pub modes: ChannelModes,
    /// Flips true when the initial NAMES reply ends; joins are not
    /// forwarded downstream before that
    pub complete: bool,
}

impl UpstreamChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            topic: String::new(),
            topic_who: None,
            topic_time: buoy_irc::from_unix_time(0),
            status: ChannelStatus::Public,
            members: HashMap::new(),
            modes: ChannelModes::default(),
            complete: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Registering,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SaslState {
    None,
    Started,
    Done,
}

/// One live connection to an upstream network
pub struct UpstreamSession {
    outbound: mpsc::Sender<Message>,
    pub state: SessionState,
    pub nick: String,
    pub isupport: Isupport,
    pub caps: CapSet,
    offered_caps: HashSet<String>,
    ls_done: bool,
    cap_ended: bool,
    sasl: SaslState,
    pub channels: HashMap<String, UpstreamChannel>,
    pub modes: UserModes,
    /// Downstreams awaiting WHO / WHOIS / NAMES replies, in request order
    pub pending_who: VecDeque<u64>,
    pub pending_whois: VecDeque<u64>,
    pub pending_names: VecDeque<u64>,
}

impl UpstreamSession {
    pub(crate) fn new(record: &Network, fallback_nick: &str, outbound: mpsc::Sender<Message>) -> Self {
        let nick = if record.nick.is_empty() {
            fallback_nick.to_string()
        } else {
            record.nick.clone()
        };
        Self {
            outbound,
            state: SessionState::Registering,
            nick,
            isupport: Isupport::default(),
            caps: CapSet::new(),
            offered_caps: HashSet::new(),
            ls_done: false,
            cap_ended: false,
            sasl: SaslState::None,
            channels: HashMap::new(),
            modes: UserModes::default(),
            pending_who: VecDeque::new(),
            pending_whois: VecDeque::new(),
            pending_names: VecDeque::new(),
        }
    }

    /// Queue a message for the upstream. Returns an error when the queue
    /// has hit its high-water mark; the caller must then reset the session.
    pub(crate) fn send(&self, msg: Message) -> Result<()> {
        self.outbound
            .try_send(msg)
            .map_err(|_| Error::TransientIo("outbound queue overflow".to_string()))
    }

    pub(crate) fn fold(&self, s: &str) -> String {
        self.isupport.case_mapping.fold(s)
    }

    pub(crate) fn is_own_nick(&self, nick: &str) -> bool {
        self.fold(nick) == self.fold(&self.nick)
    }

    fn cap_end(&mut self) {
        if !self.cap_ended {
            self.cap_ended = true;
            let _ = self.send(Message::new("CAP", vec!["END".into()]));
        }
    }
}

/// Resolve a `default` filter to the concrete policy for its slot
pub(crate) fn resolve_filter(filter: MessageFilter, default: MessageFilter) -> MessageFilter {
    match filter {
        MessageFilter::Default => default,
        other => other,
    }
}

pub(crate) fn filter_matches(filter: MessageFilter, text: &str, nick: &str) -> bool {
    match filter {
        MessageFilter::Default | MessageFilter::None => false,
        MessageFilter::Message => true,
        MessageFilter::Highlight => {
            !nick.is_empty() && text.to_ascii_lowercase().contains(&nick.to_ascii_lowercase())
        }
    }
}

/// Whether the session should hold membership in a detached channel
pub(crate) fn detached_channel_needs_presence(channel: &Channel) -> bool {
    resolve_filter(channel.relay_detached, MessageFilter::Highlight) == MessageFilter::Message
}

/// Apply a modestring and its arguments to a channel, updating set modes
/// and memberships. Returns the indexes of arguments that name members and
/// therefore need entity marshaling when relayed downstream.
pub(crate) fn apply_channel_modes(
    ch: &mut UpstreamChannel,
    available_memberships: &[Membership],
    available_modes: &HashMap<char, ChannelModeType>,
    modestring: &str,
    args: &[String],
) -> Result<HashSet<usize>> {
    let mut need_marshaling = HashSet::new();
    let mut next_argument = 0;
    let mut plus_minus = None;

    'outer: for mode in modestring.chars() {
        if mode == '+' || mode == '-' {
            plus_minus = Some(mode);
            continue;
        }
        let Some(plus_minus) = plus_minus else {
            return Err(Error::parse(format!(
                "malformed modestring {modestring:?}: missing plus/minus"
            )));
        };

        for membership in available_memberships {
            if membership.mode == mode {
                let Some(member) = args.get(next_argument) else {
                    return Err(Error::parse(format!(
                        "malformed modestring {modestring:?}: missing mode argument for {plus_minus}{mode}"
                    )));
                };
                if let Some(memberships) = ch.members.get_mut(member) {
                    if plus_minus == '+' {
                        memberships.add(available_memberships, *membership);
                    } else {
                        memberships.remove(*membership);
                    }
                }
                need_marshaling.insert(next_argument);
                next_argument += 1;
                continue 'outer;
            }
        }

        let Some(mode_type) = available_modes.get(&mode) else {
            continue;
        };
        match mode_type {
            ChannelModeType::A | ChannelModeType::B => {
                if plus_minus == '+' {
                    // sensitive arguments (such as channel keys) can be
                    // omitted in RPL_CHANNELMODEIS
                    let argument = args.get(next_argument).cloned().unwrap_or_default();
                    if *mode_type == ChannelModeType::B {
                        ch.modes.0.insert(mode, argument);
                    }
                } else {
                    ch.modes.0.remove(&mode);
                }
                next_argument += 1;
            }
            ChannelModeType::C => {
                if plus_minus == '+' {
                    let argument = args.get(next_argument).cloned().unwrap_or_default();
                    ch.modes.0.insert(mode, argument);
                    next_argument += 1;
                } else {
                    ch.modes.0.remove(&mode);
                }
            }
            ChannelModeType::D => {
                if plus_minus == '+' {
                    ch.modes.0.insert(mode, String::new());
                } else {
                    ch.modes.0.remove(&mode);
                }
            }
        }
    }
    Ok(need_marshaling)
}

// ---------------------------------------------------------------------------
// Scheduler task: dialing, socket I/O and reconnect back-off

/// Dial the network and shuttle lines between the socket and the user
/// actor's inbox until the connection or the token dies. One task per
/// enabled network; reconnects with exponential back-off, reset after a
/// registration reported through `registered`.
pub(crate) async fn network_task(
    network_id: i64,
    record: Network,
    inbox: mpsc::Sender<Event>,
    stop: CancellationToken,
    registered: Arc<AtomicBool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let error = match dial(&record).await {
            Err(err) => Some(err.to_string()),
            Ok((reader, writer)) => {
                let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
                if inbox
                    .send(Event::UpstreamConnected {
                        network_id,
                        outbound: out_tx,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                run_io(reader, writer, network_id, &inbox, &stop, out_rx).await
            }
        };

        if stop.is_cancelled()
            || inbox
                .send(Event::UpstreamDisconnected { network_id, error })
                .await
                .is_err()
        {
            return;
        }

        if registered.swap(false, Ordering::Relaxed) {
            backoff = INITIAL_BACKOFF;
        } else {
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(backoff) => (),
        }
    }
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

async fn dial(record: &Network) -> Result<(BoxedReader, BoxedWriter)> {
    match parse_server_addr(&record.addr)? {
        ServerAddr::Insecure { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
        ServerAddr::Unix { path } => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
        ServerAddr::Ircs { host, port } => {
            let config = tls_client_config(record)?;
            let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
            let server_name = rustls::ServerName::try_from(host.as_str())
                .map_err(|_| Error::FatalConfig(format!("invalid server name {host:?}")))?;
            let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
            let stream = connector.connect(server_name, tcp).await?;
            let (reader, writer) = tokio::io::split(stream);
            Ok((Box::new(reader), Box::new(writer)))
        }
    }
}

fn tls_client_config(record: &Network) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .map_err(|e| Error::TransientIo(format!("failed to load root certificates: {e}")))?;
    for cert in native {
        let _ = roots.add(&rustls::Certificate(cert.0));
    }

    let builder = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);

    let external = &record.sasl.external;
    if record.sasl.mechanism == Some(SaslMechanism::External) && !external.cert_blob.is_empty() {
        builder
            .with_client_auth_cert(
                vec![rustls::Certificate(external.cert_blob.clone())],
                rustls::PrivateKey(external.priv_key_blob.clone()),
            )
            .map_err(|e| Error::FatalConfig(format!("invalid CertFP material: {e}")))
    } else {
        Ok(builder.with_no_client_auth())
    }
}

async fn run_io(
    reader: BoxedReader,
    mut writer: BoxedWriter,
    network_id: i64,
    inbox: &mpsc::Sender<Event>,
    stop: &CancellationToken,
    mut out_rx: mpsc::Receiver<Message>,
) -> Option<String> {
    let mut lines = BufReader::new(reader).lines();

    loop {
        tokio::select! {
            _ = stop.cancelled() => return None,
            out = out_rx.recv() => match out {
                // The actor dropped the sender: session reset
                None => return None,
                Some(msg) => {
                    let line = format!("{msg}\r\n");
                    if let Err(err) = writer.write_all(line.as_bytes()).await {
                        return Some(err.to_string());
                    }
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Ok(msg) = line.parse::<Message>() {
                        if inbox
                            .send(Event::UpstreamMessage { network_id, msg })
                            .await
                            .is_err()
                        {
                            return None;
                        }
                    }
                }
                Ok(None) => return Some("connection closed".to_string()),
                Err(err) => return Some(err.to_string()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol handling, run inside the user actor

impl UserActor {
    pub(crate) async fn handle_upstream_connected(
        &mut self,
        network_id: i64,
        outbound: mpsc::Sender<Message>,
    ) {
        let Some(net) = self.networks.get_mut(&network_id) else {
            return;
        };

        let session = UpstreamSession::new(&net.record, &self.record.username, outbound);

        let _ = session.send(Message::new("CAP", vec!["LS".into(), "302".into()]));
        if !net.record.pass.is_empty() {
            let _ = session.send(Message::new("PASS", vec![net.record.pass.clone()]));
        }
        let _ = session.send(Message::new("NICK", vec![session.nick.clone()]));
        let username = if net.record.username.is_empty() {
            self.record.username.clone()
        } else {
            net.record.username.clone()
        };
        let realname = if net.record.realname.is_empty() {
            if self.record.realname.is_empty() {
                session.nick.clone()
            } else {
                self.record.realname.clone()
            }
        } else {
            net.record.realname.clone()
        };
        let _ = session.send(Message::new(
            "USER",
            vec![username, "0".into(), "*".into(), realname],
        ));

        net.conn = Some(session);
        net.last_error = None;
    }

    pub(crate) async fn handle_upstream_disconnected(
        &mut self,
        network_id: i64,
        error: Option<String>,
    ) {
        let Some(net) = self.networks.get_mut(&network_id) else {
            return;
        };
        let was_running = net
            .conn
            .as_ref()
            .is_some_and(|c| c.state == SessionState::Running);
        net.conn = None;
        if let Some(error) = error {
            tracing::warn!(network = %net.record.name(), %error, "upstream disconnected");
            net.last_error = Some(error);
        }

        if was_running {
            // Joined channels disappear from the downstream's point of view
            let net_name = net.record.name().to_string();
            tracing::debug!(network = %net_name, "dropping upstream channel state");
        }
    }

    pub(crate) async fn handle_upstream_message(&mut self, network_id: i64, msg: Message) {
        if !self.networks.contains_key(&network_id) {
            return;
        }

        let command = msg.command.clone();
        match command.as_str() {
            "PING" => {
                if let Some(conn) = self.networks.get(&network_id).and_then(|n| n.conn.as_ref()) {
                    let _ = conn.send(Message::new("PONG", msg.params.clone()));
                }
            }
            "CAP" => self.upstream_cap(network_id, &msg).await,
            "AUTHENTICATE" => self.upstream_authenticate(network_id, &msg).await,
            RPL_LOGGEDIN => (),
            RPL_SASLSUCCESS => {
                if let Some(conn) = self
                    .networks
                    .get_mut(&network_id)
                    .and_then(|n| n.conn.as_mut())
                {
                    conn.sasl = SaslState::Done;
                    conn.cap_end();
                }
            }
            ERR_NICKLOCKED | ERR_SASLFAIL | ERR_SASLTOOLONG | ERR_SASLABORTED => {
                // Close and retry with back-off
                let net = self.networks.get_mut(&network_id).unwrap();
                let detail = msg.params.last().cloned().unwrap_or_default();
                net.last_error = Some(format!("SASL authentication failed: {detail}"));
                net.conn = None;
            }
            RPL_WELCOME => self.upstream_welcome(network_id, &msg).await,
            RPL_ISUPPORT => {
                let net = self.networks.get_mut(&network_id).unwrap();
                if let Some(conn) = net.conn.as_mut() {
                    let params = &msg.params;
                    if params.len() > 2 {
                        for token in &params[1..params.len() - 1] {
                            conn.isupport.apply_token(token);
                        }
                    }
                }
            }
            ERR_ERRONEUSNICKNAME | ERR_NICKNAMEINUSE => {
                let net = self.networks.get_mut(&network_id).unwrap();
                if let Some(conn) = net.conn.as_mut() {
                    if conn.state == SessionState::Registering {
                        conn.nick.push('_');
                        let nick = conn.nick.clone();
                        let _ = conn.send(Message::new("NICK", vec![nick]));
                    }
                }
            }
            "NICK" => self.upstream_nick(network_id, &msg).await,
            "JOIN" => self.upstream_join(network_id, &msg).await,
            "PART" => self.upstream_part(network_id, &msg).await,
            "KICK" => self.upstream_kick(network_id, &msg).await,
            "QUIT" => self.upstream_quit(network_id, &msg).await,
            "TOPIC" => self.upstream_topic(network_id, &msg).await,
            "MODE" => self.upstream_mode(network_id, &msg).await,
            RPL_TOPIC | RPL_NOTOPIC | RPL_TOPICWHOTIME => {
                self.upstream_topic_numeric(network_id, &msg).await
            }
            RPL_NAMREPLY => self.upstream_namreply(network_id, &msg).await,
            RPL_ENDOFNAMES => self.upstream_endofnames(network_id, &msg).await,
            RPL_CHANNELMODEIS => self.upstream_channelmodeis(network_id, &msg).await,
            "PRIVMSG" | "NOTICE" | "TAGMSG" => self.upstream_privmsg(network_id, msg).await,
            "ERROR" => {
                let net = self.networks.get_mut(&network_id).unwrap();
                net.last_error = msg.params.last().cloned();
            }
            // WHO
            "352" | "354" => self.route_pending(network_id, &msg, Pending::Who, false),
            "315" => self.route_pending(network_id, &msg, Pending::Who, true),
            // WHOIS
            "311" | "312" | "313" | "317" | "319" | "330" | "338" | "671" => {
                self.route_pending(network_id, &msg, Pending::Whois, false)
            }
            "318" => self.route_pending(network_id, &msg, Pending::Whois, true),
            ERR_NOSUCHNICK => self.route_pending(network_id, &msg, Pending::Whois, true),
            _ => {
                tracing::trace!(%command, "unhandled upstream message");
            }
        }
    }

    async fn upstream_cap(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let subcmd = msg.param(1).unwrap_or_default().to_ascii_uppercase();
        match subcmd.as_str() {
            "LS" => {
                let more = msg.param(2) == Some("*");
                let caps = msg.params.last().cloned().unwrap_or_default();
                for token in caps.split_whitespace() {
                    let name = token.split('=').next().unwrap_or(token);
                    conn.offered_caps.insert(name.to_string());
                }
                if !more && !conn.ls_done {
                    conn.ls_done = true;
                    let request = upstream_request(&conn.offered_caps);
                    if request.is_empty() {
                        conn.cap_end();
                    } else {
                        let list = request
                            .iter()
                            .map(|c| c.name())
                            .collect::<Vec<_>>()
                            .join(" ");
                        let _ = conn.send(Message::new("CAP", vec!["REQ".into(), list]));
                    }
                }
            }
            "ACK" => {
                let acked = msg.params.last().cloned().unwrap_or_default();
                let mut got_sasl = false;
                for name in acked.split_whitespace() {
                    if let Some(cap) = Cap::from_name(name) {
                        conn.caps.set(cap);
                        got_sasl |= cap == Cap::Sasl;
                    }
                }
                if got_sasl && conn.sasl == SaslState::None {
                    if let Some(mechanism) = net.record.sasl.mechanism {
                        conn.sasl = SaslState::Started;
                        let _ = conn.send(Message::new(
                            "AUTHENTICATE",
                            vec![mechanism.to_string()],
                        ));
                        return;
                    }
                }
                if conn.sasl == SaslState::None {
                    conn.cap_end();
                }
            }
            "NAK" => conn.cap_end(),
            _ => (),
        }
    }

    async fn upstream_authenticate(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        if msg.param(0) != Some("+") || conn.sasl != SaslState::Started {
            return;
        }
        let response = match net.record.sasl.mechanism {
            Some(SaslMechanism::Plain) => {
                let plain = &net.record.sasl.plain;
                let payload = format!("{}\0{}\0{}", plain.username, plain.username, plain.password);
                BASE64_STANDARD.encode(payload)
            }
            Some(SaslMechanism::External) => "+".to_string(),
            None => return,
        };
        let _ = conn.send(Message::new("AUTHENTICATE", vec![response]));
    }

    async fn upstream_welcome(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };

        conn.state = SessionState::Running;
        if let Some(nick) = msg.param(0) {
            conn.nick = nick.to_string();
        }
        net.registered.store(true, Ordering::Relaxed);
        net.last_error = None;
        tracing::info!(network = %net.record.name(), nick = %conn.nick, "registered with upstream");

        for raw in &net.record.connect_commands {
            if let Ok(msg) = raw.parse::<Message>() {
                let _ = conn.send(msg);
            }
        }

        let mut to_join = Vec::new();
        for channel in net.channels.values() {
            if !channel.detached || detached_channel_needs_presence(channel) {
                to_join.push((channel.name.clone(), channel.key.clone()));
            }
        }
        for msg in buoy_irc::split::join_messages(&to_join) {
            let _ = conn.send(msg);
        }

        let statuses: Vec<Message> = self.upstream_status_lines(network_id);
        for status in statuses {
            self.broadcast_to_downstreams(&status);
        }
    }

    /// NOTICE lines announcing the connection state change to attached
    /// downstreams
    fn upstream_status_lines(&self, network_id: i64) -> Vec<Message> {
        let Some(net) = self.networks.get(&network_id) else {
            return Vec::new();
        };
        vec![Message::new(
            "NOTICE",
            vec![
                "*".into(),
                format!("connected to {}", net.record.name()),
            ],
        )
        .with_prefix(crate::user::service_prefix())]
    }

    async fn upstream_nick(&mut self, network_id: i64, msg: &Message) {
        let Some(new_nick) = msg.param(0).map(str::to_string) else {
            return;
        };
        let Some(sender) = msg.prefix.as_ref().map(|p| p.name.clone()) else {
            return;
        };

        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let was_self = conn.is_own_nick(&sender);
        if was_self {
            conn.nick = new_nick.clone();
        }
        for channel in conn.channels.values_mut() {
            if let Some(memberships) = channel.members.remove(&sender) {
                channel.members.insert(new_nick.clone(), memberships);
            }
        }

        if !was_self {
            let fwd = msg.clone();
            self.relay_marshaled(network_id, fwd, &[]).await;
        }
    }

    async fn upstream_join(&mut self, network_id: i64, msg: &Message) {
        let Some(sender) = msg.prefix.as_ref().map(|p| p.name.clone()) else {
            return;
        };
        let Some(channels) = msg.param(0).map(str::to_string) else {
            return;
        };

        for channel_name in channels.split(',') {
            let net = self.networks.get_mut(&network_id).unwrap();
            let Some(conn) = net.conn.as_mut() else {
                return;
            };
            let folded = conn.fold(channel_name);

            if conn.is_own_nick(&sender) {
                conn.channels
                    .insert(folded.clone(), UpstreamChannel::new(channel_name));
                continue;
            }

            let Some(channel) = conn.channels.get_mut(&folded) else {
                continue;
            };
            channel
                .members
                .entry(sender.clone())
                .or_default();
            if !channel.complete {
                continue;
            }

            let mut fwd = msg.clone();
            fwd.params = vec![channel_name.to_string()];
            if msg.params.len() >= 3 {
                // extended-join account and realname arguments
                fwd.params.extend(msg.params[1..].iter().cloned());
            }
            self.relay_marshaled(network_id, fwd, &[0]).await;
        }
    }

    async fn upstream_part(&mut self, network_id: i64, msg: &Message) {
        let Some(sender) = msg.prefix.as_ref().map(|p| p.name.clone()) else {
            return;
        };
        let Some(channels) = msg.param(0).map(str::to_string) else {
            return;
        };

        for channel_name in channels.split(',') {
            let net = self.networks.get_mut(&network_id).unwrap();
            let Some(conn) = net.conn.as_mut() else {
                return;
            };
            let folded = conn.fold(channel_name);

            if conn.is_own_nick(&sender) {
                conn.channels.remove(&folded);
            } else if let Some(channel) = conn.channels.get_mut(&folded) {
                channel.members.remove(&sender);
            }

            let mut fwd = msg.clone();
            fwd.params[0] = channel_name.to_string();
            self.relay_marshaled(network_id, fwd, &[0]).await;
        }
    }

    async fn upstream_kick(&mut self, network_id: i64, msg: &Message) {
        let (Some(channel_name), Some(victim)) = (
            msg.param(0).map(str::to_string),
            msg.param(1).map(str::to_string),
        ) else {
            return;
        };

        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let folded = conn.fold(&channel_name);
        if conn.is_own_nick(&victim) {
            conn.channels.remove(&folded);
        } else if let Some(channel) = conn.channels.get_mut(&folded) {
            channel.members.remove(&victim);
        }

        self.relay_marshaled(network_id, msg.clone(), &[0, 1]).await;
    }

    async fn upstream_quit(&mut self, network_id: i64, msg: &Message) {
        let Some(sender) = msg.prefix.as_ref().map(|p| p.name.clone()) else {
            return;
        };
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        if conn.is_own_nick(&sender) {
            return;
        }
        let mut was_member = false;
        for channel in conn.channels.values_mut() {
            was_member |= channel.members.remove(&sender).is_some();
        }
        if was_member {
            self.relay_marshaled(network_id, msg.clone(), &[]).await;
        }
    }

    async fn upstream_topic(&mut self, network_id: i64, msg: &Message) {
        let (Some(channel_name), Some(topic)) = (
            msg.param(0).map(str::to_string),
            msg.param(1).map(str::to_string),
        ) else {
            return;
        };
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let folded = conn.fold(&channel_name);
        if let Some(channel) = conn.channels.get_mut(&folded) {
            channel.topic = topic;
            channel.topic_who = msg.prefix.clone();
            channel.topic_time = now();
        }
        self.relay_marshaled(network_id, msg.clone(), &[0]).await;
    }

    async fn upstream_topic_numeric(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let Some(channel_name) = msg.param(1).map(str::to_string) else {
            return;
        };
        let folded = conn.fold(&channel_name);
        let Some(channel) = conn.channels.get_mut(&folded) else {
            return;
        };
        match msg.command.as_str() {
            RPL_TOPIC => {
                if let Some(topic) = msg.param(2) {
                    channel.topic = topic.to_string();
                }
            }
            RPL_NOTOPIC => {
                channel.topic.clear();
            }
            RPL_TOPICWHOTIME => {
                if let Some(who) = msg.param(2) {
                    channel.topic_who = Some(Prefix::parse(who));
                }
                if let Some(ts) = msg.param(3).and_then(|t| t.parse().ok()) {
                    channel.topic_time = buoy_irc::from_unix_time(ts);
                }
            }
            _ => (),
        }
    }

    async fn upstream_namreply(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let (Some(status), Some(channel_name), Some(names)) = (
            msg.param(1).map(str::to_string),
            msg.param(2).map(str::to_string),
            msg.param(3).map(str::to_string),
        ) else {
            return;
        };

        let folded = conn.fold(&channel_name);
        let tracked = conn
            .channels
            .get(&folded)
            .is_some_and(|channel| !channel.complete);
        if !tracked {
            self.route_pending(network_id, msg, Pending::Names, false);
            return;
        }

        let available = conn.isupport.available_memberships.clone();
        let channel = conn.channels.get_mut(&folded).unwrap();
        if let Some(status) = ChannelStatus::parse(&status) {
            channel.status = status;
        }
        for raw in names.split_whitespace() {
            let mut name = raw;
            let mut memberships = Memberships::default();
            loop {
                let Some(first) = name.chars().next() else {
                    break;
                };
                match available.iter().find(|m| m.prefix == first) {
                    Some(membership) => {
                        memberships.add(&available, *membership);
                        name = &name[first.len_utf8()..];
                    }
                    None => break,
                }
            }
            // userhost-in-names style nick!user@host
            let nick = name.split('!').next().unwrap_or(name);
            channel.members.insert(nick.to_string(), memberships);
        }
    }

    async fn upstream_endofnames(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let Some(channel_name) = msg.param(1).map(str::to_string) else {
            return;
        };
        let folded = conn.fold(&channel_name);

        let newly_complete = match conn.channels.get_mut(&folded) {
            Some(channel) if !channel.complete => {
                channel.complete = true;
                true
            }
            _ => false,
        };

        if !newly_complete {
            self.route_pending(network_id, msg, Pending::Names, true);
            return;
        }

        self.reset_detach_timer(network_id, &folded);

        let detached = self
            .networks
            .get(&network_id)
            .and_then(|n| n.channels.get(&folded))
            .map(|c| c.detached)
            .unwrap_or(false);
        if detached {
            return;
        }

        let ds_ids: Vec<u64> = self.downstreams.keys().copied().collect();
        for ds_id in ds_ids {
            self.forward_channel(ds_id, network_id, &folded).await;
        }
    }

    async fn upstream_channelmodeis(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let (Some(channel_name), Some(modestring)) = (
            msg.param(1).map(str::to_string),
            msg.param(2).map(str::to_string),
        ) else {
            return;
        };
        let folded = conn.fold(&channel_name);
        let available_memberships = conn.isupport.available_memberships.clone();
        let available_modes = conn.isupport.available_channel_modes.clone();
        if let Some(channel) = conn.channels.get_mut(&folded) {
            channel.modes.0.clear();
            let args: Vec<String> = msg.params.iter().skip(3).cloned().collect();
            let _ = apply_channel_modes(
                channel,
                &available_memberships,
                &available_modes,
                &modestring,
                &args,
            );
        }
    }

    async fn upstream_mode(&mut self, network_id: i64, msg: &Message) {
        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let (Some(target), Some(modestring)) = (
            msg.param(0).map(str::to_string),
            msg.param(1).map(str::to_string),
        ) else {
            return;
        };

        if !conn.isupport.is_channel(&target) {
            if conn.is_own_nick(&target) {
                let _ = conn.modes.apply(&modestring);
            }
            return;
        }

        let folded = conn.fold(&target);
        let available_memberships = conn.isupport.available_memberships.clone();
        let available_modes = conn.isupport.available_channel_modes.clone();
        let args: Vec<String> = msg.params.iter().skip(2).cloned().collect();

        let mut marshal_params = vec![0usize];
        if let Some(channel) = conn.channels.get_mut(&folded) {
            if let Ok(needs) = apply_channel_modes(
                channel,
                &available_memberships,
                &available_modes,
                &modestring,
                &args,
            ) {
                // argument i of the modestring is parameter i+2 of the MODE
                marshal_params.extend(needs.iter().map(|i| i + 2));
            }
        }

        self.relay_marshaled(network_id, msg.clone(), &marshal_params)
            .await;
    }

    async fn upstream_privmsg(&mut self, network_id: i64, mut msg: Message) {
        let Some(target) = msg.param(0).map(str::to_string) else {
            return;
        };
        let sender = msg
            .prefix
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_default();

        // Stamp the reception time before anything else sees the message
        if msg.tag("time").is_none() {
            msg.tags.push(server_time_tag(now()));
        }

        let net = self.networks.get_mut(&network_id).unwrap();
        let Some(conn) = net.conn.as_mut() else {
            return;
        };
        let self_nick = conn.nick.clone();
        let is_channel = conn.isupport.is_channel(&target);
        let entity = if is_channel {
            target.clone()
        } else {
            sender.clone()
        };
        let folded_entity = conn.fold(&entity);
        let text = msg.params.get(1).cloned().unwrap_or_default();

        // History, except for CTCP queries that are not ACTION
        let record = net.record.clone();
        let store_it = match buoy_irc::ctcp::parse_ctcp(&msg) {
            Some((cmd, _)) => cmd == "ACTION",
            None => msg.command != "TAGMSG" || msg.tags.iter().any(|t| t.name.starts_with('+')),
        };
        if store_it {
            if let Err(err) = self.msgstore.append(&record, &folded_entity, &msg).await {
                tracing::warn!(%err, "failed to append message to store");
            }
        }

        let net = self.networks.get_mut(&network_id).unwrap();
        let mut relay = true;
        if let Some(channel) = net.channels.get(&folded_entity).cloned() {
            if channel.detached {
                let reattach =
                    resolve_filter(channel.reattach_on, MessageFilter::None);
                if filter_matches(reattach, &text, &self_nick) {
                    self.attach_channel(network_id, &folded_entity).await;
                } else {
                    let relay_detached =
                        resolve_filter(channel.relay_detached, MessageFilter::Highlight);
                    relay = filter_matches(relay_detached, &text, &self_nick);
                }
            } else {
                let detach_on = resolve_filter(channel.detach_on, MessageFilter::Message);
                if filter_matches(detach_on, &text, &self_nick) {
                    self.reset_detach_timer(network_id, &folded_entity);
                }
            }
        }

        if relay {
            self.relay_marshaled(network_id, msg, &[0]).await;
        }
    }

    /// Mark a channel detached: bookmark the message store, persist, leave
    /// upstream unless the relay policy needs presence, and PART it from
    /// the downstreams' view.
    pub(crate) async fn handle_detach_timeout(&mut self, network_id: i64, folded: String) {
        let Some(net) = self.networks.get_mut(&network_id) else {
            return;
        };
        net.detach_timers.remove(&folded);
        let Some(channel) = net.channels.get(&folded) else {
            return;
        };
        if channel.detached || channel.detach_after.is_zero() {
            return;
        }

        let record = net.record.clone();
        let bookmark = self
            .msgstore
            .last_msg_id(&record, &folded, now())
            .await
            .unwrap_or_default();

        let net = self.networks.get_mut(&network_id).unwrap();
        let channel = net.channels.get_mut(&folded).unwrap();
        channel.detached = true;
        channel.detached_internal_msgid = bookmark;
        let mut db_record = channel.clone();
        let channel_name = channel.name.clone();
        let needs_presence = detached_channel_needs_presence(channel);
        tracing::info!(network = %record.name(), channel = %channel_name, "auto-detaching channel");

        if !needs_presence {
            if let Some(conn) = net.conn.as_ref() {
                let _ = conn.send(Message::new("PART", vec![channel_name.clone()]));
            }
        }

        match self
            .server
            .db
            .store_channel(network_id, &mut db_record)
            .await
        {
            Ok(()) => {
                if let Some(net) = self.networks.get_mut(&network_id) {
                    net.channels.insert(folded.clone(), db_record);
                }
            }
            Err(err) => tracing::warn!(%err, "failed to persist detached channel"),
        }

        self.send_part_to_downstreams(network_id, &channel_name).await;
    }

    /// Clear the detached flag and re-join, replaying what accumulated
    /// since the detach bookmark
    pub(crate) async fn attach_channel(&mut self, network_id: i64, folded: &str) {
        let Some(net) = self.networks.get_mut(&network_id) else {
            return;
        };
        let Some(channel) = net.channels.get_mut(folded) else {
            return;
        };
        if !channel.detached {
            return;
        }
        channel.detached = false;
        let bookmark = std::mem::take(&mut channel.detached_internal_msgid);
        let mut db_record = channel.clone();
        let channel_name = channel.name.clone();
        let key = channel.key.clone();
        tracing::info!(network = %net.record.name(), channel = %channel_name, "re-attaching channel");

        if let Some(conn) = net.conn.as_ref() {
            let mut params = vec![channel_name.clone()];
            if !key.is_empty() {
                params.push(key);
            }
            let _ = conn.send(Message::new("JOIN", params));
        }

        match self
            .server
            .db
            .store_channel(network_id, &mut db_record)
            .await
        {
            Ok(()) => {
                if let Some(net) = self.networks.get_mut(&network_id) {
                    net.channels.insert(folded.to_string(), db_record);
                }
            }
            Err(err) => tracing::warn!(%err, "failed to persist re-attached channel"),
        }

        let joined = self
            .networks
            .get(&network_id)
            .and_then(|n| n.conn.as_ref())
            .and_then(|c| c.channels.get(folded))
            .is_some_and(|c| c.complete);
        if joined {
            let ds_ids: Vec<u64> = self.downstreams.keys().copied().collect();
            for ds_id in ds_ids {
                self.forward_channel(ds_id, network_id, folded).await;
            }
            if !bookmark.is_empty() {
                self.replay_backlog(network_id, folded, &bookmark).await;
            }
        }

        self.reset_detach_timer(network_id, folded);
    }

    /// (Re-)arm the auto-detach timer for a channel after user activity
    pub(crate) fn reset_detach_timer(&mut self, network_id: i64, folded: &str) {
        let Some(net) = self.networks.get_mut(&network_id) else {
            return;
        };
        if let Some(handle) = net.detach_timers.remove(folded) {
            handle.abort();
        }
        let Some(channel) = net.channels.get(folded) else {
            return;
        };
        if channel.detached || channel.detach_after.is_zero() {
            return;
        }

        let delay = channel.detach_after;
        let inbox = self.inbox_tx.clone();
        let stop = self.stop.clone();
        let folded_owned = folded.to_string();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => (),
                _ = tokio::time::sleep(delay) => {
                    let _ = inbox
                        .send(Event::ChannelDetachTimeout {
                            network_id,
                            channel: folded_owned,
                        })
                        .await;
                }
            }
        });
        net.detach_timers.insert(folded.to_string(), handle);
    }

    async fn replay_backlog(&mut self, network_id: i64, folded: &str, after_msgid: &str) {
        let Some(net) = self.networks.get(&network_id) else {
            return;
        };
        let record = net.record.clone();
        let history = match self
            .msgstore
            .load_latest_id(&record, folded, after_msgid, 500)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                tracing::warn!(%err, "failed to load backlog");
                return;
            }
        };
        for msg in history {
            self.relay_marshaled(network_id, msg, &[0]).await;
        }
    }

    fn route_pending(&mut self, network_id: i64, msg: &Message, pending: Pending, done: bool) {
        let Some(conn) = self
            .networks
            .get_mut(&network_id)
            .and_then(|n| n.conn.as_mut())
        else {
            return;
        };
        let queue = match pending {
            Pending::Who => &mut conn.pending_who,
            Pending::Whois => &mut conn.pending_whois,
            Pending::Names => &mut conn.pending_names,
        };
        let ds_id = if done {
            queue.pop_front()
        } else {
            queue.front().copied()
        };
        let Some(ds_id) = ds_id else {
            return;
        };

        let fwd = msg.clone();
        self.send_numeric_to(ds_id, network_id, fwd);
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Pending {
    Who,
    Whois,
    Names,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_addr_schemes() {
        assert_eq!(
            parse_server_addr("ircs://irc.example.org").unwrap(),
            ServerAddr::Ircs {
                host: "irc.example.org".to_string(),
                port: 6697
            }
        );
        assert_eq!(
            parse_server_addr("irc+insecure://irc.example.org:6668").unwrap(),
            ServerAddr::Insecure {
                host: "irc.example.org".to_string(),
                port: 6668
            }
        );
        assert_eq!(
            parse_server_addr("unix:///run/ircd.sock").unwrap(),
            ServerAddr::Unix {
                path: "/run/ircd.sock".to_string()
            }
        );
        // bare host means ircs
        assert_eq!(
            parse_server_addr("irc.example.org").unwrap(),
            ServerAddr::Ircs {
                host: "irc.example.org".to_string(),
                port: 6697
            }
        );
        assert!(parse_server_addr("http://irc.example.org").is_err());
    }

    fn test_channel() -> UpstreamChannel {
        let mut ch = UpstreamChannel::new("#chan");
        ch.members
            .insert("alice".to_string(), Memberships::default());
        ch.members.insert("bob".to_string(), Memberships::default());
        ch
    }

    #[test]
    fn apply_modes_updates_modes_and_members() {
        let mut ch = test_channel();
        let available = buoy_irc::STD_MEMBERSHIPS.to_vec();
        let modes = buoy_irc::std_channel_modes();

        let needs = apply_channel_modes(
            &mut ch,
            &available,
            &modes,
            "+ok",
            &["alice".to_string(), "hunter2".to_string()],
        )
        .unwrap();
        assert!(needs.contains(&0));
        assert!(!needs.contains(&1));
        assert_eq!(ch.modes.0.get(&'k').map(String::as_str), Some("hunter2"));
        assert_eq!(ch.members["alice"].format(false), "@");

        apply_channel_modes(&mut ch, &available, &modes, "-o+v", &["alice".to_string(), "alice".to_string()])
            .unwrap();
        assert_eq!(ch.members["alice"].format(false), "+");
    }

    #[test]
    fn apply_modes_round_trip() {
        // Re-applying the formatted mode state to an empty channel yields
        // the same state
        let mut ch = test_channel();
        let available = buoy_irc::STD_MEMBERSHIPS.to_vec();
        let modes = buoy_irc::std_channel_modes();
        apply_channel_modes(
            &mut ch,
            &available,
            &modes,
            "+ntk",
            &["hunter2".to_string()],
        )
        .unwrap();

        let (modestring, args) = ch.modes.format();
        let mut ch2 = UpstreamChannel::new("#chan");
        apply_channel_modes(&mut ch2, &available, &modes, &modestring, &args).unwrap();
        assert_eq!(ch.modes, ch2.modes);
    }

    #[test]
    fn apply_modes_missing_plus_minus() {
        let mut ch = test_channel();
        let available = buoy_irc::STD_MEMBERSHIPS.to_vec();
        let modes = buoy_irc::std_channel_modes();
        assert!(apply_channel_modes(&mut ch, &available, &modes, "nt", &[]).is_err());
    }

    #[tokio::test]
    async fn registration_negotiates_caps() {
        let mut actor = crate::user::UserActor::for_test();
        let record = Network {
            id: 1,
            name: "libera".to_string(),
            addr: "ircs://irc.libera.example".to_string(),
            nick: "alice".to_string(),
            enabled: true,
            ..Default::default()
        };
        actor
            .networks
            .insert(1, crate::user::NetworkState::for_test(record, HashMap::new()));

        let (tx, mut rx) = mpsc::channel(64);
        actor.handle_upstream_connected(1, tx).await;

        assert_eq!(rx.try_recv().unwrap().to_string(), "CAP LS 302");
        assert_eq!(rx.try_recv().unwrap().to_string(), "NICK alice");
        assert!(rx
            .try_recv()
            .unwrap()
            .to_string()
            .starts_with("USER alice 0 * "));

        // the request is the intersection of what we speak with the offer
        let ls: Message = ":srv CAP * LS :server-time sasl=PLAIN unknown-cap"
            .parse()
            .unwrap();
        actor.handle_upstream_message(1, ls).await;
        let req = rx.try_recv().unwrap().to_string();
        assert!(req.starts_with("CAP REQ"));
        assert!(req.contains("server-time"));
        assert!(req.contains("sasl"));
        assert!(!req.contains("unknown-cap"));

        // no SASL configured, so the ACK completes negotiation
        let ack: Message = ":srv CAP * ACK :server-time sasl".parse().unwrap();
        actor.handle_upstream_message(1, ack).await;
        assert_eq!(rx.try_recv().unwrap().to_string(), "CAP END");

        let welcome: Message = ":srv 001 alice :Welcome".parse().unwrap();
        actor.handle_upstream_message(1, welcome).await;
        let conn = actor.networks[&1].conn.as_ref().unwrap();
        assert_eq!(conn.state, SessionState::Running);
        assert!(conn.caps.has(Cap::ServerTime));
    }

    #[tokio::test]
    async fn join_is_forwarded_only_after_names_complete() {
        let mut actor = crate::user::UserActor::for_test();
        let record = Network {
            id: 1,
            name: "libera".to_string(),
            addr: "ircs://irc.libera.example".to_string(),
            enabled: true,
            ..Default::default()
        };
        let mut net = crate::user::NetworkState::for_test(record.clone(), HashMap::new());
        let (tx, _up_rx) = mpsc::channel(64);
        let mut session = UpstreamSession::new(&record, "alice", tx);
        session.state = SessionState::Running;
        net.conn = Some(session);
        actor.networks.insert(1, net);

        let (ds_tx, mut ds_rx) = tokio::sync::mpsc::unbounded_channel();
        actor.insert_test_downstream(1, ds_tx);

        let join: Message = ":alice!a@h JOIN #chan".parse().unwrap();
        actor.handle_upstream_message(1, join).await;
        // nothing is forwarded before the NAMES reply completes
        assert!(ds_rx.try_recv().is_err());

        let names: Message = ":srv 353 alice = #chan :@bob alice".parse().unwrap();
        actor.handle_upstream_message(1, names).await;
        assert!(ds_rx.try_recv().is_err());

        let end: Message = ":srv 366 alice #chan :End of /NAMES list".parse().unwrap();
        actor.handle_upstream_message(1, end).await;

        let mut lines = Vec::new();
        while let Ok(line) = ds_rx.try_recv() {
            lines.push(line.trim_end().to_string());
        }
        assert!(lines[0].contains("JOIN #chan/libera"));
        assert!(lines.iter().any(|l| l.contains("353") && l.contains("@bob/libera")));
        assert!(lines.iter().any(|l| l.contains("366")));

        let conn = actor.networks[&1].conn.as_ref().unwrap();
        let channel = &conn.channels["#chan"];
        assert!(channel.complete);
        assert_eq!(channel.members["bob"].format(false), "@");
        assert!(channel.members.contains_key("alice"));
    }

    #[test]
    fn filters() {
        assert!(filter_matches(MessageFilter::Message, "anything", "nick"));
        assert!(!filter_matches(MessageFilter::None, "anything", "nick"));
        assert!(filter_matches(
            MessageFilter::Highlight,
            "hey Nick, hi",
            "nick"
        ));
        assert!(!filter_matches(MessageFilter::Highlight, "hello", "nick"));
        assert_eq!(
            resolve_filter(MessageFilter::Default, MessageFilter::Highlight),
            MessageFilter::Highlight
        );
        assert_eq!(
            resolve_filter(MessageFilter::None, MessageFilter::Highlight),
            MessageFilter::None
        );
    }
}
