//! The in-band administrative service, exposed as the `BouncerServ`
//! pseudo-user. A single PRIVMSG line is tokenized, resolved through a
//! command tree and dispatched to a typed handler.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::user::{DownstreamId, UserActor};
use crate::{Error, Result};

mod flags;
mod handlers;
mod tokenizer;

pub use flags::FlagSet;
pub use tokenizer::tokenize;

/// Which handler a command node dispatches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Help,
    NetworkCreate,
    NetworkStatus,
    NetworkUpdate,
    NetworkDelete,
    NetworkQuote,
    CertfpGenerate,
    CertfpFingerprint,
    SaslSetPlain,
    SaslReset,
    UserCreate,
    UserUpdate,
    UserDelete,
    ChannelStatus,
    ChannelUpdate,
    ServerStatus,
    ServerNotice,
}

#[derive(Debug)]
pub struct Command {
    pub usage: &'static str,
    pub desc: &'static str,
    pub handler: Option<Handler>,
    pub children: BTreeMap<&'static str, Command>,
    pub admin: bool,
}

impl Command {
    fn leaf(usage: &'static str, desc: &'static str, handler: Handler) -> Self {
        Self {
            usage,
            desc,
            handler: Some(handler),
            children: BTreeMap::new(),
            admin: false,
        }
    }

    fn admin_leaf(usage: &'static str, desc: &'static str, handler: Handler) -> Self {
        Self {
            admin: true,
            ..Self::leaf(usage, desc, handler)
        }
    }

    fn group(children: BTreeMap<&'static str, Command>) -> Self {
        Self {
            usage: "",
            desc: "",
            handler: None,
            children,
            admin: false,
        }
    }
}

pub struct CommandTree {
    commands: BTreeMap<&'static str, Command>,
}

impl CommandTree {
    /// Build the service command tree. A node with neither handler nor
    /// children is a configuration error.
    pub fn new() -> Result<Self> {
        let tree = Self {
            commands: build_commands(),
        };
        validate(&tree.commands)?;
        Ok(tree)
    }

    /// Resolve a tokenized line to a command. Exact name match wins,
    /// otherwise a unique prefix; descends into subcommands as long as
    /// words remain.
    ///
    /// Returns the command, the words consumed to reach it and the
    /// remaining parameters.
    pub fn resolve<'a>(
        &'a self,
        words: &[String],
    ) -> Result<(&'a Command, Vec<String>, Vec<String>)> {
        let mut consumed = Vec::new();
        let (cmd, params) = resolve_in(&self.commands, words, &mut consumed)?;
        Ok((cmd, consumed, params))
    }

    /// Every invocable command path visible to `admin`, sorted
    pub fn help_paths(&self, admin: bool) -> Vec<String> {
        let mut out = Vec::new();
        append_help(&self.commands, &[], admin, &mut out);
        out
    }
}

fn resolve_in<'a>(
    commands: &'a BTreeMap<&'static str, Command>,
    words: &[String],
    consumed: &mut Vec<String>,
) -> Result<(&'a Command, Vec<String>)> {
    let Some(name) = words.first() else {
        return Err(Error::parse("no command specified"));
    };
    let params = &words[1..];

    let mut cmd = commands.get(name.as_str());
    if cmd.is_none() {
        for (candidate_name, candidate) in commands {
            if !candidate_name.starts_with(name.as_str()) {
                continue;
            }
            if cmd.is_some() {
                return Err(Error::parse(format!("command {name:?} is ambiguous")));
            }
            cmd = Some(candidate);
        }
    }
    let Some(cmd) = cmd else {
        return Err(Error::not_found(format!("command {name:?} not found")));
    };
    consumed.push(name.clone());

    if params.is_empty() || cmd.children.is_empty() {
        return Ok((cmd, params.to_vec()));
    }
    resolve_in(&cmd.children, params, consumed)
}

fn append_help(
    commands: &BTreeMap<&'static str, Command>,
    prefix: &[&str],
    admin: bool,
    out: &mut Vec<String>,
) {
    for (name, cmd) in commands {
        if cmd.admin && !admin {
            continue;
        }
        let mut words = prefix.to_vec();
        words.push(name);
        if cmd.children.is_empty() {
            out.push(words.join(" "));
        } else {
            append_help(&cmd.children, &words, admin, out);
        }
    }
}

fn validate(commands: &BTreeMap<&'static str, Command>) -> Result<()> {
    for (name, cmd) in commands {
        if cmd.handler.is_none() && cmd.children.is_empty() {
            return Err(Error::FatalConfig(format!(
                "service command {name:?} has neither a handler nor subcommands"
            )));
        }
        validate(&cmd.children)?;
    }
    Ok(())
}

fn build_commands() -> BTreeMap<&'static str, Command> {
    BTreeMap::from([
        (
            "help",
            Command::leaf("[command]", "print help message", Handler::Help),
        ),
        (
            "network",
            Command::group(BTreeMap::from([
                (
                    "create",
                    Command::leaf(
                        "-addr <addr> [-name name] [-username username] [-pass pass] [-realname realname] [-nick nick] [-enabled enabled] [-connect-command command]...",
                        "add a new network",
                        Handler::NetworkCreate,
                    ),
                ),
                (
                    "status",
                    Command::leaf(
                        "",
                        "show a list of saved networks and their current status",
                        Handler::NetworkStatus,
                    ),
                ),
                (
                    "update",
                    Command::leaf(
                        "<name> [-addr addr] [-name name] [-username username] [-pass pass] [-realname realname] [-nick nick] [-enabled enabled] [-connect-command command]...",
                        "update a network",
                        Handler::NetworkUpdate,
                    ),
                ),
                (
                    "delete",
                    Command::leaf("<name>", "delete a network", Handler::NetworkDelete),
                ),
                (
                    "quote",
                    Command::leaf(
                        "<name> <command>",
                        "send a raw line to a network",
                        Handler::NetworkQuote,
                    ),
                ),
            ])),
        ),
        (
            "certfp",
            Command::group(BTreeMap::from([
                (
                    "generate",
                    Command::leaf(
                        "[-key-type rsa|ecdsa|ed25519] [-bits N] <network name>",
                        "generate a new self-signed certificate, defaults to using RSA-3072 key",
                        Handler::CertfpGenerate,
                    ),
                ),
                (
                    "fingerprint",
                    Command::leaf(
                        "<network name>",
                        "show fingerprints of certificate associated with the network",
                        Handler::CertfpFingerprint,
                    ),
                ),
            ])),
        ),
        (
            "sasl",
            Command::group(BTreeMap::from([
                (
                    "set-plain",
                    Command::leaf(
                        "<network name> <username> <password>",
                        "set SASL PLAIN credentials",
                        Handler::SaslSetPlain,
                    ),
                ),
                (
                    "reset",
                    Command::leaf(
                        "<network name>",
                        "disable SASL authentication and remove stored credentials",
                        Handler::SaslReset,
                    ),
                ),
            ])),
        ),
        (
            "user",
            Command::group(BTreeMap::from([
                (
                    "create",
                    Command::admin_leaf(
                        "-username <username> -password <password> [-realname <realname>] [-admin]",
                        "create a new bouncer user",
                        Handler::UserCreate,
                    ),
                ),
                (
                    "update",
                    Command::leaf(
                        "[username] [-password <password>] [-realname <realname>] [-admin <admin>]",
                        "update a user",
                        Handler::UserUpdate,
                    ),
                ),
                (
                    "delete",
                    Command::admin_leaf("<username>", "delete a user", Handler::UserDelete),
                ),
            ])),
        ),
        (
            "channel",
            Command::group(BTreeMap::from([
                (
                    "status",
                    Command::leaf(
                        "[-network name]",
                        "show a list of saved channels and their current status",
                        Handler::ChannelStatus,
                    ),
                ),
                (
                    "update",
                    Command::leaf(
                        "<name> [-relay-detached <default|none|highlight|message>] [-reattach-on <default|none|highlight|message>] [-detach-after <duration>] [-detach-on <default|none|highlight|message>]",
                        "update a channel",
                        Handler::ChannelUpdate,
                    ),
                ),
            ])),
        ),
        (
            "server",
            Command {
                usage: "",
                desc: "",
                handler: None,
                admin: true,
                children: BTreeMap::from([
                    (
                        "status",
                        Command::admin_leaf("", "show server statistics", Handler::ServerStatus),
                    ),
                    (
                        "notice",
                        Command::admin_leaf(
                            "<message>",
                            "broadcast a notice to all connected bouncer users",
                            Handler::ServerNotice,
                        ),
                    ),
                ]),
            },
        ),
    ])
}

fn command_tree() -> &'static CommandTree {
    static TREE: OnceLock<CommandTree> = OnceLock::new();
    TREE.get_or_init(|| CommandTree::new().expect("service command tree is well-formed"))
}

impl UserActor {
    /// Entry point for a PRIVMSG addressed to the service
    pub(crate) async fn handle_service_privmsg(&mut self, ds_id: DownstreamId, text: &str) {
        let words = match tokenize(text) {
            Ok(words) => words,
            Err(err) => {
                self.service_reply(ds_id, &format!("error: failed to parse command: {err}"));
                return;
            }
        };

        let admin = self.record.admin;
        let (cmd, consumed, params) = match command_tree().resolve(&words) {
            Ok(resolved) => resolved,
            Err(err) => {
                self.service_reply(
                    ds_id,
                    &format!(r#"error: {err} (type "help" for a list of commands)"#),
                );
                return;
            }
        };

        if cmd.admin && !admin {
            self.service_reply(ds_id, "error: you must be an admin to use this command");
            return;
        }

        let Some(handler) = cmd.handler else {
            // A group invoked directly lists its subcommands
            let mut paths = Vec::new();
            let prefix: Vec<&str> = consumed.iter().map(String::as_str).collect();
            append_help(&cmd.children, &prefix, admin, &mut paths);
            self.service_reply(ds_id, &format!("available commands: {}", paths.join(", ")));
            return;
        };

        if let Err(err) = self.dispatch_service(ds_id, handler, params).await {
            self.service_reply(ds_id, &format!("error: {err}"));
        }
    }

    async fn dispatch_service(
        &mut self,
        ds_id: DownstreamId,
        handler: Handler,
        params: Vec<String>,
    ) -> Result<()> {
        match handler {
            Handler::Help => self.service_help(ds_id, params).await,
            Handler::NetworkCreate => self.service_network_create(ds_id, params).await,
            Handler::NetworkStatus => self.service_network_status(ds_id, params).await,
            Handler::NetworkUpdate => self.service_network_update(ds_id, params).await,
            Handler::NetworkDelete => self.service_network_delete(ds_id, params).await,
            Handler::NetworkQuote => self.service_network_quote(ds_id, params).await,
            Handler::CertfpGenerate => self.service_certfp_generate(ds_id, params).await,
            Handler::CertfpFingerprint => self.service_certfp_fingerprint(ds_id, params).await,
            Handler::SaslSetPlain => self.service_sasl_set_plain(ds_id, params).await,
            Handler::SaslReset => self.service_sasl_reset(ds_id, params).await,
            Handler::UserCreate => self.service_user_create(ds_id, params).await,
            Handler::UserUpdate => self.service_user_update(ds_id, params).await,
            Handler::UserDelete => self.service_user_delete(ds_id, params).await,
            Handler::ChannelStatus => self.service_channel_status(ds_id, params).await,
            Handler::ChannelUpdate => self.service_channel_update(ds_id, params).await,
            Handler::ServerStatus => self.service_server_status(ds_id, params).await,
            Handler::ServerNotice => self.service_server_notice(ds_id, params).await,
        }
    }

    async fn service_help(&mut self, ds_id: DownstreamId, params: Vec<String>) -> Result<()> {
        let admin = self.record.admin;
        if params.is_empty() {
            let paths = command_tree().help_paths(admin);
            self.service_reply(ds_id, &format!("available commands: {}", paths.join(", ")));
            return Ok(());
        }

        let (cmd, consumed, _rest) = command_tree().resolve(&params)?;
        if !cmd.children.is_empty() {
            let mut paths = Vec::new();
            let prefix: Vec<&str> = consumed.iter().map(String::as_str).collect();
            append_help(&cmd.children, &prefix, admin, &mut paths);
            self.service_reply(ds_id, &format!("available commands: {}", paths.join(", ")));
        } else {
            let mut text = consumed.join(" ");
            if !cmd.usage.is_empty() {
                text.push(' ');
                text.push_str(cmd.usage);
            }
            text.push_str(": ");
            text.push_str(cmd.desc);
            self.service_reply(ds_id, &text);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn tree_is_well_formed() {
        CommandTree::new().unwrap();
    }

    #[test]
    fn handlerless_childless_node_rejected() {
        let tree = CommandTree {
            commands: BTreeMap::from([(
                "broken",
                Command {
                    usage: "",
                    desc: "",
                    handler: None,
                    children: BTreeMap::new(),
                    admin: false,
                },
            )]),
        };
        assert!(validate(&tree.commands).is_err());
    }

    #[test]
    fn exact_match() {
        let tree = CommandTree::new().unwrap();
        let (cmd, consumed, params) = tree.resolve(&words(&["network", "status"])).unwrap();
        assert_eq!(cmd.handler, Some(Handler::NetworkStatus));
        assert_eq!(consumed, &["network", "status"]);
        assert!(params.is_empty());
    }

    #[test]
    fn unique_prefix_resolves_like_full_name() {
        let tree = CommandTree::new().unwrap();
        let (full, _, _) = tree.resolve(&words(&["network", "status"])).unwrap();
        let (prefixed, _, _) = tree.resolve(&words(&["net", "stat"])).unwrap();
        assert_eq!(full.handler, prefixed.handler);
    }

    #[test]
    fn ambiguous_prefix() {
        let tree = CommandTree::new().unwrap();
        // "c" matches certfp and channel
        let err = tree.resolve(&words(&["c", "status"])).unwrap_err();
        assert_eq!(err.to_string(), r#"command "c" is ambiguous"#);
    }

    #[test]
    fn not_found() {
        let tree = CommandTree::new().unwrap();
        let err = tree.resolve(&words(&["bogus"])).unwrap_err();
        assert_eq!(err.to_string(), r#"command "bogus" not found"#);
    }

    #[test]
    fn params_pass_through() {
        let tree = CommandTree::new().unwrap();
        let (cmd, _, params) = tree
            .resolve(&words(&["sasl", "set-plain", "net1", "al ice", "it is"]))
            .unwrap();
        assert_eq!(cmd.handler, Some(Handler::SaslSetPlain));
        assert_eq!(params, &["net1", "al ice", "it is"]);
    }

    #[test]
    fn admin_commands_hidden_from_help() {
        let tree = CommandTree::new().unwrap();
        let user_paths = tree.help_paths(false);
        assert!(!user_paths.iter().any(|p| p.starts_with("server")));
        assert!(!user_paths.iter().any(|p| p == "user create"));
        assert!(user_paths.iter().any(|p| p == "user update"));

        let admin_paths = tree.help_paths(true);
        assert!(admin_paths.iter().any(|p| p == "server notice"));
    }

    #[test]
    fn group_without_handler_has_children() {
        let tree = CommandTree::new().unwrap();
        let (cmd, _, _) = tree.resolve(&words(&["network"])).unwrap();
        assert!(cmd.handler.is_none());
        assert!(!cmd.children.is_empty());
    }
}
