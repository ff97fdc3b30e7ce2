use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Maximum length of a single IRC line on the wire, including CRLF
pub const MAX_MESSAGE_LEN: usize = 512;

/// Maximum number of space-separated parameters, including the trailing one
pub const MAX_PARAMS: usize = 15;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageParseError {
    #[error("empty message")]
    Empty,
    #[error("message tags with no command")]
    TagsWithoutCommand,
    #[error("message prefix with no command")]
    PrefixWithoutCommand,
}

/// A message tag attached to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub value: Option<String>,
}

impl Tag {
    pub fn new(name: impl ToString, value: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

// Tag value escaping, per the message-tags spec
fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            // A lone trailing backslash, or an unknown escape, drops the backslash
            Some(c) => out.push(c),
            None => (),
        }
    }
    out
}

/// The source of a message: `nick!user@host`, or a bare server name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prefix {
    pub name: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    pub fn new(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            user: None,
            host: None,
        }
    }

    pub fn full(name: impl ToString, user: impl ToString, host: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            user: Some(user.to_string()),
            host: Some(host.to_string()),
        }
    }

    pub fn parse(raw: &str) -> Self {
        let (rest, host) = match raw.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_string())),
            None => (raw, None),
        };
        let (name, user) = match rest.split_once('!') {
            Some((name, user)) => (name, Some(user.to_string())),
            None => (rest, None),
        };
        Self {
            name: name.to_string(),
            user,
            host,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(user) = &self.user {
            write!(f, "!{}", user)?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{}", host)?;
        }
        Ok(())
    }
}

/// A parsed IRC protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tags: Vec<Tag>,
    pub prefix: Option<Prefix>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    pub fn new(command: impl ToString, params: Vec<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix: None,
            command: command.to_string(),
            params,
        }
    }

    pub fn with_prefix(mut self, prefix: Prefix) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.push(tag);
        self
    }

    pub fn tag(&self, name: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.name == name)
    }

    pub fn param(&self, i: usize) -> Option<&str> {
        self.params.get(i).map(String::as_str)
    }

    /// Keep only client-only tags (those prefixed with `+`), for relaying
    /// client tags across the bouncer
    pub fn client_tags(&self) -> Vec<Tag> {
        self.tags
            .iter()
            .filter(|t| t.name.starts_with('+'))
            .cloned()
            .collect()
    }
}

impl FromStr for Message {
    type Err = MessageParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut raw = raw.trim_start_matches(' ').trim_end_matches(&['\r', '\n'][..]);
        if raw.is_empty() {
            return Err(MessageParseError::Empty);
        }

        let mut tags = Vec::new();
        if let Some(tag_part) = raw.strip_prefix('@') {
            let Some(space_offset) = tag_part.find(' ') else {
                return Err(MessageParseError::TagsWithoutCommand);
            };
            for tag_def in tag_part[..space_offset].split(';') {
                let (name, value) = match tag_def.split_once('=') {
                    Some((n, v)) => (n.to_string(), Some(unescape_tag_value(v))),
                    None => (tag_def.to_string(), None),
                };
                tags.push(Tag { name, value });
            }
            raw = tag_part[space_offset..].trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(prefix_part) = raw.strip_prefix(':') {
            let Some(space_offset) = prefix_part.find(' ') else {
                return Err(MessageParseError::PrefixWithoutCommand);
            };
            prefix = Some(Prefix::parse(&prefix_part[..space_offset]));
            raw = prefix_part[space_offset..].trim_start_matches(' ');
        }

        if raw.is_empty() {
            return Err(MessageParseError::Empty);
        }

        let (command, mut rest) = match raw.find(' ') {
            Some(offset) => (&raw[..offset], &raw[offset + 1..]),
            None => (raw, ""),
        };

        let mut params = Vec::new();
        loop {
            if let Some(arg) = rest.strip_prefix(':') {
                params.push(arg.to_string());
                break;
            }
            match rest.find(' ') {
                Some(offset) => {
                    let arg = &rest[..offset];
                    if !arg.is_empty() {
                        params.push(arg.to_string());
                    }
                    rest = &rest[offset + 1..];
                }
                None => {
                    if !rest.is_empty() {
                        params.push(rest.to_string());
                    }
                    break;
                }
            }
        }

        Ok(Self {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            f.write_str("@")?;
            for (i, tag) in self.tags.iter().enumerate() {
                if i > 0 {
                    f.write_str(";")?;
                }
                f.write_str(&tag.name)?;
                if let Some(value) = &tag.value {
                    write!(f, "={}", escape_tag_value(value))?;
                }
            }
            f.write_str(" ")?;
        }

        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }

        f.write_str(&self.command)?;

        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.is_empty() || param.starts_with(':') || param.contains(' '))
            {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Message {
        raw.parse().unwrap()
    }

    #[test]
    fn no_args() {
        let msg = parse("PING");
        assert_eq!(msg.command, "PING");
        assert!(msg.params.is_empty());
    }

    #[test]
    fn simple_args() {
        let msg = parse("command arg1 arg2 :arg three");
        assert_eq!(msg.command, "COMMAND");
        assert_eq!(msg.params, &["arg1", "arg2", "arg three"]);
    }

    #[test]
    fn ending_colon() {
        let msg = parse("command arg1 arg2 :");
        assert_eq!(msg.params, &["arg1", "arg2", ""]);
    }

    #[test]
    fn double_space() {
        let msg = parse("command arg1  arg2");
        assert_eq!(msg.params, &["arg1", "arg2"]);
    }

    #[test]
    fn prefix() {
        let msg = parse(":nick!user@host PRIVMSG #chan :hello there");
        let prefix = msg.prefix.unwrap();
        assert_eq!(prefix.name, "nick");
        assert_eq!(prefix.user.as_deref(), Some("user"));
        assert_eq!(prefix.host.as_deref(), Some("host"));
        assert_eq!(msg.params, &["#chan", "hello there"]);
    }

    #[test]
    fn server_prefix() {
        let msg = parse(":irc.example.org 001 nick :Welcome");
        assert_eq!(msg.prefix.unwrap().name, "irc.example.org");
        assert_eq!(msg.command, "001");
    }

    #[test]
    fn tags() {
        let msg = parse("@tag1;tag2=val2 command arg1 :arg two");
        assert_eq!(msg.tags.len(), 2);
        assert_eq!(msg.tags[0].name, "tag1");
        assert_eq!(msg.tags[0].value, None);
        assert_eq!(msg.tags[1].value.as_deref(), Some("val2"));
    }

    #[test]
    fn tag_value_escaping() {
        let msg = parse("@time=2021-01-01;msg=a\\sb\\:c command");
        assert_eq!(msg.tags[1].value.as_deref(), Some("a b;c"));
        assert_eq!(
            msg.to_string(),
            "@time=2021-01-01;msg=a\\sb\\:c COMMAND"
        );
    }

    #[test]
    fn empty() {
        assert_eq!(
            "".parse::<Message>().unwrap_err(),
            MessageParseError::Empty
        );
        assert_eq!(
            "   ".parse::<Message>().unwrap_err(),
            MessageParseError::Empty
        );
    }

    #[test]
    fn tags_without_command() {
        assert_eq!(
            "@tag1;tag2".parse::<Message>().unwrap_err(),
            MessageParseError::TagsWithoutCommand
        );
    }

    #[test]
    fn round_trip() {
        for raw in [
            "PRIVMSG #chan :hello world",
            ":nick!user@host PRIVMSG #chan :hello",
            "@time=2021-06-01T12:00:00.000Z :srv 001 me :Welcome to the network, me",
            "JOIN #a,#b key",
            "PING :cookie with spaces",
            "MODE #chan +ov nick1 nick2",
        ] {
            let msg = parse(raw);
            assert_eq!(msg.to_string().parse::<Message>().unwrap(), msg);
        }
    }

    #[test]
    fn trailing_needs_colon() {
        let msg = Message::new("PRIVMSG", vec!["#chan".into(), ":starts-with-colon".into()]);
        assert_eq!(msg.to_string(), "PRIVMSG #chan ::starts-with-colon");
        assert_eq!(msg.to_string().parse::<Message>().unwrap(), msg);
    }
}
