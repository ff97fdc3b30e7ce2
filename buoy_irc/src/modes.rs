use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModeParseError {
    #[error("malformed modestring {0:?}: missing plus/minus")]
    MissingPlusMinus(String),
    #[error("malformed modestring {0:?}: missing mode argument for {1}{2}")]
    MissingArgument(String, char, char),
}

/// Channel mode classification per the modern IRC mode taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelModeType {
    /// Modes that add or remove an address to or from a list
    A,
    /// Modes that change a setting and always have a parameter
    B,
    /// Modes that change a setting and have a parameter only when set
    C,
    /// Modes that change a setting and never have a parameter
    D,
}

/// The standard channel mode table, used until a 005 CHANMODES arrives
pub fn std_channel_modes() -> HashMap<char, ChannelModeType> {
    HashMap::from([
        ('b', ChannelModeType::A),
        ('e', ChannelModeType::A),
        ('I', ChannelModeType::A),
        ('k', ChannelModeType::B),
        ('l', ChannelModeType::C),
        ('i', ChannelModeType::D),
        ('m', ChannelModeType::D),
        ('n', ChannelModeType::D),
        ('s', ChannelModeType::D),
        ('t', ChannelModeType::D),
    ])
}

/// The modes currently set on a channel, letter to argument.
///
/// Argument-less modes map to the empty string. Kept ordered so that
/// formatting is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelModes(pub BTreeMap<char, String>);

impl ChannelModes {
    /// Format as a modestring and argument list, set modes with arguments
    /// first, e.g. `("+klnt", ["key", "10"])`
    pub fn format(&self) -> (String, Vec<String>) {
        let mut modestring = String::from("+");
        let mut args = Vec::new();
        for (mode, value) in &self.0 {
            if !value.is_empty() {
                modestring.push(*mode);
                args.push(value.clone());
            }
        }
        for (mode, value) in &self.0 {
            if value.is_empty() {
                modestring.push(*mode);
            }
        }
        (modestring, args)
    }
}

/// Modes set on the session's own user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserModes(String);

impl UserModes {
    pub fn has(&self, c: char) -> bool {
        self.0.contains(c)
    }

    pub fn add(&mut self, c: char) {
        if !self.has(c) {
            self.0.push(c);
        }
    }

    pub fn del(&mut self, c: char) {
        self.0.retain(|m| m != c);
    }

    pub fn apply(&mut self, modestring: &str) -> Result<(), ModeParseError> {
        let mut plus_minus = None;
        for c in modestring.chars() {
            match c {
                '+' | '-' => plus_minus = Some(c),
                c => match plus_minus {
                    Some('+') => self.add(c),
                    Some('-') => self.del(c),
                    _ => return Err(ModeParseError::MissingPlusMinus(modestring.to_string())),
                },
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for UserModes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// How a channel appeared in RPL_NAMREPLY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Public,
    Secret,
    Private,
}

impl ChannelStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Public),
            "@" => Some(Self::Secret),
            "*" => Some(Self::Private),
            _ => None,
        }
    }

    pub fn symbol(&self) -> char {
        match self {
            Self::Public => '=',
            Self::Secret => '@',
            Self::Private => '*',
        }
    }
}

/// A membership rank as advertised in the PREFIX ISUPPORT token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub mode: char,
    pub prefix: char,
}

/// The conventional PREFIX ranks, used until a 005 PREFIX arrives
pub const STD_MEMBERSHIPS: &[Membership] = &[
    Membership {
        mode: 'q',
        prefix: '~',
    },
    Membership {
        mode: 'a',
        prefix: '&',
    },
    Membership {
        mode: 'o',
        prefix: '@',
    },
    Membership {
        mode: 'h',
        prefix: '%',
    },
    Membership {
        mode: 'v',
        prefix: '+',
    },
];

/// A member's ranks on one channel, sorted by descending rank as given by
/// the upstream's PREFIX order. No duplicates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Memberships(Vec<Membership>);

impl Memberships {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn add(&mut self, available: &[Membership], new: Membership) {
        let mut i = 0;
        for avail in available {
            if i >= self.0.len() {
                break;
            }
            if self.0[i] == *avail {
                if *avail == new {
                    // already have this membership
                    return;
                }
                i += 1;
                continue;
            }
            if *avail == new {
                break;
            }
        }
        self.0.insert(i, new);
    }

    pub fn remove(&mut self, old: Membership) {
        self.0.retain(|m| *m != old);
    }

    /// Format for NAMREPLY: the highest rank only, or all of them when the
    /// client negotiated `multi-prefix`
    pub fn format(&self, multi_prefix: bool) -> String {
        if !multi_prefix {
            return match self.0.first() {
                Some(m) => m.prefix.to_string(),
                None => String::new(),
            };
        }
        self.0.iter().map(|m| m.prefix).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(mode: char, prefix: char) -> Membership {
        Membership { mode, prefix }
    }

    #[test]
    fn memberships_sorted_by_rank() {
        let mut ms = Memberships::default();
        ms.add(STD_MEMBERSHIPS, m('v', '+'));
        ms.add(STD_MEMBERSHIPS, m('q', '~'));
        ms.add(STD_MEMBERSHIPS, m('o', '@'));
        assert_eq!(ms.format(true), "~@+");
        assert_eq!(ms.format(false), "~");
    }

    #[test]
    fn memberships_no_duplicates() {
        let mut ms = Memberships::default();
        ms.add(STD_MEMBERSHIPS, m('o', '@'));
        ms.add(STD_MEMBERSHIPS, m('o', '@'));
        assert_eq!(ms.format(true), "@");
    }

    #[test]
    fn memberships_remove() {
        let mut ms = Memberships::default();
        ms.add(STD_MEMBERSHIPS, m('o', '@'));
        ms.add(STD_MEMBERSHIPS, m('v', '+'));
        ms.remove(m('o', '@'));
        assert_eq!(ms.format(true), "+");
        ms.remove(m('v', '+'));
        assert!(ms.is_empty());
    }

    #[test]
    fn user_modes_apply() {
        let mut um = UserModes::default();
        um.apply("+iw").unwrap();
        assert!(um.has('i') && um.has('w'));
        um.apply("-i+x").unwrap();
        assert!(!um.has('i'));
        assert!(um.has('x'));
        assert!(um.apply("iw").is_err());
    }

    #[test]
    fn channel_modes_format() {
        let mut cm = ChannelModes::default();
        cm.0.insert('n', String::new());
        cm.0.insert('t', String::new());
        cm.0.insert('k', "hunter2".to_string());
        let (modestring, args) = cm.format();
        assert_eq!(modestring, "+knt");
        assert_eq!(args, &["hunter2"]);
    }
}
