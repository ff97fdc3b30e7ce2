//! IRCv3 capabilities spoken on the downstream and upstream sides.

use std::collections::HashSet;

use itertools::Itertools;
use strum::IntoEnumIterator;

/// Capabilities the bouncer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
pub enum Cap {
    ServerTime,
    Batch,
    MessageTags,
    LabeledResponse,
    AwayNotify,
    AccountNotify,
    ExtendedJoin,
    MultiPrefix,
    Sasl,
    ChatHistory,
}

impl Cap {
    /// On-the-wire name of the capability
    pub fn name(self) -> &'static str {
        match self {
            Self::ServerTime => "server-time",
            Self::Batch => "batch",
            Self::MessageTags => "message-tags",
            Self::LabeledResponse => "labeled-response",
            Self::AwayNotify => "away-notify",
            Self::AccountNotify => "account-notify",
            Self::ExtendedJoin => "extended-join",
            Self::MultiPrefix => "multi-prefix",
            Self::Sasl => "sasl",
            Self::ChatHistory => "draft/chathistory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::iter().find(|cap| cap.name() == name)
    }

    /// The value advertised in a 302 `CAP LS`, if any
    pub fn ls_value(self, downstream: bool) -> Option<&'static str> {
        match (self, downstream) {
            (Self::Sasl, true) => Some("PLAIN"),
            _ => None,
        }
    }
}

/// The capability set negotiated on one connection
#[derive(Debug, Clone, Default)]
pub struct CapSet(HashSet<Cap>);

impl CapSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, cap: Cap) -> bool {
        self.0.contains(&cap)
    }

    pub fn set(&mut self, cap: Cap) {
        self.0.insert(cap);
    }

    pub fn unset(&mut self, cap: Cap) {
        self.0.remove(&cap);
    }

    pub fn iter(&self) -> impl Iterator<Item = Cap> + '_ {
        self.0.iter().copied()
    }
}

/// The `CAP LS` line offered to downstreams
pub fn downstream_ls() -> String {
    Cap::iter()
        .map(|cap| match cap.ls_value(true) {
            Some(value) => format!("{}={}", cap.name(), value),
            None => cap.name().to_string(),
        })
        .join(" ")
}

/// The capabilities requested from an upstream, as the intersection of what
/// we speak with what the server offered
pub fn upstream_request(offered: &HashSet<String>) -> Vec<Cap> {
    Cap::iter()
        .filter(|cap| *cap != Cap::ChatHistory)
        .filter(|cap| offered.contains(cap.name()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        for cap in Cap::iter() {
            assert_eq!(Cap::from_name(cap.name()), Some(cap));
        }
        assert_eq!(Cap::from_name("no-such-cap"), None);
    }

    #[test]
    fn ls_advertises_sasl_mechanisms() {
        assert!(downstream_ls().contains("sasl=PLAIN"));
    }

    #[test]
    fn upstream_request_is_intersection() {
        let offered: HashSet<String> = ["server-time", "sasl", "unknown-cap"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let req = upstream_request(&offered);
        assert!(req.contains(&Cap::ServerTime));
        assert!(req.contains(&Cap::Sasl));
        assert_eq!(req.len(), 2);
    }
}
