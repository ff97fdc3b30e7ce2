use std::collections::HashMap;

use crate::modes::{std_channel_modes, ChannelModeType, Membership, STD_MEMBERSHIPS};

/// Nick and channel name casemapping, per the upstream's 005 CASEMAPPING
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseMapping {
    #[default]
    Ascii,
    Rfc1459,
}

impl CaseMapping {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ascii" => Some(Self::Ascii),
            "rfc1459" => Some(Self::Rfc1459),
            _ => None,
        }
    }

    /// Canonicalise an identifier for comparison and map keys
    pub fn fold(&self, s: &str) -> String {
        s.chars()
            .map(|c| match (self, c) {
                (Self::Rfc1459, '{') => '[',
                (Self::Rfc1459, '}') => ']',
                (Self::Rfc1459, '|') => '\\',
                (Self::Rfc1459, '~') => '^',
                (_, c) => c.to_ascii_lowercase(),
            })
            .collect()
    }
}

/// The subset of RPL_ISUPPORT state the bouncer tracks. Unknown tokens are
/// ignored.
#[derive(Debug, Clone)]
pub struct Isupport {
    pub available_memberships: Vec<Membership>,
    pub available_channel_modes: HashMap<char, ChannelModeType>,
    pub chan_types: String,
    pub case_mapping: CaseMapping,
    pub network: Option<String>,
}

impl Default for Isupport {
    fn default() -> Self {
        Self {
            available_memberships: STD_MEMBERSHIPS.to_vec(),
            available_channel_modes: std_channel_modes(),
            chan_types: "#&+!".to_string(),
            case_mapping: CaseMapping::default(),
            network: None,
        }
    }
}

impl Isupport {
    /// Apply one token from a 005 reply
    pub fn apply_token(&mut self, token: &str) {
        if token.starts_with('-') {
            // negation resets a token to its default; we only track a few,
            // so drop back to the default struct values
            let defaults = Self::default();
            match &token[1..] {
                "PREFIX" => self.available_memberships = defaults.available_memberships,
                "CHANMODES" => self.available_channel_modes = defaults.available_channel_modes,
                "CHANTYPES" => self.chan_types = defaults.chan_types,
                "CASEMAPPING" => self.case_mapping = defaults.case_mapping,
                "NETWORK" => self.network = None,
                _ => (),
            }
            return;
        }

        let (name, value) = match token.split_once('=') {
            Some((name, value)) => (name, value),
            None => (token, ""),
        };

        match name {
            "PREFIX" => {
                if let Some(memberships) = parse_prefix(value) {
                    self.available_memberships = memberships;
                }
            }
            "CHANMODES" => {
                if let Some(modes) = parse_chanmodes(value) {
                    self.available_channel_modes = modes;
                }
            }
            "CHANTYPES" => self.chan_types = value.to_string(),
            "CASEMAPPING" => {
                if let Some(cm) = CaseMapping::parse(value) {
                    self.case_mapping = cm;
                }
            }
            "NETWORK" => self.network = Some(value.to_string()),
            _ => (),
        }
    }

    pub fn is_channel(&self, name: &str) -> bool {
        name.starts_with(|c| self.chan_types.contains(c))
    }
}

// "(qaohv)~&@%+" -> memberships in rank order
fn parse_prefix(value: &str) -> Option<Vec<Membership>> {
    if value.is_empty() {
        return Some(Vec::new());
    }
    let rest = value.strip_prefix('(')?;
    let (modes, prefixes) = rest.split_once(')')?;
    if modes.chars().count() != prefixes.chars().count() {
        return None;
    }
    Some(
        modes
            .chars()
            .zip(prefixes.chars())
            .map(|(mode, prefix)| Membership { mode, prefix })
            .collect(),
    )
}

// "b,k,l,imnst" -> letter to type map
fn parse_chanmodes(value: &str) -> Option<HashMap<char, ChannelModeType>> {
    let types = [
        ChannelModeType::A,
        ChannelModeType::B,
        ChannelModeType::C,
        ChannelModeType::D,
    ];
    let mut out = HashMap::new();
    for (letters, mode_type) in value.splitn(4, ',').zip(types) {
        for letter in letters.chars() {
            out.insert(letter, mode_type);
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_token() {
        let mut isupport = Isupport::default();
        isupport.apply_token("PREFIX=(ov)@+");
        assert_eq!(
            isupport.available_memberships,
            vec![
                Membership {
                    mode: 'o',
                    prefix: '@'
                },
                Membership {
                    mode: 'v',
                    prefix: '+'
                },
            ]
        );
    }

    #[test]
    fn chanmodes_token() {
        let mut isupport = Isupport::default();
        isupport.apply_token("CHANMODES=beI,k,l,imnst");
        assert_eq!(
            isupport.available_channel_modes.get(&'e'),
            Some(&ChannelModeType::A)
        );
        assert_eq!(
            isupport.available_channel_modes.get(&'k'),
            Some(&ChannelModeType::B)
        );
        assert_eq!(
            isupport.available_channel_modes.get(&'l'),
            Some(&ChannelModeType::C)
        );
        assert_eq!(
            isupport.available_channel_modes.get(&'m'),
            Some(&ChannelModeType::D)
        );
    }

    #[test]
    fn casemapping_fold() {
        assert_eq!(CaseMapping::Ascii.fold("Nick{}"), "nick{}");
        assert_eq!(CaseMapping::Rfc1459.fold("Nick{}|~"), "nick[]\\^");
    }

    #[test]
    fn unknown_tokens_ignored() {
        let mut isupport = Isupport::default();
        isupport.apply_token("WHOX");
        isupport.apply_token("TARGMAX=NAMES:1");
        assert_eq!(isupport.chan_types, "#&+!");
    }

    #[test]
    fn network_token() {
        let mut isupport = Isupport::default();
        isupport.apply_token("NETWORK=ExampleNet");
        assert_eq!(isupport.network.as_deref(), Some("ExampleNet"));
        isupport.apply_token("-NETWORK");
        assert_eq!(isupport.network, None);
    }
}
