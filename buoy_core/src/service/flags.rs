//! Typed flag parsing for service commands.
//!
//! Optional string and boolean flags are tri-state: a missing flag is
//! distinguishable from one explicitly set to the empty string or to
//! `false`.

use std::collections::{BTreeMap, HashMap};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagKind {
    /// Takes a value; last occurrence wins
    String,
    /// Takes a value that must parse as a boolean
    Bool,
    /// Boolean set by presence alone; an explicit `-flag=value` also works
    Presence,
    /// Takes a value; occurrences accumulate
    Repeated,
}

/// A set of defined flags and, after [`FlagSet::parse`], their values.
///
/// Parsing stops at the first argument that is not a flag; the rest are
/// positional arguments.
#[derive(Debug, Default)]
pub struct FlagSet {
    kinds: BTreeMap<&'static str, FlagKind>,
    values: HashMap<&'static str, Vec<String>>,
    present: HashMap<&'static str, bool>,
    args: Vec<String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string_flag(mut self, name: &'static str) -> Self {
        self.kinds.insert(name, FlagKind::String);
        self
    }

    pub fn bool_flag(mut self, name: &'static str) -> Self {
        self.kinds.insert(name, FlagKind::Bool);
        self
    }

    pub fn presence_flag(mut self, name: &'static str) -> Self {
        self.kinds.insert(name, FlagKind::Presence);
        self
    }

    pub fn repeated_flag(mut self, name: &'static str) -> Self {
        self.kinds.insert(name, FlagKind::Repeated);
        self
    }

    pub fn parse(mut self, params: &[String]) -> Result<Self> {
        let mut iter = params.iter().peekable();
        while let Some(param) = iter.peek().copied() {
            let stripped = param
                .strip_prefix("--")
                .or_else(|| param.strip_prefix('-'));
            let Some(stripped) = stripped else {
                break;
            };
            if param == "--" {
                iter.next();
                break;
            }
            if stripped.is_empty() || stripped.starts_with('-') {
                break;
            }
            iter.next();

            let (name, inline_value) = match stripped.split_once('=') {
                Some((name, value)) => (name, Some(value.to_string())),
                None => (stripped, None),
            };

            let Some((&name, &kind)) = self.kinds.get_key_value(name) else {
                return Err(Error::parse(format!(
                    "flag provided but not defined: -{name}"
                )));
            };

            let value = match (kind, inline_value) {
                (FlagKind::Presence, None) => {
                    self.present.insert(name, true);
                    continue;
                }
                (FlagKind::Presence, Some(value)) => {
                    let parsed = parse_bool(&value).ok_or_else(|| {
                        Error::parse(format!("invalid boolean value {value:?} for -{name}"))
                    })?;
                    self.present.insert(name, parsed);
                    continue;
                }
                (_, Some(value)) => value,
                (_, None) => iter
                    .next()
                    .cloned()
                    .ok_or_else(|| Error::parse(format!("flag needs an argument: -{name}")))?,
            };

            if kind == FlagKind::Bool && parse_bool(&value).is_none() {
                return Err(Error::parse(format!(
                    "invalid boolean value {value:?} for -{name}"
                )));
            }
            self.values.entry(name).or_default().push(value);
        }

        self.args = iter.cloned().collect();
        Ok(self)
    }

    /// Positional arguments remaining after the flags
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Tri-state string flag: `None` when the flag wasn't given
    pub fn string(&self, name: &str) -> Option<String> {
        self.values.get(name).and_then(|v| v.last().cloned())
    }

    /// Tri-state boolean flag
    pub fn boolean(&self, name: &str) -> Option<bool> {
        self.values
            .get(name)
            .and_then(|v| v.last())
            .and_then(|v| parse_bool(v))
    }

    /// Presence flag: true when given without (or with a truthy) value
    pub fn is_present(&self, name: &str) -> bool {
        self.present.get(name).copied().unwrap_or(false)
    }

    /// Repeated string flag: `None` when never given
    pub fn repeated(&self, name: &str) -> Option<Vec<String>> {
        self.values.get(name).cloned()
    }

    /// String flag with a default value
    pub fn string_or(&self, name: &str, default: &str) -> String {
        self.string(name).unwrap_or_else(|| default.to_string())
    }

    /// Integer flag with a default value
    pub fn int_or(&self, name: &str, default: i64) -> Result<i64> {
        match self.string(name) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| Error::parse(format!("invalid value {value:?} for -{name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn network_flags() -> FlagSet {
        FlagSet::new()
            .string_flag("addr")
            .string_flag("name")
            .string_flag("nick")
            .bool_flag("enabled")
            .repeated_flag("connect-command")
    }

    #[test]
    fn tri_state_string() {
        let fs = network_flags().parse(&params(&["-name", ""])).unwrap();
        assert_eq!(fs.string("name"), Some(String::new()));
        assert_eq!(fs.string("addr"), None);
    }

    #[test]
    fn tri_state_bool() {
        let fs = network_flags()
            .parse(&params(&["-enabled", "false"]))
            .unwrap();
        assert_eq!(fs.boolean("enabled"), Some(false));

        let fs = network_flags().parse(&params(&[])).unwrap();
        assert_eq!(fs.boolean("enabled"), None);

        let err = network_flags()
            .parse(&params(&["-enabled", "maybe"]))
            .unwrap_err();
        assert!(err.to_string().contains("invalid boolean value"));
    }

    #[test]
    fn repeated() {
        let fs = network_flags()
            .parse(&params(&[
                "-connect-command",
                "JOIN #x",
                "-connect-command",
                "JOIN #y",
            ]))
            .unwrap();
        assert_eq!(
            fs.repeated("connect-command"),
            Some(vec!["JOIN #x".to_string(), "JOIN #y".to_string()])
        );
        assert_eq!(fs.repeated("addr"), None);
    }

    #[test]
    fn presence() {
        let fs = FlagSet::new()
            .presence_flag("admin")
            .parse(&params(&["-admin"]))
            .unwrap();
        assert!(fs.is_present("admin"));

        let fs = FlagSet::new()
            .presence_flag("admin")
            .parse(&params(&[]))
            .unwrap();
        assert!(!fs.is_present("admin"));
    }

    #[test]
    fn unknown_flag() {
        let err = network_flags().parse(&params(&["-bogus", "x"])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "flag provided but not defined: -bogus"
        );
    }

    #[test]
    fn missing_value() {
        let err = network_flags().parse(&params(&["-addr"])).unwrap_err();
        assert_eq!(err.to_string(), "flag needs an argument: -addr");
    }

    #[test]
    fn stops_at_positional() {
        let fs = network_flags()
            .parse(&params(&["-addr", "ircs://x", "libera", "-more"]))
            .unwrap();
        assert_eq!(fs.string("addr"), Some("ircs://x".to_string()));
        assert_eq!(fs.args(), &["libera", "-more"]);
    }

    #[test]
    fn inline_value() {
        let fs = network_flags()
            .parse(&params(&["-addr=ircs://irc.example.org"]))
            .unwrap();
        assert_eq!(fs.string("addr"), Some("ircs://irc.example.org".to_string()));
    }
}
