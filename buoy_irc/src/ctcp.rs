use crate::message::Message;

/// Extract a CTCP command and parameters from a PRIVMSG or NOTICE whose
/// trailing parameter is wrapped in `\x01`
pub fn parse_ctcp(msg: &Message) -> Option<(String, String)> {
    if (msg.command != "PRIVMSG" && msg.command != "NOTICE") || msg.params.len() < 2 {
        return None;
    }
    let text = &msg.params[1];
    if !text.starts_with('\x01') {
        return None;
    }
    let text = text.trim_matches('\x01');

    match text.split_once(' ') {
        Some((cmd, params)) => Some((cmd.to_ascii_uppercase(), params.to_string())),
        None => Some((text.to_ascii_uppercase(), String::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action() {
        let msg: Message = "PRIVMSG #chan :\x01ACTION waves\x01".parse().unwrap();
        assert_eq!(
            parse_ctcp(&msg),
            Some(("ACTION".to_string(), "waves".to_string()))
        );
    }

    #[test]
    fn version_no_params() {
        let msg: Message = "PRIVMSG nick :\x01VERSION\x01".parse().unwrap();
        assert_eq!(
            parse_ctcp(&msg),
            Some(("VERSION".to_string(), String::new()))
        );
    }

    #[test]
    fn not_ctcp() {
        let msg: Message = "PRIVMSG #chan :hello".parse().unwrap();
        assert_eq!(parse_ctcp(&msg), None);

        let msg: Message = "JOIN #chan".parse().unwrap();
        assert_eq!(parse_ctcp(&msg), None);
    }
}
