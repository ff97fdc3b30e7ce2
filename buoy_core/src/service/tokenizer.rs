//! Tokenizer for service command lines: space-separated words with
//! backslash escapes and single- or double-quoted spans.

use crate::{Error, Result};

pub fn tokenize(s: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut last_word = String::new();
    let mut escape = false;
    let mut prev = ' ';
    let mut word_delim = ' ';

    for r in s.chars() {
        if escape {
            // last char was a backslash, take this one as-is
            last_word.push(r);
            escape = false;
        } else if r == '\\' {
            escape = true;
        } else if word_delim == ' ' && r.is_whitespace() {
            // end of last word
            if !prev.is_whitespace() {
                words.push(std::mem::take(&mut last_word));
            }
        } else if r == word_delim {
            // word_delim is either " or ', switch back to space-delimited
            word_delim = ' ';
        } else if r == '"' || r == '\'' {
            if word_delim == ' ' {
                // start of (double-)quoted word
                word_delim = r;
            } else {
                // either word_delim is " and r is ' or vice-versa
                last_word.push(r);
            }
        } else {
            last_word.push(r);
        }

        prev = r;
    }

    if !prev.is_whitespace() {
        words.push(last_word);
    }

    if word_delim != ' ' {
        return Err(Error::parse("unterminated quoted string"));
    }
    if escape {
        return Err(Error::parse("unterminated backslash sequence"));
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tokens(input: &str, expected: &[&str]) {
        assert_eq!(tokenize(input).unwrap(), expected);
    }

    #[test]
    fn simple_words() {
        assert_tokens("network status", &["network", "status"]);
        assert_tokens("  network   status  ", &["network", "status"]);
    }

    #[test]
    fn quoted_and_escaped() {
        assert_tokens(
            r#"sasl set-plain net1 "al ice" it\ is"#,
            &["sasl", "set-plain", "net1", "al ice", "it is"],
        );
    }

    #[test]
    fn mixed_quotes() {
        assert_tokens(r#"say "it's fine""#, &["say", "it's fine"]);
        assert_tokens(r#"say 'he said "hi"'"#, &["say", r#"he said "hi""#]);
    }

    #[test]
    fn empty_quoted_word() {
        assert_tokens(r#"update -name """#, &["update", "-name", ""]);
    }

    #[test]
    fn unterminated_quote() {
        let err = tokenize(r#"say "oops"#).unwrap_err();
        assert_eq!(err.to_string(), "unterminated quoted string");
    }

    #[test]
    fn unterminated_backslash() {
        let err = tokenize(r"say oops\").unwrap_err();
        assert_eq!(err.to_string(), "unterminated backslash sequence");
    }

    #[test]
    fn round_trip_with_standard_quoting() {
        // Joining tokens with quoting and re-tokenizing yields the same list
        let tokens = tokenize(r#"a "b c" d\"e"#).unwrap();
        let rejoined = tokens
            .iter()
            .map(|t| {
                if t.is_empty() || t.contains(' ') || t.contains('"') {
                    format!("\"{}\"", t.replace('\\', "\\\\").replace('"', "\\\""))
                } else {
                    t.replace('\\', "\\\\")
                }
            })
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(tokenize(&rejoined).unwrap(), tokens);
    }
}
