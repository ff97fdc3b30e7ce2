use crate::message::{Message, MAX_MESSAGE_LEN};

/// Group channels (and their keys) into as few JOIN messages as fit under
/// the wire limit. Channels with a key are put first so that the keys
/// parameter lines up.
pub fn join_messages(channels: &[(String, String)]) -> Vec<Message> {
    let mut channels: Vec<_> = channels.to_vec();
    channels.sort_by(|(a_name, a_key), (b_name, b_key)| {
        b_key
            .is_empty()
            .cmp(&a_key.is_empty())
            .then_with(|| a_name.cmp(b_name))
    });

    // Two spaces because there are three words (JOIN, channels and keys)
    let max_length = MAX_MESSAGE_LEN - ("JOIN".len() + 2);

    let mut msgs = Vec::new();
    let mut channels_buf = String::new();
    let mut keys_buf = String::new();

    let flush = |msgs: &mut Vec<Message>, channels_buf: &mut String, keys_buf: &mut String| {
        if channels_buf.is_empty() {
            return;
        }
        let mut params = vec![std::mem::take(channels_buf)];
        if !keys_buf.is_empty() {
            params.push(std::mem::take(keys_buf));
        }
        msgs.push(Message::new("JOIN", params));
    };

    for (channel, key) in &channels {
        let mut n = channels_buf.len() + keys_buf.len() + 1 + channel.len();
        if !key.is_empty() {
            n += 1 + key.len();
        }

        if !channels_buf.is_empty() && n > max_length {
            flush(&mut msgs, &mut channels_buf, &mut keys_buf);
        }

        if !channels_buf.is_empty() {
            channels_buf.push(',');
        }
        channels_buf.push_str(channel);
        if !key.is_empty() {
            if !keys_buf.is_empty() {
                keys_buf.push(',');
            }
            keys_buf.push_str(key);
        }
    }
    flush(&mut msgs, &mut channels_buf, &mut keys_buf);

    msgs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_channels_first() {
        let msgs = join_messages(&[
            ("#b".to_string(), String::new()),
            ("#a".to_string(), "key".to_string()),
        ]);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].params, &["#a,#b", "key"]);
    }

    #[test]
    fn splits_over_limit() {
        let channels: Vec<_> = (0..100)
            .map(|i| (format!("#channel-with-a-long-name-{i:03}"), String::new()))
            .collect();
        let msgs = join_messages(&channels);
        assert!(msgs.len() > 1);
        for msg in &msgs {
            assert!(msg.to_string().len() + 2 <= MAX_MESSAGE_LEN);
        }
        let total: usize = msgs
            .iter()
            .map(|m| m.params[0].split(',').count())
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn empty() {
        assert!(join_messages(&[]).is_empty());
    }
}
