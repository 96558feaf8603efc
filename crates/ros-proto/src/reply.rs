//! Reply sentences: parsing device replies and synthesizing proxy replies.
//!
//! Reply tokens: `!done`, `!re` (one data row), `!trap` (logical error with
//! `=message=` and optional `=category=`), `!fatal` (terminal).  Attribute
//! words are `=key=value`; a key with no `=` separator carries an empty
//! value.

use crate::sentence::encode_sentence;

pub const TOKEN_DONE: &str = "!done";
pub const TOKEN_DATA: &str = "!re";
pub const TOKEN_TRAP: &str = "!trap";
pub const TOKEN_FATAL: &str = "!fatal";

/// Ordered attribute list of one sentence (device replies preserve order).
pub type Attrs = Vec<(String, String)>;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// One parsed reply sentence from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Done(Attrs),
    Data(Attrs),
    Trap {
        message: String,
        category: Option<String>,
    },
    Fatal(String),
}

/// Parse a decoded sentence as a reply.
///
/// Returns `None` when the first word is not a reply token (`!`-prefixed).
/// Word bytes are decoded as UTF-8 lossily; the protocol is ASCII in
/// practice and the proxy never needs the undecodable bytes back.
pub fn parse_reply(words: &[Vec<u8>]) -> Option<Reply> {
    let first = words.first()?;
    let token = String::from_utf8_lossy(first);
    match token.as_ref() {
        TOKEN_DONE => Some(Reply::Done(parse_attrs(&words[1..]))),
        TOKEN_DATA => Some(Reply::Data(parse_attrs(&words[1..]))),
        TOKEN_TRAP => {
            let attrs = parse_attrs(&words[1..]);
            let message = attrs
                .iter()
                .find(|(k, _)| k == "message")
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "unknown error".to_owned());
            let category = attrs
                .iter()
                .find(|(k, _)| k == "category")
                .map(|(_, v)| v.clone());
            Some(Reply::Trap { message, category })
        }
        TOKEN_FATAL => {
            let reason = words[1..]
                .iter()
                .map(|w| String::from_utf8_lossy(w).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            Some(Reply::Fatal(reason))
        }
        _ => None,
    }
}

/// Extract `=key=value` attribute words, preserving order.
pub fn parse_attrs(words: &[Vec<u8>]) -> Attrs {
    let mut attrs = Vec::new();
    for w in words {
        let text = String::from_utf8_lossy(w);
        let Some(rest) = text.strip_prefix('=') else {
            continue;
        };
        match rest.split_once('=') {
            Some((k, v)) => attrs.push((k.to_owned(), v.to_owned())),
            None => attrs.push((rest.to_owned(), String::new())),
        }
    }
    attrs
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Encode a successful list result: one `!re` sentence per row, then `!done`.
pub fn encode_data_reply(rows: &[Attrs]) -> Vec<u8> {
    let mut out = Vec::new();
    for row in rows {
        let mut words: Vec<Vec<u8>> = Vec::with_capacity(row.len() + 1);
        words.push(TOKEN_DATA.as_bytes().to_vec());
        for (k, v) in row {
            words.push(format!("={}={}", k, v).into_bytes());
        }
        out.extend_from_slice(&encode_sentence(&words));
    }
    out.extend_from_slice(&encode_done());
    out
}

/// Encode a bare `!done` sentence.
pub fn encode_done() -> Vec<u8> {
    encode_sentence(&[TOKEN_DONE])
}

/// Encode a single `!trap =message=<msg>` sentence with no trailing `!done`.
///
/// Used for the login-failure path, where the connection closes immediately
/// after the trap.
pub fn encode_trap_sentence(message: &str) -> Vec<u8> {
    encode_sentence(&[
        TOKEN_TRAP.as_bytes().to_vec(),
        format!("=message={}", message).into_bytes(),
    ])
}

/// Encode a logical error reply: `!trap =message=<msg>` followed by `!done`.
pub fn encode_trap_reply(message: &str) -> Vec<u8> {
    let mut out = encode_trap_sentence(message);
    out.extend_from_slice(&encode_done());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentence::SentenceDecoder;

    fn decode_all(bytes: &[u8]) -> Vec<Vec<Vec<u8>>> {
        let mut dec = SentenceDecoder::new();
        dec.push_bytes(bytes);
        let mut sentences = Vec::new();
        while let Some(s) = dec.next_sentence().expect("valid framing") {
            sentences.push(s);
        }
        sentences
    }

    #[test]
    fn data_reply_synthesizes_rows_then_done() {
        let rows = vec![vec![
            ("uptime".to_owned(), "1h".to_owned()),
            ("version".to_owned(), "7.14".to_owned()),
        ]];
        let sentences = decode_all(&encode_data_reply(&rows));
        assert_eq!(sentences.len(), 2);
        assert_eq!(
            parse_reply(&sentences[0]),
            Some(Reply::Data(vec![
                ("uptime".to_owned(), "1h".to_owned()),
                ("version".to_owned(), "7.14".to_owned()),
            ]))
        );
        assert_eq!(parse_reply(&sentences[1]), Some(Reply::Done(vec![])));
    }

    #[test]
    fn empty_result_is_a_lone_done() {
        let sentences = decode_all(&encode_data_reply(&[]));
        assert_eq!(sentences.len(), 1);
        assert_eq!(parse_reply(&sentences[0]), Some(Reply::Done(vec![])));
    }

    #[test]
    fn trap_reply_carries_message_and_done() {
        let sentences = decode_all(&encode_trap_reply("no such chain"));
        assert_eq!(sentences.len(), 2);
        assert_eq!(
            parse_reply(&sentences[0]),
            Some(Reply::Trap {
                message: "no such chain".to_owned(),
                category: None,
            })
        );
        assert_eq!(parse_reply(&sentences[1]), Some(Reply::Done(vec![])));
    }

    #[test]
    fn trap_without_message_attr_gets_a_placeholder() {
        let sentence = vec![b"!trap".to_vec(), b"=category=4".to_vec()];
        assert_eq!(
            parse_reply(&sentence),
            Some(Reply::Trap {
                message: "unknown error".to_owned(),
                category: Some("4".to_owned()),
            })
        );
    }

    #[test]
    fn attr_without_value_separator_has_empty_value() {
        let attrs = parse_attrs(&[b"=disabled".to_vec()]);
        assert_eq!(attrs, vec![("disabled".to_owned(), String::new())]);
    }

    #[test]
    fn non_reply_sentences_parse_as_none() {
        assert_eq!(parse_reply(&[b"/login".to_vec()]), None);
        assert_eq!(parse_reply(&[]), None);
    }
}
