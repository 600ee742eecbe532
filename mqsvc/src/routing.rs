//! Routing-key matching per exchange type

use crate::address::ExchangeType;
use crate::{Error, Result};

/// Does `routing_key` satisfy a binding `pattern` on an exchange of `exchange_type`?
///
/// Direct exchanges compare exactly, fanout exchanges accept everything,
/// topic exchanges use [`topic_matches`]. Other exchange types are rejected.
pub fn matches(exchange_type: &ExchangeType, pattern: &str, routing_key: &str) -> Result<bool> {
    match exchange_type {
        ExchangeType::Direct => Ok(pattern == routing_key),
        ExchangeType::Topic => Ok(topic_matches(pattern, routing_key)),
        ExchangeType::Fanout => Ok(true),
        other => Err(Error::not_supported(format!(
            "routing-key matching for exchange type '{other}'"
        ))),
    }
}

/// Anchored, case-sensitive topic match.
///
/// `*` spans exactly one non-empty dot-free segment; `#` spans any run of
/// characters, separators included. The dots written around a wildcard stay
/// literal, so `A.B.#` needs something after `A.B.`.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // Exact match
    if pattern == routing_key {
        return true;
    }
    match_from(pattern.as_bytes(), routing_key.as_bytes())
}

fn match_from(pattern: &[u8], key: &[u8]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((b'#', rest)) => (0..=key.len()).any(|skip| match_from(rest, &key[skip..])),
        Some((b'*', rest)) => {
            let segment = key.iter().take_while(|&&c| c != b'.').count();
            (1..=segment).any(|skip| match_from(rest, &key[skip..]))
        }
        Some((&literal, rest)) => match key.split_first() {
            Some((&c, key_rest)) if c == literal => match_from(rest, key_rest),
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_is_exact() {
        let direct = ExchangeType::Direct;
        assert!(matches(&direct, "A.B.C.D", "A.B.C.D").unwrap());
        assert!(!matches(&direct, "A.B.C.D", "A.B.C.X").unwrap());
        assert!(!matches(&direct, "A.*.C.D", "A.B.C.D").unwrap());
        assert!(!matches(&direct, "key", "KEY").unwrap());
    }

    #[test]
    fn test_single_segment_wildcard() {
        assert!(topic_matches("A.*.C.D", "A.B.C.D"));
        assert!(!topic_matches("A.*.C.D", "A.B.C"));
        assert!(!topic_matches("A.*.C.D", "A.B.X.C.D"));
        assert!(!topic_matches("A.*.C.D", "A..C.D"));
    }

    #[test]
    fn test_multi_segment_wildcard() {
        assert!(topic_matches("A.#.C.D", "A.B1.B2.B3.C.D"));
        assert!(topic_matches("A.#.C.D", "A.B.C.D"));
        assert!(!topic_matches("A.#.C.D", "A1.B.C.D"));
        assert!(!topic_matches("A.#.C.D", "A.B.C.B.D"));
        assert!(!topic_matches("A.B.#", "A.B"));
        assert!(topic_matches("A.B.#", "A.B.C"));
        assert!(topic_matches("#", "anything.at.all"));
    }

    #[test]
    fn test_anchored_and_case_sensitive() {
        assert!(!topic_matches("B.C", "A.B.C"));
        assert!(!topic_matches("A.B", "A.B.C"));
        assert!(!topic_matches("a.*", "A.B"));
    }

    #[test]
    fn test_fanout_and_unsupported() {
        assert!(matches(&ExchangeType::Fanout, "", "whatever").unwrap());
        let err = matches(&ExchangeType::Headers, "x", "x").unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
        let err = matches(&ExchangeType::Other("x-delay".into()), "x", "x").unwrap_err();
        assert!(matches!(err, Error::NotSupported { .. }));
    }
}
