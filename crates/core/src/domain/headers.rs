// Message headers and republish bookkeeping

use std::collections::BTreeMap;

use serde_json::Value;

use super::message::ReceivedMessage;

/// Message headers (string keys, JSON values)
pub type Headers = BTreeMap<String, Value>;

/// Tag the message carried before its first republish
pub const ORIGINAL_TAG_HEADER: &str = "Original-Tag";

/// Number of times the message has been republished
pub const REPUBLISH_COUNT_HEADER: &str = "Republish-Count";

/// Republish count recorded in `headers` (0 when absent)
pub fn republish_count(headers: &Headers) -> u64 {
    headers
        .get(REPUBLISH_COUNT_HEADER)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Headers for a republished copy of `msg`
///
/// The count goes up by exactly one. The original tag is stamped only if no
/// earlier republish stamped it already.
pub fn republish_headers(msg: &ReceivedMessage) -> Headers {
    let mut headers = msg.headers().clone();
    let count = republish_count(&headers) + 1;
    headers.insert(REPUBLISH_COUNT_HEADER.to_string(), Value::from(count));
    headers
        .entry(ORIGINAL_TAG_HEADER.to_string())
        .or_insert_with(|| Value::from(msg.routing_key()));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_republish_count_defaults_to_zero() {
        assert_eq!(republish_count(&Headers::new()), 0);
        let mut headers = Headers::new();
        headers.insert(REPUBLISH_COUNT_HEADER.to_string(), json!(3));
        assert_eq!(republish_count(&headers), 3);
    }

    #[test]
    fn test_republish_headers_preserve_original_tag() {
        let mut headers = Headers::new();
        headers.insert("bar".to_string(), json!(123));
        let first = ReceivedMessage::listener(json!({"a": 1}), "foo", headers);

        let once = republish_headers(&first);
        assert_eq!(once["bar"], json!(123));
        assert_eq!(once[REPUBLISH_COUNT_HEADER], json!(1));
        assert_eq!(once[ORIGINAL_TAG_HEADER], json!("foo"));

        // the copy arrives routed by queue name, the original tag survives
        let second = ReceivedMessage::listener(json!({"a": 1}), "work-queue", once);
        let twice = republish_headers(&second);
        assert_eq!(twice[REPUBLISH_COUNT_HEADER], json!(2));
        assert_eq!(twice[ORIGINAL_TAG_HEADER], json!("foo"));
    }
}
