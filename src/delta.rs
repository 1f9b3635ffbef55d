//! data payload -> incremental text.

use serde_json::Value;
use thiserror::Error;

/// parsed data frame. `text_fragment` is `None` for control payloads
/// (role-only deltas, finish reasons, usage blocks, unknown shapes).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaEvent {
    pub text_fragment: Option<String>,
}

/// the payload is not (yet) a complete json document.
///
/// not a protocol violation: the caller parks the payload and retries once
/// the next line has been decoded.
#[derive(Debug, Error)]
#[error("incomplete payload: {0}")]
pub struct RetryableParseError(#[from] serde_json::Error);

/// extract `choices[0].delta.content` from one data payload.
pub fn extract(payload: &str) -> Result<DeltaEvent, RetryableParseError> {
    let doc: Value = serde_json::from_str(payload)?;
    let text_fragment = doc
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(DeltaEvent { text_fragment })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_delta() {
        let ev = extract(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#).unwrap();
        assert_eq!(ev.text_fragment.as_deref(), Some("Hi"));
    }

    #[test]
    fn only_first_choice_is_used() {
        let ev = extract(r#"{"choices":[{"delta":{"content":"a"}},{"delta":{"content":"b"}}]}"#)
            .unwrap();
        assert_eq!(ev.text_fragment.as_deref(), Some("a"));
    }

    #[test]
    fn control_payloads_have_no_fragment() {
        for payload in [
            r#"{"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"{"choices":[]}"#,
            r#"{"usage":{"total_tokens":3}}"#,
            r#"{"choices":[{"delta":{"content":null}}]}"#,
            r#"{"choices":[{"delta":{"content":42}}]}"#,
            r#"[1,2,3]"#,
            r#""text""#,
        ] {
            assert_eq!(extract(payload).unwrap(), DeltaEvent::default(), "{payload}");
        }
    }

    #[test]
    fn truncated_document_is_retryable() {
        assert!(extract(r#"{"choices":[{"delta":"#).is_err());
        assert!(extract("").is_err());
    }

    #[test]
    fn document_rejoined_with_newline_parses() {
        let joined = format!("{}\n{}", r#"{"choices":[{"delta":"#, r#"{"content":"x"}}]}"#);
        assert_eq!(extract(&joined).unwrap().text_fragment.as_deref(), Some("x"));
    }
}
