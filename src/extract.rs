//! Best-effort recovery of the JSON assessment from free-form model output.

use serde_json::{Value, json};

/// Byte offsets of the first `{` and the last `}` when they form a span.
fn json_bounds(text: &str) -> Option<(usize, usize)> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then_some((start, end))
}

/// Parses the span between the first `{` and the last `}` of `text`.
///
/// Without such a span the raw text comes back as `{"result": text}`, with no
/// `"error"`. That includes output cut off after its opening `{`, before any
/// `}`. When the span is not valid JSON the parser message is attached under
/// `"error"`. A successful parse is returned untouched; its shape is not
/// checked.
pub fn extract_json(text: &str) -> Value {
    let Some((start, end)) = json_bounds(text) else {
        tracing::warn!(bytes = text.len(), "no JSON object in model output");
        return json!({ "result": text });
    };

    // Both delimiters are single-byte, so the slice is on char boundaries.
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "model output is not valid JSON");
            json!({ "result": text, "error": err.to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_embedded_object() {
        let value = extract_json("blah {\"score\": 90} blah");
        assert_eq!(value, json!({ "score": 90 }));
    }

    #[test]
    fn returns_full_assessment_unvalidated() {
        let text = r#"Here is the result:
{
  "matching_analysis": "Strong Python and ML background.",
  "description": "Good fit.",
  "score": 185,
  "recommendation": "Highlight web framework experience."
}"#;
        let value = extract_json(text);
        assert_eq!(value["score"], json!(185));
        assert_eq!(value["description"], json!("Good fit."));
        assert!(value.get("result").is_none());
    }

    #[test]
    fn no_braces_yields_raw_result() {
        assert_eq!(
            extract_json("no braces here"),
            json!({ "result": "no braces here" })
        );
    }

    #[test]
    fn empty_text_yields_raw_result() {
        assert_eq!(extract_json(""), json!({ "result": "" }));
    }

    #[test]
    fn invalid_json_carries_error() {
        let value = extract_json("{not json}");
        assert_eq!(value["result"], json!("{not json}"));
        let error = value["error"].as_str().unwrap();
        assert!(!error.is_empty());
    }

    #[test]
    fn truncated_before_closing_brace_falls_back() {
        let text = "{\"matching_analysis\": \"The candidate has three years of Pyt";
        assert_eq!(extract_json(text), json!({ "result": text }));
    }

    #[test]
    fn opening_brace_alone_has_no_error() {
        let value = extract_json("{\"score\": 8");
        assert_eq!(value, json!({ "result": "{\"score\": 8" }));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn truncated_after_nested_object_reports_error() {
        let text = "{\"details\": {\"skills\": 4}, \"score\": 7";
        let value = extract_json(text);
        assert_eq!(value["result"], json!(text));
        assert!(value["error"].as_str().is_some());
    }

    #[test]
    fn reversed_braces_are_not_a_span() {
        assert_eq!(extract_json("} oops {"), json!({ "result": "} oops {" }));
    }

    #[test]
    fn multibyte_text_around_object() {
        let value = extract_json("Kết quả: {\"score\": 72} xong");
        assert_eq!(value, json!({ "score": 72 }));
    }
}
