//! Secret scrubbing for stored body snippets and log lines.

use regex::Regex;
use std::sync::LazyLock;

const REDACTED: &str = "[REDACTED]";

static SK_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"sk-[A-Za-z0-9_\-]{8,}").expect("valid regex"));

static BEARER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(bearer\s+)[A-Za-z0-9._~+/=\-]+").expect("valid regex"));

static JSON_KEY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)("(?:api_key|api-key|apikey|x-api-key|x-goog-api-key|key)"\s*:\s*)"[^"]*""#)
        .expect("valid regex")
});

static QUERY_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([?&]key=)[^&\s\x22]+").expect("valid regex"));

pub fn redact(text: &str) -> String {
    let text = SK_KEY.replace_all(text, REDACTED);
    let text = BEARER.replace_all(&text, format!("${{1}}{}", REDACTED));
    let text = JSON_KEY_FIELD.replace_all(&text, format!("${{1}}\"{}\"", REDACTED));
    QUERY_KEY
        .replace_all(&text, format!("${{1}}{}", REDACTED))
        .into_owned()
}

/// Truncate to at most `limit` bytes without splitting a character.
pub fn cap(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Redacted, capped view of a request or response body.
pub fn snippet(body: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(body);
    cap(&redact(&text), limit).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_common_secret_shapes() {
        let input = r#"{"api_key": "abc123", "auth": "Bearer eyJhbGciOi.x-y", "k": "sk-proj-ABCDEFGH12345678"} https://g.example/v1?alt=sse&key=AIzaSyXYZ"#;
        let out = redact(input);
        assert!(!out.contains("abc123"));
        assert!(!out.contains("eyJhbGciOi"));
        assert!(!out.contains("sk-proj-ABCDEFGH"));
        assert!(!out.contains("AIzaSyXYZ"));
        assert!(out.contains(r#""api_key": "[REDACTED]""#));
        assert!(out.contains("Bearer [REDACTED]"));
        assert!(out.contains("&key=[REDACTED]"));
    }

    #[test]
    fn leaves_ordinary_text_alone() {
        let input = r#"{"model":"gpt-4o","messages":[{"role":"user","content":"ask about keys"}]}"#;
        assert_eq!(redact(input), input);
    }

    #[test]
    fn cap_respects_char_boundaries() {
        let text = "héllo";
        assert_eq!(cap(text, 2), "h");
        assert_eq!(cap(text, 3), "hé");
        assert_eq!(cap(text, 100), text);
    }

    #[test]
    fn snippet_caps_after_redaction() {
        let body = br#"{"x-api-key":"secret-value-that-is-long"}"#;
        let s = snippet(body, 16);
        assert!(s.len() <= 16);
        assert!(!s.contains("secret"));
    }
}
