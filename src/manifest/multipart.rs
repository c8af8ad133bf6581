//! multipart/mixed framing for manifest responses.
//!
//! The protocol wraps a single JSON part whose form-data name says what it
//! is: `"manifest"` for an update manifest, `"directive"` for rollback and
//! no-update answers. The optional signature rides in the part headers.

use uuid::Uuid;

pub const PART_MANIFEST: &str = "manifest";
pub const PART_DIRECTIVE: &str = "directive";

pub fn new_boundary() -> String {
    Uuid::new_v4().simple().to_string()
}

/// `multipart/mixed; boundary=<boundary>` — the response content type.
pub fn content_type(boundary: &str) -> String {
    format!("multipart/mixed; boundary={boundary}")
}

/// Frame one JSON part into a multipart/mixed body.
pub fn body(boundary: &str, part_name: &str, json: &str, signature: Option<&str>) -> String {
    let mut out = String::with_capacity(json.len() + 256);
    out.push_str("--");
    out.push_str(boundary);
    out.push_str("\r\n");
    out.push_str("content-type: application/json; charset=utf-8\r\n");
    out.push_str(&format!(
        "content-disposition: form-data; name=\"{part_name}\"\r\n"
    ));
    if let Some(signature) = signature {
        out.push_str(&format!("expo-signature: {signature}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(json);
    out.push_str("\r\n--");
    out.push_str(boundary);
    out.push_str("--\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_frames_single_part() {
        let body = body("abc123", PART_MANIFEST, r#"{"id":"x"}"#, None);
        assert!(body.starts_with("--abc123\r\n"));
        assert!(body.contains("content-disposition: form-data; name=\"manifest\"\r\n"));
        assert!(body.contains("\r\n\r\n{\"id\":\"x\"}\r\n"));
        assert!(body.ends_with("--abc123--\r\n"));
        assert!(!body.contains("expo-signature"));
    }

    #[test]
    fn signature_rides_in_part_headers() {
        let body = body(
            "b",
            PART_DIRECTIVE,
            "{}",
            Some("sig=\"Zm9v\", keyid=\"main\""),
        );
        assert!(body.contains("expo-signature: sig=\"Zm9v\", keyid=\"main\"\r\n"));
        assert!(body.contains("name=\"directive\""));
    }

    #[test]
    fn boundaries_are_unique() {
        assert_ne!(new_boundary(), new_boundary());
    }
}
