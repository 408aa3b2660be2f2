//! SDP payload sanitization
//!
//! Raw SDP text arriving over SIP signaling is frequently mangled: mixed line
//! endings, stray blank lines, non-SDP garbage injected by intermediaries.
//! [`sanitize`] normalizes a payload to CRLF line endings and drops anything
//! that is not an `x=value` attribute line before the text is handed to the
//! media engine.
//!
//! One deliberate quirk: if filtering would break the required `v=`/`o=`/`s=`
//! line ordering, the ORIGINAL input is returned byte-for-byte instead of the
//! filtered text. Downstream media stacks tolerate slightly malformed SDP far
//! better than structurally gutted SDP, so structural failure falls back to
//! whatever the peer actually sent. Callers detect the fallback with
//! [`is_well_formed`] and treat it as a soft warning.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SdpError {
    #[error("SDP payload is blank")]
    Blank,

    #[error("SDP payload is missing the required v=/o=/s= fields")]
    MissingRequiredFields,
}

const REQUIRED_PREFIXES: [&str; 3] = ["v=", "o=", "s="];

/// Normalize and validate a raw SDP payload.
///
/// Returns the payload CRLF-normalized, stripped of blank and non-attribute
/// lines, always ending in CRLF. Falls back to the unmodified input when
/// filtering would destroy the `v=` -> `o=` -> `s=` ordering.
pub fn sanitize(raw: &str) -> Result<String, SdpError> {
    if raw.trim().is_empty() {
        return Err(SdpError::Blank);
    }

    let lines: Vec<&str> = split_lines(raw);

    if !REQUIRED_PREFIXES
        .iter()
        .any(|prefix| lines.iter().any(|line| line.starts_with(prefix)))
    {
        return Err(SdpError::MissingRequiredFields);
    }

    let filtered: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| is_attribute_line(line))
        .collect();

    if !required_fields_ordered(&filtered) {
        // Structural failure: hand back what the peer sent, untouched.
        return Ok(raw.to_string());
    }

    let mut out = filtered.join("\r\n");
    out.push_str("\r\n");
    Ok(out)
}

/// Whether a payload already satisfies the sanitizer's structural checks.
///
/// Used by callers of [`sanitize`] to tell the fallback path (original input
/// returned as-is) apart from a clean result.
pub fn is_well_formed(sdp: &str) -> bool {
    let lines = split_lines(sdp);
    lines.iter().all(|line| is_attribute_line(line)) && required_fields_ordered(&lines)
}

/// Split on any line-ending convention: CRLF, bare LF or bare CR.
fn split_lines(raw: &str) -> Vec<&str> {
    raw.split(&['\r', '\n'][..])
        .filter(|line| !line.is_empty())
        .collect()
}

/// SDP attribute-line syntax: single lowercase letter, `=`, then content.
fn is_attribute_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() > 2 && bytes[0].is_ascii_lowercase() && bytes[1] == b'='
}

/// Prefix search: first `v=` line before first `o=` line before first `s=`
/// line, all three present. Unrelated lines may appear between them.
fn required_fields_ordered(lines: &[&str]) -> bool {
    let mut positions = [None; 3];
    for (idx, line) in lines.iter().enumerate() {
        for (slot, prefix) in REQUIRED_PREFIXES.iter().enumerate() {
            if positions[slot].is_none() && line.starts_with(prefix) {
                positions[slot] = Some(idx);
            }
        }
    }

    match positions {
        [Some(v), Some(o), Some(s)] => v < o && o < s,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CANONICAL: &str = "v=0\r\no=- 1 1 IN IP4 1.1.1.1\r\ns=-\r\n";

    #[test]
    fn test_canonical_input_unchanged() {
        assert_eq!(sanitize(CANONICAL).unwrap(), CANONICAL);
    }

    #[test]
    fn test_bare_lf_normalized_to_crlf() {
        let input = "v=0\no=- 1 1 IN IP4 1.1.1.1\ns=-\n";
        assert_eq!(sanitize(input).unwrap(), CANONICAL);
    }

    #[test]
    fn test_bare_cr_normalized_to_crlf() {
        let input = "v=0\ro=- 1 1 IN IP4 1.1.1.1\rs=-\r";
        assert_eq!(sanitize(input).unwrap(), CANONICAL);
    }

    #[test]
    fn test_mixed_line_endings_normalized() {
        let input = "v=0\no=- 1 1 IN IP4 1.1.1.1\r\ns=-\r";
        assert_eq!(sanitize(input).unwrap(), CANONICAL);
    }

    #[test]
    fn test_blank_input_rejected() {
        assert_eq!(sanitize(""), Err(SdpError::Blank));
        assert_eq!(sanitize("   \r\n  \n"), Err(SdpError::Blank));
    }

    #[test]
    fn test_missing_all_required_fields_rejected() {
        assert_eq!(
            sanitize("a=sendrecv\r\nm=audio 4000 RTP/AVP 0\r\n"),
            Err(SdpError::MissingRequiredFields)
        );
    }

    #[test]
    fn test_blank_lines_dropped() {
        let input = "v=0\r\n\r\no=- 1 1 IN IP4 1.1.1.1\r\n\r\ns=-\r\n";
        assert_eq!(sanitize(input).unwrap(), CANONICAL);
    }

    #[test]
    fn test_garbage_lines_dropped() {
        let input = "v=0\r\nThis is not SDP\r\no=- 1 1 IN IP4 1.1.1.1\r\nX=uppercase\r\ns=-\r\n";
        assert_eq!(sanitize(input).unwrap(), CANONICAL);
    }

    #[test]
    fn test_interleaved_lines_kept_in_order() {
        let input = "v=0\r\nb=AS:84\r\no=- 1 1 IN IP4 1.1.1.1\r\ns=-\r\nt=0 0\r\n";
        assert_eq!(sanitize(input).unwrap(), input);
    }

    #[test]
    fn test_ordering_failure_returns_original_bytes() {
        // o= before v=, so filtering cannot produce a valid document
        let input = "o=- 1 1 IN IP4 1.1.1.1\nv=0\ns=-\n";
        assert_eq!(sanitize(input).unwrap(), input);
    }

    #[test]
    fn test_missing_one_required_field_returns_original_bytes() {
        let input = "v=0\no=- 1 1 IN IP4 1.1.1.1\n";
        assert_eq!(sanitize(input).unwrap(), input);
    }

    #[test]
    fn test_idempotent_on_well_formed_input() {
        let input = "v=0\no=- 1 1 IN IP4 1.1.1.1\r\nnot sdp\ns=-\nm=audio 4000 RTP/AVP 0\n";
        let once = sanitize(input).unwrap();
        let twice = sanitize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_output_ends_with_crlf() {
        let input = "v=0\no=- 1 1 IN IP4 1.1.1.1\ns=-";
        let out = sanitize(input).unwrap();
        assert!(out.ends_with("\r\n"));
        // no bare LF or CR survives normalization
        assert!(!out.replace("\r\n", "").contains(['\r', '\n']));
    }

    #[test]
    fn test_is_well_formed_detects_fallback() {
        assert!(is_well_formed(CANONICAL));
        assert!(!is_well_formed("o=- 1 1 IN IP4 1.1.1.1\r\nv=0\r\ns=-\r\n"));
        assert!(!is_well_formed("v=0\ngarbage\no=- 1 1 IN IP4 1.1.1.1\ns=-\n"));
    }
}
