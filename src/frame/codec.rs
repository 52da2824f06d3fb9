//! Base64 codec for frame payloads carried over the fallback channel
//!
//! Some JSON serializers on the helper side escape `/` as `\/`. The sequence is
//! collapsed in one linear pass before the standard decode; everything else must
//! be strict base64, a single stray character fails the whole payload.

use std::borrow::Cow;

use base64::engine::general_purpose::STANDARD;
use base64::{DecodeError, Engine as _};

use crate::error::{BridgeError, Result};

/// Collapse every `\/` into `/`. Borrows when there is nothing to rewrite.
pub fn unescape_slashes(input: &[u8]) -> Cow<'_, [u8]> {
    let Some(first) = input.windows(2).position(|w| w == b"\\/") else {
        return Cow::Borrowed(input);
    };

    let mut out = Vec::with_capacity(input.len());
    out.extend_from_slice(&input[..first]);

    let mut i = first;
    while i < input.len() {
        let b = input[i];
        if b == b'\\' && input.get(i + 1) == Some(&b'/') {
            out.push(b'/');
            i += 2;
        } else {
            out.push(b);
            i += 1;
        }
    }
    Cow::Owned(out)
}

/// Exact decoded length of padded base64 `input`, `None` if the length is not
/// a multiple of four.
pub fn decoded_len(input: &[u8]) -> Option<usize> {
    if input.len() % 4 != 0 {
        return None;
    }
    let padding = input.iter().rev().take(2).take_while(|&&b| b == b'=').count();
    Some(input.len() / 4 * 3 - padding)
}

/// Decode a (possibly `\/`-escaped) base64 payload into raw bytes.
pub fn decode_payload(input: &[u8]) -> Result<Vec<u8>> {
    let unescaped = unescape_slashes(input);
    if unescaped.is_empty() {
        return Ok(Vec::new());
    }

    let expected = decoded_len(&unescaped)
        .ok_or(DecodeError::InvalidLength(unescaped.len()))?;

    let mut out = Vec::with_capacity(expected);
    STANDARD.decode_vec(&*unescaped, &mut out)?;
    if out.len() != expected {
        return Err(BridgeError::SizeMismatch {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Decode a payload that must hold exactly one `width`x`height` BGRA frame.
pub fn decode_bgra(input: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let expected = crate::frame::PixelFormat::Bgra
        .frame_len(width, height)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| BridgeError::MalformedMessage(format!("{}x{} overflows", width, height)))?;

    // Cheap length check before touching the payload.
    match decoded_len(input) {
        Some(n) if n < expected => {
            return Err(BridgeError::SizeMismatch {
                expected,
                actual: n,
            })
        }
        _ => {}
    }

    let bytes = decode_payload(input)?;
    if bytes.len() != expected {
        return Err(BridgeError::SizeMismatch {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(bytes)
}

/// Encode raw bytes, optionally reproducing the `\/` escaping artifact.
pub fn encode_payload(data: &[u8], escape_slashes: bool) -> String {
    let encoded = STANDARD.encode(data);
    if escape_slashes {
        encoded.replace('/', "\\/")
    } else {
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unescape_is_single_pass() {
        assert_eq!(&*unescape_slashes(b"ab\\/cd\\/"), b"ab/cd/");
        // `\\/` is a backslash followed by an escaped slash, not two escapes.
        assert_eq!(&*unescape_slashes(b"\\\\/"), b"\\/");
        assert!(matches!(unescape_slashes(b"abcd"), Cow::Borrowed(_)));
    }

    #[test]
    fn padding_determines_length() {
        assert_eq!(decoded_len(b"QQ=="), Some(1));
        assert_eq!(decoded_len(b"QUI="), Some(2));
        assert_eq!(decoded_len(b"QUJD"), Some(3));
        assert_eq!(decoded_len(b"QUJ"), None);
    }

    #[test]
    fn decodes_escaped_payload() {
        assert_eq!(decode_payload(b"\\/\\/\\/\\/").unwrap(), vec![0xFF; 3]);
        assert_eq!(decode_payload(b"////").unwrap(), vec![0xFF; 3]);
        assert_eq!(decode_payload(b"").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn rejects_foreign_characters() {
        assert!(decode_payload(b"QU*D").is_err());
        assert!(decode_payload(b"QUJD\\u002F").is_err());
        assert!(decode_payload(b"QUJ").is_err());
    }

    #[test]
    fn bgra_size_must_match_dimensions() {
        let two_pixels = encode_payload(&[7u8; 8], false);
        assert_eq!(decode_bgra(two_pixels.as_bytes(), 2, 1).unwrap(), vec![7u8; 8]);
        assert!(matches!(
            decode_bgra(b"////", 2, 1),
            Err(BridgeError::SizeMismatch { expected: 8, actual: 3 })
        ));
        assert!(decode_bgra(two_pixels.as_bytes(), 1, 1).is_err());
    }
}
