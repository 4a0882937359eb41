//! Byte classes and small string helpers shared by the parsers and the engine.
//!
//! The classification functions follow the token grammar of HTTP/1.1: method
//! names and header names are `token`s, so they must be 7-bit, non-control
//! bytes that are not separators.

/// Largest value that may still take one more decimal digit without leaving the `u64` range.
const MAX_BEFORE_LAST_DECIMAL_DIGIT: u64 = u64::MAX / 10;
const MAX_LAST_DECIMAL_DIGIT: u64 = u64::MAX % 10;

/// Largest value that may still take one more hex digit without leaving the `u64` range.
pub(crate) const MAX_BEFORE_LAST_HEX_DIGIT: u64 = (u64::MAX - 15) / 16;

#[inline]
pub fn is_char(b: u8) -> bool {
    b <= 127
}

#[inline]
pub fn is_ctl(b: u8) -> bool {
    b <= 31 || b == 127
}

#[inline]
pub fn is_tspecial(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

/// Returns true if `b` may appear in a method or header name.
#[inline]
pub fn is_token(b: u8) -> bool {
    is_char(b) && !is_ctl(b) && !is_tspecial(b)
}

#[inline]
pub fn is_digit(b: u8) -> bool {
    b.is_ascii_digit()
}

#[inline]
pub fn is_hex_digit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

#[inline]
pub fn digit_value(b: u8) -> Option<u8> {
    is_digit(b).then(|| b - b'0')
}

#[inline]
pub fn hex_digit_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Lowercase hex digit for a nibble; values above 15 are masked.
#[inline]
pub fn int_to_hex_digit(nibble: u8) -> u8 {
    b"0123456789abcdef"[usize::from(nibble & 0x0f)]
}

/// Parses an unsigned decimal number, rejecting any non-digit and any value above `u64::MAX`.
///
/// The empty string parses as `0`.
pub fn parse_decimal_u64(src: &[u8]) -> Option<u64> {
    let mut value: u64 = 0;
    for &b in src {
        let digit = u64::from(digit_value(b)?);
        if value > MAX_BEFORE_LAST_DECIMAL_DIGIT
            || (value == MAX_BEFORE_LAST_DECIMAL_DIGIT && digit > MAX_LAST_DECIMAL_DIGIT)
        {
            return None;
        }
        value = value * 10 + digit;
    }
    Some(value)
}

/// Compares `s` against an already lowercase `lowercase`, ignoring the case of `s`.
pub fn eq_ignore_lowercase(s: &[u8], lowercase: &[u8]) -> bool {
    s.len() == lowercase.len() && s.iter().zip(lowercase).all(|(a, b)| a.to_ascii_lowercase() == *b)
}

pub fn to_lowercase(src: &[u8]) -> Vec<u8> {
    src.to_ascii_lowercase()
}

/// Decodes `%XX` escapes and turns `+` into a space.
///
/// A `%` that is not followed by two hex digits is copied through unchanged.
pub fn url_decode(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        i += 1;
        if b == b'%' && i + 2 <= src.len() {
            let (hi, lo) = (src[i], src[i + 1]);
            i += 2;
            match (hex_digit_value(hi), hex_digit_value(lo)) {
                (Some(hi), Some(lo)) => out.push(hi * 16 + lo),
                _ => out.extend_from_slice(&[b, hi, lo]),
            }
        } else {
            out.push(if b == b'+' { b' ' } else { b });
        }
    }
    out
}

/// Percent-encodes every byte outside `A-Z a-z 0-9 - _ . ! ~ * ' ( )`.
pub fn url_encode(src: &[u8]) -> String {
    let mut out = String::with_capacity(src.len());
    for &b in src {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')') {
            out.push(char::from(b));
        } else {
            out.push('%');
            out.push(char::from(int_to_hex_digit(b >> 4)));
            out.push(char::from(int_to_hex_digit(b & 0x0f)));
        }
    }
    out
}

/// The pieces of an absolute-form request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlParts {
    pub ssl: bool,
    pub host: String,
    pub port: String,
    pub path: String,
}

/// Splits an absolute URL such as `http://host:port/path?query`.
///
/// The authority is the run between the second and the third `/`. The port defaults to `80`
/// and the path to `/`. Returns `None` when the URL has no authority.
pub fn extract_url_parts(url: &str) -> Option<UrlParts> {
    let mut authority_start = None;
    let mut authority_len = 0;
    let mut slashes = 0;
    for (i, b) in url.bytes().enumerate() {
        if b == b'/' {
            slashes += 1;
        } else if slashes == 2 {
            authority_start.get_or_insert(i);
            authority_len += 1;
        } else if slashes == 3 {
            break;
        }
    }

    let start = authority_start?;
    if authority_len == 0 {
        return None;
    }

    let authority = &url[start..start + authority_len];
    let mut pieces = authority.split(':');
    let host = pieces.next().unwrap_or_default().to_owned();
    let port = pieces.next().unwrap_or("80").to_owned();
    let path = if slashes > 2 { url[start + authority_len..].to_owned() } else { "/".to_owned() };

    Some(UrlParts { ssl: &url[..start] == "https://", host, port, path })
}
