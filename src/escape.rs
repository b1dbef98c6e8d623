//! Dot-escaping and quoted-string codecs for the line-oriented control protocol.
//!
//! Two codecs live here:
//!
//! - **Dot-escaping** ([`encode`] / [`decode`]) for multi-line data blocks.
//!   Every line is CRLF-terminated, every line starting with `.` gets an extra
//!   leading `.`, and the block ends with a line holding a single `.`.
//! - **Quoted strings** ([`quote`] / [`unquote`]) for free-form values embedded
//!   in `Key=Value` event fields.
//!
//! # Canonical Form
//!
//! The escaped format only knows CRLF-terminated lines, so [`encode`]
//! normalizes CR-only and LF-only line endings to CRLF and terminates an
//! unterminated last line. [`decode`] therefore returns the *canonical* form
//! of the original input:
//!
//! ```text
//!   decode(encode(x)) == canonicalize(x)
//!   canonicalize(x)   == x   whenever x is already CRLF-terminated lines
//! ```
//!
//! # Example
//!
//! ```rust
//! use privcount_control::escape;
//!
//! let encoded = escape::encode(b".\r\n");
//! assert_eq!(encoded, b"..\r\n.\r\n");
//! assert_eq!(escape::decode(&encoded).unwrap(), b".\r\n");
//!
//! // An unterminated lone "." comes back in canonical form.
//! let encoded = escape::encode(b".");
//! assert_eq!(encoded, b"..\r\n.\r\n");
//! assert_eq!(escape::decode(&encoded).unwrap(), b".\r\n");
//! ```

use std::borrow::Cow;

use crate::error::{Error, Result};

const CRLF: &[u8] = b"\r\n";
const TERMINATOR: &[u8] = b".\r\n";

/// Dot-escapes `data` into a terminated data block.
pub fn encode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32 + TERMINATOR.len() + 2);
    let mut at_line_start = true;
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        match byte {
            b'\r' => {
                out.extend_from_slice(CRLF);
                if data.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                at_line_start = true;
            }
            b'\n' => {
                out.extend_from_slice(CRLF);
                at_line_start = true;
            }
            _ => {
                out.push(byte);
                at_line_start = false;
            }
        }
        i += 1;
    }

    if !at_line_start {
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(TERMINATOR);
    out
}

/// Decodes a dot-escaped data block.
///
/// Accepts CRLF or bare LF line endings and returns CRLF-terminated lines.
///
/// # Errors
///
/// Returns [`Error::MalformedEscapedData`] if a line is unterminated, a bare
/// CR appears inside a line, the terminating `.` line is missing, or data
/// follows the terminator.
pub fn decode(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len());
    let mut rest = data;

    loop {
        if rest.is_empty() {
            return Err(malformed("missing terminating \".\" line"));
        }
        let newline = rest
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| malformed("unterminated line"))?;

        let mut line = &rest[..newline];
        rest = &rest[newline + 1..];

        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.contains(&b'\r') {
            return Err(malformed("bare carriage return inside line"));
        }

        if line == b"." {
            if !rest.is_empty() {
                return Err(malformed("data after terminating \".\" line"));
            }
            return Ok(out);
        }
        if let Some(unstuffed) = line.strip_prefix(b".") {
            line = unstuffed;
        }
        out.extend_from_slice(line);
        out.extend_from_slice(CRLF);
    }
}

/// Decodes a dot-escaped block that must hold text.
///
/// # Errors
///
/// Everything [`decode`] rejects, plus embedded NUL bytes and invalid UTF-8.
pub fn decode_text(data: &[u8]) -> Result<String> {
    let decoded = decode(data)?;
    if decoded.contains(&0) {
        return Err(malformed("embedded NUL byte"));
    }
    String::from_utf8(decoded).map_err(|_| malformed("invalid UTF-8"))
}

/// Returns the canonical CRLF-line form of `data`.
///
/// This is exactly what `decode(encode(data))` yields.
pub fn canonicalize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 2);
    let mut at_line_start = true;
    let mut i = 0;

    while i < data.len() {
        match data[i] {
            b'\r' => {
                out.extend_from_slice(CRLF);
                if data.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                at_line_start = true;
            }
            b'\n' => {
                out.extend_from_slice(CRLF);
                at_line_start = true;
            }
            byte => {
                out.push(byte);
                at_line_start = false;
            }
        }
        i += 1;
    }
    if !at_line_start {
        out.extend_from_slice(CRLF);
    }
    out
}

fn malformed(reason: &str) -> Error {
    Error::MalformedEscapedData(reason.to_string())
}

/// Whether `value` must be quoted to appear as a single event field value.
pub fn needs_quoting(value: &str) -> bool {
    value.is_empty()
        || value
            .bytes()
            .any(|b| b <= b' ' || b >= 0x7f || b == b'"' || b == b'\\' || b == b'=')
}

/// Wraps `value` in double quotes, escaping everything non-printable.
///
/// Backslash, double quote, CR, LF and TAB use C-style escapes; any other
/// control or non-ASCII byte is written as a three-digit octal escape.
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for byte in value.bytes() {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'"' => out.push_str("\\\""),
            b'\r' => out.push_str("\\r"),
            b'\n' => out.push_str("\\n"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\{:03o}", byte)),
        }
    }
    out.push('"');
    out
}

/// Whether `value` can be written unquoted as one space-separated token.
///
/// Spaces, control bytes (CR and LF included) and DEL are not allowed.
pub fn is_bare_token(value: &str) -> bool {
    !value.bytes().any(|b| b <= b' ' || b == 0x7f)
}

/// Writes `value` unchanged when it is a bare token and quoted otherwise.
///
/// Unlike [`field_value`], `=` and quotes are left alone, so already
/// structured tokens such as `PURPOSE=GENERAL` pass through.
pub fn token(value: &str) -> Cow<'_, str> {
    if is_bare_token(value) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(quote(value))
    }
}

/// Quotes `value` only when it would not survive as a bare token.
pub fn field_value(value: &str) -> Cow<'_, str> {
    if needs_quoting(value) {
        Cow::Owned(quote(value))
    } else {
        Cow::Borrowed(value)
    }
}

/// Parses a quoted string at the start of `input`.
///
/// Returns the unescaped value and the remainder after the closing quote.
///
/// # Errors
///
/// Returns [`Error::MalformedEscapedData`] if the string is not opened or
/// closed with a quote, contains an unknown escape, or is not UTF-8 once
/// unescaped.
pub fn unquote(input: &str) -> Result<(String, &str)> {
    let bytes = input.as_bytes();
    if bytes.first() != Some(&b'"') {
        return Err(malformed("quoted string must start with '\"'"));
    }

    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => {
                let value = String::from_utf8(out).map_err(|_| malformed("invalid UTF-8"))?;
                return Ok((value, &input[i + 1..]));
            }
            b'\\' => {
                let escaped = *bytes
                    .get(i + 1)
                    .ok_or_else(|| malformed("dangling backslash"))?;
                match escaped {
                    b'\\' | b'"' | b'\'' => out.push(escaped),
                    b'n' => out.push(b'\n'),
                    b'r' => out.push(b'\r'),
                    b't' => out.push(b'\t'),
                    b'0'..=b'7' => {
                        let digits = bytes
                            .get(i + 1..i + 4)
                            .ok_or_else(|| malformed("short octal escape"))?;
                        let mut value: u32 = 0;
                        for digit in digits {
                            if !(b'0'..=b'7').contains(digit) {
                                return Err(malformed("bad octal escape"));
                            }
                            value = value * 8 + u32::from(digit - b'0');
                        }
                        let value =
                            u8::try_from(value).map_err(|_| malformed("octal escape out of range"))?;
                        out.push(value);
                        i += 2;
                    }
                    _ => return Err(malformed("unknown escape sequence")),
                }
                i += 2;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    Err(malformed("unterminated quoted string"))
}
