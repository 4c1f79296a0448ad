// This file is part of Vigil NVR, a motion-aware network video recorder.
// Copyright (C) 2026 The Vigil NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::fmt::Write as _;

static MULTIPLIERS: [(char, u64); 4] = [
    // (suffix character, power of 2)
    ('T', 40),
    ('G', 30),
    ('M', 20),
    ('K', 10),
];

/// Encodes a non-negative size into human-readable form.
pub fn encode_size(mut raw: i64) -> String {
    let mut encoded = String::new();
    for &(c, n) in &MULTIPLIERS {
        if raw >= 1i64 << n {
            write!(&mut encoded, "{}{} ", raw >> n, c).unwrap();
            raw &= (1i64 << n) - 1;
        }
    }
    if raw > 0 || encoded.is_empty() {
        write!(&mut encoded, "{raw}").unwrap();
    } else {
        encoded.pop(); // remove trailing space.
    }
    encoded
}

/// Redacts secrets from free-form error text before it is logged or stored.
///
/// Covers the two shapes camera errors actually leak: `password=...` /
/// `passwd=...` values (query strings and key=value fragments) and bare
/// dotted-quad IPv4 literals (camera addresses).
pub fn redact_secrets(s: &str) -> String {
    redact_ipv4(&redact_password_values(s))
}

fn redact_password_values(s: &str) -> String {
    const KEYS: [&str; 2] = ["password=", "passwd="];
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    'outer: while !rest.is_empty() {
        for key in &KEYS {
            if let Some(stripped) = match_key_at_start(rest, key) {
                out.push_str(key);
                out.push_str("redacted");
                let end = stripped
                    .find(|c: char| c == '&' || c == ' ' || c == '"' || c == '\'')
                    .unwrap_or(stripped.len());
                rest = &stripped[end..];
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        out.push(chars.next().unwrap());
        rest = chars.as_str();
    }
    out
}

fn match_key_at_start<'a>(s: &'a str, key: &str) -> Option<&'a str> {
    let prefix = s.get(..key.len())?;
    if prefix.eq_ignore_ascii_case(key) {
        Some(&s[key.len()..])
    } else {
        None
    }
}

fn redact_ipv4(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let boundary =
            i == 0 || (!bytes[i - 1].is_ascii_alphanumeric() && bytes[i - 1] != b'.');
        if bytes[i].is_ascii_digit() && boundary {
            if let Some(len) = ipv4_len(&s[i..]) {
                out.push_str("x.x.x.x");
                i += len;
                continue;
            }
        }
        // Pushing a byte is safe here only at char boundaries; digits are
        // single-byte, so any multi-byte char falls through unmodified.
        let c = s[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

/// Returns the byte length of a leading dotted-quad IPv4 literal, if any.
fn ipv4_len(s: &str) -> Option<usize> {
    let mut len = 0;
    let bytes = s.as_bytes();
    for octet in 0..4 {
        if octet > 0 {
            if bytes.get(len) != Some(&b'.') {
                return None;
            }
            len += 1;
        }
        let start = len;
        while len < bytes.len() && bytes[len].is_ascii_digit() && len - start < 3 {
            len += 1;
        }
        if len == start {
            return None;
        }
        if s[start..len].parse::<u16>().ok()? > 255 {
            return None;
        }
    }
    // Reject when the quad continues into more digits or dots (versions etc.).
    match bytes.get(len) {
        Some(b'.') | Some(b'0'..=b'9') => None,
        _ => Some(len),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_sizes() {
        assert_eq!("0", encode_size(0));
        assert_eq!("1K", encode_size(1024));
        assert_eq!("1M", encode_size(1 << 20));
        assert_eq!("1M 1", encode_size((1 << 20) + 1));
    }

    #[test]
    fn redact_password_query() {
        let s = "GET http://cam/api.cgi?cmd=GetMdState&user=admin&password=hunter2 failed";
        let r = redact_secrets(s);
        assert!(!r.contains("hunter2"), "{r}");
        assert!(r.contains("password=redacted"), "{r}");
    }

    #[test]
    fn redact_passwd_fragment() {
        let r = redact_secrets("passwd=s3cret timeout");
        assert_eq!(r, "passwd=redacted timeout");
    }

    #[test]
    fn redact_ip_literals() {
        let r = redact_secrets("connect to 192.168.1.20:554 refused");
        assert_eq!(r, "connect to x.x.x.x:554 refused");
    }

    #[test]
    fn leaves_version_numbers_alone() {
        assert_eq!(redact_secrets("ffmpeg 6.1.1 exited"), "ffmpeg 6.1.1 exited");
    }

    #[test]
    fn leaves_plain_text_alone() {
        assert_eq!(redact_secrets("no movement"), "no movement");
    }
}
