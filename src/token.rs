//! HTTP token utilities for handshake headers.
//!
//! Tokenization follows the RFC 2616 grammar:
//!
//! ```text
//! CTL        = <any US-ASCII control character (octets 0 - 31) and DEL (127)>
//! separators = "(" | ")" | "<" | ">" | "@" | "," | ";" | ":" | "\" | <">
//!              | "/" | "[" | "]" | "?" | "=" | "{" | "}" | SP | HT
//! token      = 1*<any CHAR except CTLs or separators>
//! ```
//!
//! Header names are matched through [`http::HeaderMap`]; token comparison is
//! ASCII case folding only, so multi-byte code points compare bytewise.

use std::collections::HashMap;

use http::HeaderMap;

/// Returns `s` with leading ASCII whitespace removed.
pub(crate) fn skip_space(s: &str) -> &str {
    s.trim_start_matches([' ', '\t', '\r', '\n'])
}

fn is_token_byte(c: u8) -> bool {
    if c <= 31 || c >= 127 {
        return false;
    }
    !matches!(
        c,
        b' ' | b'\t'
            | b'"'
            | b'('
            | b')'
            | b','
            | b'/'
            | b':'
            | b';'
            | b'<'
            | b'='
            | b'>'
            | b'?'
            | b'@'
            | b'['
            | b']'
            | b'\\'
            | b'{'
            | b'}'
    )
}

/// Splits the leading token off `s`, returning `(token, rest)`. The token is
/// empty when `s` does not start with a token octet.
pub(crate) fn next_token(s: &str) -> (&str, &str) {
    let end = s
        .bytes()
        .position(|c| !is_token_byte(c))
        .unwrap_or(s.len());
    s.split_at(end)
}

/// Like [`next_token`], but also accepts a `"…"`-quoted string, unescaping
/// `\c` sequences. An unterminated quoted string yields an empty value and an
/// empty remainder.
pub(crate) fn next_token_or_quoted(s: &str) -> (String, &str) {
    let Some(quoted) = s.strip_prefix('"') else {
        let (token, rest) = next_token(s);
        return (token.to_owned(), rest);
    };

    let mut escaped = false;
    let mut escapes = 0usize;
    let mut end = None;
    for (i, c) in quoted.bytes().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            b'"' => {
                end = Some(i);
                break;
            }
            b'\\' => {
                escaped = true;
                escapes += 1;
            }
            _ => {}
        }
    }

    let Some(end) = end else {
        return (String::new(), "");
    };

    let (value, rest) = (&quoted[..end], &quoted[end + 1..]);
    if escapes == 0 {
        return (value.to_owned(), rest);
    }

    let mut buf = Vec::with_capacity(value.len() - escapes);
    let mut escaped = false;
    for &c in value.as_bytes() {
        if c == b'\\' && !escaped {
            escaped = true;
            continue;
        }
        escaped = false;
        buf.push(c);
    }
    (String::from_utf8_lossy(&buf).into_owned(), rest)
}

/// Compares `s` and `t` with ASCII case folding; non-ASCII bytes must match
/// exactly.
pub(crate) fn equal_ascii_fold(s: &str, t: &str) -> bool {
    s.len() == t.len()
        && s.bytes().zip(t.bytes()).all(|(a, b)| {
            a == b
                || (a.is_ascii_uppercase() && a + b'a' - b'A' == b)
                || (b.is_ascii_uppercase() && b + b'a' - b'A' == a)
        })
}

/// Returns true if the comma-separated `1#token` header `name` contains a
/// token equal to `value` under ASCII case folding.
pub(crate) fn header_list_contains_value(headers: &HeaderMap, name: &str, value: &str) -> bool {
    'headers: for raw in headers.get_all(name) {
        let Ok(mut s) = raw.to_str() else {
            continue;
        };
        loop {
            let (t, rest) = next_token(skip_space(s));
            if t.is_empty() {
                continue 'headers;
            }
            s = skip_space(rest);
            if !s.is_empty() && !s.starts_with(',') {
                continue 'headers;
            }
            if equal_ascii_fold(t, value) {
                return true;
            }
            if s.is_empty() {
                continue 'headers;
            }
            s = &s[1..];
        }
    }
    false
}

/// Parses `Sec-WebSocket-Extensions` into an ordered list of extensions.
///
/// Each extension is a map from parameter name to value, with the extension
/// name stored under the empty key. A malformed extension aborts parsing of
/// its header line but not of the other lines.
pub(crate) fn parse_extensions(headers: &HeaderMap) -> Vec<HashMap<String, String>> {
    // From RFC 6455:
    //
    //  Sec-WebSocket-Extensions = extension-list
    //  extension-list = 1#extension
    //  extension = extension-token *( ";" extension-param )
    //  extension-param = token [ "=" (token | quoted-string) ]
    let mut result = Vec::new();
    'headers: for raw in headers.get_all("sec-websocket-extensions") {
        let Ok(mut s) = raw.to_str() else {
            continue;
        };
        loop {
            let (t, rest) = next_token(skip_space(s));
            if t.is_empty() {
                continue 'headers;
            }
            s = rest;
            let mut ext = HashMap::new();
            ext.insert(String::new(), t.to_owned());
            loop {
                s = skip_space(s);
                if !s.starts_with(';') {
                    break;
                }
                let (k, rest) = next_token(skip_space(&s[1..]));
                if k.is_empty() {
                    continue 'headers;
                }
                s = skip_space(rest);
                let mut v = String::new();
                if let Some(rest) = s.strip_prefix('=') {
                    let (value, rest) = next_token_or_quoted(skip_space(rest));
                    v = value;
                    s = skip_space(rest);
                }
                if !s.is_empty() && !s.starts_with(',') && !s.starts_with(';') {
                    continue 'headers;
                }
                ext.insert(k.to_owned(), v);
            }
            if !s.is_empty() && !s.starts_with(',') {
                continue 'headers;
            }
            result.push(ext);
            if s.is_empty() {
                continue 'headers;
            }
            s = &s[1..];
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderValue;

    fn headers(name: &'static str, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn test_header_list_contains_value() {
        let cases = [
            ("WebSocket", true),
            ("WEBSOCKET", true),
            ("websocket", true),
            ("websockets", false),
            ("x websocket", false),
            ("websocket x", false),
            ("other,websocket,more", true),
            ("other, websocket, more", true),
        ];
        for (value, ok) in cases {
            let h = headers("upgrade", value);
            assert_eq!(
                header_list_contains_value(&h, "upgrade", "websocket"),
                ok,
                "value={value:?}"
            );
        }
    }

    #[test]
    fn test_equal_ascii_fold() {
        assert!(equal_ascii_fold("WebSocket", "websocket"));
        assert!(equal_ascii_fold("UPGRADE", "upgrade"));
        assert!(!equal_ascii_fold("websocket", "websockets"));
        // multi-byte code points compare bytewise
        assert!(equal_ascii_fold("héllo", "héllo"));
        assert!(!equal_ascii_fold("héllo", "hÉllo"));
    }

    #[test]
    fn test_next_token_or_quoted() {
        let (v, rest) = next_token_or_quoted("token rest");
        assert_eq!(v, "token");
        assert_eq!(rest, " rest");

        let (v, rest) = next_token_or_quoted("\"quoted value\", rest");
        assert_eq!(v, "quoted value");
        assert_eq!(rest, ", rest");

        let (v, rest) = next_token_or_quoted("\"esc\\\"aped\" x");
        assert_eq!(v, "esc\"aped");
        assert_eq!(rest, " x");

        // unterminated quoted string
        let (v, rest) = next_token_or_quoted("\"unterminated");
        assert_eq!(v, "");
        assert_eq!(rest, "");
    }

    #[test]
    fn test_parse_extensions() {
        let h = headers(
            "sec-websocket-extensions",
            "permessage-deflate; server_no_context_takeover; client_max_window_bits=15, foo; bar=\"baz\"",
        );
        let exts = parse_extensions(&h);
        assert_eq!(exts.len(), 2);
        assert_eq!(exts[0][""], "permessage-deflate");
        assert_eq!(exts[0]["server_no_context_takeover"], "");
        assert_eq!(exts[0]["client_max_window_bits"], "15");
        assert_eq!(exts[1][""], "foo");
        assert_eq!(exts[1]["bar"], "baz");
    }

    #[test]
    fn test_parse_extensions_malformed_line() {
        let mut h = HeaderMap::new();
        h.append(
            "sec-websocket-extensions",
            HeaderValue::from_static("bad extension ="),
        );
        h.append(
            "sec-websocket-extensions",
            HeaderValue::from_static("permessage-deflate"),
        );
        let exts = parse_extensions(&h);
        assert_eq!(exts.len(), 1);
        assert_eq!(exts[0][""], "permessage-deflate");
    }
}
