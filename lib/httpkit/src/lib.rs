// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP request formatting and response parsing for the upload paths.
//!
//! No sockets live here: requests are written piecewise through a caller
//! callback (which typically hands the bytes to a TLS stack), and
//! responses are parsed incrementally from whatever the socket produced.
//! This keeps the crate independent of any particular network stack -- the
//! embedder owns connect/send/recv, this crate owns the bytes.
//!
//! Three requests are formed:
//! - chunk upload: `POST /api/v0/chunks/<device_serial>`
//! - latest-release lookup: `GET /api/v0/releases/latest/url?...` with
//!   URL-encoded device identity query parameters
//! - OTA payload download: `GET <path>` against a URL returned by the
//!   release lookup, parsed with [`parse_uri`]

#![cfg_attr(not(test), no_std)]

pub mod response;
pub mod retry;

use core::fmt::Write as _;

use telemetry_api::DeviceInfo;

/// Identifies this client to the ingestion service.
pub const USER_AGENT: &str =
    concat!("TicosSDK/", env!("CARGO_PKG_VERSION"));

/// Per-project configuration for talking to the cloud.
#[derive(Copy, Clone, Debug)]
pub struct HttpClientConfig<'a> {
    /// The project key sent in the `Ticos-Project-Key` header.
    pub api_key: &'a str,
    /// Host accepting chunk uploads.
    pub chunks_host: &'a str,
    /// Host answering device/release queries.
    pub device_host: &'a str,
}

/// Upper bound on one URL-encoded device-info string. May need raising for
/// projects with unusually long version strings.
pub const URL_ENCODED_PARAM_MAX_LEN: usize = 48;

type SendCb<'a> = &'a mut dyn FnMut(&[u8]) -> bool;

fn write_crlf(w: SendCb<'_>) -> bool {
    w(b"\r\n")
}

// NB: all HTTP/1.1 requests must carry a Host header.
fn write_host_header(w: SendCb<'_>, host: &str) -> bool {
    w(b"Host:") && w(host.as_bytes()) && write_crlf(w)
}

fn write_user_agent_header(w: SendCb<'_>) -> bool {
    w(b"User-Agent:") && w(USER_AGENT.as_bytes()) && write_crlf(w)
}

fn write_project_key_header(w: SendCb<'_>, api_key: &str) -> bool {
    w(b"Ticos-Project-Key:") && w(api_key.as_bytes()) && write_crlf(w)
}

/// Writes the request line and headers of a chunk upload. The caller
/// streams exactly `content_length` body bytes afterward.
///
/// ```text
/// POST /api/v0/chunks/<device_serial> HTTP/1.1
/// Host:<chunks_host>
/// User-Agent:TicosSDK/<version>
/// Ticos-Project-Key:<key>
/// Content-Type:application/octet-stream
/// Content-Length:<n>
/// ```
pub fn write_chunk_post_request(
    w: SendCb<'_>,
    config: &HttpClientConfig<'_>,
    device: &DeviceInfo<'_>,
    content_length: usize,
) -> bool {
    if !(w(b"POST /api/v0/chunks/")
        && w(device.device_serial.as_bytes())
        && w(b" HTTP/1.1")
        && write_crlf(w))
    {
        return false;
    }

    if !(write_host_header(w, config.chunks_host)
        && write_user_agent_header(w)
        && write_project_key_header(w, config.api_key))
    {
        return false;
    }

    if !(w(b"Content-Type:application/octet-stream") && write_crlf(w)) {
        return false;
    }

    let mut length: heapless::String<16> = heapless::String::new();
    if write!(length, "{content_length}").is_err() {
        return false;
    }
    w(b"Content-Length:")
        && w(length.as_bytes())
        && write_crlf(w)
        && write_crlf(w)
}

/// Writes a query for the latest release applicable to this device:
///
/// ```text
/// GET /api/v0/releases/latest/url?&device_serial=..&hardware_version=..
///     &software_type=..&current_version=.. HTTP/1.1
/// ```
///
/// Parameter values are URL-encoded.
pub fn write_ota_url_request(
    w: SendCb<'_>,
    config: &HttpClientConfig<'_>,
    device: &DeviceInfo<'_>,
) -> bool {
    if !w(b"GET /api/v0/releases/latest/url?") {
        return false;
    }

    let params: [(&str, &str); 4] = [
        ("device_serial", device.device_serial),
        ("hardware_version", device.hardware_version),
        ("software_type", device.software_type),
        ("current_version", device.software_version),
    ];
    for (name, value) in params {
        let mut encoded = [0u8; URL_ENCODED_PARAM_MAX_LEN];
        let Ok(encoded) = urlencode(value, &mut encoded) else {
            return false;
        };
        if !(w(b"&")
            && w(name.as_bytes())
            && w(b"=")
            && w(encoded.as_bytes()))
        {
            return false;
        }
    }

    w(b" HTTP/1.1")
        && write_crlf(w)
        && write_host_header(w, config.device_host)
        && write_user_agent_header(w)
        && write_project_key_header(w, config.api_key)
        && write_crlf(w)
}

/// Writes a GET for an OTA payload URL previously returned by the release
/// query.
pub fn write_ota_payload_request(w: SendCb<'_>, url: &str) -> bool {
    let Some(uri) = parse_uri(url) else {
        return false;
    };

    if !w(b"GET ") {
        return false;
    }
    let path_ok = match uri.path {
        Some(path) => w(path.as_bytes()),
        None => w(b"/"),
    };
    path_ok
        && w(b" HTTP/1.1")
        && write_crlf(w)
        && write_host_header(w, uri.host)
        && write_user_agent_header(w)
        && write_crlf(w)
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UriScheme {
    Http,
    Https,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UriInfo<'a> {
    pub scheme: UriScheme,
    pub host: &'a str,
    pub port: u32,
    /// Path plus anything after it; `None` for a bare authority.
    pub path: Option<&'a str>,
}

/// Parses enough of an http(s) URI to issue a request against it: scheme,
/// host (IP literals included), optional port, path.
pub fn parse_uri(uri: &str) -> Option<UriInfo<'_>> {
    let (scheme, default_port, rest) =
        if let Some(rest) = strip_prefix_ignore_case(uri, "https://") {
            (UriScheme::Https, 443, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(uri, "http://") {
            (UriScheme::Http, 80, rest)
        } else {
            return None;
        };

    // Authority ends at the first '/' when a path follows.
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], Some(&rest[idx..])),
        None => (rest, None),
    };

    // Userinfo is skipped; there's no use for it today.
    let authority = match authority.find('@') {
        Some(idx) => {
            let host = &authority[idx + 1..];
            if host.is_empty() {
                return None;
            }
            host
        }
        None => authority,
    };

    // An IP-literal host may contain ':'; the port separator is the last
    // ':' after any ']'.
    let port_search_start = match authority.as_bytes().first() {
        Some(b'[') => authority.rfind(']')?,
        _ => 0,
    };

    let (host, port) = match authority.rfind(':') {
        Some(idx) if idx >= port_search_start => {
            let port_str = &authority[idx + 1..];
            let port: u32 = port_str.parse().ok()?;
            (&authority[..idx], port)
        }
        _ => (authority, default_port),
    };

    if host.is_empty() {
        return None;
    }
    Some(UriInfo {
        scheme,
        host,
        port,
        path,
    })
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() < prefix.len() {
        return None;
    }
    if s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Error returned when the output buffer can't hold the encoded form.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UrlEncodeError;

fn is_unreserved(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'.' | b'~')
}

/// True when `s` contains any character that URL-encoding would change.
pub fn needs_escape(s: &str) -> bool {
    s.bytes().any(|c| !is_unreserved(c))
}

/// Percent-encodes `input` into `out`, returning the encoded string.
///
/// Unreserved characters (RFC 3986) pass through; everything else becomes
/// `%XX` with uppercase hex.
pub fn urlencode<'a>(
    input: &str,
    out: &'a mut [u8],
) -> Result<&'a str, UrlEncodeError> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut n = 0;
    for c in input.bytes() {
        if is_unreserved(c) {
            if n >= out.len() {
                return Err(UrlEncodeError);
            }
            out[n] = c;
            n += 1;
        } else {
            if n + 3 > out.len() {
                return Err(UrlEncodeError);
            }
            out[n] = b'%';
            out[n + 1] = HEX[usize::from(c >> 4)];
            out[n + 2] = HEX[usize::from(c & 0xf)];
            n += 3;
        }
    }
    // The output is ASCII by construction.
    core::str::from_utf8(&out[..n]).map_err(|_| UrlEncodeError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect_request(
        f: impl FnOnce(&mut dyn FnMut(&[u8]) -> bool) -> bool,
    ) -> String {
        let mut out = Vec::new();
        let mut w = |bytes: &[u8]| {
            out.extend_from_slice(bytes);
            true
        };
        assert!(f(&mut w));
        String::from_utf8(out).unwrap()
    }

    fn device() -> DeviceInfo<'static> {
        DeviceInfo {
            device_serial: "DEMOSERIAL",
            software_type: "main",
            software_version: "1.0.0+abc",
            hardware_version: "evt 24",
        }
    }

    const CONFIG: HttpClientConfig<'static> = HttpClientConfig {
        api_key: "my-project-key",
        chunks_host: "chunks.example.com",
        device_host: "device.example.com",
    };

    #[test]
    fn chunk_post_request_shape() {
        let request = collect_request(|w| {
            write_chunk_post_request(w, &CONFIG, &device(), 1234)
        });
        assert!(request
            .starts_with("POST /api/v0/chunks/DEMOSERIAL HTTP/1.1\r\n"));
        assert!(request.contains("Host:chunks.example.com\r\n"));
        assert!(request.contains(concat!(
            "User-Agent:TicosSDK/",
            env!("CARGO_PKG_VERSION"),
            "\r\n"
        )));
        assert!(request.contains("Ticos-Project-Key:my-project-key\r\n"));
        assert!(request
            .contains("Content-Type:application/octet-stream\r\n"));
        assert!(request.contains("Content-Length:1234\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn ota_url_request_escapes_params() {
        let request = collect_request(|w| {
            write_ota_url_request(w, &CONFIG, &device())
        });
        assert!(request.starts_with("GET /api/v0/releases/latest/url?"));
        assert!(request.contains("&device_serial=DEMOSERIAL"));
        // '+' and ' ' must be escaped in values.
        assert!(request.contains("&current_version=1.0.0%2Babc"));
        assert!(request.contains("&hardware_version=evt%2024"));
        assert!(request.contains(" HTTP/1.1\r\n"));
        assert!(request.contains("Host:device.example.com\r\n"));
        assert!(request.contains("Ticos-Project-Key:my-project-key\r\n"));
    }

    #[test]
    fn ota_payload_request_uses_parsed_url() {
        let request = collect_request(|w| {
            write_ota_payload_request(
                w,
                "https://downloads.example.com/ota/v2/fw.bin?sig=xyz",
            )
        });
        assert!(request.starts_with("GET /ota/v2/fw.bin?sig=xyz HTTP/1.1\r\n"));
        assert!(request.contains("Host:downloads.example.com\r\n"));
        // No project key on payload downloads; the URL is pre-signed.
        assert!(!request.contains("Ticos-Project-Key"));
    }

    #[test]
    fn uri_parsing_variants() {
        let uri = parse_uri("https://example.com/path/a").unwrap();
        assert_eq!(uri.scheme, UriScheme::Https);
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 443);
        assert_eq!(uri.path, Some("/path/a"));

        let uri = parse_uri("http://example.com").unwrap();
        assert_eq!(uri.port, 80);
        assert_eq!(uri.path, None);

        let uri = parse_uri("http://user:pw@example.com:8080/x").unwrap();
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 8080);

        let uri = parse_uri("https://[2001:db8::1]:8443/x").unwrap();
        assert_eq!(uri.host, "[2001:db8::1]");
        assert_eq!(uri.port, 8443);

        assert!(parse_uri("ftp://example.com").is_none());
        assert!(parse_uri("https://").is_none());
        assert!(parse_uri("https://example.com:notaport/").is_none());
    }

    #[test]
    fn urlencode_passes_unreserved_through() {
        let mut buf = [0u8; 64];
        let encoded = urlencode("abcXYZ019-_.~", &mut buf).unwrap();
        assert_eq!(encoded, "abcXYZ019-_.~");
        assert!(!needs_escape("abcXYZ019-_.~"));
    }

    #[test]
    fn urlencode_escapes_reserved() {
        let mut buf = [0u8; 64];
        assert_eq!(urlencode("a b&c", &mut buf).unwrap(), "a%20b%26c");
        assert!(needs_escape("a b&c"));
    }

    #[test]
    fn urlencode_rejects_short_buffer() {
        let mut buf = [0u8; 2];
        assert_eq!(urlencode("ab c", &mut buf), Err(UrlEncodeError));
    }

    #[test]
    fn urlencode_roundtrip() {
        fn urldecode(s: &str) -> Vec<u8> {
            let bytes = s.as_bytes();
            let mut out = Vec::new();
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'%' {
                    let hex = core::str::from_utf8(&bytes[i + 1..i + 3])
                        .unwrap();
                    out.push(u8::from_str_radix(hex, 16).unwrap());
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            out
        }

        let mut buf = [0u8; 256];
        for input in ["hello world", "1.0.0+2024-β", "a/b?c=d&e=f", "~-._"] {
            let encoded = urlencode(input, &mut buf).unwrap();
            assert_eq!(urldecode(encoded), input.as_bytes(), "{input}");
        }
    }
}
