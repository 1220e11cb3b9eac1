//! HTTP/1.1 Upgrade (h2c) boundary glue
//!
//! Builds the upgrade request/response and scans the peer's side of the
//! exchange just far enough to know "upgrade succeeded, preface bytes begin
//! here". Full HTTP/1.1 parsing stays outside the engine; residual bytes
//! after the header terminator belong to the HTTP/2 preface and must be
//! handed to the frame layer, not discarded.

use crate::error::{Error, Result};
use crate::settings::Settings;

/// Result of scanning a complete upgrade message.
#[derive(Debug)]
pub(crate) struct UpgradeOutcome {
    /// Bytes of the current `feed` input consumed by the HTTP/1.1 message;
    /// everything after this offset is HTTP/2 framing.
    pub consumed: usize,
    /// Decoded `HTTP2-Settings` payload from an upgrade request, if present.
    pub settings_payload: Option<Vec<u8>>,
}

/// Which side of the upgrade exchange we are scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpgradeRole {
    /// Server scanning the client's upgrade request.
    Request,
    /// Client scanning the server's 101 response.
    Response,
}

/// Maximum bytes of HTTP/1.1 header we are willing to buffer.
const MAX_UPGRADE_BYTES: usize = 16384;

/// Accumulates the peer's upgrade message until the header terminator.
pub(crate) struct UpgradeScanner {
    role: UpgradeRole,
    buf: Vec<u8>,
}

impl UpgradeScanner {
    pub fn new(role: UpgradeRole) -> Self {
        UpgradeScanner {
            role,
            buf: Vec::new(),
        }
    }

    /// Feed bytes. Returns `Ok(Some(outcome))` once the message is complete
    /// and valid, `Ok(None)` if more bytes are needed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<UpgradeOutcome>> {
        let already = self.buf.len();
        self.buf.extend_from_slice(data);
        if self.buf.len() > MAX_UPGRADE_BYTES {
            return Err(Error::UpgradeFailed("upgrade message too large".into()));
        }

        let Some(end) = find_terminator(&self.buf) else {
            return Ok(None);
        };

        let head = String::from_utf8_lossy(&self.buf[..end]).to_string();
        let settings_payload = self.validate(&head)?;
        // Offset of the first residual byte within this call's input.
        let consumed = (end + 4).saturating_sub(already);
        Ok(Some(UpgradeOutcome {
            consumed,
            settings_payload,
        }))
    }

    fn validate(&self, head: &str) -> Result<Option<Vec<u8>>> {
        let mut lines = head.split("\r\n");
        let start_line = lines.next().unwrap_or_default();

        match self.role {
            UpgradeRole::Response => {
                let mut parts = start_line.split_whitespace();
                let version = parts.next().unwrap_or_default();
                let status = parts.next().unwrap_or_default();
                if !version.starts_with("HTTP/1.1") || status != "101" {
                    return Err(Error::UpgradeFailed(format!(
                        "expected 101 Switching Protocols, got {start_line:?}"
                    )));
                }
                if !header_token_present(lines.clone(), "upgrade", "h2c") {
                    return Err(Error::UpgradeFailed("response is not an h2c upgrade".into()));
                }
                Ok(None)
            }
            UpgradeRole::Request => {
                if !start_line.contains("HTTP/1.1") {
                    return Err(Error::UpgradeFailed(format!(
                        "not an HTTP/1.1 request: {start_line:?}"
                    )));
                }
                if !header_token_present(lines.clone(), "upgrade", "h2c") {
                    return Err(Error::UpgradeFailed("request is not an h2c upgrade".into()));
                }
                let settings_payload = lines
                    .clone()
                    .find_map(|line| header_value(line, "http2-settings"))
                    .map(|value| {
                        base64_decode(value.trim()).ok_or_else(|| {
                            Error::UpgradeFailed("bad HTTP2-Settings encoding".into())
                        })
                    })
                    .transpose()?;
                Ok(settings_payload)
            }
        }
    }
}

/// Build the client's h2c upgrade request (RFC 7540 Section 3.2).
pub fn build_upgrade_request(host: &str, settings: &Settings) -> String {
    let payload = settings.encode_to_vec();
    let token = base64_encode(&payload);
    let mut req = String::new();
    req.push_str("GET / HTTP/1.1\r\n");
    req.push_str(&format!("Host: {host}\r\n"));
    req.push_str("Connection: Upgrade, HTTP2-Settings\r\n");
    req.push_str("Upgrade: h2c\r\n");
    req.push_str(&format!("HTTP2-Settings: {token}\r\n"));
    req.push_str("\r\n");
    req
}

/// Build the server's 101 Switching Protocols response.
pub fn build_upgrade_response() -> String {
    let mut rsp = String::new();
    rsp.push_str("HTTP/1.1 101 Switching Protocols\r\n");
    rsp.push_str("Connection: Upgrade\r\n");
    rsp.push_str("Upgrade: h2c\r\n");
    rsp.push_str("\r\n");
    rsp
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (key, value) = line.split_once(':')?;
    if key.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

fn header_token_present<'a>(
    lines: impl Iterator<Item = &'a str>,
    name: &str,
    token: &str,
) -> bool {
    for line in lines {
        if let Some(value) = header_value(line, name) {
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
            {
                return true;
            }
        }
    }
    false
}

const BASE64_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard base64 with padding, as used by the HTTP2-Settings header.
fn base64_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len().div_ceil(3) * 4);
    for chunk in input.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = chunk.get(1).copied().unwrap_or(0) as u32;
        let b2 = chunk.get(2).copied().unwrap_or(0) as u32;
        let triple = (b0 << 16) | (b1 << 8) | b2;

        out.push(BASE64_ALPHABET[(triple >> 18) as usize & 0x3f] as char);
        out.push(BASE64_ALPHABET[(triple >> 12) as usize & 0x3f] as char);
        out.push(if chunk.len() > 1 {
            BASE64_ALPHABET[(triple >> 6) as usize & 0x3f] as char
        } else {
            '='
        });
        out.push(if chunk.len() > 2 {
            BASE64_ALPHABET[triple as usize & 0x3f] as char
        } else {
            '='
        });
    }
    out
}

fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let mut output = Vec::with_capacity(input.len() * 3 / 4);
    let mut buffer = 0u32;
    let mut bits = 0;

    for c in input.bytes() {
        if c == b'=' {
            break;
        }
        let value = BASE64_ALPHABET.iter().position(|&x| x == c)? as u32;
        buffer = (buffer << 6) | value;
        bits += 6;

        if bits >= 8 {
            bits -= 8;
            output.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }

    Some(output)
}
