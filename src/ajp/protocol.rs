//! AJPv13 wire constants and pure encode/decode helpers.
//!
//! Framing: every packet is `{magic: 2 bytes}{length: u16be}{payload}`.
//! Client-to-container packets use magic `0x12 0x34`; container-to-client
//! packets use magic `0x41 0x42` (`"AB"`). This client only ever drives the
//! `FORWARD_REQUEST` exchange — `CPING`/`SHUTDOWN`/JK-specific packets are
//! out of scope; this is a worked single-protocol framing example rather
//! than a full mod_jk-compatible container implementation.

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

pub const CLIENT_MAGIC: [u8; 2] = [0x12, 0x34];
pub const SERVER_MAGIC: [u8; 2] = [0x41, 0x42];

/// Request message type byte (the first byte of a `FORWARD_REQUEST`
/// payload).
pub const FORWARD_REQUEST: u8 = 2;
pub const CPING: u8 = 10;

/// Request method codes (`FORWARD_REQUEST` method byte). Only the ones this
/// client needs to special-case are named; others are passed through as the
/// raw byte the caller already picked.
pub const AJP_METHOD_HEAD: u8 = 3;

/// Response message type bytes.
pub const SEND_BODY_CHUNK: u8 = 3;
pub const SEND_HEADERS: u8 = 4;
pub const END_RESPONSE: u8 = 5;
pub const GET_BODY_CHUNK: u8 = 6;
pub const CPONG_REPLY: u8 = 9;

/// Well-known request header codes, `0xA0xx`. Any header outside this set
/// is sent as a literal name string instead.
pub fn well_known_request_header(name: &str) -> Option<u16> {
    Some(match name.to_ascii_lowercase().as_str() {
        "accept" => 0xA001,
        "accept-charset" => 0xA002,
        "accept-encoding" => 0xA003,
        "accept-language" => 0xA004,
        "authorization" => 0xA005,
        "connection" => 0xA006,
        "content-type" => 0xA007,
        "content-length" => 0xA008,
        "cookie" => 0xA009,
        "cookie2" => 0xA00A,
        "host" => 0xA00B,
        "pragma" => 0xA00C,
        "referer" => 0xA00D,
        "user-agent" => 0xA00E,
        _ => return None,
    })
}

/// Well-known response header codes, `0xA0xx`, disjoint from the request
/// set above (a response can legally echo e.g. `Content-Type`, which
/// reuses the same code).
pub fn response_header_name_for_code(code: u16) -> Option<&'static str> {
    Some(match code {
        0xA001 => "content-type",
        0xA002 => "content-language",
        0xA003 => "content-length",
        0xA004 => "date",
        0xA005 => "last-modified",
        0xA006 => "location",
        0xA007 => "set-cookie",
        0xA008 => "set-cookie2",
        0xA009 => "servlet-engine",
        0xA00A => "status",
        0xA00B => "www-authenticate",
        _ => return None,
    })
}

fn put_ajp_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Encodes a `FORWARD_REQUEST` body (method, protocol, uri, remote
/// addr/host, server name/port, is_ssl, headers, no attributes — the
/// request-time attribute list is unused by this client).
pub struct ForwardRequest<'a> {
    pub method: u8,
    pub protocol: &'a str,
    pub uri: &'a str,
    pub remote_addr: &'a str,
    pub remote_host: &'a str,
    pub server_name: &'a str,
    pub server_port: u16,
    pub is_ssl: bool,
    pub headers: &'a [(String, String)],
}

pub fn encode_forward_request(req: &ForwardRequest<'_>) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(FORWARD_REQUEST);
    body.put_u8(req.method);
    put_ajp_string(&mut body, req.protocol);
    put_ajp_string(&mut body, req.uri);
    put_ajp_string(&mut body, req.remote_addr);
    put_ajp_string(&mut body, req.remote_host);
    put_ajp_string(&mut body, req.server_name);
    body.put_u16(req.server_port);
    body.put_u8(if req.is_ssl { 1 } else { 0 });

    body.put_u16(req.headers.len() as u16);
    for (name, value) in req.headers {
        if let Some(code) = well_known_request_header(name) {
            body.put_u16(code);
        } else {
            put_ajp_string(&mut body, name);
        }
        put_ajp_string(&mut body, value);
    }
    body.put_u8(0xFF); // request-terminator attribute code: no attributes

    frame(&CLIENT_MAGIC, &body)
}

/// A raw body-data chunk sent from client to container.
pub fn encode_body_chunk(data: &[u8]) -> BytesMut {
    let mut body = BytesMut::with_capacity(data.len() + 2);
    body.put_u16(data.len() as u16);
    body.put_slice(data);
    frame(&CLIENT_MAGIC, &body)
}

fn frame(magic: &[u8; 2], body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_slice(magic);
    out.put_u16(body.len() as u16);
    out.put_slice(body);
    out
}

/// A decoded response-side packet.
#[derive(Debug)]
pub enum ServerPacket {
    SendHeaders { status: u16, status_message: String, headers: Vec<(String, String)> },
    SendBodyChunk(bytes::Bytes),
    EndResponse { reuse: bool },
    GetBodyChunk { requested: u16 },
    CpongReply,
}

/// Parses one complete container-to-client packet (caller has already
/// split it out of the byte stream using the 4-byte header).
pub fn decode_server_packet(payload: &[u8]) -> Option<ServerPacket> {
    let (&kind, rest) = payload.split_first()?;
    match kind {
        SEND_HEADERS => decode_send_headers(rest),
        SEND_BODY_CHUNK => {
            let len = u16::from_be_bytes(rest.get(0..2)?.try_into().ok()?) as usize;
            let data = rest.get(2..2 + len)?;
            Some(ServerPacket::SendBodyChunk(bytes::Bytes::copy_from_slice(data)))
        }
        END_RESPONSE => {
            let reuse = rest.first().map(|&b| b != 0).unwrap_or(true);
            Some(ServerPacket::EndResponse { reuse })
        }
        GET_BODY_CHUNK => {
            let requested = u16::from_be_bytes(rest.get(0..2)?.try_into().ok()?);
            Some(ServerPacket::GetBodyChunk { requested })
        }
        CPONG_REPLY => Some(ServerPacket::CpongReply),
        _ => None,
    }
}

fn decode_send_headers(mut data: &[u8]) -> Option<ServerPacket> {
    let status = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    data = &data[2..];
    let (status_message, rest) = read_ajp_string(data)?;
    data = rest;
    let num_headers = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?);
    data = &data[2..];

    let mut headers = Vec::with_capacity(num_headers as usize);
    for _ in 0..num_headers {
        let (code_or_len, after_code) = (
            u16::from_be_bytes(data.get(0..2)?.try_into().ok()?),
            &data[2..],
        );
        let (name, after_name) = if code_or_len >= 0xA000 {
            (response_header_name_for_code(code_or_len)?.to_string(), after_code)
        } else {
            let len = code_or_len as usize;
            let name = String::from_utf8_lossy(after_code.get(..len)?).into_owned();
            (name, after_code.get(len + 1..)?) // +1 skips the trailing NUL
        };
        data = after_name;
        let (value, rest) = read_ajp_string(data)?;
        data = rest;
        headers.push((name, value));
    }

    Some(ServerPacket::SendHeaders { status, status_message, headers })
}

fn read_ajp_string(data: &[u8]) -> Option<(String, &[u8])> {
    let len = u16::from_be_bytes(data.get(0..2)?.try_into().ok()?) as usize;
    let s = String::from_utf8_lossy(data.get(2..2 + len)?).into_owned();
    Some((s, data.get(2 + len + 1..)?))
}

/// Builds a flat ordered header list from a map preserving insertion order
/// via a caller-supplied `Vec`, used so `encode_forward_request` doesn't
/// need to depend on `crate::headers::StringMap` directly.
pub fn headers_from_map(map: &HashMap<String, String>) -> Vec<(String, String)> {
    map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_request_frame_has_client_magic() {
        let req = ForwardRequest {
            method: 2,
            protocol: "HTTP/1.1",
            uri: "/app",
            remote_addr: "127.0.0.1",
            remote_host: "127.0.0.1",
            server_name: "example.com",
            server_port: 80,
            is_ssl: false,
            headers: &[("host".into(), "example.com".into())],
        };
        let frame = encode_forward_request(&req);
        assert_eq!(&frame[0..2], &CLIENT_MAGIC);
    }

    #[test]
    fn send_headers_round_trips() {
        let mut body = BytesMut::new();
        body.put_u8(SEND_HEADERS);
        body.put_u16(200);
        put_ajp_string(&mut body, "OK");
        body.put_u16(1);
        put_ajp_string(&mut body, "x-custom");
        put_ajp_string(&mut body, "value");

        match decode_server_packet(&body).unwrap() {
            ServerPacket::SendHeaders { status, headers, .. } => {
                assert_eq!(status, 200);
                assert_eq!(headers, vec![("x-custom".to_string(), "value".to_string())]);
            }
            other => panic!("unexpected packet: {other:?}"),
        }
    }

    #[test]
    fn end_response_decodes_reuse_flag() {
        let body = [END_RESPONSE, 1];
        match decode_server_packet(&body).unwrap() {
            ServerPacket::EndResponse { reuse } => assert!(reuse),
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
