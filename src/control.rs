//! Control-plane UDP protocol: a tiny out-of-band channel used by
//! deployment tooling (the original's `send-control` utility) to poke the
//! running proxy without going through HTTP — today, just cache
//! invalidation.
//!
//! Wire format is exact and wire-compatible with the original's
//! `include/beng-proxy/control.h`: `{magic: u32be = 0x63046101}{length: u16be}
//! {command: u16be}{payload}`. `CONTROL_TCACHE_INVALIDATE`'s payload in the
//! original is a TLV-encoded set of translate fields identifying what to
//! drop; this crate's [`crate::translate::cache::TranslationCache`] indexes
//! invalidation by host only (see its docs), so the payload here is treated
//! as a bare UTF-8 host string rather than the richer original encoding —
//! recorded as an Open Question resolution in DESIGN.md.

use std::sync::Arc;

use async_trait::async_trait;
use pingora::server::{ListenFds, ShutdownWatch};
use pingora::services::Service;
use tokio::net::UdpSocket;

use crate::error::ProxyError;
use crate::translate::cache::TranslationCache;

pub const CONTROL_MAGIC: u32 = 0x6304_6101;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ControlCommand {
    Nop = 0,
    TcacheInvalidate = 1,
}

impl ControlCommand {
    fn from_u16(v: u16) -> Option<Self> {
        match v {
            0 => Some(ControlCommand::Nop),
            1 => Some(ControlCommand::TcacheInvalidate),
            _ => None,
        }
    }
}

/// One decoded control packet.
pub struct ControlPacket {
    pub command: ControlCommand,
    pub payload: Vec<u8>,
}

/// Parses one UDP datagram's worth of bytes into a control packet. Unlike
/// the translation wire protocol, one datagram carries exactly one command
/// (no terminator, no multi-packet framing) — that's the whole point of
/// using UDP here.
pub fn decode_packet(datagram: &[u8]) -> Result<ControlPacket, ProxyError> {
    if datagram.len() < 8 {
        return Err(ProxyError::Protocol("control packet shorter than header".into()));
    }
    let magic = u32::from_be_bytes(datagram[0..4].try_into().unwrap());
    if magic != CONTROL_MAGIC {
        return Err(ProxyError::Protocol("bad control packet magic".into()));
    }
    let length = u16::from_be_bytes(datagram[4..6].try_into().unwrap()) as usize;
    let command = u16::from_be_bytes(datagram[6..8].try_into().unwrap());
    let payload = datagram
        .get(8..8 + length)
        .ok_or_else(|| ProxyError::Protocol("control packet payload shorter than declared length".into()))?;

    let command = ControlCommand::from_u16(command)
        .ok_or_else(|| ProxyError::Protocol(format!("unknown control command {command}")))?;

    Ok(ControlPacket {
        command,
        payload: payload.to_vec(),
    })
}

pub fn encode_packet(command: ControlCommand, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&CONTROL_MAGIC.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(&(command as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// A bound UDP control socket dispatching received packets against the
/// translation cache. Only the host the packet arrived from's own datagram
/// payload is trusted; there is no authentication layer at this level,
/// matching the original (control traffic is expected to stay on a
/// trusted/firewalled interface).
pub struct ControlListener {
    socket: UdpSocket,
}

impl ControlListener {
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let socket = UdpSocket::bind(addr).await.map_err(ProxyError::Io)?;
        Ok(ControlListener { socket })
    }

    /// Services control packets until the socket errors out. Each packet is
    /// handled independently; a malformed packet is logged and skipped
    /// rather than tearing down the listener.
    pub async fn run(&self, translation_cache: &TranslationCache) {
        let mut buf = [0u8; 4096];
        loop {
            let (n, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!("control socket recv failed: {err}");
                    continue;
                }
            };

            match decode_packet(&buf[..n]) {
                Ok(packet) => self.dispatch(packet, translation_cache),
                Err(err) => log::warn!("bad control packet from {peer}: {err}"),
            }
        }
    }

    fn dispatch(&self, packet: ControlPacket, translation_cache: &TranslationCache) {
        match packet.command {
            ControlCommand::Nop => {}
            ControlCommand::TcacheInvalidate => {
                if let Ok(host) = std::str::from_utf8(&packet.payload) {
                    log::info!("control: invalidating translation cache for host {host}");
                    translation_cache.invalidate_host(host);
                }
            }
        }
    }
}

/// Adapts [`ControlListener`] into a `pingora::services::Service` so it can
/// be registered on the server alongside the HTTP proxy and access-log
/// services, running as a background service rather than a hand-rolled
/// thread.
pub struct ControlService {
    address: String,
    translation_cache: Arc<TranslationCache>,
}

impl ControlService {
    pub fn new(address: String, translation_cache: Arc<TranslationCache>) -> Self {
        ControlService { address, translation_cache }
    }
}

#[async_trait]
impl Service for ControlService {
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        let listener = match ControlListener::bind(&self.address).await {
            Ok(listener) => listener,
            Err(err) => {
                log::error!("control service failed to bind {}: {err}", self.address);
                return;
            }
        };

        tokio::select! {
            _ = listener.run(&self.translation_cache) => {}
            _ = shutdown.changed() => {
                log::info!("shutdown signal received, stopping control service");
            }
        }
    }

    fn name(&self) -> &'static str {
        "control"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let encoded = encode_packet(ControlCommand::TcacheInvalidate, b"example.com");
        let decoded = decode_packet(&encoded).unwrap();
        assert_eq!(decoded.command, ControlCommand::TcacheInvalidate);
        assert_eq!(decoded.payload, b"example.com");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut encoded = encode_packet(ControlCommand::Nop, &[]);
        encoded[0] ^= 0xFF;
        assert!(decode_packet(&encoded).is_err());
    }

    #[test]
    fn rejects_unknown_command() {
        let mut encoded = encode_packet(ControlCommand::Nop, &[]);
        encoded[6..8].copy_from_slice(&99u16.to_be_bytes());
        assert!(decode_packet(&encoded).is_err());
    }

    #[tokio::test]
    async fn nop_dispatch_touches_nothing() {
        let cache = TranslationCache::new();
        let listener = ControlListener::bind("127.0.0.1:0").await.unwrap();
        let packet = decode_packet(&encode_packet(ControlCommand::Nop, &[])).unwrap();
        listener.dispatch(packet, &cache);
        assert_eq!(cache.len(), 0);
    }
}
