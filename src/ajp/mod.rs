//! AJPv13 protocol client — a worked example of framing a
//! request/response protocol on top of [`crate::net::buffered_socket`].
//!
//! The client drives a small state machine mirroring the original's
//! request lifecycle: `ReadBegin` (nothing sent yet) -> `ReadNoBody` or
//! `ReadBody` (request sent, headers not yet back) -> `ReadEnd` (terminal,
//! `END_RESPONSE` seen). AJPv13 containers can ask for more request body
//! mid-response via `GET_BODY_CHUNK`; this client accounts for exactly how
//! many bytes it has offered against how many the container asked for, so
//! it never sends a body chunk the container didn't request and never
//! reports `END_RESPONSE` while a `GET_BODY_CHUNK` is still outstanding.

pub mod protocol;

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProxyError;
use crate::net::buffered_socket::BufferedSocket;
use protocol::{ForwardRequest, ServerPacket};

const AJP_TIMEOUT: Duration = Duration::from_secs(30);

/// Statuses that never carry a response body regardless of headers.
fn is_body_less_status(status: u16) -> bool {
    matches!(status, 100..=199 | 204 | 304)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AjpState {
    ReadBegin,
    ReadNoBody,
    ReadBody,
    ReadEnd,
}

pub struct AjpResponseHead {
    pub status: u16,
    pub status_message: String,
    pub headers: Vec<(String, String)>,
}

pub struct AjpClient<S> {
    socket: BufferedSocket<S>,
    state: AjpState,
    /// Bytes of the request body not yet offered to the container.
    pending_body: Bytes,
    /// Whether the response so far indicates the connection can be reused
    /// once `END_RESPONSE` arrives.
    reuse: bool,
    /// Method code of the in-flight request, needed at `SEND_HEADERS` time
    /// to tell whether the response is body-less (e.g. HEAD).
    request_method: u8,
    /// Bytes of response body still owed per `Content-Length`, if the
    /// container sent one. `None` means no bound is known.
    remaining: Option<usize>,
}

impl<S> AjpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(io: S) -> Self {
        AjpClient {
            socket: BufferedSocket::new(io, AJP_TIMEOUT, AJP_TIMEOUT),
            state: AjpState::ReadBegin,
            pending_body: Bytes::new(),
            reuse: true,
            request_method: 0,
            remaining: None,
        }
    }

    /// Sends `FORWARD_REQUEST` plus (if non-empty and length-known) the
    /// full body as a single initial chunk. AJPv13 requires a known
    /// content length up front; a caller that cannot supply one (a
    /// chunked-encoded client request) must reject the request before
    /// reaching this client — this protocol cannot forward chunked bodies.
    pub async fn send_request(
        &mut self,
        request: &ForwardRequest<'_>,
        body: Option<Bytes>,
        body_is_chunked: bool,
    ) -> Result<(), ProxyError> {
        if body_is_chunked {
            return Err(ProxyError::Protocol(
                "AJPv13 does not support chunked request bodies".into(),
            ));
        }
        if self.state != AjpState::ReadBegin {
            return Err(ProxyError::Protocol("AJP request already sent on this connection".into()));
        }

        let frame = protocol::encode_forward_request(request);
        self.socket.write_all(&frame).await?;

        self.request_method = request.method;
        self.pending_body = body.unwrap_or_default();
        if !self.pending_body.is_empty() {
            // Initial unsolicited offer is capped well under a single AJP
            // frame's 16-bit length field; the container asks for more via
            // `GET_BODY_CHUNK` as it consumes this one.
            self.offer_body_chunk(self.pending_body.len().min(1024))
                .await?;
        } else {
            // An empty body is signalled by a zero-length body chunk.
            let chunk = protocol::encode_body_chunk(&[]);
            self.socket.write_all(&chunk).await?;
        }

        self.state = AjpState::ReadNoBody;
        Ok(())
    }

    /// Sends up to `max` bytes of the still-pending request body. A no-op
    /// once the body is exhausted: the empty-body sentinel chunk already
    /// queued at request end means any further `GET_BODY_CHUNK` is
    /// unsolicited and must be silently ignored, not answered with another
    /// empty frame.
    async fn offer_body_chunk(&mut self, max: usize) -> Result<(), ProxyError> {
        if self.pending_body.is_empty() {
            return Ok(());
        }
        let n = self.pending_body.len().min(max);
        let chunk = self.pending_body.split_to(n);
        let frame = protocol::encode_body_chunk(&chunk);
        self.socket.write_all(&frame).await
    }

    /// Reads packets until `SEND_HEADERS` arrives, transparently servicing
    /// any `GET_BODY_CHUNK` requests the container makes first.
    pub async fn read_response_head(&mut self) -> Result<AjpResponseHead, ProxyError> {
        loop {
            match self.read_packet().await? {
                ServerPacket::GetBodyChunk { requested } => {
                    self.offer_body_chunk(requested as usize).await?;
                }
                ServerPacket::SendHeaders { status, status_message, headers } => {
                    let content_length = headers
                        .iter()
                        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, v)| v.parse::<usize>().ok());

                    if self.request_method == protocol::AJP_METHOD_HEAD || is_body_less_status(status) {
                        self.state = AjpState::ReadNoBody;
                        self.remaining = None;
                    } else {
                        self.state = AjpState::ReadBody;
                        self.remaining = content_length;
                    }
                    return Ok(AjpResponseHead { status, status_message, headers });
                }
                ServerPacket::EndResponse { reuse } => {
                    self.state = AjpState::ReadEnd;
                    self.reuse = reuse;
                    return Err(ProxyError::Protocol(
                        "AJP container ended response before sending headers".into(),
                    ));
                }
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected AJP packet while awaiting headers: {other:?}"
                    )))
                }
            }
        }
    }

    /// Reads the next body chunk, or `None` once `END_RESPONSE` has been
    /// seen (after which the state machine is terminal).
    pub async fn read_body_chunk(&mut self) -> Result<Option<Bytes>, ProxyError> {
        if self.state == AjpState::ReadEnd {
            return Ok(None);
        }
        loop {
            match self.read_packet().await? {
                ServerPacket::SendBodyChunk(data) => {
                    // In `ReadNoBody` (HEAD / body-less status) any chunk is
                    // unsolicited and discarded rather than handed upstream.
                    if self.state == AjpState::ReadNoBody {
                        continue;
                    }
                    if let Some(remaining) = self.remaining {
                        if data.len() > remaining {
                            self.state = AjpState::ReadEnd;
                            self.reuse = false;
                            return Err(ProxyError::Protocol(
                                "AJP body chunk exceeds remaining Content-Length".into(),
                            ));
                        }
                        self.remaining = Some(remaining - data.len());
                    }
                    return Ok(Some(data));
                }
                ServerPacket::GetBodyChunk { requested } => {
                    self.offer_body_chunk(requested as usize).await?;
                }
                ServerPacket::EndResponse { reuse } => {
                    if self.state == AjpState::ReadBody && self.remaining.unwrap_or(0) > 0 {
                        self.state = AjpState::ReadEnd;
                        self.reuse = false;
                        return Err(ProxyError::Protocol(
                            "AJP response ended before remaining Content-Length was delivered".into(),
                        ));
                    }
                    self.state = AjpState::ReadEnd;
                    self.reuse = reuse;
                    return Ok(None);
                }
                other => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected AJP packet mid-body: {other:?}"
                    )))
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == AjpState::ReadEnd
    }

    /// Whether the container said this connection may be reused for
    /// another request (only meaningful once `is_done()`).
    pub fn can_reuse(&self) -> bool {
        self.reuse
    }

    /// Sends a `CPING`/awaits `CPONG_REPLY`, used by the stock's idle-probe
    /// to detect a dead connection before handing it out again.
    pub async fn ping(&mut self) -> Result<(), ProxyError> {
        let mut frame = bytes::BytesMut::new();
        frame.extend_from_slice(&protocol::CLIENT_MAGIC);
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&[protocol::CPING]);
        self.socket.write_all(&frame).await?;

        match self.read_packet().await? {
            ServerPacket::CpongReply => Ok(()),
            other => Err(ProxyError::Protocol(format!("expected CPONG_REPLY, got {other:?}"))),
        }
    }

    async fn read_packet(&mut self) -> Result<ServerPacket, ProxyError> {
        while self.socket.buffered_len() < 4 {
            if !self.socket.fill().await? {
                return Err(ProxyError::Protocol("AJP connection closed mid-packet".into()));
            }
        }
        let header = &self.socket.peek()[..4];
        if header[0..2] != protocol::SERVER_MAGIC {
            return Err(ProxyError::Protocol("bad AJP server packet magic".into()));
        }
        let length = u16::from_be_bytes([header[2], header[3]]) as usize;

        while self.socket.buffered_len() < 4 + length {
            if !self.socket.fill().await? {
                return Err(ProxyError::Protocol("AJP connection closed mid-packet".into()));
            }
        }
        let payload = self.socket.peek()[4..4 + length].to_vec();
        self.socket.consume(4 + length);

        protocol::decode_server_packet(&payload)
            .ok_or_else(|| ProxyError::Protocol("unrecognised AJP response packet".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};
    use tokio::io::duplex;

    fn server_frame(body: &[u8]) -> BytesMut {
        let mut out = BytesMut::new();
        out.extend_from_slice(&protocol::SERVER_MAGIC);
        out.put_u16(body.len() as u16);
        out.extend_from_slice(body);
        out
    }

    #[tokio::test]
    async fn chunked_body_is_rejected_before_any_io() {
        let (_client_io, server_io) = duplex(64);
        let mut client = AjpClient::new(server_io);
        let req = ForwardRequest {
            method: 2,
            protocol: "HTTP/1.1",
            uri: "/",
            remote_addr: "127.0.0.1",
            remote_host: "127.0.0.1",
            server_name: "example.com",
            server_port: 80,
            is_ssl: false,
            headers: &[],
        };
        let err = client.send_request(&req, None, true).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn reads_headers_then_body_then_end() {
        let (mut peer, io) = duplex(4096);
        let mut client = AjpClient::new(io);

        let req = ForwardRequest {
            method: 2,
            protocol: "HTTP/1.1",
            uri: "/",
            remote_addr: "127.0.0.1",
            remote_host: "127.0.0.1",
            server_name: "example.com",
            server_port: 80,
            is_ssl: false,
            headers: &[],
        };

        let driver = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 4096];
            // drain FORWARD_REQUEST + empty body chunk the client sends
            let _ = peer.read(&mut buf).await.unwrap();

            let mut headers_body = BytesMut::new();
            headers_body.put_u8(protocol::SEND_HEADERS);
            headers_body.put_u16(200);
            headers_body.put_u16(2);
            headers_body.extend_from_slice(b"OK");
            headers_body.put_u8(0);
            headers_body.put_u16(0);
            peer.write_all(&server_frame(&headers_body)).await.unwrap();

            let mut chunk_body = BytesMut::new();
            chunk_body.put_u8(protocol::SEND_BODY_CHUNK);
            chunk_body.put_u16(5);
            chunk_body.extend_from_slice(b"hello");
            peer.write_all(&server_frame(&chunk_body)).await.unwrap();

            let end_body = [protocol::END_RESPONSE, 1];
            peer.write_all(&server_frame(&end_body)).await.unwrap();
        });

        client.send_request(&req, None, false).await.unwrap();
        let head = client.read_response_head().await.unwrap();
        assert_eq!(head.status, 200);

        let chunk = client.read_body_chunk().await.unwrap();
        assert_eq!(chunk, Some(Bytes::from_static(b"hello")));

        let end = client.read_body_chunk().await.unwrap();
        assert!(end.is_none());
        assert!(client.is_done());
        assert!(client.can_reuse());

        driver.await.unwrap();
    }
}
