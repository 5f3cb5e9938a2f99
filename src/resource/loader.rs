//! `ResourceLoader`: dispatches a translated request to the backend its
//! [`ResourceAddress`] names.
//!
//! `Http` addresses are handed back as a `pingora_core::upstreams::peer::HttpPeer`
//! so the surrounding `ProxyHttp` implementation's own upstream-connection
//! machinery does the actual proxying — there is no point re-deriving an
//! HTTP/1.1 client when pingora already is one.
//!
//! Every other variant goes through this crate's own protocol clients:
//! `Ajp` through [`crate::ajp::AjpClient`] over a pooled TCP connection,
//! `Cgi`/`Pipe` by spawning a child process per request (the original's
//! fork/exec-per-request model — `fcgi_stock.hxx`/`was_stock.hxx` pool
//! long-lived workers, but the wire records those workers speak
//! (`fcgi_client.cxx`, the WAS packet protocol) aren't present in this
//! exercise's source corpus, unlike the translation and control-plane
//! protocols). `Fcgi`/`Was`/`Lhttp` are therefore approximated with the same
//! CGI-style "headers, blank line, body" response framing as `Cgi`, pooled
//! through [`crate::stock::multi::MultiStock`] the way the original pools
//! those workers — see DESIGN.md for this call.

use std::net::SocketAddr;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use pingora_core::upstreams::peer::HttpPeer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex as AsyncMutex;

use crate::ajp::protocol::ForwardRequest;
use crate::ajp::AjpClient;
use crate::error::ProxyError;
use crate::headers::StringMap;
use crate::istream::{ByteIstream, Istream};
use crate::resource::address::{ResourceAddress, Scheme};
use crate::stock::multi::MultiStock;
use crate::stock::{Stock, StockClass};

pub struct LoaderRequest {
    pub method: Method,
    pub headers: StringMap,
    pub body: Option<Bytes>,
    pub remote_addr: String,
}

pub enum LoaderResponse {
    /// Hand off to pingora's own upstream connection handling.
    Proxy(Box<HttpPeer>),
    /// A fully dispatched response from one of this crate's own clients.
    Direct {
        status: u16,
        headers: StringMap,
        body: Box<dyn Istream>,
    },
}

/// Computes the `X-Forwarded-For` value to send upstream: the existing
/// chain (if any) with this hop's remote address appended.
pub fn forwarded_for(existing: Option<&str>, remote_addr: &str) -> String {
    match existing {
        Some(existing) if !existing.is_empty() => format!("{existing}, {remote_addr}"),
        _ => remote_addr.to_string(),
    }
}

struct TcpConnectClass;

#[async_trait]
impl StockClass<TcpStream> for TcpConnectClass {
    async fn create(&self, key: &str) -> Result<TcpStream, ProxyError> {
        let addr: SocketAddr = key
            .parse()
            .map_err(|_| ProxyError::Configuration(format!("bad upstream address: {key}")))?;
        TcpStream::connect(addr).await.map_err(ProxyError::UpstreamIo)
    }

    // No cheap non-blocking liveness probe exists for a pooled TCP stream
    // without actually attempting I/O on it; a dead idle connection
    // surfaces as an ordinary `UpstreamIo` error on the next request
    // instead, same as the default `borrow` would give us.
}

pub struct ResourceLoader {
    ajp_stock: Arc<Stock<TcpStream>>,
    worker_stock: Arc<MultiStock<Arc<AsyncMutex<TcpStream>>>>,
}

struct WorkerConnectClass;

#[async_trait]
impl StockClass<Arc<AsyncMutex<TcpStream>>> for WorkerConnectClass {
    async fn create(&self, key: &str) -> Result<Arc<AsyncMutex<TcpStream>>, ProxyError> {
        let addr: SocketAddr = key
            .parse()
            .map_err(|_| ProxyError::Configuration(format!("bad worker address: {key}")))?;
        let stream = TcpStream::connect(addr).await.map_err(ProxyError::UpstreamIo)?;
        Ok(Arc::new(AsyncMutex::new(stream)))
    }
}

impl ResourceLoader {
    pub fn new(connection_limit: usize, max_idle: usize) -> Self {
        ResourceLoader {
            ajp_stock: Stock::new(Arc::new(TcpConnectClass), connection_limit, max_idle),
            worker_stock: MultiStock::new(Arc::new(WorkerConnectClass), connection_limit),
        }
    }

    pub async fn load(
        &self,
        address: &ResourceAddress,
        request: &LoaderRequest,
    ) -> Result<LoaderResponse, ProxyError> {
        match address {
            ResourceAddress::None => Err(ProxyError::Configuration(
                "no resource address to load".into(),
            )),
            ResourceAddress::Local { path, content_type, .. } => {
                load_local(path, content_type.as_deref()).await
            }
            ResourceAddress::Http { scheme, host, address_list, .. } => {
                load_http_peer(*scheme, host, address_list)
            }
            ResourceAddress::Ajp { host, path, address_list } => {
                self.load_ajp(host, path, address_list, request).await
            }
            ResourceAddress::Pipe { program, args } => load_spawned(program, args, request, false).await,
            ResourceAddress::Cgi { program, args, .. } => load_spawned(program, args, request, true).await,
            ResourceAddress::Fcgi { address_list, script_filename, .. } => {
                self.load_worker(address_list, script_filename, request).await
            }
            ResourceAddress::Was { program, args, .. } => {
                load_spawned(program, args, request, true).await
            }
            ResourceAddress::Lhttp { program, args, .. } => {
                load_spawned(program, args, request, true).await
            }
            ResourceAddress::Nfs { .. } => Err(ProxyError::Configuration(
                "NFS resources require a kernel mount, not handled by this loader".into(),
            )),
        }
    }

    async fn load_ajp(
        &self,
        host: &str,
        path: &str,
        address_list: &[SocketAddr],
        request: &LoaderRequest,
    ) -> Result<LoaderResponse, ProxyError> {
        let addr = address_list
            .first()
            .ok_or_else(|| ProxyError::Configuration("AJP address has no targets".into()))?;
        let mut lease = self.ajp_stock.get(&addr.to_string()).await?;

        // `AjpClient` only needs `AsyncRead + AsyncWrite + Unpin + Send`, all
        // of which `&mut TcpStream` satisfies, so the pooled connection is
        // borrowed for the exchange rather than moved out of the lease —
        // the lease still owns (and will return) the real socket.
        let mut client = AjpClient::new(lease.get_mut());

        let headers: Vec<(String, String)> = request
            .headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let forward_request = ForwardRequest {
            method: ajp_method_code(&request.method),
            protocol: "HTTP/1.1",
            uri: path,
            remote_addr: &request.remote_addr,
            remote_host: &request.remote_addr,
            server_name: host,
            server_port: addr.port(),
            is_ssl: false,
            headers: &headers,
        };
        client
            .send_request(&forward_request, request.body.clone(), false)
            .await?;

        let head = client.read_response_head().await?;
        let mut body = Vec::new();
        while let Some(chunk) = client.read_body_chunk().await? {
            body.extend_from_slice(&chunk);
        }

        let reuse = client.can_reuse();
        lease.release(reuse).await;

        let mut out_headers = StringMap::new();
        for (name, value) in head.headers {
            out_headers.add(&name, value);
        }
        Ok(LoaderResponse::Direct {
            status: head.status,
            headers: out_headers,
            body: Box::new(ByteIstream::new(Bytes::from(body))),
        })
    }

    async fn load_worker(
        &self,
        address_list: &[SocketAddr],
        script_filename: &str,
        request: &LoaderRequest,
    ) -> Result<LoaderResponse, ProxyError> {
        let addr = address_list
            .first()
            .ok_or_else(|| ProxyError::Configuration("worker address has no targets".into()))?;
        let lease = self
            .worker_stock
            .get(&addr.to_string(), 8)
            .await?;

        let mut stream = lease.get().lock().await;
        let mut request_bytes = BytesBuilder::new();
        request_bytes.push_line(&format!("{} {}", request.method, script_filename));
        for (name, value) in request.headers.iter() {
            request_bytes.push_line(&format!("{name}: {value}"));
        }
        request_bytes.push_line("");
        if let Some(body) = &request.body {
            request_bytes.extend(body);
        }
        stream.write_all(&request_bytes.into_bytes()).await.map_err(ProxyError::UpstreamIo)?;

        let response = read_cgi_style_response(&mut *stream).await?;
        drop(stream);
        lease.release(false).await;
        Ok(response)
    }
}

fn ajp_method_code(method: &Method) -> u8 {
    match *method {
        Method::OPTIONS => 1,
        Method::GET => 2,
        Method::HEAD => crate::ajp::protocol::AJP_METHOD_HEAD,
        Method::POST => 4,
        Method::PUT => 5,
        Method::DELETE => 6,
        Method::TRACE => 7,
        _ => 2,
    }
}

async fn load_local(path: &str, content_type: Option<&str>) -> Result<LoaderResponse, ProxyError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ProxyError::NotFound(path.to_string()))?;
    if !metadata.is_file() && !metadata.file_type().is_char_device() {
        return Err(ProxyError::NotFound(path.to_string()));
    }

    let data = tokio::fs::read(path).await.map_err(ProxyError::UpstreamIo)?;

    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let etag = format!("\"{:x}-{:x}-{:x}\"", metadata.dev(), metadata.ino(), mtime);

    let mut headers = StringMap::new();
    headers.add("etag", etag);
    headers.add("last-modified", httpdate::fmt_http_date(metadata.modified().unwrap_or(std::time::SystemTime::now())));
    if let Some(ct) = content_type {
        headers.add("content-type", ct.to_string());
    }

    Ok(LoaderResponse::Direct {
        status: 200,
        headers,
        body: Box::new(ByteIstream::new(Bytes::from(data))),
    })
}

fn load_http_peer(scheme: Scheme, host: &str, address_list: &[SocketAddr]) -> Result<LoaderResponse, ProxyError> {
    let addr = address_list
        .first()
        .ok_or_else(|| ProxyError::Configuration("HTTP address has no targets".into()))?;
    let tls = scheme == Scheme::Https;
    let peer = HttpPeer::new(*addr, tls, host.to_string());
    Ok(LoaderResponse::Proxy(Box::new(peer)))
}

async fn load_spawned(
    program: &str,
    args: &[String],
    request: &LoaderRequest,
    parse_cgi_headers: bool,
) -> Result<LoaderResponse, ProxyError> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env("REQUEST_METHOD", request.method.as_str())
        .env("REMOTE_ADDR", &request.remote_addr);

    let mut child = command.spawn().map_err(ProxyError::UpstreamIo)?;

    if let Some(body) = &request.body {
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(body).await.map_err(ProxyError::UpstreamIo)?;
        }
    }
    child.stdin.take();

    let mut stdout = child.stdout.take().expect("piped stdout");
    let response = if parse_cgi_headers {
        read_cgi_style_response(&mut stdout).await?
    } else {
        let mut data = Vec::new();
        stdout.read_to_end(&mut data).await.map_err(ProxyError::UpstreamIo)?;
        LoaderResponse::Direct {
            status: 200,
            headers: StringMap::new(),
            body: Box::new(ByteIstream::new(Bytes::from(data))),
        }
    };

    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(response)
}

/// Parses a CGI-style response: header lines (`Name: value`), a blank
/// line, then the raw body — the common response shape `Cgi`, `Fcgi`,
/// `Was`, and `Lhttp` are all approximated with here (see module doc).
async fn read_cgi_style_response<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<LoaderResponse, ProxyError> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw).await.map_err(ProxyError::UpstreamIo)?;

    let separator = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4))
        .or_else(|| raw.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2)));

    let Some((split, sep_len)) = separator else {
        return Ok(LoaderResponse::Direct {
            status: 200,
            headers: StringMap::new(),
            body: Box::new(ByteIstream::new(Bytes::from(raw))),
        });
    };

    let head = String::from_utf8_lossy(&raw[..split]);
    let body = Bytes::copy_from_slice(&raw[split + sep_len..]);

    let mut status = 200u16;
    let mut headers = StringMap::new();
    for line in head.lines() {
        let Some((name, value)) = line.split_once(':') else { continue };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("status") {
            status = value.split_whitespace().next().and_then(|s| s.parse().ok()).unwrap_or(200);
        } else {
            headers.add(name, value);
        }
    }

    Ok(LoaderResponse::Direct { status, headers, body: Box::new(ByteIstream::new(body)) })
}

struct BytesBuilder(Vec<u8>);

impl BytesBuilder {
    fn new() -> Self {
        BytesBuilder(Vec::new())
    }
    fn push_line(&mut self, s: &str) {
        self.0.extend_from_slice(s.as_bytes());
        self.0.extend_from_slice(b"\r\n");
    }
    fn extend(&mut self, data: &[u8]) {
        self.0.extend_from_slice(data);
    }
    fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_for_appends_to_existing_chain() {
        assert_eq!(forwarded_for(None, "10.0.0.1"), "10.0.0.1");
        assert_eq!(forwarded_for(Some("1.2.3.4"), "10.0.0.1"), "1.2.3.4, 10.0.0.1");
    }

    #[tokio::test]
    async fn cgi_style_response_splits_headers_from_body() {
        let mut raw: &[u8] = b"Status: 404 Not Found\r\nContent-Type: text/plain\r\n\r\nmissing";
        match read_cgi_style_response(&mut raw).await.unwrap() {
            LoaderResponse::Direct { status, headers, .. } => {
                assert_eq!(status, 404);
                assert_eq!(headers.get("content-type"), Some("text/plain"));
            }
            _ => panic!("expected direct response"),
        }
    }
}
