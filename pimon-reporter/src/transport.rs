//! Minimal HTTP/1.1 client over a plain or TLS TCP stream.
//!
//! One request per connection (`Connection: close`); the response is read
//! until the server closes.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, Response, Uri, Version, header, request, response};
use itertools::Itertools;
use log::{debug, trace};
use serde::Serialize;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, native_tls::TlsConnector};
use tokio_tungstenite::MaybeTlsStream;

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);
const MAX_HEADERS: usize = 64;

/// The dashboard server and how to reach it.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// `host:port`
    pub server_addr: String,
    pub tls: bool,
    pub prefer_ipv6: bool,
}

impl Endpoint {
    pub fn http_url(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}{path}", self.server_addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!("{scheme}://{}{path}", self.server_addr)
    }

    /// TCP connection to the host of `uri`, wrapped in TLS when enabled.
    pub async fn connect(&self, uri: &Uri) -> anyhow::Result<MaybeTlsStream<TcpStream>> {
        let host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?;
        // IPv6 literals keep their brackets in the URI
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let port = uri.port_u16().unwrap_or(if self.tls { 443 } else { 80 });
        trace!("connecting to ({host}, {port})");

        let stream = connect_happy_eyeballs((host, port), self.prefer_ipv6).await?;

        if self.tls {
            let connector = TokioTlsConnector::from(TlsConnector::new()?);
            Ok(MaybeTlsStream::NativeTls(
                connector.connect(host, stream).await?,
            ))
        } else {
            Ok(MaybeTlsStream::Plain(stream))
        }
    }

    /// POST `body` as JSON to `path`.
    pub async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> anyhow::Result<Response<Bytes>> {
        let body = Bytes::from(serde_json::to_vec(body)?);
        let req = request_builder(&self.http_url(path), Method::POST)?
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)?;

        self.send(req).await
    }

    pub async fn send(&self, req: Request<Bytes>) -> anyhow::Result<Response<Bytes>> {
        let mut stream = self.connect(req.uri()).await?;

        stream.write_all(&encode_request(&req)).await?;
        stream.flush().await?;

        let mut buffer = BytesMut::with_capacity(256);
        while stream.read_buf(&mut buffer).await? != 0 {}
        trace!("Response: {:?}", String::from_utf8_lossy(&buffer));

        decode_response(buffer.freeze())
    }
}

/// Request builder with the headers every request carries.
pub fn request_builder(uri: &str, method: Method) -> anyhow::Result<request::Builder> {
    let uri = uri.parse::<Uri>()?;
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?
        .as_str();
    // drop userinfo
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    if host.is_empty() {
        anyhow::bail!("URL error: empty host name");
    }

    Ok(Request::builder()
        .method(method)
        .header(header::HOST, host)
        .header(header::CONNECTION, "close")
        .header(header::ACCEPT_ENCODING, "identity")
        .uri(uri))
}

/// Race connection attempts across every resolved address, starting a new
/// one whenever the previous has not finished within the delay.
async fn connect_happy_eyeballs<A: ToSocketAddrs>(
    addr: A,
    prefer_ipv6: bool,
) -> anyhow::Result<TcpStream> {
    let (v4, v6): (Vec<_>, Vec<_>) = lookup_host(addr).await?.partition(|a| a.is_ipv4());
    let (preferred, fallback) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };

    let mut attempts = JoinSet::new();
    for addr in preferred.into_iter().interleave(fallback) {
        attempts.spawn(TcpStream::connect(addr));

        let delay = tokio::time::sleep(HAPPY_EYEBALLS_DELAY);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                biased;

                Some(res) = attempts.join_next() => {
                    if let Some(stream) = settle_attempt(res) {
                        return Ok(stream);
                    }
                    if attempts.is_empty() {
                        break;
                    }
                }
                _ = &mut delay => break,
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Some(stream) = settle_attempt(res) {
            return Ok(stream);
        }
    }

    Err(anyhow::anyhow!("I/O error: all connection attempts failed"))
}

fn settle_attempt(
    res: Result<std::io::Result<TcpStream>, tokio::task::JoinError>,
) -> Option<TcpStream> {
    match res {
        Ok(Ok(stream)) => {
            debug!(
                "connection established with {}",
                stream
                    .peer_addr()
                    .map_or_else(|_| "<unknown>".to_owned(), |a| a.to_string())
            );
            Some(stream)
        }
        Ok(Err(e)) => {
            trace!("connection attempt failed: {e}");
            None
        }
        Err(e) => {
            trace!("connection attempt panicked: {e}");
            None
        }
    }
}

fn encode_request(req: &Request<Bytes>) -> Bytes {
    let body = req.body();
    let mut buffer = BytesMut::with_capacity(128 + body.len());

    let target = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    buffer.put_slice(format!("{} {target} {:?}\r\n", req.method(), req.version()).as_bytes());

    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }
    buffer.put_slice(b"\r\n");
    buffer.put_slice(body);

    trace!("Request: {:?}", String::from_utf8_lossy(&buffer));
    buffer.freeze()
}

fn decode_response(bytes: Bytes) -> anyhow::Result<Response<Bytes>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let httparse::Status::Complete(body_start) = resp.parse(&bytes)? else {
        anyhow::bail!("HTTP error: response is incomplete");
    };

    let mut builder = response::Builder::new()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        });

    let mut content_length = None;
    for h in resp.headers.iter() {
        if h.name.eq_ignore_ascii_case(header::CONTENT_LENGTH.as_str()) {
            content_length = std::str::from_utf8(h.value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok());
        }
        builder = builder.header(h.name, h.value);
    }

    let body = bytes.slice(body_start..);
    let body = match content_length {
        Some(len) if body.len() < len => {
            anyhow::bail!("HTTP error: body is {} of {len} bytes", body.len())
        }
        Some(len) => body.slice(..len),
        None => body,
    };

    Ok(builder.body(body)?)
}
