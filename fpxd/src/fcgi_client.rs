//! FastCGI responder client for the PHP-FPM upstream.
//!
//! Wire format per the FastCGI 1.0 specification:
//! <https://fastcgi-archives.github.io/FastCGI_Specification.html>

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use rand::Rng;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

pub const FCGI_VERSION: u8 = 1;
pub const FCGI_BEGIN_REQUEST: u8 = 1;
pub const FCGI_END_REQUEST: u8 = 3;
pub const FCGI_PARAMS: u8 = 4;
pub const FCGI_STDIN: u8 = 5;
pub const FCGI_STDOUT: u8 = 6;
pub const FCGI_STDERR: u8 = 7;

const FCGI_RESPONDER: u16 = 1;
const FCGI_KEEP_CONN: u8 = 1;

/// Record payloads are framed with a 16-bit length.
pub const MAX_RECORD_PAYLOAD: usize = 65535;

const MAX_STDERR_CAPTURE: usize = 64 * 1024;
const ACQUIRE_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FcgiError {
    #[error("could not write record to FPM socket")]
    TransportWrite(#[source] std::io::Error),
    #[error("could not read record from FPM socket")]
    TransportRead(#[source] std::io::Error),
    #[error("could not reconnect to {}", path.display())]
    Reconnect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed FPM response: {0}")]
    MalformedResponse(String),
    #[error("record payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("FPM connection pool is closed")]
    PoolClosed,
}

/// The fixed 8-byte frame in front of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub version: u8,
    pub record_type: u8,
    pub request_id: u16,
    pub content_length: u16,
    pub padding_length: u8,
    pub reserved: u8,
}

impl RecordHeader {
    pub fn encode(&self) -> [u8; 8] {
        [
            self.version,
            self.record_type,
            (self.request_id >> 8) as u8,
            (self.request_id & 0xff) as u8,
            (self.content_length >> 8) as u8,
            (self.content_length & 0xff) as u8,
            self.padding_length,
            self.reserved,
        ]
    }

    pub fn decode(raw: &[u8; 8]) -> Self {
        Self {
            version: raw[0],
            record_type: raw[1],
            request_id: u16::from_be_bytes([raw[2], raw[3]]),
            content_length: u16::from_be_bytes([raw[4], raw[5]]),
            padding_length: raw[6],
            reserved: raw[7],
        }
    }
}

/// Frames one record: header, payload, then zero padding up to the next
/// 8-byte boundary.
pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    request_id: u16,
    record_type: u8,
    content: &[u8],
) -> Result<(), FcgiError> {
    if content.len() > MAX_RECORD_PAYLOAD {
        return Err(FcgiError::PayloadTooLarge(content.len()));
    }
    let padding = content.len().wrapping_neg() & 7;
    let header = RecordHeader {
        version: FCGI_VERSION,
        record_type,
        request_id,
        content_length: content.len() as u16,
        padding_length: padding as u8,
        reserved: 0,
    };
    w.write_all(&header.encode())
        .await
        .map_err(FcgiError::TransportWrite)?;
    if !content.is_empty() {
        w.write_all(content)
            .await
            .map_err(FcgiError::TransportWrite)?;
    }
    if padding > 0 {
        const PAD: [u8; 8] = [0u8; 8];
        w.write_all(&PAD[..padding])
            .await
            .map_err(FcgiError::TransportWrite)?;
    }
    Ok(())
}

pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<RecordHeader, FcgiError> {
    let mut raw = [0u8; 8];
    r.read_exact(&mut raw)
        .await
        .map_err(FcgiError::TransportRead)?;
    Ok(RecordHeader::decode(&raw))
}

/// Reads content plus padding, returning the content bytes only.
pub async fn read_payload<R: AsyncRead + Unpin>(
    r: &mut R,
    content_length: u16,
    padding_length: u8,
) -> Result<Bytes, FcgiError> {
    let total = content_length as usize + padding_length as usize;
    let mut buf = vec![0u8; total];
    if total > 0 {
        r.read_exact(&mut buf)
            .await
            .map_err(FcgiError::TransportRead)?;
    }
    buf.truncate(content_length as usize);
    Ok(Bytes::from(buf))
}

/// Encodes one name/value pair in the 4-byte length form. FPM also accepts
/// the 1-byte form, but the long form keeps the encoder branch-free.
fn put_param_pair(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_u32(name.len() as u32 | 0x8000_0000);
    buf.put_u32(value.len() as u32 | 0x8000_0000);
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(value.as_bytes());
}

/// One FastCGI responder invocation: the parameter table, the buffered
/// request body and the id used to match response records.
#[derive(Debug, Clone)]
pub struct FcgiRequest {
    pub params: HashMap<String, String>,
    pub body: Bytes,
    request_id: u16,
}

impl FcgiRequest {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }
}

/// The decoded FPM response: status, header multimap and body.
#[derive(Debug, Clone)]
pub struct FcgiResponse {
    pub status: u16,
    /// Full value of the `Status` header, `200 OK` when absent.
    pub status_text: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One persistent connection to the FPM socket. The slot id is stable for
/// the lifetime of the pool; the stream is replaced on reconnect.
#[derive(Debug)]
pub struct FcgiConnection {
    stream: UnixStream,
    socket_path: PathBuf,
    id: usize,
}

impl FcgiConnection {
    async fn connect(socket_path: &Path, id: usize) -> std::io::Result<Self> {
        let stream = UnixStream::connect(socket_path).await?;
        Ok(Self {
            stream,
            socket_path: socket_path.to_path_buf(),
            id,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Replaces the socket with a freshly dialed one. The old socket closes
    /// on drop; close errors are ignored.
    pub async fn reconnect(&mut self) -> Result<(), FcgiError> {
        let stream =
            UnixStream::connect(&self.socket_path)
                .await
                .map_err(|source| FcgiError::Reconnect {
                    path: self.socket_path.clone(),
                    source,
                })?;
        self.stream = stream;
        Ok(())
    }

    /// Executes one full responder exchange on this connection.
    pub async fn do_request(&mut self, req: &FcgiRequest) -> Result<FcgiResponse, FcgiError> {
        self.send_begin_request(req).await?;
        self.send_params(req).await?;
        self.send_stdin(req).await?;
        self.stream.flush().await.map_err(FcgiError::TransportWrite)?;
        self.read_response(req).await
    }

    async fn send_begin_request(&mut self, req: &FcgiRequest) -> Result<(), FcgiError> {
        let mut body = [0u8; 8];
        body[0] = (FCGI_RESPONDER >> 8) as u8;
        body[1] = (FCGI_RESPONDER & 0xff) as u8;
        body[2] = FCGI_KEEP_CONN;
        write_record(&mut self.stream, req.request_id, FCGI_BEGIN_REQUEST, &body).await
    }

    async fn send_params(&mut self, req: &FcgiRequest) -> Result<(), FcgiError> {
        let mut buf = BytesMut::new();
        for (name, value) in &req.params {
            // The computed value below wins over a caller-supplied one.
            if !req.body.is_empty() && name == "CONTENT_LENGTH" {
                continue;
            }
            buf.clear();
            put_param_pair(&mut buf, name, value);
            write_record(&mut self.stream, req.request_id, FCGI_PARAMS, &buf).await?;
        }
        if !req.body.is_empty() {
            buf.clear();
            put_param_pair(&mut buf, "CONTENT_LENGTH", &req.body.len().to_string());
            write_record(&mut self.stream, req.request_id, FCGI_PARAMS, &buf).await?;
        }
        // end of parameters
        write_record(&mut self.stream, req.request_id, FCGI_PARAMS, &[]).await
    }

    async fn send_stdin(&mut self, req: &FcgiRequest) -> Result<(), FcgiError> {
        for chunk in req.body.chunks(MAX_RECORD_PAYLOAD) {
            write_record(&mut self.stream, req.request_id, FCGI_STDIN, chunk).await?;
        }
        write_record(&mut self.stream, req.request_id, FCGI_STDIN, &[]).await
    }

    async fn read_response(&mut self, req: &FcgiRequest) -> Result<FcgiResponse, FcgiError> {
        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();

        // Read records until END_REQUEST for our id. Records for other ids
        // are drained and skipped.
        loop {
            let header = read_header(&mut self.stream).await?;
            let payload =
                read_payload(&mut self.stream, header.content_length, header.padding_length)
                    .await?;
            if header.request_id != req.request_id {
                continue;
            }
            match header.record_type {
                FCGI_STDOUT => stdout.extend_from_slice(&payload),
                FCGI_STDERR => {
                    let remaining = MAX_STDERR_CAPTURE.saturating_sub(stderr.len());
                    let take = remaining.min(payload.len());
                    stderr.extend_from_slice(&payload[..take]);
                }
                FCGI_END_REQUEST => break,
                _ => {}
            }
        }

        if !stderr.is_empty() {
            warn!(slot = self.id, stderr = %String::from_utf8_lossy(&stderr), "FPM stderr");
        }

        parse_response(&stdout)
    }
}

/// Parses accumulated FPM stdout as a CGI response: a header block
/// terminated by a blank line, status taken from the `Status` header.
fn parse_response(stdout: &[u8]) -> Result<FcgiResponse, FcgiError> {
    let (end, sep_len) = find_header_boundary(stdout).ok_or_else(|| {
        FcgiError::MalformedResponse("missing header terminator".to_string())
    })?;
    let head = std::str::from_utf8(&stdout[..end])
        .map_err(|_| FcgiError::MalformedResponse("header block is not valid UTF-8".to_string()))?;

    let mut status: u16 = 200;
    let mut status_text = String::from("200 OK");
    let mut headers = HeaderMap::new();

    for line in head.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once(':').ok_or_else(|| {
            FcgiError::MalformedResponse(format!("invalid header line {line:?}"))
        })?;
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("status") {
            let token = value.split_whitespace().next().ok_or_else(|| {
                FcgiError::MalformedResponse("empty Status header".to_string())
            })?;
            status = token.parse::<u16>().map_err(|_| {
                FcgiError::MalformedResponse(format!("invalid Status header {value:?}"))
            })?;
            if !(100..=999).contains(&status) {
                return Err(FcgiError::MalformedResponse(format!(
                    "Status code out of range: {status}"
                )));
            }
            status_text = value.to_string();
            continue;
        }
        let name = HeaderName::from_bytes(key.as_bytes()).map_err(|_| {
            FcgiError::MalformedResponse(format!("invalid header name {key:?}"))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            FcgiError::MalformedResponse(format!("invalid value for header {key:?}"))
        })?;
        headers.append(name, value);
    }

    Ok(FcgiResponse {
        status,
        status_text,
        headers,
        body: Bytes::copy_from_slice(&stdout[end + sep_len..]),
    })
}

fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// A fixed-size pool of persistent FPM connections. The bounded channel is
/// the sole source of connections, so a connection is never held twice.
#[derive(Debug)]
pub struct FcgiClient {
    slots: mpsc::Sender<FcgiConnection>,
    idle: Mutex<mpsc::Receiver<FcgiConnection>>,
    pool_size: usize,
}

impl FcgiClient {
    /// Dials the whole pool up front; any dial failure fails pool creation.
    pub async fn connect(socket_path: &Path, pool_size: usize) -> anyhow::Result<Self> {
        use anyhow::Context;

        let (slots, idle) = mpsc::channel(pool_size);
        for id in 0..pool_size {
            let conn = FcgiConnection::connect(socket_path, id)
                .await
                .with_context(|| {
                    format!("could not connect to FPM socket {}", socket_path.display())
                })?;
            slots.try_send(conn).expect("pool channel sized to pool");
        }
        debug!(pool_size, socket = %socket_path.display(), "FPM pool initiated");
        Ok(Self {
            slots,
            idle: Mutex::new(idle),
            pool_size,
        })
    }

    /// Attaches a fresh random request id. One request is in flight per
    /// connection, so id collisions across connections are harmless.
    pub fn new_request(&self, params: HashMap<String, String>, body: Bytes) -> FcgiRequest {
        FcgiRequest {
            params,
            body,
            request_id: rand::thread_rng().gen(),
        }
    }

    async fn acquire(&self) -> Result<PooledConn<'_>, FcgiError> {
        let mut idle = self.idle.lock().await;
        loop {
            match timeout(ACQUIRE_REPORT_INTERVAL, idle.recv()).await {
                Ok(Some(conn)) => {
                    return Ok(PooledConn {
                        conn: Some(conn),
                        slots: &self.slots,
                    })
                }
                Ok(None) => return Err(FcgiError::PoolClosed),
                Err(_) => {
                    info!(
                        pool_size = self.pool_size,
                        "all FPM connections are busy, waiting for a free slot"
                    );
                }
            }
        }
    }

    /// Sends a request over a pooled connection. A transport failure
    /// triggers one reconnect-and-retry; FPM restarts look exactly like
    /// this. The connection returns to the pool on every path.
    pub async fn send(&self, req: FcgiRequest) -> Result<FcgiResponse, FcgiError> {
        let mut held = self.acquire().await?;
        match held.do_request(&req).await {
            Ok(response) => Ok(response),
            Err(err) => {
                debug!(slot = held.id(), error = %err, "FPM request failed, reconnecting");
                held.reconnect().await?;
                debug!(slot = held.id(), "successfully reconnected");
                held.do_request(&req).await
            }
        }
    }

    /// Drains every slot and drops the sockets. Waits for in-flight holders
    /// to release. Call once, at shutdown.
    pub async fn close(&self) {
        let mut idle = self.idle.lock().await;
        for _ in 0..self.pool_size {
            if idle.recv().await.is_none() {
                break;
            }
        }
    }
}

/// Holds a connection checked out of the pool; returns it on drop, so
/// every exit path of a request releases exactly once.
struct PooledConn<'a> {
    conn: Option<FcgiConnection>,
    slots: &'a mpsc::Sender<FcgiConnection>,
}

impl Deref for PooledConn<'_> {
    type Target = FcgiConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection held until drop")
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection held until drop")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // The channel capacity equals the connection population, so the
            // slot is always available.
            let _ = self.slots.try_send(conn);
        }
    }
}
