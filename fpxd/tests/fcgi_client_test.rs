//! FastCGI client tests against a mock FPM peer on a Unix socket,
//! decoding the wire traffic at the byte level.

#![cfg(unix)]

use fpxd::fcgi_client::{FcgiClient, FcgiError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

const FCGI_BEGIN_REQUEST: u8 = 1;
const FCGI_END_REQUEST: u8 = 3;
const FCGI_PARAMS: u8 = 4;
const FCGI_STDIN: u8 = 5;
const FCGI_STDOUT: u8 = 6;

fn temp_socket_path(tag: &str) -> PathBuf {
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!("fpxd-fcgi-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("mkdir");
    dir.join(format!("{tag}-{}.sock", SEQ.fetch_add(1, Ordering::SeqCst)))
}

fn encode_record(record_type: u8, request_id: u16, content: &[u8]) -> Vec<u8> {
    let padding = (8 - (content.len() % 8)) % 8;
    let mut buf = Vec::with_capacity(8 + content.len() + padding);
    buf.push(1);
    buf.push(record_type);
    buf.push((request_id >> 8) as u8);
    buf.push((request_id & 0xff) as u8);
    buf.push((content.len() >> 8) as u8);
    buf.push((content.len() & 0xff) as u8);
    buf.push(padding as u8);
    buf.push(0);
    buf.extend_from_slice(content);
    buf.extend(std::iter::repeat(0u8).take(padding));
    buf
}

async fn read_record(stream: &mut UnixStream) -> Option<(u8, u16, Vec<u8>)> {
    let mut hdr = [0u8; 8];
    stream.read_exact(&mut hdr).await.ok()?;
    assert_eq!(hdr[0], 1, "unexpected protocol version");
    let rtype = hdr[1];
    let request_id = u16::from_be_bytes([hdr[2], hdr[3]]);
    let content_len = u16::from_be_bytes([hdr[4], hdr[5]]) as usize;
    let padding_len = hdr[6] as usize;
    assert_eq!(
        (content_len + padding_len) % 8,
        0,
        "record not padded to an 8-byte boundary"
    );
    let mut body = vec![0u8; content_len + padding_len];
    stream.read_exact(&mut body).await.ok()?;
    body.truncate(content_len);
    Some((rtype, request_id, body))
}

fn read_nv_len(data: &mut &[u8]) -> usize {
    let first = data[0];
    if first < 128 {
        *data = &data[1..];
        first as usize
    } else {
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x7fff_ffff;
        *data = &data[4..];
        len as usize
    }
}

fn decode_nv_pairs(mut data: &[u8]) -> Vec<(String, String)> {
    let mut result = Vec::new();
    while !data.is_empty() {
        let name_len = read_nv_len(&mut data);
        let value_len = read_nv_len(&mut data);
        let name = std::str::from_utf8(&data[..name_len]).unwrap().to_string();
        let value = std::str::from_utf8(&data[name_len..name_len + value_len])
            .unwrap()
            .to_string();
        data = &data[name_len + value_len..];
        result.push((name, value));
    }
    result
}

struct MockRequest {
    id: u16,
    params: HashMap<String, String>,
    /// Non-empty PARAMS record payloads, in arrival order.
    params_records: Vec<Vec<u8>>,
    stdin: Vec<u8>,
    /// Content lengths of every STDIN record, including the terminator.
    stdin_record_lens: Vec<usize>,
}

async fn read_fcgi_request(stream: &mut UnixStream) -> Option<MockRequest> {
    let (rtype, id, content) = read_record(stream).await?;
    assert_eq!(rtype, FCGI_BEGIN_REQUEST);
    assert_eq!(content.len(), 8);
    assert_eq!(u16::from_be_bytes([content[0], content[1]]), 1, "role");
    assert_eq!(content[2] & 1, 1, "keep-alive flag");

    let mut params_records = Vec::new();
    let mut params_bytes = Vec::new();
    loop {
        let (rtype, rid, content) = read_record(stream).await?;
        assert_eq!(rtype, FCGI_PARAMS);
        assert_eq!(rid, id);
        if content.is_empty() {
            break;
        }
        params_bytes.extend_from_slice(&content);
        params_records.push(content);
    }

    let mut stdin = Vec::new();
    let mut stdin_record_lens = Vec::new();
    loop {
        let (rtype, rid, content) = read_record(stream).await?;
        assert_eq!(rtype, FCGI_STDIN);
        assert_eq!(rid, id);
        stdin_record_lens.push(content.len());
        if content.is_empty() {
            break;
        }
        stdin.extend_from_slice(&content);
    }

    let params = decode_nv_pairs(&params_bytes).into_iter().collect();
    Some(MockRequest {
        id,
        params,
        params_records,
        stdin,
        stdin_record_lens,
    })
}

async fn write_cgi_response(stream: &mut UnixStream, request_id: u16, stdout: &[u8]) {
    for chunk in stdout.chunks(65535) {
        stream
            .write_all(&encode_record(FCGI_STDOUT, request_id, chunk))
            .await
            .unwrap();
    }
    stream
        .write_all(&encode_record(FCGI_STDOUT, request_id, &[]))
        .await
        .unwrap();
    stream
        .write_all(&encode_record(FCGI_END_REQUEST, request_id, &[0u8; 8]))
        .await
        .unwrap();
    stream.flush().await.unwrap();
}

fn request_params() -> HashMap<String, String> {
    HashMap::from([
        ("REQUEST_METHOD".to_string(), "POST".to_string()),
        ("SCRIPT_FILENAME".to_string(), "/srv/index.php".to_string()),
    ])
}

#[tokio::test]
async fn responder_exchange_round_trips() {
    let path = temp_socket_path("roundtrip");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_fcgi_request(&mut stream).await.unwrap();

        assert_eq!(request.params["REQUEST_METHOD"], "POST");
        assert_eq!(request.params["SCRIPT_FILENAME"], "/srv/index.php");
        assert_eq!(request.params["CONTENT_LENGTH"], "4");
        assert_eq!(&request.stdin, b"body");
        // One pair per PARAMS record, each in the 4-byte length form.
        for record in &request.params_records {
            let pairs = decode_nv_pairs(record);
            assert_eq!(pairs.len(), 1);
            assert!(record[0] & 0x80 != 0, "4-byte length form expected");
            let (name, value) = &pairs[0];
            assert_eq!(record.len(), 4 + 4 + name.len() + value.len());
        }

        write_cgi_response(
            &mut stream,
            request.id,
            b"Content-Type: text/plain\r\nStatus: 200 OK\r\n\r\nhello",
        )
        .await;
    });

    let client = FcgiClient::connect(&path, 1).await.unwrap();
    let request = client.new_request(request_params(), bytes::Bytes::from_static(b"body"));
    let response = client.send(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.headers.get("content-type").unwrap(), "text/plain");
    assert_eq!(&response.body[..], b"hello");
    server.await.unwrap();
}

#[tokio::test]
async fn stdin_chunking_at_record_boundaries() {
    for (body_len, expected_lens) in [
        (65535usize, vec![65535usize, 0]),
        (65536, vec![65535, 1, 0]),
    ] {
        let path = temp_socket_path("chunking");
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_fcgi_request(&mut stream).await.unwrap();
            assert_eq!(request.stdin_record_lens, expected_lens);
            assert_eq!(request.stdin.len(), body_len);
            assert_eq!(request.params["CONTENT_LENGTH"], body_len.to_string());
            write_cgi_response(&mut stream, request.id, b"Status: 200 OK\r\n\r\n").await;
        });

        let client = FcgiClient::connect(&path, 1).await.unwrap();
        let body = bytes::Bytes::from(vec![0x61u8; body_len]);
        let request = client.new_request(request_params(), body);
        client.send(request).await.unwrap();
        server.await.unwrap();
    }
}

#[tokio::test]
async fn empty_body_sends_lone_stdin_terminator() {
    let path = temp_socket_path("empty-body");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_fcgi_request(&mut stream).await.unwrap();
        assert_eq!(request.stdin_record_lens, vec![0]);
        assert!(!request.params.contains_key("CONTENT_LENGTH"));
        write_cgi_response(&mut stream, request.id, b"Status: 204 No Content\r\n\r\n").await;
    });

    let client = FcgiClient::connect(&path, 1).await.unwrap();
    let request = client.new_request(request_params(), bytes::Bytes::new());
    let response = client.send(request).await.unwrap();
    assert_eq!(response.status, 204);
    server.await.unwrap();
}

#[tokio::test]
async fn records_for_foreign_request_ids_are_skipped() {
    let path = temp_socket_path("foreign-id");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_fcgi_request(&mut stream).await.unwrap();
        let foreign = request.id.wrapping_add(1);

        // Noise for another request id first, END_REQUEST included.
        stream
            .write_all(&encode_record(FCGI_STDOUT, foreign, b"Status: 500\r\n\r\nnoise"))
            .await
            .unwrap();
        stream
            .write_all(&encode_record(FCGI_END_REQUEST, foreign, &[0u8; 8]))
            .await
            .unwrap();
        write_cgi_response(&mut stream, request.id, b"Status: 200 OK\r\n\r\nwanted").await;
    });

    let client = FcgiClient::connect(&path, 1).await.unwrap();
    let request = client.new_request(request_params(), bytes::Bytes::new());
    let response = client.send(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"wanted");
    server.await.unwrap();
}

#[tokio::test]
async fn transport_failure_triggers_one_reconnect() {
    let path = temp_socket_path("reconnect");
    let listener = UnixListener::bind(&path).unwrap();

    let server = tokio::spawn(async move {
        // Pool dial.
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        // Reconnect dial, then a full exchange.
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_fcgi_request(&mut stream).await.unwrap();
        write_cgi_response(&mut stream, request.id, b"Status: 200 OK\r\n\r\nrecovered").await;
    });

    let client = FcgiClient::connect(&path, 1).await.unwrap();
    let request = client.new_request(request_params(), bytes::Bytes::new());
    let response = client.send(request).await.unwrap();
    assert_eq!(&response.body[..], b"recovered");
    server.await.unwrap();
}

#[tokio::test]
async fn reconnect_failure_is_surfaced() {
    let path = temp_socket_path("reconnect-fail");
    let listener = UnixListener::bind(&path).unwrap();

    let client = FcgiClient::connect(&path, 1).await.unwrap();
    // Drop the listener and remove the path: the retry has nowhere to dial.
    drop(listener);
    std::fs::remove_file(&path).unwrap();

    let request = client.new_request(request_params(), bytes::Bytes::new());
    let err = client.send(request).await.unwrap_err();
    assert!(matches!(err, FcgiError::Reconnect { .. }), "got {err:?}");
}

#[tokio::test]
async fn saturated_pool_blocks_until_release() {
    let path = temp_socket_path("saturation");
    let listener = UnixListener::bind(&path).unwrap();
    let release = Arc::new(tokio::sync::Semaphore::new(0));
    let gate = release.clone();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        while let Some(request) = read_fcgi_request(&mut stream).await {
            gate.acquire().await.unwrap().forget();
            write_cgi_response(&mut stream, request.id, b"Status: 200 OK\r\n\r\n").await;
        }
    });

    let client = Arc::new(FcgiClient::connect(&path, 1).await.unwrap());

    let first_client = client.clone();
    let first = tokio::spawn(async move {
        let request = first_client.new_request(request_params(), bytes::Bytes::new());
        first_client.send(request).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second_client = client.clone();
    let mut second = tokio::spawn(async move {
        let request = second_client.new_request(request_params(), bytes::Bytes::new());
        second_client.send(request).await
    });

    // The lone connection is held by the first request.
    assert!(
        tokio::time::timeout(Duration::from_millis(200), &mut second)
            .await
            .is_err(),
        "second request completed while the pool was saturated"
    );

    release.add_permits(2);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    // Closing the pool ends the mock's read loop.
    drop(client);
    server.await.unwrap();
}
