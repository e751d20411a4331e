//! Server tests
//!
//! Run the full server over loopback TCP with the reference HTTP/2 engine
//! and check each resolution path end to end.

mod common;

use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_openssl::SslStream;

use common::{write_self_signed, ProtocolApp};
use mux_gate::config::{ConfigBuilder, ConfigValues};
use mux_gate::server::{DefaultHandler, Server, ServerHandle};
use mux_gate::session::H2Engine;
use mux_gate::web::HttpHandler;
use mux_gate::SwitchError;

const WAIT: Duration = Duration::from_secs(10);

fn plain_values() -> ConfigValues {
    ConfigValues {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        ssl: Some(false),
        plain: Some(true),
        ..ConfigValues::default()
    }
}

fn handlers() -> Vec<Arc<dyn DefaultHandler>> {
    vec![Arc::new(HttpHandler::new(ProtocolApp, 16 * 1024))]
}

async fn start(values: ConfigValues) -> ServerHandle {
    let config = ConfigBuilder::new().with_defaults().with_cli(values).build().unwrap();
    let server = Server::new(Arc::new(config), H2Engine::new(), handlers()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    server.start_with_listener(listener).unwrap()
}

/// Send one request over an HTTP/2 connection and collect the body
async fn h2_request<T>(io: T, method: &str, path: &str, body: Option<&'static [u8]>) -> String
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut client, connection) = h2::client::handshake(io).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method(method)
        .uri(format!("https://localhost{}", path))
        .body(())
        .unwrap();

    let (response, mut send) = client.send_request(request, body.is_none()).unwrap();
    if let Some(body) = body {
        send.send_data(Bytes::from_static(body), true).unwrap();
    }

    let response = response.await.unwrap();
    assert_eq!(response.status(), http::StatusCode::OK);

    let mut body = response.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.unwrap();
        let _ = body.flow_control().release_capacity(chunk.len());
        collected.extend_from_slice(&chunk);
    }
    String::from_utf8(collected).unwrap()
}

async fn tls_connect(addr: SocketAddr, alpn: &[u8]) -> SslStream<TcpStream> {
    let mut connector = SslConnector::builder(SslMethod::tls()).unwrap();
    connector.set_verify(SslVerifyMode::NONE);
    connector.set_alpn_protos(alpn).unwrap();
    let ssl = connector.build().configure().unwrap().into_ssl("localhost").unwrap();

    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut stream = SslStream::new(ssl, tcp).unwrap();
    Pin::new(&mut stream).connect().await.unwrap();
    stream
}

/// Test that plain HTTP/1.1 is sniffed and passes through
#[tokio::test]
async fn test_plaintext_http1_passes_through() {
    let handle = start(plain_values()).await;

    let url = format!("http://{}/hello", handle.local_addr());
    let body = timeout(WAIT, async { reqwest::get(&url).await.unwrap().text().await.unwrap() })
        .await
        .unwrap();
    assert_eq!(body, "multiplexed=false version=1 path=/hello body=0");

    handle.shutdown().await.unwrap();
}

/// Test that an HTTP/2 preface is sniffed and served over a session
#[tokio::test]
async fn test_plaintext_h2_is_multiplexed() {
    let handle = start(plain_values()).await;

    let tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    let body = timeout(WAIT, h2_request(tcp, "POST", "/upload", Some(b"hello")))
        .await
        .unwrap();
    assert_eq!(body, "multiplexed=true version=4 path=/upload body=5");

    handle.shutdown().await.unwrap();
}

/// Test that a SPDY control frame is refused by the HTTP/2-only engine
#[tokio::test]
async fn test_plaintext_spdy_closes_connection() {
    let handle = start(plain_values()).await;

    let mut tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    tcp.write_all(&[0x80, 0x03, 0x00, 0x01, 0x01, 0x00, 0x00, 0x0a]).await.unwrap();

    let mut rest = Vec::new();
    let read = timeout(WAIT, tcp.read_to_end(&mut rest)).await.unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));

    handle.shutdown().await.unwrap();
}

/// Test that the TLS-negotiated protocol decides, over both paths
#[tokio::test]
async fn test_tls_alpn_resolution() {
    let dir = tempfile::tempdir().unwrap();
    let (cert, key) = write_self_signed(dir.path());

    let values = ConfigValues {
        listen: Some("127.0.0.1:0".parse().unwrap()),
        ssl: Some(true),
        cert: Some(cert),
        key: Some(key),
        ..ConfigValues::default()
    };
    let handle = start(values).await;

    let stream = tls_connect(handle.local_addr(), b"\x02h2").await;
    assert_eq!(stream.ssl().selected_alpn_protocol(), Some(&b"h2"[..]));
    let body = timeout(WAIT, h2_request(stream, "GET", "/secure", None)).await.unwrap();
    assert_eq!(body, "multiplexed=true version=4 path=/secure body=0");

    let mut stream = tls_connect(handle.local_addr(), b"\x08http/1.1").await;
    assert_eq!(stream.ssl().selected_alpn_protocol(), Some(&b"http/1.1"[..]));
    stream
        .write_all(b"GET /plain HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = timeout(WAIT, stream.read_to_end(&mut response)).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("multiplexed=false version=1 path=/plain body=0"));

    handle.shutdown().await.unwrap();
}

/// Test that a default protocol applies when nothing is negotiated
#[tokio::test]
async fn test_default_protocol_without_sniffing() {
    let values = ConfigValues {
        default_protocol: Some("h2".to_string()),
        plain: Some(false),
        ..plain_values()
    };
    let handle = start(values).await;

    let tcp = TcpStream::connect(handle.local_addr()).await.unwrap();
    let body = timeout(WAIT, h2_request(tcp, "GET", "/forced", None)).await.unwrap();
    assert_eq!(body, "multiplexed=true version=4 path=/forced body=0");

    handle.shutdown().await.unwrap();
}

/// Test that a server needs at least one default handler
#[test]
fn test_server_requires_handler() {
    let config = ConfigBuilder::new().with_defaults().with_cli(plain_values()).build().unwrap();
    let result = Server::new(Arc::new(config), H2Engine::new(), Vec::new());
    assert!(matches!(result, Err(SwitchError::Config(_))));
}

/// Test that TLS mode without certificate material is fatal
#[test]
fn test_tls_without_certificate_is_fatal() {
    let values = ConfigValues {
        ssl: Some(true),
        cert: Some(Path::new("/nonexistent/server.crt").to_path_buf()),
        key: Some(Path::new("/nonexistent/server.key").to_path_buf()),
        ..ConfigValues::default()
    };
    let config = ConfigBuilder::new()
        .with_defaults()
        .with_cli(values)
        .without_validation()
        .build()
        .unwrap();

    assert!(Server::new(Arc::new(config), H2Engine::new(), handlers()).is_err());
}

/// Test that shutdown stops accepting connections
#[tokio::test]
async fn test_shutdown_stops_listener() {
    let handle = start(plain_values()).await;
    let addr = handle.local_addr();

    timeout(WAIT, handle.shutdown()).await.unwrap().unwrap();
    assert!(TcpStream::connect(addr).await.is_err());

    // A second shutdown is a no-op
    handle.shutdown().await.unwrap();
}
