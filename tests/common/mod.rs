//! Shared test helpers
//!
//! A line-driven mock session engine, a recording default handler, a small
//! application and self-signed TLS material.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::FutureExt;
use http::{HeaderMap, Method, Request, StatusCode};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509Builder, X509NameBuilder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;

use mux_gate::protocol::ProtocolVersion;
use mux_gate::server::{BoxedIo, DefaultHandler, Socket, SocketInfo};
use mux_gate::session::{
    LogicalStream, PushedStream, RequestHead, Session, SessionEngine, SessionEvent, SessionOptions,
};
use mux_gate::web::{Application, RequestExt, ServerResponse};
use mux_gate::{Result, SwitchError};

/// What the mock engine observed
#[derive(Default)]
pub struct ProbeState {
    pub created: Vec<SessionOptions>,
    pub pinned: Vec<ProtocolVersion>,
    pub responses: Vec<(u32, StatusCode, bool)>,
    pub written: HashMap<u32, Vec<u8>>,
    pub ended: Vec<u32>,
    pub resets: Vec<u32>,
    senders: HashMap<u32, mpsc::UnboundedSender<Bytes>>,
}

/// Shared view of the mock engine's observations
#[derive(Clone, Default)]
pub struct Probe {
    inner: Arc<Mutex<ProbeState>>,
}

impl Probe {
    pub fn state(&self) -> std::sync::MutexGuard<'_, ProbeState> {
        self.inner.lock().unwrap()
    }
}

/// Session engine driven by text commands on the raw socket
///
/// * `OPEN <id> <method> <path> [eos]` announces a stream
/// * `DATA <id> <text>` delivers body bytes to a stream
/// * `FIN <id>` ends a stream's request body
/// * `ERROR <reason>` raises a session error
pub struct MockEngine {
    pub probe: Probe,
    pub fail: bool,
}

impl MockEngine {
    pub fn new(probe: Probe) -> Self {
        Self { probe, fail: false }
    }

    pub fn failing(probe: Probe) -> Self {
        Self { probe, fail: true }
    }
}

impl SessionEngine for MockEngine {
    type Session = MockSession;

    fn create_session(&self, io: BoxedIo, options: SessionOptions) -> Result<MockSession> {
        if self.fail {
            return Err(SwitchError::Session("engine refused the session".to_string()));
        }
        self.probe.state().created.push(options);

        Ok(MockSession {
            io,
            buf: BytesMut::new(),
            version: None,
            probe: self.probe.clone(),
        })
    }
}

pub struct MockSession {
    io: BoxedIo,
    buf: BytesMut,
    version: Option<ProtocolVersion>,
    probe: Probe,
}

impl MockSession {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|b| *b == b'\n')?;
        let line = self.buf.split_to(pos);
        self.buf.advance(1);
        Some(String::from_utf8_lossy(&line).trim().to_string())
    }

    fn command(&mut self, line: &str) -> Option<SessionEvent<MockStream>> {
        if let Some(reason) = line.strip_prefix("ERROR ") {
            return Some(SessionEvent::Error(SwitchError::Session(reason.to_string())));
        }

        let mut parts = line.splitn(3, ' ');
        let verb = parts.next().unwrap_or_default();
        let id: u32 = parts.next().and_then(|id| id.parse().ok()).unwrap_or(0);
        let rest = parts.next().unwrap_or_default();

        match verb {
            "OPEN" => {
                let mut args = rest.split(' ');
                let method: Method = args.next().unwrap_or("GET").parse().unwrap();
                let path = args.next().unwrap_or("/");
                let eos = args.next() == Some("eos");

                let (tx, rx) = mpsc::unbounded_channel();
                if !eos {
                    self.probe.state().senders.insert(id, tx);
                }

                Some(SessionEvent::Stream(MockStream {
                    id,
                    head: RequestHead {
                        method,
                        uri: path.parse().unwrap(),
                        headers: HeaderMap::new(),
                    },
                    eos,
                    body: rx,
                    pending: Bytes::new(),
                    probe: self.probe.clone(),
                }))
            }
            "DATA" => {
                if let Some(tx) = self.probe.state().senders.get(&id) {
                    let _ = tx.send(Bytes::from(rest.to_string()));
                }
                None
            }
            "FIN" => {
                self.probe.state().senders.remove(&id);
                None
            }
            _ => None,
        }
    }
}

impl Session for MockSession {
    type Stream = MockStream;

    fn pin_version(&mut self, version: ProtocolVersion) {
        self.version = Some(version);
        self.probe.state().pinned.push(version);
    }

    fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    async fn next_event(&mut self) -> Option<SessionEvent<MockStream>> {
        loop {
            while let Some(line) = self.take_line() {
                if let Some(event) = self.command(&line) {
                    return Some(event);
                }
            }

            match self.io.read_buf(&mut self.buf).await {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(SessionEvent::Error(e.into())),
            }
        }
    }
}

pub struct MockStream {
    id: u32,
    head: RequestHead,
    eos: bool,
    body: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
    probe: Probe,
}

impl AsyncRead for MockStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let len = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending[..len]);
                self.pending.advance(len);
                return Poll::Ready(Ok(()));
            }

            match self.body.poll_recv(cx) {
                Poll::Ready(Some(data)) => self.pending = data,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.probe.state().written.entry(self.id).or_default().extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.probe.state().ended.push(self.id);
        Poll::Ready(Ok(()))
    }
}

impl LogicalStream for MockStream {
    fn id(&self) -> u32 {
        self.id
    }

    fn head(&self) -> &RequestHead {
        &self.head
    }

    fn is_end_stream(&self) -> bool {
        self.eos
    }

    fn respond(&mut self, status: StatusCode, _headers: &HeaderMap, end_of_stream: bool) -> Result<()> {
        let mut state = self.probe.state();
        state.responses.push((self.id, status, end_of_stream));
        if end_of_stream {
            state.ended.push(self.id);
        }
        Ok(())
    }

    fn push(&mut self, _request: Request<()>) -> Result<Box<dyn PushedStream>> {
        Err(SwitchError::Session("push is disabled".to_string()))
    }

    fn reset(&mut self) {
        self.probe.state().resets.push(self.id);
    }
}

/// What a [`Recorder`] saw on one socket
#[derive(Debug)]
pub struct Outcome {
    pub info: SocketInfo,
    pub received: Vec<u8>,
    pub write: io::Result<()>,
}

/// Default handler reading each socket to its end, then answering `ok`
pub struct Recorder {
    tx: mpsc::UnboundedSender<Outcome>,
}

impl Recorder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl DefaultHandler for Recorder {
    fn handle(&self, socket: Socket) -> BoxFuture<'static, ()> {
        let tx = self.tx.clone();
        async move {
            let (mut io, info) = socket.into_parts();
            let mut received = Vec::new();
            let _ = io.read_to_end(&mut received).await;

            let write = async {
                io.write_all(b"ok").await?;
                io.shutdown().await
            }
            .await;

            let _ = tx.send(Outcome { info, received, write });
        }
        .boxed()
    }
}

/// Application answering with the transport facts of each request
pub struct ProtocolApp;

impl Application for ProtocolApp {
    async fn call(&self, request: Request<Bytes>, response: &mut ServerResponse<'_>) -> Result<()> {
        let protocol = request.protocol();
        let body = format!(
            "multiplexed={} version={} path={} body={}",
            protocol.multiplexed,
            protocol.version,
            request.uri().path(),
            request.body().len()
        );
        response.end(body.as_bytes()).await
    }
}

/// Write a self-signed certificate for `localhost` and its key into `dir`
pub fn write_self_signed(dir: &Path) -> (PathBuf, PathBuf) {
    let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(7).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    let cert_path = dir.join("server.crt");
    let key_path = dir.join("server.key");
    fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();
    fs::write(&key_path, pkey.private_key_to_pem_pkcs8().unwrap()).unwrap();

    (cert_path, key_path)
}
