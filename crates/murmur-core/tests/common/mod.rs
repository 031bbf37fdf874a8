#![allow(dead_code)]

use std::{
    io::{ErrorKind, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::Arc,
    time::Duration,
};

use murmur_core::{
    ChatServer, ServerConfig,
    auth::{CredentialService, Verdict},
};
use murmur_proto::{self as proto, HEADER_LEN, HeaderStatus, MsgKind};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Canned credential service for the scenarios.
pub struct StaticAuth {
    pub accept: bool,
}

impl CredentialService for StaticAuth {
    fn login(&self, _name: &str, _credential: &[u8]) -> Verdict {
        if self.accept { Verdict::accept("ok") } else { Verdict::reject("bad credentials") }
    }

    fn register(&self, _name: &str, _credential: &[u8]) -> Verdict {
        if self.accept { Verdict::accept("ok") } else { Verdict::reject("name taken") }
    }
}

pub fn start_server() -> (ChatServer, SocketAddr) {
    start_server_with(StaticAuth { accept: true }, proto::DEFAULT_MAX_BODY_LEN)
}

pub fn start_server_with(
    auth: impl CredentialService + 'static,
    max_body_len: usize,
) -> (ChatServer, SocketAddr) {
    start_server_cfg(auth, ServerConfig {
        addr: "127.0.0.1:0".parse().unwrap(),
        workers: 4,
        max_body_len,
        max_queue_bytes: None,
    })
}

pub fn start_server_cfg(
    auth: impl CredentialService + 'static,
    cfg: ServerConfig,
) -> (ChatServer, SocketAddr) {
    let mut server = ChatServer::bind(cfg, Arc::new(auth)).expect("bind failed");
    server.start().expect("start failed");
    let addr = server.local_addr();
    (server, addr)
}

/// A complete inbound frame as a test client sees it.
#[derive(Debug)]
pub struct Frame {
    pub kind: MsgKind,
    pub sender: String,
    pub body: Vec<u8>,
}

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("connect failed");
        stream.set_nodelay(true).unwrap();
        stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
        Self { stream }
    }

    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("send failed");
    }

    pub fn send_control(&mut self, kind: MsgKind, sender: &str) {
        self.send_raw(&proto::control(kind, sender));
    }

    pub fn send_frame(&mut self, kind: MsgKind, sender: &str, body: &[u8]) {
        let frame =
            proto::encode(kind, sender, body, proto::DEFAULT_MAX_BODY_LEN).expect("encode failed");
        self.send_raw(&frame);
    }

    /// JOIN and confirm the server processed it: a PING round-trip after the
    /// JOIN proves every earlier frame on this connection was handled.
    /// Returns the INITIAL roster frame when one was due.
    pub fn join(&mut self, name: &str) -> Option<Frame> {
        self.send_control(MsgKind::Join, name);
        self.send_control(MsgKind::Ping, "");
        let first = self.recv_frame();
        if first.kind == MsgKind::PingOk {
            return None;
        }
        assert_eq!(first.kind, MsgKind::Initial, "expected INITIAL, got {first:?}");
        let second = self.recv_frame();
        assert_eq!(second.kind, MsgKind::PingOk, "expected PING_OK, got {second:?}");
        Some(first)
    }

    pub fn ping(&mut self) {
        self.send_control(MsgKind::Ping, "");
        let reply = self.recv_frame();
        assert_eq!(reply.kind, MsgKind::PingOk, "expected PING_OK, got {reply:?}");
    }

    pub fn recv_frame(&mut self) -> Frame {
        let mut header_buf = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header_buf).expect("reading frame header");
        let header = match proto::try_parse_header(&header_buf, proto::DEFAULT_MAX_BODY_LEN) {
            HeaderStatus::Parsed(header) => header,
            other => panic!("bad header from server: {other:?}"),
        };
        let mut body = vec![0u8; header.body_len];
        self.stream.read_exact(&mut body).expect("reading frame body");
        Frame { kind: header.kind.expect("server sent unknown kind"), sender: header.sender, body }
    }

    /// Asserts nothing arrives for `dur`.
    pub fn expect_silence(&mut self, dur: Duration) {
        self.stream.set_read_timeout(Some(dur)).unwrap();
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => panic!("peer closed while expecting silence"),
            Ok(_) => panic!("unexpected traffic while expecting silence"),
            Err(err) => {
                assert!(
                    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut),
                    "unexpected error while expecting silence: {err}"
                );
            }
        }
        self.stream.set_read_timeout(Some(RECV_TIMEOUT)).unwrap();
    }

    /// Asserts the server closed this connection.
    pub fn expect_eof(&mut self) {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => {}
            Ok(_) => panic!("expected EOF, got data"),
            // A reset also counts: the socket was torn down server-side.
            Err(err) if err.kind() == ErrorKind::ConnectionReset => {}
            Err(err) => panic!("expected EOF, got error: {err}"),
        }
    }
}
