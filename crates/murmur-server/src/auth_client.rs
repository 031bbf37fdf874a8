//! `CredentialService` implementations for the binary: a remote JSON-over-TCP
//! client and the open fallback used when no credential service is
//! configured.

use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpStream},
    time::Duration,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use murmur_core::auth::{CredentialService, Verdict};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct AuthRequest<'a> {
    op: &'a str,
    name: &'a str,
    /// Base64 of the opaque credential blob the client sent.
    blob: String,
}

#[derive(Deserialize)]
struct AuthResponse {
    ok: bool,
    #[serde(default)]
    message: String,
}

/// One newline-terminated JSON request per call over a fresh connection,
/// with hard timeouts on every socket operation. Any transport or decode
/// failure comes back as a rejected verdict; the chat session stays open
/// and the client may retry.
pub struct RemoteAuth {
    addr: SocketAddr,
    timeout: Duration,
}

impl RemoteAuth {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, timeout: Duration::from_secs(3) }
    }

    fn call(&self, op: &str, name: &str, credential: &[u8]) -> Verdict {
        match self.round_trip(op, name, credential) {
            Ok(verdict) => verdict,
            Err(err) => {
                debug!(?err, op, "auth: request failed");
                Verdict::reject(format!("credential service unavailable: {err}"))
            }
        }
    }

    fn round_trip(
        &self,
        op: &str,
        name: &str,
        credential: &[u8],
    ) -> std::io::Result<Verdict> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let request =
            AuthRequest { op, name, blob: STANDARD.encode(credential) };
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        (&stream).write_all(&line)?;

        let mut reply = String::new();
        BufReader::new(&stream).read_line(&mut reply)?;
        let response: AuthResponse = serde_json::from_str(reply.trim_end())?;
        Ok(Verdict { ok: response.ok, message: response.message })
    }
}

impl CredentialService for RemoteAuth {
    fn login(&self, name: &str, credential: &[u8]) -> Verdict {
        self.call("login", name, credential)
    }

    fn register(&self, name: &str, credential: &[u8]) -> Verdict {
        self.call("register", name, credential)
    }
}

/// Accepts everything. Used when `--auth` is absent; the room is then gated
/// only by JOIN name uniqueness.
pub struct OpenAuth;

impl CredentialService for OpenAuth {
    fn login(&self, _name: &str, _credential: &[u8]) -> Verdict {
        Verdict::accept("authentication disabled")
    }

    fn register(&self, _name: &str, _credential: &[u8]) -> Verdict {
        Verdict::accept("authentication disabled")
    }
}
