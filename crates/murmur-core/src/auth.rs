//! The core's only synchronous boundary: credential checks for LOGIN and
//! REGISTER frames. The credential blob is opaque bytes end to end; the
//! transport behind an implementation (and its timeout) is its own concern.

/// Outcome of a credential check. The message is diagnostic only and goes
/// to the log, never onto the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub ok: bool,
    pub message: String,
}

impl Verdict {
    pub fn accept(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

/// Remote credential service, called from worker threads. Implementations
/// must be internally bounded in time; a transport failure is reported as a
/// rejected verdict, never by panicking or hanging.
pub trait CredentialService: Send + Sync {
    fn login(&self, name: &str, credential: &[u8]) -> Verdict;
    fn register(&self, name: &str, credential: &[u8]) -> Verdict;
}
