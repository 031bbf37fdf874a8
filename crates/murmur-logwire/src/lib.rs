//! Ships log records to an external logger daemon: one Unix-domain datagram
//! per `tracing` event, carrying level, monotonic timestamp, source location
//! and the formatted fields.
//!
//! The layer is connectionless and fire-and-forget. The daemon being absent,
//! slow or restarting never affects the process emitting the records; send
//! errors are swallowed.

use std::{
    fmt::Write as _,
    io,
    os::unix::net::UnixDatagram,
    path::{Path, PathBuf},
    time::Instant,
};

use tracing::{Event, Subscriber, field::{Field, Visit}};
use tracing_subscriber::{layer::Context, registry::LookupSpan};

/// A `tracing_subscriber` layer emitting one datagram per event.
///
/// Record layout, single line of UTF-8:
/// `<LEVEL> <micros>us <target> <file>:<line> <message> [k=v ...]`
pub struct DatagramLayer {
    sock: UnixDatagram,
    path: PathBuf,
    epoch: Instant,
}

impl DatagramLayer {
    /// Binds an unnamed datagram socket aimed at `path`. The daemon socket
    /// does not need to exist yet.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self { sock: UnixDatagram::unbound()?, path: path.into(), epoch: Instant::now() })
    }

    pub fn daemon_path(&self) -> &Path {
        &self.path
    }
}

impl<S> tracing_subscriber::Layer<S> for DatagramLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        let mut line = String::with_capacity(128);
        let _ = write!(
            line,
            "{} {}us {} {}:{} ",
            meta.level(),
            self.epoch.elapsed().as_micros(),
            meta.target(),
            meta.file().unwrap_or("<unknown>"),
            meta.line().unwrap_or(0),
        );
        event.record(&mut LineVisitor { line: &mut line, seen_message: false });

        // Fire and forget: a missing or wedged daemon is not our problem.
        let _ = self.sock.send_to(line.as_bytes(), &self.path);
    }
}

/// Appends the `message` field verbatim and everything else as `k=v`.
struct LineVisitor<'a> {
    line: &'a mut String,
    seen_message: bool,
}

impl Visit for LineVisitor<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.push_message(value);
        } else {
            let _ = write!(self.line, " {}={value}", field.name());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.push_message(&format!("{value:?}"));
        } else {
            let _ = write!(self.line, " {}={value:?}", field.name());
        }
    }
}

impl LineVisitor<'_> {
    fn push_message(&mut self, msg: &str) {
        if !self.seen_message {
            self.line.push_str(msg);
            self.seen_message = true;
        }
    }
}
