use std::{
    collections::VecDeque,
    io::{self, Read},
    net::SocketAddr,
    os::fd::{AsRawFd, RawFd},
    sync::{
        Mutex, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::{Buf, Bytes};
use mio::{Interest, Token, net::TcpStream};
use murmur_proto::FileInfo;
use tracing::{debug, trace};

use crate::{DisconnectReason, guard, reactor::Handle};

/// Bytes pulled off the socket per `read` call on the read path. Large
/// file chunks are reassembled across calls; the server never holds more
/// than the scratch plus one frame per connection.
pub const READ_CHUNK: usize = 64 * 1024;

/// Result of draining the socket into the read buffer.
#[derive(Debug)]
pub enum FillOutcome {
    /// Drained until the socket would block (possibly zero new bytes).
    Filled,
    /// Orderly close by the peer.
    Eof,
    Fatal(io::Error),
}

/// What to do with an inbound FILE_DATA chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkDisposition {
    Relay,
    NotReceiving,
    Overrun { declared: u64, received: u64 },
}

/// Result of enqueueing an outbound payload.
#[derive(Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Enqueued,
    /// The configured queue bound was crossed; the recipient is too slow to
    /// keep and should be disconnected.
    Overflow { queued: usize, limit: usize },
}

/// In-flight inbound file transfer.
#[derive(Debug, Default)]
struct FileTransfer {
    receiving: bool,
    info: FileInfo,
    received: u64,
}

struct Io {
    stream: TcpStream,
    scratch: Vec<u8>,
}

struct WriteState {
    queue: VecDeque<Bytes>,
    /// Sum of the queued payload lengths, kept in step with `queue`.
    queued_bytes: usize,
    /// Invariant: set iff WRITABLE interest is currently registered.
    armed: bool,
}

/// Per-connection state. The socket, read buffer, write queue and file
/// substate each sit behind their own lock; no call path needs more than
/// one of them plus, nested innermost, the io lock (`write -> io`,
/// `io -> read_buf`). The read-in-progress flag serialises the read state
/// machine: at most one worker drives it at any time.
pub struct Session {
    token: Token,
    peer: SocketAddr,
    io: Mutex<Io>,
    name: OnceLock<String>,
    read_buf: Mutex<Vec<u8>>,
    write: Mutex<WriteState>,
    transfer: Mutex<FileTransfer>,
    /// Disconnect threshold for the write queue; `None` leaves it unbounded.
    max_queue_bytes: Option<usize>,
    reading: AtomicBool,
    open: AtomicBool,
}

impl Session {
    pub fn new(
        token: Token,
        peer: SocketAddr,
        stream: TcpStream,
        max_queue_bytes: Option<usize>,
    ) -> Self {
        Self {
            token,
            peer,
            io: Mutex::new(Io { stream, scratch: vec![0; READ_CHUNK] }),
            name: OnceLock::new(),
            read_buf: Mutex::new(Vec::new()),
            write: Mutex::new(WriteState {
                queue: VecDeque::new(),
                queued_bytes: 0,
                armed: false,
            }),
            transfer: Mutex::new(FileTransfer::default()),
            max_queue_bytes,
            reading: AtomicBool::new(false),
            open: AtomicBool::new(true),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The name bound at JOIN; `None` while the session is anonymous.
    pub fn name(&self) -> Option<&str> {
        self.name.get().map(String::as_str)
    }

    pub fn name_owned(&self) -> Option<String> {
        self.name.get().cloned()
    }

    /// Set exactly once, by the registry under its lock.
    pub(crate) fn bind_name(&self, name: &str) {
        let _ = self.name.set(name.to_owned());
    }

    /// Claims the read state machine. False when another worker holds it;
    /// the claimer must call [`end_read`](Self::end_read) when done.
    #[inline]
    pub fn begin_read(&self) -> bool {
        !self.reading.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub fn end_read(&self) {
        self.reading.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Stops new outbound enqueues; the socket itself stays for [`close`](Self::close).
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn close(&self) {
        self.mark_closed();
        let io = guard(&self.io);
        let _ = io.stream.shutdown(std::net::Shutdown::Both);
    }

    pub(crate) fn deregister(&self, handle: &Handle) {
        let mut io = guard(&self.io);
        handle.deregister(&mut io.stream);
    }

    /// Drains the socket into the read buffer until it would block.
    pub fn fill_read_buffer(&self) -> FillOutcome {
        let mut io = guard(&self.io);
        let Io { stream, scratch } = &mut *io;
        loop {
            match stream.read(scratch) {
                Ok(0) => return FillOutcome::Eof,
                Ok(n) => {
                    trace!(token = self.token.0, n, "session: read");
                    guard(&self.read_buf).extend_from_slice(&scratch[..n]);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return FillOutcome::Filled;
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return FillOutcome::Fatal(err),
            }
        }
    }

    /// Appends bytes to the read buffer (the parse-side entry point used by
    /// tests; the socket path goes through [`fill_read_buffer`](Self::fill_read_buffer)).
    pub fn append_inbound(&self, bytes: &[u8]) {
        guard(&self.read_buf).extend_from_slice(bytes);
    }

    /// Removes the first `n` bytes of the read buffer.
    pub fn take_prefix(&self, n: usize) {
        let mut buf = guard(&self.read_buf);
        let n = n.min(buf.len());
        buf.drain(..n);
    }

    /// Runs `f` with the read buffer locked, so peeking a header and
    /// consuming the frame are one atomic step.
    pub fn with_inbound<R>(&self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        f(&mut guard(&self.read_buf))
    }

    /// Appends to the write queue. True when the caller must arm WRITABLE
    /// interest: the queue was idle before this enqueue.
    pub fn enqueue_outbound(&self, payload: Bytes) -> bool {
        let mut w = guard(&self.write);
        w.queued_bytes += payload.len();
        w.queue.push_back(payload);
        w.queue.len() == 1 && !w.armed
    }

    pub fn queued_bytes(&self) -> usize {
        guard(&self.write).queued_bytes
    }

    /// Enqueues and widens the reactor interest on the idle->busy edge.
    /// Silently drops payloads for a session already torn down; a recipient
    /// removed between broadcast snapshot and enqueue just misses the
    /// message. Reports an overflow once the configured queue bound is
    /// crossed; the caller decides whether that recipient is worth keeping.
    pub fn send(&self, handle: &Handle, payload: Bytes) -> SendOutcome {
        if !self.is_open() {
            return SendOutcome::Enqueued;
        }
        let mut w = guard(&self.write);
        w.queued_bytes += payload.len();
        w.queue.push_back(payload);
        if !w.armed {
            let mut io = guard(&self.io);
            match handle.reregister(
                &mut io.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                Ok(()) => w.armed = true,
                Err(err) => debug!(?err, token = self.token.0, "session: arm writable"),
            }
        }
        match self.max_queue_bytes {
            Some(limit) if w.queued_bytes > limit => {
                SendOutcome::Overflow { queued: w.queued_bytes, limit }
            }
            _ => SendOutcome::Enqueued,
        }
    }

    /// Drains the write queue with non-blocking sends. Partial write trims
    /// the head and stops; would-block stops with WRITABLE interest kept;
    /// an emptied queue narrows interest back to READABLE.
    pub fn drain_write(&self, handle: &Handle) -> Result<(), DisconnectReason> {
        let mut w = guard(&self.write);
        let WriteState { queue, queued_bytes, armed } = &mut *w;
        while let Some(front) = queue.front_mut() {
            let res = {
                let io = guard(&self.io);
                send_nosignal(io.stream.as_raw_fd(), front)
            };
            match res {
                Ok(0) => return Err(DisconnectReason::PeerClosed),
                Ok(n) => {
                    *queued_bytes -= n;
                    if n == front.len() {
                        queue.pop_front();
                    } else {
                        front.advance(n);
                        return Ok(());
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(DisconnectReason::Io(err)),
            }
        }
        if *armed {
            let mut io = guard(&self.io);
            match handle.reregister(&mut io.stream, self.token, Interest::READABLE) {
                Ok(()) => *armed = false,
                Err(err) => debug!(?err, token = self.token.0, "session: disarm writable"),
            }
        }
        Ok(())
    }

    /// Non-blocking readability probe. Edge-triggered events that fired
    /// during a read pass won't fire again, so the worker re-checks before
    /// handing the state machine back.
    pub fn pending_socket_bytes(&self) -> usize {
        if !self.is_open() {
            return 0;
        }
        let io = guard(&self.io);
        let mut available: libc::c_int = 0;
        let rc = unsafe {
            libc::ioctl(io.stream.as_raw_fd(), libc::FIONREAD, &mut available as *mut libc::c_int)
        };
        if rc == 0 { available.max(0) as usize } else { 0 }
    }

    /// Opens the file-transfer window. False when a transfer is already in
    /// flight (the new announcement is dropped, the open one continues).
    pub fn begin_transfer(&self, info: FileInfo) -> bool {
        let mut t = guard(&self.transfer);
        if t.receiving {
            return false;
        }
        t.receiving = true;
        t.info = info;
        t.received = 0;
        true
    }

    /// Accounts one FILE_DATA chunk against the declared size.
    pub fn account_chunk(&self, len: u64) -> ChunkDisposition {
        let mut t = guard(&self.transfer);
        if !t.receiving {
            return ChunkDisposition::NotReceiving;
        }
        if t.received + len > t.info.size {
            return ChunkDisposition::Overrun { declared: t.info.size, received: t.received + len };
        }
        t.received += len;
        ChunkDisposition::Relay
    }

    /// Closes the window at FILE_END. False when no transfer was open.
    pub fn end_transfer(&self) -> bool {
        let mut t = guard(&self.transfer);
        let was = t.receiving;
        *t = FileTransfer::default();
        was
    }

    pub fn reset_transfer(&self) {
        *guard(&self.transfer) = FileTransfer::default();
    }
}

fn send_nosignal(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let rc = unsafe {
        libc::send(fd, buf.as_ptr().cast::<libc::c_void>(), buf.len(), libc::MSG_NOSIGNAL)
    };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(rc as usize) }
}
