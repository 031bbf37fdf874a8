use std::{
    io,
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use bytes::Bytes;
use mio::{Interest, Token, net::TcpListener};
use murmur_proto::{
    self as proto, FILE_INFO_LEN, FileInfo, HEADER_LEN, Header, HeaderStatus, InvalidFrame,
    MsgKind,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    auth::CredentialService,
    error::{DisconnectReason, StartupError},
    guard,
    pool::{WorkerPool, default_workers},
    reactor::{Handle, LISTENER, Reactor, Readiness},
    registry::{BindOutcome, Registry},
    session::{ChunkDisposition, FillOutcome, SendOutcome, Session},
};

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Worker thread count; 0 picks 2x the hardware parallelism.
    pub workers: usize,
    /// Ceiling on a single frame body. A header declaring more disconnects
    /// the sender.
    pub max_body_len: usize,
    /// Per-session write queue bound in bytes; a recipient whose queue
    /// crosses it is disconnected rather than allowed to grow the heap.
    /// `None` leaves queues unbounded.
    pub max_queue_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 1234)),
            workers: 0,
            max_body_len: proto::DEFAULT_MAX_BODY_LEN,
            max_queue_bytes: None,
        }
    }
}

/// The chat server: owns the reactor, the worker pool, the registry and the
/// listening socket, and wires socket readiness to the per-session protocol
/// state machines. Constructed with [`bind`](Self::bind), driven by
/// [`start`](Self::start), torn down by [`stop`](Self::stop) (also run on
/// drop).
pub struct ChatServer {
    inner: Arc<ServerInner>,
    reactor: Option<Reactor>,
    reactor_thread: Option<JoinHandle<()>>,
}

struct ServerInner {
    handle: Handle,
    registry: Registry,
    pool: WorkerPool,
    auth: Arc<dyn CredentialService>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    next_token: AtomicUsize,
    max_body_len: usize,
    max_queue_bytes: Option<usize>,
}

/// One step of the parse loop, extracted under the read-buffer lock.
enum Step {
    /// Not enough buffered bytes for the frame at the front; wait for more.
    Wait,
    Frame { header: Header, body: Vec<u8> },
}

impl ChatServer {
    pub fn bind(
        cfg: ServerConfig,
        auth: Arc<dyn CredentialService>,
    ) -> Result<Self, StartupError> {
        let reactor = Reactor::new().map_err(StartupError::Demux)?;
        let handle = reactor.handle();

        let mut listener = TcpListener::bind(cfg.addr)
            .map_err(|source| StartupError::Bind { addr: cfg.addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr: cfg.addr, source })?;
        handle
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(StartupError::RegisterListener)?;

        let workers = if cfg.workers == 0 { default_workers() } else { cfg.workers };
        let pool = WorkerPool::new(workers).map_err(StartupError::WorkerSpawn)?;

        info!(addr = %local_addr, workers, "server: listening");
        Ok(Self {
            inner: Arc::new(ServerInner {
                handle,
                registry: Registry::new(),
                pool,
                auth,
                listener: Mutex::new(Some(listener)),
                local_addr,
                next_token: AtomicUsize::new(1),
                max_body_len: cfg.max_body_len,
                max_queue_bytes: cfg.max_queue_bytes,
            }),
            reactor: Some(reactor),
            reactor_thread: None,
        })
    }

    /// The bound address; useful when the config asked for port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Spawns the reactor thread and returns immediately.
    pub fn start(&mut self) -> Result<(), StartupError> {
        let Some(mut reactor) = self.reactor.take() else {
            return Ok(());
        };
        let inner = self.inner.clone();
        let thread = std::thread::Builder::new()
            .name("murmur-reactor".into())
            .spawn(move || reactor.run(|readiness| inner.dispatch(readiness)))
            .map_err(StartupError::ReactorSpawn)?;
        self.reactor_thread = Some(thread);
        Ok(())
    }

    /// Orderly teardown: stop accepting, join the reactor, close every
    /// session socket, drain the worker pool. Idempotent.
    pub fn stop(&mut self) {
        self.inner.handle.stop();
        if let Some(thread) = self.reactor_thread.take() {
            let _ = thread.join();
        }
        if let Some(mut listener) = guard(&self.inner.listener).take() {
            self.inner.handle.deregister(&mut listener);
        }
        // Workers drain before the registry so no in-flight accept can slip
        // a session past the close loop.
        self.inner.pool.shutdown();
        for session in self.inner.registry.drain(&self.inner.handle) {
            session.close();
        }
        info!("server: stopped");
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerInner {
    /// Runs on the reactor thread: decodes readiness into pool tasks and
    /// nothing else. Error/hang-up wins over read, read over write, matching
    /// the priority the protocol expects.
    fn dispatch(self: &Arc<Self>, r: Readiness) {
        if r.token == LISTENER {
            if r.readable {
                let inner = self.clone();
                self.pool.submit(move || inner.accept_ready());
            }
            return;
        }

        let Some(session) = self.registry.lookup(r.token) else {
            trace!(token = r.token.0, "server: event for unknown token");
            return;
        };

        if r.closed {
            let inner = self.clone();
            self.pool
                .submit(move || inner.drop_session(&session, &DisconnectReason::PeerClosed));
            return;
        }

        if r.readable && session.begin_read() {
            let inner = self.clone();
            let session = session.clone();
            self.pool.submit(move || inner.run_read(&session));
        }
        if r.writable {
            let inner = self.clone();
            self.pool.submit(move || inner.run_write(&session));
        }
    }

    /// Accepts until the listener would block; a failed accept never stops
    /// the server.
    fn accept_ready(self: &Arc<Self>) {
        loop {
            let accepted = {
                let listener = guard(&self.listener);
                let Some(listener) = listener.as_ref() else { return };
                listener.accept()
            };
            match accepted {
                Ok((mut stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(?err, "server: set nodelay");
                    }
                    let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
                    if let Err(err) = self.handle.register(&mut stream, token, Interest::READABLE)
                    {
                        error!(?err, %peer, "server: couldn't register client");
                        continue;
                    }
                    self.registry
                        .add(Arc::new(Session::new(token, peer, stream, self.max_queue_bytes)));
                    info!(%peer, token = token.0, "server: client connected");
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!(?err, "server: accept failed");
                    break;
                }
            }
        }
    }

    fn run_read(self: &Arc<Self>, session: &Arc<Session>) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.drive_read(session))).is_err() {
            error!(peer = %session.peer(), "server: read handler panicked");
            session.end_read();
            self.drop_session(session, &DisconnectReason::Io(io::Error::other("handler panic")));
        }
    }

    fn run_write(self: &Arc<Self>, session: &Arc<Session>) {
        if panic::catch_unwind(AssertUnwindSafe(|| self.drive_write(session))).is_err() {
            error!(peer = %session.peer(), "server: write handler panicked");
            self.drop_session(session, &DisconnectReason::Io(io::Error::other("handler panic")));
        }
    }

    /// Owns the session's read state machine for as long as bytes keep
    /// arriving. The flag is released between passes; a residual-readability
    /// probe decides re-entry, because edge-triggered events that fired
    /// during the pass will not fire again.
    fn drive_read(self: &Arc<Self>, session: &Arc<Session>) {
        loop {
            if let Err(reason) = self.read_pass(session) {
                session.end_read();
                self.drop_session(session, &reason);
                return;
            }
            session.end_read();
            if !session.is_open() || session.pending_socket_bytes() == 0 {
                return;
            }
            if !session.begin_read() {
                return;
            }
        }
    }

    fn drive_write(self: &Arc<Self>, session: &Arc<Session>) {
        if let Err(reason) = session.drain_write(&self.handle) {
            self.drop_session(session, &reason);
        }
    }

    fn read_pass(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), DisconnectReason> {
        match session.fill_read_buffer() {
            FillOutcome::Filled => {}
            FillOutcome::Eof => return Err(DisconnectReason::PeerClosed),
            FillOutcome::Fatal(err) => return Err(DisconnectReason::Io(err)),
        }
        self.parse_frames(session)
    }

    fn parse_frames(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), DisconnectReason> {
        loop {
            match self.extract_step(session)? {
                Step::Wait => return Ok(()),
                Step::Frame { header, body } => self.handle_frame(session, &header, body)?,
            }
        }
    }

    /// Peeks the buffered stream for the next complete frame and consumes
    /// it, all under the read-buffer lock so partial reads interleave
    /// cleanly with this check.
    fn extract_step(&self, session: &Session) -> Result<Step, DisconnectReason> {
        let max_body = self.max_body_len;
        session.with_inbound(|buf| {
            let header = match proto::try_parse_header(buf, max_body) {
                HeaderStatus::Parsed(header) => header,
                HeaderStatus::NeedMore => return Ok(Step::Wait),
                HeaderStatus::Invalid(InvalidFrame::Oversize { got, limit }) => {
                    return Err(DisconnectReason::OversizeFrame { got, limit });
                }
            };

            // FILE_END closes the transfer on the header alone; its body is
            // empty by contract.
            if header.kind == Some(MsgKind::FileEnd) {
                buf.drain(..HEADER_LEN);
                return Ok(Step::Frame { header, body: Vec::new() });
            }

            let total = HEADER_LEN + header.body_len;
            if buf.len() < total {
                return Ok(Step::Wait);
            }
            let body = buf[HEADER_LEN..total].to_vec();
            buf.drain(..total);
            Ok(Step::Frame { header, body })
        })
    }

    fn handle_frame(
        self: &Arc<Self>,
        session: &Arc<Session>,
        header: &Header,
        body: Vec<u8>,
    ) -> Result<(), DisconnectReason> {
        let Some(kind) = header.kind else {
            warn!(
                raw_kind = header.raw_kind,
                peer = %session.peer(),
                "server: unknown message kind, dropping frame"
            );
            return Ok(());
        };
        trace!(kind = kind.as_str(), sender = %header.sender, len = body.len(), "server: frame");

        match kind {
            MsgKind::FileStart => self.on_file_start(session, &body),
            MsgKind::FileData => self.on_file_data(session, &body),
            MsgKind::FileEnd => self.on_file_end(session),
            MsgKind::Register | MsgKind::Login => {
                self.on_auth(session, kind, &header.sender, &body);
            }
            MsgKind::Join => return self.on_join(session, &header.sender),
            MsgKind::GroupMsg => self.on_group_msg(session, &body),
            MsgKind::Ping => {
                self.deliver(
                    session,
                    Bytes::from(proto::control(MsgKind::PingOk, proto::SERVER_SENDER)),
                );
            }
            MsgKind::Exit => {
                debug!(name = session.name().unwrap_or("<anon>"), "server: EXIT received");
                return Err(DisconnectReason::Exit);
            }
            MsgKind::RegisterOk
            | MsgKind::RegisterFail
            | MsgKind::LoginOk
            | MsgKind::LoginFail
            | MsgKind::Initial
            | MsgKind::PingOk => {
                warn!(kind = kind.as_str(), "server: server-to-client kind from peer, dropping");
            }
        }
        Ok(())
    }

    fn on_join(
        self: &Arc<Self>,
        session: &Arc<Session>,
        proposed: &str,
    ) -> Result<(), DisconnectReason> {
        if proposed.is_empty() {
            warn!(peer = %session.peer(), "server: JOIN with empty name dropped");
            return Ok(());
        }
        if session.name().is_some() {
            warn!(peer = %session.peer(), "server: repeated JOIN dropped");
            return Ok(());
        }
        match self.registry.try_bind_name(session, proposed) {
            BindOutcome::Collision => {
                warn!(name = proposed, peer = %session.peer(), "server: name taken, disconnecting");
                Err(DisconnectReason::NameCollision)
            }
            BindOutcome::Bound => {
                info!(name = proposed, peer = %session.peer(), "server: joined");
                let others = self.registry.online_names_excluding(session.token());
                // Roster first, JOIN broadcast second: the new client must
                // never see its own JOIN or miss a peer.
                if !others.is_empty() {
                    self.deliver(session, Bytes::from(proto::initial(&others)));
                }
                self.broadcast(
                    Bytes::from(proto::control(MsgKind::Join, proposed)),
                    Some(session.token()),
                );
                Ok(())
            }
        }
    }

    fn on_group_msg(self: &Arc<Self>, session: &Arc<Session>, body: &[u8]) {
        let Some(name) = session.name_owned() else {
            warn!(peer = %session.peer(), "server: GROUP_MSG from anonymous session dropped");
            return;
        };
        // Re-framed with the name bound at JOIN; the sender field the client
        // put on the wire is never forwarded.
        match proto::encode(MsgKind::GroupMsg, &name, body, self.max_body_len) {
            Ok(frame) => self.broadcast(Bytes::from(frame), Some(session.token())),
            Err(err) => warn!(?err, "server: couldn't re-frame group message"),
        }
    }

    fn on_auth(self: &Arc<Self>, session: &Arc<Session>, kind: MsgKind, sender: &str, blob: &[u8]) {
        let verdict = if kind == MsgKind::Login {
            self.auth.login(sender, blob)
        } else {
            self.auth.register(sender, blob)
        };
        info!(
            kind = kind.as_str(),
            user = sender,
            ok = verdict.ok,
            message = %verdict.message,
            "server: auth request"
        );
        let reply = match (kind, verdict.ok) {
            (MsgKind::Login, true) => MsgKind::LoginOk,
            (MsgKind::Login, false) => MsgKind::LoginFail,
            (_, true) => MsgKind::RegisterOk,
            (_, false) => MsgKind::RegisterFail,
        };
        self.deliver(session, Bytes::from(proto::control(reply, proto::SERVER_SENDER)));
    }

    fn on_file_start(self: &Arc<Self>, session: &Arc<Session>, body: &[u8]) {
        let Some(name) = session.name_owned() else {
            warn!(peer = %session.peer(), "server: FILE_START from anonymous session dropped");
            return;
        };
        if body.len() != FILE_INFO_LEN {
            warn!(len = body.len(), user = %name, "server: FILE_START with bad FileInfo dropped");
            return;
        }
        let Some(info) = FileInfo::from_wire(body) else {
            warn!(user = %name, "server: FILE_START with bad FileInfo dropped");
            return;
        };
        if !session.begin_transfer(info.clone()) {
            warn!(user = %name, "server: FILE_START while a transfer is open, dropping");
            return;
        }
        info!(user = %name, file = %info.filename, size = info.size, "server: transfer started");
        self.broadcast(Bytes::from(proto::file_start(&name, &info)), Some(session.token()));
    }

    fn on_file_data(self: &Arc<Self>, session: &Arc<Session>, chunk: &[u8]) {
        let Some(name) = session.name_owned() else {
            warn!(peer = %session.peer(), "server: FILE_DATA from anonymous session dropped");
            return;
        };
        match session.account_chunk(chunk.len() as u64) {
            ChunkDisposition::Relay => {
                trace!(user = %name, len = chunk.len(), "server: relaying chunk");
                self.broadcast(Bytes::from(proto::file_data(&name, chunk)), Some(session.token()));
            }
            ChunkDisposition::NotReceiving => {
                warn!(user = %name, "server: FILE_DATA outside a transfer, dropping");
            }
            ChunkDisposition::Overrun { declared, received } => {
                warn!(
                    user = %name,
                    declared,
                    received,
                    "server: FILE_DATA exceeds the declared size, dropping"
                );
            }
        }
    }

    fn on_file_end(self: &Arc<Self>, session: &Arc<Session>) {
        let Some(name) = session.name_owned() else {
            warn!(peer = %session.peer(), "server: FILE_END from anonymous session dropped");
            return;
        };
        if session.end_transfer() {
            info!(user = %name, "server: transfer complete");
            self.broadcast(Bytes::from(proto::file_end(&name)), Some(session.token()));
        } else {
            warn!(user = %name, "server: FILE_END outside a transfer, dropping");
        }
    }

    /// Enqueues to one session; a recipient whose queue bound is crossed is
    /// cut loose instead of growing the heap.
    fn deliver(self: &Arc<Self>, session: &Arc<Session>, payload: Bytes) {
        if let SendOutcome::Overflow { queued, limit } = session.send(&self.handle, payload) {
            self.drop_session(session, &DisconnectReason::QueueOverflow { queued, limit });
        }
    }

    /// Fans `payload` out to every named session except `exclude`. The
    /// registry lock covers only the snapshot; enqueueing (and the WRITABLE
    /// arming it may trigger) happens outside it. Per-recipient ordering
    /// falls out of the write queues; nothing blocks on a slow peer.
    fn broadcast(self: &Arc<Self>, payload: Bytes, exclude: Option<Token>) {
        let recipients = self.registry.named_peers(exclude);
        trace!(n = recipients.len(), len = payload.len(), "server: broadcast");
        for peer in recipients {
            self.deliver(&peer, payload.clone());
        }
    }

    /// The single disconnect sequence for every termination cause: registry
    /// removal (the once-guard), then file substate reset, then the EXIT
    /// broadcast for a named session, then the socket close.
    fn drop_session(self: &Arc<Self>, session: &Arc<Session>, reason: &DisconnectReason) {
        let Some(session) = self.registry.remove(session.token(), &self.handle) else {
            return;
        };
        session.mark_closed();
        session.reset_transfer();
        info!(
            peer = %session.peer(),
            name = session.name().unwrap_or("<anon>"),
            %reason,
            "server: client disconnected"
        );
        if let Some(name) = session.name_owned() {
            self.broadcast(Bytes::from(proto::control(MsgKind::Exit, &name)), None);
        }
        session.close();
    }
}
