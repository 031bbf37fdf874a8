//! Load driver for the chat server: hammers PING frames over many
//! connections and reports round-trip latency and throughput. Every PING
//! must come back as a PING_OK on the same connection, so the reported
//! request count doubles as a correctness check.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use clap::Parser;
use murmur_proto::{self as proto, HEADER_LEN, HeaderStatus, MsgKind};

#[derive(Parser, Debug)]
#[command(name = "loadtest", version, about)]
struct Cli {
    /// Server address.
    #[arg(default_value = "127.0.0.1:1234")]
    addr: SocketAddr,

    /// Driver threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Connections per thread.
    #[arg(long, default_value_t = 25)]
    connections: usize,

    /// How long to run, in seconds.
    #[arg(long, default_value_t = 10)]
    duration: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    errors: AtomicU64,
}

fn main() {
    let cli = Cli::parse();
    let counters = Arc::new(Counters::default());
    let latencies: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let deadline = Instant::now() + Duration::from_secs(cli.duration);

    let start = Instant::now();
    let mut handles = Vec::with_capacity(cli.threads);
    for _ in 0..cli.threads {
        let counters = counters.clone();
        let latencies = latencies.clone();
        let addr = cli.addr;
        let connections = cli.connections;
        handles.push(thread::spawn(move || {
            drive(addr, connections, deadline, &counters, &latencies);
        }));
    }
    for handle in handles {
        let _ = handle.join();
    }
    let elapsed = start.elapsed();

    let sent = counters.sent.load(Ordering::Relaxed);
    let received = counters.received.load(Ordering::Relaxed);
    let errors = counters.errors.load(Ordering::Relaxed);
    let latencies = latencies.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

    println!("requests sent:      {sent}");
    println!("responses received: {received}");
    println!("errors:             {errors}");
    println!("elapsed:            {:.2}s", elapsed.as_secs_f64());
    println!("throughput:         {:.0} req/s", received as f64 / elapsed.as_secs_f64());
    if !latencies.is_empty() {
        let sum: u64 = latencies.iter().sum();
        let max = latencies.iter().copied().max().unwrap_or(0);
        println!("avg latency:        {:.3} ms", sum as f64 / latencies.len() as f64 / 1000.0);
        println!("max latency:        {:.3} ms", max as f64 / 1000.0);
    }
}

/// One driver thread: a bundle of connections polled round-robin with a
/// blocking request/response per turn, the shape a simple chat client has.
fn drive(
    addr: SocketAddr,
    connections: usize,
    deadline: Instant,
    counters: &Counters,
    latencies: &Mutex<Vec<u64>>,
) {
    let mut sockets = Vec::with_capacity(connections);
    for _ in 0..connections {
        match connect(addr) {
            Ok(stream) => sockets.push(stream),
            Err(err) => {
                eprintln!("connect to {addr} failed: {err}");
                counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    if sockets.is_empty() {
        return;
    }

    let ping = proto::control(MsgKind::Ping, "loadtest");
    let mut local_latencies = Vec::new();

    while Instant::now() < deadline {
        for stream in &mut sockets {
            let sent_at = Instant::now();
            if stream.write_all(&ping).is_err() {
                counters.errors.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            counters.sent.fetch_add(1, Ordering::Relaxed);

            match read_reply(stream) {
                Ok(MsgKind::PingOk) => {
                    counters.received.fetch_add(1, Ordering::Relaxed);
                    local_latencies.push(sent_at.elapsed().as_micros() as u64);
                }
                Ok(other) => {
                    eprintln!("unexpected reply kind {}", other.as_str());
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    counters.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    latencies
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .extend(local_latencies);
}

fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_secs(1)))?;
    Ok(stream)
}

fn read_reply(stream: &mut TcpStream) -> io::Result<MsgKind> {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf)?;
    let header = match proto::try_parse_header(&header_buf, proto::DEFAULT_MAX_BODY_LEN) {
        HeaderStatus::Parsed(header) => header,
        _ => return Err(io::Error::other("malformed header")),
    };
    if header.body_len > 0 {
        let mut body = vec![0u8; header.body_len];
        stream.read_exact(&mut body)?;
    }
    header.kind.ok_or_else(|| io::Error::other("unknown reply kind"))
}
