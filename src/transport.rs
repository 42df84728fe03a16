// Framed text transport over TCP. Each frame is a UTF-8 string with a
// little-endian u32 length prefix. One I/O thread per connection drains an
// outbound queue and reads with a short timeout; everything it learns flows
// to the node thread as `WireEvent`s tagged with a connection id.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

const DIAL_RETRY: Duration = Duration::from_millis(50);
const DIAL_BUDGET: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_millis(25);
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const IDLE: Duration = Duration::from_millis(5);

pub type ConnId = u64;

fn next_conn_id() -> ConnId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

enum WireCmd {
    Send(String),
    Close,
}

/// Cheap handle for one connection; sends are fire-and-forget enqueues.
#[derive(Clone)]
pub struct Wire {
    tx: mpsc::Sender<WireCmd>,
}

impl Wire {
    pub fn send(&self, frame: String) {
        let _ = self.tx.send(WireCmd::Send(frame));
    }

    pub fn close(&self) {
        let _ = self.tx.send(WireCmd::Close);
    }
}

impl std::fmt::Debug for Wire {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Wire")
    }
}

#[derive(Debug)]
pub enum WireEventKind {
    /// An inbound connection was accepted; the node owns the handle now.
    Accepted(Wire),
    /// A dialed connection finished its handshake.
    Open,
    Frame(String),
    Error(String),
    Closed,
}

#[derive(Debug)]
pub struct WireEvent {
    pub conn: ConnId,
    pub kind: WireEventKind,
}

/// Dial `addr` in the background. The returned `Wire` accepts frames
/// immediately; they flush once the connection opens. Connection attempts
/// retry briefly before reporting failure.
pub fn dial(addr: &str, events: mpsc::Sender<WireEvent>, max_frame: usize) -> (ConnId, Wire) {
    let conn = next_conn_id();
    let (tx, rx) = mpsc::channel();
    let addr = addr.to_string();
    thread::spawn(move || {
        let started = Instant::now();
        loop {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    let _ = events.send(WireEvent {
                        conn,
                        kind: WireEventKind::Open,
                    });
                    run_wire(conn, stream, rx, events, max_frame);
                    return;
                }
                Err(err) => {
                    if started.elapsed() >= DIAL_BUDGET {
                        let _ = events.send(WireEvent {
                            conn,
                            kind: WireEventKind::Error(format!("dial {}: {}", addr, err)),
                        });
                        let _ = events.send(WireEvent {
                            conn,
                            kind: WireEventKind::Closed,
                        });
                        return;
                    }
                    thread::sleep(DIAL_RETRY);
                }
            }
        }
    });
    (conn, Wire { tx })
}

/// Accept loop on `port`. Accepted connections surface as
/// `WireEventKind::Accepted` before any of their frames.
pub struct Listener {
    shutdown: Arc<AtomicBool>,
    port: u16,
}

impl Listener {
    pub fn spawn(
        port: u16,
        events: mpsc::Sender<WireEvent>,
        max_frame: usize,
    ) -> Result<Listener, String> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).map_err(|e| format!("bind {}: {}", port, e))?;
        let port = listener
            .local_addr()
            .map_err(|e| format!("local addr: {}", e))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| format!("set nonblocking: {}", e))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        thread::spawn(move || loop {
            if flag.load(Ordering::Relaxed) {
                break;
            }
            match listener.accept() {
                Ok((stream, _)) => {
                    let conn = next_conn_id();
                    let (tx, rx) = mpsc::channel();
                    if events
                        .send(WireEvent {
                            conn,
                            kind: WireEventKind::Accepted(Wire { tx }),
                        })
                        .is_err()
                    {
                        break;
                    }
                    let ev = events.clone();
                    thread::spawn(move || run_wire(conn, stream, rx, ev, max_frame));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(_) => break,
            }
        });

        Ok(Listener { shutdown, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn run_wire(
    conn: ConnId,
    mut stream: TcpStream,
    rx: mpsc::Receiver<WireCmd>,
    events: mpsc::Sender<WireEvent>,
    max_frame: usize,
) {
    let _ = stream.set_read_timeout(Some(READ_TIMEOUT));
    let mut buf = Vec::new();

    let fail = |kind: WireEventKind| {
        let _ = events.send(WireEvent { conn, kind });
        let _ = events.send(WireEvent {
            conn,
            kind: WireEventKind::Closed,
        });
    };

    loop {
        loop {
            match rx.try_recv() {
                Ok(WireCmd::Send(frame)) => {
                    if let Err(err) = write_frame(&mut stream, &frame, max_frame) {
                        fail(WireEventKind::Error(err));
                        return;
                    }
                }
                Ok(WireCmd::Close) | Err(mpsc::TryRecvError::Disconnected) => {
                    let _ = events.send(WireEvent {
                        conn,
                        kind: WireEventKind::Closed,
                    });
                    return;
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        match read_some(&mut stream, &mut buf) {
            Ok(true) => {}
            Ok(false) => {
                let _ = events.send(WireEvent {
                    conn,
                    kind: WireEventKind::Closed,
                });
                return;
            }
            Err(err) => {
                fail(WireEventKind::Error(err));
                return;
            }
        }

        loop {
            match take_frame(&mut buf, max_frame) {
                Ok(Some(text)) => {
                    if events
                        .send(WireEvent {
                            conn,
                            kind: WireEventKind::Frame(text),
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    fail(WireEventKind::Error(err));
                    return;
                }
            }
        }

        thread::sleep(IDLE);
    }
}

fn write_frame(stream: &mut TcpStream, frame: &str, max_frame: usize) -> Result<(), String> {
    let data = frame.as_bytes();
    if data.is_empty() || data.len() > max_frame {
        return Err(format!("refusing to send frame of {} bytes", data.len()));
    }
    let len = data.len() as u32;
    stream
        .write_all(&len.to_le_bytes())
        .map_err(|e| format!("{}", e))?;
    stream.write_all(data).map_err(|e| format!("{}", e))?;
    Ok(())
}

/// Returns Ok(false) on clean EOF; a read timeout is Ok(true) with no data.
fn read_some(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<bool, String> {
    let mut tmp = [0u8; 4096];
    match stream.read(&mut tmp) {
        Ok(0) => Ok(false),
        Ok(n) => {
            buf.extend_from_slice(&tmp[..n]);
            Ok(true)
        }
        Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(true),
        Err(err) => Err(format!("{}", err)),
    }
}

fn take_frame(buf: &mut Vec<u8>, max_frame: usize) -> Result<Option<String>, String> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 || len > max_frame {
        return Err(format!("invalid frame length {}", len));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let data = buf[4..4 + len].to_vec();
    buf.drain(0..4 + len);
    String::from_utf8(data)
        .map(Some)
        .map_err(|_| "frame is not utf-8".to_string())
}
