//! A live client connection: a split TCP socket plus a background line
//! reader, handed between tasks (session -> match -> session) as an
//! explicit value rather than shared via `Arc` (§9 design notes:
//! "socket ownership transfers ... modeled as explicit handoffs").
//!
//! The OS file descriptor can be reused after close; per §9 this is
//! mitigated with a per-session monotonically increasing [`ConnId`]
//! stored alongside the socket instead of trusting the raw fd/handle.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

fn next_conn_id() -> ConnId {
    ConnId(NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed))
}

impl ConnId {
    /// Construct an id outside the normal counter — used for the registry's
    /// pre-bind placeholder and for tests.
    pub(crate) fn from_raw(n: u64) -> ConnId {
        ConnId(n)
    }
}

/// One line read off the socket, or a terminal event from the reader task.
#[derive(Debug)]
pub enum LineEvent {
    Line(String),
    /// Peer closed the connection (EOF).
    Closed,
    /// A read error occurred; treated the same as a close.
    Error,
}

async fn reader_loop(read: OwnedReadHalf, tx: mpsc::UnboundedSender<LineEvent>) {
    let mut lines = BufReader::new(read).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(LineEvent::Line(line)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(LineEvent::Closed);
                return;
            }
            Err(_) => {
                let _ = tx.send(LineEvent::Error);
                return;
            }
        }
    }
}

/// A connected client socket: a writer half owned by whichever task
/// currently drives this connection's state machine, and a channel fed by
/// a standing background reader task.
pub struct Conn {
    pub id: ConnId,
    pub addr: SocketAddr,
    writer: OwnedWriteHalf,
    lines: mpsc::UnboundedReceiver<LineEvent>,
    reader_task: JoinHandle<()>,
}

impl Conn {
    pub fn accept(stream: TcpStream, addr: SocketAddr) -> std::io::Result<Conn> {
        stream.set_nodelay(true).ok();
        let (read, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(reader_loop(read, tx));
        Ok(Conn { id: next_conn_id(), addr, writer, lines: rx, reader_task })
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.writer.write_all(line.as_bytes()).await
    }

    /// Block until a line arrives or the connection ends.
    pub async fn recv(&mut self) -> LineEvent {
        self.lines.recv().await.unwrap_or(LineEvent::Closed)
    }

    /// Block up to `dur` for a line; `None` on timeout.
    pub async fn recv_timeout(&mut self, dur: Duration) -> Option<LineEvent> {
        tokio::time::timeout(dur, self.recv()).await.ok()
    }

    /// Non-blocking drain of a single already-buffered line, if any.
    pub fn try_recv(&mut self) -> Option<LineEvent> {
        self.lines.try_recv().ok()
    }

    /// Half-close the socket so the peer observes an immediate EOF/RST,
    /// used for shutdown broadcast and stale-reconnect-socket teardown.
    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
        self.reader_task.abort();
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn").field("id", &self.id).field("addr", &self.addr).finish()
    }
}
