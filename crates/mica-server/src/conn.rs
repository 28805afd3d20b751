//! Per-socket connection state and the reader/writer task pair.
//!
//! The reader parses commands until input is exhausted, executes each one
//! and queues the result; the writer walks the queue in order, emits the
//! serialized replies (splicing cache values straight into the transmit
//! buffer) and releases the receive buffer up to the last retired
//! command. Commands retire strictly in FIFO order per socket.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::{self, Read as _, Write as _};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mio::net::TcpStream;
use tracing::{debug, trace};

use mica_buffer::{PoolRef, SegBuf};
use mica_event::Handle;
use mica_proto::{parse, Parsed, Request};
use mica_runtime::{with_timeout, WaitQueue};

use crate::exec::{execute, ExecCtx, Reply};

/// How long a mid-command read may stall before the client is dropped.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Read chunk demanded from the receive buffer per syscall.
const READ_SIZE: usize = 2048;

/// A command whose result is ready to transmit, with the receive-buffer
/// offset it retires.
struct Retired {
    reply: Reply,
    end: u64,
}

pub(crate) struct Conn {
    stream: RefCell<TcpStream>,
    key: usize,
    events: Arc<Handle>,
    peer: SocketAddr,

    rbuf: RefCell<SegBuf>,
    tbuf: RefCell<SegBuf>,
    /// Parse cursor: ahead of the receive buffer's read cursor, which
    /// trails until replies are transmitted.
    parse_pos: Cell<u64>,

    pending: RefCell<VecDeque<Retired>>,
    writer_wake: WaitQueue,

    reader_done: Cell<bool>,
    quit: Cell<bool>,
    quit_fast: Cell<bool>,
}

impl Conn {
    pub(crate) fn new(
        stream: TcpStream,
        key: usize,
        events: Arc<Handle>,
        pool: PoolRef,
        peer: SocketAddr,
    ) -> Rc<Self> {
        let rbuf = SegBuf::new(Rc::clone(&pool));
        let tbuf = SegBuf::new(pool);
        let parse_pos = rbuf.read_pos();
        Rc::new(Self {
            stream: RefCell::new(stream),
            key,
            events,
            peer,
            rbuf: RefCell::new(rbuf),
            tbuf: RefCell::new(tbuf),
            parse_pos: Cell::new(parse_pos),
            pending: RefCell::new(VecDeque::new()),
            writer_wake: WaitQueue::new(),
            reader_done: Cell::new(false),
            quit: Cell::new(false),
            quit_fast: Cell::new(false),
        })
    }

    fn push_reply(&self, reply: Reply, end: u64) {
        self.pending.borrow_mut().push_back(Retired { reply, end });
        self.writer_wake.signal();
    }

    fn teardown(&self) {
        self.events.deregister(self.stream.borrow().as_raw_fd(), self.key);
    }
}

/// Read available bytes into the receive buffer. Returns the byte count,
/// zero at EOF. `timed` bounds the wait for mid-command continuations.
async fn read_some(conn: &Rc<Conn>, timed: bool) -> io::Result<usize> {
    loop {
        if conn.quit.get() {
            return Ok(0);
        }
        let result = {
            let mut rbuf = conn.rbuf.borrow_mut();
            let dst = rbuf.demand(READ_SIZE);
            let result = conn.stream.borrow_mut().read(dst);
            if let Ok(n) = result {
                rbuf.commit(n);
            }
            result
        };
        match result {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if timed {
                    if with_timeout(READ_TIMEOUT, conn.events.readable(conn.key)).await.is_none() {
                        return Err(io::ErrorKind::TimedOut.into());
                    }
                } else {
                    conn.events.readable(conn.key).await;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// The reader task: pump bytes, parse commands, execute, hand results to
/// the writer.
pub(crate) async fn reader(conn: Rc<Conn>, ctx: Rc<ExecCtx>) {
    debug!(peer = %conn.peer, "connection open");
    // Whether a partially received command is pending, which arms the
    // dead-client timeout on the next read.
    let mut partial = false;

    'serve: loop {
        match read_some(&conn, partial).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(peer = %conn.peer, error = %e, "read failed");
                conn.quit_fast.set(true);
                break;
            }
        }

        loop {
            let outcome = parse(&conn.rbuf.borrow(), conn.parse_pos.get());
            match outcome {
                Parsed::More => {
                    partial = conn.rbuf.borrow().write_pos() > conn.parse_pos.get();
                    continue 'serve;
                }
                Parsed::Trash => {
                    debug!(peer = %conn.peer, "dropping client after junk flood");
                    conn.quit.set(true);
                    conn.quit_fast.set(true);
                    break 'serve;
                }
                Parsed::Error { reply, end } => {
                    conn.parse_pos.set(end);
                    conn.push_reply(Reply::Line(reply), end);
                }
                Parsed::Cmd { request, end } => {
                    conn.parse_pos.set(end);
                    trace!(peer = %conn.peer, ?request, "command");

                    // Lift the data block out of the receive buffer before
                    // execution; the buffer cannot be borrowed across the
                    // suspension points inside execute.
                    let data = match &request {
                        Request::Store { data, .. } => Some(Bytes::from(
                            conn.rbuf.borrow().copy_range(data.off, data.len as usize),
                        )),
                        _ => None,
                    };
                    let noreply = request.noreply();
                    let reply = execute(&ctx, request, data).await;

                    let quitting = matches!(reply, Reply::Quit);
                    conn.push_reply(if noreply { Reply::None } else { reply }, end);
                    if quitting {
                        conn.quit.set(true);
                        break 'serve;
                    }
                }
            }
        }
    }

    conn.reader_done.set(true);
    conn.writer_wake.signal();
}

/// Serialize one reply into the transmit buffer.
fn emit(tbuf: &mut SegBuf, reply: Reply) {
    match reply {
        Reply::None | Reply::Quit => {}
        Reply::Line(line) => tbuf.append(line.as_bytes()),
        Reply::Number(value) => {
            let _ = write!(tbuf, "{value}\r\n");
        }
        Reply::Version => {
            let _ = write!(tbuf, "VERSION {}\r\n", env!("CARGO_PKG_VERSION"));
        }
        Reply::Values { hits, with_cas } => {
            for hit in hits {
                tbuf.append(b"VALUE ");
                tbuf.append(&hit.key);
                let _ = write!(tbuf, " {} {}", hit.flags, hit.value.len());
                if with_cas {
                    let _ = write!(tbuf, " {}", hit.stamp);
                }
                tbuf.append(b"\r\n");
                // Zero copy: the value bytes ride the entry's refcount,
                // released when the cursor passes the segment.
                let guard = hit.guard;
                tbuf.splice(hit.value, Some(Box::new(move || drop(guard))));
                tbuf.append(b"\r\n");
            }
            tbuf.append(b"END\r\n");
        }
    }
}

/// Flush the transmit buffer to the socket.
async fn flush(conn: &Rc<Conn>) -> io::Result<()> {
    loop {
        let result = {
            let tbuf = conn.tbuf.borrow();
            match tbuf.first_run() {
                None => return Ok(()),
                Some(run) => conn.stream.borrow_mut().write(run),
            }
        };
        match result {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => conn.tbuf.borrow_mut().reduce(n as u64),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                conn.events.writable(conn.key).await;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// The writer task: emit queued replies in order, flush, and release the
/// receive buffer up to the last retired command.
pub(crate) async fn writer(conn: Rc<Conn>) {
    loop {
        if conn.quit_fast.get() {
            break;
        }

        let mut retired_to = None;
        loop {
            let item = conn.pending.borrow_mut().pop_front();
            match item {
                Some(item) => {
                    emit(&mut conn.tbuf.borrow_mut(), item.reply);
                    retired_to = Some(item.end);
                }
                None => break,
            }
        }

        if let Err(e) = flush(&conn).await {
            debug!(peer = %conn.peer, error = %e, "write failed");
            conn.quit.set(true);
            conn.quit_fast.set(true);
            break;
        }

        if let Some(end) = retired_to {
            conn.rbuf.borrow_mut().consume_to(end);
        }

        if conn.pending.borrow().is_empty() {
            if conn.quit.get() || conn.reader_done.get() {
                break;
            }
            conn.writer_wake.wait().await;
        }
    }

    conn.teardown();
    debug!(peer = %conn.peer, "connection closed");
}
