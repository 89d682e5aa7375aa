//! TCP sink with buffered non-blocking writes
//!
//! Batches are queued in a pre-allocated write buffer and pushed to a
//! non-blocking socket. When the kernel send buffer is full the sink waits for
//! writability through a `mio::Poll`, bounded by `write_timeout`.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace};

use super::Sink;
use crate::error::Result;

const SINK_TOKEN: Token = Token(0);
const WRITE_BUFFER_SIZE: usize = 64 * 1024; // 64KB
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Streams drained batches to a TCP peer.
pub struct TcpSink {
    poll: Poll,
    events: Events,
    stream: TcpStream,
    write_buffer: Box<[u8]>,
    write_pos: usize,
    write_timeout: Duration,
}

impl TcpSink {
    /// Connects to `addr` (blocking connect) and switches to non-blocking I/O.
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = StdTcpStream::connect(addr)?;
        debug!(%addr, "tcp sink connected");
        Self::from_std(stream)
    }

    /// Wraps an already connected stream.
    pub fn from_std(stream: StdTcpStream) -> Result<Self> {
        // Disable Nagle's algorithm, batches are already coalesced
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        tune_send_buffer(&stream);

        let mut stream = TcpStream::from_std(stream);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, SINK_TOKEN, Interest::WRITABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(8),
            stream,
            write_buffer: vec![0u8; WRITE_BUFFER_SIZE].into_boxed_slice(),
            write_pos: 0,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// How long `write_batch`/`sync` may wait for the peer to accept data.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Bytes queued but not yet accepted by the kernel.
    #[inline(always)]
    pub fn write_pending(&self) -> usize {
        self.write_pos
    }

    /// Queues data, pushing what the socket takes without waiting.
    fn queue_write(&mut self, data: &[u8]) -> io::Result<()> {
        let deadline = Instant::now() + self.write_timeout;

        if self.write_pos + data.len() > self.write_buffer.len() {
            // Make room first
            self.flush_write_buffer(Some(deadline))?;
        }

        if data.len() > self.write_buffer.len() {
            // Too large to queue, write directly
            return self.write_direct(data, deadline);
        }

        self.write_buffer[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();

        self.flush_write_buffer(None)
    }

    /// Writes queued bytes. With a deadline, waits until everything is sent;
    /// without one, stops at the first `WouldBlock`.
    fn flush_write_buffer(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        let mut written = 0;
        let result = loop {
            if written == self.write_pos {
                break Ok(());
            }
            match self.stream.write(&self.write_buffer[written..self.write_pos]) {
                Ok(0) => {
                    break Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => match deadline {
                    Some(deadline) => {
                        if let Err(e) = wait_writable(&mut self.poll, &mut self.events, deadline) {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                },
                Err(e) => break Err(e),
            }
        };

        // Partial write, compact buffer
        if written > 0 {
            self.write_buffer.copy_within(written..self.write_pos, 0);
            self.write_pos -= written;
            trace!(written, pending = self.write_pos, "tcp sink wrote");
        }
        result
    }

    fn write_direct(&mut self, data: &[u8], deadline: Instant) -> io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.stream.write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to socket",
                    ))
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_writable(&mut self.poll, &mut self.events, deadline)?
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl Sink for TcpSink {
    fn write_batch(&mut self, batch: &[u8]) -> Result<()> {
        self.queue_write(batch)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.write_timeout;
        self.flush_write_buffer(Some(deadline))?;
        self.stream.flush()?;
        Ok(())
    }
}

/// Blocks until the socket reports writable or `deadline` passes.
fn wait_writable(poll: &mut Poll, events: &mut Events, deadline: Instant) -> io::Result<()> {
    let now = Instant::now();
    if now >= deadline {
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for tcp sink to drain",
        ));
    }

    match poll.poll(events, Some(deadline - now)) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e),
    }
}

/// Enlarges the kernel send buffer. Not all platforms allow it, errors are ignored.
fn tune_send_buffer(stream: &StdTcpStream) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = stream.as_raw_fd();
        let optval: libc::c_int = 256 * 1024; // 256KB
        // SAFETY: fd is a valid socket for the lifetime of `stream`
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            trace!("SO_SNDBUF not applied");
        }
    }

    #[cfg(not(unix))]
    let _ = stream;
}
