//! The seam between a [`Socket`](super::Socket) and the operating system.
//!
//! Every operation either completes synchronously (`IoStatus::Done`) or
//! reports `Pending`; a pending operation later delivers exactly one
//! [`Completion`] through the [`CompletionSink`], from whichever thread the
//! I/O finished on. The sink re-posts it to the dispatch thread.

use std::future::Future;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use socket2::SockRef;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::SocketId;

/// Outcome of an I/O call that may finish later.
#[derive(Debug, PartialEq, Eq)]
pub enum IoStatus<T> {
    Done(T),
    Pending,
}

/// Result of an operation that returned [`IoStatus::Pending`].
#[derive(Debug)]
pub enum Completion {
    Connected(io::Result<()>),
    /// An empty payload is end of stream.
    Received(io::Result<Bytes>),
    Sent(io::Result<usize>),
}

pub trait CompletionSink: Send + Sync {
    fn complete(&self, socket: SocketId, completion: Completion);
}

/// Byte stream primitives a socket is driven through.
pub trait Transport {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<IoStatus<()>>;

    /// Reads at most `max` bytes. `Done` with an empty buffer means the peer
    /// closed its write side.
    fn receive(&mut self, max: usize) -> io::Result<IoStatus<Bytes>>;

    /// Sends a prefix of `data`, returning how many bytes the OS accepted.
    fn send(&mut self, data: Bytes) -> io::Result<IoStatus<usize>>;

    fn shutdown_write(&mut self) -> io::Result<()>;

    /// Releases the OS handle. Outstanding operations never complete.
    fn close(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub input_buffer_size: usize,
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            input_buffer_size: 4096,
            receive_timeout: Some(Duration::from_secs(10)),
            send_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Tokio-backed TCP transport.
///
/// Reads and writes are first attempted with `try_read`/`try_write` on the
/// dispatch thread. Only when the OS would block is a readiness wait
/// spawned on the I/O runtime, bounded by the configured timeout.
pub struct TcpTransport {
    id: SocketId,
    stream: Option<Arc<TcpStream>>,
    connecting: Arc<Mutex<Option<TcpStream>>>,
    runtime: Handle,
    sink: Arc<dyn CompletionSink>,
    options: TransportOptions,
    tasks: Vec<AbortHandle>,
}

impl TcpTransport {
    pub fn accepted(
        id: SocketId,
        stream: TcpStream,
        runtime: Handle,
        sink: Arc<dyn CompletionSink>,
        options: TransportOptions,
    ) -> Self {
        let mut transport = Self::unconnected(id, runtime, sink, options);
        transport.stream = Some(Arc::new(stream));
        transport
    }

    pub fn unconnected(
        id: SocketId,
        runtime: Handle,
        sink: Arc<dyn CompletionSink>,
        options: TransportOptions,
    ) -> Self {
        Self {
            id,
            stream: None,
            connecting: Arc::new(Mutex::new(None)),
            runtime,
            sink,
            options,
            tasks: Vec::new(),
        }
    }

    fn stream(&mut self) -> io::Result<Arc<TcpStream>> {
        if self.stream.is_none() {
            let connected = self
                .connecting
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.stream = connected.map(Arc::new);
        }
        self.stream
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is not connected"))
    }

    fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        let handle = self.runtime.spawn(task);
        self.tasks.push(handle.abort_handle());
    }
}

async fn bounded<T, F>(limit: Option<Duration>, what: &'static str, io: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, io)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out")))?,
        None => io.await,
    }
}

fn read_now(stream: &TcpStream, max: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; max];
    let n = stream.try_read(&mut buf)?;
    buf.truncate(n);
    Ok(Bytes::from(buf))
}

impl Transport for TcpTransport {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<IoStatus<()>> {
        let slot = Arc::clone(&self.connecting);
        let sink = Arc::clone(&self.sink);
        let id = self.id;
        let limit = self.options.send_timeout;

        self.spawn(async move {
            let result = bounded(limit, "connect", TcpStream::connect(addr))
                .await
                .map(|stream| {
                    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(stream);
                });
            sink.complete(id, Completion::Connected(result));
        });
        Ok(IoStatus::Pending)
    }

    fn receive(&mut self, max: usize) -> io::Result<IoStatus<Bytes>> {
        let stream = self.stream()?;
        match read_now(&stream, max) {
            Ok(data) => return Ok(IoStatus::Done(data)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let sink = Arc::clone(&self.sink);
        let id = self.id;
        let limit = self.options.receive_timeout;
        self.spawn(async move {
            let result = bounded(limit, "receive", async {
                loop {
                    stream.readable().await?;
                    match read_now(&stream, max) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        other => return other,
                    }
                }
            })
            .await;
            sink.complete(id, Completion::Received(result));
        });
        Ok(IoStatus::Pending)
    }

    fn send(&mut self, data: Bytes) -> io::Result<IoStatus<usize>> {
        let stream = self.stream()?;
        match stream.try_write(&data) {
            Ok(n) => return Ok(IoStatus::Done(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }

        let sink = Arc::clone(&self.sink);
        let id = self.id;
        let limit = self.options.send_timeout;
        self.spawn(async move {
            let result = bounded(limit, "send", async {
                loop {
                    stream.writable().await?;
                    match stream.try_write(&data) {
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                        other => return other,
                    }
                }
            })
            .await;
            sink.complete(id, Completion::Sent(result));
        });
        Ok(IoStatus::Pending)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        let stream = self.stream()?;
        SockRef::from(stream.as_ref()).shutdown(Shutdown::Write)
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(stream) = self.stream.take() {
            // outstanding waits may still hold a reference; shut the fd down now
            let _ = SockRef::from(stream.as_ref()).shutdown(Shutdown::Both);
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
