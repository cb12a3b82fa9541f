//! Full-duplex stream over one connection.
//!
//! A `Socket` owns the lifecycle state, the output buffer and the transport.
//! It never calls its delegate directly: every observable transition is
//! queued as a [`SocketEvent`] and the reactor delivers the queue in order
//! once the socket is back at rest. This keeps the read loop iterative and
//! lets the delegate write, end or close from inside any callback.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use bytes::Bytes;
use tracing::{debug, trace};

use super::buffer::OutputBuffer;
use super::state::{SocketPhase, SocketState};
use super::transport::{IoStatus, Transport};
use super::{AsAny, SocketId};
use crate::data::Resume;
use crate::error::{SocketError, UsageError};
use crate::reactor::Reactor;
use crate::scheduler::SchedulerHandle;

#[derive(Debug)]
pub enum SocketEvent {
    Connected,
    Data(Bytes),
    /// The peer half-closed its write side.
    End,
    /// The output buffer emptied after a write returned `Pending`.
    Drained,
    Error(io::Error),
    /// Always the last event a socket produces.
    Closed,
}

/// Whether the caller may write again right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Done,
    /// Wait for `on_drain` before writing again.
    Pending,
}

pub struct Socket {
    id: SocketId,
    state: SocketState,
    output: OutputBuffer,
    transport: Box<dyn Transport>,
    events: VecDeque<SocketEvent>,
    input_buffer_size: usize,
    receiving: bool,
    sending: bool,
    drain_pending: bool,
    paused: Option<u64>,
    deliveries: u64,
}

impl Socket {
    pub fn accepted(id: SocketId, transport: Box<dyn Transport>, input_buffer_size: usize) -> Self {
        Self::with_state(id, SocketState::accepted(), transport, input_buffer_size)
    }

    pub fn unconnected(id: SocketId, transport: Box<dyn Transport>, input_buffer_size: usize) -> Self {
        Self::with_state(id, SocketState::new(), transport, input_buffer_size)
    }

    fn with_state(
        id: SocketId,
        state: SocketState,
        transport: Box<dyn Transport>,
        input_buffer_size: usize,
    ) -> Self {
        Self {
            id,
            state,
            output: OutputBuffer::new(),
            transport,
            events: VecDeque::new(),
            input_buffer_size: input_buffer_size.max(1),
            receiving: false,
            sending: false,
            drain_pending: false,
            paused: None,
            deliveries: 0,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> &SocketState {
        &self.state
    }

    pub fn buffered(&self) -> usize {
        self.output.len()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.transport.peer_addr()
    }

    pub fn next_event(&mut self) -> Option<SocketEvent> {
        self.events.pop_front()
    }

    fn push_event(&mut self, event: SocketEvent) {
        if self.state.is_disposed() {
            return;
        }
        self.events.push_back(event);
    }

    pub fn connect(&mut self, addr: SocketAddr) -> Result<(), SocketError> {
        self.state.begin_connect()?;
        debug!(socket = %self.id, %addr, "connecting");
        match self.transport.connect(addr) {
            Ok(IoStatus::Done(())) => self.on_connected(Ok(())),
            Ok(IoStatus::Pending) => {}
            Err(e) => self.on_connected(Err(e)),
        }
        Ok(())
    }

    pub fn on_connected(&mut self, result: io::Result<()>) {
        if self.state.is_disposed() || self.state.phase() != SocketPhase::Connecting {
            return;
        }
        match result {
            Ok(()) => {
                if self.state.connect_succeeded() {
                    self.push_event(SocketEvent::Connected);
                }
            }
            Err(e) => {
                self.state.connect_failed();
                self.fail(e);
            }
        }
    }

    /// Queues `data` and starts sending if nothing is in flight.
    pub fn write(&mut self, data: Bytes) -> Result<WriteStatus, SocketError> {
        self.state.check_write()?;
        if self.drain_pending {
            return Err(UsageError::WritePending.into());
        }
        if data.is_empty() {
            return Ok(WriteStatus::Done);
        }

        trace!(socket = %self.id, len = data.len(), "write");
        self.output.push(data);
        self.state.set_buffer_non_empty(true);
        self.flush();

        if self.output.is_empty() || self.state.is_closed() {
            Ok(WriteStatus::Done)
        } else {
            self.drain_pending = true;
            Ok(WriteStatus::Pending)
        }
    }

    /// Sends buffered data until the buffer is empty or the OS pushes back.
    fn flush(&mut self) {
        while !self.sending && !self.state.is_closed() {
            let Some(chunk) = self.output.front().cloned() else {
                break;
            };
            match self.transport.send(chunk) {
                Ok(IoStatus::Done(0)) => {
                    self.fail(io::Error::from(io::ErrorKind::WriteZero));
                    return;
                }
                Ok(IoStatus::Done(n)) => {
                    trace!(socket = %self.id, sent = n, "send completed inline");
                    self.output.consume(n);
                }
                Ok(IoStatus::Pending) => self.sending = true,
                Err(e) => {
                    self.fail(e);
                    return;
                }
            }
        }

        if !self.sending && self.output.is_empty() {
            self.after_drain();
        }
    }

    pub fn on_sent(&mut self, result: io::Result<usize>) {
        if !self.sending || self.state.is_closed() {
            return;
        }
        self.sending = false;
        match result {
            Ok(0) => self.fail(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => {
                trace!(socket = %self.id, sent = n, "send completed");
                self.output.consume(n);
                self.flush();
            }
            Err(e) => self.fail(e),
        }
    }

    fn after_drain(&mut self) {
        self.state.set_buffer_non_empty(false);
        if std::mem::take(&mut self.drain_pending) {
            self.push_event(SocketEvent::Drained);
        }
        self.shutdown_if_due();
        self.close_if_done();
    }

    fn shutdown_if_due(&mut self) {
        if !self.state.should_shutdown() {
            return;
        }
        self.state.mark_shutdown();
        trace!(socket = %self.id, "shutting down write side");
        if let Err(e) = self.transport.shutdown_write() {
            // the peer may already be gone; the close below still applies
            debug!(socket = %self.id, error = %e, "shutdown failed");
        }
    }

    fn close_if_done(&mut self) {
        if self.state.should_close() {
            self.close_now();
        }
    }

    /// Ends the write direction once everything queued has been sent.
    pub fn end(&mut self) -> Result<(), SocketError> {
        self.state.end_write()?;
        if self.output.is_empty() && !self.sending {
            self.shutdown_if_due();
            self.close_if_done();
        }
        Ok(())
    }

    /// Closes immediately, dropping unsent data.
    pub fn close_now(&mut self) {
        if !self.state.mark_closed() {
            return;
        }
        debug!(socket = %self.id, "closed");
        self.output.clear();
        self.state.set_buffer_non_empty(false);
        self.drain_pending = false;
        self.receiving = false;
        self.sending = false;
        self.transport.close();
        self.push_event(SocketEvent::Closed);
    }

    /// Reports a fatal transport error, then closes.
    pub fn fail(&mut self, error: io::Error) {
        if self.state.is_closed() {
            return;
        }
        self.push_event(SocketEvent::Error(error));
        self.close_now();
    }

    pub fn on_received(&mut self, result: io::Result<Bytes>) {
        self.receiving = false;
        if self.state.is_closed() {
            return;
        }
        match result {
            Ok(data) if data.is_empty() => self.read_ended(),
            Ok(data) => {
                trace!(socket = %self.id, len = data.len(), "received");
                self.push_event(SocketEvent::Data(data));
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                debug!(socket = %self.id, "connection reset by peer");
                self.read_ended();
            }
            Err(e) => self.fail(e),
        }
    }

    fn read_ended(&mut self) {
        self.state.end_read();
        self.push_event(SocketEvent::End);
        self.close_if_done();
    }

    pub fn wants_receive(&self) -> bool {
        !self.receiving && self.paused.is_none() && self.events.is_empty() && self.state.can_receive()
    }

    /// Issues one receive. A synchronous result is queued as an event.
    pub fn start_receive(&mut self) {
        match self.transport.receive(self.input_buffer_size) {
            Ok(IoStatus::Done(data)) => self.on_received(Ok(data)),
            Ok(IoStatus::Pending) => self.receiving = true,
            Err(e) => self.on_received(Err(e)),
        }
    }

    /// Token identifying the data delivery about to be made.
    pub(crate) fn begin_delivery(&mut self) -> u64 {
        self.deliveries += 1;
        self.deliveries
    }

    pub(crate) fn pause_reading(&mut self, token: u64) {
        self.paused = Some(token);
    }

    /// Lifts the pause taken for `token`. Stale tokens are ignored.
    pub(crate) fn resume_reading(&mut self, token: u64) -> bool {
        if self.paused == Some(token) {
            self.paused = None;
            true
        } else {
            false
        }
    }

    pub(crate) fn unpause(&mut self) {
        self.paused = None;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn dispose(&mut self) {
        if !self.state.is_closed() {
            self.transport.close();
        }
        self.state.dispose();
        self.events.clear();
        self.output.clear();
    }
}

/// Per-connection event handler, called on the dispatch thread.
pub trait SocketDelegate: AsAny + Send {
    fn on_connected(&mut self, _cx: &mut SocketCx<'_>) {}

    /// Delivers received bytes. Returning `false` pauses reading until
    /// `resume` is called.
    fn on_data(&mut self, cx: &mut SocketCx<'_>, data: Bytes, resume: Resume) -> bool;

    fn on_end(&mut self, _cx: &mut SocketCx<'_>) {}

    fn on_drain(&mut self, _cx: &mut SocketCx<'_>) {}

    fn on_error(&mut self, _cx: &mut SocketCx<'_>, _error: io::Error) {}

    fn on_close(&mut self, _cx: &mut SocketCx<'_>) {}
}

/// What a delegate may do to its socket from inside a callback.
pub struct SocketCx<'a> {
    socket: &'a mut Socket,
    scheduler: &'a SchedulerHandle<Reactor>,
}

impl<'a> SocketCx<'a> {
    pub(crate) fn new(socket: &'a mut Socket, scheduler: &'a SchedulerHandle<Reactor>) -> Self {
        Self { socket, scheduler }
    }

    pub fn id(&self) -> SocketId {
        self.socket.id
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        self.socket
    }

    pub fn write(&mut self, data: Bytes) -> Result<WriteStatus, SocketError> {
        self.socket.write(data)
    }

    pub fn end(&mut self) -> Result<(), SocketError> {
        self.socket.end()
    }

    pub fn close(&mut self) {
        self.socket.close_now();
    }

    /// Clears any read pause, whichever delivery took it.
    pub fn resume_reading(&mut self) {
        self.socket.unpause();
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.peer_addr()
    }

    pub fn state(&self) -> &SocketState {
        self.socket.state()
    }

    pub fn buffered(&self) -> usize {
        self.socket.buffered()
    }

    pub fn write_ended(&self) -> bool {
        self.socket.state().flags().write_ended
    }

    pub fn scheduler(&self) -> &SchedulerHandle<Reactor> {
        self.scheduler
    }
}
