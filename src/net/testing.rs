//! Scripted transport for driving sockets without the OS.
//!
//! A [`ScriptedTransport`] is paired with a [`Wire`] that the test holds.
//! Data pushed onto the wire is handed out synchronously when a receive is
//! issued, or completes the outstanding receive through the completion sink
//! when one is already waiting. Sends are recorded and can be accepted,
//! partially accepted or deferred until the test completes them.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;

use super::SocketId;
use super::transport::{Completion, CompletionSink, IoStatus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// Every send is accepted in full, synchronously.
    Accept,
    /// At most this many bytes are accepted per send, synchronously.
    Partial(usize),
    /// Sends stay in flight until [`Wire::complete_send`].
    Defer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Immediate,
    Defer,
}

enum Inbound {
    Data(Bytes),
    Error(io::ErrorKind),
}

struct WireState {
    id: SocketId,
    sink: Arc<dyn CompletionSink>,
    peer: SocketAddr,
    inbound: VecDeque<Inbound>,
    receive_waiting: bool,
    receives: usize,
    send_mode: SendMode,
    in_flight: Option<Bytes>,
    sent: Vec<u8>,
    connect_mode: ConnectMode,
    connects: Vec<SocketAddr>,
    shutdown: bool,
    closed: bool,
}

/// Test-side handle to a [`ScriptedTransport`].
#[derive(Clone)]
pub struct Wire(Rc<RefCell<WireState>>);

pub struct ScriptedTransport(Rc<RefCell<WireState>>);

impl ScriptedTransport {
    pub fn new(id: SocketId, sink: Arc<dyn CompletionSink>) -> (Self, Wire) {
        let state = Rc::new(RefCell::new(WireState {
            id,
            sink,
            peer: SocketAddr::from(([192, 0, 2, 1], 40000)),
            inbound: VecDeque::new(),
            receive_waiting: false,
            receives: 0,
            send_mode: SendMode::Accept,
            in_flight: None,
            sent: Vec::new(),
            connect_mode: ConnectMode::Immediate,
            connects: Vec::new(),
            shutdown: false,
            closed: false,
        }));
        (Self(Rc::clone(&state)), Wire(state))
    }
}

impl Wire {
    fn deliver(&self, item: Inbound) {
        let mut state = self.0.borrow_mut();
        if state.closed {
            return;
        }
        if state.receive_waiting {
            state.receive_waiting = false;
            let result = match item {
                Inbound::Data(data) => Ok(data),
                Inbound::Error(kind) => Err(io::Error::from(kind)),
            };
            state.sink.complete(state.id, Completion::Received(result));
        } else {
            state.inbound.push_back(item);
        }
    }

    pub fn push_read(&self, data: impl Into<Bytes>) {
        self.deliver(Inbound::Data(data.into()));
    }

    /// Peer half-close: the next receive yields zero bytes.
    pub fn push_eof(&self) {
        self.deliver(Inbound::Data(Bytes::new()));
    }

    pub fn push_error(&self, kind: io::ErrorKind) {
        self.deliver(Inbound::Error(kind));
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        self.0.borrow_mut().peer = peer;
    }

    /// Number of receive calls issued so far.
    pub fn receives(&self) -> usize {
        self.0.borrow().receives
    }

    pub fn receive_waiting(&self) -> bool {
        self.0.borrow().receive_waiting
    }

    pub fn set_send_mode(&self, mode: SendMode) {
        self.0.borrow_mut().send_mode = mode;
    }

    pub fn sent(&self) -> Vec<u8> {
        self.0.borrow().sent.clone()
    }

    pub fn sent_string(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow().sent).into_owned()
    }

    pub fn in_flight(&self) -> Option<Bytes> {
        self.0.borrow().in_flight.clone()
    }

    /// Accepts the deferred send in full and reports it through the sink.
    pub fn complete_send(&self) -> Option<usize> {
        let mut state = self.0.borrow_mut();
        let data = state.in_flight.take()?;
        state.sent.extend_from_slice(&data);
        state.sink.complete(state.id, Completion::Sent(Ok(data.len())));
        Some(data.len())
    }

    pub fn fail_send(&self, kind: io::ErrorKind) -> bool {
        let mut state = self.0.borrow_mut();
        if state.in_flight.take().is_none() {
            return false;
        }
        state.sink.complete(state.id, Completion::Sent(Err(io::Error::from(kind))));
        true
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) {
        self.0.borrow_mut().connect_mode = mode;
    }

    pub fn connects(&self) -> Vec<SocketAddr> {
        self.0.borrow().connects.clone()
    }

    pub fn complete_connect(&self, result: io::Result<()>) {
        let state = self.0.borrow();
        state.sink.complete(state.id, Completion::Connected(result));
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.borrow().shutdown
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().closed
    }
}

impl Transport for ScriptedTransport {
    fn connect(&mut self, addr: SocketAddr) -> io::Result<IoStatus<()>> {
        let mut state = self.0.borrow_mut();
        state.connects.push(addr);
        state.peer = addr;
        Ok(match state.connect_mode {
            ConnectMode::Immediate => IoStatus::Done(()),
            ConnectMode::Defer => IoStatus::Pending,
        })
    }

    fn receive(&mut self, max: usize) -> io::Result<IoStatus<Bytes>> {
        let mut state = self.0.borrow_mut();
        state.receives += 1;
        match state.inbound.pop_front() {
            Some(Inbound::Data(mut data)) => {
                if data.len() > max {
                    let rest = data.split_off(max);
                    state.inbound.push_front(Inbound::Data(rest));
                }
                Ok(IoStatus::Done(data))
            }
            Some(Inbound::Error(kind)) => Err(io::Error::from(kind)),
            None => {
                state.receive_waiting = true;
                Ok(IoStatus::Pending)
            }
        }
    }

    fn send(&mut self, data: Bytes) -> io::Result<IoStatus<usize>> {
        let mut state = self.0.borrow_mut();
        match state.send_mode {
            SendMode::Accept => {
                state.sent.extend_from_slice(&data);
                Ok(IoStatus::Done(data.len()))
            }
            SendMode::Partial(limit) => {
                let n = limit.min(data.len());
                state.sent.extend_from_slice(&data[..n]);
                Ok(IoStatus::Done(n))
            }
            SendMode::Defer => {
                state.in_flight = Some(data);
                Ok(IoStatus::Pending)
            }
        }
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.0.borrow_mut().shutdown = true;
        Ok(())
    }

    fn close(&mut self) {
        let mut state = self.0.borrow_mut();
        state.closed = true;
        state.receive_waiting = false;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.0.borrow().peer)
    }
}
