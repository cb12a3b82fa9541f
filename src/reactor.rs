//! Dispatch-thread state and the event loop facade.
//!
//! [`Reactor`] owns every socket and server record. It only ever runs on the
//! scheduler's dispatch thread, so none of its fields are locked. I/O that
//! completes on a runtime worker is handed back through
//! [`Reactor::complete`], posted as a task.
//!
//! The per-socket driver is [`Reactor::pump`]: deliver queued socket events
//! to the delegate, then issue the next receive if the socket wants one.
//! Receives that complete synchronously loop back into the same pump, up to
//! a budget, after which the pump yields by re-posting itself.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, Runtime};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::data::Resume;
use crate::error::{SocketError, UsageError};
use crate::http::connection::{HttpServer, RequestDelegate};
use crate::net::{
    Completion, CompletionSink, Socket, SocketCx, SocketDelegate, SocketEvent, SocketId, TcpTransport,
    Transport, TransportOptions,
};
use crate::scheduler::{Scheduler, SchedulerHandle, TracingDelegate, panic_message};
use crate::server::listener;
use crate::server::state::CloseOutcome;
use crate::server::{ConnectionDelegate, ServerControl, ServerHandle, ServerId};

/// Synchronous receives handled in one pump before yielding to other tasks.
const INLINE_READ_BUDGET: usize = 32;

struct SocketSlot {
    socket: Socket,
    delegate: Option<Box<dyn SocketDelegate>>,
    server: Option<ServerControl>,
}

struct ServerSlot {
    control: ServerControl,
    delegate: Box<dyn ConnectionDelegate>,
}

struct SchedulerSink(SchedulerHandle<Reactor>);

impl CompletionSink for SchedulerSink {
    fn complete(&self, socket: SocketId, completion: Completion) {
        self.0.post(move |reactor| {
            reactor.complete(socket, completion);
            Ok(())
        });
    }
}

pub struct Reactor {
    scheduler: SchedulerHandle<Reactor>,
    runtime: Option<Handle>,
    options: TransportOptions,
    sink: Arc<dyn CompletionSink>,
    sockets: HashMap<SocketId, SocketSlot>,
    servers: HashMap<ServerId, ServerSlot>,
}

impl Reactor {
    /// `runtime` runs OS I/O; without one only caller-supplied transports work.
    pub fn new(scheduler: SchedulerHandle<Reactor>, runtime: Option<Handle>, options: TransportOptions) -> Self {
        let sink: Arc<dyn CompletionSink> = Arc::new(SchedulerSink(scheduler.clone()));
        Self {
            scheduler,
            runtime,
            options,
            sink,
            sockets: HashMap::new(),
            servers: HashMap::new(),
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle<Reactor> {
        &self.scheduler
    }

    pub fn completion_sink(&self) -> Arc<dyn CompletionSink> {
        Arc::clone(&self.sink)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    pub fn contains(&self, id: SocketId) -> bool {
        self.sockets.contains_key(&id)
    }

    /// Registers an already connected transport and starts its read loop.
    pub fn adopt(&mut self, id: SocketId, transport: Box<dyn Transport>, delegate: Box<dyn SocketDelegate>) {
        self.insert(id, Socket::accepted(id, transport, self.options.input_buffer_size), delegate, None);
        self.pump(id);
    }

    /// Registers a transport that still has to connect.
    pub fn open(&mut self, id: SocketId, transport: Box<dyn Transport>, delegate: Box<dyn SocketDelegate>) {
        self.insert(id, Socket::unconnected(id, transport, self.options.input_buffer_size), delegate, None);
    }

    fn insert(
        &mut self,
        id: SocketId,
        socket: Socket,
        delegate: Box<dyn SocketDelegate>,
        server: Option<ServerControl>,
    ) {
        self.sockets.insert(
            id,
            SocketSlot {
                socket,
                delegate: Some(delegate),
                server,
            },
        );
    }

    pub fn connect(&mut self, id: SocketId, addr: SocketAddr) -> Result<(), SocketError> {
        let slot = self
            .sockets
            .get_mut(&id)
            .ok_or(UsageError::SocketDisposed)?;
        slot.socket.connect(addr)?;
        self.pump(id);
        Ok(())
    }

    /// Opens a TCP client socket on the I/O runtime and connects it.
    pub fn connect_tcp(&mut self, id: SocketId, addr: SocketAddr, delegate: Box<dyn SocketDelegate>) -> anyhow::Result<()> {
        let runtime = self.runtime.clone().context("reactor has no I/O runtime")?;
        let transport = TcpTransport::unconnected(id, runtime, self.completion_sink(), self.options.clone());
        self.open(id, Box::new(transport), delegate);
        self.connect(id, addr)?;
        Ok(())
    }

    /// Applies a completion reported by a transport. Completions for released
    /// sockets are dropped.
    pub fn complete(&mut self, id: SocketId, completion: Completion) {
        let Some(slot) = self.sockets.get_mut(&id) else {
            trace!(socket = %id, ?completion, "completion after release");
            return;
        };
        match completion {
            Completion::Connected(result) => slot.socket.on_connected(result),
            Completion::Received(result) => slot.socket.on_received(result),
            Completion::Sent(result) => slot.socket.on_sent(result),
        }
        self.pump(id);
    }

    /// Delivers queued events, then keeps the read loop going.
    pub fn pump(&mut self, id: SocketId) {
        let mut budget = INLINE_READ_BUDGET;
        loop {
            loop {
                let Some(slot) = self.sockets.get_mut(&id) else {
                    return;
                };
                let Some(event) = slot.socket.next_event() else {
                    break;
                };
                self.deliver(id, event);
            }

            let Some(slot) = self.sockets.get_mut(&id) else {
                return;
            };
            if !slot.socket.wants_receive() {
                return;
            }
            if budget == 0 {
                self.scheduler.post(move |reactor| {
                    reactor.pump(id);
                    Ok(())
                });
                return;
            }
            budget -= 1;
            slot.socket.start_receive();
        }
    }

    fn deliver(&mut self, id: SocketId, event: SocketEvent) {
        let Some(slot) = self.sockets.get_mut(&id) else {
            return;
        };
        let Some(mut delegate) = slot.delegate.take() else {
            return;
        };

        let closed = matches!(event, SocketEvent::Closed);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = SocketCx::new(&mut slot.socket, &self.scheduler);
            match event {
                SocketEvent::Connected => delegate.on_connected(&mut cx),
                SocketEvent::Data(data) => {
                    let token = cx.socket_mut().begin_delivery();
                    let resume = read_resume(&self.scheduler, id, token);
                    if !delegate.on_data(&mut cx, data, resume) {
                        trace!(socket = %id, "reading paused");
                        cx.socket_mut().pause_reading(token);
                    }
                }
                SocketEvent::End => delegate.on_end(&mut cx),
                SocketEvent::Drained => delegate.on_drain(&mut cx),
                SocketEvent::Error(e) => {
                    debug!(socket = %id, error = %e, "socket error");
                    delegate.on_error(&mut cx, e);
                }
                SocketEvent::Closed => delegate.on_close(&mut cx),
            }
        }));
        slot.delegate = Some(delegate);

        if let Err(payload) = outcome {
            error!(socket = %id, panic = panic_message(payload.as_ref()), "socket delegate panicked, closing");
            // Closed still reaches the delegate so it can tear down
            slot.socket.close_now();
        }
        if closed {
            self.release(id);
        }
    }

    /// Runs `f` against the socket's delegate, downcast to `D`, then pumps.
    ///
    /// Returns `None` when the socket is gone or its delegate is not a `D`.
    pub fn with_socket<D, R>(&mut self, id: SocketId, f: impl FnOnce(&mut D, &mut SocketCx<'_>) -> R) -> Option<R>
    where
        D: SocketDelegate + 'static,
    {
        let slot = self.sockets.get_mut(&id)?;
        let mut delegate = slot.delegate.take()?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            match delegate.as_mut().as_any_mut().downcast_mut::<D>() {
                Some(typed) => {
                    let mut cx = SocketCx::new(&mut slot.socket, &self.scheduler);
                    Some(f(typed, &mut cx))
                }
                None => None,
            }
        }));
        slot.delegate = Some(delegate);

        match outcome {
            Ok(result) => {
                self.pump(id);
                result
            }
            Err(payload) => {
                error!(socket = %id, panic = panic_message(payload.as_ref()), "socket delegate panicked, closing");
                slot.socket.close_now();
                self.pump(id);
                panic::resume_unwind(payload)
            }
        }
    }

    pub fn resume_reading(&mut self, id: SocketId, token: u64) {
        let Some(slot) = self.sockets.get_mut(&id) else {
            return;
        };
        if slot.socket.resume_reading(token) {
            trace!(socket = %id, "reading resumed");
            self.pump(id);
        }
    }

    pub fn close_socket(&mut self, id: SocketId) {
        if let Some(slot) = self.sockets.get_mut(&id) {
            slot.socket.close_now();
            self.pump(id);
        }
    }

    fn release(&mut self, id: SocketId) {
        let Some(mut slot) = self.sockets.remove(&id) else {
            return;
        };
        slot.socket.dispose();
        trace!(socket = %id, "released");

        if let Some(control) = slot.server {
            if control.connection_closed() {
                self.finish_server(control.id());
            }
        }
    }

    pub fn register_server(&mut self, control: ServerControl, delegate: Box<dyn ConnectionDelegate>) {
        self.servers.insert(control.id(), ServerSlot { control, delegate });
    }

    pub fn on_accepted(&mut self, server: ServerId, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.servers.get_mut(&server) else {
            return;
        };
        if let Err(e) = slot.control.connection_opened() {
            debug!(server = %server, %peer, error = %e, "dropping connection accepted while not listening");
            return;
        }
        let Some(runtime) = self.runtime.clone() else {
            error!(server = %server, "reactor has no I/O runtime");
            slot.control.connection_closed();
            return;
        };

        let id = SocketId::next();
        info!(server = %server, socket = %id, %peer, "accepted connection");
        let delegate = slot.delegate.on_connection(id, peer);
        let control = slot.control.clone();

        let transport = TcpTransport::accepted(id, stream, runtime, self.completion_sink(), self.options.clone());
        let socket = Socket::accepted(id, Box::new(transport), self.options.input_buffer_size);
        self.insert(id, socket, delegate, Some(control));
        self.pump(id);
    }

    pub fn on_listener_failed(&mut self, server: ServerId, error: io::Error) {
        let Some(slot) = self.servers.get_mut(&server) else {
            return;
        };
        slot.delegate.on_error(&error);
        match slot.control.close() {
            Ok(CloseOutcome::Closed) => self.finish_server(server),
            Ok(outcome) => debug!(server = %server, ?outcome, "listener failed while connections remain"),
            Err(e) => debug!(server = %server, error = %e, "listener failed after dispose"),
        }
    }

    /// Fires the closed notification. Runs at most once per server.
    pub fn finish_server(&mut self, server: ServerId) {
        if let Some(mut slot) = self.servers.remove(&server) {
            info!(server = %server, "server closed");
            slot.delegate.on_closed();
        }
    }

    /// Forgets a disposed server and closes its connections.
    pub fn dispose_server(&mut self, server: ServerId) {
        self.servers.remove(&server);
        let owned: Vec<SocketId> = self
            .sockets
            .iter()
            .filter(|(_, slot)| slot.server.as_ref().is_some_and(|c| c.id() == server))
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            self.close_socket(id);
        }
    }

    /// Closes every listener and connection.
    pub fn shutdown(&mut self) {
        let servers: Vec<ServerId> = self.servers.keys().copied().collect();
        for id in servers {
            if let Some(slot) = self.servers.get(&id) {
                if let Err(e) = slot.control.close() {
                    warn!(server = %id, error = %e, "close during shutdown");
                }
            }
        }

        let sockets: Vec<SocketId> = self.sockets.keys().copied().collect();
        for id in sockets {
            self.close_socket(id);
        }

        // servers with no connections left never hit the last-connection path
        let remaining: Vec<ServerId> = self.servers.keys().copied().collect();
        for id in remaining {
            self.finish_server(id);
        }
    }
}

fn read_resume(scheduler: &SchedulerHandle<Reactor>, id: SocketId, token: u64) -> Resume {
    let scheduler = scheduler.clone();
    Resume::new(move || {
        scheduler.post(move |reactor| {
            reactor.resume_reading(id, token);
            Ok(())
        });
    })
}

/// Owns the I/O runtime and the dispatch thread.
pub struct EventLoop {
    runtime: Option<Runtime>,
    scheduler: Scheduler<Reactor>,
    config: Config,
}

impl EventLoop {
    /// Builds the I/O runtime and starts the dispatch thread.
    ///
    /// # Arguments
    ///
    /// * `config` - Listen address, timeouts, backlog and buffer sizes
    ///
    /// # Returns
    ///
    /// The running event loop, or an error if the runtime or thread could not start.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("sluice-io")
            .enable_all()
            .build()
            .context("failed to build I/O runtime")?;

        let scheduler = Scheduler::new();
        let handle = runtime.handle().clone();
        let options = config.transport_options();
        scheduler.start(move |h| Reactor::new(h, Some(handle), options), TracingDelegate)?;

        Ok(Self {
            runtime: Some(runtime),
            scheduler,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> SchedulerHandle<Reactor> {
        self.scheduler.handle()
    }

    fn runtime(&self) -> anyhow::Result<&Runtime> {
        self.runtime.as_ref().context("event loop is shut down")
    }

    /// Binds `addr` and starts accepting on behalf of `delegate`.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address to bind; port 0 picks a free port
    /// * `delegate` - Decides what each accepted connection is driven by
    ///
    /// # Returns
    ///
    /// A `ServerHandle` carrying the bound address, or the bind error.
    pub fn listen<D>(&self, addr: SocketAddr, delegate: D) -> anyhow::Result<ServerHandle>
    where
        D: ConnectionDelegate + 'static,
    {
        let runtime = self.runtime()?;
        let control = ServerControl::new(ServerId::next());
        control.listen()?;

        let std_listener = listener::bind(addr, self.config.backlog)
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = std_listener.local_addr()?;

        let scheduler = self.scheduler.handle();
        let registered = control.clone();
        scheduler.post(move |reactor| {
            reactor.register_server(registered, Box::new(delegate));
            Ok(())
        });
        runtime.spawn(listener::accept_loop(std_listener, control.clone(), scheduler.clone()));

        Ok(ServerHandle::new(control, local_addr, scheduler))
    }

    /// Serves HTTP on the configured listen address.
    ///
    /// # Arguments
    ///
    /// * `delegate` - Called once per request with its head, body and responder
    ///
    /// # Returns
    ///
    /// The handle of the listening server.
    pub fn serve<D>(&self, delegate: D) -> anyhow::Result<ServerHandle>
    where
        D: RequestDelegate,
    {
        let addr = self.config.listen_socket_addr()?;
        self.listen(addr, HttpServer::new(delegate))
    }

    /// Opens a client connection. Connection failures reach the delegate.
    ///
    /// # Arguments
    ///
    /// * `addr` - Peer to dial
    /// * `delegate` - Receives the connected, data, end, error and close events
    ///
    /// # Returns
    ///
    /// The id the socket will be registered under.
    pub fn connect(&self, addr: SocketAddr, delegate: Box<dyn SocketDelegate>) -> SocketId {
        let id = SocketId::next();
        self.scheduler.post(move |reactor| reactor.connect_tcp(id, addr, delegate));
        id
    }

    /// Runs `future` to completion on the I/O runtime.
    ///
    /// # Returns
    ///
    /// The future's output, or an error once the loop is shut down.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> anyhow::Result<F::Output> {
        Ok(self.runtime()?.block_on(future))
    }

    /// Closes every socket and server, then stops the dispatch thread and the I/O runtime.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) -> anyhow::Result<()> {
        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };
        self.scheduler.post(|reactor| {
            reactor.shutdown();
            Ok(())
        });
        self.scheduler.stop();
        self.scheduler.join()?;
        runtime.shutdown_timeout(Duration::from_secs(1));
        info!("event loop shut down");
        Ok(())
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "event loop shutdown failed");
        }
    }
}
