#![allow(dead_code)]

use sluice::Reactor;
use sluice::net::testing::{ScriptedTransport, Wire};
use sluice::net::{SocketDelegate, SocketId, TransportOptions};
use sluice::scheduler::{Scheduler, TracingDelegate};

/// A reactor driven by hand on the test thread.
pub struct Harness {
    pub scheduler: Scheduler<Reactor>,
    pub reactor: Reactor,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(TransportOptions::default())
    }

    pub fn with_options(options: TransportOptions) -> Self {
        let scheduler = Scheduler::new();
        let reactor = Reactor::new(scheduler.handle(), None, options);
        Self { scheduler, reactor }
    }

    /// Runs posted tasks until none are left.
    pub fn run(&mut self) -> usize {
        self.scheduler
            .run_until_idle(&mut self.reactor, &mut TracingDelegate)
            .unwrap()
    }

    /// Adds an already connected socket and lets it settle.
    pub fn accept(&mut self, delegate: Box<dyn SocketDelegate>) -> (SocketId, Wire) {
        let id = SocketId::next();
        let (transport, wire) = ScriptedTransport::new(id, self.reactor.completion_sink());
        self.reactor.adopt(id, Box::new(transport), delegate);
        self.run();
        (id, wire)
    }

    /// Like [`accept`](Self::accept), with data already waiting on the wire.
    pub fn accept_with(&mut self, delegate: Box<dyn SocketDelegate>, setup: impl FnOnce(&Wire)) -> (SocketId, Wire) {
        let id = SocketId::next();
        let (transport, wire) = ScriptedTransport::new(id, self.reactor.completion_sink());
        setup(&wire);
        self.reactor.adopt(id, Box::new(transport), delegate);
        self.run();
        (id, wire)
    }

    /// Adds a socket that still has to connect.
    pub fn open(&mut self, delegate: Box<dyn SocketDelegate>) -> (SocketId, Wire) {
        let id = SocketId::next();
        let (transport, wire) = ScriptedTransport::new(id, self.reactor.completion_sink());
        self.reactor.open(id, Box::new(transport), delegate);
        (id, wire)
    }
}
