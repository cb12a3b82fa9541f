use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use super::adapter::{Committed, ParserAdapter, ParserEvent};
use super::parser::HeadInfo;
use super::request::HttpRequestHead;
use super::response::HttpResponseHead;
use super::transaction::{self, ConnectionSinks, RequestBody, RequestInfo, Responder, SegmentChain};
use crate::data::{DataConsumer, DataProducer, DataSubject, Discard, Disposable, Resume};
use crate::error::UsageError;
use crate::net::{SocketCx, SocketDelegate, SocketId};
use crate::server::ConnectionDelegate;

/// Application entry point for HTTP requests.
///
/// Called on the dispatch thread once a request's head has been parsed. The
/// body streams through `body`; the response goes back through `responder`,
/// from any thread and in any order relative to other requests.
pub trait RequestDelegate: Send + Sync + 'static {
    fn on_request(&self, head: HttpRequestHead, body: RequestBody, responder: Responder);
}

impl<F> RequestDelegate for F
where
    F: Fn(HttpRequestHead, RequestBody, Responder) + Send + Sync + 'static,
{
    fn on_request(&self, head: HttpRequestHead, body: RequestBody, responder: Responder) {
        self(head, body, responder)
    }
}

/// Accepts connections and speaks HTTP/1.1 on them.
pub struct HttpServer {
    delegate: Arc<dyn RequestDelegate>,
}

impl HttpServer {
    pub fn new<D: RequestDelegate>(delegate: D) -> Self {
        Self {
            delegate: Arc::new(delegate),
        }
    }
}

impl ConnectionDelegate for HttpServer {
    fn on_connection(&mut self, _id: SocketId, peer: SocketAddr) -> Box<dyn SocketDelegate> {
        Box::new(HttpConnection::new(Some(peer), Arc::clone(&self.delegate)))
    }

    fn on_error(&mut self, error: &io::Error) {
        error!(error = %error, "HTTP listener failed");
    }

    fn on_closed(&mut self) {
        info!("HTTP server closed");
    }
}

/// Per-connection HTTP state, driven by socket events.
pub struct HttpConnection {
    peer: Option<SocketAddr>,
    delegate: Arc<dyn RequestDelegate>,
    adapter: ParserAdapter,
    chain: SegmentChain,
    /// Request bodies still fed by the parser or waiting for a consumer.
    bodies: BTreeMap<u64, DataSubject>,
    /// Request whose body the parser is currently producing.
    receiving: Option<u64>,
    /// Body whose consumer last paused reading.
    paused_for: Option<u64>,
    accepting: bool,
}

impl HttpConnection {
    pub fn new(peer: Option<SocketAddr>, delegate: Arc<dyn RequestDelegate>) -> Self {
        Self {
            peer,
            delegate,
            adapter: ParserAdapter::new(peer.map(|addr| addr.ip())),
            chain: SegmentChain::new(),
            bodies: BTreeMap::new(),
            receiving: None,
            paused_for: None,
            accepting: true,
        }
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Responses still owed on this connection.
    pub fn pending_responses(&self) -> usize {
        self.chain.pending()
    }

    fn begin_request(&mut self, cx: &mut SocketCx<'_>, head: HttpRequestHead, info: HeadInfo) {
        if !self.accepting {
            debug!(socket = %cx.id(), method = %head.method, "ignoring request after connection close");
            self.receiving = None;
            return;
        }

        let seq = self.chain.push_request(RequestInfo {
            method: head.method.clone(),
            version: info.version,
            keep_alive: info.keep_alive,
            expects_continue: info.expects_continue,
        });
        debug!(socket = %cx.id(), seq, method = %head.method, target = %head.target, "request");

        let socket = cx.id();
        let scheduler = cx.scheduler().clone();
        let expects_continue = info.expects_continue;
        let continue_scheduler = scheduler.clone();
        self.bodies.insert(
            seq,
            DataSubject::new(move || {
                if expects_continue {
                    transaction::post_continue(&continue_scheduler, socket, seq);
                }
                Disposable::empty()
            }),
        );
        self.receiving = Some(seq);

        let body = RequestBody::new(socket, seq, scheduler.clone());
        let responder = Responder::new(socket, seq, scheduler);
        self.delegate.on_request(head, body, responder);

        if !info.keep_alive {
            self.chain.push_end();
            self.accepting = false;
        }
    }

    /// Returns false when the body's consumer paused reading.
    fn body_data(&mut self, chunk: Bytes, resume: Option<Resume>) -> bool {
        let Some(seq) = self.receiving else {
            return true;
        };
        let Some(subject) = self.bodies.get_mut(&seq) else {
            return true;
        };
        let offered = resume.is_some();
        match subject.on_data(chunk, resume) {
            Ok(true) => true,
            Ok(false) if offered => {
                self.paused_for = Some(seq);
                false
            }
            Ok(false) => true,
            Err(e) => {
                warn!(seq, error = %e, "dropping request body chunk");
                true
            }
        }
    }

    fn end_request(&mut self) {
        let Some(seq) = self.receiving.take() else {
            return;
        };
        self.chain.mark_request_ended(seq);
        if let Some(subject) = self.bodies.get_mut(&seq) {
            subject.on_end();
            if subject.is_connected() {
                self.bodies.remove(&seq);
            }
        }
    }

    fn drive(&mut self, cx: &mut SocketCx<'_>) {
        let sinks = ConnectionSinks {
            socket: cx.id(),
            scheduler: cx.scheduler().clone(),
        };
        if let Err(e) = self.chain.drive(cx, &sinks) {
            debug!(socket = %cx.id(), error = %e, "response write failed");
            self.teardown("connection failed while writing");
            cx.close();
            return;
        }
        self.reap_bodies();
    }

    /// Discards request bodies whose response is already complete.
    fn reap_bodies(&mut self) {
        let horizon = self.chain.horizon();
        let stale: Vec<u64> = self
            .bodies
            .range(..horizon)
            .filter(|(_, subject)| !subject.is_connected())
            .map(|(seq, _)| *seq)
            .collect();

        for seq in stale {
            let Some(subject) = self.bodies.get_mut(&seq) else {
                continue;
            };
            debug!(seq, buffered = subject.buffered(), "discarding unread request body");
            if let Ok(disposable) = subject.connect(Box::new(Discard)) {
                drop(disposable);
            }
            if subject.is_ended() {
                self.bodies.remove(&seq);
            }
        }
    }

    fn teardown(&mut self, reason: &str) {
        self.chain.fail();
        self.receiving = None;
        self.paused_for = None;
        for (_, mut subject) in std::mem::take(&mut self.bodies) {
            if !subject.is_ended() {
                subject.on_error(anyhow::anyhow!("{reason}"));
            }
        }
    }

    pub(crate) fn write_response(
        &mut self,
        cx: &mut SocketCx<'_>,
        seq: u64,
        head: HttpResponseHead,
        body: Option<Box<dyn DataProducer>>,
    ) -> Result<(), UsageError> {
        if !self.chain.write_response(seq, head, body)? {
            debug!(socket = %cx.id(), seq, "response for closed connection dropped");
            return Ok(());
        }
        self.drive(cx);
        Ok(())
    }

    pub(crate) fn write_continue(&mut self, cx: &mut SocketCx<'_>, seq: u64) {
        self.chain.write_continue(seq);
        self.drive(cx);
    }

    pub(crate) fn connect_body(&mut self, seq: u64, mut consumer: Box<dyn DataConsumer>) {
        let Some(subject) = self.bodies.get_mut(&seq) else {
            consumer.on_error(anyhow::anyhow!("request body is no longer available"));
            return;
        };
        match subject.connect(consumer) {
            Ok(disposable) => drop(disposable),
            Err(e) => warn!(seq, error = %e, "request body connected twice"),
        }
        if subject.is_ended() {
            self.bodies.remove(&seq);
        }
    }

    pub(crate) fn detach_body(&mut self, cx: &mut SocketCx<'_>, seq: u64) {
        self.bodies.remove(&seq);
        if self.paused_for == Some(seq) {
            self.paused_for = None;
            cx.resume_reading();
        }
    }

    pub(crate) fn on_body_data(&mut self, cx: &mut SocketCx<'_>, seq: u64, data: Bytes, resume: Option<Resume>) {
        self.chain.on_body_data(seq, data, resume);
        self.drive(cx);
    }

    pub(crate) fn on_body_end(&mut self, cx: &mut SocketCx<'_>, seq: u64) {
        self.chain.on_body_end(seq);
        self.drive(cx);
    }

    pub(crate) fn on_body_error(&mut self, cx: &mut SocketCx<'_>, seq: u64, error: anyhow::Error) {
        self.chain.on_body_error(seq, error);
        self.drive(cx);
    }
}

impl SocketDelegate for HttpConnection {
    fn on_data(&mut self, cx: &mut SocketCx<'_>, data: Bytes, resume: Resume) -> bool {
        let commit = match self.adapter.execute(&data) {
            Ok(commit) => commit,
            Err(e) => {
                warn!(socket = %cx.id(), error = %e, "malformed request, closing connection");
                self.teardown("malformed request");
                cx.close();
                return true;
            }
        };

        let mut resume = Some(resume);
        let mut ready = true;
        for Committed { event, may_pause } in commit {
            match event {
                ParserEvent::RequestHeaders { head, info } => self.begin_request(cx, head, info),
                ParserEvent::RequestBody(chunk) => {
                    let resume = if may_pause { resume.take() } else { None };
                    ready = self.body_data(chunk, resume);
                }
                ParserEvent::RequestEnded => self.end_request(),
            }
        }

        self.drive(cx);
        ready
    }

    fn on_end(&mut self, cx: &mut SocketCx<'_>) {
        if let Some(seq) = self.receiving.take() {
            if let Some(subject) = self.bodies.get_mut(&seq) {
                subject.on_error(anyhow::anyhow!("connection ended before the request body completed"));
            }
        }
        if !self.adapter.is_idle() {
            debug!(socket = %cx.id(), "peer ended mid-request");
        }
        self.accepting = false;
        self.chain.push_end();
        self.drive(cx);
    }

    fn on_drain(&mut self, cx: &mut SocketCx<'_>) {
        self.chain.on_drain();
        self.drive(cx);
    }

    fn on_error(&mut self, cx: &mut SocketCx<'_>, error: io::Error) {
        debug!(socket = %cx.id(), error = %error, "connection error");
        self.teardown("connection failed");
    }

    fn on_close(&mut self, cx: &mut SocketCx<'_>) {
        if self.chain.pending() > 0 {
            debug!(socket = %cx.id(), pending = self.chain.pending(), "connection closed with responses outstanding");
        }
        self.teardown("connection closed");
    }
}
