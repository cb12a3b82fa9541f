//! In-order response delivery for pipelined requests.
//!
//! Every request on a connection appends a [`ResponseSegment`] to the
//! connection's [`SegmentChain`], numbered by arrival. Applications may
//! answer requests in any order; only the segment at the front of the chain
//! writes to the connection, and it hands over to the next one once its
//! response has been fully flushed. A terminal end segment finishes the
//! connection's write side after every earlier response has drained.
//!
//! ```text
//!   front                                 back
//!   [seq 3: streaming] → [seq 4: ready] → [seq 5: waiting] → [end]
//!        ▲ owns the wire
//! ```
//!
//! The chain writes one piece at a time and stops whenever the wire reports
//! `Pending`, resuming on drain. Body producers are connected only when
//! their segment reaches the front, and their backpressure continuations
//! are released only once the wire has taken the previous chunk.

use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, warn};

use super::connection::HttpConnection;
use super::request::{Method, Version};
use super::response::{HttpResponseHead, Response};
use super::writer::{self, CONTINUE, Framing, LAST_CHUNK, ResponsePlan};
use crate::data::{DataConsumer, DataProducer, Discard, Disposable, FixedBody, Resume};
use crate::error::{SocketError, UsageError};
use crate::net::{SocketCx, SocketId, WriteStatus};
use crate::reactor::Reactor;
use crate::scheduler::SchedulerHandle;

/// What the response side needs to know about its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub method: Method,
    pub version: Version,
    /// Decided when the request was parsed and never re-checked.
    pub keep_alive: bool,
    pub expects_continue: bool,
}

/// The connection as seen by the chain.
pub trait ResponseWire {
    fn write(&mut self, data: Bytes) -> Result<WriteStatus, SocketError>;
    fn end(&mut self) -> Result<(), SocketError>;
    fn close(&mut self);
    fn write_ended(&self) -> bool;
}

impl ResponseWire for SocketCx<'_> {
    fn write(&mut self, data: Bytes) -> Result<WriteStatus, SocketError> {
        SocketCx::write(self, data)
    }

    fn end(&mut self) -> Result<(), SocketError> {
        SocketCx::end(self)
    }

    fn close(&mut self) {
        SocketCx::close(self)
    }

    fn write_ended(&self) -> bool {
        SocketCx::write_ended(self)
    }
}

/// Creates the consumer a response body producer is connected to.
pub trait BodySinks {
    fn sink(&self, seq: u64) -> Box<dyn DataConsumer>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Connect,
    Body,
    Trailer,
    Done,
}

enum Step {
    Blocked,
    Progress,
    Wrote(WriteStatus),
    Finished { close: bool },
    Abort(anyhow::Error),
}

/// One response's slot in the chain.
pub struct ResponseSegment {
    request: RequestInfo,
    request_ended: bool,
    continue_requested: bool,
    continue_written: bool,
    response: Option<(HttpResponseHead, Option<Box<dyn DataProducer>>)>,
    responded: bool,
    phase: Phase,
    plan: ResponsePlan,
    producer: Option<Box<dyn DataProducer>>,
    backlog: VecDeque<Bytes>,
    body_ended: bool,
    body_error: Option<anyhow::Error>,
    held_resume: Option<Resume>,
    disposable: Option<Disposable>,
}

impl ResponseSegment {
    fn new(request: RequestInfo) -> Self {
        Self {
            request,
            request_ended: false,
            continue_requested: false,
            continue_written: false,
            response: None,
            responded: false,
            phase: Phase::Waiting,
            plan: ResponsePlan {
                framing: Framing::None,
                close_after: false,
            },
            producer: None,
            backlog: VecDeque::new(),
            body_ended: false,
            body_error: None,
            held_resume: None,
            disposable: None,
        }
    }

    fn step(&mut self, seq: u64, wire: &mut dyn ResponseWire, sinks: &dyn BodySinks) -> Result<Step, SocketError> {
        match self.phase {
            Phase::Waiting => {
                if self.continue_requested && !self.continue_written {
                    self.continue_written = true;
                    debug!(seq, "writing 100 Continue");
                    return Ok(Step::Wrote(wire.write(Bytes::from_static(CONTINUE))?));
                }
                let Some((mut head, body)) = self.response.take() else {
                    return Ok(Step::Blocked);
                };

                // a client still waiting for 100 Continue may or may not send
                // its body, so the connection cannot be reused
                let force_close = self.request.expects_continue && !self.continue_written && !self.request_ended;
                self.plan = writer::prepare(&mut head, &self.request, body.is_some(), force_close);
                self.producer = match self.plan.framing {
                    Framing::None => None,
                    _ => body,
                };
                self.phase = if self.producer.is_some() {
                    Phase::Connect
                } else {
                    Phase::Done
                };
                debug!(seq, status = head.status.as_u16(), framing = ?self.plan.framing, "writing response head");
                Ok(Step::Wrote(wire.write(writer::render_head(&head))?))
            }
            Phase::Connect => {
                if let Some(producer) = self.producer.take() {
                    self.disposable = Some(producer.connect(sinks.sink(seq)));
                }
                self.phase = Phase::Body;
                Ok(Step::Progress)
            }
            Phase::Body => {
                if let Some(chunk) = self.backlog.pop_front() {
                    let framed = match self.plan.framing {
                        Framing::Chunked => writer::frame_chunk(&chunk),
                        _ => chunk,
                    };
                    return Ok(Step::Wrote(wire.write(framed)?));
                }
                if let Some(error) = self.body_error.take() {
                    return Ok(Step::Abort(error));
                }
                if self.body_ended {
                    self.phase = Phase::Trailer;
                    return Ok(Step::Progress);
                }
                if let Some(resume) = self.held_resume.take() {
                    resume.resume();
                }
                Ok(Step::Blocked)
            }
            Phase::Trailer => {
                self.phase = Phase::Done;
                if self.plan.framing == Framing::Chunked {
                    return Ok(Step::Wrote(wire.write(Bytes::from_static(LAST_CHUNK))?));
                }
                Ok(Step::Progress)
            }
            Phase::Done => Ok(Step::Finished {
                close: self.plan.close_after,
            }),
        }
    }

    fn dispose(&mut self) {
        self.held_resume = None;
        self.producer = None;
        if let Some(disposable) = self.disposable.take() {
            disposable.dispose();
        }
    }
}

enum Segment {
    Response { seq: u64, segment: ResponseSegment },
    End,
}

/// Index-addressed queue of the segments of one connection.
#[derive(Default)]
pub struct SegmentChain {
    segments: VecDeque<Segment>,
    next_seq: u64,
    wire_busy: bool,
    finished: bool,
}

impl SegmentChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment for the next request and returns its sequence number.
    pub fn push_request(&mut self, request: RequestInfo) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if !self.finished && !self.has_end() {
            self.segments.push_back(Segment::Response {
                seq,
                segment: ResponseSegment::new(request),
            });
        }
        seq
    }

    /// Appends the terminal segment. Later requests get no segment.
    pub fn push_end(&mut self) {
        if !self.finished && !self.has_end() {
            self.segments.push_back(Segment::End);
        }
    }

    fn has_end(&self) -> bool {
        matches!(self.segments.back(), Some(Segment::End))
    }

    /// Lowest sequence number whose response has not completed.
    pub fn horizon(&self) -> u64 {
        match self.segments.front() {
            Some(Segment::Response { seq, .. }) => *seq,
            _ => self.next_seq,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of responses still owed.
    pub fn pending(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Response { .. }))
            .count()
    }

    fn segment_mut(&mut self, seq: u64) -> Option<&mut ResponseSegment> {
        self.segments.iter_mut().find_map(|s| match s {
            Segment::Response { seq: s, segment } if *s == seq => Some(segment),
            _ => None,
        })
    }

    /// Supplies the response for `seq`.
    ///
    /// Returns `Ok(false)` when the segment is gone because the connection
    /// was torn down; the response is dropped.
    pub fn write_response(
        &mut self,
        seq: u64,
        head: HttpResponseHead,
        body: Option<Box<dyn DataProducer>>,
    ) -> Result<bool, UsageError> {
        let Some(segment) = self.segment_mut(seq) else {
            return Ok(false);
        };
        if segment.responded {
            return Err(UsageError::ResponseAlreadyWritten);
        }
        segment.responded = true;
        segment.response = Some((head, body));
        Ok(true)
    }

    /// Asks for `100 Continue` on `seq`. Ignored once its response has started.
    pub fn write_continue(&mut self, seq: u64) {
        if let Some(segment) = self.segment_mut(seq) {
            if segment.phase == Phase::Waiting && segment.response.is_none() {
                segment.continue_requested = true;
            }
        }
    }

    pub fn mark_request_ended(&mut self, seq: u64) {
        if let Some(segment) = self.segment_mut(seq) {
            segment.request_ended = true;
        }
    }

    pub fn on_body_data(&mut self, seq: u64, data: Bytes, resume: Option<Resume>) {
        let Some(segment) = self.segment_mut(seq) else {
            return;
        };
        if segment.body_ended {
            warn!(seq, "response body data after end");
            return;
        }
        segment.backlog.push_back(data);
        if let Some(resume) = resume {
            if let Some(previous) = segment.held_resume.replace(resume) {
                previous.resume();
            }
        }
    }

    pub fn on_body_end(&mut self, seq: u64) {
        if let Some(segment) = self.segment_mut(seq) {
            segment.body_ended = true;
        }
    }

    pub fn on_body_error(&mut self, seq: u64, error: anyhow::Error) {
        if let Some(segment) = self.segment_mut(seq) {
            segment.body_error.get_or_insert(error);
        }
    }

    pub fn on_drain(&mut self) {
        self.wire_busy = false;
    }

    /// Drops every remaining segment. The chain accepts nothing afterwards.
    pub fn fail(&mut self) {
        self.finished = true;
        for segment in self.segments.drain(..) {
            if let Segment::Response { mut segment, .. } = segment {
                segment.dispose();
            }
        }
    }

    /// Lets the front segments write until one blocks or the wire pushes back.
    pub fn drive(&mut self, wire: &mut dyn ResponseWire, sinks: &dyn BodySinks) -> Result<(), SocketError> {
        loop {
            if self.wire_busy || self.finished {
                return Ok(());
            }
            let step = match self.segments.front_mut() {
                None => return Ok(()),
                Some(Segment::End) => {
                    debug!("all responses written, ending connection");
                    self.fail();
                    if !wire.write_ended() {
                        wire.end()?;
                    }
                    return Ok(());
                }
                Some(Segment::Response { seq, segment }) => segment.step(*seq, wire, sinks)?,
            };

            match step {
                Step::Blocked => return Ok(()),
                Step::Progress | Step::Wrote(WriteStatus::Done) => {}
                Step::Wrote(WriteStatus::Pending) => self.wire_busy = true,
                Step::Finished { close } => {
                    if let Some(Segment::Response { seq, mut segment }) = self.segments.pop_front() {
                        debug!(seq, close, "response complete");
                        segment.dispose();
                    }
                    if close {
                        self.fail();
                        if !wire.write_ended() {
                            wire.end()?;
                        }
                        return Ok(());
                    }
                }
                Step::Abort(error) => {
                    warn!(error = %error, "response body failed, closing connection");
                    self.fail();
                    wire.close();
                    return Ok(());
                }
            }
        }
    }
}

/// Sends the response for one request. Accepts exactly one response.
///
/// Dropping a responder without responding answers the request with
/// `500 Internal Server Error`, so later pipelined responses are not stuck.
pub struct Responder {
    socket: SocketId,
    seq: u64,
    scheduler: Option<SchedulerHandle<Reactor>>,
}

impl Responder {
    pub(crate) fn new(socket: SocketId, seq: u64, scheduler: SchedulerHandle<Reactor>) -> Self {
        Self {
            socket,
            seq,
            scheduler: Some(scheduler),
        }
    }

    pub fn socket(&self) -> SocketId {
        self.socket
    }

    /// Position of the request on its connection, starting at 0.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Queues the final response for this request.
    ///
    /// # Arguments
    ///
    /// * `head` - Status and headers; framing headers are filled in if missing
    /// * `body` - Producer for the body, or `None` for an empty one
    ///
    /// Responses are written in request order, so this one may wait behind
    /// earlier requests on the same connection.
    pub fn respond(mut self, head: HttpResponseHead, body: Option<Box<dyn DataProducer>>) {
        if let Some(scheduler) = self.scheduler.take() {
            post_response(&scheduler, self.socket, self.seq, head, body);
        }
    }

    /// Responds with a body that is fully known.
    ///
    /// # Arguments
    ///
    /// * `response` - Head and complete body; an empty body sends no payload
    pub fn send(self, response: Response) {
        let Response { head, body } = response;
        let body: Option<Box<dyn DataProducer>> = if body.is_empty() {
            None
        } else {
            Some(Box::new(FixedBody::new(body)))
        };
        self.respond(head, body);
    }

    /// Requests an interim `100 Continue`, written as soon as this
    /// request's segment owns the connection.
    ///
    /// Ignored when the final response head has already been written. Call
    /// it before `respond` when streaming a body the client is holding back.
    pub fn send_continue(&self) {
        if let Some(scheduler) = &self.scheduler {
            post_continue(scheduler, self.socket, self.seq);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            warn!(socket = %self.socket, seq = self.seq, "responder dropped without a response");
            let Response { head, body } = Response::internal_error();
            post_response(
                &scheduler,
                self.socket,
                self.seq,
                head,
                Some(Box::new(FixedBody::new(body))),
            );
        }
    }
}

fn post_response(
    scheduler: &SchedulerHandle<Reactor>,
    socket: SocketId,
    seq: u64,
    head: HttpResponseHead,
    body: Option<Box<dyn DataProducer>>,
) {
    scheduler.post(move |reactor| {
        reactor
            .with_socket::<HttpConnection, _>(socket, |conn, cx| conn.write_response(cx, seq, head, body))
            .transpose()?;
        Ok(())
    });
}

pub(crate) fn post_continue(scheduler: &SchedulerHandle<Reactor>, socket: SocketId, seq: u64) {
    scheduler.post(move |reactor| {
        reactor.with_socket::<HttpConnection, _>(socket, |conn, cx| conn.write_continue(cx, seq));
        Ok(())
    });
}

/// The body of one request, readable once.
///
/// Connecting a consumer to a request that carries `Expect: 100-continue`
/// sends the interim response. A body nobody connects to is discarded once
/// the request's response has completed.
pub struct RequestBody {
    socket: SocketId,
    seq: u64,
    scheduler: SchedulerHandle<Reactor>,
}

impl RequestBody {
    pub(crate) fn new(socket: SocketId, seq: u64, scheduler: SchedulerHandle<Reactor>) -> Self {
        Self { socket, seq, scheduler }
    }

    /// Reads and drops the whole body.
    ///
    /// The connection keeps parsing past it, so a pipelined request behind
    /// this one is not held up.
    pub fn discard(self) {
        drop(Box::new(self).connect(Box::new(Discard)));
    }
}

impl DataProducer for RequestBody {
    /// Streams the body into `consumer`.
    ///
    /// # Arguments
    ///
    /// * `consumer` - Receives each chunk, then exactly one end or error
    ///
    /// # Returns
    ///
    /// A `Disposable` whose `dispose` detaches the consumer.
    fn connect(self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Disposable {
        let Self { socket, seq, scheduler } = *self;

        scheduler.post(move |reactor| {
            let mut consumer = Some(consumer);
            reactor.with_socket::<HttpConnection, _>(socket, |conn, _cx| {
                if let Some(consumer) = consumer.take() {
                    conn.connect_body(seq, consumer);
                }
            });
            if let Some(mut consumer) = consumer {
                consumer.on_error(anyhow::anyhow!("connection closed before the request body was read"));
            }
            Ok(())
        });

        Disposable::new(move || {
            scheduler.post(move |reactor| {
                reactor.with_socket::<HttpConnection, _>(socket, |conn, cx| conn.detach_body(cx, seq));
                Ok(())
            });
        })
    }
}

/// Forwards a response body producer's output to its segment.
///
/// Always takes the producer's continuation, so at most one chunk per
/// producer is in flight between the producer and the wire.
struct ResponseBodySink {
    socket: SocketId,
    seq: u64,
    scheduler: SchedulerHandle<Reactor>,
}

impl DataConsumer for ResponseBodySink {
    fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> bool {
        let ready = resume.is_none();
        let (socket, seq) = (self.socket, self.seq);
        self.scheduler.post(move |reactor| {
            reactor.with_socket::<HttpConnection, _>(socket, |conn, cx| conn.on_body_data(cx, seq, data, resume));
            Ok(())
        });
        ready
    }

    fn on_error(&mut self, error: anyhow::Error) {
        let (socket, seq) = (self.socket, self.seq);
        self.scheduler.post(move |reactor| {
            reactor.with_socket::<HttpConnection, _>(socket, |conn, cx| conn.on_body_error(cx, seq, error));
            Ok(())
        });
    }

    fn on_end(&mut self) {
        let (socket, seq) = (self.socket, self.seq);
        self.scheduler.post(move |reactor| {
            reactor.with_socket::<HttpConnection, _>(socket, |conn, cx| conn.on_body_end(cx, seq));
            Ok(())
        });
    }
}

pub(crate) struct ConnectionSinks {
    pub(crate) socket: SocketId,
    pub(crate) scheduler: SchedulerHandle<Reactor>,
}

impl BodySinks for ConnectionSinks {
    fn sink(&self, seq: u64) -> Box<dyn DataConsumer> {
        Box::new(ResponseBodySink {
            socket: self.socket,
            seq,
            scheduler: self.scheduler.clone(),
        })
    }
}
