//! One-shot producer/consumer bridge for body streams.
//!
//! Bodies flow as [`Bytes`] chunks from a [`DataProducer`] into a
//! [`DataConsumer`]. Backpressure is a boolean return from
//! [`DataConsumer::on_data`] plus a one-shot [`Resume`] continuation: a
//! consumer that returns `false` keeps the resume and fires it once it is
//! ready for more.
//!
//! [`DataSubject`] sits between a producer that starts emitting before
//! anyone listens and the consumer that attaches later.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::error::UsageError;

/// One-shot continuation handed to a consumer alongside a chunk.
pub struct Resume(Box<dyn FnOnce() + Send>);

impl Resume {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub fn resume(self) {
        (self.0)()
    }
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resume")
    }
}

/// Releases whatever a connection between producer and consumer holds.
#[derive(Default)]
pub struct Disposable(Option<Box<dyn FnOnce() + Send>>);

impl Disposable {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Some(Box::new(f)))
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn dispose(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Disposable").field(&self.0.is_some()).finish()
    }
}

/// Receiving end of a body stream.
pub trait DataConsumer: Send {
    /// Delivers one chunk.
    ///
    /// Returns `true` when the producer may continue immediately. Returning
    /// `false` is only meaningful when `resume` was supplied: the consumer
    /// keeps it and calls it exactly once when ready for more.
    fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> bool;

    fn on_error(&mut self, error: anyhow::Error);

    fn on_end(&mut self);
}

/// Sending end of a body stream. Connecting consumes the producer.
pub trait DataProducer: Send {
    fn connect(self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Disposable;
}

type Teardown = Box<dyn FnOnce() -> Disposable + Send>;

enum Subject {
    Buffering {
        chunks: Vec<Bytes>,
        error: Option<anyhow::Error>,
        resume: Option<Resume>,
        teardown: Teardown,
    },
    Connected(Box<dyn DataConsumer>),
    /// Transient state while `connect` replays into the consumer.
    Replaying,
}

/// Buffers a stream until its single consumer connects, then forwards it.
///
/// Before connection chunks are kept in order, and an error, end of stream
/// and at most one pending resume are remembered. On [`connect`](Self::connect)
/// the consumer receives the chunks, then the error, then end of stream;
/// finally the teardown action runs and its [`Disposable`] is returned.
pub struct DataSubject {
    state: Subject,
    ended: bool,
}

impl DataSubject {
    pub fn new<F>(teardown: F) -> Self
    where
        F: FnOnce() -> Disposable + Send + 'static,
    {
        Self {
            state: Subject::Buffering {
                chunks: Vec::new(),
                error: None,
                resume: None,
                teardown: Box::new(teardown),
            },
            ended: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.state, Subject::Buffering { .. })
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Number of chunks waiting for a consumer.
    pub fn buffered(&self) -> usize {
        match &self.state {
            Subject::Buffering { chunks, .. } => chunks.len(),
            _ => 0,
        }
    }

    /// Feeds one chunk. Same contract as [`DataConsumer::on_data`].
    pub fn on_data(&mut self, data: Bytes, resume: Option<Resume>) -> Result<bool, UsageError> {
        if self.ended {
            return Err(UsageError::DataAfterEnd);
        }

        match &mut self.state {
            Subject::Buffering {
                chunks,
                resume: pending,
                ..
            } => {
                if resume.is_some() && pending.is_some() {
                    return Err(UsageError::ResumePending);
                }
                chunks.push(data);
                match resume {
                    Some(resume) => {
                        *pending = Some(resume);
                        Ok(false)
                    }
                    None => Ok(true),
                }
            }
            Subject::Connected(consumer) => Ok(consumer.on_data(data, resume)),
            Subject::Replaying => Ok(true),
        }
    }

    pub fn on_error(&mut self, error: anyhow::Error) {
        match &mut self.state {
            Subject::Buffering { error: slot, .. } => {
                if slot.is_none() {
                    *slot = Some(error);
                }
            }
            Subject::Connected(consumer) => consumer.on_error(error),
            Subject::Replaying => {}
        }
    }

    /// Marks end of stream. Repeated calls are ignored.
    pub fn on_end(&mut self) {
        if std::mem::replace(&mut self.ended, true) {
            return;
        }
        if let Subject::Connected(consumer) = &mut self.state {
            consumer.on_end();
        }
    }

    pub fn connect(&mut self, mut consumer: Box<dyn DataConsumer>) -> Result<Disposable, UsageError> {
        let (chunks, error, resume, teardown) = match std::mem::replace(&mut self.state, Subject::Replaying) {
            Subject::Buffering {
                chunks,
                error,
                resume,
                teardown,
            } => (chunks, error, resume, teardown),
            other => {
                self.state = other;
                return Err(UsageError::ConsumerAlreadyConnected);
            }
        };

        // the pending resume travels with the last replayed chunk
        let pending = Arc::new(Mutex::new(resume));
        let last = chunks.len().saturating_sub(1);
        let mut ready = true;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let offered = if i == last && lock(&pending).is_some() {
                let cell = Arc::clone(&pending);
                Some(Resume::new(move || {
                    if let Some(resume) = lock(&cell).take() {
                        resume.resume();
                    }
                }))
            } else {
                None
            };
            ready = consumer.on_data(chunk, offered);
        }
        if ready {
            let resume = lock(&pending).take();
            if let Some(resume) = resume {
                resume.resume();
            }
        }

        if let Some(error) = error {
            consumer.on_error(error);
        }
        if self.ended {
            consumer.on_end();
        }

        self.state = Subject::Connected(consumer);
        Ok(teardown())
    }
}

impl fmt::Debug for DataSubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSubject")
            .field("connected", &self.is_connected())
            .field("buffered", &self.buffered())
            .field("ended", &self.ended)
            .finish()
    }
}

/// A body that is fully known up front.
pub struct FixedBody(Bytes);

impl FixedBody {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }
}

impl DataProducer for FixedBody {
    fn connect(self: Box<Self>, mut consumer: Box<dyn DataConsumer>) -> Disposable {
        if !self.0.is_empty() {
            consumer.on_data(self.0, None);
        }
        consumer.on_end();
        Disposable::empty()
    }
}

/// A body emitted chunk by chunk, honoring the consumer's backpressure.
pub struct ChunkedBody {
    chunks: VecDeque<Bytes>,
}

impl ChunkedBody {
    pub fn new<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
        }
    }
}

struct Pump {
    chunks: VecDeque<Bytes>,
    consumer: Option<Box<dyn DataConsumer>>,
    wake: bool,
    disposed: bool,
}

impl DataProducer for ChunkedBody {
    fn connect(self: Box<Self>, consumer: Box<dyn DataConsumer>) -> Disposable {
        let pump = Arc::new(Mutex::new(Pump {
            chunks: self.chunks,
            consumer: Some(consumer),
            wake: false,
            disposed: false,
        }));
        drive(&pump);

        Disposable::new(move || {
            let mut pump = lock(&pump);
            pump.disposed = true;
            pump.consumer = None;
        })
    }
}

fn drive(pump: &Arc<Mutex<Pump>>) {
    loop {
        let (chunk, mut consumer) = {
            let mut guard = lock(pump);
            if guard.disposed {
                return;
            }
            let Some(consumer) = guard.consumer.take() else {
                // resumed from inside on_data; the outer call picks this up
                guard.wake = true;
                return;
            };
            (guard.chunks.pop_front(), consumer)
        };

        let Some(chunk) = chunk else {
            consumer.on_end();
            return;
        };

        let next = Arc::clone(pump);
        let ready = consumer.on_data(chunk, Some(Resume::new(move || drive(&next))));

        let mut guard = lock(pump);
        if guard.disposed {
            return;
        }
        guard.consumer = Some(consumer);
        if !(ready || std::mem::take(&mut guard.wake)) {
            return;
        }
    }
}

/// Consumer that accepts and drops everything.
#[derive(Debug, Default)]
pub struct Discard;

impl DataConsumer for Discard {
    fn on_data(&mut self, _data: Bytes, _resume: Option<Resume>) -> bool {
        true
    }

    fn on_error(&mut self, _error: anyhow::Error) {}

    fn on_end(&mut self) {}
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
