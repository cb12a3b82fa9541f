mod common;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use common::Harness;
use sluice::data::Resume;
use sluice::error::{SocketError, UsageError};
use sluice::net::testing::{ConnectMode, SendMode};
use sluice::net::{SocketCx, SocketDelegate, SocketPhase, TransportOptions, WriteStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Connected,
    Data(String),
    End,
    Drain,
    Error(io::ErrorKind),
    Close,
}

#[derive(Clone, Copy, Default)]
enum OnEnd {
    #[default]
    Nothing,
    ReplyAndEnd,
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
    held: Arc<Mutex<Vec<Resume>>>,
    pause: bool,
    on_end: OnEnd,
}

impl Recorder {
    fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    fn release(&self) {
        let held: Vec<Resume> = self.held.lock().unwrap().drain(..).collect();
        for resume in held {
            resume.resume();
        }
    }
}

impl SocketDelegate for Recorder {
    fn on_connected(&mut self, _cx: &mut SocketCx<'_>) {
        self.seen.lock().unwrap().push(Seen::Connected);
    }

    fn on_data(&mut self, _cx: &mut SocketCx<'_>, data: Bytes, resume: Resume) -> bool {
        self.seen
            .lock()
            .unwrap()
            .push(Seen::Data(String::from_utf8_lossy(&data).into_owned()));
        if self.pause {
            self.held.lock().unwrap().push(resume);
            return false;
        }
        true
    }

    fn on_end(&mut self, cx: &mut SocketCx<'_>) {
        self.seen.lock().unwrap().push(Seen::End);
        if let OnEnd::ReplyAndEnd = self.on_end {
            cx.write(Bytes::from("bye")).unwrap();
            cx.end().unwrap();
        }
    }

    fn on_drain(&mut self, _cx: &mut SocketCx<'_>) {
        self.seen.lock().unwrap().push(Seen::Drain);
    }

    fn on_error(&mut self, _cx: &mut SocketCx<'_>, error: io::Error) {
        self.seen.lock().unwrap().push(Seen::Error(error.kind()));
    }

    fn on_close(&mut self, _cx: &mut SocketCx<'_>) {
        self.seen.lock().unwrap().push(Seen::Close);
    }
}

fn data(s: &str) -> Seen {
    Seen::Data(s.to_string())
}

#[test]
fn test_socket_delivers_reads_in_order() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (_, wire) = h.accept_with(Box::new(rec.clone()), |wire| {
        wire.push_read("hello");
        wire.push_read("world");
    });

    assert_eq!(rec.seen(), vec![data("hello"), data("world")]);
    assert!(wire.receive_waiting());

    wire.push_read("later");
    h.run();
    assert_eq!(rec.seen().last(), Some(&data("later")));
}

#[test]
fn test_socket_reads_at_most_input_buffer_size() {
    let mut h = Harness::with_options(TransportOptions {
        input_buffer_size: 4,
        ..TransportOptions::default()
    });
    let rec = Recorder::default();
    h.accept_with(Box::new(rec.clone()), |wire| wire.push_read("abcdefghij"));

    assert_eq!(rec.seen(), vec![data("abcd"), data("efgh"), data("ij")]);
}

#[test]
fn test_socket_zero_byte_read_is_end_of_stream() {
    let mut h = Harness::new();
    let rec = Recorder {
        on_end: OnEnd::ReplyAndEnd,
        ..Recorder::default()
    };
    let (_, wire) = h.accept(Box::new(rec.clone()));

    wire.push_eof();
    h.run();

    assert_eq!(rec.seen(), vec![Seen::End, Seen::Close]);
    assert_eq!(wire.sent_string(), "bye");
    assert!(wire.is_shutdown());
    assert!(wire.is_closed());
    assert_eq!(h.reactor.socket_count(), 0);
}

#[test]
fn test_socket_connection_reset_is_end_of_stream() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.accept(Box::new(rec.clone()));

    wire.push_error(io::ErrorKind::ConnectionReset);
    h.run();

    assert_eq!(rec.seen(), vec![Seen::End]);
    // the write side is still usable
    let status = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("late")))
        .unwrap();
    assert!(matches!(status, Ok(WriteStatus::Done)));
    assert_eq!(wire.sent_string(), "late");
}

#[test]
fn test_socket_read_error_reports_then_closes() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (_, wire) = h.accept(Box::new(rec.clone()));

    wire.push_error(io::ErrorKind::TimedOut);
    h.run();

    assert_eq!(rec.seen(), vec![Seen::Error(io::ErrorKind::TimedOut), Seen::Close]);
    assert!(wire.is_closed());
    assert_eq!(h.reactor.socket_count(), 0);
}

#[test]
fn test_socket_write_backpressure_and_drain() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.accept(Box::new(rec.clone()));
    wire.set_send_mode(SendMode::Defer);

    let first = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("one")))
        .unwrap();
    assert!(matches!(first, Ok(WriteStatus::Pending)));

    let second = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("two")))
        .unwrap();
    assert!(matches!(second, Err(SocketError::Usage(UsageError::WritePending))));
    assert_eq!(wire.in_flight().as_deref(), Some(&b"one"[..]));

    wire.set_send_mode(SendMode::Accept);
    assert_eq!(wire.complete_send(), Some(3));
    h.run();
    assert_eq!(rec.seen(), vec![Seen::Drain]);

    let third = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("three")))
        .unwrap();
    assert!(matches!(third, Ok(WriteStatus::Done)));
    assert_eq!(wire.sent_string(), "onethree");
}

#[test]
fn test_socket_partial_sends_keep_order() {
    let mut h = Harness::new();
    let (id, wire) = h.accept(Box::new(Recorder::default()));
    wire.set_send_mode(SendMode::Partial(3));

    let status = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("hello world")))
        .unwrap();

    assert!(matches!(status, Ok(WriteStatus::Done)));
    assert_eq!(wire.sent_string(), "hello world");
}

#[test]
fn test_socket_end_waits_for_buffer_then_shuts_down() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.accept(Box::new(rec.clone()));
    wire.set_send_mode(SendMode::Defer);

    h.reactor
        .with_socket::<Recorder, _>(id, |_, cx| {
            cx.write(Bytes::from("abc")).unwrap();
            cx.end().unwrap();
            assert!(matches!(
                cx.write(Bytes::from("x")),
                Err(SocketError::Usage(UsageError::WriteAfterEnd))
            ));
            assert!(matches!(cx.end(), Err(SocketError::Usage(UsageError::AlreadyEnded))));
        })
        .unwrap();
    assert!(!wire.is_shutdown());

    wire.complete_send();
    h.run();
    assert!(wire.is_shutdown());
    assert!(!wire.is_closed());

    wire.push_eof();
    h.run();
    assert!(wire.is_closed());
    assert_eq!(rec.seen(), vec![Seen::Drain, Seen::End, Seen::Close]);
}

#[test]
fn test_socket_close_drops_unsent_data() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.accept(Box::new(rec.clone()));
    wire.set_send_mode(SendMode::Defer);

    h.reactor
        .with_socket::<Recorder, _>(id, |_, cx| {
            cx.write(Bytes::from("never")).unwrap();
            cx.close();
            cx.close();
        })
        .unwrap();
    h.run();

    assert_eq!(rec.seen(), vec![Seen::Close]);
    assert!(wire.is_closed());
    assert!(wire.sent().is_empty());
    assert!(!h.reactor.contains(id));

    // a completion for a released socket is ignored
    wire.complete_send();
    h.run();
}

#[test]
fn test_socket_pause_and_resume_reading() {
    let mut h = Harness::new();
    let rec = Recorder {
        pause: true,
        ..Recorder::default()
    };
    let (_, wire) = h.accept_with(Box::new(rec.clone()), |wire| {
        wire.push_read("first");
        wire.push_read("second");
    });

    assert_eq!(rec.seen(), vec![data("first")]);
    let receives = wire.receives();

    rec.release();
    h.run();
    assert_eq!(rec.seen(), vec![data("first"), data("second")]);
    assert!(wire.receives() > receives);
}

#[test]
fn test_socket_stale_resume_is_ignored() {
    let mut h = Harness::new();
    let rec = Recorder {
        pause: true,
        ..Recorder::default()
    };
    let (id, wire) = h.accept_with(Box::new(rec.clone()), |wire| wire.push_read("first"));

    // resuming by hand leaves the delivery's own resume stale
    h.reactor.with_socket::<Recorder, _>(id, |_, cx| cx.resume_reading()).unwrap();
    wire.push_read("second");
    h.run();
    assert_eq!(rec.seen(), vec![data("first"), data("second")]);

    let held: Vec<Resume> = rec.held.lock().unwrap().drain(..).collect();
    let mut held = held.into_iter();
    held.next().unwrap().resume();
    wire.push_read("third");
    h.run();
    // still paused by the second delivery
    assert_eq!(rec.seen().len(), 2);

    held.next().unwrap().resume();
    h.run();
    assert_eq!(rec.seen().last(), Some(&data("third")));
}

#[test]
fn test_socket_connect() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.open(Box::new(rec.clone()));
    wire.set_connect_mode(ConnectMode::Defer);
    let addr: SocketAddr = "198.51.100.7:80".parse().unwrap();

    let err = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| cx.write(Bytes::from("early")))
        .unwrap();
    assert!(matches!(err, Err(SocketError::Usage(UsageError::NotConnected))));

    h.reactor.connect(id, addr).unwrap();
    assert_eq!(wire.connects(), vec![addr]);
    assert!(matches!(
        h.reactor.connect(id, addr),
        Err(SocketError::Usage(UsageError::AlreadyConnected))
    ));

    wire.complete_connect(Ok(()));
    h.run();
    assert_eq!(rec.seen(), vec![Seen::Connected]);
    let (phase, peer) = h
        .reactor
        .with_socket::<Recorder, _>(id, |_, cx| (cx.state().phase(), cx.peer_addr()))
        .unwrap();
    assert_eq!(phase, SocketPhase::Connected);
    assert_eq!(peer, Some(addr));
    assert!(wire.receive_waiting());
}

#[test]
fn test_socket_connect_failure() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.open(Box::new(rec.clone()));
    wire.set_connect_mode(ConnectMode::Defer);

    h.reactor.connect(id, "198.51.100.7:81".parse().unwrap()).unwrap();
    wire.complete_connect(Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
    h.run();

    assert_eq!(
        rec.seen(),
        vec![Seen::Error(io::ErrorKind::ConnectionRefused), Seen::Close]
    );
    assert!(!h.reactor.contains(id));
}

/// Fails on the first read, as a buggy application would.
struct Exploding(Arc<Mutex<Vec<Seen>>>);

impl SocketDelegate for Exploding {
    fn on_data(&mut self, _cx: &mut SocketCx<'_>, _data: Bytes, _resume: Resume) -> bool {
        panic!("delegate bug");
    }

    fn on_close(&mut self, _cx: &mut SocketCx<'_>) {
        self.0.lock().unwrap().push(Seen::Close);
    }
}

#[test]
fn test_socket_panicking_delegate_is_closed_and_released() {
    let mut h = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (id, wire) = h.accept_with(Box::new(Exploding(seen.clone())), |wire| {
        wire.push_read("boom");
        wire.push_read("never delivered");
    });
    h.run();

    assert!(!h.reactor.contains(id));
    assert!(wire.is_closed());
    assert_eq!(*seen.lock().unwrap(), vec![Seen::Close]);
    assert_eq!(h.reactor.socket_count(), 0);
}

#[test]
fn test_socket_panic_inside_with_socket_releases_socket() {
    let mut h = Harness::new();
    let rec = Recorder::default();
    let (id, wire) = h.accept(Box::new(rec.clone()));

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        h.reactor
            .with_socket::<Recorder, ()>(id, |_, _| panic!("handler bug"))
    }));

    assert!(outcome.is_err());
    assert!(!h.reactor.contains(id));
    assert!(wire.is_closed());
    assert_eq!(rec.seen(), vec![Seen::Close]);
}
