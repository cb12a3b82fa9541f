mod common;

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use common::Harness;
use sluice::data::Resume;
use sluice::error::UsageError;
use sluice::http::connection::HttpServer;
use sluice::http::request::HttpRequestHead;
use sluice::http::response::Response;
use sluice::http::transaction::{RequestBody, Responder};
use sluice::net::{SocketCx, SocketDelegate, SocketId};
use sluice::server::state::{CloseOutcome, ServerPhase};
use sluice::server::{ConnectionDelegate, ServerControl, ServerId};
use sluice::{Config, EventLoop};

#[derive(Clone, Default)]
struct Counts {
    accepted: Arc<Mutex<Vec<SocketAddr>>>,
    closed: Arc<Mutex<u32>>,
}

struct Greeter(Counts);

impl ConnectionDelegate for Greeter {
    fn on_connection(&mut self, _id: SocketId, peer: SocketAddr) -> Box<dyn SocketDelegate> {
        self.0.accepted.lock().unwrap().push(peer);
        Box::new(Greeting)
    }

    fn on_closed(&mut self) {
        *self.0.closed.lock().unwrap() += 1;
    }
}

/// Echoes until the peer hangs up.
struct Greeting;

impl SocketDelegate for Greeting {
    fn on_data(&mut self, cx: &mut SocketCx<'_>, data: Bytes, _resume: Resume) -> bool {
        let _ = cx.write(data);
        true
    }

    fn on_end(&mut self, cx: &mut SocketCx<'_>) {
        let _ = cx.end();
    }
}

fn wait_until(what: &str, mut f: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn local_config() -> Config {
    Config {
        listen_addr: "127.0.0.1:0".to_string(),
        ..Config::default()
    }
}

#[test]
fn test_server_control_close_without_connections() {
    let control = ServerControl::new(ServerId::next());
    control.listen().unwrap();

    assert_eq!(control.close(), Ok(CloseOutcome::Closed));
    assert_eq!(control.phase(), ServerPhase::Closed);
    assert_eq!(control.close(), Ok(CloseOutcome::AlreadyClosed));
}

#[test]
fn test_server_control_close_waits_for_last_connection() {
    let control = ServerControl::new(ServerId::next());
    control.listen().unwrap();
    control.connection_opened().unwrap();
    control.connection_opened().unwrap();

    assert_eq!(control.close(), Ok(CloseOutcome::Closing { remaining: 2 }));
    assert_eq!(control.close(), Ok(CloseOutcome::AlreadyClosing));
    assert!(matches!(
        control.connection_opened(),
        Err(UsageError::InvalidServerTransition { action: "accept", .. })
    ));

    assert!(!control.connection_closed());
    assert!(control.connection_closed());
    assert_eq!(control.phase(), ServerPhase::Closed);
}

#[test]
fn test_server_control_dispose() {
    let control = ServerControl::new(ServerId::next());
    control.dispose();

    assert_eq!(control.phase(), ServerPhase::Disposed);
    assert!(control.close().is_err());
    assert!(control.listen().is_err());
}

#[test]
fn test_server_closed_notification_fires_once() {
    let mut h = Harness::new();
    let counts = Counts::default();
    let control = ServerControl::new(ServerId::next());
    control.listen().unwrap();
    h.reactor.register_server(control.clone(), Box::new(Greeter(counts.clone())));

    assert_eq!(control.close(), Ok(CloseOutcome::Closed));
    h.reactor.finish_server(control.id());
    h.reactor.finish_server(control.id());
    h.reactor.shutdown();

    assert_eq!(*counts.closed.lock().unwrap(), 1);
}

#[test]
fn test_server_listener_failure_closes_server() {
    let mut h = Harness::new();
    let counts = Counts::default();
    let control = ServerControl::new(ServerId::next());
    control.listen().unwrap();
    h.reactor.register_server(control.clone(), Box::new(Greeter(counts.clone())));

    h.reactor
        .on_listener_failed(control.id(), std::io::Error::from(std::io::ErrorKind::Other));

    assert_eq!(control.phase(), ServerPhase::Closed);
    assert_eq!(*counts.closed.lock().unwrap(), 1);
}

#[test]
fn test_server_accepts_and_closes_after_last_connection() {
    let mut event_loop = EventLoop::new(local_config()).unwrap();
    let counts = Counts::default();
    let server = event_loop
        .listen("127.0.0.1:0".parse().unwrap(), Greeter(counts.clone()))
        .unwrap();
    assert_eq!(server.phase(), ServerPhase::Listening);
    assert_ne!(server.local_addr().port(), 0);

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    wait_until("accept", || counts.accepted.lock().unwrap().len() == 1);
    assert_eq!(server.connections(), 1);
    assert_eq!(counts.accepted.lock().unwrap()[0], client.local_addr().unwrap());

    assert_eq!(server.close().unwrap(), CloseOutcome::Closing { remaining: 1 });
    // the live connection still works
    std::io::Write::write_all(&mut client, b"ping").unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
    assert_eq!(*counts.closed.lock().unwrap(), 0);

    client.shutdown(std::net::Shutdown::Write).unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());

    wait_until("server closed", || *counts.closed.lock().unwrap() == 1);
    assert_eq!(server.phase(), ServerPhase::Closed);

    event_loop.shutdown().unwrap();
}

#[test]
fn test_server_dispose_drops_connections() {
    let mut event_loop = EventLoop::new(local_config()).unwrap();
    let counts = Counts::default();
    let server = event_loop
        .listen("127.0.0.1:0".parse().unwrap(), Greeter(counts.clone()))
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    wait_until("accept", || counts.accepted.lock().unwrap().len() == 1);

    server.dispose();
    let mut buf = Vec::new();
    // closed from the server side: EOF or reset
    let _ = client.read_to_end(&mut buf);
    assert_eq!(server.phase(), ServerPhase::Disposed);
    assert_eq!(*counts.closed.lock().unwrap(), 0);

    event_loop.shutdown().unwrap();
}

#[test]
fn test_server_closing_survives_panicking_handler() {
    let mut event_loop = EventLoop::new(local_config()).unwrap();
    let handler = |head: HttpRequestHead, body: RequestBody, responder: Responder| {
        if head.path == "/boom" {
            panic!("handler failed");
        }
        body.discard();
        responder.send(Response::ok("fine"));
    };
    let server = event_loop
        .listen("127.0.0.1:0".parse().unwrap(), HttpServer::new(handler))
        .unwrap();

    let mut client = TcpStream::connect(server.local_addr()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    wait_until("accept", || server.connections() == 1);
    assert_eq!(server.close().unwrap(), CloseOutcome::Closing { remaining: 1 });

    client.write_all(b"GET /boom HTTP/1.1\r\n\r\n").unwrap();
    let mut response = Vec::new();
    // EOF or reset, never a response
    let _ = client.read_to_end(&mut response);
    assert!(response.is_empty());

    wait_until("server closed", || server.phase() == ServerPhase::Closed);
    assert_eq!(server.connections(), 0);

    event_loop.shutdown().unwrap();
}

#[derive(Clone, Default)]
struct Dialed {
    events: Arc<Mutex<Vec<&'static str>>>,
    received: Arc<Mutex<Vec<u8>>>,
}

impl SocketDelegate for Dialed {
    fn on_connected(&mut self, cx: &mut SocketCx<'_>) {
        self.events.lock().unwrap().push("connected");
        cx.write(Bytes::from("hello")).unwrap();
        cx.end().unwrap();
    }

    fn on_data(&mut self, _cx: &mut SocketCx<'_>, data: Bytes, _resume: Resume) -> bool {
        self.received.lock().unwrap().extend_from_slice(&data);
        true
    }

    fn on_end(&mut self, _cx: &mut SocketCx<'_>) {
        self.events.lock().unwrap().push("end");
    }

    fn on_error(&mut self, _cx: &mut SocketCx<'_>, _error: std::io::Error) {
        self.events.lock().unwrap().push("error");
    }

    fn on_close(&mut self, _cx: &mut SocketCx<'_>) {
        self.events.lock().unwrap().push("close");
    }
}

#[test]
fn test_client_connect_exchanges_and_closes() {
    let mut event_loop = EventLoop::new(local_config()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut got = Vec::new();
        stream.read_to_end(&mut got).unwrap();
        stream.write_all(b"world").unwrap();
        got
    });

    let dialed = Dialed::default();
    event_loop.connect(addr, Box::new(dialed.clone()));

    assert_eq!(peer.join().unwrap(), b"hello");
    wait_until("client close", || dialed.events.lock().unwrap().contains(&"close"));
    assert_eq!(*dialed.events.lock().unwrap(), vec!["connected", "end", "close"]);
    assert_eq!(&dialed.received.lock().unwrap()[..], b"world");

    event_loop.shutdown().unwrap();
}
