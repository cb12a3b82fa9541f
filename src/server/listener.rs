use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ServerControl;
use super::state::ServerPhase;
use crate::reactor::Reactor;
use crate::scheduler::SchedulerHandle;

/// Binds a non-blocking listening socket.
///
/// `backlog` of `None` asks for the platform maximum; the kernel clamps the
/// requested value to its own limit.
pub fn bind(addr: SocketAddr, backlog: Option<u32>) -> io::Result<std::net::TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;

    let backlog = backlog
        .and_then(|b| i32::try_from(b).ok())
        .unwrap_or(i32::MAX);
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

/// Accepts connections until the server is closed or the listener fails.
///
/// The next accept is issued as soon as a connection has been handed to the
/// dispatch thread, so processing never holds up accepting.
pub async fn accept_loop(
    listener: std::net::TcpListener,
    control: ServerControl,
    scheduler: SchedulerHandle<Reactor>,
) {
    let id = control.id();
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            report_failure(&scheduler, &control, e);
            return;
        }
    };

    if let Ok(addr) = listener.local_addr() {
        info!(server = %id, %addr, "listening");
    }

    loop {
        if control.phase() != ServerPhase::Listening {
            break;
        }

        tokio::select! {
            _ = control.stopped() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    scheduler.post(move |reactor| {
                        reactor.on_accepted(id, stream, peer);
                        Ok(())
                    });
                }
                Err(e) => {
                    if control.phase() != ServerPhase::Disposed {
                        report_failure(&scheduler, &control, e);
                    }
                    break;
                }
            },
        }
    }

    // dropping the tokio listener closes the OS handle
    info!(server = %id, "listener closed");
}

fn report_failure(scheduler: &SchedulerHandle<Reactor>, control: &ServerControl, e: io::Error) {
    error!(server = %control.id(), error = %e, "accept failed");
    let id = control.id();
    scheduler.post(move |reactor| {
        reactor.on_listener_failed(id, e);
        Ok(())
    });
}
