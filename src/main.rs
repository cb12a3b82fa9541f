use sluice::Config;
use sluice::http::request::{HttpRequestHead, Method};
use sluice::http::response::{HttpResponseHead, Response, StatusCode};
use sluice::http::transaction::{RequestBody, Responder};
use sluice::reactor::EventLoop;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;
    let mut event_loop = EventLoop::new(cfg)?;

    // /echo streams the request body back, / says hello
    let server = event_loop.serve(|head: HttpRequestHead, body: RequestBody, responder: Responder| {
        if head.method == Method::POST && head.path == "/echo" {
            // a waiting client sends nothing until told to, so go ahead before streaming
            if head.expects_continue() {
                responder.send_continue();
            }
            let mut response = HttpResponseHead::new(StatusCode::Ok);
            if let Some(content_type) = head.header("Content-Type") {
                response = response.header("Content-Type", content_type);
            }
            responder.respond(response, Some(Box::new(body)));
        } else if head.path == "/" {
            body.discard();
            responder.send(Response::text(StatusCode::Ok, "Hello from Sluice\n"));
        } else {
            body.discard();
            responder.send(Response::not_found());
        }
    })?;
    tracing::info!(addr = %server.local_addr(), "listening");

    event_loop.block_on(tokio::signal::ctrl_c())??;
    tracing::info!("Shutdown signal received");

    server.close()?;
    event_loop.shutdown()
}
