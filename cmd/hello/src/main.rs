//! hello: minimal JSON service on ephttp.
//!
//! ```text
//! hello [--port|-p PORT] [--workers|-w N] [--timeout MS] [PORT]
//! ```
//!
//! `EPHTTP_PORT` sets the port when none is given on the command line;
//! every other knob is read from the `EPHTTP_*` environment (see
//! `ephttp::config`). SIGINT/SIGTERM trigger a graceful shutdown.
//!
//! Routes:
//! - `GET /ping`  → `{"ok":true}`
//! - `GET /`      → `{"hello":"world"}`
//! - `* /echo`    → request body echoed back
//! - anything else → 404

use ephttp::{BodySink, Request, Server, ServerConfig};
use ephttp_core::env::env_get;
use ephttp_core::{kerror, kinfo, kprintln};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

static RUNNING: AtomicBool = AtomicBool::new(true);

const DEFAULT_PORT: u16 = 8080;

struct Args {
    port: u16,
    workers: Option<usize>,
    timeout: Option<Option<Duration>>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        port: env_get("EPHTTP_PORT", DEFAULT_PORT),
        workers: None,
        timeout: None,
    };

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).map(String::as_str);
        match args[i].as_str() {
            "--port" | "-p" => {
                i += 1;
                parsed.port = value.and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
            }
            "--workers" | "-w" => {
                i += 1;
                parsed.workers = value.and_then(|v| v.parse().ok());
            }
            "--timeout" => {
                i += 1;
                parsed.timeout = value
                    .and_then(|v| v.parse::<i64>().ok())
                    .map(|ms| u64::try_from(ms).ok().map(Duration::from_millis));
            }
            "--help" | "-h" => {
                kprintln!("usage: hello [--port|-p PORT] [--workers|-w N] [--timeout MS] [PORT]");
                std::process::exit(0);
            }
            s => match s.parse::<u16>() {
                Ok(port) => parsed.port = port,
                Err(_) => kerror!("hello: ignoring unknown argument {:?}", s),
            },
        }
        i += 1;
    }
    parsed
}

fn route(req: &Request<'_>, body: &mut BodySink<'_>) -> u16 {
    match req.url() {
        b"/ping" if req.is_get() => {
            body.write_str(r#"{"ok":true}"#);
            200
        }
        b"/" if req.is_get() => {
            body.write_str(r#"{"hello":"world"}"#);
            200
        }
        b"/echo" => {
            body.write(req.body());
            200
        }
        _ => 404,
    }
}

extern "C" fn on_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn install_signals() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        signal::sigaction(Signal::SIGINT, &action)?;
        signal::sigaction(Signal::SIGTERM, &action)?;
        signal::signal(Signal::SIGPIPE, SigHandler::SigIgn)?;
    }
    Ok(())
}

fn main() {
    let args = parse_args();

    let mut config = ServerConfig::from_env();
    if let Some(n) = args.workers {
        config = config.workers(n);
    }
    if let Some(timeout) = args.timeout {
        config = config.poll_timeout(timeout);
    }

    if let Err(e) = install_signals() {
        kerror!("hello: installing signal handlers failed: {}", e);
        std::process::exit(1);
    }

    let server = match Server::with_config(&format!(":{}", args.port), config) {
        Ok(s) => s,
        Err(e) => {
            kerror!("hello: {}", e);
            std::process::exit(1);
        }
    };

    kprintln!(
        "hello: port={} workers={} timeout={:?}",
        server.local_addr().port(),
        server.config().workers,
        server.config().poll_timeout
    );

    let stop = server.shutdown_handle();
    let watcher = thread::Builder::new()
        .name("hello-signals".to_string())
        .spawn(move || {
            while RUNNING.load(Ordering::Relaxed) && !stop.is_shutdown() {
                thread::sleep(Duration::from_millis(50));
            }
            kinfo!("hello: signal received, shutting down");
            stop.shutdown();
        });
    if let Err(e) = watcher {
        kerror!("hello: failed to spawn signal watcher: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = server.start(route) {
        kerror!("hello: {}", e);
        std::process::exit(1);
    }
    kprintln!("hello: shutdown complete");
}
