// rust-xmpp
// Copyright (c) 2014-2015 Florian Zeitz
//
// This project is MIT licensed.
// Please see the COPYING file for more information.

//! Send one chat message and quit, driving the connection from a main loop.
//!
//! ```text
//! cargo run --example send -- -s example.org -u alice -p secret -t bob@example.org -m hello
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use clap::Parser;
use tracing::{error, info};
use xmpp::{AuthMethod, Connection, ConnectionConfig, LoopHandle, MainLoop, Message, StartTlsPolicy};

#[derive(Debug, Parser)]
#[command(name = "send", about = "Send a single XMPP chat message")]
struct Args {
    /// Server to connect to.
    #[arg(short, long)]
    server: String,

    #[arg(long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: String,

    #[arg(short, long)]
    password: String,

    #[arg(short, long, default_value = "jabber-send")]
    resource: String,

    /// Recipient JID.
    #[arg(short, long)]
    to: String,

    #[arg(short, long)]
    message: String,

    /// Use SASL (SCRAM-SHA-1 or PLAIN) and resource binding instead of jabber:iq:auth.
    #[arg(long)]
    sasl: bool,

    /// TLS from the first byte.
    #[arg(long)]
    tls: bool,

    /// Give up unless the stream is encrypted, via STARTTLS if need be.
    #[arg(long)]
    require_starttls: bool,

    /// TOML file with further connection settings.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

type Outcome = Arc<Mutex<Option<Result<(), String>>>>;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn build_config(args: &Args) -> xmpp::Result<ConnectionConfig> {
    let mut config = match args.config {
        Some(ref path) => ConnectionConfig::load(path)?,
        None => ConnectionConfig::new(&args.server),
    };
    config.server = args.server.clone();
    if let Some(port) = args.port {
        config = config.with_port(port);
    }
    if args.tls {
        config = config.with_tls(true);
    }
    if args.sasl {
        config = config.with_auth_method(AuthMethod::Sasl);
    }
    if args.require_starttls {
        config = config.with_starttls(StartTlsPolicy::Required);
    }
    Ok(config)
}

fn finish(outcome: &Outcome, handle: &LoopHandle, result: Result<(), String>) {
    *outcome.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
    handle.quit();
}

fn on_authenticated(conn: &Connection, args: &Args, outcome: &Outcome, handle: &LoopHandle, res: xmpp::Result<()>) {
    if let Err(e) = res {
        return finish(outcome, handle, Err(format!("authentication failed: {}", e)));
    }
    let sent = conn.send(Message::chat(&args.to, &args.message));
    conn.close();
    match sent {
        Ok(()) => {
            info!(to = %args.to, "message sent");
            finish(outcome, handle, Ok(()))
        }
        Err(e) => finish(outcome, handle, Err(format!("send failed: {}", e))),
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args = Arc::new(Args::parse());

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let conn = match Connection::with_tcp(config) {
        Ok(conn) => conn,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut main_loop = MainLoop::new();
    let handle = main_loop.handle();
    let outcome: Outcome = Arc::new(Mutex::new(None));

    let opened = {
        let (conn2, args, outcome, handle) = (conn.clone(), args.clone(), outcome.clone(), handle.clone());
        conn.open(move |res| {
            if let Err(e) = res {
                return finish(&outcome, &handle, Err(format!("connection failed: {}", e)));
            }
            let conn3 = conn2.clone();
            let (args2, outcome2, handle2) = (args.clone(), outcome.clone(), handle.clone());
            let started = conn2.authenticate(&args.username, &args.password, &args.resource, move |res| {
                on_authenticated(&conn3, &args2, &outcome2, &handle2, res)
            });
            if let Err(e) = started {
                finish(&outcome, &handle, Err(format!("authenticate failed: {}", e)));
            }
        })
    };
    if let Err(e) = opened {
        error!("open failed: {}", e);
        return ExitCode::FAILURE;
    }

    main_loop.add_source(conn.clone());
    main_loop.run();
    conn.close();

    let result = outcome.lock().unwrap_or_else(|e| e.into_inner()).take();
    match result {
        Some(Ok(())) => ExitCode::SUCCESS,
        Some(Err(e)) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
        None => {
            error!("connection ended before the message was sent");
            ExitCode::FAILURE
        }
    }
}
