use clap::Parser;
use log::{debug, error, info};
use serde_json::Value;
use std::os::fd::FromRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{protocol::WebSocketConfig, Error};

use wormhole_mailbox_server::database::Database;
use wormhole_mailbox_server::message::now_seconds;
use wormhole_mailbox_server::rlimits::increase_rlimits;
use wormhole_mailbox_server::server::{
    MailboxServer, ServerConfig, CHANNEL_EXPIRATION_TIME, EXPIRATION_CHECK_PERIOD,
};
use wormhole_mailbox_server::websocket::{handle_connection, websocket_config};

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Run a Mailbox server for magic-wormhole.",
    long_about = "Run a Mailbox server for magic-wormhole.

This service forwards short messages between clients, to perform key
exchange and connection setup."
)]
struct Options {
    /// TCP port to listen on
    #[arg(long, short = 'p', default_value_t = 4000)]
    port: u16,

    /// Location for the state database
    #[arg(long, value_name = "PATH", default_value = "relay.sqlite")]
    channel_db: PathBuf,

    /// Record usage data (SQLite)
    #[arg(long, value_name = "PATH")]
    usage_db: Option<PathBuf>,

    /// Round logged access times to improve privacy
    #[arg(long, value_name = "SECONDS")]
    blur_usage: Option<u64>,

    /// Version to recommend to clients
    #[arg(long, value_name = "VERSION")]
    advertise_version: Option<String>,

    /// Force all clients to fail with a message
    #[arg(long, value_name = "MESSAGE")]
    signal_error: Option<String>,

    /// Send a Message of the Day in the welcome
    #[arg(long, value_name = "MESSAGE")]
    motd: Option<String>,

    /// Refuse to send the list of allocated nameplates
    #[arg(long)]
    disallow_list: bool,

    /// Write logs to this inherited file descriptor
    #[arg(long, value_name = "FD")]
    log_fd: Option<i32>,

    /// A websocket server protocol option to configure: OPTION=VALUE, where
    /// VALUE is JSON. May be provided multiple times.
    #[arg(long = "websocket-protocol-option", value_name = "OPTION=VALUE",
          value_parser = parse_protocol_option)]
    websocket_protocol_options: Vec<(String, Value)>,
}

fn parse_protocol_option(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| "format options as OPTION=VALUE".to_owned())?;
    let value = serde_json::from_str(value)
        .map_err(|_| format!("could not parse JSON value for {}", key))?;
    Ok((key.to_owned(), value))
}

fn init_logging(log_fd: Option<i32>) {
    let mut builder = env_logger::Builder::from_default_env();
    if let Some(fd) = log_fd {
        // adopt the descriptor inherited from the supervisor; it belongs to
        // the logger for the rest of the process lifetime
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
}

async fn accept_connection(
    server: Arc<Mutex<MailboxServer>>,
    peer: std::net::SocketAddr,
    stream: TcpStream,
    config: Option<WebSocketConfig>,
) {
    if let Err(e) = handle_connection(server, peer, stream, config).await {
        match e {
            Error::ConnectionClosed | Error::Protocol(_) | Error::Utf8 => (),
            err => error!("error processing connection: {}", err),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = Options::parse();
    init_logging(options.log_fd);
    increase_rlimits();

    let channel_db = match Database::open_channel(&options.channel_db) {
        Ok(db) => db,
        Err(e) => {
            error!("unable to open channel database: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let usage_db = match options.usage_db.as_deref().map(Database::open_usage).transpose() {
        Ok(db) => db,
        Err(e) => {
            error!("unable to open usage database: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server = Arc::new(Mutex::new(MailboxServer::new(
        channel_db,
        usage_db,
        ServerConfig {
            allow_list: !options.disallow_list,
            advertise_version: options.advertise_version,
            signal_error: options.signal_error,
            blur_usage: options.blur_usage,
            welcome_motd: options.motd,
            permission_required: None,
        },
    )));
    info!("wormhole mailbox server running");

    let ws_config = (!options.websocket_protocol_options.is_empty())
        .then(|| websocket_config(&options.websocket_protocol_options));

    // the pruning loop: a single failed pass is logged, not fatal
    let rebooted = now_seconds();
    let pruner = server.clone();
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(Duration::from_secs(EXPIRATION_CHECK_PERIOD));
        loop {
            timer.tick().await;
            let now = now_seconds();
            let old = now.saturating_sub(CHANNEL_EXPIRATION_TIME);
            let mut server = pruner.lock().unwrap();
            if let Err(e) = server.prune_all_apps(now, old) {
                error!("error during prune_all_apps: {}", e);
            }
            if let Err(e) = server.dump_stats(now, rebooted) {
                error!("error during dump_stats: {}", e);
            }
        }
    });

    let addr = format!("0.0.0.0:{}", options.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("websocket listening on ws://HOSTNAME:{}/v1", options.port);

    let accept_server = server.clone();
    let accept_loop = async move {
        while let Ok((stream, _)) = listener.accept().await {
            let peer = match stream.peer_addr() {
                Ok(peer) => peer,
                Err(_) => continue,
            };
            debug!("peer address: {}", peer);
            tokio::spawn(accept_connection(
                accept_server.clone(),
                peer,
                stream,
                ws_config,
            ));
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.lock().unwrap().shutdown();
        }
    }
    ExitCode::SUCCESS
}
