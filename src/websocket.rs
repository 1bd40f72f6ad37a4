use futures_channel::mpsc::{unbounded, UnboundedSender};
use futures_util::{future, StreamExt, TryStreamExt};
use log::{debug, error, warn};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Message, Result};

use crate::app::{ChannelError, Listener, SidedMessage};
use crate::message::{
    now_seconds, ClientCommand, NameplateInfo, ServerMessage, ServerMessageType,
};
use crate::server::MailboxServer;

/// Listener handles are process-unique; one per connection.
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// The state machine of one client connection: at most one bind, one
/// allocation, one claimed nameplate, one open mailbox, one release, and
/// one close per connection. Protocol errors are reported back on the
/// connection and never terminate it.
struct WsConnection {
    server: Arc<Mutex<MailboxServer>>,
    tx: UnboundedSender<ServerMessage>,
    handle: u64,
    app_id: Option<String>,
    side: Option<String>,
    did_allocate: bool,
    nameplate: Option<String>,
    did_release: bool,
    mailbox: Option<String>,
    listening: bool,
    did_close: bool,
}

fn channel_reason(err: ChannelError) -> String {
    match err {
        ChannelError::Db(e) => {
            error!("database error: {}", e);
            "internal error".into()
        }
        other => other.to_string(),
    }
}

fn db_reason(err: rusqlite::Error) -> String {
    error!("database error: {}", err);
    "internal error".into()
}

fn message_envelope(sm: &SidedMessage) -> ServerMessage {
    ServerMessage::new(
        None,
        ServerMessageType::Message {
            side: sm.side.clone(),
            phase: sm.phase.clone(),
            body: sm.body.clone(),
            server_rx: sm.server_rx,
            msg_id: sm.msg_id.clone(),
        },
    )
}

impl WsConnection {
    fn new(server: Arc<Mutex<MailboxServer>>, tx: UnboundedSender<ServerMessage>) -> Self {
        WsConnection {
            server,
            tx,
            handle: NEXT_HANDLE.fetch_add(1, Ordering::Relaxed),
            app_id: None,
            side: None,
            did_allocate: false,
            nameplate: None,
            did_release: false,
            mailbox: None,
            listening: false,
            did_close: false,
        }
    }

    fn send(&self, msg: ServerMessage) {
        // a closed outbound channel means the client is already gone
        let _ = self.tx.unbounded_send(msg);
    }

    fn send_error(&self, error: impl Into<String>, orig: Value) {
        self.send(ServerMessage::error(error, orig));
    }

    fn send_welcome(&self) {
        let welcome = self.server.lock().unwrap().get_welcome().clone();
        self.send(ServerMessage::new(
            None,
            ServerMessageType::Welcome { welcome },
        ));
    }

    /// Process one inbound text frame.
    fn handle_text(&mut self, text: &str, server_rx: u64) {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                debug!("failed to decode message: {}", e);
                return;
            }
        };
        if let Some(id) = value.get("id").and_then(Value::as_str) {
            self.send(ServerMessage::ack(id.to_owned()));
        }
        let command = match ClientCommand::from_value(&value) {
            Ok(command) => command,
            Err(e) => return self.send_error(e.to_string(), value),
        };
        debug!("received {:?}", command);
        if let Err(reason) = self.dispatch(command, &value, server_rx) {
            self.send_error(reason, value);
        }
    }

    fn bound(&self) -> std::result::Result<(String, String), String> {
        match (&self.app_id, &self.side) {
            (Some(app_id), Some(side)) => Ok((app_id.clone(), side.clone())),
            _ => Err("must bind first".into()),
        }
    }

    fn dispatch(
        &mut self,
        command: ClientCommand,
        orig: &Value,
        server_rx: u64,
    ) -> std::result::Result<(), String> {
        match command {
            ClientCommand::Bind {
                appid,
                side,
                client_version,
            } => {
                if self.app_id.is_some() || self.side.is_some() {
                    return Err("already bound".into());
                }
                let appid = appid.ok_or("bind requires 'appid'")?;
                let side = side.ok_or("bind requires 'side'")?;
                if let Some(client_version) = client_version {
                    let result = self.server.lock().unwrap().log_client_version(
                        &appid,
                        server_rx,
                        &side,
                        &client_version,
                    );
                    if let Err(e) = result {
                        error!("failed to log client version: {}", e);
                    }
                }
                self.app_id = Some(appid);
                self.side = Some(side);
                Ok(())
            }

            ClientCommand::List => {
                let (app_id, _side) = self.bound()?;
                let ids = self
                    .server
                    .lock()
                    .unwrap()
                    .get_nameplate_ids(&app_id)
                    .map_err(db_reason)?;
                self.send(ServerMessage::new(
                    None,
                    ServerMessageType::Nameplates {
                        nameplates: ids.into_iter().map(|id| NameplateInfo { id }).collect(),
                    },
                ));
                Ok(())
            }

            ClientCommand::Allocate => {
                let (app_id, side) = self.bound()?;
                if self.did_allocate {
                    return Err("you already allocated one, don't be greedy".into());
                }
                let name = self
                    .server
                    .lock()
                    .unwrap()
                    .allocate_nameplate(&app_id, &side, server_rx)
                    .map_err(channel_reason)?;
                self.did_allocate = true;
                self.send(ServerMessage::new(
                    None,
                    ServerMessageType::Allocated { nameplate: name },
                ));
                Ok(())
            }

            ClientCommand::Claim { nameplate } => {
                let (app_id, side) = self.bound()?;
                if self.nameplate.is_some() {
                    return Err("only one claim per connection".into());
                }
                let name = nameplate.ok_or("claim requires 'nameplate'")?;
                let mailbox_id = self
                    .server
                    .lock()
                    .unwrap()
                    .claim_nameplate(&app_id, &name, &side, server_rx)
                    .map_err(channel_reason)?;
                self.nameplate = Some(name);
                self.send(ServerMessage::new(
                    None,
                    ServerMessageType::Claimed {
                        mailbox: mailbox_id,
                    },
                ));
                Ok(())
            }

            ClientCommand::Release { nameplate } => {
                let (app_id, side) = self.bound()?;
                if self.did_release {
                    return Err("only one release per connection".into());
                }
                let name = match (nameplate, &self.nameplate) {
                    (Some(name), Some(claimed)) if &name != claimed => {
                        return Err("release and claim must use same nameplate".into())
                    }
                    (Some(name), _) => name,
                    (None, Some(claimed)) => claimed.clone(),
                    (None, None) => {
                        return Err("release without nameplate must follow claim".into())
                    }
                };
                self.server
                    .lock()
                    .unwrap()
                    .release_nameplate(&app_id, &name, &side, server_rx)
                    .map_err(channel_reason)?;
                self.did_release = true;
                self.send(ServerMessage::new(None, ServerMessageType::Released));
                Ok(())
            }

            ClientCommand::Open { mailbox } => {
                let (app_id, side) = self.bound()?;
                if self.mailbox.is_some() {
                    return Err("only one open per connection".into());
                }
                let mailbox_id = mailbox.ok_or("open requires 'mailbox'")?;

                // open, subscribe, and replay under one lock: a message
                // appended elsewhere lands either in the history or in the
                // subscription, never both, never neither
                let mut server = self.server.lock().unwrap();
                server
                    .open_mailbox(&app_id, &mailbox_id, &side, server_rx)
                    .map_err(channel_reason)?;
                let deliver_tx = self.tx.clone();
                let stop_tx = self.tx.clone();
                let listener = Listener::new(
                    move |sm: &SidedMessage| {
                        let _ = deliver_tx.unbounded_send(message_envelope(sm));
                    },
                    move || stop_tx.close_channel(),
                );
                let history = server
                    .add_listener(&app_id, &mailbox_id, self.handle, listener)
                    .map_err(db_reason)?;
                drop(server);

                for sm in &history {
                    self.send(message_envelope(sm));
                }
                self.mailbox = Some(mailbox_id);
                self.listening = true;
                Ok(())
            }

            ClientCommand::Add { phase, body } => {
                let (app_id, side) = self.bound()?;
                let mailbox_id = self
                    .mailbox
                    .clone()
                    .ok_or("must open mailbox before adding")?;
                let phase = phase.ok_or("missing 'phase'")?;
                let body = body.ok_or("missing 'body'")?;
                let msg_id = orig
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_owned();
                let sm = SidedMessage {
                    side,
                    phase,
                    body,
                    server_rx,
                    msg_id,
                };
                self.server
                    .lock()
                    .unwrap()
                    .add_message(&app_id, &mailbox_id, &sm)
                    .map_err(channel_reason)?;
                // no direct response; the subscription echoes the message
                Ok(())
            }

            ClientCommand::Close { mailbox, mood } => {
                let (app_id, side) = self.bound()?;
                if self.did_close {
                    return Err("only one close per connection".into());
                }
                let mailbox_id = match (mailbox, &self.mailbox) {
                    (Some(mailbox_id), Some(open)) if &mailbox_id != open => {
                        return Err("open and close must use same mailbox".into())
                    }
                    (Some(mailbox_id), _) => mailbox_id,
                    (None, Some(open)) => open.clone(),
                    (None, None) => return Err("close without mailbox must follow open".into()),
                };
                let mut server = self.server.lock().unwrap();
                // withdraw our own subscription first, so the `closed` ack
                // below still reaches this client when the mailbox is torn
                // down and the remaining listeners are stopped
                if self.listening {
                    server.remove_listener(&app_id, &mailbox_id, self.handle);
                    self.listening = false;
                }
                server
                    .close_mailbox(&app_id, &mailbox_id, &side, mood.as_deref(), server_rx)
                    .map_err(channel_reason)?;
                drop(server);
                self.did_close = true;
                self.send(ServerMessage::new(None, ServerMessageType::Closed));
                Ok(())
            }

            ClientCommand::Ping { ping } => {
                let ping = ping.ok_or("ping requires 'ping'")?;
                self.send(ServerMessage::new(
                    None,
                    ServerMessageType::Pong { pong: ping },
                ));
                Ok(())
            }
        }
    }

    /// The transport went away: drop the subscription, but leave nameplates
    /// and mailboxes alone so a reconnecting client can resume.
    fn handle_disconnect(&mut self) {
        if self.listening {
            if let (Some(app_id), Some(mailbox_id)) = (&self.app_id, &self.mailbox) {
                self.server
                    .lock()
                    .unwrap()
                    .remove_listener(app_id, mailbox_id, self.handle);
            }
            self.listening = false;
        }
    }
}

/// Build the tungstenite protocol configuration from `--websocket-protocol-option`
/// KEY=VALUE pairs.
pub fn websocket_config(options: &[(String, Value)]) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    for (key, value) in options {
        match key.as_str() {
            "max_message_size" => config.max_message_size = value.as_u64().map(|v| v as usize),
            "max_frame_size" => config.max_frame_size = value.as_u64().map(|v| v as usize),
            "write_buffer_size" => {
                if let Some(v) = value.as_u64() {
                    config.write_buffer_size = v as usize;
                }
            }
            "max_write_buffer_size" => {
                if let Some(v) = value.as_u64() {
                    config.max_write_buffer_size = v as usize;
                }
            }
            "accept_unmasked_frames" => {
                if let Some(v) = value.as_bool() {
                    config.accept_unmasked_frames = v;
                }
            }
            other => warn!("ignoring unknown websocket protocol option {:?}", other),
        }
    }
    config
}

/// Serve one accepted TCP connection for its whole lifetime.
pub async fn handle_connection(
    server: Arc<Mutex<MailboxServer>>,
    peer: SocketAddr,
    stream: TcpStream,
    config: Option<WebSocketConfig>,
) -> Result<()> {
    let check_path = |request: &Request, response: Response| {
        if request.uri().path() == "/v1" {
            Ok(response)
        } else {
            let mut response = ErrorResponse::new(Some("this server only speaks /v1\n".into()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            Err(response)
        }
    };
    let ws_stream =
        tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, config).await?;
    debug!("new WebSocket connection: {}", peer);
    let (ws_sender, ws_receiver) = ws_stream.split();
    let (tx, rx) = unbounded();
    let mut connection = WsConnection::new(server, tx);
    connection.send_welcome();

    let handle_incoming = ws_receiver
        .try_filter(|msg| future::ready(msg.is_text() || msg.is_binary()))
        .try_for_each(|ws_msg| {
            let server_rx = now_seconds();
            match &ws_msg {
                Message::Text(text) => connection.handle_text(text, server_rx),
                Message::Binary(bytes) => {
                    if let Ok(text) = std::str::from_utf8(bytes) {
                        connection.handle_text(text, server_rx);
                    } else {
                        debug!("ignoring non-UTF-8 binary frame from {}", peer);
                    }
                }
                _ => unreachable!(),
            }
            future::ok(())
        });

    let forward_to_websocket = rx
        .map(|msg| {
            Ok(Message::Text(
                serde_json::to_string(&msg).expect("failed to encode message"),
            ))
        })
        .forward(ws_sender);

    future::select(handle_incoming, forward_to_websocket).await;

    connection.handle_disconnect();
    debug!("connection closed: {}", peer);

    Ok(())
}
