/// Messages sent between clients and the mailbox server.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as whole seconds since the epoch.
pub fn now_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

/// A message sent from the mailbox server to a client.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerMessage {
    /// Direct acknowledgements echo the `id` of the client message that
    /// triggered them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// All server -> client messages carry a `server_tx` timestamp (seconds
    /// since epoch) recording when the message left the server.
    pub server_tx: u64,
    #[serde(flatten)]
    pub ty: ServerMessageType,
}

/// Welcome information sent to every client on connection.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Welcome {
    /// Display to the user: performance problems, scheduled downtime, pleas
    /// for donations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motd: Option<String>,
    /// Clients compare their own version against this and nag the user on
    /// mismatch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cli_version: Option<String>,
    /// The client must show this message to the user and terminate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handshake extension point: mapping of permission method name to
    /// method-specific data. When present, clients must pass one of the
    /// listed methods before any other envelope is processed.
    #[serde(rename = "permission-required", skip_serializing_if = "Option::is_none")]
    pub permission_required: Option<Value>,
}

/// Information about one allocated nameplate, as returned by `list`.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NameplateInfo {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ServerMessageType {
    /// welcome {welcome: {motd:, current_cli_version:, error:, permission-required:}}
    Welcome { welcome: Welcome },
    /// nameplates {nameplates: [{id: str}, ..]}
    Nameplates { nameplates: Vec<NameplateInfo> },
    /// allocated {nameplate:}
    Allocated { nameplate: String },
    /// claimed {mailbox:}
    Claimed { mailbox: String },
    /// released
    Released,
    /// message {side:, phase:, body:, server_rx:, msg_id:}
    Message {
        side: String,
        phase: String,
        body: String,
        server_rx: u64,
        msg_id: String,
    },
    /// closed
    Closed,
    /// ack {id:}
    Ack,
    /// pong {pong: int}
    Pong { pong: u64 },
    /// error {error: str, orig: <original envelope>}
    Error { error: String, orig: Value },
}

impl ServerMessage {
    /// Construct a message of the given type, stamped with the current time.
    pub fn new(id: Option<String>, ty: ServerMessageType) -> Self {
        ServerMessage {
            id,
            server_tx: now_seconds(),
            ty,
        }
    }

    /// Acknowledge the client message with the given `id`.
    pub fn ack(id: String) -> Self {
        ServerMessage::new(Some(id), ServerMessageType::Ack)
    }

    /// Report an error back to the client, attaching the envelope that
    /// caused it.
    pub fn error(error: impl Into<String>, orig: Value) -> Self {
        ServerMessage::new(
            None,
            ServerMessageType::Error {
                error: error.into(),
                orig,
            },
        )
    }
}

/// A command sent from a client to the mailbox server.
///
/// Fields the protocol requires are still `Option`s here: their absence is a
/// protocol error reported back to the client, not a parse failure, so the
/// connection handler checks them itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// bind {appid:, side:, client_version:?}
    Bind {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        appid: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        side: Option<String>,
        /// (implementation, version)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_version: Option<(String, String)>,
    },
    /// list {} -> nameplates
    List,
    /// allocate {} -> allocated
    Allocate,
    /// claim {nameplate:} -> claimed
    Claim {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nameplate: Option<String>,
    },
    /// release {nameplate:?} -> released
    Release {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nameplate: Option<String>,
    },
    /// open {mailbox:}
    Open {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mailbox: Option<String>,
    },
    /// add {phase:, body:} -> message (to all subscribed clients)
    Add {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        phase: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
    },
    /// close {mailbox:?, mood:?} -> closed
    Close {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mailbox: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mood: Option<String>,
    },
    /// ping {ping: int} -> pong
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ping: Option<u64>,
    },
}

/// Why an inbound envelope could not be turned into a [`ClientCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("missing 'type'")]
    MissingType,
    #[error("unknown type")]
    UnknownType,
}

impl ClientCommand {
    /// Interpret a decoded JSON envelope. The envelope must be an object
    /// with a string `type` field naming a known command.
    pub fn from_value(value: &Value) -> Result<ClientCommand, EnvelopeError> {
        match value.get("type") {
            Some(ty) if ty.is_string() => {}
            _ => return Err(EnvelopeError::MissingType),
        }
        serde_json::from_value(value.clone()).map_err(|_| EnvelopeError::UnknownType)
    }
}

#[cfg(test)]
mod tests {
    use super::{ClientCommand, EnvelopeError, ServerMessage, ServerMessageType, Welcome};
    use serde_json::json;

    #[test]
    fn serialization() {
        // welcome
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594898,
            ty: ServerMessageType::Welcome {
                welcome: Welcome::default(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"server_tx\":1687594898,\"type\":\"welcome\",\"welcome\":{}}"
        );

        // welcome with motd and advertised version
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594898,
            ty: ServerMessageType::Welcome {
                welcome: Welcome {
                    motd: Some("hello world".into()),
                    current_cli_version: Some("0.1.0".into()),
                    error: None,
                    permission_required: None,
                },
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"server_tx\":1687594898,\"type\":\"welcome\",\"welcome\":{\"motd\":\"hello world\",\"current_cli_version\":\"0.1.0\"}}"
        );

        // ack
        let msg = ServerMessage {
            id: Some("5d67".into()),
            server_tx: 1687594898,
            ty: ServerMessageType::Ack,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"id\":\"5d67\",\"server_tx\":1687594898,\"type\":\"ack\"}");

        // allocated
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594898,
            ty: ServerMessageType::Allocated {
                nameplate: "6".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"server_tx\":1687594898,\"type\":\"allocated\",\"nameplate\":\"6\"}"
        );

        // claimed
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594898,
            ty: ServerMessageType::Claimed {
                mailbox: "ojr7vqldbwayg".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"server_tx\":1687594898,\"type\":\"claimed\",\"mailbox\":\"ojr7vqldbwayg\"}"
        );

        // released
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594905,
            ty: ServerMessageType::Released,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"server_tx\":1687594905,\"type\":\"released\"}");

        // message
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594905,
            ty: ServerMessageType::Message {
                side: "6d89484e10".into(),
                phase: "pake".into(),
                body: "6041".into(),
                server_rx: 1687594905,
                msg_id: "ec1e".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            "{\"server_tx\":1687594905,\"type\":\"message\",\"side\":\"6d89484e10\",\"phase\":\"pake\",\"body\":\"6041\",\"server_rx\":1687594905,\"msg_id\":\"ec1e\"}"
        );

        // closed
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594905,
            ty: ServerMessageType::Closed,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"server_tx\":1687594905,\"type\":\"closed\"}");

        // pong
        let msg = ServerMessage {
            id: None,
            server_tx: 1687594905,
            ty: ServerMessageType::Pong { pong: 3 },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, "{\"server_tx\":1687594905,\"type\":\"pong\",\"pong\":3}");
    }

    #[test]
    fn parse_bind() {
        let v = json!({
            "id": "5d67",
            "type": "bind",
            "appid": "lothar.com/wormhole/text-or-file-xfer",
            "side": "6d89484e10",
        });
        let cmd = ClientCommand::from_value(&v).unwrap();
        match cmd {
            ClientCommand::Bind {
                appid,
                side,
                client_version,
            } => {
                assert_eq!(appid.as_deref(), Some("lothar.com/wormhole/text-or-file-xfer"));
                assert_eq!(side.as_deref(), Some("6d89484e10"));
                assert!(client_version.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parse_bind_client_version() {
        let v = json!({
            "type": "bind",
            "appid": "app",
            "side": "s1",
            "client_version": ["rust", "0.1.0"],
        });
        let cmd = ClientCommand::from_value(&v).unwrap();
        match cmd {
            ClientCommand::Bind { client_version, .. } => {
                assert_eq!(client_version, Some(("rust".into(), "0.1.0".into())));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parse_missing_fields() {
        // required fields may be absent at the parse layer; the connection
        // handler reports them as protocol errors
        let cmd = ClientCommand::from_value(&json!({"type": "claim"})).unwrap();
        assert!(matches!(cmd, ClientCommand::Claim { nameplate: None }));

        let cmd = ClientCommand::from_value(&json!({"type": "close"})).unwrap();
        assert!(matches!(
            cmd,
            ClientCommand::Close {
                mailbox: None,
                mood: None
            }
        ));
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            ClientCommand::from_value(&json!({"ping": 3})),
            Err(EnvelopeError::MissingType)
        );
        assert_eq!(
            ClientCommand::from_value(&json!({"type": 12})),
            Err(EnvelopeError::MissingType)
        );
        assert_eq!(
            ClientCommand::from_value(&json!({"type": "bogus"})),
            Err(EnvelopeError::UnknownType)
        );
        assert_eq!(EnvelopeError::MissingType.to_string(), "missing 'type'");
        assert_eq!(EnvelopeError::UnknownType.to_string(), "unknown type");
    }

    #[test]
    fn parse_extra_fields_tolerated() {
        let v = json!({"type": "allocate", "id": "abcd"});
        let cmd = ClientCommand::from_value(&v).unwrap();
        assert!(matches!(cmd, ClientCommand::Allocate));
    }
}
