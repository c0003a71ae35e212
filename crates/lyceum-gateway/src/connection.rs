use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{DecodingKey, Validation, decode};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use lyceum_types::api::Claims;
use lyceum_types::events::{GatewayCommand, GatewayEvent};

use crate::dispatcher::Dispatcher;

/// Keepalive ping. There is no pong deadline: idle connections live until
/// the transport drops them.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// The authenticated user bound to a connection for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

/// Why a handshake was refused. The text is what the client sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    MissingToken,
    InvalidToken,
}

impl HandshakeError {
    pub fn message(self) -> &'static str {
        match self {
            Self::MissingToken => "authentication required: missing token",
            Self::InvalidToken => "authentication failed: invalid or expired token",
        }
    }
}

/// Verifies the bearer token presented at upgrade time.
pub fn authenticate(jwt_secret: &str, token: Option<&str>) -> Result<Identity, HandshakeError> {
    let token = token
        .filter(|t| !t.is_empty())
        .ok_or(HandshakeError::MissingToken)?;

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| HandshakeError::InvalidToken)?;

    Ok(Identity {
        user_id: data.claims.sub,
        username: data.claims.username,
    })
}

fn to_frame(event: &GatewayEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            warn!("Failed to encode gateway event: {}", e);
            None
        }
    }
}

/// Drives one WebSocket from handshake to disconnect.
///
/// A missing or invalid token gets a single `error` event and a close frame.
/// Otherwise the client receives `ready` and the connection is registered
/// with the dispatcher until either side hangs up.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    jwt_secret: String,
    token: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match authenticate(&jwt_secret, token.as_deref()) {
        Ok(identity) => identity,
        Err(reason) => {
            warn!("Rejected gateway handshake: {:?}", reason);
            if let Some(msg) = to_frame(&GatewayEvent::error(reason.message())) {
                let _ = sender.send(msg).await;
            }
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: reason.message().into(),
                })))
                .await;
            return;
        }
    };

    let ready = GatewayEvent::Ready {
        user_id: identity.user_id,
        username: identity.username.clone(),
    };
    let Some(ready) = to_frame(&ready) else {
        return;
    };
    if sender.send(ready).await.is_err() {
        return;
    }

    let (conn_id, mut events) = dispatcher.register(identity.user_id).await;
    info!(
        "{} ({}) connected to gateway as {}",
        identity.username, identity.user_id, conn_id
    );

    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(msg) = to_frame(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_dispatcher = dispatcher.clone();
    let recv_identity = identity.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    match serde_json::from_str::<GatewayCommand>(text.as_str()) {
                        Ok(cmd) => {
                            handle_command(&recv_dispatcher, conn_id, &recv_identity, cmd).await;
                        }
                        Err(e) => {
                            warn!(
                                "{} ({}) bad command: {} -- raw: {}",
                                recv_identity.username,
                                recv_identity.user_id,
                                e,
                                text.as_str().chars().take(200).collect::<String>()
                            );
                            recv_dispatcher
                                .send_to_conn(conn_id, GatewayEvent::error(format!("invalid command: {}", e)))
                                .await;
                        }
                    }
                }
                Message::Binary(_) => {
                    recv_dispatcher
                        .send_to_conn(conn_id, GatewayEvent::error("binary frames are not supported"))
                        .await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.disconnect(conn_id).await;
    info!(
        "{} ({}) disconnected from gateway ({})",
        identity.username, identity.user_id, conn_id
    );
}

/// Applies one client command on behalf of `conn_id`.
///
/// Conversation rooms are joined without consulting conversation membership,
/// and `send_message` only echoes: nothing is validated or persisted here.
pub async fn handle_command(
    dispatcher: &Dispatcher,
    conn_id: Uuid,
    identity: &Identity,
    cmd: GatewayCommand,
) {
    match cmd {
        GatewayCommand::Join { user_id } => {
            if let Err(e) = dispatcher.join_personal(conn_id, user_id).await {
                warn!(
                    "{} ({}) refused personal room {}: {}",
                    identity.username, identity.user_id, user_id, e
                );
                dispatcher.send_to_conn(conn_id, GatewayEvent::error(e.to_string())).await;
            } else {
                debug!("{} joined personal room", identity.username);
            }
        }

        GatewayCommand::JoinConversation { conversation_id } => {
            if dispatcher.join_conversation(conn_id, conversation_id).await {
                info!(
                    "{} ({}) joined conversation room {}",
                    identity.username, identity.user_id, conversation_id
                );
            }
        }

        GatewayCommand::LeaveConversation { conversation_id } => {
            if dispatcher.leave_conversation(conn_id, conversation_id).await {
                info!(
                    "{} ({}) left conversation room {}",
                    identity.username, identity.user_id, conversation_id
                );
            }
        }

        GatewayCommand::TypingStart { conversation_id } => {
            trace!("{} typing in {}", identity.username, conversation_id);
            let event = GatewayEvent::UserTyping {
                user_id: identity.user_id,
                username: identity.username.clone(),
                conversation_id,
            };
            dispatcher.relay(event, Some(conn_id)).await;
        }

        GatewayCommand::TypingStop { conversation_id } => {
            trace!("{} stopped typing in {}", identity.username, conversation_id);
            let event = GatewayEvent::UserStoppedTyping {
                user_id: identity.user_id,
                username: identity.username.clone(),
                conversation_id,
            };
            dispatcher.relay(event, Some(conn_id)).await;
        }

        GatewayCommand::SendMessage {
            conversation_id,
            message,
        } => {
            let event = GatewayEvent::NewMessage {
                conversation_id,
                message,
            };
            let delivered = dispatcher.relay(event, Some(conn_id)).await;
            debug!(
                "{} echoed a message to {} connections in {}",
                identity.username, delivered, conversation_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Room;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use lyceum_types::models::Role;
    use serde_json::json;

    fn token(secret: &str, user_id: Uuid, exp_offset: i64) -> String {
        let claims = Claims {
            sub: user_id,
            username: "ines".into(),
            role: Role::Student,
            exp: (unix_now() + exp_offset) as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn unix_now() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn identity(name: &str) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            username: name.into(),
        }
    }

    #[test]
    fn handshake_requires_a_valid_token() {
        let id = Uuid::new_v4();
        assert_eq!(authenticate("s", None), Err(HandshakeError::MissingToken));
        assert_eq!(authenticate("s", Some("")), Err(HandshakeError::MissingToken));
        assert_eq!(authenticate("s", Some("garbage")), Err(HandshakeError::InvalidToken));
        assert_eq!(
            authenticate("other", Some(&token("s", id, 3600))),
            Err(HandshakeError::InvalidToken)
        );
        assert_eq!(
            authenticate("s", Some(&token("s", id, -7200))),
            Err(HandshakeError::InvalidToken)
        );

        let ok = authenticate("s", Some(&token("s", id, 3600))).unwrap();
        assert_eq!(ok.user_id, id);
        assert_eq!(ok.username, "ines");
    }

    #[tokio::test]
    async fn typing_is_relayed_to_others_with_sender_name() {
        let d = Dispatcher::new();
        let conv = Uuid::new_v4();
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (a, mut rx_a) = d.register(alice.user_id).await;
        let (b, mut rx_b) = d.register(bob.user_id).await;

        for (conn, who) in [(a, &alice), (b, &bob)] {
            handle_command(&d, conn, who, GatewayCommand::JoinConversation { conversation_id: conv }).await;
        }
        handle_command(&d, a, &alice, GatewayCommand::TypingStart { conversation_id: conv }).await;
        handle_command(&d, a, &alice, GatewayCommand::TypingStop { conversation_id: conv }).await;

        assert_eq!(
            rx_b.recv().await,
            Some(GatewayEvent::UserTyping {
                user_id: alice.user_id,
                username: "alice".into(),
                conversation_id: conv,
            })
        );
        assert_eq!(
            rx_b.recv().await,
            Some(GatewayEvent::UserStoppedTyping {
                user_id: alice.user_id,
                username: "alice".into(),
                conversation_id: conv,
            })
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_message_echoes_payload_verbatim() {
        let d = Dispatcher::new();
        let conv = Uuid::new_v4();
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (a, _rx_a) = d.register(alice.user_id).await;
        let (b, mut rx_b) = d.register(bob.user_id).await;
        handle_command(&d, b, &bob, GatewayCommand::JoinConversation { conversation_id: conv }).await;

        // Sender need not be in the room, and the payload is not inspected.
        let payload = json!({"content": "", "anything": [1, 2, 3]});
        handle_command(
            &d,
            a,
            &alice,
            GatewayCommand::SendMessage {
                conversation_id: conv,
                message: payload.clone(),
            },
        )
        .await;

        assert_eq!(
            rx_b.recv().await,
            Some(GatewayEvent::NewMessage {
                conversation_id: conv,
                message: payload,
            })
        );
    }

    #[tokio::test]
    async fn joining_someone_elses_personal_room_sends_error() {
        let d = Dispatcher::new();
        let alice = identity("alice");
        let (a, mut rx_a) = d.register(alice.user_id).await;

        handle_command(&d, a, &alice, GatewayCommand::Join { user_id: Uuid::new_v4() }).await;
        assert!(matches!(rx_a.recv().await, Some(GatewayEvent::Error { .. })));
        assert_eq!(d.room_count().await, 0);

        handle_command(&d, a, &alice, GatewayCommand::Join { user_id: alice.user_id }).await;
        assert_eq!(d.room_size(Room::Personal(alice.user_id)).await, 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_stops_delivery() {
        let d = Dispatcher::new();
        let conv = Uuid::new_v4();
        let (alice, bob) = (identity("alice"), identity("bob"));
        let (a, _rx_a) = d.register(alice.user_id).await;
        let (b, mut rx_b) = d.register(bob.user_id).await;
        handle_command(&d, b, &bob, GatewayCommand::JoinConversation { conversation_id: conv }).await;
        handle_command(&d, b, &bob, GatewayCommand::LeaveConversation { conversation_id: conv }).await;

        handle_command(&d, a, &alice, GatewayCommand::TypingStart { conversation_id: conv }).await;
        assert!(rx_b.try_recv().is_err());
    }
}
