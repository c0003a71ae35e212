pub mod config;
pub mod seed;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use lyceum_api::middleware::require_auth;
use lyceum_api::state::AppState;
use lyceum_api::{auth, contacts, conversations, messages};
use lyceum_gateway::connection;
use lyceum_gateway::dispatcher::Dispatcher;

#[derive(Clone)]
struct GatewayState {
    dispatcher: Dispatcher,
    jwt_secret: String,
}

#[derive(Debug, Deserialize)]
struct WsParams {
    token: Option<String>,
}

/// Assembles the REST and realtime surfaces.
pub fn build_router(app_state: AppState, dispatcher: Dispatcher) -> Router {
    let gateway_state = GatewayState {
        dispatcher,
        jwt_secret: app_state.jwt_secret.clone(),
    };

    let public_routes = Router::new()
        .route("/auth/login", post(auth::login))
        .with_state(app_state.clone());

    let protected_routes = Router::new()
        .route("/recipients", get(contacts::get_recipients))
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route("/conversations/{conversation_id}", get(conversations::get_conversation))
        .route(
            "/conversations/{conversation_id}/deactivate",
            post(conversations::deactivate_conversation),
        )
        .route("/conversations/{conversation_id}/messages", get(messages::list_messages))
        .route("/conversations/{conversation_id}/read", post(messages::mark_read))
        .route("/messages", post(messages::send_message))
        .route("/messages/{message_id}", delete(messages::delete_message))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_auth))
        .with_state(app_state);

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway_state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// The token may come as `?token=` (browsers cannot set headers on a
/// WebSocket handshake) or as a bearer header. Validation happens after the
/// upgrade so the client receives an `error` event instead of a bare 401.
async fn ws_upgrade(
    State(state): State<GatewayState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = params.token.or_else(|| bearer_token(&headers));
    ws.on_upgrade(move |socket| {
        connection::handle_connection(socket, state.dispatcher, state.jwt_secret, token)
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}
