use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::{info, warn};
use uuid::Uuid;

use lyceum_types::api::{Claims, LoginRequest, LoginResponse};
use lyceum_types::models::Role;

use crate::error::{ApiError, ApiResult};
use crate::state::{AppState, blocking};

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Uuid,
    pub role: Role,
}

impl From<&Claims> for Actor {
    fn from(claims: &Claims) -> Self {
        Self {
            id: claims.sub,
            role: claims.role,
        }
    }
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = blocking(move || {
        let user = db
            .get_user_by_username(&username)?
            .ok_or(ApiError::Unauthenticated)?;

        // Verify password (Argon2 is CPU-bound, keep it off the runtime)
        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("Corrupt password hash for '{}': {}", user.username, e))?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthenticated)?;

        Ok(user)
    })
    .await
    .inspect_err(|e| {
        if matches!(e, ApiError::Unauthenticated) {
            warn!("Failed login for '{}'", req.username);
        }
    })?;

    let user_id = lyceum_db::parse_id(&user.id)?;
    let role: Role = user.role.parse().map_err(anyhow::Error::from)?;

    let token = create_token(&state.jwt_secret, state.token_ttl, user_id, &user.username, role)?;

    info!("{} ({}) logged in as {}", user.username, user_id, role);
    Ok(Json(LoginResponse {
        user_id,
        username: user.username,
        display_name: user.display_name,
        role,
        token,
    }))
}

pub fn create_token(
    secret: &str,
    ttl: chrono::Duration,
    user_id: Uuid,
    username: &str,
    role: Role,
) -> anyhow::Result<String> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        role,
        exp: (chrono::Utc::now() + ttl).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?;

    Ok(token)
}

pub fn verify_token(secret: &str, token: &str) -> ApiResult<Claims> {
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| ApiError::Unauthenticated)?;

    Ok(token_data.claims)
}

/// Hash a password with Argon2id for storage in the directory.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Password hashing failed: {}", e))?
        .to_string();
    Ok(hash)
}
