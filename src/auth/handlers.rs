use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Redirect,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{
            AuthResponse, ForgotPasswordRequest, LoginRequest, LogoutRequest, PublicUser,
            RecoveryRequest, RegisterRequest,
        },
        extractors::AuthUser,
        services::{is_valid_email, AuthError},
    },
    state::AppState,
};

const REFRESH_COOKIE: &str = "refreshToken";
const MIN_PASSWORD_LEN: usize = 8;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/auth/registration", post(registration))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
        .route("/auth/activation/:id", get(activation))
        .route("/auth/refresh", get(refresh))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/recovery-account", post(recovery_account))
        .route("/auth/users", get(users))
}

/// Set-Cookie header for the refresh token. Scoped to the auth routes so the
/// browser only sends it where it is needed.
fn refresh_cookie_headers(token: &str, max_age_secs: i64) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let cookie = format!(
        "{REFRESH_COOKIE}={token}; HttpOnly; Path=/api/auth; Max-Age={max_age_secs}; SameSite=Lax"
    );
    headers.insert(header::SET_COOKIE, cookie.parse().expect("valid cookie"));
    headers
}

fn clear_cookie_headers() -> HeaderMap {
    refresh_cookie_headers("", 0)
}

fn refresh_token_from_cookies(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';')
        .map(str::trim)
        .find_map(|kv| kv.strip_prefix(REFRESH_COOKIE)?.strip_prefix('='))
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn refresh_ttl_secs(state: &AppState) -> i64 {
    state.config.jwt.refresh_ttl_days * 24 * 3600
}

fn check_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    if !is_valid_email(email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::BadRequest("invalid email".into()));
    }
    if password.len() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AuthError::BadRequest("password too short".into()));
    }
    Ok(())
}

#[instrument(skip(state, payload))]
async fn registration(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), AuthError> {
    payload.email = payload.email.trim().to_lowercase();
    check_credentials(&payload.email, &payload.password)?;

    let session = state.auth.register(&payload.email, &payload.password).await?;
    let headers = refresh_cookie_headers(&session.refresh_token, refresh_ttl_secs(&state));
    Ok((headers, Json(session)))
}

#[instrument(skip(state, payload))]
async fn login(
    State(state): State<AppState>,
    Json(mut payload): Json<LoginRequest>,
) -> Result<(HeaderMap, Json<AuthResponse>), AuthError> {
    payload.email = payload.email.trim().to_lowercase();
    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err(AuthError::BadRequest("invalid email".into()));
    }

    let session = state.auth.login(&payload.email, &payload.password).await?;
    let headers = refresh_cookie_headers(&session.refresh_token, refresh_ttl_secs(&state));
    Ok((headers, Json(session)))
}

/// Token may arrive in the cookie or in the body; a token we no longer
/// recognize is tolerated.
#[instrument(skip(state, headers, payload))]
async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Option<Json<LogoutRequest>>,
) -> Result<(HeaderMap, Json<serde_json::Value>), AuthError> {
    let token = refresh_token_from_cookies(&headers)
        .or_else(|| payload.and_then(|Json(p)| p.refresh_token));

    let removed = match token {
        Some(token) => state.auth.logout(&token).await?,
        None => false,
    };

    Ok((
        clear_cookie_headers(),
        Json(serde_json::json!({ "removed": removed })),
    ))
}

#[instrument(skip(state))]
async fn activation(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Redirect, AuthError> {
    state.auth.activation(user_id).await?;
    Ok(Redirect::temporary(&state.config.client_url))
}

#[instrument(skip(state, headers))]
async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(HeaderMap, Json<AuthResponse>), AuthError> {
    let token = refresh_token_from_cookies(&headers).ok_or_else(AuthError::unauthorized)?;
    let session = state.auth.refresh(&token).await?;
    let headers = refresh_cookie_headers(&session.refresh_token, refresh_ttl_secs(&state));
    Ok((headers, Json(session)))
}

#[instrument(skip(state, payload))]
async fn forgot_password(
    State(state): State<AppState>,
    Json(payload): Json<ForgotPasswordRequest>,
) -> Result<StatusCode, AuthError> {
    let email = payload.email.trim().to_lowercase();
    state.auth.forgot_password(&email).await?;
    Ok(StatusCode::OK)
}

#[instrument(skip(state, payload))]
async fn recovery_account(
    State(state): State<AppState>,
    Json(payload): Json<RecoveryRequest>,
) -> Result<StatusCode, AuthError> {
    if payload.password.len() < MIN_PASSWORD_LEN {
        return Err(AuthError::BadRequest("password too short".into()));
    }
    state
        .auth
        .recovery_account(&payload.token, &payload.password)
        .await?;
    Ok(StatusCode::OK)
}

#[instrument(skip(state))]
async fn users(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
) -> Result<Json<Vec<PublicUser>>, AuthError> {
    Ok(Json(state.auth.get_users().await?))
}
