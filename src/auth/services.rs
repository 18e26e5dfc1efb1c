use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, response::Response};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use lazy_static::lazy_static;
use regex::Regex;
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::claims::{Claims, TokenKind};
use crate::auth::dto::{AuthResponse, PublicUser};
use crate::auth::password::{hash_password, verify_password};
use crate::auth::repo::CredentialStore;
use crate::config::JwtConfig;
use crate::mailer::{activation_email, recovery_email, Mailer};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Domain failures surfaced by the auth flows. Infrastructure errors pass
/// through as Internal and are never downgraded.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    pub fn unauthorized() -> Self {
        AuthError::Unauthorized("unauthorized".into())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AuthError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AuthError::Internal(e) => {
                error!(error = %e, "internal error in auth flow");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".into(),
                )
            }
        };
        (status, message).into_response()
    }
}

/// Signs and verifies the access/refresh token pair. Both tokens carry the
/// same public-user payload; they differ in secret and lifetime.
#[derive(Clone)]
pub struct JwtKeys {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    issuer: String,
    audience: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtKeys {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(config.access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(config.access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(config.refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(config.refresh_secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            access_ttl: Duration::from_secs((config.access_ttl_minutes as u64) * 60),
            refresh_ttl: Duration::from_secs((config.refresh_ttl_days as u64) * 24 * 3600),
        }
    }

    fn sign_with_kind(&self, user: &PublicUser, kind: TokenKind) -> anyhow::Result<String> {
        let now = OffsetDateTime::now_utc();
        let (ttl, key) = match kind {
            TokenKind::Access => (self.access_ttl, &self.access_encoding),
            TokenKind::Refresh => (self.refresh_ttl, &self.refresh_encoding),
        };
        let exp = now + TimeDuration::seconds(ttl.as_secs() as i64);
        let claims = Claims {
            sub: user.id,
            email: user.email.clone(),
            is_activated: user.is_activated,
            iat: now.unix_timestamp() as usize,
            exp: exp.unix_timestamp() as usize,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: Uuid::new_v4(),
            kind,
        };
        let token = encode(&Header::default(), &claims, key)?;
        debug!(user_id = %user.id, kind = ?kind, "jwt signed");
        Ok(token)
    }

    pub fn sign_access(&self, user: &PublicUser) -> anyhow::Result<String> {
        self.sign_with_kind(user, TokenKind::Access)
    }

    pub fn sign_refresh(&self, user: &PublicUser) -> anyhow::Result<String> {
        self.sign_with_kind(user, TokenKind::Refresh)
    }

    fn verify_with_kind(&self, token: &str, kind: TokenKind) -> anyhow::Result<Claims> {
        let key = match kind {
            TokenKind::Access => &self.access_decoding,
            TokenKind::Refresh => &self.refresh_decoding,
        };
        let mut validation = Validation::default();
        validation.set_audience(std::slice::from_ref(&self.audience));
        validation.set_issuer(std::slice::from_ref(&self.issuer));
        let data = decode::<Claims>(token, key, &validation)?;
        if data.claims.kind != kind {
            anyhow::bail!("unexpected token kind");
        }
        Ok(data.claims)
    }

    /// Stateless check: signature and expiry only.
    pub fn verify_access(&self, token: &str) -> anyhow::Result<Claims> {
        self.verify_with_kind(token, TokenKind::Access)
    }

    /// Stateless half of refresh validation; callers must additionally check
    /// the stored token slot.
    pub fn verify_refresh(&self, token: &str) -> anyhow::Result<Claims> {
        self.verify_with_kind(token, TokenKind::Refresh)
    }
}

/// Orchestrates registration, login, logout, refresh, activation and the
/// password recovery flows. Constructed once at startup and shared through
/// AppState.
pub struct AuthService {
    store: Arc<dyn CredentialStore>,
    mailer: Arc<dyn Mailer>,
    keys: JwtKeys,
    client_url: String,
    api_url: String,
}

impl AuthService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        mailer: Arc<dyn Mailer>,
        keys: JwtKeys,
        client_url: String,
        api_url: String,
    ) -> Self {
        Self {
            store,
            mailer,
            keys,
            client_url,
            api_url,
        }
    }

    pub fn keys(&self) -> &JwtKeys {
        &self.keys
    }

    /// Signs a fresh pair and claims the user's single refresh-token slot,
    /// invalidating whatever token held it before.
    async fn issue_session(&self, user: PublicUser) -> Result<AuthResponse, AuthError> {
        let access_token = self.keys.sign_access(&user)?;
        let refresh_token = self.keys.sign_refresh(&user)?;
        self.store
            .upsert_refresh_token(user.id, &refresh_token)
            .await?;
        Ok(AuthResponse {
            access_token,
            refresh_token,
            user,
        })
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<AuthResponse, AuthError> {
        if self.store.find_user_by_email(email).await?.is_some() {
            warn!(email = %email, "registration with existing email");
            return Err(AuthError::BadRequest(format!(
                "user with email {email} is already registered"
            )));
        }

        let hash = hash_password(password)?;
        let user = self.store.create_user(email, &hash).await?;
        let view = PublicUser::from(&user);

        let link = format!("{}/api/auth/activation/{}", self.api_url, view.id);
        let (subject, html) = activation_email(&link);
        self.mailer.send(email, &subject, &html).await?;

        info!(user_id = %view.id, email = %view.email, "user registered");
        self.issue_session(view).await
    }

    pub async fn activation(&self, user_id: Uuid) -> Result<(), AuthError> {
        let updated = self.store.set_activated(user_id).await?;
        if !updated {
            return Err(AuthError::BadRequest("user is not found".into()));
        }
        info!(user_id = %user_id, "account activated");
        Ok(())
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse, AuthError> {
        let user = self
            .store
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| AuthError::BadRequest("user is not found".into()))?;

        if !verify_password(password, &user.password_hash)? {
            warn!(user_id = %user.id, "login with incorrect password");
            return Err(AuthError::Unauthorized("password is incorrect".into()));
        }

        info!(user_id = %user.id, email = %user.email, "user logged in");
        self.issue_session(PublicUser::from(&user)).await
    }

    /// Missing tokens are tolerated; logout never fails on a token we no
    /// longer recognize.
    pub async fn logout(&self, refresh_token: &str) -> Result<bool, AuthError> {
        let removed = self.store.delete_refresh_token(refresh_token).await?;
        if !removed {
            debug!("logout with unknown refresh token");
        }
        Ok(removed)
    }

    /// Token rotation: a refresh token is good for exactly one refresh, after
    /// which the stored slot holds its replacement. The user is re-read from
    /// the store because the activation flag in the payload may be stale.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthResponse, AuthError> {
        let claims = self
            .keys
            .verify_refresh(refresh_token)
            .map_err(|_| AuthError::unauthorized())?;

        if self.store.find_refresh_token(refresh_token).await?.is_none() {
            warn!(user_id = %claims.sub, "refresh token not recognized (rotated or revoked)");
            return Err(AuthError::unauthorized());
        }

        let user = self
            .store
            .find_user_by_id(claims.sub)
            .await?
            .ok_or_else(AuthError::unauthorized)?;

        self.issue_session(PublicUser::from(&user)).await
    }

    pub async fn get_users(&self) -> Result<Vec<PublicUser>, AuthError> {
        let users = self.store.list_users().await?;
        Ok(users.iter().map(PublicUser::from).collect())
    }

    /// Emails a recovery link embedding an access token; writes nothing to
    /// the store.
    pub async fn forgot_password(&self, email: &str) -> Result<(), AuthError> {
        if email.trim().is_empty() {
            return Err(AuthError::BadRequest("email is required".into()));
        }

        let user = self
            .store
            .find_user_by_email(email)
            .await?
            .ok_or_else(|| AuthError::BadRequest("user with this email is not found".into()))?;

        let reset_token = self.keys.sign_access(&PublicUser::from(&user))?;
        let link = format!("{}/recovery-account/{}", self.client_url, reset_token);
        let (subject, html) = recovery_email(&link);
        self.mailer.send(email, &subject, &html).await?;

        info!(user_id = %user.id, "recovery mail sent");
        Ok(())
    }

    pub async fn recovery_account(&self, token: &str, password: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::BadRequest("recovery token is required".into()));
        }

        let claims = self
            .keys
            .verify_access(token)
            .map_err(|_| AuthError::unauthorized())?;

        let hash = hash_password(password)?;
        let updated = self.store.update_password(claims.sub, &hash).await?;
        if !updated {
            return Err(AuthError::BadRequest("user is not found".into()));
        }

        info!(user_id = %claims.sub, "password recovered");
        Ok(())
    }
}


#[cfg(test)]
mod flow_tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::auth::repo_types::User;

    #[derive(Default)]
    struct MemoryStore {
        users: Mutex<Vec<User>>,
        tokens: Mutex<HashMap<Uuid, String>>,
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn find_user_by_email(&self, email: &str) -> anyhow::Result<Option<User>> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.email == email)
                .cloned())
        }

        async fn find_user_by_id(&self, id: Uuid) -> anyhow::Result<Option<User>> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .find(|u| u.id == id)
                .cloned())
        }

        async fn create_user(&self, email: &str, password_hash: &str) -> anyhow::Result<User> {
            let user = User {
                id: Uuid::new_v4(),
                email: email.to_string(),
                password_hash: password_hash.to_string(),
                is_activated: false,
                created_at: OffsetDateTime::now_utc(),
            };
            self.users.lock().unwrap().push(user.clone());
            Ok(user)
        }

        async fn set_activated(&self, id: Uuid) -> anyhow::Result<bool> {
            let mut users = self.users.lock().unwrap();
            match users.iter_mut().find(|u| u.id == id) {
                Some(user) => {
                    user.is_activated = true;
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn update_password(&self, id: Uuid, password_hash: &str) -> anyhow::Result<bool> {
            let mut users = self.users.lock().unwrap();
            match users.iter_mut().find(|u| u.id == id) {
                Some(user) => {
                    user.password_hash = password_hash.to_string();
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn list_users(&self) -> anyhow::Result<Vec<User>> {
            Ok(self.users.lock().unwrap().clone())
        }

        async fn upsert_refresh_token(&self, user_id: Uuid, token: &str) -> anyhow::Result<()> {
            self.tokens
                .lock()
                .unwrap()
                .insert(user_id, token.to_string());
            Ok(())
        }

        async fn delete_refresh_token(&self, token: &str) -> anyhow::Result<bool> {
            let mut tokens = self.tokens.lock().unwrap();
            let owner = tokens
                .iter()
                .find(|(_, t)| t.as_str() == token)
                .map(|(u, _)| *u);
            match owner {
                Some(user_id) => {
                    tokens.remove(&user_id);
                    Ok(true)
                }
                None => Ok(false),
            }
        }

        async fn find_refresh_token(&self, token: &str) -> anyhow::Result<Option<Uuid>> {
            Ok(self
                .tokens
                .lock()
                .unwrap()
                .iter()
                .find(|(_, t)| t.as_str() == token)
                .map(|(u, _)| *u))
        }
    }

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((to.to_string(), subject.to_string(), html.to_string()));
            Ok(())
        }
    }

    fn service() -> (AuthService, Arc<MemoryStore>, Arc<RecordingMailer>) {
        let store = Arc::new(MemoryStore::default());
        let mailer = Arc::new(RecordingMailer::default());
        let keys = JwtKeys::new(&JwtConfig {
            access_secret: "access-test-secret-with-decent-length".into(),
            refresh_secret: "refresh-test-secret-with-decent-length".into(),
            issuer: "test-issuer".into(),
            audience: "test-aud".into(),
            access_ttl_minutes: 5,
            refresh_ttl_days: 7,
        });
        let auth = AuthService::new(
            store.clone(),
            mailer.clone(),
            keys,
            "https://client.test".into(),
            "https://api.test".into(),
        );
        (auth, store, mailer)
    }

    #[tokio::test]
    async fn register_rejects_duplicate_email_and_creates_no_second_user() {
        let (auth, store, _) = service();
        auth.register("dup@example.com", "password-1").await.expect("first register");

        let err = auth
            .register("dup@example.com", "password-2")
            .await
            .expect_err("duplicate must fail");
        assert!(matches!(err, AuthError::BadRequest(_)));
        assert_eq!(store.users.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn register_stores_exactly_the_returned_refresh_token() {
        let (auth, store, _) = service();
        let session = auth.register("new@example.com", "password-1").await.expect("register");

        let tokens = store.tokens.lock().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens.get(&session.user.id), Some(&session.refresh_token));
    }

    #[tokio::test]
    async fn register_sends_one_activation_mail_with_link() {
        let (auth, _, mailer) = service();
        let session = auth.register("new@example.com", "password-1").await.expect("register");

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (to, _, html) = &sent[0];
        assert_eq!(to, "new@example.com");
        assert!(html.contains(&format!(
            "https://api.test/api/auth/activation/{}",
            session.user.id
        )));
    }

    #[tokio::test]
    async fn login_succeeds_with_correct_credentials() {
        let (auth, _, _) = service();
        auth.register("who@example.com", "right-password").await.expect("register");

        let session = auth.login("who@example.com", "right-password").await.expect("login");
        assert_eq!(session.user.email, "who@example.com");
        assert!(auth.keys().verify_access(&session.access_token).is_ok());
    }

    #[tokio::test]
    async fn login_with_wrong_password_is_unauthorized() {
        let (auth, _, _) = service();
        auth.register("who@example.com", "right-password").await.expect("register");

        let err = auth
            .login("who@example.com", "wrong-password")
            .await
            .expect_err("must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn login_with_unknown_email_is_bad_request() {
        let (auth, _, _) = service();
        let err = auth
            .login("nobody@example.com", "whatever-pass")
            .await
            .expect_err("must fail");
        assert!(matches!(err, AuthError::BadRequest(_)));
    }

    #[tokio::test]
    async fn refresh_rotates_and_only_latest_token_is_valid() {
        let (auth, _, _) = service();
        let first = auth.register("rot@example.com", "password-1").await.expect("register");
        // Second login claims the single slot; the first token is now stale.
        let second = auth.login("rot@example.com", "password-1").await.expect("login");

        let err = auth
            .refresh(&first.refresh_token)
            .await
            .expect_err("stale token must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));

        let third = auth.refresh(&second.refresh_token).await.expect("refresh");
        assert_ne!(third.refresh_token, second.refresh_token);

        // One refresh per rotation cycle: the token just spent is dead too.
        let err = auth
            .refresh(&second.refresh_token)
            .await
            .expect_err("spent token must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn refresh_rejects_forged_and_missing_tokens() {
        let (auth, _, _) = service();
        let err = auth.refresh("garbage.token.value").await.expect_err("must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn refresh_rederives_activation_flag_from_store() {
        let (auth, _, _) = service();
        let session = auth.register("fresh@example.com", "password-1").await.expect("register");
        assert!(!session.user.is_activated);

        auth.activation(session.user.id).await.expect("activation");

        // The old refresh token still says is_activated=false; the session
        // built from it must not.
        let refreshed = auth.refresh(&session.refresh_token).await.expect("refresh");
        assert!(refreshed.user.is_activated);
    }

    #[tokio::test]
    async fn logout_revokes_refresh_token() {
        let (auth, _, _) = service();
        let session = auth.register("bye@example.com", "password-1").await.expect("register");

        let removed = auth.logout(&session.refresh_token).await.expect("logout");
        assert!(removed);

        let err = auth
            .refresh(&session.refresh_token)
            .await
            .expect_err("refresh after logout must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn logout_with_unknown_token_is_a_noop() {
        let (auth, _, _) = service();
        let removed = auth.logout("never-issued").await.expect("logout must not fail");
        assert!(!removed);
    }

    #[tokio::test]
    async fn activation_sets_flag_and_is_idempotent() {
        let (auth, store, _) = service();
        let session = auth.register("act@example.com", "password-1").await.expect("register");

        auth.activation(session.user.id).await.expect("first activation");
        auth.activation(session.user.id).await.expect("second activation");

        let users = store.users.lock().unwrap();
        assert!(users[0].is_activated);
    }

    #[tokio::test]
    async fn activation_of_unknown_user_is_bad_request() {
        let (auth, _, _) = service();
        let err = auth.activation(Uuid::new_v4()).await.expect_err("must fail");
        assert!(matches!(err, AuthError::BadRequest(_)));
    }

    #[tokio::test]
    async fn forgot_password_with_unknown_email_sends_nothing() {
        let (auth, _, mailer) = service();
        let err = auth
            .forgot_password("ghost@example.com")
            .await
            .expect_err("must fail");
        assert!(matches!(err, AuthError::BadRequest(_)));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forgot_password_sends_one_mail_with_valid_reset_token() {
        let (auth, _, mailer) = service();
        let session = auth.register("lost@example.com", "password-1").await.expect("register");
        mailer.sent.lock().unwrap().clear();

        auth.forgot_password("lost@example.com").await.expect("forgot");

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let token = reset_token_from_mail(&sent[0].2);
        let claims = auth.keys().verify_access(&token).expect("token in link must verify");
        assert_eq!(claims.sub, session.user.id);
    }

    #[tokio::test]
    async fn recovery_account_replaces_the_effective_password() {
        let (auth, _, mailer) = service();
        auth.register("rec@example.com", "old-password").await.expect("register");
        mailer.sent.lock().unwrap().clear();

        auth.forgot_password("rec@example.com").await.expect("forgot");
        let token = {
            let sent = mailer.sent.lock().unwrap();
            reset_token_from_mail(&sent[0].2)
        };

        auth.recovery_account(&token, "new-password").await.expect("recovery");

        let err = auth
            .login("rec@example.com", "old-password")
            .await
            .expect_err("old password must fail");
        assert!(matches!(err, AuthError::Unauthorized(_)));
        auth.login("rec@example.com", "new-password").await.expect("new password works");
    }

    #[tokio::test]
    async fn recovery_account_rejects_missing_and_invalid_tokens() {
        let (auth, _, _) = service();
        let err = auth.recovery_account("", "new-password").await.expect_err("empty");
        assert!(matches!(err, AuthError::BadRequest(_)));

        let err = auth
            .recovery_account("mangled.reset.token", "new-password")
            .await
            .expect_err("invalid");
        assert!(matches!(err, AuthError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn get_users_returns_public_projection_of_everyone() {
        let (auth, _, _) = service();
        auth.register("a@example.com", "password-1").await.expect("register a");
        auth.register("b@example.com", "password-2").await.expect("register b");

        let users = auth.get_users().await.expect("get_users");
        assert_eq!(users.len(), 2);
        let emails: Vec<_> = users.iter().map(|u| u.email.as_str()).collect();
        assert!(emails.contains(&"a@example.com"));
        assert!(emails.contains(&"b@example.com"));
    }

    /// Pulls the reset token out of the recovery mail's link.
    fn reset_token_from_mail(html: &str) -> String {
        let marker = "/recovery-account/";
        let start = html.find(marker).expect("mail contains recovery link") + marker.len();
        html[start..]
            .chars()
            .take_while(|c| *c != '"')
            .collect()
    }
}
