use std::sync::Arc;

use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::auth::repo::PgStore;
use crate::auth::services::{AuthService, JwtKeys};
use crate::config::AppConfig;
use crate::mailer::{MailRelay, Mailer};

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthService>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;

        let mailer = Arc::new(MailRelay::new(&config.mail)) as Arc<dyn Mailer>;
        let store = Arc::new(PgStore::new(db.clone()));
        let auth = Arc::new(AuthService::new(
            store,
            mailer,
            JwtKeys::new(&config.jwt),
            config.client_url.clone(),
            config.api_url.clone(),
        ));

        Ok(Self { db, config, auth })
    }
}
