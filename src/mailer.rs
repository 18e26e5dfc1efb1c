use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;

use crate::config::MailConfig;

/// Outbound mail seam. The auth service only ever needs "send this HTML to
/// this address"; transport details stay behind this trait so tests can swap
/// in a recording fake.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()>;
}

#[derive(Serialize)]
struct RelayRequest<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Mail client posting JSON to an HTTP mail relay.
#[derive(Clone)]
pub struct MailRelay {
    http: reqwest::Client,
    base_url: String,
    token: String,
    sender: String,
}

impl MailRelay {
    pub fn new(config: &MailConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.relay_url.clone(),
            token: config.relay_token.clone(),
            sender: config.sender.clone(),
        }
    }
}

#[async_trait]
impl Mailer for MailRelay {
    async fn send(&self, to: &str, subject: &str, html: &str) -> anyhow::Result<()> {
        let url = format!("{}/email", self.base_url);
        let request = RelayRequest {
            from: &self.sender,
            to,
            subject,
            html,
        };

        self.http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .context("mail relay unreachable")?
            .error_for_status()
            .context("mail relay rejected message")?;

        tracing::info!(to = %to, subject = %subject, "mail sent");
        Ok(())
    }
}

pub fn activation_email(link: &str) -> (String, String) {
    let subject = "Activate your account".to_string();
    let html = format!(
        r#"<div>
  <a href="{link}">Click to activate your account</a>
</div>"#
    );
    (subject, html)
}

pub fn recovery_email(link: &str) -> (String, String) {
    let subject = "Password recovery".to_string();
    let html = format!(
        r#"<div>
  <h1>If you want to recover your account, follow the link below.</h1>
  <a href="{link}">Link to recover your account</a>
  <b>This link only works for a short time.</b>
</div>"#
    );
    (subject, html)
}
