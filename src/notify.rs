//! Failure notification delivery.
//!
//! A failed run produces one [`Notification`] that is handed to the
//! configured [`Notifier`]: SMTP through `lettre`, a JSON webhook through
//! `reqwest`, or an ERROR log event when no transport is configured.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::config::{NotifyConfig, NotifyKind, SmtpConfig};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("SMTP transport error: {0}")]
    Transport(#[from] lettre::transport::smtp::Error),

    #[error("email address parse error: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("email build error: {0}")]
    Build(String),

    #[error("webhook delivery failed: {0}")]
    Webhook(#[from] reqwest::Error),

    #[error("notifier misconfigured: {0}")]
    Config(String),
}

/// A message for the alerting address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Everything a failure message says about the run.
#[derive(Debug, Clone)]
pub struct FailureContext<'a> {
    pub job: &'a str,
    pub run_number: u64,
    pub step: &'a str,
    pub class: &'a str,
    pub error: &'a str,
    pub log_url: &'a str,
}

impl Notification {
    pub fn failure(to: &str, ctx: &FailureContext<'_>) -> Self {
        let subject = format!("FAILED: Job '{}' [#{}]", ctx.job, ctx.run_number);
        let body = format!(
            "The scheduled job '{job}' failed.\n\
             \n\
             Run:    #{run}\n\
             Step:   {step}\n\
             Class:  {class}\n\
             Error:  {error}\n\
             \n\
             Log: {log}\n",
            job = ctx.job,
            run = ctx.run_number,
            step = ctx.step,
            class = ctx.class,
            error = ctx.error,
            log = ctx.log_url,
        );
        Self {
            to: to.to_string(),
            subject,
            body,
        }
    }
}

/// Delivers notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Build the notifier selected by `config`.
pub fn from_config(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    match config.kind {
        NotifyKind::Log => Ok(Arc::new(LogNotifier)),
        NotifyKind::Smtp => Ok(Arc::new(SmtpNotifier::new(config.smtp.clone()))),
        NotifyKind::Webhook => {
            let url = config
                .webhook_url
                .clone()
                .ok_or_else(|| NotifyError::Config("webhook_url is not set".to_string()))?;
            Ok(Arc::new(WebhookNotifier::new(url)))
        }
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

/// Emits the notification as an ERROR event.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        error!(to = %n.to, subject = %n.subject, body = %n.body, "run failure notification");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SMTP
// ---------------------------------------------------------------------------

/// Sends plain-text mail through an SMTP relay.
pub struct SmtpNotifier {
    config: SmtpConfig,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn password(&self) -> Option<String> {
        self.config
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &'static str {
        "smtp"
    }

    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        use lettre::{
            message::header::ContentType, transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let email = Message::builder()
            .from(self.config.from_address.parse()?)
            .to(n.to.parse()?)
            .subject(n.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(n.body.clone())
            .map_err(|e| NotifyError::Build(e.to_string()))?;

        let builder = if self.config.starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.host)
        };
        let mut builder = builder.port(self.config.port);

        if let (Some(user), Some(pass)) = (&self.config.username, self.password()) {
            builder = builder.credentials(Credentials::new(user.clone(), pass));
        }

        builder.build().send(email).await?;
        info!(to = %n.to, "notification email sent");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// POSTs the notification as JSON.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, n: &Notification) -> Result<(), NotifyError> {
        self.client
            .post(&self.url)
            .json(n)
            .send()
            .await?
            .error_for_status()?;
        info!(url = %self.url, "notification webhook delivered");
        Ok(())
    }
}
