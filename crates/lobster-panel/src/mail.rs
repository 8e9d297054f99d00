//! Outbound notifications.
//!
//! The panel decides who gets which template with which parameters; turning
//! that into an e-mail body is left to the [`Mailer`] backend. Delivery runs
//! in spawned tasks and never fails the calling operation.

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use lobster_core::config::Config;

use crate::storage::{PanelDatabase, UserStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum MailTemplate {
    AccountCreated,
    AuthChangePassword,
    PwresetRequest,
    PaymentProcessed,
    VmCreate,
    VmCreateError,
    VmDeleted,
    VmUnsuspend,
    UserLowCredit,
    UserNegativeCredit,
    UserSuspend,
    UserTerminate,
    BandwidthNotify,
    BandwidthOverage,
    Error,
}

impl MailTemplate {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AccountCreated => "accountCreated",
            Self::AuthChangePassword => "authChangePassword",
            Self::PwresetRequest => "pwresetRequest",
            Self::PaymentProcessed => "paymentProcessed",
            Self::VmCreate => "vmCreate",
            Self::VmCreateError => "vmCreateError",
            Self::VmDeleted => "vmDeleted",
            Self::VmUnsuspend => "vmUnsuspend",
            Self::UserLowCredit => "userLowCredit",
            Self::UserNegativeCredit => "userNegativeCredit",
            Self::UserSuspend => "userSuspend",
            Self::UserTerminate => "userTerminate",
            Self::BandwidthNotify => "bandwidthNotify",
            Self::BandwidthOverage => "bandwidthOverage",
            Self::Error => "error",
        }
    }
}

/// A resolved message ready for a backend.
#[derive(Debug, Clone, Serialize)]
pub struct MailMessage {
    pub template: MailTemplate,
    pub from: String,
    /// Empty when only the admin copy is sent.
    pub to: String,
    /// Admin address copied in, if any.
    pub bcc: Option<String>,
    pub user_id: Option<i64>,
    pub username: String,
    pub url_base: String,
    pub params: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),

    #[error("mail recipient lookup failed: {0}")]
    Recipient(String),
}

/// Mail delivery backend.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn deliver(&self, message: &MailMessage) -> Result<(), MailError>;
}

/// Logs messages instead of sending them.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn deliver(&self, message: &MailMessage) -> Result<(), MailError> {
        info!(
            template = message.template.as_str(),
            to = %message.to,
            bcc = ?message.bcc,
            params = %message.params,
            "Mail (not delivered, no relay configured)"
        );
        Ok(())
    }
}

/// Posts each message as JSON to a mail relay.
pub struct WebhookMailer {
    http: reqwest::Client,
    url: String,
}

impl WebhookMailer {
    pub fn new(url: &str) -> Result<Self, MailError> {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| MailError::Delivery(e.to_string()))?;
        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl Mailer for WebhookMailer {
    async fn deliver(&self, message: &MailMessage) -> Result<(), MailError> {
        let response = self
            .http
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| MailError::Delivery(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MailError::Delivery(format!(
                "relay answered {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Default)]
pub struct RecordingMailer {
    messages: Mutex<Vec<MailMessage>>,
}

impl RecordingMailer {
    pub fn messages(&self) -> Vec<MailMessage> {
        self.messages
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    pub fn templates(&self) -> Vec<MailTemplate> {
        self.messages().into_iter().map(|m| m.template).collect()
    }

    /// Wait until a message with `template` was delivered, up to two seconds.
    pub async fn wait_for(&self, template: MailTemplate) -> bool {
        for _ in 0..200 {
            if self.templates().contains(&template) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn deliver(&self, message: &MailMessage) -> Result<(), MailError> {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(message.clone());
        }
        Ok(())
    }
}

/// Resolves recipients and hands messages to the backend.
#[derive(Clone)]
pub struct MailService {
    mailer: Arc<dyn Mailer>,
    db: PanelDatabase,
    admin_email: String,
    from_email: String,
    url_base: String,
}

impl MailService {
    pub fn new(mailer: Arc<dyn Mailer>, db: PanelDatabase, config: &Config) -> Self {
        Self {
            mailer,
            db,
            admin_email: config.default.admin_email.clone(),
            from_email: config.default.from_email.clone(),
            url_base: config.default.url_base.clone(),
        }
    }

    /// Pick the backend from configuration: the webhook relay if one is set,
    /// otherwise log only.
    pub fn mailer_from_config(config: &Config) -> Result<Arc<dyn Mailer>, MailError> {
        Ok(match &config.email.webhook_url {
            Some(url) if !url.is_empty() => Arc::new(WebhookMailer::new(url)?),
            _ => Arc::new(LogMailer),
        })
    }

    /// Send `template` to a user (or to the admin when `user_id` is `None`)
    /// in the background.
    ///
    /// Users still in `new` status have no verified address and only get
    /// mail through the admin copy.
    pub fn send(&self, user_id: Option<i64>, template: MailTemplate, params: Value, cc_admin: bool) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.deliver(user_id, template, params, cc_admin).await {
                service.report_error(
                    &e,
                    "failed to send email",
                    &format!("user_id={user_id:?}, template={}", template.as_str()),
                );
            }
        });
    }

    async fn deliver(
        &self,
        user_id: Option<i64>,
        template: MailTemplate,
        params: Value,
        cc_admin: bool,
    ) -> Result<(), MailError> {
        let (to, username) = match user_id {
            Some(id) => {
                let user = self
                    .db
                    .get_user(id)
                    .await
                    .map_err(|e| MailError::Recipient(e.to_string()))?;
                let to = if user.status == UserStatus::New {
                    String::new()
                } else {
                    user.email
                };
                (to, user.username)
            }
            None => (self.admin_email.clone(), "N/A".to_string()),
        };

        if to.is_empty() && !cc_admin {
            return Ok(());
        }

        let message = MailMessage {
            template,
            from: self.from_email.clone(),
            to,
            bcc: cc_admin.then(|| self.admin_email.clone()),
            user_id,
            username,
            url_base: self.url_base.clone(),
            params,
        };
        info!(template = template.as_str(), to = %message.to, "Sending email");
        self.mailer.deliver(&message).await
    }

    /// Log an operational failure and mail the `error` template to the admin.
    pub fn report_error(&self, err: &dyn Display, description: &str, detail: &str) {
        if !detail.is_empty() {
            warn!(detail, "{description}");
        }
        error!(error = %err, "{description}");

        let service = self.clone();
        let params = json!({
            "error": err.to_string(),
            "description": description,
            "detail": detail,
        });
        tokio::spawn(async move {
            // A failing report is logged but not reported again.
            if let Err(e) = service.deliver(None, MailTemplate::Error, params, false).await {
                error!(error = %e, "Failed to deliver error report");
            }
        });
    }
}
