//! Account authentication: registration, login, password changes and
//! password reset, all rate limited per client IP.
//!
//! API key signatures are checked in [`api_key`].

pub mod api_key;

use std::sync::Arc;

use serde_json::json;
use tracing::{info, instrument, warn};

use lobster_core::config::Config;
use lobster_core::text::is_printable;
use lobster_crypto::{hash_password, random_alphanumeric, verify_password};

use crate::antiflood;
use crate::error::{PanelError, PanelResult};
use crate::mail::{MailService, MailTemplate};
use crate::storage::{DatabaseError, PanelDatabase, User, UserStatus};

pub use api_key::{ApiCaller, ApiKeyRequest, authenticate_signature, create_api_key};

pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 128;
pub const MIN_PASSWORD_LENGTH: usize = 6;
pub const MAX_PASSWORD_LENGTH: usize = 512;
/// Reset tokens expire this long after being issued.
pub const PWRESET_EXPIRE_SECS: i64 = 60 * 60;

const PWRESET_TOKEN_LENGTH: usize = 32;
const CREATE_LIMIT: i64 = 3;
const CHECK_LIMIT: i64 = 12;
const PWRESET_LIMIT: i64 = 10;

fn validate_password(password: &str) -> PanelResult<()> {
    if (MIN_PASSWORD_LENGTH..=MAX_PASSWORD_LENGTH).contains(&password.len()) {
        Ok(())
    } else {
        Err(PanelError::validation(format!(
            "password must be between {MIN_PASSWORD_LENGTH} and {MAX_PASSWORD_LENGTH} characters"
        )))
    }
}

fn incorrect_credentials() -> PanelError {
    PanelError::validation("incorrect username or password")
}

#[derive(Clone)]
pub struct AuthService {
    db: PanelDatabase,
    mail: MailService,
    config: Arc<Config>,
}

impl AuthService {
    pub const fn new(db: PanelDatabase, mail: MailService, config: Arc<Config>) -> Self {
        Self { db, mail, config }
    }

    /// Register a new account in `new` status.
    #[instrument(skip(self, password, email))]
    pub async fn create(
        &self,
        ip: &str,
        username: &str,
        password: &str,
        email: &str,
    ) -> PanelResult<User> {
        antiflood::require(&self.db, ip, "authCreate", CREATE_LIMIT).await?;

        if !(MIN_USERNAME_LENGTH..=MAX_USERNAME_LENGTH).contains(&username.len()) {
            return Err(PanelError::validation(format!(
                "username must be between {MIN_USERNAME_LENGTH} and {MAX_USERNAME_LENGTH} characters"
            )));
        }
        if !is_printable(username) {
            return Err(PanelError::validation("username contains invalid characters"));
        }
        validate_password(password)?;
        if self.db.get_user_by_username(username).await.is_ok() {
            return Err(PanelError::validation("username is already taken"));
        }
        if self.db.email_taken(email).await? {
            return Err(PanelError::validation("email address is already in use"));
        }

        let user = self
            .db
            .create_user(
                username,
                email,
                &hash_password(password),
                self.config.vm.default_vm_limit,
            )
            .await
            .map_err(|e| match e {
                DatabaseError::Conflict(_) => PanelError::validation("username is already taken"),
                other => other.into(),
            })?;

        self.db
            .log_action(user.id, ip, "Registered account", "")
            .await?;
        antiflood::action(&self.db, ip, "authCreate").await?;
        info!(user_id = user.id, "Account registered");
        self.mail.send(
            None,
            MailTemplate::AccountCreated,
            json!({"user_id": user.id, "username": username, "email": email}),
            false,
        );
        Ok(user)
    }

    /// Check credentials. Failures count against the `authCheck` limit.
    #[instrument(skip(self, password))]
    pub async fn login(&self, ip: &str, username: &str, password: &str) -> PanelResult<User> {
        if password.len() > MAX_PASSWORD_LENGTH {
            return Err(incorrect_credentials());
        }
        antiflood::require(&self.db, ip, "authCheck", CHECK_LIMIT).await?;

        let user = match self.db.get_user_by_username(username).await {
            Ok(user) if user.status != UserStatus::Disabled => user,
            Ok(_) | Err(DatabaseError::NotFound(_)) => {
                warn!(username, ip, "Authentication failure: unknown or disabled user");
                antiflood::action(&self.db, ip, "authCheck").await?;
                return Err(incorrect_credentials());
            }
            Err(e) => return Err(e.into()),
        };

        if !verify_password(password, &user.password).unwrap_or(false) {
            warn!(username, ip, "Authentication failure: bad password");
            antiflood::action(&self.db, ip, "authCheck").await?;
            return Err(incorrect_credentials());
        }

        info!(user_id = user.id, ip, "Authentication successful");
        self.db.log_action(user.id, ip, "Logged in", "").await?;
        Ok(user)
    }

    #[instrument(skip(self, old_password, new_password))]
    pub async fn change_password(
        &self,
        ip: &str,
        user_id: i64,
        old_password: &str,
        new_password: &str,
    ) -> PanelResult<()> {
        validate_password(new_password)?;
        antiflood::require(&self.db, ip, "authCheck", CHECK_LIMIT).await?;

        let user = self.db.get_user(user_id).await?;
        if !verify_password(old_password, &user.password).unwrap_or(false) {
            warn!(user_id, ip, "Change password authentication failure");
            antiflood::action(&self.db, ip, "authCheck").await?;
            return Err(PanelError::validation("incorrect password"));
        }

        self.db
            .set_user_password(user_id, &hash_password(new_password))
            .await?;
        info!(user_id, "Password changed");
        self.db.log_action(user_id, ip, "Change password", "").await?;
        self.mail
            .send(Some(user_id), MailTemplate::AuthChangePassword, json!({}), false);
        Ok(())
    }

    /// Set a password without the old one (admin).
    pub async fn set_password(&self, user_id: i64, password: &str) -> PanelResult<()> {
        validate_password(password)?;
        if !self
            .db
            .set_user_password(user_id, &hash_password(password))
            .await?
        {
            return Err(PanelError::NotFound(format!("User {user_id}")));
        }
        Ok(())
    }

    /// Mail a reset token to the account matching both `username` and
    /// `email`. Every attempt counts against the limit.
    #[instrument(skip(self, email))]
    pub async fn pwreset_request(&self, ip: &str, username: &str, email: &str) -> PanelResult<()> {
        if email.is_empty() {
            return Err(PanelError::validation("an email address is required"));
        }
        antiflood::require(&self.db, ip, "pwreset", PWRESET_LIMIT).await?;
        antiflood::action(&self.db, ip, "pwreset").await?;

        let user = match self.db.get_user_by_username(username).await {
            Ok(user) if user.email == email => user,
            Ok(_) | Err(DatabaseError::NotFound(_)) => {
                return Err(PanelError::validation("incorrect username or email address"));
            }
            Err(e) => return Err(e.into()),
        };

        let token = random_alphanumeric(PWRESET_TOKEN_LENGTH);
        self.db.create_pwreset_token(user.id, &token).await?;
        info!(user_id = user.id, "Password reset requested");
        self.mail.send(
            Some(user.id),
            MailTemplate::PwresetRequest,
            json!({"user_id": user.id, "token": token}),
            false,
        );
        Ok(())
    }

    #[instrument(skip(self, token, password))]
    pub async fn pwreset_submit(
        &self,
        ip: &str,
        user_id: i64,
        token: &str,
        password: &str,
    ) -> PanelResult<()> {
        antiflood::require(&self.db, ip, "pwresetSubmit", PWRESET_LIMIT).await?;
        validate_password(password)?;
        antiflood::action(&self.db, ip, "pwresetSubmit").await?;

        if !self
            .db
            .consume_pwreset_token(user_id, token, PWRESET_EXPIRE_SECS)
            .await?
        {
            return Err(PanelError::validation("invalid or expired reset token"));
        }

        self.db
            .set_user_password(user_id, &hash_password(password))
            .await?;
        info!(user_id, ip, "Password reset");
        self.db.log_action(user_id, ip, "Reset password", "").await?;
        self.mail
            .send(Some(user_id), MailTemplate::AuthChangePassword, json!({}), false);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::harness;

    const IP: &str = "192.0.2.1";

    #[tokio::test]
    async fn create_and_login() {
        let h = harness().await;
        let user = h
            .auth
            .create(IP, "alice", "password123", "alice@example.com")
            .await
            .unwrap();
        assert_eq!(user.status, UserStatus::New);
        assert_eq!(user.vm_limit, h.config.vm.default_vm_limit);
        assert!(h.mailer.wait_for(MailTemplate::AccountCreated).await);

        let logged_in = h.auth.login(IP, "alice", "password123").await.unwrap();
        assert_eq!(logged_in.id, user.id);
        let actions = h.db.list_actions(user.id, 10).await.unwrap();
        let names: Vec<_> = actions.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, ["Logged in", "Registered account"]);
    }

    #[tokio::test]
    async fn create_validates_input() {
        let h = harness().await;
        let cases = [
            ("ab", "password123", ""),
            ("bad\nname", "password123", ""),
            ("alice", "short", ""),
        ];
        for (i, (username, password, email)) in cases.into_iter().enumerate() {
            let ip = format!("10.0.0.{i}");
            let err = h.auth.create(&ip, username, password, email).await.unwrap_err();
            assert!(matches!(err, PanelError::Validation(_)), "{username}: {err}");
        }

        h.auth.create("10.1.0.1", "alice", "password123", "a@example.com").await.unwrap();
        let err = h
            .auth
            .create("10.1.0.2", "alice", "password123", "")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "username is already taken");
        let err = h
            .auth
            .create("10.1.0.3", "bob", "password123", "a@example.com")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "email address is already in use");
    }

    #[tokio::test]
    async fn registration_is_rate_limited() {
        let h = harness().await;
        for name in ["user1", "user2", "user3"] {
            h.auth.create(IP, name, "password123", "").await.unwrap();
        }
        let err = h.auth.create(IP, "user4", "password123", "").await.unwrap_err();
        assert!(matches!(err, PanelError::TryAgainLater));
    }

    #[tokio::test]
    async fn failed_logins_lock_out_ip() {
        let h = harness().await;
        h.auth.create(IP, "alice", "password123", "").await.unwrap();

        for _ in 0..CHECK_LIMIT {
            let err = h.auth.login(IP, "alice", "wrong-password").await.unwrap_err();
            assert_eq!(err.to_string(), "incorrect username or password");
        }
        let err = h.auth.login(IP, "alice", "password123").await.unwrap_err();
        assert!(matches!(err, PanelError::TryAgainLater));

        // Another client is unaffected.
        h.auth.login("198.51.100.7", "alice", "password123").await.unwrap();
    }

    #[tokio::test]
    async fn disabled_user_cannot_login() {
        let h = harness().await;
        let user = h.auth.create(IP, "alice", "password123", "").await.unwrap();
        h.db.set_user_status(user.id, UserStatus::Disabled).await.unwrap();
        assert!(h.auth.login(IP, "alice", "password123").await.is_err());
    }

    #[tokio::test]
    async fn change_password_requires_old_password() {
        let h = harness().await;
        let user = h.auth.create(IP, "alice", "password123", "").await.unwrap();

        let err = h
            .auth
            .change_password(IP, user.id, "nope", "newpassword")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "incorrect password");

        h.auth
            .change_password(IP, user.id, "password123", "newpassword")
            .await
            .unwrap();
        assert!(h.auth.login(IP, "alice", "password123").await.is_err());
        h.auth.login(IP, "alice", "newpassword").await.unwrap();

        h.auth.set_password(user.id, "adminset").await.unwrap();
        h.auth.login(IP, "alice", "adminset").await.unwrap();
    }

    #[tokio::test]
    async fn password_reset_flow() {
        let h = harness().await;
        let user = h
            .auth
            .create(IP, "alice", "password123", "alice@example.com")
            .await
            .unwrap();
        h.db.set_user_status(user.id, UserStatus::Active).await.unwrap();

        let err = h
            .auth
            .pwreset_request(IP, "alice", "other@example.com")
            .await
            .unwrap_err();
        assert!(matches!(err, PanelError::Validation(_)));

        h.auth
            .pwreset_request(IP, "alice", "alice@example.com")
            .await
            .unwrap();
        assert!(h.mailer.wait_for(MailTemplate::PwresetRequest).await);
        let message = h
            .mailer
            .messages()
            .into_iter()
            .find(|m| m.template == MailTemplate::PwresetRequest)
            .unwrap();
        let token = message.params["token"].as_str().unwrap().to_string();

        assert!(h.auth.pwreset_submit(IP, user.id, "wrong", "resetpass").await.is_err());
        h.auth
            .pwreset_submit(IP, user.id, &token, "resetpass")
            .await
            .unwrap();
        h.auth.login(IP, "alice", "resetpass").await.unwrap();

        // Tokens are single use.
        assert!(
            h.auth
                .pwreset_submit(IP, user.id, &token, "another1")
                .await
                .is_err()
        );
    }
}
