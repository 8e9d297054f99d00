//! Session, CSRF token, API key, anti-flood and password reset queries.

use lobster_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{ApiKey, Session};

/// Parameters for storing a new API key.
pub struct ApiKeyParams<'a> {
    pub user_id: i64,
    pub label: &'a str,
    pub api_id: &'a str,
    pub api_key: &'a str,
    pub restrict_action: &'a str,
    pub restrict_ip: &'a str,
}

impl PanelDatabase {
    // =========================================================================
    // Sessions
    // =========================================================================

    /// Create an anonymous session.
    pub async fn create_session(&self, uid: &str) -> Result<Session, DatabaseError> {
        sqlx::query("INSERT INTO sessions (uid, active_time) VALUES (?, ?)")
            .bind(uid)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        self.get_session(uid, i64::MAX)
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Session {uid}")))
    }

    /// Get a session that was active within the last `max_age_secs`.
    pub async fn get_session(
        &self,
        uid: &str,
        max_age_secs: i64,
    ) -> Result<Option<Session>, DatabaseError> {
        let cutoff = unix_timestamp().saturating_sub(max_age_secs);
        let session = sqlx::query_as::<_, Session>(
            "SELECT * FROM sessions WHERE uid = ? AND active_time > ?",
        )
        .bind(uid)
        .bind(cutoff)
        .fetch_optional(self.pool())
        .await?;
        Ok(session)
    }

    /// Persist a session's login state and bump its activity time.
    pub async fn save_session(&self, session: &Session) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE sessions SET user_id = ?, admin = ?, original_id = ?, regenerate = ?, active_time = ? WHERE uid = ?",
        )
        .bind(session.user_id)
        .bind(session.admin)
        .bind(session.original_id)
        .bind(session.regenerate)
        .bind(unix_timestamp())
        .bind(&session.uid)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Move a session to a fresh identifier, dropping its form tokens.
    pub async fn rename_session(&self, old_uid: &str, new_uid: &str) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE sessions SET uid = ?, regenerate = 0, active_time = ? WHERE uid = ?")
            .bind(new_uid)
            .bind(unix_timestamp())
            .bind(old_uid)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM form_tokens WHERE session_uid = ?")
            .bind(old_uid)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete_session(&self, uid: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM sessions WHERE uid = ?")
            .bind(uid)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn cleanup_sessions(&self, max_age_secs: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE active_time < ?")
            .bind(unix_timestamp() - max_age_secs)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Form (CSRF) tokens
    // =========================================================================

    pub async fn insert_form_token(&self, session_uid: &str, token: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO form_tokens (session_uid, token, time) VALUES (?, ?, ?)")
            .bind(session_uid)
            .bind(token)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Consume a token issued to `session_uid` within `max_age_secs`.
    ///
    /// A token is accepted at most once.
    pub async fn consume_form_token(
        &self,
        session_uid: &str,
        token: &str,
        max_age_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM form_tokens WHERE session_uid = ? AND token = ? AND time > ?",
        )
        .bind(session_uid)
        .bind(token)
        .bind(unix_timestamp() - max_age_secs)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_form_tokens(&self, max_age_secs: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM form_tokens WHERE time < ?")
            .bind(unix_timestamp() - max_age_secs)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // API keys
    // =========================================================================

    pub async fn create_api_key(&self, params: &ApiKeyParams<'_>) -> Result<ApiKey, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO api_keys (user_id, label, api_id, api_key, restrict_action, restrict_ip, time_created) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.label)
        .bind(params.api_id)
        .bind(params.api_key)
        .bind(params.restrict_action)
        .bind(params.restrict_ip)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        let id = result.last_insert_rowid();
        sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("API key {id}")))
    }

    pub async fn list_api_keys(&self, user_id: i64) -> Result<Vec<ApiKey>, DatabaseError> {
        let keys = sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(keys)
    }

    pub async fn delete_api_key(&self, id: i64, user_id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Find a key that may authenticate a request carrying `nonce`: the
    /// stored nonce must be lower and the owner must not be disabled.
    pub async fn find_api_key_for_nonce(
        &self,
        api_id: &str,
        nonce: i64,
    ) -> Result<Option<ApiKey>, DatabaseError> {
        let key = sqlx::query_as::<_, ApiKey>(
            "SELECT api_keys.* FROM api_keys JOIN users ON users.id = api_keys.user_id \
             WHERE api_keys.api_id = ? AND api_keys.nonce < ? AND users.status != 'disabled'",
        )
        .bind(api_id)
        .bind(nonce)
        .fetch_optional(self.pool())
        .await?;
        Ok(key)
    }

    /// Raise the stored nonce; never lowers it.
    pub async fn bump_api_nonce(&self, id: i64, nonce: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE api_keys SET nonce = MAX(nonce, ?) WHERE id = ?")
            .bind(nonce)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    // =========================================================================
    // Anti-flood
    // =========================================================================

    /// Count one occurrence of `action` from `ip`, extending the row seen
    /// within `window_secs` or starting a new one.
    pub async fn antiflood_record(
        &self,
        ip: &str,
        action: &str,
        window_secs: i64,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "UPDATE antiflood SET count = count + 1, time = ? WHERE ip = ? AND action = ? AND time > ?",
        )
        .bind(now)
        .bind(ip)
        .bind(action)
        .bind(now - window_secs)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            sqlx::query("INSERT INTO antiflood (ip, action, count, time) VALUES (?, ?, 1, ?)")
                .bind(ip)
                .bind(action)
                .bind(now)
                .execute(self.pool())
                .await?;
        }
        Ok(())
    }

    /// Whether `ip` reached `max` occurrences of `action` within `window_secs`.
    pub async fn antiflood_exceeded(
        &self,
        ip: &str,
        action: &str,
        max: i64,
        window_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM antiflood WHERE ip = ? AND action = ? AND count >= ? AND time > ?",
        )
        .bind(ip)
        .bind(action)
        .bind(max)
        .bind(unix_timestamp() - window_secs)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn antiflood_cleanup(&self, max_age_secs: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM antiflood WHERE time < ?")
            .bind(unix_timestamp() - max_age_secs)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Password reset tokens
    // =========================================================================

    /// Store a reset token, replacing any outstanding one for the user.
    pub async fn create_pwreset_token(&self, user_id: i64, token: &str) -> Result<(), DatabaseError> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM pwreset_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO pwreset_tokens (user_id, token, time) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(token)
            .bind(unix_timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Consume a reset token issued within `max_age_secs`.
    pub async fn consume_pwreset_token(
        &self,
        user_id: i64,
        token: &str,
        max_age_secs: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM pwreset_tokens WHERE user_id = ? AND token = ? AND time > ?",
        )
        .bind(user_id)
        .bind(token)
        .bind(unix_timestamp() - max_age_secs)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cleanup_pwreset_tokens(&self, max_age_secs: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM pwreset_tokens WHERE time < ?")
            .bind(unix_timestamp() - max_age_secs)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
