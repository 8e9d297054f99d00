//! User and action-log queries.

use lobster_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{ActionLog, User, UserStatus};

impl PanelDatabase {
    // =========================================================================
    // User queries
    // =========================================================================

    /// Create a user with `status = new` and zero credit.
    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        vm_limit: i64,
    ) -> Result<User, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO users (username, email, password, vm_limit, time_created, time_billed) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(vm_limit)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_user(result.last_insert_rowid()).await
    }

    /// Get a user by ID.
    pub async fn get_user(&self, id: i64) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User {id}")))
    }

    /// Get a user by username.
    pub async fn get_user_by_username(&self, username: &str) -> Result<User, DatabaseError> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("User with username {username}")))
    }

    /// Whether a non-empty e-mail address is already registered.
    pub async fn email_taken(&self, email: &str) -> Result<bool, DatabaseError> {
        if email.is_empty() {
            return Ok(false);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE email = ?")
            .bind(email)
            .fetch_one(self.pool())
            .await?;
        Ok(count > 0)
    }

    /// List all users, newest first.
    pub async fn list_users(&self) -> Result<Vec<User>, DatabaseError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY id DESC")
            .fetch_all(self.pool())
            .await?;
        Ok(users)
    }

    pub async fn set_user_status(&self, id: i64, status: UserStatus) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE users SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_user_admin(&self, id: i64, admin: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE users SET admin = ? WHERE id = ?")
            .bind(admin)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_user_password(
        &self,
        id: i64,
        password_hash: &str,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE users SET password = ? WHERE id = ?")
            .bind(password_hash)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a billing notification pass.
    pub async fn set_billing_notify(
        &self,
        id: i64,
        last_billing_notify: i64,
        billing_low_count: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE users SET last_billing_notify = ?, billing_low_count = ? WHERE id = ?")
            .bind(last_billing_notify)
            .bind(billing_low_count)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_user_time_billed(&self, id: i64, time_billed: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE users SET time_billed = ? WHERE id = ?")
            .bind(time_billed)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Active users whose service billing is at least `stale_secs` old.
    pub async fn users_due_service_billing(
        &self,
        stale_secs: i64,
    ) -> Result<Vec<User>, DatabaseError> {
        let cutoff = unix_timestamp() - stale_secs;
        let users = sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE status = 'active' AND time_billed <= ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(users)
    }

    /// IDs of users whose last billing notice is older than `stale_secs`.
    pub async fn users_due_notification(&self, stale_secs: i64) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = unix_timestamp() - stale_secs;
        let users = sqlx::query_scalar(
            "SELECT id FROM users WHERE last_billing_notify < ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(users)
    }

    // =========================================================================
    // Action log
    // =========================================================================

    /// Append an entry to a user's action log.
    pub async fn log_action(
        &self,
        user_id: i64,
        ip: &str,
        name: &str,
        details: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO actions (user_id, ip, name, details, time) VALUES (?, ?, ?, ?, ?)")
            .bind(user_id)
            .bind(ip)
            .bind(name)
            .bind(details)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Most recent action log entries for a user.
    pub async fn list_actions(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<ActionLog>, DatabaseError> {
        let actions = sqlx::query_as::<_, ActionLog>(
            "SELECT * FROM actions WHERE user_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(actions)
    }
}
