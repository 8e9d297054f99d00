//! Virtual machine and VM metadata queries.

use lobster_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{Suspension, Vm, VmStatus};

/// Parameters for inserting a new VM row.
pub struct VmParams<'a> {
    pub user_id: i64,
    pub region: &'a str,
    pub plan_id: i64,
    pub name: &'a str,
}

impl PanelDatabase {
    // =========================================================================
    // VM queries
    // =========================================================================

    /// Insert a VM in `provisioning` state, billed from now.
    pub async fn insert_vm(&self, params: &VmParams<'_>) -> Result<Vm, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "INSERT INTO vms (user_id, region, plan_id, name, time_created, time_billed) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.region)
        .bind(params.plan_id)
        .bind(params.name)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_vm(result.last_insert_rowid()).await
    }

    /// Get a VM by ID.
    pub async fn get_vm(&self, id: i64) -> Result<Vm, DatabaseError> {
        sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("VM {id}")))
    }

    /// Get a VM only if it belongs to `user_id`.
    pub async fn get_user_vm(&self, id: i64, user_id: i64) -> Result<Vm, DatabaseError> {
        sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("VM {id}")))
    }

    pub async fn list_user_vms(&self, user_id: i64) -> Result<Vec<Vm>, DatabaseError> {
        let vms = sqlx::query_as::<_, Vm>("SELECT * FROM vms WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(self.pool())
            .await?;
        Ok(vms)
    }

    pub async fn list_user_region_vms(
        &self,
        user_id: i64,
        region: &str,
    ) -> Result<Vec<Vm>, DatabaseError> {
        let vms = sqlx::query_as::<_, Vm>(
            "SELECT * FROM vms WHERE user_id = ? AND region = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(region)
        .fetch_all(self.pool())
        .await?;
        Ok(vms)
    }

    pub async fn list_user_suspended_vms(
        &self,
        user_id: i64,
        suspended: Suspension,
    ) -> Result<Vec<Vm>, DatabaseError> {
        let vms = sqlx::query_as::<_, Vm>(
            "SELECT * FROM vms WHERE user_id = ? AND suspended = ? ORDER BY id",
        )
        .bind(user_id)
        .bind(suspended)
        .fetch_all(self.pool())
        .await?;
        Ok(vms)
    }

    pub async fn list_all_vms(&self) -> Result<Vec<Vm>, DatabaseError> {
        let vms = sqlx::query_as::<_, Vm>("SELECT * FROM vms ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(vms)
    }

    /// IDs of active VMs whose billing is at least `stale_secs` old.
    pub async fn vms_due_billing(&self, stale_secs: i64) -> Result<Vec<i64>, DatabaseError> {
        let cutoff = unix_timestamp() - stale_secs;
        let ids = sqlx::query_scalar(
            "SELECT id FROM vms WHERE status = 'active' AND time_billed <= ? ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }

    pub async fn count_user_vms(&self, user_id: i64) -> Result<i64, DatabaseError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Mark a VM as provisioned with its provider identification.
    pub async fn set_vm_active(&self, id: i64, identification: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET identification = ?, status = 'active' WHERE id = ?")
            .bind(identification)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_vm_status(&self, id: i64, status: VmStatus) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_vm_suspended(&self, id: i64, suspended: Suspension) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET suspended = ? WHERE id = ?")
            .bind(suspended)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Auto-suspend a VM that is not already suspended.
    ///
    /// Returns `false` when the VM was already suspended for any reason.
    pub async fn auto_suspend_vm(&self, id: i64) -> Result<bool, DatabaseError> {
        let result =
            sqlx::query("UPDATE vms SET suspended = 'auto' WHERE id = ? AND suspended = 'no'")
                .bind(id)
                .execute(self.pool())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_vm_task_pending(&self, id: i64, pending: bool) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET task_pending = ? WHERE id = ?")
            .bind(pending)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_vm_ips(
        &self,
        id: i64,
        external_ip: &str,
        private_ip: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET external_ip = ?, private_ip = ? WHERE id = ?")
            .bind(external_ip)
            .bind(private_ip)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn rename_vm(&self, id: i64, name: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Move a VM to another plan. The bandwidth allocation restarts from
    /// `time_created`, and `time_billed` is raised to it so time before the
    /// switch is never charged at the new plan's price.
    pub async fn set_vm_plan(
        &self,
        id: i64,
        plan_id: i64,
        time_created: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE vms SET plan_id = ?, time_created = ?, time_billed = MAX(time_billed, ?) \
             WHERE id = ?",
        )
        .bind(plan_id)
        .bind(time_created)
        .bind(time_created)
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn set_vm_time_billed(&self, id: i64, time_billed: i64) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE vms SET time_billed = ? WHERE id = ?")
            .bind(time_billed)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a VM row; metadata goes with it.
    pub async fn delete_vm(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM vms WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // VM metadata
    // =========================================================================

    pub async fn get_vm_metadata(&self, vm_id: i64, key: &str) -> Result<Option<String>, DatabaseError> {
        let value = sqlx::query_scalar("SELECT v FROM vm_metadata WHERE vm_id = ? AND k = ?")
            .bind(vm_id)
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(value)
    }

    /// Upsert a metadata value.
    pub async fn set_vm_metadata(
        &self,
        vm_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO vm_metadata (vm_id, k, v) VALUES (?, ?, ?) \
             ON CONFLICT(vm_id, k) DO UPDATE SET v = excluded.v",
        )
        .bind(vm_id)
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
