//! Region, plan and image catalogue queries.

use lobster_core::db::unix_timestamp;

use super::db::{DatabaseError, PanelDatabase};
use super::models::{Image, ImageStatus, Plan, Region, RegionPlan, RegionalPlan};

/// Parameters for creating a plan.
pub struct PlanParams<'a> {
    pub name: &'a str,
    pub price: i64,
    pub ram: i64,
    pub cpu: i64,
    pub storage: i64,
    pub bandwidth: i64,
    pub global: bool,
}

/// Parameters for inserting an image row.
pub struct ImageParams<'a> {
    /// `None` registers a public image.
    pub user_id: Option<i64>,
    pub region: &'a str,
    pub name: &'a str,
    pub identification: &'a str,
    pub status: ImageStatus,
    pub source_vm: Option<i64>,
}

const REGIONAL_PLAN_QUERY: &str = "SELECT plans.*, IFNULL(region_plans.identification, '') AS identification \
     FROM plans LEFT JOIN region_plans ON plans.id = region_plans.plan_id AND region_plans.region = ?";

impl PanelDatabase {
    // =========================================================================
    // Region queries
    // =========================================================================

    /// Register a region if it is not known yet. Existing rows keep their
    /// enabled flag.
    pub async fn ensure_region(&self, region: &str) -> Result<(), DatabaseError> {
        sqlx::query("INSERT OR IGNORE INTO regions (region) VALUES (?)")
            .bind(region)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_region(&self, region: &str) -> Result<Region, DatabaseError> {
        sqlx::query_as::<_, Region>("SELECT * FROM regions WHERE region = ?")
            .bind(region)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Region {region}")))
    }

    pub async fn list_regions(&self) -> Result<Vec<Region>, DatabaseError> {
        let regions = sqlx::query_as::<_, Region>("SELECT * FROM regions ORDER BY region")
            .fetch_all(self.pool())
            .await?;
        Ok(regions)
    }

    pub async fn set_region_enabled(&self, region: &str, enabled: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE regions SET enabled = ? WHERE region = ?")
            .bind(enabled)
            .bind(region)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Plan queries
    // =========================================================================

    pub async fn create_plan(&self, params: &PlanParams<'_>) -> Result<Plan, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO plans (name, price, ram, cpu, storage, bandwidth, global) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.name)
        .bind(params.price)
        .bind(params.ram)
        .bind(params.cpu)
        .bind(params.storage)
        .bind(params.bandwidth)
        .bind(params.global)
        .execute(self.pool())
        .await?;

        self.get_plan(result.last_insert_rowid()).await
    }

    pub async fn get_plan(&self, id: i64) -> Result<Plan, DatabaseError> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Plan {id}")))
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>, DatabaseError> {
        let plans = sqlx::query_as::<_, Plan>("SELECT * FROM plans ORDER BY id")
            .fetch_all(self.pool())
            .await?;
        Ok(plans)
    }

    /// Enabled plans available in `region`: global plans plus plans bound to it.
    pub async fn list_region_plans(&self, region: &str) -> Result<Vec<RegionalPlan>, DatabaseError> {
        let plans = sqlx::query_as::<_, RegionalPlan>(&format!(
            "{REGIONAL_PLAN_QUERY} WHERE plans.enabled = 1 \
             AND (plans.global = 1 OR region_plans.plan_id IS NOT NULL) ORDER BY plans.id"
        ))
        .bind(region)
        .fetch_all(self.pool())
        .await?;
        Ok(plans)
    }

    /// A plan if it is enabled and available in `region`.
    pub async fn get_region_plan(
        &self,
        region: &str,
        plan_id: i64,
    ) -> Result<RegionalPlan, DatabaseError> {
        sqlx::query_as::<_, RegionalPlan>(&format!(
            "{REGIONAL_PLAN_QUERY} WHERE plans.id = ? AND plans.enabled = 1 \
             AND (plans.global = 1 OR region_plans.plan_id IS NOT NULL)"
        ))
        .bind(region)
        .bind(plan_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Plan {plan_id} in region {region}")))
    }

    /// A plan with its binding in `region`, regardless of availability.
    ///
    /// Used for VMs that already run on the plan.
    pub async fn get_plan_binding(
        &self,
        region: &str,
        plan_id: i64,
    ) -> Result<RegionalPlan, DatabaseError> {
        sqlx::query_as::<_, RegionalPlan>(&format!("{REGIONAL_PLAN_QUERY} WHERE plans.id = ?"))
            .bind(region)
            .bind(plan_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Plan {plan_id}")))
    }

    pub async fn list_plan_bindings(&self, plan_id: i64) -> Result<Vec<RegionPlan>, DatabaseError> {
        let bindings = sqlx::query_as::<_, RegionPlan>(
            "SELECT * FROM region_plans WHERE plan_id = ? ORDER BY region",
        )
        .bind(plan_id)
        .fetch_all(self.pool())
        .await?;
        Ok(bindings)
    }

    pub async fn set_plan_enabled(&self, id: i64, enabled: bool) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE plans SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a plan, or disable it while VMs still run on it.
    ///
    /// Returns `true` if the row was deleted.
    pub async fn delete_plan(&self, id: i64) -> Result<bool, DatabaseError> {
        let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vms WHERE plan_id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await?;

        if in_use > 0 {
            sqlx::query("UPDATE plans SET enabled = 0 WHERE id = ?")
                .bind(id)
                .execute(self.pool())
                .await?;
            return Ok(false);
        }

        let result = sqlx::query("DELETE FROM plans WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bind a plan to a region, replacing any previous identification.
    pub async fn associate_plan(
        &self,
        plan_id: i64,
        region: &str,
        identification: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO region_plans (plan_id, region, identification) VALUES (?, ?, ?) \
             ON CONFLICT(plan_id, region) DO UPDATE SET identification = excluded.identification",
        )
        .bind(plan_id)
        .bind(region)
        .bind(identification)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn deassociate_plan(&self, plan_id: i64, region: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM region_plans WHERE plan_id = ? AND region = ?")
            .bind(plan_id)
            .bind(region)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn region_plan_exists(
        &self,
        region: &str,
        identification: &str,
    ) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM region_plans WHERE region = ? AND identification = ?",
        )
        .bind(region)
        .bind(identification)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    // =========================================================================
    // Image queries
    // =========================================================================

    pub async fn insert_image(&self, params: &ImageParams<'_>) -> Result<Image, DatabaseError> {
        let result = sqlx::query(
            "INSERT INTO images (user_id, region, name, identification, status, source_vm, time_created) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(params.user_id)
        .bind(params.region)
        .bind(params.name)
        .bind(params.identification)
        .bind(params.status)
        .bind(params.source_vm)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_image(result.last_insert_rowid()).await
    }

    /// Get an image by ID without an ownership check.
    pub async fn get_image(&self, id: i64) -> Result<Image, DatabaseError> {
        sqlx::query_as::<_, Image>("SELECT * FROM images WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Image {id}")))
    }

    /// Get an image owned by `user_id` or public.
    pub async fn get_visible_image(&self, id: i64, user_id: i64) -> Result<Image, DatabaseError> {
        sqlx::query_as::<_, Image>(
            "SELECT * FROM images WHERE id = ? AND (user_id IS NULL OR user_id = ?)",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Image {id}")))
    }

    /// Images owned by `user_id` plus public images, optionally in one region.
    pub async fn list_visible_images(
        &self,
        user_id: i64,
        region: Option<&str>,
    ) -> Result<Vec<Image>, DatabaseError> {
        let images = if let Some(region) = region {
            sqlx::query_as::<_, Image>(
                "SELECT * FROM images WHERE (user_id IS NULL OR user_id = ?) AND region = ? ORDER BY name",
            )
            .bind(user_id)
            .bind(region)
            .fetch_all(self.pool())
            .await?
        } else {
            sqlx::query_as::<_, Image>(
                "SELECT * FROM images WHERE user_id IS NULL OR user_id = ? ORDER BY name",
            )
            .bind(user_id)
            .fetch_all(self.pool())
            .await?
        };
        Ok(images)
    }

    /// Images owned by `user_id` (public images excluded).
    pub async fn list_owned_images(&self, user_id: i64) -> Result<Vec<Image>, DatabaseError> {
        let images = sqlx::query_as::<_, Image>(
            "SELECT * FROM images WHERE user_id = ? ORDER BY name",
        )
        .bind(user_id)
        .fetch_all(self.pool())
        .await?;
        Ok(images)
    }

    pub async fn list_all_images(&self) -> Result<Vec<Image>, DatabaseError> {
        let images = sqlx::query_as::<_, Image>("SELECT * FROM images ORDER BY user_id, name")
            .fetch_all(self.pool())
            .await?;
        Ok(images)
    }

    /// A random sample of pending images for the status poller.
    pub async fn sample_pending_images(&self, limit: u32) -> Result<Vec<Image>, DatabaseError> {
        let images = sqlx::query_as::<_, Image>(
            "SELECT * FROM images WHERE status = 'pending' ORDER BY RANDOM() LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(images)
    }

    pub async fn set_image_status(&self, id: i64, status: ImageStatus) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE images SET status = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn image_exists(
        &self,
        region: &str,
        identification: &str,
    ) -> Result<bool, DatabaseError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM images WHERE region = ? AND identification = ?",
        )
        .bind(region)
        .bind(identification)
        .fetch_one(self.pool())
        .await?;
        Ok(count > 0)
    }

    pub async fn delete_image(&self, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM images WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
