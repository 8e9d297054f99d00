//! Plan, image and region catalogue.
//!
//! Users import and delete their own images; operators manage public
//! images, plans and region bindings, and can pull both from a driver's
//! own listings.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::driver::{DriverRegistry, ImageCapability, ImageInfo, VmDriver};
use crate::error::{PanelError, PanelResult};
use crate::mail::MailService;
use crate::storage::{
    DatabaseError, Image, ImageParams, ImageStatus, PanelDatabase, Plan, PlanParams, Region,
    RegionalPlan,
};
use crate::vm::{MINIMUM_CREDIT, validate_name};

/// Pending images polled per refresh.
const PENDING_SAMPLE: u32 = 3;

fn images_of(driver: &dyn VmDriver) -> PanelResult<&dyn ImageCapability> {
    driver.images().ok_or(PanelError::Unsupported)
}

/// An image with its provider-side details.
#[derive(Debug, Clone)]
pub struct ImageDetails {
    pub image: Image,
    pub info: ImageInfo,
}

#[derive(Clone)]
pub struct CatalogService {
    db: PanelDatabase,
    registry: Arc<DriverRegistry>,
    mail: MailService,
}

impl CatalogService {
    pub const fn new(db: PanelDatabase, registry: Arc<DriverRegistry>, mail: MailService) -> Self {
        Self { db, registry, mail }
    }

    /// Driver for a region that is registered and enabled.
    async fn enabled_driver(&self, region: &str) -> PanelResult<Arc<dyn VmDriver>> {
        let enabled = match self.db.get_region(region).await {
            Ok(r) => r.enabled,
            Err(DatabaseError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        };
        if !enabled || !self.registry.contains(region) {
            return Err(PanelError::validation("region is not available"));
        }
        self.registry.get(region)
    }

    // =========================================================================
    // Regions
    // =========================================================================

    pub async fn regions(&self) -> PanelResult<Vec<Region>> {
        Ok(self.db.list_regions().await?)
    }

    pub async fn set_region_enabled(&self, region: &str, enabled: bool) -> PanelResult<()> {
        if !self.db.set_region_enabled(region, enabled).await? {
            return Err(PanelError::NotFound(format!("Region {region}")));
        }
        info!(region, enabled, "Region availability changed");
        Ok(())
    }

    // =========================================================================
    // Plans
    // =========================================================================

    /// Plans offered in `region`.
    pub async fn region_plans(&self, region: &str) -> PanelResult<Vec<RegionalPlan>> {
        Ok(self.db.list_region_plans(region).await?)
    }

    /// All enabled plans, for listings that are not tied to a region.
    pub async fn plans(&self) -> PanelResult<Vec<Plan>> {
        Ok(self
            .db
            .list_plans()
            .await?
            .into_iter()
            .filter(|p| p.enabled)
            .collect())
    }

    pub async fn all_plans(&self) -> PanelResult<Vec<Plan>> {
        Ok(self.db.list_plans().await?)
    }

    pub async fn create_plan(&self, params: &PlanParams<'_>) -> PanelResult<Plan> {
        validate_name(params.name)?;
        if params.price < 0
            || params.ram <= 0
            || params.cpu <= 0
            || params.storage <= 0
            || params.bandwidth < 0
        {
            return Err(PanelError::validation("invalid plan resources"));
        }
        let plan = self.db.create_plan(params).await?;
        info!(plan_id = plan.id, name = params.name, "Plan created");
        Ok(plan)
    }

    /// Offer or withdraw a plan for new VMs. Existing VMs keep running on it.
    pub async fn set_plan_enabled(&self, plan_id: i64, enabled: bool) -> PanelResult<()> {
        if !self.db.set_plan_enabled(plan_id, enabled).await? {
            return Err(PanelError::NotFound(format!("Plan {plan_id}")));
        }
        info!(plan_id, enabled, "Plan availability changed");
        Ok(())
    }

    /// Delete a plan, or only disable it while VMs still use it.
    pub async fn delete_plan(&self, plan_id: i64) -> PanelResult<()> {
        self.db.get_plan(plan_id).await?;
        if self.db.delete_plan(plan_id).await? {
            info!(plan_id, "Plan deleted");
        } else {
            info!(plan_id, "Plan in use, disabled instead of deleted");
        }
        Ok(())
    }

    pub async fn associate_plan(
        &self,
        plan_id: i64,
        region: &str,
        identification: &str,
    ) -> PanelResult<()> {
        if !self.registry.contains(region) {
            return Err(PanelError::validation(format!(
                "specified region {region} does not exist"
            )));
        }
        self.db.get_plan(plan_id).await?;
        self.db
            .associate_plan(plan_id, region, identification)
            .await?;
        Ok(())
    }

    pub async fn deassociate_plan(&self, plan_id: i64, region: &str) -> PanelResult<()> {
        self.db.deassociate_plan(plan_id, region).await?;
        Ok(())
    }

    /// Create and bind a plan for every provider plan not yet bound in
    /// `region`. New plans are regional and priced at zero until edited.
    #[instrument(skip(self))]
    pub async fn autopopulate_plans(&self, region: &str) -> PanelResult<usize> {
        let driver = self.registry.get(region)?;
        let plans = driver.plans().ok_or(PanelError::Unsupported)?;
        let mut added = 0;
        for provider_plan in plans.plan_list().await? {
            if self
                .db
                .region_plan_exists(region, &provider_plan.identification)
                .await?
            {
                continue;
            }
            let plan = self
                .db
                .create_plan(&PlanParams {
                    name: &provider_plan.name,
                    price: 0,
                    ram: provider_plan.ram,
                    cpu: provider_plan.cpu,
                    storage: provider_plan.storage,
                    bandwidth: provider_plan.bandwidth,
                    global: false,
                })
                .await?;
            self.db
                .associate_plan(plan.id, region, &provider_plan.identification)
                .await?;
            added += 1;
        }
        info!(region, added, "Plans autopopulated");
        Ok(added)
    }

    // =========================================================================
    // Images
    // =========================================================================

    pub async fn images(&self, user_id: i64, region: Option<&str>) -> PanelResult<Vec<Image>> {
        Ok(self.db.list_visible_images(user_id, region).await?)
    }

    pub async fn all_images(&self) -> PanelResult<Vec<Image>> {
        Ok(self.db.list_all_images().await?)
    }

    /// Start importing an image from `url` into `region` for a user.
    #[instrument(skip(self, url))]
    pub async fn fetch_image(
        &self,
        user_id: i64,
        region: &str,
        name: &str,
        url: &str,
        format: &str,
    ) -> PanelResult<Image> {
        let user = self.db.get_user(user_id).await?;
        if user.credit < MINIMUM_CREDIT {
            return Err(PanelError::InsufficientCredit);
        }
        validate_name(name)?;
        if url.is_empty() {
            return Err(PanelError::validation("image URL is required"));
        }

        let driver = self.enabled_driver(region).await?;
        let identification = images_of(driver.as_ref())?
            .image_fetch(url, format)
            .await?;
        let image = self
            .db
            .insert_image(&ImageParams {
                user_id: Some(user_id),
                region,
                name,
                identification: &identification,
                status: ImageStatus::Pending,
                source_vm: None,
            })
            .await?;
        info!(user_id, image_id = image.id, region, "Image fetch started");
        Ok(image)
    }

    /// An image the user owns, with provider details. Provider failures are
    /// reported and yield empty details.
    pub async fn image_info(&self, user_id: i64, image_id: i64) -> PanelResult<ImageDetails> {
        let image = self.owned_image(user_id, image_id).await?;
        let info = self.provider_info(&image).await?;
        Ok(ImageDetails { image, info })
    }

    async fn provider_info(&self, image: &Image) -> PanelResult<ImageInfo> {
        let driver = self.registry.get(&image.region)?;
        let capability = images_of(driver.as_ref())?;
        match capability.image_info(&image.identification).await {
            Ok(info) => Ok(info),
            Err(e) => {
                self.mail.report_error(
                    &e,
                    "image info failed",
                    &format!("image_id={}, identification={}", image.id, image.identification),
                );
                Ok(ImageInfo::default())
            }
        }
    }

    async fn owned_image(&self, user_id: i64, image_id: i64) -> PanelResult<Image> {
        let image = self.db.get_visible_image(image_id, user_id).await?;
        if image.user_id != Some(user_id) {
            return Err(PanelError::NotFound(format!("Image {image_id}")));
        }
        Ok(image)
    }

    /// Delete a user's image from the provider, then locally.
    #[instrument(skip(self))]
    pub async fn delete_image(&self, user_id: i64, image_id: i64) -> PanelResult<()> {
        let image = self.owned_image(user_id, image_id).await?;
        let driver = self.registry.get(&image.region)?;
        images_of(driver.as_ref())?
            .image_delete(&image.identification)
            .await?;
        self.db.delete_image(image.id).await?;
        info!(user_id, image_id, "Image deleted");
        Ok(())
    }

    /// Delete any image. A provider failure is reported but the row is
    /// removed regardless.
    #[instrument(skip(self))]
    pub async fn delete_image_force(&self, image_id: i64) -> PanelResult<()> {
        let image = self.db.get_image(image_id).await?;
        let driver = self.registry.get(&image.region)?;
        let capability = images_of(driver.as_ref())?;
        if let Err(e) = capability.image_delete(&image.identification).await {
            self.mail.report_error(
                &e,
                "image force deletion failed",
                &format!("image_id={}, identification={}", image.id, image.identification),
            );
        }
        self.db.delete_image(image.id).await?;
        info!(image_id, "Image force deleted");
        Ok(())
    }

    /// Register a public image that already exists at the provider.
    pub async fn add_public_image(
        &self,
        region: &str,
        name: &str,
        identification: &str,
    ) -> PanelResult<Image> {
        validate_name(name)?;
        if !self.registry.contains(region) {
            return Err(PanelError::validation(format!(
                "specified region {region} does not exist"
            )));
        }
        if identification.is_empty() {
            return Err(PanelError::validation("identification is required"));
        }
        Ok(self
            .db
            .insert_image(&ImageParams {
                user_id: None,
                region,
                name,
                identification,
                status: ImageStatus::Active,
                source_vm: None,
            })
            .await?)
    }

    /// Register every provider image not yet known in `region` as public.
    #[instrument(skip(self))]
    pub async fn autopopulate_images(&self, region: &str) -> PanelResult<usize> {
        let driver = self.registry.get(region)?;
        let images = images_of(driver.as_ref())?.image_list().await?;
        let mut added = 0;
        for image in images {
            if self.db.image_exists(region, &image.identification).await? {
                continue;
            }
            self.add_public_image(region, &image.name, &image.identification)
                .await?;
            added += 1;
        }
        info!(region, added, "Images autopopulated");
        Ok(added)
    }

    /// Poll a few pending images and settle those the provider reports as
    /// finished.
    pub async fn refresh_pending_images(&self) -> PanelResult<()> {
        for image in self.db.sample_pending_images(PENDING_SAMPLE).await? {
            let info = self.provider_info(&image).await?;
            match info.status {
                Some(status @ (ImageStatus::Active | ImageStatus::Error)) => {
                    debug!(image_id = image.id, status = status.as_str(), "Pending image settled");
                    self.db.set_image_status(image.id, status).await?;
                }
                Some(ImageStatus::Pending) | None => {}
            }
        }
        Ok(())
    }
}
