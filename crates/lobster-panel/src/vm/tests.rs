#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::Ordering;
use std::time::Duration;

use super::*;
use crate::driver::{DriverError, VncCapability};
use crate::storage::Image;
use crate::test_support::{REGION, harness, harness_with, test_config};

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[test]
fn name_validation() {
    assert!(validate_name("web-1").is_ok());
    assert_eq!(
        validate_name("").unwrap_err().to_string(),
        "name cannot be empty"
    );
    assert_eq!(
        validate_name(&"a".repeat(65)).unwrap_err().to_string(),
        "name cannot exceed 64 characters"
    );
    assert!(validate_name(&"a".repeat(64)).is_ok());
    assert_eq!(
        validate_name("tab\there").unwrap_err().to_string(),
        "provided name contains invalid characters"
    );
}

// === Create ===

#[tokio::test]
async fn create_provisions_in_background() {
    let h = harness().await;
    let user = h.user("alice", 10 * MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let image = h.image(ImageStatus::Active).await;

    let vm_id = h.vms.create(user.id, "web", plan.id, image).await.unwrap();
    assert!(h.mailer.wait_for(MailTemplate::VmCreate).await);

    let vm = h.db.get_vm(vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Active);
    assert_eq!(vm.identification, format!("fake-{vm_id}"));
    assert_eq!(h.driver.counters.create.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_provisioning_marks_error() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let image = h.image(ImageStatus::Active).await;
    h.driver.set_fail_create(true);

    let vm_id = h.vms.create(user.id, "web", plan.id, image).await.unwrap();
    assert!(h.mailer.wait_for(MailTemplate::VmCreateError).await);
    assert!(h.mailer.wait_for(MailTemplate::Error).await);

    let vm = h.db.get_vm(vm_id).await.unwrap();
    assert_eq!(vm.status, VmStatus::Error);
    assert!(vm.identification.is_empty());
}

#[tokio::test]
async fn create_requires_minimum_credit() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT - 1).await;
    let plan = h.plan(10_000, 1000).await;
    let image = h.image(ImageStatus::Active).await;

    let err = h.vms.create(user.id, "web", plan.id, image).await.unwrap_err();
    assert!(matches!(err, PanelError::InsufficientCredit));
    assert!(h.db.list_user_vms(user.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn create_enforces_vm_limit() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    sqlx::query("UPDATE users SET vm_limit = 1 WHERE id = ?")
        .bind(user.id)
        .execute(h.db.pool())
        .await
        .unwrap();
    let plan = h.plan(10_000, 1000).await;
    let image = h.image(ImageStatus::Active).await;
    h.active_vm(user.id, plan.id, "first").await;

    let err = h.vms.create(user.id, "web", plan.id, image).await.unwrap_err();
    assert!(err.to_string().contains("VM count limit"), "{err}");
}

#[tokio::test]
async fn create_rejects_unusable_catalog_entries() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let pending = h.image(ImageStatus::Pending).await;
    let image = h.image(ImageStatus::Active).await;

    let err = h.vms.create(user.id, "web", plan.id, pending).await.unwrap_err();
    assert_eq!(err.to_string(), "specified image is not ready");

    let err = h.vms.create(user.id, "web", plan.id, 999).await.unwrap_err();
    assert_eq!(err.to_string(), "specified image does not exist");

    let err = h.vms.create(user.id, "web", 999, image).await.unwrap_err();
    assert_eq!(err.to_string(), "no such plan");

    h.db.set_region_enabled(REGION, false).await.unwrap();
    let err = h.vms.create(user.id, "web", plan.id, image).await.unwrap_err();
    assert!(matches!(err, PanelError::Validation(_)));
}

#[tokio::test]
async fn other_users_images_are_invisible() {
    let h = harness().await;
    let alice = h.user("alice", MINIMUM_CREDIT).await;
    let bob = h.user("bob", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let private: Image = h
        .db
        .insert_image(&ImageParams {
            user_id: Some(bob.id),
            region: REGION,
            name: "bob's",
            identification: "bob-image",
            status: ImageStatus::Active,
            source_vm: None,
        })
        .await
        .unwrap();

    let err = h
        .vms
        .create(alice.id, "web", plan.id, private.id)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "specified image does not exist");
}

// === Gating ===

#[tokio::test]
async fn suspension_blocks_start_but_not_stop() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.db.set_vm_suspended(vm.id, Suspension::Auto).await.unwrap();
    assert!(matches!(
        h.vms.start(user.id, vm.id).await,
        Err(PanelError::VmSuspendedAuto)
    ));
    assert!(matches!(
        h.vms.reboot(user.id, vm.id).await,
        Err(PanelError::VmSuspendedAuto)
    ));
    h.vms.stop(user.id, vm.id).await.unwrap();

    h.db.set_vm_suspended(vm.id, Suspension::Manual).await.unwrap();
    assert!(matches!(
        h.vms.action(user.id, vm.id, "rescue", "").await,
        Err(PanelError::VmSuspendedManual)
    ));
}

#[tokio::test]
async fn pending_task_and_provisioning_block_verbs() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.db.set_vm_task_pending(vm.id, true).await.unwrap();
    assert!(matches!(
        h.vms.stop(user.id, vm.id).await,
        Err(PanelError::VmTaskPending)
    ));

    let provisioning = h
        .db
        .insert_vm(&VmParams {
            user_id: user.id,
            region: REGION,
            plan_id: plan.id,
            name: "new",
        })
        .await
        .unwrap();
    assert!(matches!(
        h.vms.start(user.id, provisioning.id).await,
        Err(PanelError::VmNotReady)
    ));
    assert!(matches!(
        h.vms.delete(user.id, provisioning.id).await,
        Err(PanelError::VmNotReady)
    ));
}

#[tokio::test]
async fn foreign_vm_is_not_found() {
    let h = harness().await;
    let alice = h.user("alice", MINIMUM_CREDIT).await;
    let bob = h.user("bob", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(alice.id, plan.id, "web").await;

    assert!(matches!(
        h.vms.start(bob.id, vm.id).await,
        Err(PanelError::NotFound(_))
    ));
}

// === Info and console ===

#[tokio::test]
async fn info_placeholder_while_provisioning() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h
        .db
        .insert_vm(&VmParams {
            user_id: user.id,
            region: REGION,
            plan_id: plan.id,
            name: "new",
        })
        .await
        .unwrap();

    let info = h.vms.load_info(&vm).await.unwrap();
    assert_eq!(info.ip, "Pending");
    assert_eq!(info.private_ip, "Pending");
    assert_eq!(info.status, "Provisioning");
    assert_eq!(info.hostname, "new");
    assert_eq!(h.driver.counters.info.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn info_probes_capabilities_and_persists_addresses() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    let info = h.vms.load_info(&vm).await.unwrap();
    assert_eq!(info.status, "Online");
    assert_eq!(info.hostname, "web");
    assert!(info.can_vnc && info.can_reimage && info.can_resize);
    assert!(info.can_snapshot && info.can_addresses);

    let stored = h.db.get_vm(vm.id).await.unwrap();
    assert_eq!(stored.external_ip, "127.0.0.1");
    assert_eq!(stored.private_ip, info.private_ip);
}

/// Mandatory operations plus a console, nothing else.
struct ConsoleOnlyDriver;

#[async_trait::async_trait]
impl VmDriver for ConsoleOnlyDriver {
    async fn vm_create(&self, vm: &VmHandle, _: &str) -> Result<String, DriverError> {
        Ok(format!("console-{}", vm.vm.id))
    }
    async fn vm_delete(&self, _: &VmHandle) -> Result<(), DriverError> {
        Ok(())
    }
    async fn vm_info(&self, _: &VmHandle) -> Result<VmInfo, DriverError> {
        Ok(VmInfo {
            ip: "192.0.2.10".to_string(),
            status: "Online".to_string(),
            can_reimage: true,
            ..VmInfo::default()
        })
    }
    async fn vm_start(&self, _: &VmHandle) -> Result<(), DriverError> {
        Ok(())
    }
    async fn vm_stop(&self, _: &VmHandle) -> Result<(), DriverError> {
        Ok(())
    }
    async fn vm_reboot(&self, _: &VmHandle) -> Result<(), DriverError> {
        Ok(())
    }
    async fn vm_action(&self, _: &VmHandle, _: &str, _: &str) -> Result<(), DriverError> {
        Err(DriverError::Unsupported)
    }
    async fn bandwidth_accounting(&self, _: &VmHandle) -> Result<i64, DriverError> {
        Ok(0)
    }
    fn vnc(&self) -> Option<&dyn VncCapability> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl VncCapability for ConsoleOnlyDriver {
    async fn vm_vnc(&self, _: &VmHandle) -> Result<VncTarget, DriverError> {
        Ok(VncTarget::Url("https://console.invalid/".to_string()))
    }
}

#[tokio::test]
async fn capabilities_follow_driver_implementation() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    let mut registry = DriverRegistry::new();
    registry
        .register(REGION, Arc::new(ConsoleOnlyDriver) as Arc<dyn VmDriver>)
        .unwrap();
    let vms = VmService::new(
        h.db.clone(),
        Arc::new(registry),
        h.billing.clone(),
        h.mail.clone(),
        Arc::clone(&h.config),
        Arc::clone(&h.websockify),
    );

    let info = vms.load_info(&vm).await.unwrap();
    assert!(info.can_vnc);
    assert!(!info.can_reimage && !info.can_resize);
    assert!(!info.can_snapshot && !info.can_addresses);
}

#[tokio::test]
async fn vnc_returns_driver_url() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    let url = h.vms.vnc(user.id, vm.id).await.unwrap();
    assert_eq!(url, format!("https://console.invalid/fake-{}", vm.id));
}

// === Disk and plan changes ===

#[tokio::test]
async fn snapshot_creates_pending_image() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    assert_eq!(
        h.vms.snapshot(user.id, vm.id, "").await.unwrap_err().to_string(),
        "snapshot name cannot be empty"
    );

    let image_id = h.vms.snapshot(user.id, vm.id, "before-upgrade").await.unwrap();
    let image = h.db.get_image(image_id).await.unwrap();
    assert_eq!(image.user_id, Some(user.id));
    assert_eq!(image.status, ImageStatus::Pending);
    assert_eq!(image.source_vm, Some(vm.id));
    assert_eq!(image.region, REGION);
}

#[tokio::test]
async fn reimage_requires_ready_image() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;
    let pending = h.image(ImageStatus::Pending).await;
    let image = h.image(ImageStatus::Active).await;

    assert!(h.vms.reimage(user.id, vm.id, pending).await.is_err());
    h.vms.reimage(user.id, vm.id, image).await.unwrap();
    assert_eq!(h.driver.counters.reimage.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn resize_switches_plan_and_restarts_allocation() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let small = h.plan(10_000, 1000).await;
    let large = h.plan(20_000, 2000).await;
    let vm = h.active_vm(user.id, small.id, "web").await;
    h.age_vm(vm.id, 3 * 3600).await;

    h.vms.resize(user.id, vm.id, large.id).await.unwrap();

    let resized = h.db.get_vm(vm.id).await.unwrap();
    assert_eq!(resized.plan_id, large.id);
    assert!(resized.time_created > vm.time_created - 3 * 3600);
    assert_eq!(h.driver.counters.resize.load(Ordering::SeqCst), 1);

    // three hours on the old plan were billed before the switch
    let user = h.db.get_user(user.id).await.unwrap();
    assert_eq!(user.credit, MINIMUM_CREDIT - 3 * 10_000);

    let pool = h.db.get_region_bandwidth(user.id, REGION).await.unwrap().unwrap();
    assert!(pool.bandwidth_additional > 0);
}

#[tokio::test]
async fn failed_provider_resize_keeps_old_plan() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let small = h.plan(10_000, 1000).await;
    let large = h.plan(20_000, 2000).await;
    let vm = h.active_vm(user.id, small.id, "web").await;
    h.age_vm(vm.id, 3 * 3600).await;
    h.driver.set_fail_resize(true);

    assert!(h.vms.resize(user.id, vm.id, large.id).await.is_err());

    let stored = h.db.get_vm(vm.id).await.unwrap();
    assert_eq!(stored.plan_id, small.id);
    assert_eq!(stored.time_created, vm.time_created - 3 * 3600);
    assert_eq!(stored.time_billed, vm.time_billed - 3 * 3600);
    assert_eq!(h.db.get_user(user.id).await.unwrap().credit, MINIMUM_CREDIT);
    assert!(
        h.db.get_region_bandwidth(user.id, REGION)
            .await
            .unwrap()
            .is_none_or(|pool| pool.bandwidth_additional == 0)
    );
}

#[tokio::test]
async fn resize_within_interval_moves_billing_mark() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let small = h.plan(10_000, 1000).await;
    let large = h.plan(20_000, 2000).await;
    let vm = h.active_vm(user.id, small.id, "web").await;
    h.age_vm(vm.id, 30 * 60).await;

    h.vms.resize(user.id, vm.id, large.id).await.unwrap();

    let resized = h.db.get_vm(vm.id).await.unwrap();
    assert_eq!(resized.plan_id, large.id);
    assert!(resized.time_billed >= resized.time_created);

    // forty minutes on the large plan; the earlier half hour is not carried over
    h.age_vm(vm.id, 40 * 60).await;
    h.billing.bill_vm(vm.id, false).await.unwrap();
    assert_eq!(h.db.get_user(user.id).await.unwrap().credit, MINIMUM_CREDIT);
}

#[tokio::test]
async fn rename_updates_row() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.vms.rename(user.id, vm.id, "db").await.unwrap();
    assert_eq!(h.db.get_vm(vm.id).await.unwrap().name, "db");
    assert!(h.vms.rename(user.id, vm.id, "").await.is_err());
}

// === Addresses ===

#[tokio::test]
async fn address_limits() {
    let mut config = test_config();
    config.vm.maximum_ips = 2;
    let h = harness_with(config).await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    let err = h
        .vms
        .remove_address(user.id, vm.id, "127.0.0.1", "")
        .await
        .unwrap_err();
    assert!(matches!(err, PanelError::Validation(_)));

    h.vms.add_address(user.id, vm.id).await.unwrap();
    let err = h.vms.add_address(user.id, vm.id).await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "this VM already has the maximum of 2 IP addresses"
    );

    h.vms
        .set_rdns(user.id, vm.id, "127.0.0.2", "mail.example.com")
        .await
        .unwrap();
    let addresses = h.vms.addresses(user.id, vm.id).await.unwrap();
    assert_eq!(addresses.len(), 2);
    assert_eq!(addresses[1].hostname, "mail.example.com");

    h.vms
        .remove_address(user.id, vm.id, "127.0.0.1", "")
        .await
        .unwrap();
    assert_eq!(h.vms.addresses(user.id, vm.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn address_management_can_be_disabled() {
    let mut config = test_config();
    config.vm.maximum_ips = 0;
    let h = harness_with(config).await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    let err = h.vms.add_address(user.id, vm.id).await.unwrap_err();
    assert_eq!(err.to_string(), "IP address management is disabled");
}

// === Delete, suspend, unsuspend ===

#[tokio::test]
async fn delete_bills_minimum_and_removes_row() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.vms.delete(user.id, vm.id).await.unwrap();

    assert!(matches!(
        h.db.get_vm(vm.id).await,
        Err(DatabaseError::NotFound(_))
    ));
    // a VM deleted right away still pays one interval
    let user = h.db.get_user(user.id).await.unwrap();
    assert_eq!(user.credit, MINIMUM_CREDIT - 10_000);
    assert!(h.mailer.wait_for(MailTemplate::VmDeleted).await);

    let driver = h.driver.clone();
    wait_until(|| {
        let driver = driver.clone();
        async move { driver.counters.delete.load(Ordering::SeqCst) == 1 }
    })
    .await;
}

#[tokio::test]
async fn delete_removes_row_when_final_billing_fails() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;
    sqlx::query("DROP TABLE charges")
        .execute(h.db.pool())
        .await
        .unwrap();

    h.vms.delete(user.id, vm.id).await.unwrap();

    assert!(matches!(
        h.db.get_vm(vm.id).await,
        Err(DatabaseError::NotFound(_))
    ));
    assert!(h.mailer.wait_for(MailTemplate::Error).await);

    let driver = h.driver.clone();
    wait_until(|| {
        let driver = driver.clone();
        async move { driver.counters.delete.load(Ordering::SeqCst) == 1 }
    })
    .await;
}

#[tokio::test]
async fn auto_suspension_does_not_override_manual() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.vms.suspend(vm.id, Suspension::Manual).await.unwrap();
    h.vms.suspend(vm.id, Suspension::Auto).await.unwrap();
    assert_eq!(
        h.db.get_vm(vm.id).await.unwrap().suspended,
        Suspension::Manual
    );
}

#[tokio::test]
async fn suspend_powers_off_and_unsuspend_starts() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let vm = h.active_vm(user.id, plan.id, "web").await;

    h.vms.suspend(vm.id, Suspension::Auto).await.unwrap();
    assert_eq!(h.db.get_vm(vm.id).await.unwrap().suspended, Suspension::Auto);

    let db = h.db.clone();
    let vm_id = vm.id;
    wait_until(|| {
        let db = db.clone();
        async move {
            db.get_vm_metadata(vm_id, "fake_power").await.unwrap().as_deref() == Some("Offline")
        }
    })
    .await;
    // verification ran and found the VM offline
    let driver = h.driver.clone();
    wait_until(|| {
        let driver = driver.clone();
        async move { driver.counters.info.load(Ordering::SeqCst) >= 1 }
    })
    .await;

    h.vms.unsuspend(vm.id).await.unwrap();
    assert_eq!(h.db.get_vm(vm.id).await.unwrap().suspended, Suspension::No);
    assert_eq!(h.driver.counters.start.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn metadata_is_scoped_per_vm() {
    let h = harness().await;
    let user = h.user("alice", MINIMUM_CREDIT).await;
    let plan = h.plan(10_000, 1000).await;
    let web = h.active_vm(user.id, plan.id, "web").await;
    let db = h.active_vm(user.id, plan.id, "db").await;

    assert_eq!(h.vms.metadata(web.id, "note").await.unwrap(), None);
    h.vms.set_metadata(web.id, "note", "first").await.unwrap();
    h.vms.set_metadata(web.id, "note", "second").await.unwrap();

    assert_eq!(
        h.vms.metadata(web.id, "note").await.unwrap().as_deref(),
        Some("second")
    );
    assert_eq!(h.vms.metadata(db.id, "note").await.unwrap(), None);
}
