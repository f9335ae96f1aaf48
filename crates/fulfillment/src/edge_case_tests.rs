// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Fulfillment Orchestrator
//!
//! Tests critical boundary conditions in:
//! - Webhook signature gate (tolerance window, header parsing, tampering)
//! - Commission tiers and arithmetic boundaries
//! - Line item partitioning
//! - Adapter timeouts and detached-task acknowledgement
//! - Duplicate-delivery idempotency and replay re-dispatch, exercised
//!   against in-memory ledger and directory fakes

#[cfg(test)]
mod signature_gate_tests {
    use crate::error::FulfillmentError;
    use crate::webhooks::{compute_signature, verify_and_parse, SIGNATURE_TOLERANCE_SECS};

    const SECRET: &str = "whsec_edge_test";
    const NOW: i64 = 1_700_000_000;

    fn event_body() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": "evt_edge",
            "type": "invoice.paid",
            "created": NOW,
            "data": { "object": { "billing_reason": "subscription_create" } }
        }))
        .unwrap()
    }

    fn signed_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let signature = compute_signature(secret, timestamp, payload).unwrap();
        format!("t={timestamp},v1={signature}")
    }

    // =========================================================================
    // Correctly signed payload at the current instant is accepted
    // =========================================================================
    #[test]
    fn test_valid_signature_accepted() {
        let payload = event_body();
        let header = signed_header(SECRET, NOW, &payload);

        let event = verify_and_parse(SECRET, &payload, &header, NOW).unwrap();
        assert_eq!(event.id, "evt_edge");
    }

    // =========================================================================
    // Timestamp exactly at the tolerance bound is still accepted; one second
    // past it is rejected
    // =========================================================================
    #[test]
    fn test_tolerance_boundary() {
        let payload = event_body();

        let at_bound = NOW - SIGNATURE_TOLERANCE_SECS;
        let header = signed_header(SECRET, at_bound, &payload);
        assert!(verify_and_parse(SECRET, &payload, &header, NOW).is_ok());

        let past_bound = NOW - SIGNATURE_TOLERANCE_SECS - 1;
        let header = signed_header(SECRET, past_bound, &payload);
        assert!(matches!(
            verify_and_parse(SECRET, &payload, &header, NOW),
            Err(FulfillmentError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // Future-dated timestamps get the same symmetric window
    // =========================================================================
    #[test]
    fn test_future_timestamp_outside_tolerance_rejected() {
        let payload = event_body();
        let future = NOW + SIGNATURE_TOLERANCE_SECS + 1;
        let header = signed_header(SECRET, future, &payload);
        assert!(matches!(
            verify_and_parse(SECRET, &payload, &header, NOW),
            Err(FulfillmentError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // Signature computed with a different secret is rejected
    // =========================================================================
    #[test]
    fn test_wrong_secret_rejected() {
        let payload = event_body();
        let header = signed_header("whsec_other", NOW, &payload);
        assert!(matches!(
            verify_and_parse(SECRET, &payload, &header, NOW),
            Err(FulfillmentError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // Any byte change after signing invalidates the signature
    // =========================================================================
    #[test]
    fn test_tampered_payload_rejected() {
        let payload = event_body();
        let header = signed_header(SECRET, NOW, &payload);

        let mut tampered = payload.clone();
        let last = tampered.len() - 2;
        tampered[last] = b'X';

        assert!(matches!(
            verify_and_parse(SECRET, &tampered, &header, NOW),
            Err(FulfillmentError::SignatureInvalid)
        ));
    }

    // =========================================================================
    // Malformed signature headers never panic, always reject
    // =========================================================================
    #[test]
    fn test_malformed_headers_rejected() {
        let payload = event_body();
        let headers = [
            "",
            "t=,v1=",
            "v1=deadbeef",
            "t=1700000000",
            "t=notanumber,v1=deadbeef",
            "garbage",
            "t=1700000000,v2=deadbeef",
        ];
        for header in headers {
            assert!(
                matches!(
                    verify_and_parse(SECRET, &payload, header, NOW),
                    Err(FulfillmentError::SignatureInvalid)
                ),
                "header {header:?} should be rejected"
            );
        }
    }

    // =========================================================================
    // A valid signature over an unparseable body fails as malformed, not as
    // a signature error
    // =========================================================================
    #[test]
    fn test_signed_garbage_is_malformed_not_invalid() {
        let payload = b"not json at all";
        let header = signed_header(SECRET, NOW, payload);
        assert!(matches!(
            verify_and_parse(SECRET, payload, &header, NOW),
            Err(FulfillmentError::MalformedPayload(_))
        ));
    }
}

#[cfg(test)]
mod commission_boundary_tests {
    use crate::commission::{commission_amount_cents, tier_for};
    use orderflow_shared::{CommissionTier, PlanType};

    // =========================================================================
    // Founder status outranks an active annual subscription
    // =========================================================================
    #[test]
    fn test_founder_outranks_annual() {
        assert_eq!(tier_for(true, true), CommissionTier::Founder);
        assert_eq!(tier_for(true, false), CommissionTier::Founder);
        assert_eq!(tier_for(false, true), CommissionTier::Annual);
        assert_eq!(tier_for(false, false), CommissionTier::Default);
    }

    // =========================================================================
    // Plan classification at exactly the annual cutoff
    // =========================================================================
    #[test]
    fn test_classification_cutoff_boundary() {
        let cutoff = 15_000;
        assert_eq!(PlanType::classify(cutoff, cutoff), PlanType::Annual);
        assert_eq!(PlanType::classify(cutoff - 1, cutoff), PlanType::Monthly);
        assert_eq!(PlanType::classify(0, cutoff), PlanType::Monthly);
    }

    // =========================================================================
    // Integer commission arithmetic floors, never rounds up
    // =========================================================================
    #[test]
    fn test_commission_floors() {
        // 50% of 999 is 499.5, floored to 499
        assert_eq!(
            commission_amount_cents(999, CommissionTier::Default),
            499
        );
        // 70% of 1 cent floors to zero
        assert_eq!(commission_amount_cents(1, CommissionTier::Founder), 0);
        assert_eq!(commission_amount_cents(0, CommissionTier::Annual), 0);
    }

    // =========================================================================
    // Large amounts stay in range for i64 cents
    // =========================================================================
    #[test]
    fn test_large_amount_no_overflow() {
        // A million-dollar invoice in cents
        let amount = 100_000_000;
        assert_eq!(
            commission_amount_cents(amount, CommissionTier::Founder),
            70_000_000
        );
    }
}

#[cfg(test)]
mod partition_tests {
    use crate::dispatch::partition_items;
    use crate::gateway::LineItem;
    use orderflow_shared::FulfillmentKind;

    fn item(product_id: &str, quantity: u32, kind: Option<FulfillmentKind>) -> LineItem {
        LineItem {
            product_id: product_id.to_string(),
            product_name: product_id.to_string(),
            quantity,
            amount_cents: 2_500,
            kind,
        }
    }

    // =========================================================================
    // A checkout of a single kind produces exactly one non-empty branch
    // =========================================================================
    #[test]
    fn test_single_kind_checkout() {
        let items = vec![
            item("prod_a", 1, Some(FulfillmentKind::Digital)),
            item("prod_b", 3, Some(FulfillmentKind::Digital)),
        ];
        let partition = partition_items(&items);
        assert!(partition.physical.is_empty());
        assert_eq!(partition.digital.len(), 2);
        assert!(partition.untagged.is_empty());
    }

    // =========================================================================
    // Quantities survive partitioning untouched
    // =========================================================================
    #[test]
    fn test_quantity_preserved() {
        let items = vec![item("prod_bulk", 42, Some(FulfillmentKind::Physical))];
        let partition = partition_items(&items);
        assert_eq!(partition.physical[0].quantity, 42);
    }

    // =========================================================================
    // Untagged items are isolated, not dropped
    // =========================================================================
    #[test]
    fn test_untagged_not_dropped() {
        let items = vec![
            item("prod_known", 1, Some(FulfillmentKind::Physical)),
            item("prod_mystery", 1, None),
        ];
        let partition = partition_items(&items);
        assert_eq!(partition.physical.len(), 1);
        assert_eq!(partition.untagged.len(), 1);
        assert_eq!(partition.untagged[0].product_id, "prod_mystery");
    }
}

#[cfg(test)]
mod adapter_timeout_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::dispatch::ADAPTER_TIMEOUT;
    use crate::dropship::{DropshipProvider, FulfillmentRequest};
    use crate::error::{FulfillmentError, FulfillmentResult};
    use crate::gateway::ShippingAddress;

    struct StalledProvider {
        delay: Duration,
    }

    #[async_trait]
    impl DropshipProvider for StalledProvider {
        async fn create_order(&self, _request: &FulfillmentRequest) -> FulfillmentResult<String> {
            tokio::time::sleep(self.delay).await;
            Ok("ord_late".to_string())
        }
    }

    fn request() -> FulfillmentRequest {
        FulfillmentRequest {
            reference: "cs_timeout".to_string(),
            items: vec![],
            address: ShippingAddress {
                name: "Test Buyer".to_string(),
                line1: "1 Main St".to_string(),
                line2: None,
                city: "Springfield".to_string(),
                region: None,
                postal_code: "00000".to_string(),
                country: "US".to_string(),
            },
        }
    }

    // =========================================================================
    // A provider slower than the timeout is cut off, mapped to Timeout
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_stalled_provider_times_out() {
        let provider: Arc<dyn DropshipProvider> = Arc::new(StalledProvider {
            delay: ADAPTER_TIMEOUT + Duration::from_secs(1),
        });

        let result = tokio::time::timeout(ADAPTER_TIMEOUT, provider.create_order(&request()))
            .await
            .map_err(|_| FulfillmentError::Timeout("dropship provider"))
            .and_then(|inner| inner);

        assert!(matches!(result, Err(FulfillmentError::Timeout(_))));
    }

    // =========================================================================
    // A provider inside the timeout completes normally
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_fast_provider_completes() {
        let provider: Arc<dyn DropshipProvider> = Arc::new(StalledProvider {
            delay: Duration::from_secs(1),
        });

        let result = tokio::time::timeout(ADAPTER_TIMEOUT, provider.create_order(&request()))
            .await
            .expect("should complete inside the timeout");

        assert_eq!(result.unwrap(), "ord_late");
    }
}

#[cfg(test)]
mod detached_ack_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    // =========================================================================
    // Spawning slow processing returns control immediately; the work still
    // finishes afterwards. This is the acknowledgement contract of the
    // webhook endpoint.
    // =========================================================================
    #[tokio::test(start_paused = true)]
    async fn test_spawn_returns_before_slow_work_completes() {
        let done = Arc::new(AtomicBool::new(false));
        let done_inner = done.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            done_inner.store(true, Ordering::SeqCst);
        });

        // Control is back before the simulated processing finished.
        assert!(!done.load(Ordering::SeqCst));

        handle.await.unwrap();
        assert!(done.load(Ordering::SeqCst));
    }
}

#[cfg(test)]
mod service_fakes {
    //! In-memory stand-ins for the ledger, directory, gateway, and dropship
    //! provider, shared by the service-level tests below. The audit logger
    //! has no seam of its own because it swallows write failures; tests give
    //! it a pool that never connects.

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::audit::ActionLogger;
    use crate::directory::Directory;
    use crate::dropship::{DropshipProvider, FulfillmentRequest};
    use crate::error::{FulfillmentError, FulfillmentResult};
    use crate::gateway::{CheckoutSnapshot, ProcessorGateway};
    use crate::ledger::{
        EffectLedger, LedgerOutcome, NewCommission, NewDownloadGrant, NewFulfillmentOrder,
    };

    /// A pool that points at nothing. Audit writes against it fail fast and
    /// are swallowed by the logger, which is exactly the behavior under test
    /// isolation.
    pub fn offline_pool() -> sqlx::PgPool {
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(50))
            .connect_lazy("postgres://127.0.0.1:1/offline")
            .unwrap()
    }

    pub fn offline_audit() -> ActionLogger {
        ActionLogger::new(offline_pool())
    }

    #[derive(Debug, Clone)]
    pub struct FakeOrderRow {
        pub id: Uuid,
        pub external_order_id: Option<String>,
        pub failed: bool,
    }

    /// Ledger fake enforcing the same natural keys as the Postgres tables.
    #[derive(Default)]
    pub struct InMemoryLedger {
        pub commissions: Mutex<Vec<NewCommission>>,
        pub grants: Mutex<Vec<NewDownloadGrant>>,
        pub orders: Mutex<HashMap<String, FakeOrderRow>>,
        pub seats: Mutex<HashMap<String, (String, Option<Uuid>)>>,
        pub discounts: Mutex<HashSet<(Uuid, String)>>,
    }

    #[async_trait]
    impl EffectLedger for InMemoryLedger {
        async fn insert_commission(
            &self,
            commission: &NewCommission,
        ) -> FulfillmentResult<LedgerOutcome> {
            let mut commissions = self.commissions.lock().unwrap();
            if commissions
                .iter()
                .any(|c| c.referred_user_id == commission.referred_user_id)
            {
                return Ok(LedgerOutcome::AlreadyRecorded);
            }
            commissions.push(commission.clone());
            Ok(LedgerOutcome::Created(Uuid::new_v4()))
        }

        async fn insert_download_grant(
            &self,
            grant: &NewDownloadGrant,
        ) -> FulfillmentResult<LedgerOutcome> {
            let mut grants = self.grants.lock().unwrap();
            if grants
                .iter()
                .any(|g| g.order_id == grant.order_id && g.product_id == grant.product_id)
            {
                return Ok(LedgerOutcome::AlreadyRecorded);
            }
            grants.push(grant.clone());
            Ok(LedgerOutcome::Created(Uuid::new_v4()))
        }

        async fn insert_fulfillment_order(
            &self,
            order: &NewFulfillmentOrder,
        ) -> FulfillmentResult<LedgerOutcome> {
            let mut orders = self.orders.lock().unwrap();
            if orders.contains_key(&order.checkout_session_id) {
                return Ok(LedgerOutcome::AlreadyRecorded);
            }
            let id = Uuid::new_v4();
            orders.insert(
                order.checkout_session_id.clone(),
                FakeOrderRow {
                    id,
                    external_order_id: None,
                    failed: false,
                },
            );
            Ok(LedgerOutcome::Created(id))
        }

        async fn undispatched_fulfillment_order(
            &self,
            checkout_session_id: &str,
        ) -> FulfillmentResult<Option<Uuid>> {
            let orders = self.orders.lock().unwrap();
            Ok(orders
                .get(checkout_session_id)
                .filter(|row| row.external_order_id.is_none())
                .map(|row| row.id))
        }

        async fn set_external_order_id(
            &self,
            fulfillment_order_id: Uuid,
            external_order_id: &str,
        ) -> FulfillmentResult<()> {
            let mut orders = self.orders.lock().unwrap();
            for row in orders.values_mut() {
                if row.id == fulfillment_order_id {
                    row.external_order_id = Some(external_order_id.to_string());
                    row.failed = false;
                }
            }
            Ok(())
        }

        async fn mark_fulfillment_failed(
            &self,
            fulfillment_order_id: Uuid,
        ) -> FulfillmentResult<()> {
            let mut orders = self.orders.lock().unwrap();
            for row in orders.values_mut() {
                if row.id == fulfillment_order_id {
                    row.failed = true;
                }
            }
            Ok(())
        }

        async fn insert_seat_grant(
            &self,
            checkout_session_id: &str,
            email: &str,
            user_id: Option<Uuid>,
        ) -> FulfillmentResult<LedgerOutcome> {
            let mut seats = self.seats.lock().unwrap();
            if seats.contains_key(checkout_session_id) {
                return Ok(LedgerOutcome::AlreadyRecorded);
            }
            seats.insert(
                checkout_session_id.to_string(),
                (email.to_string(), user_id),
            );
            Ok(LedgerOutcome::Created(Uuid::new_v4()))
        }

        async fn record_discount_usage(
            &self,
            discount_code_id: Uuid,
            checkout_session_id: &str,
        ) -> FulfillmentResult<LedgerOutcome> {
            let mut discounts = self.discounts.lock().unwrap();
            if discounts.insert((discount_code_id, checkout_session_id.to_string())) {
                Ok(LedgerOutcome::Created(Uuid::new_v4()))
            } else {
                Ok(LedgerOutcome::AlreadyRecorded)
            }
        }
    }

    /// Directory fake with optional lookup failures.
    #[derive(Default)]
    pub struct StaticDirectory {
        pub users: HashMap<String, Uuid>,
        pub referrals: HashMap<Uuid, Uuid>,
        pub founders: HashSet<String>,
        pub product_files: HashMap<String, Vec<Uuid>>,
        pub fail_user_email_lookup: bool,
        pub fail_founder_lookup: bool,
    }

    #[async_trait]
    impl Directory for StaticDirectory {
        async fn user_id_by_email(&self, email: &str) -> FulfillmentResult<Option<Uuid>> {
            Ok(self.users.get(email).copied())
        }

        async fn user_email_by_id(&self, user_id: Uuid) -> FulfillmentResult<Option<String>> {
            if self.fail_user_email_lookup {
                return Err(FulfillmentError::External("user lookup offline".to_string()));
            }
            Ok(self
                .users
                .iter()
                .find(|(_, id)| **id == user_id)
                .map(|(email, _)| email.clone()))
        }

        async fn active_referrer_for(
            &self,
            referred_user_id: Uuid,
        ) -> FulfillmentResult<Option<Uuid>> {
            Ok(self.referrals.get(&referred_user_id).copied())
        }

        async fn founder_access_type(&self, email: &str) -> FulfillmentResult<Option<String>> {
            if self.fail_founder_lookup {
                return Err(FulfillmentError::External(
                    "allowlist lookup offline".to_string(),
                ));
            }
            Ok(self
                .founders
                .contains(email)
                .then(|| "founder".to_string()))
        }

        async fn product_file_ids(&self, product_id: &str) -> FulfillmentResult<Vec<Uuid>> {
            Ok(self.product_files.get(product_id).cloned().unwrap_or_default())
        }
    }

    /// Gateway fake: a canned snapshot plus a canned annual-subscription
    /// answer.
    pub struct FakeGateway {
        pub snapshot: Option<CheckoutSnapshot>,
        pub annual: bool,
    }

    #[async_trait]
    impl ProcessorGateway for FakeGateway {
        async fn fetch_checkout(&self, session_id: &str) -> FulfillmentResult<CheckoutSnapshot> {
            self.snapshot
                .clone()
                .ok_or_else(|| FulfillmentError::not_found("checkout session", session_id))
        }

        async fn has_active_annual_subscription(&self, _email: &str) -> FulfillmentResult<bool> {
            Ok(self.annual)
        }
    }

    /// Provider fake that counts calls and answers from a fixed script.
    pub struct ScriptedProvider {
        pub calls: AtomicUsize,
        pub result: Result<&'static str, &'static str>,
    }

    impl ScriptedProvider {
        pub fn succeeding(external_order_id: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Ok(external_order_id),
            }
        }

        pub fn failing(message: &'static str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result: Err(message),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DropshipProvider for ScriptedProvider {
        async fn create_order(&self, _request: &FulfillmentRequest) -> FulfillmentResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.result {
                Ok(id) => Ok(id.to_string()),
                Err(message) => Err(FulfillmentError::External(message.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod duplicate_delivery_tests {
    use std::sync::Arc;

    use uuid::Uuid;

    use orderflow_shared::{CommissionTier, FulfillmentKind};

    use super::service_fakes::{offline_audit, FakeGateway, InMemoryLedger, StaticDirectory};
    use crate::commission::CommissionResolver;
    use crate::downloads::DownloadGrantIssuer;
    use crate::gateway::LineItem;
    use crate::notify::NotificationService;
    use crate::webhooks::InvoicePayload;

    const THRESHOLD_CENTS: i64 = 15_000;

    fn invoice(email: &str) -> InvoicePayload {
        InvoicePayload {
            billing_reason: Some("subscription_create".to_string()),
            customer_email: Some(email.to_string()),
            amount_paid: Some(9_900),
            subscription: Some("sub_dup".to_string()),
        }
    }

    fn referred_directory() -> (StaticDirectory, Uuid, Uuid) {
        let referred_id = Uuid::new_v4();
        let referrer_id = Uuid::new_v4();
        let mut directory = StaticDirectory::default();
        directory
            .users
            .insert("referred@example.com".to_string(), referred_id);
        directory
            .users
            .insert("referrer@example.com".to_string(), referrer_id);
        directory.referrals.insert(referred_id, referrer_id);
        (directory, referred_id, referrer_id)
    }

    fn resolver(
        directory: StaticDirectory,
        ledger: Arc<InMemoryLedger>,
    ) -> CommissionResolver {
        CommissionResolver::with_parts(
            Arc::new(directory),
            ledger,
            offline_audit(),
            Arc::new(FakeGateway {
                snapshot: None,
                annual: false,
            }),
            NotificationService::disabled(),
            THRESHOLD_CENTS,
        )
    }

    // =========================================================================
    // Delivering the same first-payment invoice twice records exactly one
    // commission; the second pass resolves to a no-op at the ledger
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_invoice_creates_one_commission() {
        let ledger = Arc::new(InMemoryLedger::default());
        let (directory, referred_id, referrer_id) = referred_directory();
        let resolver = resolver(directory, ledger.clone());

        let invoice = invoice("referred@example.com");
        resolver.process_first_payment(&invoice).await.unwrap();
        resolver.process_first_payment(&invoice).await.unwrap();

        let commissions = ledger.commissions.lock().unwrap();
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].referred_user_id, referred_id);
        assert_eq!(commissions[0].referrer_id, referrer_id);
    }

    // =========================================================================
    // Re-issuing a grant for the same (order, product) pair yields the grant
    // once and a no-op the second time
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_grant_issue_is_single() {
        let ledger = Arc::new(InMemoryLedger::default());
        let mut directory = StaticDirectory::default();
        directory
            .product_files
            .insert("prod_ebook".to_string(), vec![Uuid::new_v4()]);

        let issuer = DownloadGrantIssuer::with_parts(
            Arc::new(directory),
            ledger.clone(),
            offline_audit(),
        );

        let item = LineItem {
            product_id: "prod_ebook".to_string(),
            product_name: "Ebook".to_string(),
            quantity: 1,
            amount_cents: 1_900,
            kind: Some(FulfillmentKind::Digital),
        };

        let first = issuer.issue("cs_dup", None, &item).await.unwrap();
        let second = issuer.issue("cs_dup", None, &item).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(ledger.grants.lock().unwrap().len(), 1);
    }

    // =========================================================================
    // A failing founder-allowlist lookup must not abort creation: the
    // commission still lands, at the default rate
    // =========================================================================
    #[tokio::test]
    async fn test_founder_lookup_failure_falls_back_to_default_rate() {
        let ledger = Arc::new(InMemoryLedger::default());
        let (mut directory, _, _) = referred_directory();
        directory.fail_founder_lookup = true;
        let resolver = resolver(directory, ledger.clone());

        resolver
            .process_first_payment(&invoice("referred@example.com"))
            .await
            .unwrap();

        let commissions = ledger.commissions.lock().unwrap();
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].rate_tier, CommissionTier::Default);
    }

    // =========================================================================
    // Same for a failing referrer-email lookup
    // =========================================================================
    #[tokio::test]
    async fn test_referrer_lookup_failure_falls_back_to_default_rate() {
        let ledger = Arc::new(InMemoryLedger::default());
        let (mut directory, _, _) = referred_directory();
        directory.fail_user_email_lookup = true;
        let resolver = resolver(directory, ledger.clone());

        resolver
            .process_first_payment(&invoice("referred@example.com"))
            .await
            .unwrap();

        let commissions = ledger.commissions.lock().unwrap();
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].rate_tier, CommissionTier::Default);
    }
}

#[cfg(test)]
mod redispatch_tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use orderflow_shared::FulfillmentKind;

    use super::service_fakes::{
        offline_audit, InMemoryLedger, ScriptedProvider, StaticDirectory,
    };
    use crate::dispatch::FulfillmentDispatcher;
    use crate::downloads::DownloadGrantIssuer;
    use crate::gateway::{CheckoutSnapshot, LineItem, ShippingAddress};
    use crate::notify::NotificationService;

    fn physical_snapshot(session_id: &str) -> CheckoutSnapshot {
        CheckoutSnapshot {
            id: session_id.to_string(),
            customer_email: Some("buyer@example.com".to_string()),
            metadata: HashMap::new(),
            amount_subtotal_cents: 2_500,
            amount_total_cents: 2_500,
            amount_discount_cents: 0,
            amount_shipping_cents: 0,
            shipping: Some(ShippingAddress {
                name: "Test Buyer".to_string(),
                line1: "1 Main St".to_string(),
                line2: None,
                city: "Springfield".to_string(),
                region: None,
                postal_code: "00000".to_string(),
                country: "US".to_string(),
            }),
            line_items: vec![LineItem {
                product_id: "prod_shirt".to_string(),
                product_name: "Shirt".to_string(),
                quantity: 1,
                amount_cents: 2_500,
                kind: Some(FulfillmentKind::Physical),
            }],
        }
    }

    fn dispatcher(
        ledger: Arc<InMemoryLedger>,
        provider: Arc<ScriptedProvider>,
    ) -> FulfillmentDispatcher {
        let directory = Arc::new(StaticDirectory::default());
        FulfillmentDispatcher::with_parts(
            directory.clone(),
            ledger.clone(),
            offline_audit(),
            DownloadGrantIssuer::with_parts(directory, ledger, offline_audit()),
            provider,
            NotificationService::disabled(),
        )
    }

    // =========================================================================
    // A checkout whose provider call failed leaves a row with no external
    // order id; replaying the event re-attempts the provider call instead of
    // stopping at the existing row
    // =========================================================================
    #[tokio::test]
    async fn test_failed_provider_order_redispatched_on_replay() {
        let ledger = Arc::new(InMemoryLedger::default());
        let snapshot = physical_snapshot("cs_redispatch");

        let failing = Arc::new(ScriptedProvider::failing("provider unavailable"));
        dispatcher(ledger.clone(), failing.clone())
            .dispatch(&snapshot)
            .await;

        assert_eq!(failing.call_count(), 1);
        {
            let orders = ledger.orders.lock().unwrap();
            let row = orders.get("cs_redispatch").unwrap();
            assert!(row.failed);
            assert!(row.external_order_id.is_none());
        }

        let healthy = Arc::new(ScriptedProvider::succeeding("ord_retry"));
        dispatcher(ledger.clone(), healthy.clone())
            .dispatch(&snapshot)
            .await;

        assert_eq!(healthy.call_count(), 1);
        let orders = ledger.orders.lock().unwrap();
        let row = orders.get("cs_redispatch").unwrap();
        assert_eq!(row.external_order_id.as_deref(), Some("ord_retry"));
        assert!(!row.failed);
    }

    // =========================================================================
    // Once the provider accepted the order, replays never resend it
    // =========================================================================
    #[tokio::test]
    async fn test_dispatched_order_not_resent_on_replay() {
        let ledger = Arc::new(InMemoryLedger::default());
        let snapshot = physical_snapshot("cs_settled");

        let provider = Arc::new(ScriptedProvider::succeeding("ord_once"));
        let dispatcher = dispatcher(ledger.clone(), provider.clone());

        dispatcher.dispatch(&snapshot).await;
        dispatcher.dispatch(&snapshot).await;

        assert_eq!(provider.call_count(), 1);
        let orders = ledger.orders.lock().unwrap();
        assert_eq!(
            orders.get("cs_settled").unwrap().external_order_id.as_deref(),
            Some("ord_once")
        );
    }
}

#[cfg(test)]
mod membership_skip_tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::service_fakes::{offline_audit, InMemoryLedger, StaticDirectory};
    use crate::gateway::CheckoutSnapshot;
    use crate::membership::MembershipService;
    use crate::notify::NotificationService;

    // =========================================================================
    // A membership checkout with no customer email settles as a skip: no
    // error (which would park the event in the replay queue forever) and no
    // seat grant
    // =========================================================================
    #[tokio::test]
    async fn test_missing_email_settles_without_error() {
        let ledger = Arc::new(InMemoryLedger::default());
        let service = MembershipService::with_parts(
            Arc::new(StaticDirectory::default()),
            ledger.clone(),
            offline_audit(),
            NotificationService::disabled(),
        );

        let snapshot = CheckoutSnapshot {
            id: "cs_no_email".to_string(),
            customer_email: None,
            metadata: HashMap::from([(
                "purchase_type".to_string(),
                "membership".to_string(),
            )]),
            amount_subtotal_cents: 15_000,
            amount_total_cents: 15_000,
            amount_discount_cents: 0,
            amount_shipping_cents: 0,
            shipping: None,
            line_items: vec![],
        };

        service.handle_purchase(&snapshot).await.unwrap();
        assert!(ledger.seats.lock().unwrap().is_empty());
    }
}

#[cfg(test)]
mod detached_persistence_tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use uuid::Uuid;

    use orderflow_shared::FulfillmentKind;

    use super::service_fakes::{
        offline_audit, offline_pool, FakeGateway, InMemoryLedger, ScriptedProvider,
        StaticDirectory,
    };
    use crate::commission::CommissionResolver;
    use crate::dispatch::FulfillmentDispatcher;
    use crate::downloads::DownloadGrantIssuer;
    use crate::gateway::{CheckoutSnapshot, LineItem, ProcessorGateway};
    use crate::membership::MembershipService;
    use crate::notify::NotificationService;
    use crate::webhooks::{spawn_detached, PaymentEvent, WebhookHandler};

    // =========================================================================
    // The detached task owns event persistence. When the event row cannot be
    // written, processing still runs to completion; the ledger keeps the
    // effects replay-safe either way
    // =========================================================================
    #[tokio::test]
    async fn test_processing_proceeds_when_event_persistence_fails() {
        let ledger = Arc::new(InMemoryLedger::default());
        let mut directory = StaticDirectory::default();
        directory
            .product_files
            .insert("prod_ebook".to_string(), vec![Uuid::new_v4()]);
        let directory = Arc::new(directory);

        let snapshot = CheckoutSnapshot {
            id: "cs_detached".to_string(),
            customer_email: Some("buyer@example.com".to_string()),
            metadata: HashMap::new(),
            amount_subtotal_cents: 1_900,
            amount_total_cents: 1_900,
            amount_discount_cents: 0,
            amount_shipping_cents: 0,
            shipping: None,
            line_items: vec![LineItem {
                product_id: "prod_ebook".to_string(),
                product_name: "Ebook".to_string(),
                quantity: 1,
                amount_cents: 1_900,
                kind: Some(FulfillmentKind::Digital),
            }],
        };

        let gateway: Arc<dyn ProcessorGateway> = Arc::new(FakeGateway {
            snapshot: Some(snapshot),
            annual: false,
        });
        let notify = NotificationService::disabled();

        let commission = CommissionResolver::with_parts(
            directory.clone(),
            ledger.clone(),
            offline_audit(),
            gateway.clone(),
            notify.clone(),
            15_000,
        );
        let dispatcher = FulfillmentDispatcher::with_parts(
            directory.clone(),
            ledger.clone(),
            offline_audit(),
            DownloadGrantIssuer::with_parts(directory.clone(), ledger.clone(), offline_audit()),
            Arc::new(ScriptedProvider::succeeding("ord_unused")),
            notify.clone(),
        );
        let membership = MembershipService::with_parts(
            directory,
            ledger.clone(),
            offline_audit(),
            notify,
        );

        // The handler's own pool points at nothing, so the event row write
        // inside the detached task fails.
        let handler = Arc::new(WebhookHandler::new(
            "whsec_detached".to_string(),
            offline_pool(),
            gateway,
            commission,
            dispatcher,
            membership,
        ));

        let event: PaymentEvent = serde_json::from_value(serde_json::json!({
            "id": "evt_detached",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": { "id": "cs_detached" } }
        }))
        .unwrap();

        spawn_detached(handler, event).await.unwrap();

        assert_eq!(ledger.grants.lock().unwrap().len(), 1);
    }
}
