//! The escrow payment coordinator.
//!
//! Single authoritative owner of the transaction state machine:
//! PENDING -> PAID -> COMPLETED, with FAILED reachable from PENDING or PAID.
//! Clients never transition status locally; every transition goes through a
//! compare-and-swap against the stored status so concurrent calls against one
//! transaction id serialize instead of double-applying.

use chrono::Utc;
use std::sync::Arc;

use crate::domain::{self, Transaction, TransactionStatus};
use crate::error::AppError;
use crate::ports::{
    CaptureMode, Charge, ChargeAuthority, ChargeMetadata, CreateChargeRequest, IdentityProvider,
    MarketplaceHooks, TransactionStore,
};

/// Input for CreateTransaction.
#[derive(Debug, Clone)]
pub struct CreateTransactionInput {
    pub amount: i64,
    pub currency: String,
    pub product_id: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub product_title: String,
    pub is_digital: bool,
    pub conversation_id: Option<String>,
    /// Caller-supplied handoff code; generated server-side when absent.
    pub handoff_code: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateTransactionOutput {
    pub payment_intent_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct ConfirmPaymentOutput {
    pub success: bool,
    pub payment_intent: Charge,
}

pub struct EscrowCoordinator {
    store: Arc<dyn TransactionStore>,
    charges: Arc<dyn ChargeAuthority>,
    identity: Arc<dyn IdentityProvider>,
    hooks: Arc<dyn MarketplaceHooks>,
    /// Deployment-wide ISO currency code; requests in any other currency are
    /// rejected.
    currency: String,
}

impl EscrowCoordinator {
    pub fn new(
        store: Arc<dyn TransactionStore>,
        charges: Arc<dyn ChargeAuthority>,
        identity: Arc<dyn IdentityProvider>,
        hooks: Arc<dyn MarketplaceHooks>,
        currency: String,
    ) -> Self {
        Self {
            store,
            charges,
            identity,
            hooks,
            currency,
        }
    }

    /// Creates a held charge and the PENDING transaction record backing it.
    ///
    /// The requestor must be a party to the trade, and both parties must
    /// share an organizational affiliation. Nothing is persisted when any
    /// precondition fails.
    pub async fn create_transaction(
        &self,
        input: CreateTransactionInput,
        requestor_subject_id: &str,
    ) -> Result<CreateTransactionOutput, AppError> {
        if input.amount <= 0 {
            return Err(AppError::Validation(
                "amount must be a positive number of minor units".to_string(),
            ));
        }
        if !input.currency.eq_ignore_ascii_case(&self.currency) {
            return Err(AppError::Validation(format!(
                "unsupported currency {}, this deployment settles in {}",
                input.currency, self.currency
            )));
        }
        if requestor_subject_id != input.seller_id && requestor_subject_id != input.buyer_id {
            tracing::warn!(
                subject_id = %requestor_subject_id,
                "create-transaction rejected: requestor is not a party"
            );
            return Err(AppError::Unauthorized(
                "must be seller or buyer".to_string(),
            ));
        }

        let seller_affiliation = self.identity.affiliation(&input.seller_id).await?;
        let buyer_affiliation = self.identity.affiliation(&input.buyer_id).await?;
        match (&seller_affiliation, &buyer_affiliation) {
            (Some(seller), Some(buyer)) if seller == buyer => {}
            _ => {
                tracing::warn!(
                    seller_id = %input.seller_id,
                    buyer_id = %input.buyer_id,
                    "create-transaction rejected: affiliation mismatch"
                );
                return Err(AppError::CrossOrganizationTransaction);
            }
        }

        let handoff_code = match &input.handoff_code {
            Some(raw) => domain::transaction::normalize_handoff_code(raw)
                .map_err(AppError::Validation)?,
            None => domain::transaction::generate_handoff_code(),
        };

        let capture_mode = if input.is_digital {
            CaptureMode::Automatic
        } else {
            CaptureMode::Manual
        };

        let charge = self
            .charges
            .create(CreateChargeRequest {
                amount: input.amount,
                currency: self.currency.clone(),
                capture_mode,
                metadata: ChargeMetadata {
                    product_id: input.product_id.clone(),
                    seller_id: input.seller_id.clone(),
                    buyer_id: input.buyer_id.clone(),
                    product_title: input.product_title.clone(),
                    is_digital: input.is_digital,
                    conversation_id: input.conversation_id.clone(),
                    handoff_code: handoff_code.clone(),
                },
            })
            .await?;

        let client_secret = charge.client_secret.clone().ok_or_else(|| {
            AppError::ChargeAuthority("charge authority returned no client secret".to_string())
        })?;

        let tx = Transaction::new(
            charge.id.clone(),
            input.amount,
            self.currency.clone(),
            input.product_id,
            input.seller_id,
            input.buyer_id,
            input.is_digital,
            handoff_code,
        );
        self.store.put(&tx).await?;

        tracing::info!(
            transaction_id = %tx.id,
            amount = tx.amount,
            is_digital = tx.is_digital,
            "transaction created"
        );

        Ok(CreateTransactionOutput {
            payment_intent_id: charge.id,
            client_secret,
        })
    }

    /// Confirms the held charge with the buyer's payment method.
    ///
    /// PENDING is the only state confirm is defined in. The upstream confirm
    /// result decides PAID vs FAILED; an upstream error or timeout leaves the
    /// stored status untouched.
    pub async fn confirm_payment(
        &self,
        transaction_id: &str,
        payment_method_id: &str,
        requestor_subject_id: &str,
    ) -> Result<ConfirmPaymentOutput, AppError> {
        let tx = self.load(transaction_id).await?;
        self.require_party(&tx, requestor_subject_id)?;

        if tx.status != TransactionStatus::Pending {
            return Err(AppError::InvalidStateTransition {
                expected: TransactionStatus::Pending.to_string(),
                actual: tx.status.to_string(),
            });
        }

        let charge = self.charges.confirm(transaction_id, payment_method_id).await?;
        let success = charge.succeeded();

        let mut updated = tx.clone();
        updated.status = if success {
            TransactionStatus::Paid
        } else {
            TransactionStatus::Failed
        };
        updated.payment_method_id = Some(payment_method_id.to_string());
        updated.confirmed_at = Some(Utc::now());

        let applied = self
            .store
            .update_if_status(&updated, TransactionStatus::Pending)
            .await?;
        if !applied {
            // A concurrent confirm won the swap.
            let current = self.load(transaction_id).await?;
            return Err(AppError::InvalidStateTransition {
                expected: TransactionStatus::Pending.to_string(),
                actual: current.status.to_string(),
            });
        }

        tracing::info!(
            transaction_id = %transaction_id,
            status = %updated.status,
            "payment confirmed"
        );

        // Digital goods are delivered at confirmation, so the bookkeeping
        // happens here; payment success is never rolled back by it.
        if success && tx.is_digital {
            self.run_bookkeeping(&tx).await;
        }

        Ok(ConfirmPaymentOutput {
            success,
            payment_intent: charge,
        })
    }

    /// Verifies the seller-submitted handoff code and releases the held funds.
    ///
    /// Check order: authorization, then state, then code. A wrong code leaves
    /// the transaction PAID so the seller can retry.
    pub async fn verify_handoff_and_release(
        &self,
        transaction_id: &str,
        submitted_code: &str,
        requestor_subject_id: &str,
    ) -> Result<(), AppError> {
        let tx = self.load(transaction_id).await?;

        if requestor_subject_id != tx.seller_id {
            tracing::warn!(
                transaction_id = %transaction_id,
                subject_id = %requestor_subject_id,
                "handoff verification rejected: requestor is not the seller"
            );
            return Err(AppError::Unauthorized(
                "only the seller can verify the handoff code".to_string(),
            ));
        }

        if tx.status != TransactionStatus::Paid {
            return Err(AppError::InvalidStateTransition {
                expected: TransactionStatus::Paid.to_string(),
                actual: tx.status.to_string(),
            });
        }

        if !tx.handoff_code_matches(submitted_code) {
            return Err(AppError::InvalidHandoffCode);
        }

        // Physical goods: capture the held charge before recording the
        // transition. Capture is idempotent upstream, so a lost race here can
        // at worst repeat a capture that already happened.
        if !tx.is_digital {
            self.charges.capture(transaction_id).await?;
        }

        let mut updated = tx.clone();
        updated.status = TransactionStatus::Completed;
        updated.handoff_verified_at = Some(Utc::now());

        let applied = self
            .store
            .update_if_status(&updated, TransactionStatus::Paid)
            .await?;
        if !applied {
            let current = self.load(transaction_id).await?;
            return Err(AppError::InvalidStateTransition {
                expected: TransactionStatus::Paid.to_string(),
                actual: current.status.to_string(),
            });
        }

        tracing::info!(transaction_id = %transaction_id, "handoff verified, funds released");

        self.run_bookkeeping(&tx).await;

        Ok(())
    }

    /// Read-only projection, restricted to the parties of the transaction.
    pub async fn get_transaction(
        &self,
        transaction_id: &str,
        requestor_subject_id: &str,
    ) -> Result<Transaction, AppError> {
        let tx = self.load(transaction_id).await?;
        self.require_party(&tx, requestor_subject_id)?;
        Ok(tx)
    }

    async fn load(&self, transaction_id: &str) -> Result<Transaction, AppError> {
        self.store
            .get(transaction_id)
            .await?
            .ok_or_else(|| AppError::TransactionNotFound(transaction_id.to_string()))
    }

    fn require_party(&self, tx: &Transaction, subject_id: &str) -> Result<(), AppError> {
        if !tx.is_party(subject_id) {
            return Err(AppError::Unauthorized(
                "must be a party to this transaction".to_string(),
            ));
        }
        Ok(())
    }

    /// Best-effort bookkeeping: failures are logged, never propagated.
    async fn run_bookkeeping(&self, tx: &Transaction) {
        if let Err(e) = self.hooks.mark_product_sold(&tx.product_id, &tx.buyer_id).await {
            tracing::warn!(
                transaction_id = %tx.id,
                product_id = %tx.product_id,
                error = %e,
                "failed to mark product sold"
            );
        }
        if let Err(e) = self.hooks.increment_seller_sales(&tx.seller_id).await {
            tracing::warn!(
                transaction_id = %tx.id,
                seller_id = %tx.seller_id,
                error = %e,
                "failed to increment seller sales"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ChargeError, HookError};
    use crate::store::InMemoryTransactionStore;
    use crate::upstream::{SandboxChargeAuthority, StaticIdentityProvider};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct RecordingHooks {
        sold: AtomicU64,
        sales: AtomicU64,
        fail: bool,
    }

    impl RecordingHooks {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl MarketplaceHooks for RecordingHooks {
        async fn mark_product_sold(&self, _: &str, _: &str) -> Result<(), HookError> {
            self.sold.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(HookError("product service down".to_string()));
            }
            Ok(())
        }

        async fn increment_seller_sales(&self, _: &str) -> Result<(), HookError> {
            self.sales.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(HookError("user service down".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Fault {
        Timeout,
        Outage,
    }

    impl Fault {
        fn to_error(self, op: &str) -> ChargeError {
            match self {
                Fault::Timeout => ChargeError::Timeout(op.to_string()),
                Fault::Outage => ChargeError::Upstream("service unavailable".to_string()),
            }
        }
    }

    /// Delegates to the sandbox authority but fails the selected operations,
    /// for exercising the no-partial-transition paths.
    struct FaultyChargeAuthority {
        inner: Arc<SandboxChargeAuthority>,
        confirm_fault: Option<Fault>,
        capture_fault: Option<Fault>,
    }

    #[async_trait]
    impl ChargeAuthority for FaultyChargeAuthority {
        async fn create(&self, req: CreateChargeRequest) -> Result<Charge, ChargeError> {
            self.inner.create(req).await
        }

        async fn confirm(
            &self,
            charge_id: &str,
            payment_method_id: &str,
        ) -> Result<Charge, ChargeError> {
            match self.confirm_fault {
                Some(fault) => Err(fault.to_error("confirm")),
                None => self.inner.confirm(charge_id, payment_method_id).await,
            }
        }

        async fn capture(&self, charge_id: &str) -> Result<Charge, ChargeError> {
            match self.capture_fault {
                Some(fault) => Err(fault.to_error("capture")),
                None => self.inner.capture(charge_id).await,
            }
        }
    }

    struct Harness {
        coordinator: EscrowCoordinator,
        store: Arc<InMemoryTransactionStore>,
        charges: Arc<SandboxChargeAuthority>,
        hooks: Arc<RecordingHooks>,
    }

    fn harness() -> Harness {
        harness_with_hooks(Arc::new(RecordingHooks::default()))
    }

    fn harness_with_hooks(hooks: Arc<RecordingHooks>) -> Harness {
        let store = Arc::new(InMemoryTransactionStore::new());
        let charges = Arc::new(SandboxChargeAuthority::new());
        let identity = Arc::new(
            StaticIdentityProvider::new()
                .with_user("seller_1", Some("state.edu"), None)
                .with_user("buyer_1", None, Some("bob@state.edu"))
                .with_user("outsider_1", Some("rival.edu"), None),
        );
        let coordinator = EscrowCoordinator::new(
            store.clone(),
            charges.clone(),
            identity,
            hooks.clone(),
            "usd".to_string(),
        );
        Harness {
            coordinator,
            store,
            charges,
            hooks,
        }
    }

    fn harness_with_faults(confirm_fault: Option<Fault>, capture_fault: Option<Fault>) -> Harness {
        let store = Arc::new(InMemoryTransactionStore::new());
        let charges = Arc::new(SandboxChargeAuthority::new());
        let faulty = Arc::new(FaultyChargeAuthority {
            inner: charges.clone(),
            confirm_fault,
            capture_fault,
        });
        let identity = Arc::new(
            StaticIdentityProvider::new()
                .with_user("seller_1", Some("state.edu"), None)
                .with_user("buyer_1", None, Some("bob@state.edu"))
                .with_user("outsider_1", Some("rival.edu"), None),
        );
        let hooks = Arc::new(RecordingHooks::default());
        let coordinator = EscrowCoordinator::new(
            store.clone(),
            faulty,
            identity,
            hooks.clone(),
            "usd".to_string(),
        );
        Harness {
            coordinator,
            store,
            charges,
            hooks,
        }
    }

    fn create_input(is_digital: bool) -> CreateTransactionInput {
        CreateTransactionInput {
            amount: 5000,
            currency: "usd".to_string(),
            product_id: "prod_1".to_string(),
            seller_id: "seller_1".to_string(),
            buyer_id: "buyer_1".to_string(),
            product_title: "Calculus textbook".to_string(),
            is_digital,
            conversation_id: Some("conv_1".to_string()),
            handoff_code: None,
        }
    }

    async fn created(h: &Harness, is_digital: bool) -> String {
        h.coordinator
            .create_transaction(create_input(is_digital), "buyer_1")
            .await
            .unwrap()
            .payment_intent_id
    }

    #[tokio::test]
    async fn test_create_yields_pending_with_wellformed_code() {
        let h = harness();
        let out = h
            .coordinator
            .create_transaction(create_input(false), "buyer_1")
            .await
            .unwrap();

        assert!(!out.client_secret.is_empty());
        let tx = h.store.get(&out.payment_intent_id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.handoff_code.len(), 6);
        assert!(tx
            .handoff_code
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_create_accepts_seller_as_requestor() {
        let h = harness();
        assert!(h
            .coordinator
            .create_transaction(create_input(false), "seller_1")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_create_rejects_non_party_requestor() {
        let h = harness();
        let err = h
            .coordinator
            .create_transaction(create_input(false), "outsider_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_rejects_non_positive_amount() {
        let h = harness();
        let mut input = create_input(false);
        input.amount = 0;
        let err = h
            .coordinator
            .create_transaction(input, "buyer_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_currency_mismatch() {
        let h = harness();
        let mut input = create_input(false);
        input.currency = "eur".to_string();
        let err = h
            .coordinator
            .create_transaction(input, "buyer_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_cross_school_trade_without_persisting() {
        let h = harness();
        let mut input = create_input(false);
        input.buyer_id = "outsider_1".to_string();
        let err = h
            .coordinator
            .create_transaction(input, "seller_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CrossOrganizationTransaction));
        assert!(h.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_normalizes_supplied_code() {
        let h = harness();
        let mut input = create_input(false);
        input.handoff_code = Some("ab12cd".to_string());
        let out = h
            .coordinator
            .create_transaction(input, "buyer_1")
            .await
            .unwrap();
        let tx = h.store.get(&out.payment_intent_id).await.unwrap().unwrap();
        assert_eq!(tx.handoff_code, "AB12CD");
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_supplied_code() {
        let h = harness();
        let mut input = create_input(false);
        input.handoff_code = Some("nope".to_string());
        assert!(matches!(
            h.coordinator
                .create_transaction(input, "buyer_1")
                .await
                .unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_physical_flow_holds_capture_until_handoff() {
        let h = harness();
        let id = created(&h, false).await;

        let out = h
            .coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Paid
        );
        // Funds still held: no capture at confirm for physical goods.
        assert!(!h.charges.is_captured(&id).await);
        assert_eq!(h.charges.capture_calls(&id).await, 0);

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        h.coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap();

        let tx = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert!(tx.handoff_verified_at.is_some());
        assert!(h.charges.is_captured(&id).await);
        assert_eq!(h.charges.capture_calls(&id).await, 1);
    }

    #[tokio::test]
    async fn test_digital_flow_captures_at_confirm() {
        let h = harness();
        let id = created(&h, true).await;

        let out = h
            .coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Paid
        );
        // Automatic capture mode: captured at confirmation, no handoff step.
        assert!(h.charges.is_captured(&id).await);
        assert_eq!(h.charges.capture_calls(&id).await, 0);
        assert_eq!(h.hooks.sold.load(Ordering::Relaxed), 1);
        assert_eq!(h.hooks.sales.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_confirm_failure_transitions_to_failed() {
        let h = harness();
        let id = created(&h, false).await;

        let out = h
            .coordinator
            .confirm_payment(&id, "pm_declined_visa", "buyer_1")
            .await
            .unwrap();
        assert!(!out.success);
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_confirm_on_non_pending_fails_without_mutation() {
        let h = harness();
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let before = h.store.get(&id).await.unwrap().unwrap();
        let err = h
            .coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));

        let after = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(after.status, before.status);
        assert_eq!(after.confirmed_at, before.confirmed_at);
    }

    #[tokio::test]
    async fn test_confirm_missing_transaction() {
        let h = harness();
        assert!(matches!(
            h.coordinator
                .confirm_payment("pi_ghost", "pm_ok", "buyer_1")
                .await
                .unwrap_err(),
            AppError::TransactionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_confirm_timeout_leaves_transaction_pending() {
        let h = harness_with_faults(Some(Fault::Timeout), None);
        let id = created(&h, false).await;

        let err = h
            .coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamTimeout(_)));

        let tx = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.confirmed_at.is_none());
        assert!(tx.payment_method_id.is_none());
    }

    #[tokio::test]
    async fn test_confirm_outage_leaves_transaction_pending() {
        let h = harness_with_faults(Some(Fault::Outage), None);
        let id = created(&h, false).await;

        let err = h
            .coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ChargeAuthority(_)));
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_capture_failure_leaves_transaction_paid() {
        let h = harness_with_faults(None, Some(Fault::Timeout));
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        let err = h
            .coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamTimeout(_)));

        let tx = h.store.get(&id).await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Paid);
        assert!(tx.handoff_verified_at.is_none());
        assert!(!h.charges.is_captured(&id).await);
    }

    #[tokio::test]
    async fn test_verify_is_case_insensitive() {
        let h = harness();
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        h.coordinator
            .verify_handoff_and_release(&id, &code.to_lowercase(), "seller_1")
            .await
            .unwrap();
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_verify_wrong_code_is_retryable() {
        let h = harness();
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let err = h
            .coordinator
            .verify_handoff_and_release(&id, "WRONG1", "seller_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidHandoffCode));
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Paid
        );
        assert_eq!(h.charges.capture_calls(&id).await, 0);

        // Seller retries with the right code.
        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        h.coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_double_verify_captures_exactly_once() {
        let h = harness();
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        h.coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap();

        let err = h
            .coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));
        assert_eq!(h.charges.capture_calls(&id).await, 1);
    }

    #[tokio::test]
    async fn test_verify_rejects_non_seller_even_with_correct_code() {
        let h = harness();
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        for subject in ["buyer_1", "outsider_1"] {
            let err = h
                .coordinator
                .verify_handoff_and_release(&id, &code, subject)
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Unauthorized(_)));
        }
        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_verify_before_payment_fails() {
        let h = harness();
        let id = created(&h, false).await;
        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        let err = h
            .coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_bookkeeping_failure_does_not_fail_the_operation() {
        let h = harness_with_hooks(Arc::new(RecordingHooks::failing()));
        let id = created(&h, false).await;
        h.coordinator
            .confirm_payment(&id, "pm_ok", "buyer_1")
            .await
            .unwrap();

        let code = h.store.get(&id).await.unwrap().unwrap().handoff_code;
        h.coordinator
            .verify_handoff_and_release(&id, &code, "seller_1")
            .await
            .unwrap();

        assert_eq!(
            h.store.get(&id).await.unwrap().unwrap().status,
            TransactionStatus::Completed
        );
        assert_eq!(h.hooks.sold.load(Ordering::Relaxed), 1);
        assert_eq!(h.hooks.sales.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_get_transaction_restricted_to_parties() {
        let h = harness();
        let id = created(&h, false).await;

        assert!(h.coordinator.get_transaction(&id, "buyer_1").await.is_ok());
        assert!(h.coordinator.get_transaction(&id, "seller_1").await.is_ok());
        assert!(matches!(
            h.coordinator
                .get_transaction(&id, "outsider_1")
                .await
                .unwrap_err(),
            AppError::Unauthorized(_)
        ));
        assert!(matches!(
            h.coordinator
                .get_transaction("pi_ghost", "buyer_1")
                .await
                .unwrap_err(),
            AppError::TransactionNotFound(_)
        ));
    }
}
