//! Transaction domain entity.
//! Framework-agnostic representation of an escrow payment transaction.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const HANDOFF_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const HANDOFF_CODE_LEN: usize = 6;

/// Lifecycle status of a transaction.
///
/// Transitions are one-directional: PENDING -> PAID -> COMPLETED, with FAILED
/// reachable from PENDING or PAID. COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Failed,
    Completed,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Paid) | (Pending, Failed) | (Paid, Completed) | (Paid, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "paid" => Ok(TransactionStatus::Paid),
            "failed" => Ok(TransactionStatus::Failed),
            "completed" => Ok(TransactionStatus::Completed),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// Domain entity representing one escrow payment transaction.
///
/// `id` is the charge authority's opaque charge id; there is no separate key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    /// Amount in minor currency units (cents).
    pub amount: i64,
    pub currency: String,
    pub product_id: String,
    pub seller_id: String,
    pub buyer_id: String,
    pub is_digital: bool,
    /// Uppercase 6-character shared secret gating fund release for physical
    /// goods. Immutable once set.
    pub handoff_code: String,
    pub status: TransactionStatus,
    pub payment_method_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub handoff_verified_at: Option<DateTime<Utc>>,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        amount: i64,
        currency: String,
        product_id: String,
        seller_id: String,
        buyer_id: String,
        is_digital: bool,
        handoff_code: String,
    ) -> Self {
        Self {
            id,
            amount,
            currency,
            product_id,
            seller_id,
            buyer_id,
            is_digital,
            handoff_code,
            status: TransactionStatus::Pending,
            payment_method_id: None,
            created_at: Utc::now(),
            confirmed_at: None,
            handoff_verified_at: None,
        }
    }

    pub fn is_party(&self, subject_id: &str) -> bool {
        subject_id == self.seller_id || subject_id == self.buyer_id
    }

    /// Case-insensitive handoff code check; stored codes are uppercase.
    pub fn handoff_code_matches(&self, submitted: &str) -> bool {
        self.handoff_code == submitted.trim().to_uppercase()
    }
}

/// Generates a fresh handoff code: 6 uniform-random characters over A-Z0-9.
pub fn generate_handoff_code() -> String {
    let mut rng = rand::thread_rng();
    (0..HANDOFF_CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..HANDOFF_CODE_ALPHABET.len());
            HANDOFF_CODE_ALPHABET[idx] as char
        })
        .collect()
}

/// Normalizes a caller-supplied handoff code and validates its shape.
pub fn normalize_handoff_code(raw: &str) -> Result<String, String> {
    let code = raw.trim().to_uppercase();
    if code.len() != HANDOFF_CODE_LEN
        || !code.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
    {
        return Err(format!(
            "handoff code must be {HANDOFF_CODE_LEN} characters over A-Z0-9"
        ));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Transaction {
        Transaction::new(
            "pi_test_1".to_string(),
            5000,
            "usd".to_string(),
            "prod_1".to_string(),
            "seller_1".to_string(),
            "buyer_1".to_string(),
            false,
            "AB12CD".to_string(),
        )
    }

    #[test]
    fn test_new_transaction_is_pending() {
        let tx = sample();
        assert_eq!(tx.status, TransactionStatus::Pending);
        assert!(tx.confirmed_at.is_none());
        assert!(tx.handoff_verified_at.is_none());
    }

    #[test]
    fn test_valid_transitions() {
        use TransactionStatus::*;
        assert!(Pending.can_transition_to(Paid));
        assert!(Pending.can_transition_to(Failed));
        assert!(Paid.can_transition_to(Completed));
        assert!(Paid.can_transition_to(Failed));
    }

    #[test]
    fn test_no_transition_out_of_terminal_states() {
        use TransactionStatus::*;
        for next in [Pending, Paid, Failed, Completed] {
            assert!(!Completed.can_transition_to(next));
            assert!(!Failed.can_transition_to(next));
        }
    }

    #[test]
    fn test_no_transition_back_to_pending() {
        use TransactionStatus::*;
        assert!(!Paid.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        use TransactionStatus::*;
        for status in [Pending, Paid, Failed, Completed] {
            assert_eq!(status.as_str().parse::<TransactionStatus>(), Ok(status));
        }
        assert!("verified".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_generated_code_shape() {
        for _ in 0..100 {
            let code = generate_handoff_code();
            assert_eq!(code.len(), HANDOFF_CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn test_normalize_accepts_lowercase() {
        assert_eq!(normalize_handoff_code("ab12cd").unwrap(), "AB12CD");
        assert_eq!(normalize_handoff_code(" AB12CD ").unwrap(), "AB12CD");
    }

    #[test]
    fn test_normalize_rejects_bad_shapes() {
        assert!(normalize_handoff_code("AB12C").is_err());
        assert!(normalize_handoff_code("AB12CDE").is_err());
        assert!(normalize_handoff_code("AB-2CD").is_err());
        assert!(normalize_handoff_code("").is_err());
    }

    #[test]
    fn test_handoff_code_match_is_case_insensitive() {
        let tx = sample();
        assert!(tx.handoff_code_matches("ab12cd"));
        assert!(tx.handoff_code_matches("AB12CD"));
        assert!(!tx.handoff_code_matches("AB12CE"));
    }

    #[test]
    fn test_is_party() {
        let tx = sample();
        assert!(tx.is_party("seller_1"));
        assert!(tx.is_party("buyer_1"));
        assert!(!tx.is_party("someone_else"));
    }
}
