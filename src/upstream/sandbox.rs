//! Sandbox adapters: simulated payments and a static identity directory.
//!
//! The sandbox charge authority mirrors the live contract without moving
//! money. Confirm succeeds unless the payment method id starts with
//! `pm_declined`; automatic-capture charges are captured as part of the
//! confirm, manual ones wait for an explicit capture. Capture calls are
//! counted per charge so tests can assert exactly-once release.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::ports::{
    CaptureMode, Charge, ChargeAuthority, ChargeError, CreateChargeRequest, IdentityError,
    IdentityProvider,
};

pub const DECLINED_PAYMENT_METHOD_PREFIX: &str = "pm_declined";

#[derive(Debug, Clone)]
struct SandboxCharge {
    capture_mode: CaptureMode,
    status: String,
    captured: bool,
    capture_calls: u64,
}

#[derive(Default, Clone)]
pub struct SandboxChargeAuthority {
    charges: Arc<RwLock<HashMap<String, SandboxCharge>>>,
    next_id: Arc<AtomicU64>,
}

impl SandboxChargeAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of capture calls issued against `charge_id`.
    pub async fn capture_calls(&self, charge_id: &str) -> u64 {
        self.charges
            .read()
            .await
            .get(charge_id)
            .map(|c| c.capture_calls)
            .unwrap_or(0)
    }

    pub async fn is_captured(&self, charge_id: &str) -> bool {
        self.charges
            .read()
            .await
            .get(charge_id)
            .map(|c| c.captured)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ChargeAuthority for SandboxChargeAuthority {
    async fn create(&self, req: CreateChargeRequest) -> Result<Charge, ChargeError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = format!("pi_sandbox_{n}");
        let secret = format!("{id}_secret_{}", Uuid::new_v4().simple());

        let mut charges = self.charges.write().await;
        charges.insert(
            id.clone(),
            SandboxCharge {
                capture_mode: req.capture_mode,
                status: "requires_confirmation".to_string(),
                captured: false,
                capture_calls: 0,
            },
        );

        Ok(Charge {
            id,
            status: "requires_confirmation".to_string(),
            client_secret: Some(secret),
        })
    }

    async fn confirm(
        &self,
        charge_id: &str,
        payment_method_id: &str,
    ) -> Result<Charge, ChargeError> {
        let mut charges = self.charges.write().await;
        let charge = charges
            .get_mut(charge_id)
            .ok_or_else(|| ChargeError::Upstream(format!("no such charge: {charge_id}")))?;

        if payment_method_id.starts_with(DECLINED_PAYMENT_METHOD_PREFIX) {
            charge.status = "requires_payment_method".to_string();
        } else {
            charge.status = "succeeded".to_string();
            if charge.capture_mode == CaptureMode::Automatic {
                charge.captured = true;
            }
        }

        Ok(Charge {
            id: charge_id.to_string(),
            status: charge.status.clone(),
            client_secret: None,
        })
    }

    async fn capture(&self, charge_id: &str) -> Result<Charge, ChargeError> {
        let mut charges = self.charges.write().await;
        let charge = charges
            .get_mut(charge_id)
            .ok_or_else(|| ChargeError::Upstream(format!("no such charge: {charge_id}")))?;

        charge.capture_calls += 1;
        // Idempotent: capturing an already-captured charge is a success.
        charge.captured = true;
        charge.status = "succeeded".to_string();

        Ok(Charge {
            id: charge_id.to_string(),
            status: "succeeded".to_string(),
            client_secret: None,
        })
    }
}

#[derive(Debug, Clone)]
struct StaticUser {
    school_domain: Option<String>,
    email: Option<String>,
}

/// Fixed token/user directory for sandbox deployments and tests.
#[derive(Default, Clone)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, String>,
    users: HashMap<String, StaticUser>,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: &str, subject_id: &str) -> Self {
        self.tokens.insert(token.to_string(), subject_id.to_string());
        self
    }

    pub fn with_user(mut self, subject_id: &str, school_domain: Option<&str>, email: Option<&str>) -> Self {
        self.users.insert(
            subject_id.to_string(),
            StaticUser {
                school_domain: school_domain.map(str::to_string),
                email: email.map(str::to_string),
            },
        );
        self
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, bearer_token: &str) -> Result<String, IdentityError> {
        self.tokens
            .get(bearer_token)
            .cloned()
            .ok_or_else(|| IdentityError::InvalidCredential("unknown token".to_string()))
    }

    async fn affiliation(&self, subject_id: &str) -> Result<Option<String>, IdentityError> {
        let user = self
            .users
            .get(subject_id)
            .ok_or_else(|| IdentityError::UserNotFound(subject_id.to_string()))?;

        if let Some(domain) = &user.school_domain {
            if !domain.is_empty() {
                return Ok(Some(domain.to_lowercase()));
            }
        }
        Ok(user
            .email
            .as_deref()
            .and_then(|email| email.split_once('@'))
            .map(|(_, domain)| domain.to_lowercase())
            .filter(|domain| !domain.is_empty()))
    }
}
