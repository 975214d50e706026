//! HTTP client for the charge authority (held-charge create/confirm/capture).

use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::ports::{Charge, ChargeAuthority, ChargeError, CreateChargeRequest};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    error: Option<String>,
    code: Option<String>,
}

/// HTTP client for the charge authority API, with per-request timeouts and a
/// consecutive-failures circuit breaker.
#[derive(Clone)]
pub struct HttpChargeAuthority {
    client: Client,
    base_url: String,
    secret_key: String,
    circuit_breaker: Breaker,
}

impl HttpChargeAuthority {
    pub fn new(base_url: String, secret_key: String, timeout_secs: u64) -> Self {
        let timeout = if timeout_secs == 0 {
            DEFAULT_TIMEOUT_SECS
        } else {
            timeout_secs
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(60), Duration::from_secs(120));
        let policy = failure_policy::consecutive_failures(3, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        HttpChargeAuthority {
            client,
            base_url,
            secret_key,
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker.
    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post(
        &self,
        op: &'static str,
        url: String,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ChargeError> {
        self.client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify(op, e))
    }
}

fn classify(op: &'static str, err: reqwest::Error) -> ChargeError {
    if err.is_timeout() {
        ChargeError::Timeout(op.to_string())
    } else {
        ChargeError::Upstream(err.to_string())
    }
}

async fn read_charge(op: &'static str, response: reqwest::Response) -> Result<Charge, ChargeError> {
    let status = response.status();
    if status.is_success() {
        return response.json::<Charge>().await.map_err(|e| classify(op, e));
    }

    let body = response
        .json::<UpstreamErrorBody>()
        .await
        .unwrap_or(UpstreamErrorBody {
            error: None,
            code: None,
        });
    Err(ChargeError::Upstream(format!(
        "{op} failed with status {status}: {}",
        body.error.unwrap_or_else(|| "no detail".to_string())
    )))
}

#[async_trait]
impl ChargeAuthority for HttpChargeAuthority {
    async fn create(&self, req: CreateChargeRequest) -> Result<Charge, ChargeError> {
        let url = self.url("/charges");
        let body = json!({
            "amount": req.amount,
            "currency": req.currency,
            "capture_method": req.capture_mode.as_str(),
            "metadata": req.metadata,
        });

        let result = self
            .circuit_breaker
            .call(async move {
                let response = self.post("create charge", url, body).await?;
                read_charge("create charge", response).await
            })
            .await;

        unwrap_breaker(result)
    }

    async fn confirm(
        &self,
        charge_id: &str,
        payment_method_id: &str,
    ) -> Result<Charge, ChargeError> {
        let url = self.url(&format!("/charges/{charge_id}/confirm"));
        let body = json!({ "payment_method_id": payment_method_id });

        let result = self
            .circuit_breaker
            .call(async move {
                let response = self.post("confirm charge", url, body).await?;
                read_charge("confirm charge", response).await
            })
            .await;

        unwrap_breaker(result)
    }

    async fn capture(&self, charge_id: &str) -> Result<Charge, ChargeError> {
        let url = self.url(&format!("/charges/{charge_id}/capture"));
        let id = charge_id.to_string();

        let result = self
            .circuit_breaker
            .call(async move {
                let response = self.post("capture charge", url, json!({})).await?;
                let status = response.status();
                if status.is_success() {
                    return read_charge("capture charge", response).await;
                }
                // A repeat capture of an already-captured charge is success,
                // not an error: the funds are where the caller wanted them.
                let body = response
                    .json::<UpstreamErrorBody>()
                    .await
                    .unwrap_or(UpstreamErrorBody {
                        error: None,
                        code: None,
                    });
                if body.code.as_deref() == Some("already_captured") {
                    return Ok(Charge {
                        id,
                        status: "succeeded".to_string(),
                        client_secret: None,
                    });
                }
                Err(ChargeError::Upstream(format!(
                    "capture charge failed with status {status}: {}",
                    body.error.unwrap_or_else(|| "no detail".to_string())
                )))
            })
            .await;

        unwrap_breaker(result)
    }
}

fn unwrap_breaker(result: Result<Charge, FailsafeError<ChargeError>>) -> Result<Charge, ChargeError> {
    match result {
        Ok(charge) => Ok(charge),
        Err(FailsafeError::Rejected) => Err(ChargeError::CircuitOpen),
        Err(FailsafeError::Inner(e)) => Err(e),
    }
}
