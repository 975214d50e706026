use anyhow::Result;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;

/// Which set of upstream adapters to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentMode {
    /// Real charge authority and identity verifier over HTTP.
    Live,
    /// Simulated payments and a static identity directory.
    Sandbox,
}

impl FromStr for PaymentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "live" => Ok(PaymentMode::Live),
            "sandbox" => Ok(PaymentMode::Sandbox),
            other => Err(format!("PAYMENT_MODE must be 'live' or 'sandbox', got '{other}'")),
        }
    }
}

/// One entry of the sandbox identity directory, parsed from
/// `SANDBOX_USERS` as `token:subject_id:school_domain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxUser {
    pub token: String,
    pub subject_id: String,
    pub school_domain: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub currency: String,
    pub payment_mode: PaymentMode,
    pub charge_authority_url: Option<String>,
    pub charge_authority_secret: Option<String>,
    pub identity_url: Option<String>,
    pub marketplace_url: Option<String>,
    pub upstream_timeout_secs: u64,
    pub sandbox_users: Vec<SandboxUser>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let payment_mode = env::var("PAYMENT_MODE")
            .unwrap_or_else(|_| "sandbox".to_string())
            .parse::<PaymentMode>()
            .map_err(anyhow::Error::msg)?;

        let config = Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:escrow.db".to_string()),
            currency: env::var("CURRENCY")
                .unwrap_or_else(|_| "usd".to_string())
                .to_lowercase(),
            payment_mode,
            charge_authority_url: env::var("CHARGE_AUTHORITY_URL").ok(),
            charge_authority_secret: env::var("CHARGE_AUTHORITY_SECRET").ok(),
            identity_url: env::var("IDENTITY_URL").ok(),
            marketplace_url: env::var("MARKETPLACE_URL").ok(),
            upstream_timeout_secs: env::var("UPSTREAM_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            sandbox_users: parse_sandbox_users(
                &env::var("SANDBOX_USERS").unwrap_or_default(),
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.payment_mode == PaymentMode::Live {
            if self.charge_authority_url.is_none() || self.charge_authority_secret.is_none() {
                anyhow::bail!(
                    "CHARGE_AUTHORITY_URL and CHARGE_AUTHORITY_SECRET are required in live mode"
                );
            }
            if self.identity_url.is_none() {
                anyhow::bail!("IDENTITY_URL is required in live mode");
            }
        }
        if self.upstream_timeout_secs == 0 {
            anyhow::bail!("UPSTREAM_TIMEOUT_SECS must be greater than 0");
        }
        Ok(())
    }
}

fn parse_sandbox_users(raw: &str) -> Result<Vec<SandboxUser>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(token), Some(subject_id), Some(domain))
                    if !token.is_empty() && !subject_id.is_empty() && !domain.is_empty() =>
                {
                    Ok(SandboxUser {
                        token: token.to_string(),
                        subject_id: subject_id.to_string(),
                        school_domain: domain.to_lowercase(),
                    })
                }
                _ => anyhow::bail!(
                    "SANDBOX_USERS entries must be 'token:subject_id:school_domain', got '{entry}'"
                ),
            }
        })
        .collect()
}
