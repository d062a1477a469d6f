use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Only required when the admission limiter runs on the shared backend.
    pub redis_url: Option<String>,
    pub admin_key: String,
    /// Base URL of the eSIM provisioning API.
    pub provisioner_url: String,
    pub provisioner_api_key: String,
    /// Base URL of the external billing ledger (invoices + usage events).
    pub billing_url: String,
    pub billing_api_key: String,
    /// Transactional mail relay for activation notifications. Optional:
    /// without it, NOTIFY degrades to a logged no-op.
    pub mailer_url: Option<String>,
    pub mailer_api_key: Option<String>,
    /// Product activated by the `activate_esim` tool.
    pub product_id: String,
    /// Default hourly quota assigned to newly issued API keys.
    pub default_key_quota: i64,
    /// Global admission ceiling over the provisioning API.
    pub admission_limit: usize,
    /// Admission window in seconds.
    pub admission_window_secs: i64,
    /// "memory" (single instance) or "redis" (multi-replica).
    pub admission_backend: AdmissionBackend,
    /// How long usage-log rows are retained, in hours.
    pub usage_retention_hours: i64,
    /// Linear conversion from accepted calls to billable units.
    pub metering_units_per_call: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AdmissionBackend {
    Memory,
    Redis,
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let admin_key =
        std::env::var("ESIMGATE_ADMIN_KEY").unwrap_or_else(|_| "CHANGE_ME_ADMIN_KEY".into());

    if admin_key == "CHANGE_ME_ADMIN_KEY" {
        let env_mode = std::env::var("ESIMGATE_ENV")
            .or_else(|_| std::env::var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "ESIMGATE_ADMIN_KEY is still the insecure placeholder. \
                 Set a proper random key before running in production."
            );
        }
        eprintln!("⚠️  ESIMGATE_ADMIN_KEY is not set — using insecure placeholder. Set a random key for production.");
    }

    let admission_backend = match std::env::var("ESIMGATE_ADMISSION_BACKEND")
        .unwrap_or_else(|_| "memory".into())
        .as_str()
    {
        "redis" => AdmissionBackend::Redis,
        "memory" => AdmissionBackend::Memory,
        other => anyhow::bail!("invalid ESIMGATE_ADMISSION_BACKEND: {}", other),
    };

    let redis_url = std::env::var("REDIS_URL").ok();
    if admission_backend == AdmissionBackend::Redis && redis_url.is_none() {
        anyhow::bail!("ESIMGATE_ADMISSION_BACKEND=redis requires REDIS_URL");
    }

    Ok(Config {
        port: std::env::var("ESIMGATE_PORT")
            .unwrap_or_else(|_| "8443".into())
            .parse()
            .unwrap_or(8443),
        database_url: std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/esimgate".into()),
        redis_url,
        admin_key,
        provisioner_url: std::env::var("ESIMGATE_PROVISIONER_URL")
            .unwrap_or_else(|_| "http://localhost:9090".into()),
        provisioner_api_key: std::env::var("ESIMGATE_PROVISIONER_API_KEY").unwrap_or_default(),
        billing_url: std::env::var("ESIMGATE_BILLING_URL")
            .unwrap_or_else(|_| "http://localhost:9091".into()),
        billing_api_key: std::env::var("ESIMGATE_BILLING_API_KEY").unwrap_or_default(),
        mailer_url: std::env::var("ESIMGATE_MAILER_URL").ok(),
        mailer_api_key: std::env::var("ESIMGATE_MAILER_API_KEY").ok(),
        product_id: std::env::var("ESIMGATE_PRODUCT_ID")
            .unwrap_or_else(|_| "global-esim".into()),
        default_key_quota: std::env::var("ESIMGATE_DEFAULT_KEY_QUOTA")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60),
        admission_limit: std::env::var("ESIMGATE_ADMISSION_LIMIT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100),
        admission_window_secs: std::env::var("ESIMGATE_ADMISSION_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600),
        admission_backend,
        usage_retention_hours: std::env::var("ESIMGATE_USAGE_RETENTION_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(24),
        metering_units_per_call: match std::env::var("ESIMGATE_METERING_UNITS_PER_CALL") {
            Ok(raw) => parse_units_per_call(&raw)?,
            Err(_) => Decimal::ONE,
        },
    })
}

/// A misconfigured conversion factor would silently mis-bill every call,
/// so anything but a positive decimal refuses to start.
fn parse_units_per_call(raw: &str) -> anyhow::Result<Decimal> {
    let factor: Decimal = raw.parse().map_err(|_| {
        anyhow::anyhow!("invalid ESIMGATE_METERING_UNITS_PER_CALL: {:?}", raw)
    })?;
    if factor <= Decimal::ZERO {
        anyhow::bail!(
            "ESIMGATE_METERING_UNITS_PER_CALL must be positive, got {}",
            raw
        );
    }
    Ok(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metering_factor_accepts_positive_decimals() {
        assert_eq!(parse_units_per_call("0.5").unwrap(), Decimal::new(5, 1));
        assert_eq!(parse_units_per_call("1").unwrap(), Decimal::ONE);
    }

    #[test]
    fn metering_factor_rejects_garbage_and_nonpositive() {
        for raw in ["NaN", "inf", "abc", "", "0", "-1", "-0.25"] {
            assert!(parse_units_per_call(raw).is_err(), "accepted {:?}", raw);
        }
    }
}
