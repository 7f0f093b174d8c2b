use std::path::PathBuf;

pub const DEFAULT_ISSUER_NAME: &str = "0.05BAT";

#[derive(Clone, Debug)]
pub struct IssuerConfig {
    pub host: String,
    pub port: u16,
    /// Base64 signing key, created on first start
    pub key_path: PathBuf,
    /// Spent payment-token hashes; `None` keeps them in memory only
    pub spent_store_path: Option<PathBuf>,
    /// Per-token redemption value label published in `/info`
    pub name: String,
    pub valid_days: i64,
    /// One request slot is refilled every `rate_limit_replenish_ms` per client IP
    pub rate_limit_replenish_ms: u64,
    pub rate_limit_burst: u32,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            key_path: PathBuf::from("issuer_signing_key.b64"),
            spent_store_path: Some(PathBuf::from("spent_tokens.dat")),
            name: DEFAULT_ISSUER_NAME.to_string(),
            valid_days: 30,
            rate_limit_replenish_ms: 100,
            rate_limit_burst: 20,
        }
    }
}

impl IssuerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let host = std::env::var("HOST").unwrap_or(defaults.host);
        let port = std::env::var("PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let key_path = std::env::var("ISSUER_KEY_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.key_path);
        let spent_store_path = std::env::var("SPENT_STORE_PATH")
            .map(PathBuf::from)
            .ok()
            .or(defaults.spent_store_path);

        let name = std::env::var("ISSUER_NAME").unwrap_or(defaults.name);
        let valid_days = std::env::var("ISSUER_VALID_DAYS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.valid_days);

        let rate_limit_replenish_ms = std::env::var("RATE_LIMIT_REPLENISH_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.rate_limit_replenish_ms);
        let rate_limit_burst = std::env::var("RATE_LIMIT_BURST")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.rate_limit_burst);

        let config = Self {
            host,
            port,
            key_path,
            spent_store_path,
            name,
            valid_days,
            rate_limit_replenish_ms,
            rate_limit_burst,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.valid_days <= 0 {
            anyhow::bail!("ISSUER_VALID_DAYS must be positive, got {}", self.valid_days);
        }
        if self.rate_limit_replenish_ms == 0 || self.rate_limit_burst == 0 {
            anyhow::bail!("Rate limit settings must be non-zero");
        }
        Ok(())
    }

    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_path = path.into();
        self
    }

    pub fn with_spent_store_path(mut self, path: Option<PathBuf>) -> Self {
        self.spent_store_path = path;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_rate_limit(mut self, replenish_ms: u64, burst: u32) -> Self {
        self.rate_limit_replenish_ms = replenish_ms;
        self.rate_limit_burst = burst;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IssuerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.name, "0.05BAT");
    }

    #[test]
    fn test_zero_burst_rejected() {
        let config = IssuerConfig::default().with_rate_limit(100, 0);
        assert!(config.validate().is_err());
    }
}
