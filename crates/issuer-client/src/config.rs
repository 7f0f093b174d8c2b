pub const DEFAULT_ISSUER_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_TOR_SOCKS_ADDR: &str = "127.0.0.1:9050";

#[derive(Clone, Debug)]
pub struct Config {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Route every request through this SOCKS5 proxy, e.g. a local Tor daemon
    pub socks_addr: Option<String>,
    pub verify_tls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_ISSUER_URL.to_string(),
            timeout_secs: 30,
            socks_addr: None,
            verify_tls: true,
        }
    }
}

impl Config {
    pub fn new(base_url: &str) -> Self {
        Self::default().with_base_url(base_url)
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_socks_addr(mut self, addr: &str) -> Self {
        self.socks_addr = Some(addr.to_string());
        self
    }

    pub fn with_tor(self) -> Self {
        self.with_socks_addr(DEFAULT_TOR_SOCKS_ADDR)
    }

    pub fn without_tls_verification(mut self) -> Self {
        self.verify_tls = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_drops_trailing_slash() {
        let config = Config::new("https://issuer.example/");
        assert_eq!(config.base_url, "https://issuer.example");
        assert_eq!(config.timeout_secs, 30);
        assert!(config.socks_addr.is_none());
    }

    #[test]
    fn test_with_tor_uses_local_daemon() {
        let config = Config::default().with_tor().without_tls_verification();
        assert_eq!(config.socks_addr.as_deref(), Some(DEFAULT_TOR_SOCKS_ADDR));
        assert!(!config.verify_tls);
    }
}
