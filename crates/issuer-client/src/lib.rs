//! HTTP transport between the confirmations service and a token issuer.
//!
//! Requests can be routed through a SOCKS5 proxy so the issuer cannot tie redemptions
//! to a network address.
//!
//! ```rust,no_run
//! use issuer_client::{Config, IssuerHttpClient};
//!
//! #[tokio::main]
//! async fn main() -> issuer_client::Result<()> {
//!     let config = Config::new("https://issuer.example").with_tor();
//!     let client = IssuerHttpClient::new(config)?;
//!
//!     let issuers = client.issuers().await?;
//!     println!("{} issuer keys published", issuers.iter().count());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod http_client;

pub use config::{Config, DEFAULT_ISSUER_URL, DEFAULT_TOR_SOCKS_ADDR};
pub use error::{ClientError, Result};
pub use http_client::{IssuerHttpClient, INFO_PATH};

pub fn issuer_client(base_url: &str) -> Result<IssuerHttpClient> {
    IssuerHttpClient::new(Config::new(base_url))
}
