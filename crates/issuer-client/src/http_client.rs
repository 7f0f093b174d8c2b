use std::time::Duration;

use ads_confirmations::{
    IssuerRequest, IssuerResponse, Issuers, Method, NetworkError, Transport,
};
use async_trait::async_trait;
use reqwest::{Client, Proxy};
use tracing::debug;

use crate::config::Config;
use crate::error::{ClientError, Result};

/// Path of the issuer's catalog endpoint
pub const INFO_PATH: &str = "/info";

pub struct IssuerHttpClient {
    client: Client,
    config: Config,
}

impl IssuerHttpClient {
    pub fn new(config: Config) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        if let Some(addr) = &config.socks_addr {
            // socks5h resolves names at the proxy so lookups do not leak locally
            let proxy = Proxy::all(format!("socks5h://{}", addr))
                .map_err(|e| ClientError::Config(format!("Invalid proxy URL: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| ClientError::Config(format!("Failed to build client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    pub async fn execute(&self, request: &IssuerRequest) -> Result<IssuerResponse> {
        let url = self.url(&request.path);
        let builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => match &request.body {
                Some(body) => self.client.post(&url).json(body),
                None => self.client.post(&url),
            },
        };

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        debug!("{:?} {} -> {}", request.method, request.path, status);

        Ok(IssuerResponse::new(status, body))
    }

    /// Fetches the issuer catalog published at `/info`
    pub async fn issuers(&self) -> Result<Issuers> {
        let response = self.execute(&IssuerRequest::get(INFO_PATH)).await?;
        if !(200..300).contains(&response.status) {
            return Err(ClientError::Status {
                status: response.status,
                body: response.body,
            });
        }
        serde_json::from_str(&response.body)
            .map_err(|e| ClientError::Decode(format!("Invalid issuer catalog: {}", e)))
    }
}

#[async_trait]
impl Transport for IssuerHttpClient {
    async fn send(&self, request: IssuerRequest) -> std::result::Result<IssuerResponse, NetworkError> {
        self.execute(&request).await.map_err(NetworkError::from)
    }
}
