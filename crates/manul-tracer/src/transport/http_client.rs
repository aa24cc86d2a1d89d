//! `reqwest`-backed transport

use async_trait::async_trait;
use bytes::Bytes;

use super::{Request, Response, ResponseBody, Transport, TransportError};
use crate::config::HttpClientConfig;
use crate::error::{Error, Result};

/// Transport sending requests through a shared `reqwest::Client`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Build a client from configuration
    pub fn from_config(config: &HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = config.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| Error::config(format!("invalid proxy '{proxy}': {e}")))?;
            builder = builder.proxy(proxy);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent);
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Use an existing client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn handle_request(
        &self,
        request: Request,
    ) -> std::result::Result<Response, TransportError> {
        let response = self
            .client
            .request(request.method, request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        Ok(Response::new(status, headers, url, ReqwestBody { response }))
    }
}

/// Body read straight off the connection
struct ReqwestBody {
    response: reqwest::Response,
}

#[async_trait]
impl ResponseBody for ReqwestBody {
    async fn next_chunk(&mut self) -> std::result::Result<Option<Bytes>, TransportError> {
        Ok(self.response.chunk().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_builds_from_config() {
        let config = HttpClientConfig {
            timeout: Some(Duration::from_secs(5)),
            user_agent: Some("manul-test/1.0".to_string()),
            ..HttpClientConfig::default()
        };
        assert!(ReqwestTransport::from_config(&config).is_ok());
    }
}
