//! In-process HTTP probe.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use super::{ProbeError, ProbeMethod, BYPASS_HEADER};

/// Probes with a pooled `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpClientProbe {
    client: Client,
}

impl HttpClientProbe {
    pub fn new(request_timeout: Duration) -> Result<Self, ProbeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(BYPASS_HEADER.0),
            HeaderValue::from_static(BYPASS_HEADER.1),
        );
        let client = Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| ProbeError::ClientBuild(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProbeMethod for HttpClientProbe {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_status(&self, url: &str) -> Result<u16, ProbeError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Request(format!("timed out: {e}"))
            } else {
                ProbeError::Request(e.to_string())
            }
        })?;
        Ok(response.status().as_u16())
    }
}
