//! HTTP client for the campus access-control gateway.
//!
//! The gateway takes form-encoded POSTs and answers with GBK-encoded HTML
//! unless it declares another charset.

use std::time::Duration;

use async_trait::async_trait;

use crate::reconnect::{AccessControl, AccessError, Credential};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HttpAccessControl {
    client: reqwest::Client,
    url: String,
}

impl HttpAccessControl {
    pub fn new(url: impl Into<String>) -> Result<Self, AccessError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AccessError::Request(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<reqwest::Response, AccessError> {
        let resp = self
            .client
            .post(&self.url)
            .form(form)
            .send()
            .await
            .map_err(|e| AccessError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AccessError::Status(status.as_u16()));
        }
        Ok(resp)
    }
}

#[async_trait]
impl AccessControl for HttpAccessControl {
    async fn connect(&self, credential: &Credential) -> Result<String, AccessError> {
        let resp = self
            .post(&[
                ("uid", credential.name.as_str()),
                ("password", credential.secret.as_str()),
                ("range", "1"),
                ("operation", "connect"),
                ("timeout", "1"),
            ])
            .await?;
        resp.text_with_charset("gbk")
            .await
            .map_err(|e| AccessError::Request(e.to_string()))
    }

    async fn disconnect_all(&self, credential: &Credential) -> Result<(), AccessError> {
        self.post(&[
            ("uid", credential.name.as_str()),
            ("password", credential.secret.as_str()),
            ("range", "4"),
            ("operation", "disconnectall"),
            ("timeout", "1"),
        ])
        .await?;
        Ok(())
    }
}
