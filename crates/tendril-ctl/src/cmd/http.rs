//! Client for the tendrild status API.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;

pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

impl ApiClient {
    /// The API only listens on loopback.
    pub fn local(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!("http://127.0.0.1:{port}/api"),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.read(self.http.get(self.endpoint(path))).await
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.read(self.http.post(self.endpoint(path))).await
    }

    async fn read<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let resp = request
            .send()
            .await
            .with_context(|| format!("tendrild not reachable at {}; is the daemon up?", self.base))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("tendrild answered {status}");
        }
        resp.json::<T>()
            .await
            .context("unexpected response from tendrild")
    }
}
