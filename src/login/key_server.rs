//! HTTP client for the remote key-lookup service

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::resolver::KeyServer;
use crate::config::{KeyServerConfig, validate_key_server_url};
use crate::error::KeyServerError;

const RETRIEVE_PATH: &str = "key_server/retrieve_public_keys";

#[derive(Debug, Serialize)]
struct RetrieveRequest<'a> {
    agent_identity: &'a str,
    public_key_fingerprints: &'a [String],
}

/// Response body: fingerprint to key, `null` for fingerprints the server does not know
#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct RetrieveResponse(HashMap<String, Option<String>>);

/// [`KeyServer`] speaking JSON over HTTPS
pub struct HttpKeyServer {
    http: reqwest::Client,
    endpoint: url::Url,
    access_token: Option<String>,
}

impl HttpKeyServer {
    pub fn new(config: &KeyServerConfig) -> Result<Self> {
        let mut base = validate_key_server_url(&config.url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let endpoint = base
            .join(RETRIEVE_PATH)
            .context("Failed to build key server endpoint")?;

        let http = reqwest::Client::builder()
            .user_agent(format!("managed-login/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs.min(10)))
            .https_only(endpoint.scheme() == "https")
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            endpoint,
            access_token: config.access_token.clone(),
        })
    }

    pub fn endpoint(&self) -> &url::Url {
        &self.endpoint
    }
}

#[async_trait]
impl KeyServer for HttpKeyServer {
    async fn retrieve_public_keys(
        &self,
        identity: &str,
        fingerprints: &[String],
    ) -> Result<HashMap<String, String>, KeyServerError> {
        let body = RetrieveRequest {
            agent_identity: identity,
            public_key_fingerprints: fingerprints,
        };

        debug!("POST {} ({} fingerprints)", self.endpoint, fingerprints.len());

        let mut request = self.http.post(self.endpoint.clone()).json(&body);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(KeyServerError::Status {
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        let RetrieveResponse(keys) =
            serde_json::from_slice(&bytes).map_err(|e| KeyServerError::Decode(e.to_string()))?;

        Ok(keys
            .into_iter()
            .filter_map(|(fp, key)| key.filter(|k| !k.trim().is_empty()).map(|k| (fp, k)))
            .collect())
    }
}
