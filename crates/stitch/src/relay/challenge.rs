//! Anti-automation challenge tokens
//!
//! Some models only accept a conversation whose first request carries a
//! challenge token. The token is fetched once per chain; continuations reuse
//! it.

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

use crate::config::ChallengeConfig;
use crate::proxy::ProxyError;

const CAPI_VERSION: &str = "1.5.2";
const CAPI_MODE: &str = "lightbox";
const STYLE_THEME: &str = "default";

/// Supplies challenge tokens for models that need one
#[async_trait]
pub trait ChallengeTokenSource: Send + Sync {
    async fn fetch(&self, model: &str) -> Result<String, ProxyError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Fetches tokens from an Arkose-style token endpoint
pub struct ArkoseTokenClient {
    client: reqwest::Client,
    config: ChallengeConfig,
    user_agent: String,
}

impl ArkoseTokenClient {
    pub fn new(client: reqwest::Client, config: ChallengeConfig, user_agent: String) -> Self {
        Self {
            client,
            config,
            user_agent,
        }
    }
}

#[async_trait]
impl ChallengeTokenSource for ArkoseTokenClient {
    async fn fetch(&self, model: &str) -> Result<String, ProxyError> {
        tracing::debug!(model, "Fetching challenge token");

        let rnd = random_fraction();
        let form = [
            ("public_key", self.config.public_key.as_str()),
            ("site", self.config.site.as_str()),
            ("userbrowser", self.user_agent.as_str()),
            ("capi_version", CAPI_VERSION),
            ("capi_mode", CAPI_MODE),
            ("style_theme", STYLE_THEME),
            ("rnd", rnd.as_str()),
        ];

        let response = self
            .client
            .post(&self.config.url)
            .form(&form[..])
            .send()
            .await
            .map_err(|e| ProxyError::Challenge(format!("Token request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ProxyError::Challenge(format!(
                "Token endpoint returned {}",
                response.status()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::Challenge(format!("Invalid token response: {e}")))?;

        body.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ProxyError::Challenge("Token response carried no token".to_string()))
    }
}

/// A value in [0, 1) rendered with 17 decimals
fn random_fraction() -> String {
    let bits = Uuid::new_v4().as_u128() >> 75;
    let fraction = bits as f64 / (1u64 << 53) as f64;
    format!("{fraction:.17}")
}
