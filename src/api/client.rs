// HTTP client creation with custom user-agent and bearer token support
use crate::error::{Error, Result};
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT as USER_AGENT_HEADER};
use tracing::warn;

use super::USER_AGENT;

/// Connection settings for the syndesis REST API
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// API root, e.g. `https://syndesis.example.com/api/v1/`
    pub base_url: Url,
    pub token: Option<String>,
    pub user_agent: Option<String>,
}

impl ApiConfig {
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute URL
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base(base_url)?,
            token: None,
            user_agent: None,
        })
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// User agent from config, then `SYNDESIS_USER_AGENT`, then the crate default
    #[must_use]
    pub fn effective_user_agent(&self) -> String {
        self.user_agent
            .clone()
            .or_else(|| std::env::var("SYNDESIS_USER_AGENT").ok())
            .unwrap_or_else(|| USER_AGENT.to_string())
    }
}

/// Parse a base URL and make sure relative joins append to its path
///
/// # Errors
///
/// Returns an error if the URL cannot be parsed
pub fn normalize_base(base_url: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).map_err(|e| Error::Custom(format!("invalid base url {base_url}: {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Create a new HTTP client to talk to the syndesis API
///
/// # Errors
///
/// Will return `Err` if the token is not a valid header value or the
/// client cannot be built
pub fn new(config: &ApiConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    // Invalid user agents fall back to the reqwest default
    let user_agent = config.effective_user_agent();
    match HeaderValue::from_str(&user_agent) {
        Ok(value) => {
            headers.insert(USER_AGENT_HEADER, value);
        }
        Err(e) => warn!("Ignoring invalid user agent {user_agent:?}: {e}"),
    }

    if let Some(token) = &config.token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    Ok(reqwest::Client::builder().default_headers(headers).build()?)
}
