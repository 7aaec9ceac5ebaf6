//! Array connection credentials

use serde::{Deserialize, Serialize};

/// Default ZAPI version negotiated with the array
pub const DEFAULT_ZAPI_VERSION: &str = "1.160";

/// Per-call transport timeout for the REST protocol
pub const DEFAULT_REST_TIMEOUT_SECS: u64 = 60;

/// Per-call transport timeout for the ZAPI protocol
pub const DEFAULT_ZAPI_TIMEOUT_SECS: u64 = 300;

/// Wire protocol used to reach the array control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiMethod {
    Rest,
    #[default]
    Zapi,
}

impl std::fmt::Display for ApiMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiMethod::Rest => write!(f, "rest"),
            ApiMethod::Zapi => write!(f, "zapi"),
        }
    }
}

impl std::str::FromStr for ApiMethod {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rest" => Ok(ApiMethod::Rest),
            "zapi" => Ok(ApiMethod::Zapi),
            other => Err(crate::error::Error::Configuration(format!(
                "API method \"{}\" is not implemented",
                other
            ))),
        }
    }
}

/// Credentials and transport settings for the array management endpoint
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArrayCredentials {
    /// Management host name or address (cluster or vserver LIF)
    pub host: String,
    pub user: String,
    pub password: String,
    pub api_method: ApiMethod,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub zapi_version: String,
    /// Verify the array's TLS certificate
    pub verify_tls: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl ArrayCredentials {
    /// Effective per-call timeout for the selected protocol
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs.unwrap_or(match self.api_method {
            ApiMethod::Rest => DEFAULT_REST_TIMEOUT_SECS,
            ApiMethod::Zapi => DEFAULT_ZAPI_TIMEOUT_SECS,
        })
    }

    /// Effective ZAPI version
    pub fn zapi_version(&self) -> &str {
        if self.zapi_version.is_empty() {
            DEFAULT_ZAPI_VERSION
        } else {
            &self.zapi_version
        }
    }

    /// Base URL of the management endpoint
    pub fn base_url(&self) -> String {
        if self.host.starts_with("http://") || self.host.starts_with("https://") {
            self.host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.host)
        }
    }
}

impl std::fmt::Debug for ArrayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayCredentials")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("api_method", &self.api_method)
            .field("zapi_version", &self.zapi_version())
            .field("verify_tls", &self.verify_tls)
            .field("timeout_secs", &self.timeout_secs())
            .finish()
    }
}
