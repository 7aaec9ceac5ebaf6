//! Storage Backend Adapters
//!
//! Provides the two wire-protocol adapters behind [`StorageBackend`]:
//! - REST: JSON over HTTPS
//! - ZAPI: XML over HTTPS (legacy)
//!
//! plus an in-memory array for tests. Each adapter owns one session and one
//! resolved vserver scope; error-code translation lives in [`outcome`].

pub mod memory;
pub mod outcome;
pub mod rest;
pub mod rest_session;
pub mod zapi;
pub mod zapi_session;

pub use memory::{LifProtocol, MemoryBackend, MemoryLun};
pub use outcome::{absent_ok, rest_outcome, zapi_outcome};
pub use rest::RestBackend;
pub use rest_session::{HttpRestSession, RestSession};
pub use zapi::ZapiBackend;
pub use zapi_session::{HttpZapiSession, ZapiSession};

use crate::config::{ApiMethod, ArrayCredentials};
use crate::domain::ports::StorageBackendRef;
use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

/// Factory for connecting storage backend adapters
pub struct BackendFactory;

impl BackendFactory {
    /// Open a session for the configured protocol and resolve the vserver scope
    pub async fn connect(
        credentials: &ArrayCredentials,
        svm_hint: Option<&str>,
    ) -> Result<StorageBackendRef> {
        if credentials.host.is_empty() {
            return Err(Error::Configuration(
                "cdotCredentials.host is required".to_string(),
            ));
        }
        info!(
            "Connecting to {} via {:?} (vserver hint {:?})",
            credentials.host, credentials.api_method, svm_hint
        );
        match credentials.api_method {
            ApiMethod::Rest => {
                let session = Arc::new(HttpRestSession::new(credentials)?);
                Ok(Arc::new(RestBackend::connect(session, svm_hint).await?))
            }
            ApiMethod::Zapi => {
                let session = Arc::new(HttpZapiSession::new(credentials)?);
                Ok(Arc::new(ZapiBackend::connect(session, svm_hint).await?))
            }
        }
    }
}

/// Pick the vserver scope among the visible candidates
///
/// A hint must name one of the candidates; without a hint exactly one
/// candidate must be visible.
pub fn resolve_scope(hint: Option<&str>, candidates: &[String]) -> Result<String> {
    match hint.filter(|h| !h.is_empty()) {
        Some(hint) => candidates
            .iter()
            .find(|c| c.as_str() == hint)
            .cloned()
            .ok_or_else(|| Error::not_found("vserver", hint)),
        None => match candidates {
            [] => Err(Error::not_found("vserver", "<any>")),
            [only] => Ok(only.clone()),
            many => Err(Error::AmbiguousScope {
                candidates: many.len(),
            }),
        },
    }
}

/// Keep the addresses that fall inside `subnet` (CIDR notation)
pub fn filter_subnet(addresses: Vec<String>, subnet: &str) -> Result<Vec<String>> {
    let network: IpNetwork = subnet
        .parse()
        .map_err(|e| Error::Configuration(format!("invalid subnet {}: {}", subnet, e)))?;
    Ok(addresses
        .into_iter()
        .filter(|a| {
            a.parse::<IpAddr>()
                .map(|ip| network.contains(ip))
                .unwrap_or(false)
        })
        .collect())
}
