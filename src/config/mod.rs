//! Node storage configuration
//!
//! The configuration record is both input and output: callers load it, run a
//! reconciler, merge the returned [`StorageDiscovery`] and write it back out.
//!
//! - [`credentials`]: array endpoint, protocol and transport settings
//! - [`node`]: the record itself
//! - [`discovery`]: observed state returned by reconcilers
//! - [`defaults`]: naming conventions and defaults applied after loading

pub mod credentials;
pub mod defaults;
pub mod discovery;
pub mod node;

pub use credentials::{ApiMethod, ArrayCredentials};
pub use defaults::{apply_defaults, base_name, prefix_len, NodeOverrides, Profile};
pub use discovery::StorageDiscovery;
pub use node::{
    BootLunSpec, ComputeConfig, IscsiInitiator, IscsiTarget, LunSpec, NetworkConfig,
    NetworkInterface, NodeStorageConfig, NvmeHost, NvmeNamespaceSpec, NvmeTarget, RemoteFile,
    SeedLunSpec, StorageConfig,
};

use crate::error::{Error, Result};
use std::io::Read;
use tracing::debug;

/// Argument value that reads the record from standard input
pub const STDIN_ARG: &str = "STDIN";

/// Output encoding of the record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(OutputFormat::Yaml),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::Configuration(format!("unknown output format \"{}\"", other))),
        }
    }
}

/// Parse a record from text; JSON when it starts with `{`, YAML otherwise
pub fn parse_node_config(content: &str) -> Result<NodeStorageConfig> {
    if content.trim_start().starts_with('{') {
        Ok(serde_json::from_str(content)?)
    } else {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// Load a record from inline JSON, [`STDIN_ARG`] or a file path
pub fn load_node_config(arg: &str) -> Result<NodeStorageConfig> {
    let content = if arg.trim_start().starts_with('{') {
        debug!("Reading node config from argument");
        arg.to_string()
    } else if arg == STDIN_ARG {
        debug!("Reading node config from standard input");
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        debug!("Reading node config from {}", arg);
        std::fs::read_to_string(arg).map_err(|e| {
            Error::Configuration(format!("failed to read config file {}: {}", arg, e))
        })?
    };
    parse_node_config(&content)
}

/// Serialize a record in the requested format
pub fn render_node_config(cfg: &NodeStorageConfig, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Yaml => cfg.to_yaml(),
        OutputFormat::Json => cfg.to_json(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_load_inline_json() {
        let cfg = load_node_config(r#"{"compute":{"hostName":"node-1"}}"#).unwrap();
        assert_eq!(cfg.compute.host_name, "node-1");
    }

    #[test]
    fn test_load_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "compute:\n  hostName: node-2\nstorage:\n  svmName: svm1").unwrap();

        let cfg = load_node_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.compute.host_name, "node-2");
        assert_eq!(cfg.storage.svm_name, "svm1");
    }

    #[test]
    fn test_load_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"storage":{{"volumeName":"v1"}}}}"#).unwrap();

        let cfg = load_node_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.storage.volume_name, "v1");
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = load_node_config("/nonexistent/node.yaml");
        assert_matches!(err, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_render_output_formats() {
        let mut cfg = NodeStorageConfig::default();
        cfg.compute.host_name = "node-1".into();

        let json = render_node_config(&cfg, OutputFormat::Json).unwrap();
        assert_eq!(parse_node_config(&json).unwrap(), cfg);

        let yaml = render_node_config(&cfg, OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("hostName: node-1"));
    }
}
