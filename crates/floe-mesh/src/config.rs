//! Mesh configuration

use serde::{Deserialize, Serialize};

/// Configuration for a [`ChannelDistributer`](crate::ChannelDistributer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Namespace root for all coordination nodes
    #[serde(default = "default_root")]
    pub root: String,

    /// Delay between assignment write retries when a version-conditioned
    /// write loses a race, in milliseconds
    #[serde(default = "default_assign_retry_delay_ms")]
    pub assign_retry_delay_ms: u64,
}

fn default_root() -> String {
    "/import".to_string()
}

fn default_assign_retry_delay_ms() -> u64 {
    10
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            assign_retry_delay_ms: default_assign_retry_delay_ms(),
        }
    }
}

impl MeshConfig {
    pub fn paths(&self) -> MeshPaths {
        MeshPaths::new(&self.root)
    }
}

/// Derived node paths under the namespace root
///
/// ```text
/// <root>                      root
/// <root>/host                 parent of ephemeral per-host nodes
/// <root>/host/<hostId>        a host's assigned channel list (JSON array)
/// <root>/master               election dir + master channel list
/// <root>/master/candidate_#   ephemeral+sequential election candidates
/// <root>/mode                 cluster operation mode
/// ```
#[derive(Debug, Clone)]
pub struct MeshPaths {
    pub root: String,
    pub host_dn: String,
    pub master_dn: String,
    pub candidate_prefix: String,
    pub mode_path: String,
}

impl MeshPaths {
    pub fn new(root: &str) -> Self {
        let root = root.trim_end_matches('/').to_string();
        Self {
            host_dn: format!("{root}/host"),
            master_dn: format!("{root}/master"),
            candidate_prefix: format!("{root}/master/candidate_"),
            mode_path: format!("{root}/mode"),
            root,
        }
    }

    pub fn host_path(&self, host_id: &str) -> String {
        format!("{}/{}", self.host_dn, host_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let paths = MeshConfig::default().paths();
        assert_eq!(paths.root, "/import");
        assert_eq!(paths.host_dn, "/import/host");
        assert_eq!(paths.master_dn, "/import/master");
        assert_eq!(paths.candidate_prefix, "/import/master/candidate_");
        assert_eq!(paths.host_path("h1"), "/import/host/h1");
    }

    #[test]
    fn test_custom_root_trailing_slash() {
        let paths = MeshPaths::new("/floe/import/");
        assert_eq!(paths.master_dn, "/floe/import/master");
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: MeshConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.root, "/import");
        assert_eq!(config.assign_retry_delay_ms, 10);
    }
}
