//! 配置：内置默认值 + 可选 JSON 文件覆盖

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::{DiagError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub etcd_perf: EtcdPerfConfig,
    pub thresholds: Thresholds,
    pub redact: RedactConfig,
}

/// Settings of the orchestrated etcd performance probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtcdPerfConfig {
    pub enabled: bool,
    pub etcd_binary: String,
    pub etcdctl_binary: String,
    /// Wiped and recreated before every probe.
    pub scratch_dir: String,
    pub client_port: u16,
    /// `etcdctl check perf --load` profile: s, m, l or xl.
    pub load: String,
    /// Prepare the scratch dir and start etcd as this user instead of the
    /// container's default user.
    pub run_as_user: Option<String>,
    pub poll_interval_ms: u64,
    pub ready_timeout_ms: u64,
    /// Services whose presence makes the probe unsafe to run.
    pub conflicting_services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub memory_warn_percent: f64,
    pub disk_warn_percent: f64,
    pub inode_warn_percent: f64,
    pub load_per_core_warn: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactConfig {
    pub extra_patterns: Vec<String>,
}

impl Default for EtcdPerfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            etcd_binary: "etcd".to_string(),
            etcdctl_binary: "etcdctl".to_string(),
            scratch_dir: "/tmp/sediag-etcd-perf".to_string(),
            client_port: 23790,
            load: "s".to_string(),
            run_as_user: None,
            poll_interval_ms: 1000,
            ready_timeout_ms: 60_000,
            conflicting_services: vec!["kube-apiserver".to_string(), "kubelet".to_string()],
        }
    }
}

impl EtcdPerfConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn client_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.client_port)
    }

    pub fn peer_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.client_port.saturating_add(1))
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            memory_warn_percent: 90.0,
            disk_warn_percent: 85.0,
            inode_warn_percent: 85.0,
            load_per_core_warn: 2.0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DiagError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
            .map_err(|e| DiagError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)
            .map_err(|e| DiagError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let p = &self.etcd_perf;
        if p.poll_interval_ms == 0 {
            return Err(DiagError::Config("etcd_perf.poll_interval_ms must be > 0".to_string()));
        }
        if p.ready_timeout_ms < p.poll_interval_ms {
            return Err(DiagError::Config(
                "etcd_perf.ready_timeout_ms must not be shorter than the poll interval".to_string(),
            ));
        }
        if !matches!(p.load.as_str(), "s" | "m" | "l" | "xl") {
            return Err(DiagError::Config(format!("etcd_perf.load: unknown profile {:?}", p.load)));
        }
        Ok(())
    }
}
