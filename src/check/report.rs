//! 报告结构：静态配置（Report/Section）与运行输出（ReportResult）

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::check::container::{ContainerLogsCheck, ContainerResourcesCheck, ContainerStateCheck};
use crate::check::engine::{
    DaemonConfigCheck, DaemonLogsCheck, EngineRuntimeCheck, EngineVersionCheck, EventsCheck,
};
use crate::check::etcd::EtcdPerfCheck;
use crate::check::host::{
    CgroupCheck, CpuCheck, DiskCheck, HostOsCheck, MemoryCheck, PrivilegeCheck, SecurityCheck,
    TimeSyncCheck,
};
use crate::check::provider::ContainerProvider;
use crate::check::redact::Redact;
use crate::check::result::CheckResult;
use crate::check::Check;
use crate::config::Config;

// ── 静态配置 ────────────────────────────────────────────────────────────────

/// Fixed battery of checks, built once before a run.
pub struct Report {
    pub id: String,
    pub sections: Vec<Section>,
}

pub struct Section {
    pub title: String,
    pub checks: Vec<Box<dyn Check>>,
}

impl Section {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), checks: Vec::new() }
    }

    pub fn with(mut self, check: impl Check + 'static) -> Self {
        self.checks.push(Box::new(check));
        self
    }
}

impl Report {
    pub fn check_count(&self) -> usize {
        self.sections.iter().map(|s| s.checks.len()).sum()
    }
}

// ── 运行输出 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportResult {
    pub version: String,
    pub sections: Vec<ResultSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSection {
    pub title: String,
    pub results: Vec<CheckResult>,
}

// ── 组装 ────────────────────────────────────────────────────────────────────

/// Collaborators shared by the checks of one report.
pub struct Deps {
    /// Runs the `docker` CLI and host tools.
    pub host: Arc<dyn ContainerProvider>,
    /// Runs commands inside the target container.
    pub container: Arc<dyn ContainerProvider>,
    pub redactor: Arc<dyn Redact>,
}

pub fn report_id(hostname: &str, now: chrono::DateTime<chrono::Local>) -> String {
    let host: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    let host = if host.is_empty() { "unknown".to_string() } else { host };
    format!("sediag-{}-{}", host, now.format("%Y%m%d-%H%M%S"))
}

pub fn build_report(id: String, deps: &Deps, config: &Config) -> Report {
    let t = &config.thresholds;

    let host = Section::new("Host")
        .with(HostOsCheck)
        .with(CpuCheck::new(t.load_per_core_warn))
        .with(MemoryCheck::new(t.memory_warn_percent))
        .with(DiskCheck::new(deps.host.clone(), t.disk_warn_percent, t.inode_warn_percent))
        .with(CgroupCheck)
        .with(SecurityCheck::new(deps.host.clone()))
        .with(TimeSyncCheck::new(deps.host.clone()))
        .with(PrivilegeCheck);

    let engine = Section::new("Docker Engine")
        .with(EngineVersionCheck::new(deps.host.clone()))
        .with(EngineRuntimeCheck::new(deps.host.clone()))
        .with(DaemonConfigCheck::new(deps.redactor.clone()))
        .with(DaemonLogsCheck::new(deps.host.clone(), deps.redactor.clone()))
        .with(EventsCheck::new(deps.host.clone()));

    let container = Section::new("Container")
        .with(ContainerStateCheck::new(deps.host.clone(), deps.redactor.clone()))
        .with(ContainerResourcesCheck::new(deps.host.clone(), t.memory_warn_percent))
        .with(ContainerLogsCheck::new(deps.host.clone(), deps.redactor.clone()));

    let mut sections = vec![host, engine, container];

    if config.etcd_perf.enabled {
        sections.push(
            Section::new("Performance")
                .with(EtcdPerfCheck::new(deps.container.clone(), config.etcd_perf.clone())),
        );
    }

    Report { id, sections }
}
