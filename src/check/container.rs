//! 目标容器检查
//! 来源：docker inspect / docker stats / docker logs

use std::sync::Arc;

use crate::check::engine::{docker, save, DOCKER};
use crate::check::context::RunContext;
use crate::check::provider::ContainerProvider;
use crate::check::redact::Redact;
use crate::check::result::CheckResult;
use crate::check::{capability_gate, error_result, not_applicable, Check};
use crate::utils::format::{fmt_bytes, parse_pct, parse_size_to_bytes};
use crate::utils::{DiagError, Result};

const LOG_TAIL_LINES: &str = "500";

// ── 数据结构 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerState {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub started_at: String,
    pub finished_at: String,
    pub restart_policy: String,
    pub restart_count: i64,
    pub privileged: bool,
    pub ports: Vec<PortMapping>,
    pub mounts: Vec<MountInfo>,
    pub memory_limit: u64,
    pub cpu_quota: i64,
    pub cpu_period: u64,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortMapping {
    pub host_ip: String,
    pub host_port: String,
    pub container_port: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountInfo {
    pub mount_type: String,
    pub source: String,
    pub destination: String,
    pub rw: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub net_rx: u64,
    pub net_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
    pub pids: u64,
}

/// Target of the container section, or the early return when there is none.
fn target_or_stop<'c>(
    ctx: &'c RunContext<'_>,
    check: &dyn Check,
) -> std::result::Result<&'c str, Vec<CheckResult>> {
    if let Some(stop) = capability_gate(ctx, check, DOCKER) {
        return Err(stop);
    }
    ctx.target().ok_or_else(|| not_applicable(ctx, check, "no target container"))
}

// ── docker inspect ──────────────────────────────────────────────────────────

pub struct ContainerStateCheck {
    host: Arc<dyn ContainerProvider>,
    redactor: Arc<dyn Redact>,
}

impl ContainerStateCheck {
    pub fn new(host: Arc<dyn ContainerProvider>, redactor: Arc<dyn Redact>) -> Self {
        Self { host, redactor }
    }

    fn judge(&self, c: &ContainerState) -> Vec<CheckResult> {
        let mut results = vec![
            CheckResult::info("Container", format!("{} ({})", c.name, c.id)),
            CheckResult::info("Image", c.image.clone()),
        ];

        if c.status == "running" {
            results.push(
                CheckResult::pass("State", "running").with_message(format!("since {}", c.started_at)),
            );
        } else {
            results.push(CheckResult::fail(
                "State",
                c.status.clone(),
                format!("exit code {}, finished at {}", c.exit_code, c.finished_at),
            ));
        }

        if c.oom_killed {
            results.push(CheckResult::fail("OOM killed", "yes", "last exit was caused by the OOM killer"));
        }

        let policy = if c.restart_policy.is_empty() { "no" } else { c.restart_policy.as_str() };
        if c.restart_count > 0 {
            results.push(CheckResult::warn(
                "Restarts",
                c.restart_count.to_string(),
                format!("restart policy: {}", policy),
            ));
        } else {
            results.push(CheckResult::pass("Restarts", "0").with_message(format!("restart policy: {}", policy)));
        }

        if c.privileged {
            results.push(CheckResult::warn("Privileged", "yes", "container runs with all capabilities"));
        }

        let memory = if c.memory_limit == 0 { "unlimited".to_string() } else { fmt_bytes(c.memory_limit) };
        let cpus = if c.cpu_quota > 0 && c.cpu_period > 0 {
            format!("{:.2}", c.cpu_quota as f64 / c.cpu_period as f64)
        } else {
            "unlimited".to_string()
        };
        let pids = if c.pids_limit > 0 { c.pids_limit.to_string() } else { "unlimited".to_string() };
        results.push(CheckResult::info("Limits", format!("memory {}  cpus {}  pids {}", memory, cpus, pids)));

        if !c.ports.is_empty() {
            let ports = c.ports.iter()
                .map(|p| format!("{}:{}->{}/{}", p.host_ip, p.host_port, p.container_port, p.protocol))
                .collect::<Vec<_>>()
                .join(", ");
            results.push(CheckResult::info("Ports", ports));
        }

        for m in &c.mounts {
            let mode = if m.rw { "rw" } else { "ro" };
            results.push(CheckResult::info(
                "Mount",
                format!("{} -> {} ({}, {})", m.source, m.destination, m.mount_type, mode),
            ));
        }
        results
    }
}

impl Check for ContainerStateCheck {
    fn describe(&self) -> String {
        "Container state".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let target = match target_or_stop(ctx, self) {
            Ok(t) => t.to_string(),
            Err(stop) => return stop,
        };

        let out = match docker(self.host.as_ref(), &["inspect", target.as_str()]) {
            Ok(o) => o,
            Err(e) => return vec![error_result(self, e.to_string())],
        };
        // inspect 含环境变量，保存前脱敏
        save(ctx, "container_inspect.json", self.redactor.redact(&out.stdout_str()).as_bytes());

        match parse_inspect(&out.stdout) {
            Ok(state) => self.judge(&state),
            Err(e) => vec![error_result(self, e.to_string())],
        }
    }
}

pub fn parse_inspect(raw: &[u8]) -> Result<ContainerState> {
    let arr: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| DiagError::Parse(format!("inspect JSON: {}", e)))?;
    let c = arr.as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| DiagError::Parse("empty inspect result".to_string()))?;

    let hc = &c["HostConfig"];
    Ok(ContainerState {
        id:             c["Id"].as_str().unwrap_or("").chars().take(12).collect(),
        name:           c["Name"].as_str().unwrap_or("").trim_start_matches('/').to_string(),
        image:          str_at(c, &["Config", "Image"]),
        status:         str_at(c, &["State", "Status"]),
        exit_code:      c["State"]["ExitCode"].as_i64().unwrap_or(0),
        oom_killed:     c["State"]["OOMKilled"].as_bool().unwrap_or(false),
        started_at:     str_at(c, &["State", "StartedAt"]),
        finished_at:    str_at(c, &["State", "FinishedAt"]),
        restart_policy: str_at(c, &["HostConfig", "RestartPolicy", "Name"]),
        restart_count:  c["RestartCount"].as_i64().unwrap_or(0),
        privileged:     hc["Privileged"].as_bool().unwrap_or(false),
        ports:          parse_ports(c),
        mounts:         parse_mounts(c),
        memory_limit:   hc["Memory"].as_u64().unwrap_or(0),
        cpu_quota:      hc["CpuQuota"].as_i64().unwrap_or(0),
        cpu_period:     hc["CpuPeriod"].as_u64().unwrap_or(0),
        pids_limit:     hc["PidsLimit"].as_i64().unwrap_or(0),
    })
}

fn parse_ports(c: &serde_json::Value) -> Vec<PortMapping> {
    let mut ports = Vec::new();
    if let Some(bindings) = c["HostConfig"]["PortBindings"].as_object() {
        for (container_port, bindings_arr) in bindings {
            let (cport, proto) = container_port
                .split_once('/')
                .map(|(p, r)| (p.to_string(), r.to_string()))
                .unwrap_or_else(|| (container_port.clone(), "tcp".to_string()));

            for b in bindings_arr.as_array().into_iter().flatten() {
                let host_ip = b["HostIp"].as_str().filter(|s| !s.is_empty()).unwrap_or("0.0.0.0");
                ports.push(PortMapping {
                    host_ip:        host_ip.to_string(),
                    host_port:      b["HostPort"].as_str().unwrap_or("").to_string(),
                    container_port: cport.clone(),
                    protocol:       proto.clone(),
                });
            }
        }
    }
    ports
}

fn parse_mounts(c: &serde_json::Value) -> Vec<MountInfo> {
    c["Mounts"].as_array()
        .map(|arr| arr.iter().map(|m| MountInfo {
            mount_type:  m["Type"].as_str().unwrap_or("").to_string(),
            source:      m["Source"].as_str().unwrap_or("").to_string(),
            destination: m["Destination"].as_str().unwrap_or("").to_string(),
            rw:          m["RW"].as_bool().unwrap_or(false),
        }).collect())
        .unwrap_or_default()
}

// ── docker stats ─────────────────────────────────────────────────────────────

pub struct ContainerResourcesCheck {
    host: Arc<dyn ContainerProvider>,
    memory_warn_percent: f64,
}

impl ContainerResourcesCheck {
    pub fn new(host: Arc<dyn ContainerProvider>, memory_warn_percent: f64) -> Self {
        Self { host, memory_warn_percent }
    }

    fn judge(&self, u: &ResourceUsage) -> Vec<CheckResult> {
        let memory_value = format!(
            "{} / {} ({:.1}%)",
            fmt_bytes(u.memory_usage),
            fmt_bytes(u.memory_limit),
            u.memory_percent
        );
        let memory = if u.memory_percent >= self.memory_warn_percent {
            CheckResult::warn(
                "Memory",
                memory_value,
                format!("above {:.0}% of the limit", self.memory_warn_percent),
            )
        } else {
            CheckResult::pass("Memory", memory_value)
        };

        vec![
            CheckResult::info("CPU", format!("{:.2}%", u.cpu_percent)),
            memory,
            CheckResult::info("Network I/O", format!("rx {}  tx {}", fmt_bytes(u.net_rx), fmt_bytes(u.net_tx))),
            CheckResult::info(
                "Block I/O",
                format!("read {}  write {}", fmt_bytes(u.block_read), fmt_bytes(u.block_write)),
            ),
            CheckResult::info("PIDs", u.pids.to_string()),
        ]
    }
}

impl Check for ContainerResourcesCheck {
    fn describe(&self) -> String {
        "Container resources".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let target = match target_or_stop(ctx, self) {
            Ok(t) => t.to_string(),
            Err(stop) => return stop,
        };

        let out = match docker(self.host.as_ref(), &[
            "stats", "--no-stream",
            "--format", "{{json .}}",
            target.as_str(),
        ]) {
            Ok(o) => o,
            Err(e) => return vec![error_result(self, e.to_string())],
        };

        match parse_stats(&out.stdout) {
            Ok(usage) => self.judge(&usage),
            Err(e) => vec![error_result(self, e.to_string())],
        }
    }
}

pub fn parse_stats(raw: &[u8]) -> Result<ResourceUsage> {
    let j: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| DiagError::Parse(format!("stats JSON: {}", e)))?;

    // docker stats json 格式：字段值为字符串，如 "1.5GiB / 3.8GiB"
    let (memory_usage, memory_limit) = parse_stat_pair(j["MemUsage"].as_str().unwrap_or(""));
    let (net_rx, net_tx) = parse_stat_pair(j["NetIO"].as_str().unwrap_or(""));
    let (block_read, block_write) = parse_stat_pair(j["BlockIO"].as_str().unwrap_or(""));

    Ok(ResourceUsage {
        cpu_percent: parse_pct(j["CPUPerc"].as_str().unwrap_or("")),
        memory_usage,
        memory_limit,
        memory_percent: parse_pct(j["MemPerc"].as_str().unwrap_or("")),
        net_rx,
        net_tx,
        block_read,
        block_write,
        pids: j["PIDs"].as_str().and_then(|s| s.trim().parse().ok()).unwrap_or(0),
    })
}

/// 解析 "1.5MB / 2.3MB" → (left_bytes, right_bytes)
fn parse_stat_pair(s: &str) -> (u64, u64) {
    let mut parts = s.split('/');
    let a = parts.next().map(parse_size_to_bytes).unwrap_or(0);
    let b = parts.next().map(parse_size_to_bytes).unwrap_or(0);
    (a, b)
}

// ── docker logs ─────────────────────────────────────────────────────────────

pub struct ContainerLogsCheck {
    host: Arc<dyn ContainerProvider>,
    redactor: Arc<dyn Redact>,
}

impl ContainerLogsCheck {
    pub fn new(host: Arc<dyn ContainerProvider>, redactor: Arc<dyn Redact>) -> Self {
        Self { host, redactor }
    }
}

impl Check for ContainerLogsCheck {
    fn describe(&self) -> String {
        "Container logs".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let target = match target_or_stop(ctx, self) {
            Ok(t) => t.to_string(),
            Err(stop) => return stop,
        };

        let out = match docker(self.host.as_ref(), &[
            "logs", "--tail", LOG_TAIL_LINES, "--timestamps", target.as_str(),
        ]) {
            Ok(o) => o,
            Err(e) => return vec![error_result(self, e.to_string())],
        };

        // docker logs 把容器 stderr 写到 stderr
        let combined = [out.stdout.as_slice(), out.stderr.as_slice()].concat();
        let text = String::from_utf8_lossy(&combined);
        save(ctx, "container.log", self.redactor.redact(&text).as_bytes());
        Vec::new()
    }
}

// ── 工具 ────────────────────────────────────────────────────────────────────

fn str_at(c: &serde_json::Value, path: &[&str]) -> String {
    let mut cur = c;
    for key in path {
        cur = &cur[key];
    }
    cur.as_str().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::context::Availability;
    use crate::check::provider::fake::{exit, ok, ScriptedProvider};
    use crate::check::redact::PatternRedactor;
    use crate::check::result::Status;
    use crate::check::store::ArtifactStore;
    use std::io::Read;
    use tempfile::tempdir;

    const INSPECT: &str = r#"[{
        "Id": "4f1c2d3e4f5a6b7c8d9e",
        "Name": "/web",
        "RestartCount": 3,
        "Config": { "Image": "nginx:1.25", "Env": ["API_TOKEN=s3cr3t"] },
        "State": { "Status": "exited", "ExitCode": 137, "OOMKilled": true,
                   "StartedAt": "2026-10-01T10:00:00Z", "FinishedAt": "2026-10-01T11:00:00Z" },
        "HostConfig": {
            "Privileged": true,
            "RestartPolicy": { "Name": "always" },
            "Memory": 536870912, "CpuQuota": 50000, "CpuPeriod": 100000, "PidsLimit": 0,
            "PortBindings": { "80/tcp": [ { "HostIp": "", "HostPort": "8080" } ] }
        },
        "Mounts": [ { "Type": "bind", "Source": "/srv/www", "Destination": "/usr/share/nginx/html", "RW": false } ]
    }]"#;

    const STATS: &str = r#"{"CPUPerc":"12.50%","MemUsage":"460MiB / 512MiB","MemPerc":"89.84%",
        "NetIO":"1.5kB / 2kB","BlockIO":"0B / 4MB","PIDs":"7"}"#;

    fn redactor() -> Arc<dyn Redact> {
        Arc::new(PatternRedactor::new(&[]).unwrap())
    }

    fn store() -> (tempfile::TempDir, ArtifactStore) {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("raw")).unwrap();
        (dir, store)
    }

    #[test]
    fn inspect_is_parsed() {
        let c = parse_inspect(INSPECT.as_bytes()).unwrap();
        assert_eq!(c.id, "4f1c2d3e4f5a");
        assert_eq!(c.name, "web");
        assert_eq!(c.exit_code, 137);
        assert!(c.oom_killed);
        assert_eq!(c.ports, vec![PortMapping {
            host_ip: "0.0.0.0".into(),
            host_port: "8080".into(),
            container_port: "80".into(),
            protocol: "tcp".into(),
        }]);
        assert_eq!(c.mounts.len(), 1);
        assert!(parse_inspect(b"[]").is_err());
    }

    #[test]
    fn state_check_flags_problems() {
        let host = Arc::new(ScriptedProvider::new("host").on(&["docker", "inspect"], ok(INSPECT)));
        let (_dir, store) = store();
        let mut ctx = RunContext::new(&store, Some("web".into()), None, false);

        let results = ContainerStateCheck::new(host.clone(), redactor()).run(&mut ctx);

        let by_title = |t: &str| results.iter().find(|r| r.title == t).unwrap().clone();
        assert_eq!(by_title("Container").value, "web (4f1c2d3e4f5a)");
        assert_eq!(by_title("State").status, Status::Fail);
        assert_eq!(by_title("State").message, "exit code 137, finished at 2026-10-01T11:00:00Z");
        assert_eq!(by_title("OOM killed").status, Status::Fail);
        assert_eq!(by_title("Restarts"), CheckResult::warn("Restarts", "3", "restart policy: always"));
        assert_eq!(by_title("Privileged").status, Status::Warn);
        assert_eq!(by_title("Limits").value, "memory 512.0MiB  cpus 0.50  pids unlimited");
        assert_eq!(by_title("Ports").value, "0.0.0.0:8080->80/tcp");
        assert_eq!(host.calls_starting_with(&["docker", "inspect", "web"]), 1);

        let items = store.items().unwrap();
        assert_eq!(items[0].info().name, "container_inspect.json");
        let mut saved = String::new();
        items[0].open().unwrap().read_to_string(&mut saved).unwrap();
        assert!(!saved.contains("s3cr3t"));
    }

    #[test]
    fn no_target_means_not_applicable() {
        let host = Arc::new(ScriptedProvider::new("host"));
        let (_dir, store) = store();

        let mut quiet = RunContext::new(&store, None, None, false);
        assert!(ContainerStateCheck::new(host.clone(), redactor()).run(&mut quiet).is_empty());
        assert!(ContainerResourcesCheck::new(host.clone(), 90.0).run(&mut quiet).is_empty());
        assert!(ContainerLogsCheck::new(host.clone(), redactor()).run(&mut quiet).is_empty());
        assert!(host.calls().is_empty());

        let mut verbose = RunContext::new(&store, None, None, true);
        let results = ContainerLogsCheck::new(host.clone(), redactor()).run(&mut verbose);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "no target container");
    }

    #[test]
    fn docker_gate_applies_before_target() {
        let host = Arc::new(ScriptedProvider::new("host"));
        let (_dir, store) = store();
        let mut ctx = RunContext::new(&store, Some("web".into()), None, false);
        ctx.set_availability(DOCKER, Availability::unavailable("docker CLI not found"));

        assert!(ContainerStateCheck::new(host.clone(), redactor()).run(&mut ctx).is_empty());
        assert!(host.calls().is_empty());
    }

    #[test]
    fn missing_container_is_an_error() {
        let host = Arc::new(
            ScriptedProvider::new("host")
                .on(&["docker", "inspect"], exit(1, "[]", "Error: No such object: ghost")),
        );
        let (_dir, store) = store();
        let mut ctx = RunContext::new(&store, Some("ghost".into()), None, false);

        let results = ContainerStateCheck::new(host.clone(), redactor()).run(&mut ctx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::Error);
        assert_eq!(results[0].title, "Container state");
        assert!(results[0].message.contains("No such object"));
    }

    #[test]
    fn stats_are_parsed() {
        let u = parse_stats(STATS.as_bytes()).unwrap();
        assert_eq!(u.cpu_percent, 12.5);
        assert_eq!(u.memory_usage, 460 * 1024 * 1024);
        assert_eq!(u.memory_limit, 512 * 1024 * 1024);
        assert_eq!(u.block_write, 4 * 1024 * 1024);
        assert_eq!(u.pids, 7);
    }

    #[test]
    fn resources_warn_near_memory_limit() {
        let host = Arc::new(ScriptedProvider::new("host").on(&["docker", "stats"], ok(STATS)));
        let (_dir, store) = store();
        let mut ctx = RunContext::new(&store, Some("web".into()), None, false);

        let tight = ContainerResourcesCheck::new(host.clone(), 85.0).run(&mut ctx);
        assert_eq!(tight[0], CheckResult::info("CPU", "12.50%"));
        assert_eq!(tight[1].status, Status::Warn);
        assert_eq!(tight[1].message, "above 85% of the limit");

        let loose = ContainerResourcesCheck::new(host.clone(), 95.0).run(&mut ctx);
        assert_eq!(loose[1].status, Status::Pass);
        assert_eq!(loose[4], CheckResult::info("PIDs", "7"));
    }

    #[test]
    fn logs_are_saved_redacted() {
        let host = Arc::new(ScriptedProvider::new("host").on(
            &["docker", "logs"],
            exit(0, "started\n", "DB_PASSWORD=hunter2 rejected\n"),
        ));
        let (_dir, store) = store();
        let mut ctx = RunContext::new(&store, Some("web".into()), None, false);

        assert!(ContainerLogsCheck::new(host.clone(), redactor()).run(&mut ctx).is_empty());
        assert_eq!(host.calls_starting_with(&["docker", "logs", "--tail", "500"]), 1);

        let items = store.items().unwrap();
        let mut saved = String::new();
        items[0].open().unwrap().read_to_string(&mut saved).unwrap();
        assert_eq!(saved, "started\nDB_PASSWORD=[REDACTED] rejected\n");
    }
}
