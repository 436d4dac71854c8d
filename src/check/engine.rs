//! Docker 引擎层检查
//! 来源：docker version, docker info, daemon.json, journald/syslog, docker events

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::check::context::{Availability, RunContext};
use crate::check::provider::{CommandOutput, ContainerProvider};
use crate::check::redact::Redact;
use crate::check::result::CheckResult;
use crate::check::store::artifact_name;
use crate::check::{capability_gate, error_result, not_applicable, Check};
use crate::utils::{DiagError, Result};

/// Availability cache key shared by every check that needs the docker CLI.
pub const DOCKER: &str = "docker";

const DEFAULT_SINCE: Duration = Duration::from_secs(24 * 3600);
const DAEMON_LOG_LINES: usize = 200;

// ── docker version / docker info ────────────────────────────────────────────

pub struct EngineVersionCheck {
    host: Arc<dyn ContainerProvider>,
}

impl EngineVersionCheck {
    pub fn new(host: Arc<dyn ContainerProvider>) -> Self {
        Self { host }
    }
}

impl Check for EngineVersionCheck {
    fn describe(&self) -> String {
        "Docker version".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let host = self.host.clone();
        ctx.ensure_availability(DOCKER, || {
            if host.is_installed(DOCKER) {
                Availability::available()
            } else {
                Availability::unavailable("docker CLI not found")
            }
        });
        if let Some(stop) = capability_gate(ctx, self, DOCKER) {
            return stop;
        }

        // 两个命令互不依赖，并行执行后汇合
        let (version, info) = thread::scope(|s| {
            let v = s.spawn(|| docker(self.host.as_ref(), &["version", "--format", "{{json .}}"]));
            let i = s.spawn(|| docker(self.host.as_ref(), &["info", "--format", "{{json .}}"]));
            (joined(v.join()), joined(i.join()))
        });

        let version = match version {
            Ok(v) => v,
            Err(e) => {
                ctx.set_availability(DOCKER, Availability::unavailable(e.to_string()));
                return vec![error_result(self, format!("docker daemon not reachable: {}", e))];
            }
        };
        save(ctx, "docker_version.json", &version.stdout);

        let json: serde_json::Value = match serde_json::from_slice(&version.stdout) {
            Ok(j) => j,
            Err(e) => return vec![error_result(self, format!("failed to parse docker version: {}", e))],
        };
        let server = &json["Server"];

        let mut results = vec![
            CheckResult::info("Server version", str_val(&server["Version"])),
            CheckResult::info("API version", str_val(&server["ApiVersion"])),
            CheckResult::info("Go version", str_val(&server["GoVersion"])),
            CheckResult::info(
                "OS/Arch",
                format!("{}/{}", str_val(&server["Os"]), str_val(&server["Arch"])),
            ),
        ];

        match info.map(|o| {
            save(ctx, "docker_info.json", &o.stdout);
            serde_json::from_slice::<serde_json::Value>(&o.stdout)
        }) {
            Ok(Ok(j)) => {
                results.push(CheckResult::info(
                    "Containers",
                    format!(
                        "{} total  {} running  {} paused  {} stopped",
                        j["Containers"].as_u64().unwrap_or(0),
                        j["ContainersRunning"].as_u64().unwrap_or(0),
                        j["ContainersPaused"].as_u64().unwrap_or(0),
                        j["ContainersStopped"].as_u64().unwrap_or(0),
                    ),
                ));
                results.push(CheckResult::info("Images", j["Images"].as_u64().unwrap_or(0).to_string()));
            }
            Ok(Err(e)) => results.push(error_result(self, format!("failed to parse docker info: {}", e))),
            Err(e) => results.push(error_result(self, format!("docker info failed: {}", e))),
        }
        results
    }
}

fn joined(r: thread::Result<Result<CommandOutput>>) -> Result<CommandOutput> {
    r.unwrap_or_else(|_| Err(DiagError::System("docker command thread panicked".to_string())))
}

// ── 运行时配置 ──────────────────────────────────────────────────────────────

pub struct EngineRuntimeCheck {
    host: Arc<dyn ContainerProvider>,
}

impl EngineRuntimeCheck {
    pub fn new(host: Arc<dyn ContainerProvider>) -> Self {
        Self { host }
    }

    fn judge(&self, j: &serde_json::Value) -> Vec<CheckResult> {
        let mut results = vec![
            CheckResult::info("Storage driver", str_val(&j["Driver"])),
            CheckResult::info(
                "cgroup driver",
                format!("{} ({})", str_val(&j["CgroupDriver"]), str_val(&j["CgroupVersion"])),
            ),
            CheckResult::info("Log driver", str_val(&j["LoggingDriver"])),
            CheckResult::info("Default runtime", str_val(&j["DefaultRuntime"])),
            CheckResult::info("Root dir", str_val(&j["DockerRootDir"])),
        ];

        // kernel capability warnings
        let flags = [
            ("MemoryLimit", "Memory limit support", "memory limits are not enforced"),
            ("SwapLimit", "Swap limit support", "swap limits are not enforced"),
            ("IPv4Forwarding", "IPv4 forwarding", "containers have no outbound network"),
        ];
        for (key, title, consequence) in flags {
            if j[key].as_bool().unwrap_or(false) {
                results.push(CheckResult::pass(title, "enabled"));
            } else {
                results.push(CheckResult::warn(title, "disabled", consequence));
            }
        }

        if let Some(warnings) = j["Warnings"].as_array() {
            for w in warnings.iter().filter_map(|w| w.as_str()) {
                results.push(CheckResult::warn("Daemon warning", "", w.trim()));
            }
        }
        results
    }
}

impl Check for EngineRuntimeCheck {
    fn describe(&self) -> String {
        "Docker runtime".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        if let Some(stop) = capability_gate(ctx, self, DOCKER) {
            return stop;
        }
        let out = match docker(self.host.as_ref(), &["info", "--format", "{{json .}}"]) {
            Ok(o) => o,
            Err(e) => return vec![error_result(self, e.to_string())],
        };
        match serde_json::from_slice::<serde_json::Value>(&out.stdout) {
            Ok(j) => self.judge(&j),
            Err(e) => vec![error_result(self, format!("failed to parse docker info: {}", e))],
        }
    }
}

// ── daemon.json ─────────────────────────────────────────────────────────────

pub struct DaemonConfigCheck {
    path: PathBuf,
    redactor: Arc<dyn Redact>,
}

impl DaemonConfigCheck {
    pub fn new(redactor: Arc<dyn Redact>) -> Self {
        Self::at("/etc/docker/daemon.json", redactor)
    }

    pub fn at(path: impl Into<PathBuf>, redactor: Arc<dyn Redact>) -> Self {
        Self { path: path.into(), redactor }
    }
}

impl Check for DaemonConfigCheck {
    fn describe(&self) -> String {
        "Daemon config".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        if let Some(stop) = capability_gate(ctx, self, DOCKER) {
            return stop;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            // 没有 daemon.json 是默认配置，不算错误
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                return vec![error_result(
                    self,
                    format!("failed to read {}: {}", self.path.display(), e),
                )]
            }
        };

        let name = artifact_name(&self.path.to_string_lossy());
        save(ctx, &name, self.redactor.redact(&content).as_bytes());

        match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(_) => Vec::new(),
            Err(e) => vec![error_result(
                self,
                format!("failed to parse {}: {}", self.path.display(), e),
            )],
        }
    }
}

// ── daemon logs ─────────────────────────────────────────────────────────────

pub struct DaemonLogsCheck {
    host: Arc<dyn ContainerProvider>,
    redactor: Arc<dyn Redact>,
    fallback_log: PathBuf,
}

impl DaemonLogsCheck {
    pub fn new(host: Arc<dyn ContainerProvider>, redactor: Arc<dyn Redact>) -> Self {
        Self { host, redactor, fallback_log: PathBuf::from("/var/log/docker.log") }
    }

    fn collect(&self) -> Option<String> {
        // 方法1: journalctl
        let lines = DAEMON_LOG_LINES.to_string();
        let journal = self.host.execute("", &[
            "journalctl",
            "-u", "docker",
            "--no-pager",
            "-n", lines.as_str(),
            "-p", "warning",   // warning 以上
            "--output", "short-iso",
        ]);
        if let Ok(o) = journal {
            if o.success() && !o.stdout.is_empty() {
                return Some(o.stdout_str());
            }
        }

        // 方法2: /var/log/docker.log
        let content = std::fs::read_to_string(&self.fallback_log).ok()?;
        let tail: Vec<&str> = content.lines().rev().take(DAEMON_LOG_LINES).collect();
        Some(tail.into_iter().rev().collect::<Vec<_>>().join("\n"))
    }
}

impl Check for DaemonLogsCheck {
    fn describe(&self) -> String {
        "Daemon logs".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        if let Some(stop) = capability_gate(ctx, self, DOCKER) {
            return stop;
        }
        match self.collect() {
            Some(log) => {
                save(ctx, "daemon.log", self.redactor.redact(&log).as_bytes());
                Vec::new()
            }
            None => not_applicable(ctx, self, "daemon logs unavailable"),
        }
    }
}

// ── docker events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct DockerEvent {
    pub timestamp: String,
    pub event_type: String,   // container / network / volume / image
    pub action: String,       // start / stop / die / kill / oom / ...
    pub actor_id: String,     // short container id or name
    pub actor_name: String,
    pub attributes: HashMap<String, String>,
}

pub struct EventsCheck {
    host: Arc<dyn ContainerProvider>,
}

impl EventsCheck {
    pub fn new(host: Arc<dyn ContainerProvider>) -> Self {
        Self { host }
    }

    fn judge(&self, events: &[DockerEvent], since: Duration) -> Vec<CheckResult> {
        let window = format!("last {}h", since.as_secs() / 3600);
        let mut results = vec![CheckResult::info("Events", events.len().to_string()).with_message(window)];

        let oom = names_by_action(events, |e| e.action == "oom");
        if !oom.is_empty() {
            results.push(CheckResult::warn("OOM events", count(&oom).to_string(), summarize(&oom)));
        }

        let crashes = names_by_action(events, |e| {
            e.action == "die"
                && e.attributes.get("exitCode").map_or(false, |c| c != "0")
        });
        if !crashes.is_empty() {
            results.push(CheckResult::warn(
                "Non-zero exits",
                count(&crashes).to_string(),
                summarize(&crashes),
            ));
        }
        results
    }
}

impl Check for EventsCheck {
    fn describe(&self) -> String {
        "Recent events".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        if let Some(stop) = capability_gate(ctx, self, DOCKER) {
            return stop;
        }
        let since = ctx.time_window().unwrap_or(DEFAULT_SINCE);
        let since_arg = format!("{}s", since.as_secs());

        let out = match docker(self.host.as_ref(), &[
            "events",
            "--since", since_arg.as_str(),
            "--until", "0s",
            "--format", "{{json .}}",
        ]) {
            Ok(o) => o,
            Err(e) => return vec![error_result(self, e.to_string())],
        };
        save(ctx, "events.json", &out.stdout);

        let events: Vec<DockerEvent> = out
            .stdout_str()
            .lines()
            .filter_map(parse_event_line)
            .collect();
        debug!(count = events.len(), "docker events parsed");
        self.judge(&events, since)
    }
}

fn parse_event_line(line: &str) -> Option<DockerEvent> {
    let j: serde_json::Value = serde_json::from_str(line).ok()?;

    // timestamp: unix 秒 → 可读时间
    let ts = j["time"].as_i64()
        .and_then(|t| chrono::DateTime::from_timestamp(t, 0))
        .map(|d| d.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default();

    let event_type = str_val(&j["Type"]);
    let action     = str_val(&j["Action"]);
    let actor_id   = str_val(&j["Actor"]["ID"]).chars().take(12).collect::<String>();

    let attributes: HashMap<String, String> = j["Actor"]["Attributes"]
        .as_object()
        .map(|obj| obj.iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or("").to_string()))
            .collect())
        .unwrap_or_default();

    let actor_name = attributes.get("name")
        .cloned()
        .unwrap_or_else(|| actor_id.clone());

    Some(DockerEvent {
        timestamp: ts,
        event_type,
        action,
        actor_id,
        actor_name,
        attributes,
    })
}

fn names_by_action<F>(events: &[DockerEvent], pred: F) -> BTreeMap<String, usize>
where
    F: Fn(&DockerEvent) -> bool,
{
    let mut map = BTreeMap::new();
    for e in events.iter().filter(|e| e.event_type == "container" && pred(e)) {
        *map.entry(e.actor_name.clone()).or_insert(0) += 1;
    }
    map
}

fn count(map: &BTreeMap<String, usize>) -> usize {
    map.values().sum()
}

fn summarize(map: &BTreeMap<String, usize>) -> String {
    map.iter()
        .map(|(name, n)| format!("{} ({})", name, n))
        .collect::<Vec<_>>()
        .join(", ")
}

// ── 工具 ────────────────────────────────────────────────────────────────────

/// Runs the docker CLI on the host; a non-zero exit is an error here.
pub(crate) fn docker(host: &dyn ContainerProvider, args: &[&str]) -> Result<CommandOutput> {
    let mut cmd = vec![DOCKER];
    cmd.extend_from_slice(args);
    let out = host.execute("", &cmd)?;
    if !out.success() {
        return Err(DiagError::Provider(format!(
            "docker {} failed: {}",
            args.first().copied().unwrap_or(""),
            out.failure_reason()
        )));
    }
    Ok(out)
}

pub(crate) fn save(ctx: &RunContext<'_>, name: &str, bytes: &[u8]) {
    if let Err(e) = ctx.store().save_bytes(name, bytes) {
        warn!("saving {}: {}", name, e);
    }
}

pub(crate) fn str_val(v: &serde_json::Value) -> String {
    v.as_str().unwrap_or("").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::provider::fake::{exit, ok, ScriptedProvider};
    use crate::check::redact::PatternRedactor;
    use crate::check::result::Status;
    use crate::check::store::ArtifactStore;
    use tempfile::tempdir;

    const VERSION: &str = r#"{"Server":{"Version":"24.0.7","ApiVersion":"1.43","GoVersion":"go1.20.10","Os":"linux","Arch":"amd64"}}"#;
    const INFO: &str = r#"{"Containers":5,"ContainersRunning":3,"ContainersPaused":0,"ContainersStopped":2,"Images":12,
        "Driver":"overlay2","CgroupDriver":"systemd","CgroupVersion":"2","LoggingDriver":"json-file",
        "DefaultRuntime":"runc","DockerRootDir":"/var/lib/docker","MemoryLimit":true,"SwapLimit":false,
        "IPv4Forwarding":true,"Warnings":["WARNING: No swap limit support"]}"#;

    fn redactor() -> Arc<dyn Redact> {
        Arc::new(PatternRedactor::new(&[]).unwrap())
    }

    fn with_ctx<T>(verbose: bool, f: impl FnOnce(&mut RunContext<'_>, &ArtifactStore) -> T) -> T {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("raw")).unwrap();
        let mut ctx = RunContext::new(&store, None, None, verbose);
        f(&mut ctx, &store)
    }

    fn names(store: &ArtifactStore) -> Vec<String> {
        store.items().unwrap().iter().map(|i| i.info().name.clone()).collect()
    }

    #[test]
    fn version_check_runs_both_commands() {
        let host = Arc::new(
            ScriptedProvider::new("host")
                .on(&["docker", "version"], ok(VERSION))
                .on(&["docker", "info"], ok(INFO)),
        );
        with_ctx(false, |ctx, store| {
            let results = EngineVersionCheck::new(host.clone()).run(ctx);

            assert_eq!(results[0], CheckResult::info("Server version", "24.0.7"));
            assert_eq!(results[3], CheckResult::info("OS/Arch", "linux/amd64"));
            assert_eq!(results[4].value, "5 total  3 running  0 paused  2 stopped");
            assert_eq!(results[5], CheckResult::info("Images", "12"));
            assert!(ctx.is_available(DOCKER));
            assert_eq!(names(store), vec!["docker_info.json", "docker_version.json"]);
        });
    }

    #[test]
    fn missing_cli_marks_docker_unavailable_for_later_checks() {
        let host = Arc::new(ScriptedProvider::new("host").not_installed());
        with_ctx(false, |ctx, _| {
            assert!(EngineVersionCheck::new(host.clone()).run(ctx).is_empty());
            assert!(!ctx.is_available(DOCKER));
            assert!(EngineRuntimeCheck::new(host.clone()).run(ctx).is_empty());
            assert!(EventsCheck::new(host.clone()).run(ctx).is_empty());
            assert!(DaemonLogsCheck::new(host.clone(), redactor()).run(ctx).is_empty());
        });
        assert!(host.calls().is_empty());
    }

    #[test]
    fn missing_cli_is_reported_when_verbose() {
        let host = Arc::new(ScriptedProvider::new("host").not_installed());
        with_ctx(true, |ctx, _| {
            let results = EngineVersionCheck::new(host.clone()).run(ctx);
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].title, "Docker version");
            assert_eq!(results[0].message, "docker is not available: docker CLI not found");
        });
    }

    #[test]
    fn unreachable_daemon_is_an_error_and_closes_the_gate() {
        let host = Arc::new(
            ScriptedProvider::new("host")
                .on(&["docker"], exit(1, "", "Cannot connect to the Docker daemon")),
        );
        with_ctx(true, |ctx, _| {
            let results = EngineVersionCheck::new(host.clone()).run(ctx);
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].status, Status::Error);
            assert!(results[0].message.contains("Cannot connect to the Docker daemon"));

            let runtime = EngineRuntimeCheck::new(host.clone()).run(ctx);
            assert_eq!(runtime.len(), 1);
            assert!(runtime[0].message.starts_with("docker is not available"));
        });
    }

    #[test]
    fn runtime_flags_and_daemon_warnings() {
        let host = Arc::new(ScriptedProvider::new("host").on(&["docker", "info"], ok(INFO)));
        with_ctx(false, |ctx, _| {
            let results = EngineRuntimeCheck::new(host.clone()).run(ctx);

            assert_eq!(results[0], CheckResult::info("Storage driver", "overlay2"));
            assert_eq!(results[1].value, "systemd (2)");
            let swap = results.iter().find(|r| r.title == "Swap limit support").unwrap();
            assert_eq!(swap.status, Status::Warn);
            let mem = results.iter().find(|r| r.title == "Memory limit support").unwrap();
            assert_eq!(mem.status, Status::Pass);
            let last = results.last().unwrap();
            assert_eq!(last.title, "Daemon warning");
            assert_eq!(last.message, "WARNING: No swap limit support");
        });
    }

    #[test]
    fn daemon_config_is_saved_redacted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("daemon.json");
        std::fs::write(&path, r#"{"log-driver": "json-file", "registry-token": "abc123"}"#).unwrap();

        with_ctx(false, |ctx, store| {
            let results = DaemonConfigCheck::at(&path, redactor()).run(ctx);
            assert!(results.is_empty());

            let items = store.items().unwrap();
            assert_eq!(items.len(), 1);
            assert!(items[0].info().name.ends_with("daemon.json"));
            let mut saved = String::new();
            std::io::Read::read_to_string(&mut items[0].open().unwrap(), &mut saved).unwrap();
            assert!(saved.contains("[REDACTED]"));
            assert!(!saved.contains("abc123"));
        });
    }

    #[test]
    fn daemon_config_parse_failure_and_absence() {
        let dir = tempdir().unwrap();
        let broken = dir.path().join("daemon.json");
        std::fs::write(&broken, "{ not json").unwrap();

        with_ctx(false, |ctx, _| {
            let results = DaemonConfigCheck::at(&broken, redactor()).run(ctx);
            assert_eq!(results.len(), 1);
            assert!(results[0].message.starts_with("failed to parse"));

            let missing = DaemonConfigCheck::at(dir.path().join("nope.json"), redactor()).run(ctx);
            assert!(missing.is_empty());
        });
    }

    #[test]
    fn daemon_logs_prefer_journal() {
        let host = Arc::new(
            ScriptedProvider::new("host")
                .on(&["journalctl"], ok("dockerd: level=warning msg=\"password=hunter2\"\n")),
        );
        with_ctx(false, |ctx, store| {
            assert!(DaemonLogsCheck::new(host.clone(), redactor()).run(ctx).is_empty());
            assert_eq!(names(store), vec!["daemon.log"]);
        });
    }

    #[test]
    fn events_window_and_warnings() {
        let events = [
            r#"{"Type":"container","Action":"start","time":1700000000,"Actor":{"ID":"aaaaaaaaaaaaaaaa","Attributes":{"name":"web"}}}"#,
            r#"{"Type":"container","Action":"oom","time":1700000100,"Actor":{"ID":"aaaaaaaaaaaaaaaa","Attributes":{"name":"web"}}}"#,
            r#"{"Type":"container","Action":"die","time":1700000101,"Actor":{"ID":"aaaaaaaaaaaaaaaa","Attributes":{"name":"web","exitCode":"137"}}}"#,
            r#"{"Type":"container","Action":"die","time":1700000200,"Actor":{"ID":"bbbbbbbbbbbbbbbb","Attributes":{"name":"job","exitCode":"0"}}}"#,
            "not json",
        ]
        .join("\n");
        let host = Arc::new(ScriptedProvider::new("host").on(&["docker", "events"], ok(&events)));

        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("raw")).unwrap();
        let mut ctx = RunContext::new(&store, None, Some(Duration::from_secs(7200)), false);

        let results = EventsCheck::new(host.clone()).run(&mut ctx);

        assert_eq!(results[0], CheckResult::info("Events", "4").with_message("last 2h"));
        assert_eq!(results[1], CheckResult::warn("OOM events", "1", "web (1)"));
        assert_eq!(results[2], CheckResult::warn("Non-zero exits", "1", "web (1)"));
        assert_eq!(results.len(), 3);
        assert_eq!(host.calls_starting_with(&["docker", "events", "--since", "7200s"]), 1);
        assert_eq!(names(&store), vec!["events.json"]);
    }

    #[test]
    fn event_line_parsing() {
        let e = parse_event_line(
            r#"{"Type":"network","Action":"connect","time":0,"Actor":{"ID":"0123456789abcdef","Attributes":{}}}"#,
        )
        .unwrap();
        assert_eq!(e.event_type, "network");
        assert_eq!(e.actor_id, "0123456789ab");
        assert_eq!(e.actor_name, "0123456789ab");
        assert!(parse_event_line("garbage").is_none());
    }
}
