//! etcd 性能探测
//!
//! Stands up a throw-away etcd inside the target container, waits for it to
//! become healthy, runs `etcdctl check perf` against it and classifies the
//! verdict lines. Once the launch has been issued, the etcd process is stopped
//! on every path.

use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::check::context::RunContext;
use crate::check::provider::{CommandOutput, ContainerProvider};
use crate::check::result::{CheckResult, Status};
use crate::check::{capability_gate, error_result, not_applicable, Check};
use crate::config::EtcdPerfConfig;
use crate::utils::{DiagError, Result};

pub const UNEXPECTED_OUTPUT: &str = "unexpected output from probe tool";

const STDOUT_ARTIFACT: &str = "etcd_perf_stdout.txt";
const STDERR_ARTIFACT: &str = "etcd_perf_stderr.txt";
const SERVER_LOG_ARTIFACT: &str = "etcd_perf_server.log";

/// `(marker, title)`; checked before the pass and error markers.
const FAIL_MARKERS: &[(&str, &str)] = &[
    ("FAIL: Throughput too low:", "Throughput too low"),
    ("FAIL: Slowest request took too long:", "Slowest request took too long"),
    ("FAIL: Stddev too high:", "Stddev too high"),
    ("FAIL: too many errors", "Too many errors"),
    ("FAIL: ERROR", "Request error"),
];
const PASS_MARKER: &str = "PASS:";
const ERROR_MARKER: &str = "Error:";

// ── 前置条件 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Satisfied,
    Failed(String),
    /// A service that makes the measurement unsafe is running.
    Conflict(String),
}

type ProbeFn = dyn Fn(&dyn ContainerProvider, &str) -> Outcome + Send + Sync;

/// One validation step, evaluated in list order until the first failure.
pub struct Precondition {
    pub description: String,
    probe: Box<ProbeFn>,
}

impl Precondition {
    pub fn new<F>(description: impl Into<String>, probe: F) -> Self
    where
        F: Fn(&dyn ContainerProvider, &str) -> Outcome + Send + Sync + 'static,
    {
        Self { description: description.into(), probe: Box::new(probe) }
    }

    /// Satisfied when `command` exits 0.
    pub fn command_succeeds(description: impl Into<String>, command: Vec<String>) -> Self {
        Self::new(description, move |provider, target| {
            let args: Vec<&str> = command.iter().map(String::as_str).collect();
            match provider.execute(target, &args) {
                Ok(out) if out.success() => Outcome::Satisfied,
                Ok(out) => Outcome::Failed(out.failure_reason()),
                Err(e) => Outcome::Failed(e.to_string()),
            }
        })
    }

    /// Satisfied when no process named `process` exists. A running conflicting
    /// service is reported as [`Outcome::Conflict`].
    pub fn not_running(process: String, conflicting: bool) -> Self {
        let description = format!("{} is not running", process);
        Self::new(description, move |provider, target| {
            match provider.execute(target, &["pgrep", "-x", process.as_str()]) {
                Ok(out) if out.success() && conflicting => Outcome::Conflict(process.clone()),
                Ok(out) if out.success() => Outcome::Failed(format!("{} is already running", process)),
                // pgrep: 1 = no match
                Ok(out) if out.exit_code == Some(1) => Outcome::Satisfied,
                Ok(out) => Outcome::Failed(out.failure_reason()),
                Err(e) => Outcome::Failed(e.to_string()),
            }
        })
    }

    pub fn evaluate(&self, provider: &dyn ContainerProvider, target: &str) -> Outcome {
        (self.probe)(provider, target)
    }
}

pub fn default_preconditions(config: &EtcdPerfConfig) -> Vec<Precondition> {
    let mut list = vec![
        Precondition::command_succeeds("can execute in container", vec!["true".to_string()]),
        Precondition::command_succeeds(
            format!("{} is installed", config.etcd_binary),
            vec!["which".to_string(), config.etcd_binary.clone()],
        ),
        Precondition::command_succeeds(
            format!("{} is installed", config.etcdctl_binary),
            vec!["which".to_string(), config.etcdctl_binary.clone()],
        ),
    ];
    for service in &config.conflicting_services {
        list.push(Precondition::not_running(service.clone(), true));
    }
    list.push(Precondition::not_running(process_name(&config.etcd_binary), false));
    list
}

fn process_name(binary: &str) -> String {
    binary.rsplit('/').next().unwrap_or(binary).to_string()
}

// ── 被测进程 ────────────────────────────────────────────────────────────────

/// An etcd whose launch has been issued. Dropping it sends SIGTERM exactly
/// once: to the captured pid, or by process name when the launch produced
/// no usable pid.
struct Subject<'p> {
    provider: &'p dyn ContainerProvider,
    target: String,
    process: String,
    pid: Option<u32>,
}

impl Drop for Subject<'_> {
    fn drop(&mut self) {
        let pid = self.pid.map(|p| p.to_string());
        let stop: Vec<&str> = match &pid {
            Some(pid) => vec!["kill", "-TERM", pid.as_str()],
            // 启动前已确认没有同名进程在运行
            None => vec!["pkill", "-TERM", "-x", self.process.as_str()],
        };
        match self.provider.execute(&self.target, &stop) {
            Ok(out) if out.success() => debug!(pid = ?self.pid, "etcd stopped"),
            Ok(out) => warn!(pid = ?self.pid, "failed to stop etcd: {}", out.failure_reason()),
            Err(e) => warn!(pid = ?self.pid, "failed to stop etcd: {}", e),
        }
    }
}

const MIN_ATTEMPT_BUDGET: Duration = Duration::from_millis(1);

/// Polls `ready` every `interval` until it returns true or `timeout` passes.
///
/// Each attempt receives its own budget, `min(interval, time left)`, and is
/// expected to give up within it, so the wait never outlives the deadline by
/// more than one attempt's overhead.
pub fn wait_until<F>(interval: Duration, timeout: Duration, mut ready: F) -> bool
where
    F: FnMut(Duration) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        let budget = interval
            .min(deadline.saturating_duration_since(Instant::now()))
            .max(MIN_ATTEMPT_BUDGET);
        if ready(budget) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(interval.min(deadline - now));
    }
}

// ── Check ───────────────────────────────────────────────────────────────────

pub struct EtcdPerfCheck {
    provider: Arc<dyn ContainerProvider>,
    config: EtcdPerfConfig,
    preconditions: Vec<Precondition>,
}

impl EtcdPerfCheck {
    pub fn new(provider: Arc<dyn ContainerProvider>, config: EtcdPerfConfig) -> Self {
        let preconditions = default_preconditions(&config);
        Self { provider, config, preconditions }
    }

    #[cfg(test)]
    pub fn with_preconditions(mut self, preconditions: Vec<Precondition>) -> Self {
        self.preconditions = preconditions;
        self
    }

    fn validate(&self, ctx: &RunContext<'_>, target: &str) -> std::result::Result<(), Vec<CheckResult>> {
        for step in &self.preconditions {
            match step.evaluate(self.provider.as_ref(), target) {
                Outcome::Satisfied => debug!(step = %step.description, "precondition ok"),
                Outcome::Conflict(service) => {
                    warn!(service = %service, "conflicting service running, skipping etcd probe");
                    return Err(vec![error_result(self, format!("service is running: {}", service))]);
                }
                Outcome::Failed(reason) => {
                    info!(step = %step.description, "precondition failed: {}", reason);
                    return Err(not_applicable(
                        ctx,
                        self,
                        format!("precondition \"{}\" failed: {}", step.description, reason),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Runs `command` as the configured user, if any.
    fn launch(&self, target: &str, command: &[&str]) -> Result<CommandOutput> {
        match &self.config.run_as_user {
            Some(user) => self.provider.execute_as_user(target, user, command),
            None => self.provider.execute(target, command),
        }
    }

    fn start_subject<'p>(&'p self, target: &str) -> Result<Subject<'p>> {
        let c = &self.config;
        let dir = &c.scratch_dir;

        for cmd in [["rm", "-rf", dir.as_str()], ["mkdir", "-p", dir.as_str()]] {
            let out = self.launch(target, &cmd)?;
            if !out.success() {
                return Err(DiagError::Provider(format!(
                    "{} {}: {}", cmd[0], dir, out.failure_reason()
                )));
            }
        }

        let script = format!(
            "nohup {etcd} --name sediag-perf --data-dir {data} \
             --listen-client-urls {client} --advertise-client-urls {client} \
             --listen-peer-urls {peer} --initial-advertise-peer-urls {peer} \
             --initial-cluster sediag-perf={peer} > {log} 2>&1 & echo $!",
            etcd = shell_quote(&c.etcd_binary),
            data = shell_quote(&format!("{}/data", dir)),
            client = shell_quote(&c.client_url()),
            peer = shell_quote(&c.peer_url()),
            log = shell_quote(&self.server_log_path()),
        );

        // 从这里开始，任何返回路径都会停止 etcd
        let mut subject = Subject {
            provider: self.provider.as_ref(),
            target: target.to_string(),
            process: process_name(&c.etcd_binary),
            pid: None,
        };

        let out = self.launch(target, &["sh", "-c", script.as_str()])?;
        if !out.success() {
            return Err(DiagError::Provider(out.failure_reason()));
        }
        let pid: u32 = out
            .stdout_str()
            .trim()
            .parse()
            .map_err(|_| DiagError::Parse(format!("no pid in {:?}", out.stdout_str())))?;

        info!(pid, "etcd started");
        subject.pid = Some(pid);
        Ok(subject)
    }

    fn is_ready(&self, target: &str, budget: Duration) -> bool {
        let url = self.config.client_url();
        let limit = format!("{}ms", budget.as_millis().max(1));
        let probe = [
            self.config.etcdctl_binary.as_str(),
            "--endpoints",
            url.as_str(),
            "endpoint",
            "health",
            "--dial-timeout",
            limit.as_str(),
            "--command-timeout",
            limit.as_str(),
        ];
        match self.provider.execute(target, &probe) {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("health probe failed: {}", e);
                false
            }
        }
    }

    fn measure(&self, target: &str) -> Result<CommandOutput> {
        let url = self.config.client_url();
        let cmd = [
            self.config.etcdctl_binary.as_str(),
            "--endpoints",
            url.as_str(),
            "check",
            "perf",
            "--load",
            self.config.load.as_str(),
        ];
        self.provider.execute(target, &cmd)
    }

    fn server_log_path(&self) -> String {
        format!("{}/etcd.log", self.config.scratch_dir)
    }

    fn capture_measurement(&self, ctx: &RunContext<'_>, measured: &Result<CommandOutput>) {
        let store = ctx.store();

        if let Ok(out) = measured {
            if let Err(e) = store.save_bytes(STDOUT_ARTIFACT, &out.stdout) {
                warn!("saving {}: {}", STDOUT_ARTIFACT, e);
            }
            if !out.success() {
                if let Err(e) = store.save_bytes(STDERR_ARTIFACT, &out.stderr) {
                    warn!("saving {}: {}", STDERR_ARTIFACT, e);
                }
            }
        }
    }

    fn capture_server_log(&self, ctx: &RunContext<'_>, target: &str) {
        let store = ctx.store();
        let log_path = self.server_log_path();
        match self.provider.execute(target, &["cat", log_path.as_str()]) {
            Ok(log) if log.success() => {
                if let Err(e) = store.save_bytes(SERVER_LOG_ARTIFACT, &log.stdout) {
                    warn!("saving {}: {}", SERVER_LOG_ARTIFACT, e);
                }
            }
            Ok(log) => warn!("reading etcd log: {}", log.failure_reason()),
            Err(e) => warn!("reading etcd log: {}", e),
        }
    }
}

impl Check for EtcdPerfCheck {
    fn describe(&self) -> String {
        "etcd performance".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        if let Some(stop) = capability_gate(ctx, self, self.provider.name()) {
            return stop;
        }
        let target = match ctx.target() {
            Some(t) => t.to_string(),
            None => return not_applicable(ctx, self, "no container specified"),
        };

        if let Err(stop) = self.validate(ctx, &target) {
            return stop;
        }

        let subject = match self.start_subject(&target) {
            Ok(s) => s,
            Err(e) => return vec![error_result(self, format!("failed to start etcd: {}", e))],
        };

        let c = &self.config;
        if !wait_until(c.poll_interval(), c.ready_timeout(), |budget| self.is_ready(&target, budget)) {
            warn!(timeout = ?c.ready_timeout(), "etcd did not become healthy");
            self.capture_server_log(ctx, &target);
            drop(subject);
            return vec![error_result(
                self,
                format!("etcd is not ready after {}s", c.ready_timeout().as_secs_f64()),
            )];
        }

        let measured = self.measure(&target);
        self.capture_measurement(ctx, &measured);
        self.capture_server_log(ctx, &target);
        drop(subject);

        match measured {
            Err(e) => vec![error_result(self, format!("failed to run etcdctl check perf: {}", e))],
            Ok(out) => {
                if !out.success() {
                    debug!(exit = ?out.exit_code, "etcdctl check perf exited non-zero");
                }
                parse_perf_output(&self.describe(), &out.stdout_str())
            }
        }
    }
}

// ── 输出解析 ────────────────────────────────────────────────────────────────

fn normalize(line: &str) -> String {
    static ANSI: OnceLock<Option<Regex>> = OnceLock::new();
    let stripped = match ANSI.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").ok()) {
        Some(re) => re.replace_all(line, "").into_owned(),
        None => line.to_string(),
    };
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn after<'l>(line: &'l str, marker: &str) -> Option<&'l str> {
    line.find(marker).map(|i| line[i + marker.len()..].trim())
}

fn classify(title: &str, line: &str) -> Option<CheckResult> {
    for (marker, fail_title) in FAIL_MARKERS {
        if let Some(rest) = after(line, marker) {
            return Some(CheckResult::fail(*fail_title, "BAD", rest));
        }
    }
    if let Some(rest) = after(line, PASS_MARKER) {
        return Some(CheckResult::new(title, "GOOD", Status::Pass, rest));
    }
    if let Some(rest) = after(line, ERROR_MARKER) {
        return Some(CheckResult::new(title, "ERROR", Status::Error, rest));
    }
    None
}

/// Turns `etcdctl check perf` output into results.
///
/// Accepted shapes: a single error line, or two or more pass/fail verdicts.
/// Anything else becomes one `ERROR` result.
pub fn parse_perf_output(title: &str, output: &str) -> Vec<CheckResult> {
    let results: Vec<CheckResult> = output
        .lines()
        .filter_map(|raw| classify(title, &normalize(raw)))
        .collect();

    let accepted = match results.as_slice() {
        [only] => only.status == Status::Error,
        many if many.len() >= 2 => many
            .iter()
            .all(|r| matches!(r.status, Status::Pass | Status::Fail)),
        _ => false,
    };

    if accepted {
        results
    } else {
        vec![CheckResult::error(title, UNEXPECTED_OUTPUT)]
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
