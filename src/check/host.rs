//! 宿主机层检查
//! 来源：/proc/*, /etc/os-release, /sys/fs/cgroup, 系统命令

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::check::context::RunContext;
use crate::check::provider::ContainerProvider;
use crate::check::result::CheckResult;
use crate::check::{error_result, Check};
use crate::utils::format::{fmt_kb, format_uptime};

// ── 数据结构 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryInfo {
    pub total_kb: u64,
    pub available_kb: u64,
    pub used_kb: u64,
    pub used_percent: f64,
    pub swap_total_kb: u64,
    pub swap_used_kb: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskInfo {
    pub mount: String,
    pub filesystem: String,
    pub total_kb: u64,
    pub used_kb: u64,
    pub available_kb: u64,
    pub used_percent: f64,
    pub inode_used_percent: f64,
}

// ── OS ──────────────────────────────────────────────────────────────────────

pub struct HostOsCheck;

impl Check for HostOsCheck {
    fn describe(&self) -> String {
        "Host OS".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let hostname = read_trimmed("/proc/sys/kernel/hostname");
        let kernel = read_trimmed("/proc/sys/kernel/osrelease");
        let os_release = parse_os_release(&fs::read_to_string("/etc/os-release").unwrap_or_default());
        let uptime = fs::read_to_string("/proc/uptime")
            .ok()
            .and_then(|s| s.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()))
            .map(|v| format_uptime(v as u64))
            .unwrap_or_else(|| "unknown".to_string());

        vec![
            CheckResult::info("Hostname", hostname),
            CheckResult::info("OS", os_release),
            CheckResult::info("Kernel", kernel),
            CheckResult::info("Arch", std::env::consts::ARCH),
            CheckResult::info("Uptime", uptime),
        ]
    }
}

fn read_trimmed(path: &str) -> String {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

fn parse_os_release(content: &str) -> String {
    content
        .lines()
        .find(|l| l.starts_with("PRETTY_NAME="))
        .map(|l| l.trim_start_matches("PRETTY_NAME=").trim_matches('"').to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ── CPU ─────────────────────────────────────────────────────────────────────

pub struct CpuCheck {
    load_per_core_warn: f64,
}

impl CpuCheck {
    pub fn new(load_per_core_warn: f64) -> Self {
        Self { load_per_core_warn }
    }
}

impl Check for CpuCheck {
    fn describe(&self) -> String {
        "CPU".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let (model, cores) = parse_cpuinfo(&cpuinfo);
        let cores = if cores == 0 {
            std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1)
        } else {
            cores
        };

        let mut results = vec![
            CheckResult::info("CPU model", model),
            CheckResult::info("Logical cores", cores.to_string()),
        ];

        match fs::read_to_string("/proc/loadavg").ok().and_then(|s| parse_loadavg(&s)) {
            Some(load) => results.push(self.judge_load(load, cores)),
            None => results.push(error_result(self, "failed to read /proc/loadavg")),
        }
        results
    }
}

impl CpuCheck {
    fn judge_load(&self, (l1, l5, l15): (f64, f64, f64), cores: u32) -> CheckResult {
        let value = format!("{:.2} {:.2} {:.2}", l1, l5, l15);
        let limit = self.load_per_core_warn * cores.max(1) as f64;
        if l5 > limit {
            CheckResult::warn(
                "Load average",
                value,
                format!("5 min load above {:.1} ({} cores)", limit, cores),
            )
        } else {
            CheckResult::pass("Load average", value)
        }
    }
}

fn parse_cpuinfo(cpuinfo: &str) -> (String, u32) {
    let model = cpuinfo
        .lines()
        .find(|l| l.starts_with("model name"))
        .and_then(|l| l.splitn(2, ':').nth(1))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let cores = cpuinfo
        .lines()
        .filter(|l| l.starts_with("processor"))
        .count() as u32;

    (model, cores)
}

fn parse_loadavg(s: &str) -> Option<(f64, f64, f64)> {
    let mut parts = s.split_whitespace();
    let v1 = parts.next()?.parse().ok()?;
    let v5 = parts.next()?.parse().ok()?;
    let v15 = parts.next()?.parse().ok()?;
    Some((v1, v5, v15))
}

// ── Memory ──────────────────────────────────────────────────────────────────

pub struct MemoryCheck {
    warn_percent: f64,
}

impl MemoryCheck {
    pub fn new(warn_percent: f64) -> Self {
        Self { warn_percent }
    }

    fn judge(&self, m: &MemoryInfo) -> Vec<CheckResult> {
        let value = format!("{:.1}%", m.used_percent);
        let detail = format!("{} used / {} total", fmt_kb(m.used_kb), fmt_kb(m.total_kb));
        let memory = if m.used_percent > self.warn_percent {
            CheckResult::warn("Memory", value, format!("{}; above {:.0}%", detail, self.warn_percent))
        } else {
            CheckResult::pass("Memory", value).with_message(detail)
        };

        let swap = if m.swap_total_kb > 0 {
            CheckResult::info("Swap", format!("{} used / {}", fmt_kb(m.swap_used_kb), fmt_kb(m.swap_total_kb)))
        } else {
            CheckResult::info("Swap", "disabled")
        };
        vec![memory, swap]
    }
}

impl Check for MemoryCheck {
    fn describe(&self) -> String {
        "Memory".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        match fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => self.judge(&parse_meminfo(&meminfo)),
            Err(e) => vec![error_result(self, format!("failed to read /proc/meminfo: {}", e))],
        }
    }
}

fn parse_meminfo(meminfo: &str) -> MemoryInfo {
    let get = |key: &str| -> u64 {
        meminfo.lines()
            .find(|l| l.starts_with(key))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    };

    let total_kb     = get("MemTotal:");
    let available_kb = get("MemAvailable:");
    let used_kb      = total_kb.saturating_sub(available_kb);
    let used_percent = if total_kb > 0 {
        used_kb as f64 / total_kb as f64 * 100.0
    } else { 0.0 };

    let swap_total_kb = get("SwapTotal:");
    let swap_free_kb  = get("SwapFree:");
    let swap_used_kb  = swap_total_kb.saturating_sub(swap_free_kb);

    MemoryInfo {
        total_kb,
        available_kb,
        used_kb,
        used_percent,
        swap_total_kb,
        swap_used_kb,
    }
}

// ── Disk ────────────────────────────────────────────────────────────────────

pub struct DiskCheck {
    host: Arc<dyn ContainerProvider>,
    warn_percent: f64,
    inode_warn_percent: f64,
}

impl DiskCheck {
    pub fn new(host: Arc<dyn ContainerProvider>, warn_percent: f64, inode_warn_percent: f64) -> Self {
        Self { host, warn_percent, inode_warn_percent }
    }

    fn judge(&self, d: &DiskInfo) -> CheckResult {
        let title = format!("Disk {}", d.mount);
        let value = format!("{:.1}%", d.used_percent);
        let detail = format!(
            "{} ({} free), inode {:.1}%",
            d.filesystem,
            fmt_kb(d.available_kb),
            d.inode_used_percent
        );
        if d.used_percent > self.warn_percent {
            CheckResult::warn(title, value, format!("{}; usage above {:.0}%", detail, self.warn_percent))
        } else if d.inode_used_percent > self.inode_warn_percent {
            CheckResult::warn(title, value, format!("{}; inode usage above {:.0}%", detail, self.inode_warn_percent))
        } else {
            CheckResult::pass(title, value).with_message(detail)
        }
    }
}

impl Check for DiskCheck {
    fn describe(&self) -> String {
        "Disk usage".to_string()
    }

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let out = match self.host.execute("", &["df", "-Pk"]) {   // POSIX, kB
            Ok(o) if o.success() => o,
            Ok(o) => return vec![error_result(self, format!("df failed: {}", o.failure_reason()))],
            Err(e) => return vec![error_result(self, format!("df failed: {}", e))],
        };
        if let Err(e) = ctx.store().save_bytes("df.txt", &out.stdout) {
            warn!("saving df.txt: {}", e);
        }

        // inode 失败不影响容量结果
        let inodes = match self.host.execute("", &["df", "-Pi"]) {
            Ok(o) if o.success() => parse_inode_percents(&o.stdout_str()),
            _ => HashMap::new(),
        };

        parse_df(&out.stdout_str(), &inodes)
            .iter()
            .map(|d| self.judge(d))
            .collect()
    }
}

fn parse_df(out: &str, inode_map: &HashMap<String, f64>) -> Vec<DiskInfo> {
    let mut disks = Vec::new();

    for line in out.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 { continue; }

        // 跳过 tmpfs / devtmpfs 等虚拟 fs，只保留真实挂载点
        let fs = parts[0];
        if fs.starts_with("tmpfs") || fs.starts_with("devtmpfs") || fs.starts_with("overlay") {
            continue;
        }

        let mount = parts[5].to_string();
        let inode_used_percent = inode_map.get(&mount).copied().unwrap_or(0.0);

        disks.push(DiskInfo {
            filesystem:   fs.to_string(),
            total_kb:     parts[1].parse().unwrap_or(0),
            used_kb:      parts[2].parse().unwrap_or(0),
            available_kb: parts[3].parse().unwrap_or(0),
            used_percent: parts[4].trim_end_matches('%').parse().unwrap_or(0.0),
            inode_used_percent,
            mount,
        });
    }

    disks
}

fn parse_inode_percents(out: &str) -> HashMap<String, f64> {
    let mut map = HashMap::new();
    for line in out.lines().skip(1) {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 6 {
            // "-" on filesystems without inodes
            let pct: f64 = parts[4].trim_end_matches('%').parse().unwrap_or(0.0);
            map.insert(parts[5].to_string(), pct);
        }
    }
    map
}

// ── cgroup ──────────────────────────────────────────────────────────────────

pub struct CgroupCheck;

impl Check for CgroupCheck {
    fn describe(&self) -> String {
        "cgroup version".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        vec![CheckResult::info("cgroup", detect_cgroup_version(Path::new("/sys/fs/cgroup")))]
    }
}

fn detect_cgroup_version(root: &Path) -> &'static str {
    // cgroup v2: cgroup.controllers 存在
    if root.join("cgroup.controllers").exists() {
        "v2"
    } else if root.join("memory/memory.limit_in_bytes").exists() {
        "v1"
    } else {
        "unknown"
    }
}

// ── Security ────────────────────────────────────────────────────────────────

pub struct SecurityCheck {
    host: Arc<dyn ContainerProvider>,
}

impl SecurityCheck {
    pub fn new(host: Arc<dyn ContainerProvider>) -> Self {
        Self { host }
    }

    fn selinux(&self) -> String {
        // 先查 /sys/fs/selinux/enforce
        if let Ok(val) = fs::read_to_string("/sys/fs/selinux/enforce") {
            return match val.trim() {
                "1" => "enforcing".to_string(),
                "0" => "permissive".to_string(),
                _   => "unknown".to_string(),
            };
        }
        // 再尝试 getenforce 命令
        if let Ok(o) = self.host.execute("", &["getenforce"]) {
            let s = o.stdout_str().trim().to_lowercase();
            if o.success() && !s.is_empty() { return s; }
        }
        "disabled".to_string()
    }
}

impl Check for SecurityCheck {
    fn describe(&self) -> String {
        "Security modules".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let apparmor = if Path::new("/sys/kernel/security/apparmor/profiles").exists()
            || Path::new("/sys/module/apparmor").exists()
        {
            "enabled"
        } else {
            "disabled"
        };

        vec![
            CheckResult::info("SELinux", self.selinux()),
            CheckResult::info("AppArmor", apparmor),
        ]
    }
}

// ── Time ────────────────────────────────────────────────────────────────────

pub struct TimeSyncCheck {
    host: Arc<dyn ContainerProvider>,
}

impl TimeSyncCheck {
    pub fn new(host: Arc<dyn ContainerProvider>) -> Self {
        Self { host }
    }
}

impl Check for TimeSyncCheck {
    fn describe(&self) -> String {
        "Time sync".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %z").to_string();

        // 方法1: timedatectl；方法2: systemd timesync sentinel 文件
        let synced = self
            .host
            .execute("", &["timedatectl"])
            .ok()
            .and_then(|o| ntp_synced(&o.stdout_str()))
            .unwrap_or_else(|| Path::new("/run/systemd/timesync/synchronized").exists());

        let result = if synced {
            CheckResult::pass("NTP synchronized", "yes")
        } else {
            CheckResult::warn("NTP synchronized", "no", "clock skew breaks TLS and etcd leases")
        };
        vec![CheckResult::info("System time", now), result]
    }
}

fn ntp_synced(timedatectl: &str) -> Option<bool> {
    if timedatectl.contains("synchronized: yes") {
        Some(true)
    } else if timedatectl.contains("synchronized: no") {
        Some(false)
    } else {
        None
    }
}

// ── 权限 ────────────────────────────────────────────────────────────────────

pub struct PrivilegeCheck;

impl Check for PrivilegeCheck {
    fn describe(&self) -> String {
        "Privileges".to_string()
    }

    fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
        use nix::unistd::{Uid, User};

        let uid = Uid::effective();
        let name = User::from_uid(uid)
            .ok()
            .flatten()
            .map(|u| u.name)
            .unwrap_or_else(|| uid.to_string());
        let value = format!("{}({})", name, uid);

        if uid.is_root() {
            vec![CheckResult::pass("Effective user", value)]
        } else {
            vec![CheckResult::warn(
                "Effective user",
                value,
                "not root: some host and daemon data may be missing",
            )]
        }
    }
}
