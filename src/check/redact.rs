//! 脱敏：保存原始数据前遮盖常见的密钥格式

use regex::Regex;

use crate::utils::{DiagError, Result};

pub trait Redact: Send + Sync {
    fn redact(&self, text: &str) -> String;
}

const MASK: &str = "[REDACTED]";

/// Built-in patterns. Capture group 1, when present, is kept.
const BUILTIN_PATTERNS: &[&str] = &[
    // KEY=value / "key": "value" style secrets
    r#"(?i)((?:password|passwd|secret|token|api[_-]?key|access[_-]?key)[A-Za-z0-9_]*"?\s*[:=]\s*"?)[^\s",]+"#,
    r"(?i)(authorization:\s*bearer\s+)[A-Za-z0-9\-._~+/]+=*",
    r"(AKIA)[0-9A-Z]{16}",
    r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----",
];

pub struct PatternRedactor {
    patterns: Vec<Regex>,
}

impl PatternRedactor {
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(BUILTIN_PATTERNS.len() + extra.len());
        for p in BUILTIN_PATTERNS.iter().copied().chain(extra.iter().map(String::as_str)) {
            let re = Regex::new(p)
                .map_err(|e| DiagError::Config(format!("redact pattern {:?}: {}", p, e)))?;
            patterns.push(re);
        }
        Ok(Self { patterns })
    }
}

impl Redact for PatternRedactor {
    fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re
                .replace_all(&out, |caps: &regex::Captures| {
                    let keep = caps.get(1).map_or("", |m| m.as_str());
                    format!("{}{}", keep, MASK)
                })
                .into_owned();
        }
        out
    }
}
