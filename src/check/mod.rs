pub mod archive;
pub mod container;
pub mod context;
pub mod engine;
pub mod etcd;
pub mod host;
pub mod output;
pub mod provider;
pub mod redact;
pub mod report;
pub mod result;
pub mod runner;
pub mod store;

use context::RunContext;
use result::CheckResult;

/// One unit of diagnostic work.
///
/// `run` returns only when all of its results are final. An empty list means
/// "not applicable"; a failure is a single `ERROR` result built with
/// [`error_result`].
pub trait Check: Send + Sync {
    /// Stable label used in progress output and as the title of error results.
    fn describe(&self) -> String;

    fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult>;
}

pub fn error_result(check: &dyn Check, message: impl Into<String>) -> CheckResult {
    CheckResult::error(check.describe(), message)
}

/// Quiet-unless-verbose: the whole outcome of a check that could not apply.
pub fn not_applicable(ctx: &RunContext<'_>, check: &dyn Check, reason: impl Into<String>) -> Vec<CheckResult> {
    if ctx.verbose_errors() {
        vec![error_result(check, reason)]
    } else {
        Vec::new()
    }
}

/// Returns `Some(results)` when `capability` is cached as unavailable and the
/// check must stop; `None` when it may proceed.
pub fn capability_gate(
    ctx: &RunContext<'_>,
    check: &dyn Check,
    capability: &str,
) -> Option<Vec<CheckResult>> {
    if ctx.is_available(capability) {
        return None;
    }
    let reason = match ctx.availability(capability).and_then(|a| a.error.as_deref()) {
        Some(e) => format!("{} is not available: {}", capability, e),
        None => format!("{} is not available", capability),
    };
    Some(not_applicable(ctx, check, reason))
}

#[cfg(test)]
mod tests {
    use super::context::Availability;
    use super::result::Status;
    use super::store::ArtifactStore;
    use super::*;
    use tempfile::tempdir;

    struct Probe;

    impl Check for Probe {
        fn describe(&self) -> String {
            "Probe".to_string()
        }

        fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
            if let Some(stop) = capability_gate(ctx, self, "docker") {
                return stop;
            }
            vec![CheckResult::pass("Probe", "ok")]
        }
    }

    #[test]
    fn gate_is_open_when_cache_is_empty() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("raw")).unwrap();
        let mut ctx = RunContext::new(&store, None, None, false);

        assert_eq!(Probe.run(&mut ctx), vec![CheckResult::pass("Probe", "ok")]);
    }

    #[test]
    fn unavailable_capability_is_silent_unless_verbose() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("raw")).unwrap();

        let mut quiet = RunContext::new(&store, None, None, false);
        quiet.set_availability("docker", Availability::unavailable("not installed"));
        assert!(Probe.run(&mut quiet).is_empty());

        let mut verbose = RunContext::new(&store, None, None, true);
        verbose.set_availability("docker", Availability::unavailable("not installed"));
        let results = Probe.run(&mut verbose);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, Status::Error);
        assert_eq!(results[0].title, "Probe");
        assert_eq!(results[0].value, "N/A");
        assert_eq!(results[0].message, "docker is not available: not installed");
    }
}
