//! 执行报告：按声明顺序逐个运行检查，打包原始数据，最后清理

use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::check::archive::Archiver;
use crate::check::context::RunContext;
use crate::check::report::{Report, ReportResult, ResultSection};
use crate::check::result::CheckResult;
use crate::check::store::ArtifactStore;

// ── 进度 ────────────────────────────────────────────────────────────────────

pub trait Progress {
    fn start(&mut self, total: usize);
    fn advance(&mut self, describe: &str);
    fn finish(&mut self);
}

/// `[3/16] Disk usage` lines on stderr.
#[derive(Default)]
pub struct StderrProgress {
    done: usize,
    total: usize,
}

impl Progress for StderrProgress {
    fn start(&mut self, total: usize) {
        self.done = 0;
        self.total = total;
    }

    fn advance(&mut self, describe: &str) {
        self.done += 1;
        eprintln!("[{}/{}] {}", self.done, self.total, describe);
    }

    fn finish(&mut self) {
        eprintln!("Done: {} checks", self.done);
    }
}

pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&mut self, _total: usize) {}
    fn advance(&mut self, _describe: &str) {}
    fn finish(&mut self) {}
}

// ── 运行参数 ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub target: Option<String>,
    pub time_window: Option<Duration>,
    pub verbose_errors: bool,
}

// ── Orchestrator ────────────────────────────────────────────────────────────

pub struct Orchestrator<'a> {
    archiver: &'a dyn Archiver,
    progress: &'a mut dyn Progress,
}

/// Removes the raw-data directory when dropped, whatever happened before.
struct CleanupGuard<'s>(&'s ArtifactStore);

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.0.cleanup() {
            warn!("store cleanup failed: {}", e);
        }
    }
}

impl<'a> Orchestrator<'a> {
    pub fn new(archiver: &'a dyn Archiver, progress: &'a mut dyn Progress) -> Self {
        Self { archiver, progress }
    }

    /// Runs every check in declared order. Archival is best effort; the store
    /// is always cleaned up before this returns.
    pub fn run(&mut self, report: &Report, store: &ArtifactStore, options: RunOptions) -> ReportResult {
        let _cleanup = CleanupGuard(store);
        let mut ctx = RunContext::new(
            store,
            options.target,
            options.time_window,
            options.verbose_errors,
        );

        self.progress.start(report.check_count());

        let mut sections = Vec::with_capacity(report.sections.len());
        for section in &report.sections {
            let mut results = Vec::new();
            for check in &section.checks {
                let describe = check.describe();
                self.progress.advance(&describe);
                debug!(check = %describe, "running");
                results.extend(run_isolated(check.as_ref(), &mut ctx));
            }
            sections.push(ResultSection {
                title: section.title.clone(),
                results,
            });
        }

        self.progress.finish();

        if let Err(e) = self.archiver.archive(&report.id, store) {
            error!("archiving {} failed: {}", report.id, e);
        }

        ReportResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            sections,
        }
    }
}

/// A panicking check becomes one `ERROR` result instead of ending the run.
fn run_isolated(check: &dyn crate::check::Check, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
    match panic::catch_unwind(AssertUnwindSafe(|| check.run(ctx))) {
        Ok(results) => results,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(check = %check.describe(), "check panicked: {}", message);
            vec![crate::check::error_result(check, format!("check panicked: {}", message))]
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::report::Section;
    use crate::check::result::Status;
    use crate::check::Check;
    use crate::utils::{DiagError, Result};
    use std::cell::{Cell, RefCell};
    use tempfile::tempdir;

    struct Fixed(&'static str);

    impl Check for Fixed {
        fn describe(&self) -> String {
            self.0.to_string()
        }

        fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
            ctx.store()
                .save_bytes(&format!("{}.txt", self.0), self.0.as_bytes())
                .unwrap();
            vec![CheckResult::pass(self.0, "ok")]
        }
    }

    struct Panics;

    impl Check for Panics {
        fn describe(&self) -> String {
            "Panics".to_string()
        }

        fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
            panic!("index out of range");
        }
    }

    struct Silent;

    impl Check for Silent {
        fn describe(&self) -> String {
            "Silent".to_string()
        }

        fn run(&self, _ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct CountingArchiver {
        calls: Cell<usize>,
        seen: RefCell<Vec<String>>,
        fail: bool,
    }

    impl Archiver for CountingArchiver {
        fn archive(&self, bundle_name: &str, store: &ArtifactStore) -> Result<()> {
            self.calls.set(self.calls.get() + 1);
            for item in store.items()? {
                self.seen.borrow_mut().push(format!("{}/{}", bundle_name, item.info().name));
            }
            if self.fail {
                return Err(DiagError::Archive("disk full".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        seen: Vec<String>,
        total: usize,
        finished: bool,
    }

    impl Progress for RecordingProgress {
        fn start(&mut self, total: usize) {
            self.total = total;
        }

        fn advance(&mut self, describe: &str) {
            self.seen.push(describe.to_string());
        }

        fn finish(&mut self) {
            self.finished = true;
        }
    }

    fn two_sections() -> Report {
        Report {
            id: "r1".to_string(),
            sections: vec![
                Section::new("First").with(Fixed("alpha")),
                Section::new("Second").with(Fixed("beta")),
            ],
        }
    }

    #[test]
    fn end_to_end_two_sections() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("r1");
        let store = ArtifactStore::create(&root).unwrap();
        let archiver = CountingArchiver::default();
        let mut progress = RecordingProgress::default();

        let result = Orchestrator::new(&archiver, &mut progress)
            .run(&two_sections(), &store, RunOptions::default());

        assert_eq!(result.sections.len(), 2);
        assert_eq!(result.sections[0].title, "First");
        assert_eq!(result.sections[0].results, vec![CheckResult::pass("alpha", "ok")]);
        assert_eq!(result.sections[1].title, "Second");
        assert_eq!(result.sections[1].results, vec![CheckResult::pass("beta", "ok")]);
        assert_eq!(result.version, env!("CARGO_PKG_VERSION"));

        assert_eq!(archiver.calls.get(), 1);
        assert_eq!(*archiver.seen.borrow(), vec!["r1/alpha.txt", "r1/beta.txt"]);
        assert!(!root.exists());

        assert_eq!(progress.total, 2);
        assert_eq!(progress.seen, vec!["alpha", "beta"]);
        assert!(progress.finished);
    }

    #[test]
    fn reruns_are_ordered_identically() {
        let dir = tempdir().unwrap();
        let archiver = CountingArchiver::default();
        let report = two_sections();

        let mut runs = Vec::new();
        for _ in 0..2 {
            let store = ArtifactStore::create(dir.path().join("r1")).unwrap();
            let mut progress = NoProgress;
            runs.push(Orchestrator::new(&archiver, &mut progress).run(&report, &store, RunOptions::default()));
        }
        assert_eq!(runs[0], runs[1]);
    }

    #[test]
    fn panicking_check_is_contained() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("r")).unwrap();
        let archiver = CountingArchiver::default();
        let mut progress = NoProgress;
        let report = Report {
            id: "r".to_string(),
            sections: vec![Section::new("S")
                .with(Panics)
                .with(Silent)
                .with(Fixed("after"))],
        };

        let result = Orchestrator::new(&archiver, &mut progress)
            .run(&report, &store, RunOptions::default());

        let results = &result.sections[0].results;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].title, "Panics");
        assert_eq!(results[0].status, Status::Error);
        assert_eq!(results[0].value, "N/A");
        assert_eq!(results[0].message, "check panicked: index out of range");
        assert_eq!(results[1], CheckResult::pass("after", "ok"));
    }

    #[test]
    fn archive_failure_keeps_results_and_still_cleans_up() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("r1");
        let store = ArtifactStore::create(&root).unwrap();
        let archiver = CountingArchiver { fail: true, ..Default::default() };
        let mut progress = NoProgress;

        let result = Orchestrator::new(&archiver, &mut progress)
            .run(&two_sections(), &store, RunOptions::default());

        assert_eq!(result.sections.len(), 2);
        assert_eq!(archiver.calls.get(), 1);
        assert!(!root.exists());
    }

    #[test]
    fn options_reach_the_context() {
        struct Echo;

        impl Check for Echo {
            fn describe(&self) -> String {
                "Echo".to_string()
            }

            fn run(&self, ctx: &mut RunContext<'_>) -> Vec<CheckResult> {
                vec![CheckResult::info(
                    ctx.target().unwrap_or("-"),
                    format!("{:?}/{}", ctx.time_window(), ctx.verbose_errors()),
                )]
            }
        }

        let dir = tempdir().unwrap();
        let store = ArtifactStore::create(dir.path().join("r")).unwrap();
        let archiver = CountingArchiver::default();
        let mut progress = NoProgress;
        let report = Report {
            id: "r".to_string(),
            sections: vec![Section::new("S").with(Echo)],
        };
        let options = RunOptions {
            target: Some("web".to_string()),
            time_window: Some(Duration::from_secs(60)),
            verbose_errors: true,
        };

        let result = Orchestrator::new(&archiver, &mut progress).run(&report, &store, options);
        assert_eq!(result.sections[0].results, vec![CheckResult::info("web", "Some(60s)/true")]);
    }
}
