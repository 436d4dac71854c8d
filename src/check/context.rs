//! 单次报告运行的共享状态

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use crate::check::store::ArtifactStore;

/// Cached answer to "is capability X present".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub error: Option<String>,
}

impl Availability {
    pub fn available() -> Self {
        Self { available: true, error: None }
    }

    pub fn unavailable(error: impl Into<String>) -> Self {
        Self { available: false, error: Some(error.into()) }
    }
}

/// Per-run state handed to every check. The orchestrator owns it; a check
/// borrows it for one `run` call. Only the availability cache is writable.
pub struct RunContext<'a> {
    target: Option<String>,
    time_window: Option<Duration>,
    verbose_errors: bool,
    store: &'a ArtifactStore,
    availability: HashMap<String, Availability>,
}

impl<'a> RunContext<'a> {
    pub fn new(
        store: &'a ArtifactStore,
        target: Option<String>,
        time_window: Option<Duration>,
        verbose_errors: bool,
    ) -> Self {
        Self {
            target,
            time_window,
            verbose_errors,
            store,
            availability: HashMap::new(),
        }
    }

    /// Container id or name the report is about, if any.
    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    pub fn time_window(&self) -> Option<Duration> {
        self.time_window
    }

    pub fn verbose_errors(&self) -> bool {
        self.verbose_errors
    }

    pub fn store(&self) -> &'a ArtifactStore {
        self.store
    }

    pub fn availability(&self, capability: &str) -> Option<&Availability> {
        self.availability.get(capability)
    }

    /// Missing entries count as available.
    pub fn is_available(&self, capability: &str) -> bool {
        self.availability
            .get(capability)
            .map_or(true, |a| a.available)
    }

    pub fn set_availability(&mut self, capability: &str, availability: Availability) {
        debug!(capability, available = availability.available, "availability cached");
        self.availability.insert(capability.to_string(), availability);
    }

    /// Returns the cached entry, running `probe` only the first time.
    pub fn ensure_availability<F>(&mut self, capability: &str, probe: F) -> &Availability
    where
        F: FnOnce() -> Availability,
    {
        if !self.availability.contains_key(capability) {
            let availability = probe();
            self.set_availability(capability, availability);
        }
        &self.availability[capability]
    }
}
