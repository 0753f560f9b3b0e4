//! Progress and diagnostics sink handed to the pipeline.
//!
//! The library never configures logging itself; whoever drives a run decides
//! where messages go.

use std::cell::RefCell;
use std::path::Path;

use log::{debug, info, warn};

use crate::pipeline::FileState;

pub trait Reporter {
    fn progress(&self, message: &str);

    fn warn(&self, message: &str);

    fn transition(&self, path: &Path, state: FileState) {
        self.progress(&format!("{}: {:?}", path.display(), state));
    }
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn progress(&self, message: &str) {
        info!("{message}");
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
    }

    fn transition(&self, path: &Path, state: FileState) {
        debug!("{} -> {:?}", path.display(), state);
    }
}

/// Keeps every message in memory, for callers that want to inspect a run.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    pub messages: RefCell<Vec<String>>,
    pub warnings: RefCell<Vec<String>>,
    pub transitions: RefCell<Vec<(String, FileState)>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.warnings.borrow().clone()
    }

    pub fn states_of(&self, file_name: &str) -> Vec<FileState> {
        self.transitions
            .borrow()
            .iter()
            .filter(|(name, _)| name == file_name)
            .map(|(_, state)| *state)
            .collect()
    }
}

impl Reporter for MemoryReporter {
    fn progress(&self, message: &str) {
        self.messages.borrow_mut().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.warnings.borrow_mut().push(message.to_string());
    }

    fn transition(&self, path: &Path, state: FileState) {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.transitions.borrow_mut().push((name, state));
    }
}
