pub mod maintenance;
pub mod status;
pub mod tokenize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use songbase::{ErrorSink, TaskId, TaskManager};

/// Shows every task as a progress bar on stderr
#[derive(Default)]
pub struct ProgressTaskManager {
    next_id: AtomicU64,
    bars: Mutex<HashMap<TaskId, ProgressBar>>,
}

impl ProgressTaskManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskManager for ProgressTaskManager {
    fn start_task(&self, label: &str) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let sty = ProgressStyle::with_template(
            "{msg:24} [{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");
        let pb = ProgressBar::new(0);
        pb.set_style(sty);
        pb.set_message(label.to_string());

        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(id, pb);
        }
        id
    }

    fn set_task_progress(&self, id: TaskId, current: u64, total: u64) {
        if let Some(pb) = self.bars.lock().ok().and_then(|b| b.get(&id).cloned()) {
            pb.set_length(total);
            pb.set_position(current);
        }
    }

    fn set_task_finished(&self, id: TaskId) {
        if let Some(pb) = self.bars.lock().ok().and_then(|mut b| b.remove(&id)) {
            pb.finish_and_clear();
        }
    }
}

/// Prints user-facing database errors to stderr
pub struct StderrErrorSink;

impl ErrorSink for StderrErrorSink {
    fn add_error(&self, message: &str) {
        eprintln!("{}", message);
    }
}
