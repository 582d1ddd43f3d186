//! Completion reporting for parallel maps

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;

/// Callback receiving `(completed, total)` after each completed task
pub type ProgressObserver = Arc<dyn Fn(usize, Option<usize>) + Send + Sync>;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})";

/// Completed-task counter driving an optional bar and observer
///
/// Only the collecting thread touches it, so the count only ever grows by one.
pub(crate) struct Progress {
    bar: Option<ProgressBar>,
    observer: Option<ProgressObserver>,
    completed: usize,
    total: Option<usize>,
}

impl Progress {
    /// The bar is drawn only when asked for and the total is known
    pub(crate) fn new(
        show_bar: bool,
        total: Option<usize>,
        observer: Option<ProgressObserver>,
    ) -> Self {
        let bar = match total {
            Some(len) if show_bar => {
                let bar = ProgressBar::with_draw_target(Some(len as u64), ProgressDrawTarget::stderr());
                if let Ok(style) = ProgressStyle::with_template(BAR_TEMPLATE) {
                    bar.set_style(style.progress_chars("=> "));
                }
                Some(bar)
            }
            _ => None,
        };

        Self {
            bar,
            observer,
            completed: 0,
            total,
        }
    }

    pub(crate) fn inc(&mut self) {
        self.completed += 1;
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        if let Some(observer) = &self.observer {
            observer(self.completed, self.total);
        }
    }

    /// Every task completed
    pub(crate) fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish();
        }
    }

    /// The map failed; leave the bar where it stopped
    pub(crate) fn abandon(&self) {
        if let Some(bar) = &self.bar {
            bar.abandon();
        }
    }

    #[cfg(test)]
    pub(crate) fn completed(&self) -> usize {
        self.completed
    }

    #[cfg(test)]
    pub(crate) fn has_bar(&self) -> bool {
        self.bar.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_bar_needs_known_total() {
        assert!(Progress::new(true, Some(10), None).has_bar());
        assert!(!Progress::new(true, None, None).has_bar());
        assert!(!Progress::new(false, Some(10), None).has_bar());
    }

    #[test]
    fn test_observer_called_per_completion() {
        let last = Arc::new(AtomicUsize::new(0));
        let sink = last.clone();
        let mut progress = Progress::new(
            false,
            None,
            Some(Arc::new(move |done, total| {
                assert!(total.is_none());
                sink.store(done, Ordering::SeqCst);
            })),
        );

        for _ in 0..5 {
            progress.inc();
        }
        progress.finish();

        assert_eq!(progress.completed(), 5);
        assert_eq!(last.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_hidden_bar_tracks_count() {
        let mut progress = Progress::new(true, Some(3), None);
        progress.inc();
        progress.inc();
        progress.abandon();
        assert_eq!(progress.completed(), 2);
    }
}
