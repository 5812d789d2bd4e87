use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use marketsync::entity::marketplace::Marketplace;
use marketsync::sync::SyncProgress;

/// Per-run counters shown next to the bar.
struct RunState {
    bar: ProgressBar,
    ok: usize,
    failed: usize,
}

impl RunState {
    fn summary(&self) -> String {
        if self.failed > 0 {
            format!("{} ok, {} failed", self.ok, self.failed)
        } else {
            format!("{} ok", self.ok)
        }
    }
}

/// Interactive progress reporter using indicatif.
pub struct InteractiveReporter {
    multi: MultiProgress,
    runs: Mutex<HashMap<Marketplace, RunState>>,
}

impl InteractiveReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, event: SyncProgress) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());

        match event {
            SyncProgress::Started {
                marketplace,
                kind,
                requested,
            } => {
                let bar = self.multi.add(ProgressBar::new(requested as u64));
                bar.set_style(Self::bar_style());
                bar.set_prefix(format!("{:12}", marketplace.to_string()));
                bar.set_message(format!("{} sync starting...", kind));
                runs.insert(
                    marketplace,
                    RunState {
                        bar,
                        ok: 0,
                        failed: 0,
                    },
                );
            }

            SyncProgress::TasksPolled {
                marketplace,
                synced,
                failed,
                still_pending,
            } => {
                if synced + failed + still_pending > 0 {
                    drop(runs);
                    self.multi
                        .println(format!(
                            "{}: open tasks {} synced, {} failed, {} still pending",
                            marketplace, synced, failed, still_pending
                        ))
                        .ok();
                }
            }

            SyncProgress::Batch {
                marketplace,
                index,
                size,
            } => {
                if let Some(run) = runs.get(&marketplace) {
                    run.bar.set_message(format!(
                        "batch {} ({} entities), {}",
                        index + 1,
                        size,
                        run.summary()
                    ));
                }
            }

            SyncProgress::Retrying {
                marketplace,
                items,
                attempt,
                delay,
            } => {
                if let Some(run) = runs.get(&marketplace) {
                    run.bar.set_message(format!(
                        "⏳ retry {} for {} entities in {:.1}s",
                        attempt,
                        items,
                        delay.as_secs_f64()
                    ));
                }
            }

            SyncProgress::EntityDone {
                marketplace,
                success,
                ..
            } => {
                if let Some(run) = runs.get_mut(&marketplace) {
                    if success {
                        run.ok += 1;
                    } else {
                        run.failed += 1;
                    }
                    run.bar.inc(1);
                    run.bar.set_message(run.summary());
                }
            }

            SyncProgress::Cancelled {
                marketplace,
                skipped,
            } => {
                if let Some(run) = runs.get(&marketplace) {
                    run.bar.abandon_with_message(format!(
                        "✗ cancelled, {} skipped ({})",
                        skipped,
                        run.summary()
                    ));
                }
            }

            SyncProgress::Finished {
                marketplace,
                synced,
                errors,
                ..
            } => {
                if let Some(run) = runs.get(&marketplace)
                    && !run.bar.is_finished()
                {
                    let msg = if errors > 0 {
                        format!("✓ {} synced, {} errors", synced, errors)
                    } else {
                        format!("✓ {} synced", synced)
                    };
                    run.bar.finish_with_message(msg);
                }
            }

            _ => {}
        }
    }

    pub fn finish(&self) {
        let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        for run in runs.values() {
            if !run.bar.is_finished() {
                run.bar.finish();
            }
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{prefix:.bold.cyan} [{bar:40.cyan/blue}] {pos:>4}/{len:4} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░")
    }
}

impl Default for InteractiveReporter {
    fn default() -> Self {
        Self::new()
    }
}
