//! Terminal output for the whisperq binary: progress bar and colored
//! result lines.
//!
//! Uses `indicatif` for progress and `console` for styling. [`BatchProgress`]
//! follows a batch of jobs from submission to their terminal status.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use whisperq::job::{Job, JobStatus};
use whisperq::orchestrator::Stats;

/// Progress of a batch of transcription jobs.
///
/// Succeeded jobs print in green, failed ones in red and cancelled ones in
/// yellow, above a bar counting finished jobs.
pub struct BatchProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl BatchProgress {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Show how many jobs are queued and running.
    pub fn update(&self, stats: &Stats) {
        self.pb.set_message(format!(
            "{} queued, {} processing",
            stats.jobs.queued, stats.jobs.processing
        ));
    }

    /// A job the service refused at submission.
    pub fn rejected(&self, name: &str, reason: &str) {
        self.pb.inc(1);
        self.pb
            .println(format!("  {} {name}: {reason}", self.red.apply_to("✗")));
    }

    pub fn finished(&self, name: &str, job: &Job) {
        self.pb.inc(1);
        let line = match job.status {
            JobStatus::Succeeded => {
                let secs = job.result().map_or(0.0, |t| t.processing_seconds);
                format!("  {} {name} ({secs:.1}s)", self.green.apply_to("✓"))
            }
            JobStatus::Failed => format!(
                "  {} {name}: {}",
                self.red.apply_to("✗"),
                job.error().unwrap_or_default()
            ),
            status => format!("  {} {name}: {status}", self.yellow.apply_to("•")),
        };
        self.pb.println(line);
    }

    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("↻")));
    }

    pub fn complete(&self, stats: &Stats) {
        self.pb.finish_and_clear();
        let jobs = &stats.jobs;
        let summary = format!(
            "{} succeeded, {} failed, {} cancelled",
            jobs.succeeded, jobs.failed, jobs.cancelled
        );
        let style = if jobs.failed > 0 { &self.red } else { &self.green };
        println!("{}", style.apply_to(summary));
    }
}

/// Pretty JSON for any serializable report.
pub fn print_json<T: serde::Serialize>(title: &str, value: &T) {
    let heading = Style::new().cyan();
    println!("{}", heading.apply_to(format!("─── {title} ───")));
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}
