use std::time::Instant;

use crate::download::segment::{OutcomeKind, Progress};

/// Prints one line per finished segment.
pub struct ConsoleProgress {
    started: Instant,
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn report(&self, progress: Progress) {
        println!("{}", self.line(progress, self.started.elapsed().as_secs_f64()));
    }

    fn line(&self, progress: Progress, elapsed: f64) -> String {
        let Progress {
            completed,
            total,
            sequence_index,
            outcome,
            downloaded_secs,
            total_secs,
        } = progress;

        let speed = if elapsed > 0.0 {
            completed as f64 / elapsed
        } else {
            0.0
        };
        let eta = if speed > 0.0 {
            (total - completed) as f64 / speed
        } else {
            0.0
        };

        let mut line = String::new();
        if total_secs > 0.0 {
            line.push_str(&format!(
                "{} / {} ({:6.2}%)\t ",
                format_time(downloaded_secs),
                format_time(total_secs),
                (downloaded_secs / total_secs) * 100.0
            ));
        }
        line.push_str(&format!(
            "{:width$} / {:width$} segs ({:6.2}%)\t {:.2} segs/s\t ETA {}\t #{}",
            completed,
            total,
            (completed as f64 / total.max(1) as f64) * 100.0,
            speed,
            format_time(eta),
            sequence_index,
            width = total.to_string().len()
        ));
        if outcome == OutcomeKind::Failed {
            line.push_str(" FAILED");
        }
        line
    }
}

fn format_time(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let seconds = seconds % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}
