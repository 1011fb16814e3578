//! Throttled progress rendering
//!
//! One [`ProgressReporter`] lives inside the task that owns a job. It keeps
//! the last [`ProgressSnapshot`] so the transfer rate can be derived from the
//! delta between evaluations, and the last emitted text so that unchanged
//! renders are never sent twice.

use bytesize::ByteSize;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(3);

const BAR_WIDTH: usize = 20;

pub const DOWNLOAD_HEADING: &str = "⬇️ Downloading";
pub const UPLOAD_HEADING: &str = "⬆️ Uploading to chat";
pub const FETCH_HEADING: &str = "⬇️ Receiving file";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub at: Instant,
    pub done: u64,
    pub total: Option<u64>,
}

impl ProgressSnapshot {
    /// Bytes per second between this snapshot and a later observation
    pub fn rate_to(&self, done: u64, now: Instant) -> Option<u64> {
        let elapsed = now.checked_duration_since(self.at)?.as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some((done.saturating_sub(self.done) as f64 / elapsed) as u64)
    }
}

#[derive(Debug)]
pub struct ProgressReporter {
    heading: String,
    throttle: Duration,
    last_eval: Option<Instant>,
    last_snapshot: Option<ProgressSnapshot>,
    last_text: Option<String>,
}

impl ProgressReporter {
    pub fn new(heading: impl Into<String>, throttle: Duration) -> Self {
        Self {
            heading: heading.into(),
            throttle,
            last_eval: None,
            last_snapshot: None,
            last_text: None,
        }
    }

    /// Whether the throttle interval has elapsed since the last evaluation
    pub fn due(&self, now: Instant) -> bool {
        match self.last_eval {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.throttle,
        }
    }

    pub fn last_snapshot(&self) -> Option<ProgressSnapshot> {
        self.last_snapshot
    }

    /// Offer a byte count, returning the text to emit if one is due
    pub fn offer(&mut self, now: Instant, done: u64, total: Option<u64>) -> Option<String> {
        if !self.due(now) {
            return None;
        }
        let rate = self.last_snapshot.and_then(|prev| prev.rate_to(done, now));
        self.last_snapshot = Some(ProgressSnapshot { at: now, done, total });
        let text = render(&self.heading, done, total, rate);
        self.accept(now, text)
    }

    /// Offer pre-rendered text, subject to the same throttle and dedup
    pub fn offer_text(&mut self, now: Instant, text: String) -> Option<String> {
        if !self.due(now) {
            return None;
        }
        self.accept(now, text)
    }

    fn accept(&mut self, now: Instant, text: String) -> Option<String> {
        self.last_eval = Some(now);
        if self.last_text.as_deref() == Some(text.as_str()) {
            return None;
        }
        self.last_text = Some(text.clone());
        Some(text)
    }
}

pub fn format_size(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

pub fn progress_bar(percentage: f64) -> String {
    let filled = ((percentage.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f64) as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

fn format_eta(seconds: u64) -> String {
    match seconds {
        s if s >= 3600 => format!("{}h {}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {}s", s / 60, s % 60),
        s => format!("{s}s"),
    }
}

/// Render a progress message
pub fn render(heading: &str, done: u64, total: Option<u64>, rate: Option<u64>) -> String {
    let mut text = format!("{heading}:\n");
    let total = total.filter(|t| *t > 0);

    if let Some(total) = total {
        let percentage = done as f64 * 100.0 / total as f64;
        text.push_str(&format!("[{}] {:.1}%\n", progress_bar(percentage), percentage));
    }

    match rate {
        Some(rate) => text.push_str(&format!("Speed: {}/s\n", format_size(rate))),
        None => text.push_str("Speed: –\n"),
    }

    match total {
        Some(total) => {
            text.push_str(&format!("Done: {} / {}", format_size(done), format_size(total)));
            if let Some(rate) = rate.filter(|r| *r > 0) {
                let eta = total.saturating_sub(done) / rate;
                text.push_str(&format!("\nETA: {}", format_eta(eta)));
            }
        }
        None => text.push_str(&format!("Done: {}", format_size(done))),
    }
    text
}
