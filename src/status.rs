//! Operator-facing status output and run statistics
//!
//! Diagnostic messages are categorized by severity; the category prefix is
//! part of the observable contract, the coloring is not:
//!
//! - `[*]` informational (cyan)
//! - `[!]` warning (red)
//! - `[-]` debug (magenta)
//! - `[$]` success (green)

use bytesize::ByteSize;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub fn print_info(text: &str) {
    println!("{} {}", "[*]".cyan().bold(), text);
}

pub fn print_warn(text: &str) {
    eprintln!("{} {}", "[!]".red().bold(), text);
}

pub fn print_debug(text: &str) {
    println!("{} {}", "[-]".magenta().bold(), text);
}

pub fn print_success(text: &str) {
    println!("{} {}", "[$]".green().bold(), text);
}

/// Byte-based progress bar for file scans and sorts.
pub fn create_bytes_progress_bar(total_bytes: u64, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(total_bytes);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] [{bar:40.cyan/dim}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .unwrap()
            .progress_chars("█▓░"),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Spinner for work without a known total.
pub fn create_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} [{elapsed_precise}] {msg}")
            .unwrap(),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Counters shared across the workers of one curation run.
#[derive(Debug)]
pub struct CurationStats {
    pub lines: AtomicU64,
    pub unique: AtomicU64,
    pub duplicates: AtomicU64,
    pub malformed: AtomicU64,
    pub bytes: AtomicU64,
    start: Instant,
}

impl CurationStats {
    pub fn new() -> Self {
        Self {
            lines: AtomicU64::new(0),
            unique: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    pub fn add_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unique(&self) {
        self.unique.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn print_summary(&self) {
        let lines = self.lines.load(Ordering::Relaxed);
        let unique = self.unique.load(Ordering::Relaxed);
        let duplicates = self.duplicates.load(Ordering::Relaxed);
        let malformed = self.malformed.load(Ordering::Relaxed);
        let bytes = self.bytes.load(Ordering::Relaxed);
        let elapsed = self.elapsed();

        print_info(&format!(
            "{} lines in ({}), {} unique, {} duplicates, {} malformed",
            format_number(lines),
            ByteSize(bytes),
            format_number(unique),
            format_number(duplicates),
            format_number(malformed),
        ));
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            print_info(&format!(
                "{:.1?} elapsed, {:.0} lines/sec, {}/sec",
                elapsed,
                lines as f64 / secs,
                ByteSize((bytes as f64 / secs) as u64),
            ));
        }
    }
}

impl Default for CurationStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousand separators.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result
}
