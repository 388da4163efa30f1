//! Terminal output helpers for the `updraft` binary

use colored::Colorize;
use std::io::Write;

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    pub fn info(message: &str) {
        println!("{} {}", "ℹ".blue().bold(), message);
    }

    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Rewrite the current line with a transfer bar
    pub fn transfer(done: u64, total: Option<u64>) {
        let line = match total.filter(|t| *t > 0) {
            Some(total) => {
                let filled = (done.min(total) * 20 / total) as usize;
                format!(
                    "[{}{}] {} / {}",
                    "█".repeat(filled).bright_green(),
                    "░".repeat(20 - filled).bright_black(),
                    format_size(done),
                    format_size(total)
                )
            }
            None => format!("{} received", format_size(done)),
        };
        print!("\r  {} {}", "▶".bright_blue(), line);
        std::io::stdout().flush().ok();
    }

    pub fn end_line() {
        println!();
    }
}

/// Human-readable byte count
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// First 16 hex characters, grouped for reading aloud
pub fn short_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .take(16)
        .collect::<Vec<_>>()
        .chunks(4)
        .map(|c| c.iter().collect::<String>())
        .collect::<Vec<_>>()
        .join(":")
}
