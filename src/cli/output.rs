//! CLI output formatting utilities.

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// Output helper for CLI formatting.
pub struct Output;

impl Output {
    /// Print an info message.
    pub fn info(msg: &str) {
        println!("{} {}", style(">>").cyan().bold(), msg);
    }

    /// Print a success message.
    pub fn success(msg: &str) {
        println!("{} {}", style(">>").green().bold(), msg);
    }

    /// Print a warning message.
    pub fn warning(msg: &str) {
        eprintln!("{} {}", style(">>").yellow().bold(), msg);
    }

    /// Print an error message.
    pub fn error(msg: &str) {
        eprintln!("{} {}", style(">>").red().bold(), msg);
    }

    /// Print a header.
    pub fn header(msg: &str) {
        println!("\n{}", style(msg).bold().underlined());
    }

    /// Print a key-value pair.
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", style(key).dim(), value);
    }

    /// Print a persisted job line.
    pub fn job_line(title: &str, date: &str, prompt: &str) {
        println!(
            "  {} {} ({})",
            style("*").cyan(),
            style(title).bold(),
            style(date).dim()
        );
        println!("    {}", content_preview(prompt, 100));
    }

    /// Create a percentage progress bar for pipeline runs.
    pub fn pipeline_bar() -> ProgressBar {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("  {spinner:.green} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
                .unwrap()
                .progress_chars("█▓░"),
        );
        pb
    }
}

/// Truncate content to a preview length on a single line.
pub fn content_preview(content: &str, max_len: usize) -> String {
    let flat = content.replace('\n', " ");
    if flat.len() <= max_len {
        flat
    } else {
        let mut end = max_len;
        while !flat.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &flat[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_preview() {
        assert_eq!(content_preview("short", 10), "short");
        assert_eq!(content_preview("multi\nline", 20), "multi line");
        assert_eq!(content_preview("abcdefghij", 5), "abcde...");
    }
}
