//! Results command - list persisted jobs.

use crate::cli::output::content_preview;
use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::store::SqliteStore;

/// Print all persisted jobs, newest first, with aggregate counts.
pub fn run_results(settings: Settings) -> anyhow::Result<()> {
    preflight::check(Operation::Results)?;

    let store = SqliteStore::new(&settings.database_path())?;

    let jobs = store.list_jobs()?;
    let stats = store.job_stats()?;

    Output::header("Results");
    println!();
    Output::kv("Total", &stats.total_results.to_string());
    Output::kv("Unique titles", &stats.unique_titles.to_string());
    Output::kv("Transcribed", &stats.transcribed_count.to_string());
    Output::kv(
        "Latest",
        stats.latest_date.as_deref().unwrap_or("N/A"),
    );
    println!();

    if jobs.is_empty() {
        Output::info("No results yet. Process a video with: svar process <url> <prompt>");
        return Ok(());
    }

    for job in &jobs {
        let title = job.title.as_deref().unwrap_or("Untitled Video");
        let date = job.created_at.format("%Y-%m-%d %H:%M").to_string();
        Output::job_line(title, &date, &job.prompt);
        println!("    {}", content_preview(&job.answer, 160));
    }

    Ok(())
}
