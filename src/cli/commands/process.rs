//! Process command - run one pipeline in the foreground.

use crate::cli::preflight::{self, Operation};
use crate::cli::Output;
use crate::config::Settings;
use crate::pipeline::Pipeline;
use crate::task::{snapshot_stream, TaskStatus};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Run the full pipeline for one video and print the transcript and answer.
pub async fn run_process(url: &str, prompt: &str, settings: Settings) -> anyhow::Result<()> {
    preflight::check(Operation::Process)?;

    let pipeline = Arc::new(Pipeline::new(settings)?);
    let task_id = pipeline.clone().submit(url, prompt, None).await?;

    Output::info(&format!("Processing {}", url));

    let pb = Output::pipeline_bar();

    // Poll faster than the server streams do; this is a local terminal
    let mut stream = Box::pin(snapshot_stream(
        pipeline.registry(),
        task_id,
        Duration::from_millis(200),
    ));

    let mut last = None;
    while let Some(snapshot) = stream.next().await {
        pb.set_position(snapshot.progress as u64);
        pb.set_message(snapshot.status.to_string());
        last = Some(snapshot);
    }
    pb.finish_and_clear();

    let final_snapshot = last.expect("progress stream yielded no snapshots");

    match final_snapshot.status {
        TaskStatus::Complete => {
            Output::header("Transcript");
            println!("{}", final_snapshot.transcription.unwrap_or_default());

            Output::header("Answer");
            println!("{}", final_snapshot.response.unwrap_or_default());

            println!();
            Output::success("Done. Result saved.");
            Ok(())
        }
        _ => {
            let message = final_snapshot
                .message
                .unwrap_or_else(|| "unknown error".to_string());
            Output::error(&message);
            Err(anyhow::anyhow!("Processing failed: {}", message))
        }
    }
}
