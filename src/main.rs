use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use resup::prelude::*;
use tracing_subscriber::EnvFilter;

/// Demo driver: uploads the given files against a resup-compatible server
/// and prints progress until every transfer settles.
///
///   resup <base-url> <file> [<file>...]
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(base_url) = args.next() else {
        bail!("usage: resup <base-url> <file> [<file>...]");
    };
    let paths: Vec<PathBuf> = args.map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("usage: resup <base-url> <file> [<file>...]");
    }

    let config = UploaderConfig::for_base_url(&base_url);
    let api = Arc::new(HttpTransferApi::new(config.clone())?);
    let store = Arc::new(SqliteStore::open(&PathBuf::from("resup-state.db")).await?);
    let scheduler = Scheduler::new(
        api,
        store,
        TransferLimits::default(),
        config.retry_policy(),
    )
    .await;

    let runner = tokio::spawn(Arc::clone(&scheduler).run());

    for path in &paths {
        let blob = Arc::new(FileBlob::open(path).with_context(|| format!("open {path:?}"))?);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());
        let modified = std::fs::metadata(path)?
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let id = scheduler
            .submit(blob, name.clone(), "application/octet-stream", modified)
            .await;
        println!("queued {name} as {id}");
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let tasks = scheduler.snapshot().await;
        let mut settled = 0;
        for task in &tasks {
            let speed = scheduler.task_speed(&task.id) / (1024.0 * 1024.0);
            println!(
                "{:<24} {:?} {:>5.1}% {:>6.2} MiB/s",
                task.identity.name, task.status, task.progress_percent, speed
            );
            match task.status {
                TaskStatus::Done | TaskStatus::InstantComplete => settled += 1,
                TaskStatus::Failed(_) => {
                    settled += 1;
                    if let Some(error) = &task.error {
                        eprintln!("  {}: {error}", task.identity.name);
                    }
                }
                _ => {}
            }
        }
        if settled == tasks.len() {
            break;
        }
    }

    runner.abort();
    let _ = runner.await;
    Ok(())
}
