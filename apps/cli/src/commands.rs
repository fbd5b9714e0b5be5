//! CLI command implementations

use crate::output::{format_bytes, format_speed, print_json};
use crate::progress::DownloadProgress;
use crate::OutputFormat;
use anyhow::{anyhow, bail, Result};
use console::style;
use grabbit_core::GrabbitCore;
use grabbit_types::{DownloadStatus, DownloadTask};
use std::time::Duration;

/// Polling interval for the progress display
const POLL_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// Download Commands
// ============================================================================

pub async fn get_downloads(
    core: &GrabbitCore,
    urls: Vec<String>,
    alias: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    if alias.is_some() && urls.len() > 1 {
        bail!("--alias can only be used with a single URL");
    }

    let mut ids = Vec::new();
    for url in &urls {
        match core.start_download(url, alias.as_deref()).await {
            Ok(id) => ids.push(id),
            Err(e) => eprintln!("{} {}: {}", style("✗").red().bold(), url, e),
        }
    }
    if ids.is_empty() {
        bail!("no downloads were started");
    }

    let tasks = wait_for_tasks(core, &ids, format == OutputFormat::Human).await;

    match format {
        OutputFormat::Json => print_json(&tasks)?,
        OutputFormat::Table => print_task_table(&tasks),
        OutputFormat::Human => print_summary(&tasks),
    }

    let failed = tasks
        .iter()
        .filter(|t| t.status == DownloadStatus::Failed)
        .count();
    if failed > 0 {
        return Err(anyhow!("{} download(s) failed", failed));
    }
    Ok(())
}

/// Poll the registry until every task is terminal; Ctrl-C cancels them all
async fn wait_for_tasks(core: &GrabbitCore, ids: &[String], show_bars: bool) -> Vec<DownloadTask> {
    let mut bars = show_bars.then(DownloadProgress::new);
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut interrupted = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("{} Cancelling downloads...", style("!").yellow().bold());
                for id in ids {
                    core.cancel(id);
                }
            }
        }

        let tasks: Vec<DownloadTask> = ids.iter().filter_map(|id| core.get(id)).collect();
        if let Some(bars) = bars.as_mut() {
            bars.update(&tasks);
        }
        if tasks.iter().all(DownloadTask::is_terminal) {
            return tasks;
        }
    }
}

fn print_summary(tasks: &[DownloadTask]) {
    println!();
    for task in tasks {
        let icon = match task.status {
            DownloadStatus::Completed => style("✓").green(),
            DownloadStatus::Duplicate => style("=").yellow(),
            DownloadStatus::Failed => style("✗").red(),
            DownloadStatus::Cancelled => style("○").dim(),
            _ => style("·").dim(),
        };

        println!(
            "{} {} {} [{}]",
            icon,
            style(&task.display_name).bold(),
            style(format_bytes(task.downloaded)).dim(),
            style(task.status).dim()
        );
        if task.status == DownloadStatus::Completed && task.alias.is_some() {
            println!("    Stored as: {}", task.id);
        }
        if let Some(ref error) = task.error {
            println!("    Error: {}", style(error).red());
        }
    }

    let completed = tasks
        .iter()
        .filter(|t| t.status == DownloadStatus::Completed)
        .count();
    println!();
    println!(
        "{} of {} download(s) completed",
        style(completed).bold(),
        tasks.len()
    );
}

fn print_task_table(tasks: &[DownloadTask]) {
    use tabled::{Table, Tabled};

    #[derive(Tabled)]
    struct TaskRow {
        name: String,
        status: String,
        size: String,
        speed: String,
        error: String,
    }

    let rows: Vec<TaskRow> = tasks
        .iter()
        .map(|t| TaskRow {
            name: t.id.clone(),
            status: t.status.to_string(),
            size: format_bytes(t.downloaded),
            speed: format_speed(t.speed),
            error: t.error.clone().unwrap_or_default(),
        })
        .collect();

    println!("{}", Table::new(rows));
}

// ============================================================================
// Stored File Commands
// ============================================================================

pub async fn list_files(core: &GrabbitCore, format: OutputFormat) -> Result<()> {
    let files = core.stored_files().await?;

    match format {
        OutputFormat::Json => print_json(&files)?,
        OutputFormat::Table => {
            use tabled::{Table, Tabled};

            #[derive(Tabled)]
            struct FileRow {
                name: String,
                size: String,
                modified: String,
            }

            let rows: Vec<FileRow> = files
                .iter()
                .map(|f| FileRow {
                    name: f.name.clone(),
                    size: format_bytes(f.size),
                    modified: f
                        .modified
                        .map(|m| m.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_default(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            if files.is_empty() {
                println!("{}", style("No stored files").dim());
                return Ok(());
            }

            for file in &files {
                println!(
                    "{} {}",
                    style(&file.name).bold(),
                    style(format_bytes(file.size)).dim()
                );
            }
            println!();
            println!("{} file(s) in {}", style(files.len()).bold(), core.settings().storage_dir.display());
        }
    }

    Ok(())
}

pub async fn rename_file(core: &GrabbitCore, from: &str, to: &str, format: OutputFormat) -> Result<()> {
    let to = core.rename(from, to).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "from": from, "to": to }))?,
        _ => println!(
            "{} Renamed {} to {}",
            style("✓").green().bold(),
            style(from).cyan(),
            style(&to).cyan()
        ),
    }
    Ok(())
}

pub async fn remove_file(core: &GrabbitCore, name: &str, format: OutputFormat) -> Result<()> {
    core.delete(name).await?;

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "deleted": name }))?,
        _ => println!("{} Deleted {}", style("✓").green().bold(), style(name).cyan()),
    }
    Ok(())
}
