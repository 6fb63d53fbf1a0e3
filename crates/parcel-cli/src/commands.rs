use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use parcel_archive::Artifact;
use parcel_service::{ArtifactInfo, ArtifactService, StorageObject};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::*;
use crate::config::resolve_backend;

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    if let Command::Show(args) = &cli.command {
        return cmd_show(&args.file, format);
    }

    let backend = resolve_backend(cli.store.as_deref(), cli.config.as_deref())?;
    debug!(?backend, "opening storage backend");
    let service = ArtifactService::new(backend.open()?);
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::Push(args) => cmd_push(&service, &cancel, args, format).await,
        Command::Pull(args) => cmd_pull(&service, &cancel, args, format).await,
        Command::Ls(args) => cmd_ls(&service, &cancel, args, format).await,
        Command::Rm(args) => cmd_rm(&service, &cancel, args, format).await,
        Command::Show(_) => Ok(()),
    }
}

/// A token that is cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, cancelling");
                token.cancel();
            }
            Err(e) => debug!(error = %e, "ctrl-c handler unavailable"),
        }
    });
    cancel
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_push(
    service: &ArtifactService,
    cancel: &CancellationToken,
    args: PushArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let info = service
        .push_paths(cancel, &args.name, args.paths)
        .await
        .with_context(|| format!("pushing {}", args.name))?;
    match format {
        OutputFormat::Json => print_json(&info),
        OutputFormat::Text => {
            println!(
                "{} Pushed {} ({} files, {})",
                "✓".green().bold(),
                info.name.yellow(),
                info.files,
                human_size(info.size)
            );
            Ok(())
        }
    }
}

async fn cmd_pull(
    service: &ArtifactService,
    cancel: &CancellationToken,
    args: PullArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let info: ArtifactInfo = service
        .pull_to_directory(cancel, &args.name, &args.dest)
        .await
        .with_context(|| format!("pulling {}", args.name))?;
    match format {
        OutputFormat::Json => print_json(&info),
        OutputFormat::Text => {
            println!(
                "{} Pulled {} into {} ({} files)",
                "✓".green().bold(),
                info.name.yellow(),
                args.dest.display().to_string().bold(),
                info.files
            );
            Ok(())
        }
    }
}

async fn cmd_ls(
    service: &ArtifactService,
    cancel: &CancellationToken,
    args: LsArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let objects: Vec<StorageObject> = service.list(cancel, &args.prefix).await?;
    match format {
        OutputFormat::Json => print_json(&objects),
        OutputFormat::Text => {
            if objects.is_empty() {
                println!("No artifacts.");
            }
            for object in &objects {
                println!(
                    "{}  {:>10}  {}",
                    object.last_modified.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                    human_size(object.size),
                    object.path.yellow()
                );
            }
            Ok(())
        }
    }
}

async fn cmd_rm(
    service: &ArtifactService,
    cancel: &CancellationToken,
    args: RmArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let name = parcel_service::canonical_name(&args.name);
    service
        .delete(cancel, &name)
        .await
        .with_context(|| format!("deleting {name}"))?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({ "deleted": name })),
        OutputFormat::Text => {
            println!("{} Deleted {}", "✓".green().bold(), name.yellow());
            Ok(())
        }
    }
}

#[derive(Debug, PartialEq, Eq, Serialize)]
struct FileEntry {
    path: String,
    size: u64,
    mode: String,
}

fn file_entries(artifact: &Artifact) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = artifact
        .list_files()
        .into_iter()
        .filter_map(|path| {
            let file = artifact.tree().file(&path)?;
            Some(FileEntry {
                size: file.size(),
                mode: format!("{:o}", file.mode()),
                path,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn cmd_show(file: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let artifact = Artifact::from_archive_file(file)
        .with_context(|| format!("opening {}", file.display()))?;
    let entries = file_entries(&artifact);
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "name": artifact.name(),
            "files": entries,
        })),
        OutputFormat::Text => {
            println!("{} {} files", artifact.name().bold(), entries.len());
            for entry in &entries {
                println!("  {} {:>10}  {}", entry.mode.dimmed(), human_size(entry.size), entry.path);
            }
            Ok(())
        }
    }
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}
