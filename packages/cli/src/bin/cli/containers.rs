// ABOUTME: CLI commands operating on container records and their pods
// ABOUTME: init, ps, logs, rm and prune

use anyhow::{Context, Result};
use chrono::Utc;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use futures::StreamExt;
use kubedock_cli::format::{format_age, format_ports, truncate};
use kubedock_cli::Runtime;
use kubedock_cluster::LogOptions;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub async fn init(runtime: &Runtime) -> Result<()> {
    let networks = runtime.store.list_networks().await?;
    println!(
        "{} Entity store ready at {}",
        "✓".green(),
        runtime.config.database_url.cyan()
    );
    println!(
        "  {} networks, namespace {}",
        networks.len(),
        runtime.config.namespace.cyan()
    );
    Ok(())
}

pub async fn ps(runtime: &Runtime, live: bool) -> Result<()> {
    let containers = runtime.store.list_containers().await?;
    if containers.is_empty() {
        println!("{}", "No containers found".yellow());
        return Ok(());
    }

    let adapter = if live {
        Some(runtime.adapter().await?)
    } else {
        None
    };

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Name", "Image", "Status", "Ports", "Created"]);

    let now = Utc::now();
    for container in &containers {
        let status = match &adapter {
            Some(adapter) => match adapter.get_status(container).await {
                Ok(state) => state.status.as_str().to_string(),
                Err(e) => {
                    debug!("Status lookup for {} failed: {}", container.id, e);
                    "unknown".to_string()
                }
            },
            None => container.phase.as_str().to_string(),
        };
        table.add_row(vec![
            container.short_id().to_string(),
            truncate(&container.name, 25),
            truncate(&container.image, 30),
            status,
            format_ports(&container.mapped_ports),
            format_age(container.created_at, now),
        ]);
    }

    println!("{}", table);
    println!("Total: {} containers", containers.len().to_string().cyan());
    Ok(())
}

pub async fn logs(
    runtime: &Runtime,
    reference: &str,
    follow: bool,
    tail: Option<u32>,
) -> Result<()> {
    let container = runtime.resolve_container(reference).await?;
    let adapter = runtime.adapter().await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let options = LogOptions {
        follow,
        tail_lines: tail,
    };
    let mut lines = adapter
        .logs(&container, options, &cancel)
        .await
        .with_context(|| format!("Failed to read logs of {}", container.short_id()))?;
    while let Some(line) = lines.next().await {
        println!("{}", line?);
    }
    Ok(())
}

pub async fn rm(runtime: &Runtime, reference: &str) -> Result<()> {
    let container = runtime.resolve_container(reference).await?;
    let adapter = runtime.adapter().await?;

    runtime.remove_container(&adapter, &container).await?;

    println!("{} Removed {}", "✓".green(), container.short_id());
    Ok(())
}

pub async fn prune(runtime: &Runtime, dry_run: bool) -> Result<()> {
    let adapter = runtime.adapter().await?;
    let report = adapter.reap_orphans(&runtime.store, dry_run).await?;

    if report.found == 0 {
        println!("{} No orphaned pods found", "✓".green());
        return Ok(());
    }
    if dry_run {
        println!(
            "{} {} orphaned pods would be removed",
            "ℹ".cyan(),
            report.found
        );
        return Ok(());
    }

    println!(
        "{} Removed {} of {} orphaned pods",
        "✓".green(),
        report.removed,
        report.found
    );
    for error in &report.errors {
        eprintln!("  {} {}", "✗".red(), error);
    }
    Ok(())
}
