// ABOUTME: CLI command listing networks from the entity store
// ABOUTME: Shows each network with its member containers

use anyhow::Result;
use chrono::Utc;
use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use kubedock_cli::format::format_age;
use kubedock_cli::Runtime;

pub async fn list(runtime: &Runtime) -> Result<()> {
    let networks = runtime.store.list_networks().await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Name", "Members", "Created"]);

    let now = Utc::now();
    for network in &networks {
        let members = if network.members.is_empty() {
            "-".to_string()
        } else {
            network
                .members
                .iter()
                .map(|id| &id[..id.len().min(12)])
                .collect::<Vec<_>>()
                .join(", ")
        };
        let name = if network.is_default() {
            format!("{} (default)", network.name)
        } else {
            network.name.clone()
        };
        table.add_row(vec![
            network.id[..network.id.len().min(12)].to_string(),
            name,
            members,
            format_age(network.created_at, now),
        ]);
    }

    println!("{}", table);
    println!("Total: {} networks", networks.len().to_string().cyan());
    Ok(())
}
