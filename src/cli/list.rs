//! List command implementation.

use super::Context;
use clap::Args;
use vmchain::protocol::summarize;

/// List instances, or the snapshots of one instance.
#[derive(Args, Debug)]
pub struct ListCmd {
    /// Instance whose snapshots to list.
    pub instance: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    /// Check that recorded disk parents match the disks.
    #[arg(long)]
    pub verify: bool,
}

impl ListCmd {
    /// Execute the list command.
    pub async fn run(&self, ctx: &Context) -> vmchain::Result<()> {
        match &self.instance {
            Some(name) => self.list_snapshots(ctx, name).await,
            None => self.list_instances(ctx).await,
        }
    }

    async fn list_instances(&self, ctx: &Context) -> vmchain::Result<()> {
        let names = ctx.store.list()?;
        if self.json {
            let mut rows = Vec::with_capacity(names.len());
            for name in &names {
                let record = ctx.store.load(name)?;
                rows.push(serde_json::json!({
                    "name": record.name,
                    "state": record.state.to_string(),
                    "cpus": record.specs.num_cores,
                    "memory": record.specs.mem_size.in_bytes(),
                    "base_image": record.base_image,
                    "zone": record.zone,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        if names.is_empty() {
            println!("No instances found");
            return Ok(());
        }
        println!(
            "{:<20} {:<18} {:<6} {:<10} {:<9} {}",
            "NAME", "STATE", "CPUS", "MEMORY", "SNAPSHOTS", "ZONE"
        );
        println!("{}", "-".repeat(74));
        for name in names {
            let record = ctx.store.load(&name)?;
            let snapshots = ctx.open_vm(&name)?.snapshot_count().await;
            println!(
                "{:<20} {:<18} {:<6} {:<10} {:<9} {}",
                truncate(&name, 18),
                record.state.to_string(),
                record.specs.num_cores,
                record.specs.mem_size.human_readable(),
                snapshots,
                record.zone.as_deref().unwrap_or("--")
            );
        }
        Ok(())
    }

    async fn list_snapshots(&self, ctx: &Context, name: &str) -> vmchain::Result<()> {
        let vm = ctx.open_vm(name)?;
        if self.verify {
            vm.verify_snapshots().await?;
        }
        let snapshots = vm.snapshots().await;

        if self.json {
            let summaries: Vec<_> = snapshots.iter().map(summarize).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            return Ok(());
        }
        if snapshots.is_empty() {
            println!("No snapshots found for '{}'", name);
            return Ok(());
        }

        println!("{:<20} {:<20} {:<20} {}", "SNAPSHOT", "PARENT", "CREATED", "COMMENT");
        println!("{}", "-".repeat(80));
        for info in snapshots {
            let record = &info.record;
            let marker = if info.is_head { "*" } else { "" };
            println!(
                "{:<20} {:<20} {:<20} {}",
                format!("{}{}", truncate(record.name(), 18), marker),
                info.parent_name.as_deref().unwrap_or("--"),
                record.created_at().format("%Y-%m-%d %H:%M").to_string(),
                truncate(record.comment(), 40)
            );
        }
        Ok(())
    }
}

/// Truncate a string to max length, adding "..." if truncated.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
