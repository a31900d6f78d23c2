//! Info command implementation.

use super::Context;
use clap::Args;
use vmchain::protocol::summarize;

/// Show details of one snapshot.
#[derive(Args, Debug)]
pub struct InfoCmd {
    /// Instance name.
    pub instance: String,

    /// Snapshot name.
    pub snapshot: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl InfoCmd {
    /// Execute the info command.
    pub async fn run(&self, ctx: &Context) -> vmchain::Result<()> {
        let vm = ctx.open_vm(&self.instance)?;
        let info = vm.snapshot_info(&self.snapshot).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&summarize(&info))?);
            return Ok(());
        }

        let record = &info.record;
        println!("Snapshot:    {}", record.name());
        println!("Instance:    {}", self.instance);
        println!("Index:       {}", record.index());
        println!(
            "Parent:      {}",
            info.parent_name.as_deref().unwrap_or("--")
        );
        println!(
            "Children:    {}",
            if info.children.is_empty() {
                "--".to_string()
            } else {
                info.children.join(", ")
            }
        );
        println!(
            "Created:     {}",
            record.created_at().format("%Y-%m-%d %H:%M:%S UTC")
        );
        println!("CPUs:        {}", record.num_cores());
        println!("Memory:      {}", record.mem_size().human_readable());
        println!("Disk:        {}", record.disk_space().human_readable());
        if !record.mounts().is_empty() {
            println!("Mounts:");
            for (target, mount) in record.mounts() {
                println!("  {} => {}", mount.source_path, target);
            }
        }
        println!(
            "Comment:     {}",
            if record.comment().is_empty() {
                "--"
            } else {
                record.comment()
            }
        );
        if info.is_head {
            println!("Head:        yes");
        }
        Ok(())
    }
}
