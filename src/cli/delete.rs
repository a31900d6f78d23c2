//! Delete command implementation.

use super::Context;
use clap::Args;

/// Delete a snapshot.
#[derive(Args, Debug)]
pub struct DeleteCmd {
    /// Instance name.
    pub instance: String,

    /// Snapshot to delete.
    pub snapshot: String,

    /// Delete without confirmation.
    #[arg(short, long)]
    pub force: bool,
}

impl DeleteCmd {
    /// Execute the delete command.
    pub async fn run(&self, ctx: &Context) -> vmchain::Result<()> {
        let vm = ctx.open_vm(&self.instance)?;
        let info = vm.snapshot_info(&self.snapshot).await?;

        if !self.force && !info.children.is_empty() {
            eprint!(
                "Snapshot '{}' has {} child snapshot(s) that will be rebased. Continue? [y/N] ",
                self.snapshot,
                info.children.len()
            );
            let mut input = String::new();
            let confirmed = std::io::stdin().read_line(&mut input).is_ok()
                && matches!(input.trim().to_lowercase().as_str(), "y" | "yes");
            if !confirmed {
                println!("Cancelled");
                return Ok(());
            }
        }

        vm.delete_snapshot(&self.snapshot).await?;
        println!("Deleted snapshot {}.{}", self.instance, self.snapshot);
        Ok(())
    }
}
