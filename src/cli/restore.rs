//! Restore command implementation.

use super::Context;
use clap::Args;

/// Restore an instance to a snapshot.
#[derive(Args, Debug)]
pub struct RestoreCmd {
    /// Instance name.
    pub instance: String,

    /// Snapshot to restore.
    pub snapshot: String,

    /// Discard the current state instead of saving it as a snapshot first.
    #[arg(long)]
    pub destructive: bool,
}

impl RestoreCmd {
    /// Execute the restore command.
    pub async fn run(&self, ctx: &Context) -> vmchain::Result<()> {
        let vm = ctx.open_vm(&self.instance)?;
        let before = vm.snapshot_count().await;
        vm.restore_snapshot(&self.snapshot, self.destructive).await?;

        if vm.snapshot_count().await > before {
            println!("Saved the previous state as a snapshot");
        }
        println!("Restored {}.{}", self.instance, self.snapshot);
        Ok(())
    }
}
