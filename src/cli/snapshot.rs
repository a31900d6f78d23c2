//! Snapshot command implementation.

use super::Context;
use clap::Args;

/// Capture a snapshot of a stopped instance.
#[derive(Args, Debug)]
pub struct SnapshotCmd {
    /// Instance name.
    pub instance: String,

    /// Snapshot name (generated when omitted).
    #[arg(short, long, default_value = "")]
    pub name: String,

    /// Free-form comment.
    #[arg(short, long, default_value = "")]
    pub comment: String,
}

impl SnapshotCmd {
    /// Execute the snapshot command.
    pub async fn run(&self, ctx: &Context) -> vmchain::Result<()> {
        let vm = ctx.open_vm(&self.instance)?;
        let record = vm.take_snapshot(&self.name, &self.comment).await?;
        println!(
            "Snapshot taken: {}.{} (index {})",
            self.instance,
            record.name(),
            record.index()
        );
        Ok(())
    }
}
