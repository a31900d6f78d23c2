//! Availability zone commands.

use super::Context;
use clap::{Args, Subcommand};

/// Manage availability zones
#[derive(Subcommand, Debug)]
pub enum ZoneCmd {
    /// List zones
    #[command(alias = "list")]
    Ls(ZoneLsCmd),
    /// Make a zone available again
    Up(ZoneUpCmd),
    /// Make a zone unavailable
    Down(ZoneDownCmd),
}

impl ZoneCmd {
    pub async fn run(self, ctx: &Context) -> vmchain::Result<()> {
        match self {
            ZoneCmd::Ls(cmd) => cmd.run(ctx),
            ZoneCmd::Up(cmd) => set_zone(ctx, &cmd.name, true).await,
            ZoneCmd::Down(cmd) => set_zone(ctx, &cmd.name, false).await,
        }
    }
}

async fn set_zone(ctx: &Context, name: &str, available: bool) -> vmchain::Result<()> {
    let zone = ctx.open_zone(name)?;
    let label = if available { "available" } else { "unavailable" };
    if zone.is_available() == available {
        println!("Zone '{}' is already {}", name, label);
        return Ok(());
    }
    zone.set_available(available).await?;
    println!(
        "Zone '{}' is now {} ({} instances)",
        name,
        label,
        zone.vm_names().len()
    );
    Ok(())
}

/// List availability zones
#[derive(Args, Debug)]
pub struct ZoneLsCmd {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

impl ZoneLsCmd {
    pub fn run(self, ctx: &Context) -> vmchain::Result<()> {
        let mut rows = Vec::new();
        for zone in ctx.zones.zones() {
            let members = ctx.store.zone_members(zone.name())?;
            rows.push((zone, members));
        }

        if self.json {
            let json: Vec<_> = rows
                .iter()
                .map(|(zone, members)| {
                    serde_json::json!({
                        "name": zone.name(),
                        "subnet": zone.subnet(),
                        "available": zone.is_available(),
                        "instances": members,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&json)?);
            return Ok(());
        }

        println!("{:<12} {:<18} {:<12} {}", "ZONE", "SUBNET", "AVAILABLE", "INSTANCES");
        println!("{}", "-".repeat(60));
        for (zone, members) in rows {
            let subnet = if zone.subnet().is_empty() { "--" } else { zone.subnet() };
            println!(
                "{:<12} {:<18} {:<12} {}",
                zone.name(),
                subnet,
                if zone.is_available() { "yes" } else { "no" },
                members.len()
            );
        }
        Ok(())
    }
}

/// Make a zone available again
#[derive(Args, Debug)]
pub struct ZoneUpCmd {
    /// Zone name
    pub name: String,
}

/// Make a zone unavailable
#[derive(Args, Debug)]
pub struct ZoneDownCmd {
    /// Zone name
    pub name: String,
}
