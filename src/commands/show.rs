//! Show command - displays information.

use anyhow::Result;

use kdf::config::Config;
use kdf::process;

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => {
            config.print();
            println!();
            println!("Host tools:");
            for tool in [config.qemu.as_str(), config.virtiofsd.as_str(), "nix-build", "modinfo", "xz"] {
                let state = if process::exists(tool) { "FOUND" } else { "NOT FOUND" };
                println!("  {}: {}", tool, state);
            }
        }
    }
    Ok(())
}
