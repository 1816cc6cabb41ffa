use std::fs;
use std::path::Path;

use anyhow::Context;

use super::CliContext;

pub fn execute(context: &CliContext) -> anyhow::Result<()> {
    cmd_init(&context.root)?;
    println!("chainops has been initialised. You can start it with 'chainops run'");
    Ok(())
}

/// Creates `config/`, `plugins/` and `logs/` under `root` and an empty
/// `config/.env`. Existing files are left alone.
pub fn cmd_init(root: &Path) -> anyhow::Result<()> {
    for d in ["config", "plugins", "logs"] {
        let path = root.join(d);
        fs::create_dir_all(&path).with_context(|| format!("failed to create {}", path.display()))?;
    }

    let conf_path = root.join("config/.env");
    if !conf_path.exists() {
        fs::write(&conf_path, "").with_context(|| format!("failed to write {}", conf_path.display()))?;
        println!("Created {}", conf_path.display());
    } else {
        println!("Skipping {}, already exists", conf_path.display());
    }
    Ok(())
}
