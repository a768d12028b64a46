use thoth_bridge::BridgeConfig;

use crate::cli::{ConfigAction, ConfigArgs};

pub async fn execute(mut cfg: BridgeConfig, args: ConfigArgs) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            println!("{}", serde_json::to_string_pretty(&cfg)?);
            let storage = cfg.storage();
            eprintln!(
                "  [file: {} | free space: {}]",
                BridgeConfig::config_file(&storage).display(),
                storage.free_space_string()
            );
        }
        ConfigAction::Set { key, value } => {
            cfg.set_key(&key, &value)?;
            let path = cfg.save()?;
            println!("Configuration updated: {}", path.display());
        }
    }
    Ok(())
}
