use thoth_bridge::{BridgeConfig, ModelFile, human_size};

use crate::cli::{ModelsAction, ModelsArgs};

pub async fn execute(config: BridgeConfig, args: ModelsArgs) -> anyhow::Result<()> {
    match args.action {
        ModelsAction::List { dir } => {
            let storage = config.storage();
            let search_dir = dir.unwrap_or_else(|| storage.models_dir());
            if !search_dir.is_dir() {
                anyhow::bail!("{} is not a directory", search_dir.display());
            }

            let entries = gguf_parser::list_models(&search_dir)?;
            if entries.is_empty() {
                println!("No GGUF models found in {}", search_dir.display());
                return Ok(());
            }

            println!(
                "{:<32} {:<12} {:<12} {:<10} {:<8}",
                "Id", "Arch", "Quant", "Size", "Ctx"
            );
            println!("{}", "-".repeat(78));
            for entry in &entries {
                let arch = entry.architecture.as_deref().unwrap_or("-");
                let quant = entry.quantization.as_deref().unwrap_or("-");
                let ctx = entry
                    .context_length
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".into());
                let shards = if entry.shards.len() > 1 {
                    format!(" ({} parts)", entry.shards.len())
                } else {
                    String::new()
                };
                println!(
                    "{:<32} {:<12} {:<12} {:<10} {:<8}{shards}",
                    entry.id,
                    arch,
                    quant,
                    human_size(entry.file_size),
                    ctx
                );
            }
            println!(
                "\n{} model(s) found. Free space: {}",
                entries.len(),
                storage.free_space_string()
            );
        }
        ModelsAction::Info { path } => {
            ModelFile::validate(&path, None)?;
            let summary = gguf_parser::quick_scan(&path)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
