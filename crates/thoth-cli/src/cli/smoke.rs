use thoth_bridge::{BridgeConfig, Runtime};

pub async fn execute(config: BridgeConfig) -> anyhow::Result<()> {
    let mut runtime = Runtime::new(config);
    let model = runtime.resolve_model()?;
    println!("Model: {} ({})", model.path().display(), thoth_bridge::human_size(model.size()));

    tokio::task::spawn_blocking(move || runtime.smoke_test()).await??;
    println!("Smoke test passed.");
    Ok(())
}
