mod cli;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    //  Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("THOTH_LOG")
                .unwrap_or_else(|_| EnvFilter::new("warn,thoth_bridge=info,thoth=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Cli::parse();
    let config = cli::load_config(&args.global)?;

    match args.command {
        cli::Commands::Smoke => cli::smoke::execute(config).await,
        cli::Commands::Generate(g) => cli::generate::execute(config, g).await,
        cli::Commands::Models(m) => cli::models::execute(config, m).await,
        cli::Commands::Config(c) => cli::config_cmd::execute(config, c).await,
    }
}
