use std::io::{self, Write};

use llama_core::{ChannelSink, GenerateEvent, GenerateOutcome};
use thoth_bridge::{BridgeConfig, GenerationParameters, Runtime};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::GenerateArgs;

pub async fn execute(config: BridgeConfig, args: GenerateArgs) -> anyhow::Result<()> {
    let mut params = GenerationParameters::from_config(&config);
    params.max_tokens = args.max_tokens;
    if let Some(temp) = args.temp {
        params.temperature = temp;
    }
    params.system_prompt = args.system;
    params.stop = args.stop;

    let mut runtime = Runtime::new(config);
    let model = runtime.resolve_model()?;
    info!(model = %model.path().display(), "Loading model…");

    if !args.stream {
        let prompt = args.prompt;
        let result =
            tokio::task::spawn_blocking(move || runtime.generate(&prompt, &params)).await??;
        println!("{}", result.text);
        eprintln!(
            "  [{} | prompt: {} tok, gen: {} tok, {:.1} tok/s]",
            result.finish_reason,
            result.prompt_tokens,
            result.tokens_generated,
            result.tokens_per_second()
        );
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel(64);
    let prompt = args.prompt;
    tokio::task::spawn_blocking(move || {
        let mut sink = ChannelSink(tx);
        let last = match runtime.generate_stream(&prompt, &params, &mut sink) {
            Ok(result) => GenerateEvent::Done(GenerateOutcome {
                finish_reason: result.finish_reason,
                prompt_tokens: result.prompt_tokens,
                completion_tokens: result.tokens_generated,
            }),
            Err(e) => GenerateEvent::Error(e.to_string()),
        };
        let _ = sink.0.blocking_send(last);
    });

    let mut stdout = io::stdout();
    while let Some(event) = rx.recv().await {
        match event {
            GenerateEvent::Token(piece) => {
                print!("{piece}");
                stdout.flush()?;
            }
            GenerateEvent::Done(outcome) => {
                println!();
                eprintln!(
                    "  [{} | prompt: {} tok, gen: {} tok]",
                    outcome.finish_reason, outcome.prompt_tokens, outcome.completion_tokens
                );
                break;
            }
            GenerateEvent::Error(e) => {
                println!();
                anyhow::bail!(e);
            }
        }
    }
    Ok(())
}
