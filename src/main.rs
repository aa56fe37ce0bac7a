mod app;
mod cli;
mod config;
mod engine;
mod paths;
mod provider;

use anyhow::Context;
use clap::Parser;
use engine::ledger::FileStore;
use engine::{SessionEngine, TurnKind};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = cli::Args::parse();

    // Resolve and create dirs early.
    let config_dir = paths::config_dir()?;
    let _state_dir = paths::state_dir()?;

    let cfg = config::Config::load_optional(config_dir.join("config.toml"))?;
    tracing::debug!(?config_dir, ?cfg, "resolved config");

    let http = reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")?;

    let kind: TurnKind = args.kind.parse()?;

    let provider_name = args
        .provider
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.provider.clone()))
        .unwrap_or_else(|| "openai".to_string());

    let transport = app::build_transport(&http, cfg.as_ref(), &provider_name)?;

    let transcript_dir = match args
        .transcript_dir
        .clone()
        .or_else(|| cfg.as_ref().and_then(|c| c.transcript_dir.clone()))
    {
        Some(dir) => dir,
        None => paths::transcripts_dir()?,
    };

    let train = args.train || cfg.as_ref().and_then(|c| c.train).unwrap_or(false);

    let mut engine = SessionEngine::new(
        cfg.as_ref()
            .map(|c| c.engine_config(args.model.as_deref()))
            .unwrap_or_else(|| {
                config::Config::default().engine_config(args.model.as_deref())
            }),
        cfg.as_ref()
            .map(|c| c.prompt_config())
            .unwrap_or_default(),
        Box::new(FileStore::new(transcript_dir)),
        train,
    );

    let streaming = !args.no_stream;

    if args.interactive {
        return app::run_repl(transport.as_ref(), &mut engine, kind, streaming).await;
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: converse \"Hello\" or converse --interactive");
    }

    let outcome = engine
        .run_turn(transport.as_ref(), kind, &prompt, streaming, &mut |t| {
            print!("{t}");
            use std::io::Write;
            std::io::stdout().flush().ok();
        })
        .await;
    println!();

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context("turn failed")),
    }
}
