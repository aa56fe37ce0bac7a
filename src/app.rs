use crate::config;
use crate::engine::{EngineError, SessionEngine, TurnKind};
use crate::provider;
use provider::Transport;

/// Resolve credentials and build the provider transport. A missing API key
/// is a `ContextMissing` condition: the turn (or the process, for a one-shot
/// run) cannot start without it.
pub fn build_transport(
    http: &reqwest::Client,
    cfg: Option<&config::Config>,
    provider_name: &str,
) -> Result<Box<dyn Transport + Send + Sync>, EngineError> {
    match provider_name {
        "openai" => {
            let api_key = std::env::var("CONVERSE_API_KEY")
                .ok()
                .or_else(|| cfg.and_then(|c| c.api_key.clone()))
                .ok_or_else(|| {
                    EngineError::ContextMissing(
                        "no API key found; set CONVERSE_API_KEY or config.toml api_key"
                            .to_string(),
                    )
                })?;

            let api_base = cfg.and_then(|c| c.api_base.as_deref());
            let predict_url = cfg.and_then(|c| c.predict_url.as_deref());

            let t = provider::openai::OpenAiTransport::new(
                http.clone(),
                api_key,
                api_base,
                predict_url,
            )
            .map_err(EngineError::Transport)?;
            Ok(Box::new(t))
        }
        "stub" => Ok(Box::new(provider::stub::StubTransport::with_fragments(&[
            "This is the stub provider. ",
            "Configure an API key to talk to a real one.",
        ]))),
        other => Err(EngineError::ContextMissing(format!(
            "unknown provider: {other}"
        ))),
    }
}

/// Line-based interactive conversation. Each accepted line runs one turn;
/// turns are strictly serialized by the loop itself.
pub async fn run_repl(
    transport: &(dyn Transport + Send + Sync),
    engine: &mut SessionEngine,
    mut kind: TurnKind,
    streaming: bool,
) -> anyhow::Result<()> {
    use std::io::{BufRead, Write};

    let mut out = std::io::stdout();
    writeln!(
        out,
        "converse — model: {} — commands: /quit /new /model <name> /mode <kind>",
        engine.engine_config().model
    )?;

    let stdin = std::io::stdin();
    loop {
        write!(out, "[{}]> ", kind.as_str())?;
        out.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if line == "/quit" {
            break;
        }
        if line == "/new" {
            engine.new_conversation();
            writeln!(out, "(new conversation)")?;
            continue;
        }
        if let Some(rest) = line.strip_prefix("/model ") {
            engine.set_model(rest.trim());
            writeln!(out, "model set to: {}", rest.trim())?;
            continue;
        }
        if let Some(rest) = line.strip_prefix("/mode ") {
            match rest.trim().parse::<TurnKind>() {
                Ok(k) => {
                    kind = k;
                    writeln!(out, "mode set to: {}", kind.as_str())?;
                }
                Err(e) => writeln!(out, "{e:#}")?,
            }
            continue;
        }

        let outcome = engine
            .run_turn(transport, kind, &line, streaming, &mut |t| {
                print!("{t}");
                std::io::stdout().flush().ok();
            })
            .await;

        match outcome {
            Ok(_) => {
                println!();
                if let Some(meta) = engine.last_turn_meta() {
                    tracing::debug!(
                        kind = meta.kind.as_str(),
                        total_tokens = meta.usage.total_tokens,
                        finish_reason = meta.finish_reason.as_deref().unwrap_or(""),
                        "turn complete"
                    );
                }
            }
            Err(e) if e.is_recoverable() => {
                println!();
                eprintln!("error: {e:#} (conversation kept; retry when ready)");
            }
            Err(e) => {
                println!();
                tracing::error!(error = %e, "turn aborted");
                eprintln!("internal error: {e:#}");
            }
        }
    }

    Ok(())
}
