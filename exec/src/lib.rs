mod cli;
mod event_processor;

use std::io::IsTerminal;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

pub use cli::Cli;
use event_processor::EventProcessor;
use tabulon_core::bootstrap;
use tabulon_core::config::Config;
use tabulon_core::surface::Surface;
use tabulon_protocol::AgentEvent;
use tracing_subscriber::EnvFilter;

fn init_logging(stderr_with_ansi: bool) {
    let default_level = "error";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_ansi(stderr_with_ansi)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_prompt(prompt: Option<String>) -> anyhow::Result<String> {
    match prompt {
        Some(p) if p != "-" => Ok(p),
        maybe_dash => {
            let force_stdin = matches!(maybe_dash.as_deref(), Some("-"));
            if std::io::stdin().is_terminal() && !force_stdin {
                anyhow::bail!(
                    "No prompt provided. Either specify one as an argument or pipe it into stdin."
                );
            }
            if !force_stdin {
                eprintln!("Reading prompt from stdin...");
            }
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            if buffer.trim().is_empty() {
                anyhow::bail!("No prompt provided via stdin.");
            }
            Ok(buffer)
        }
    }
}

pub async fn run_main(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        dataset_id,
        thread_id,
        last_message_file,
        color,
        prompt,
    } = cli;

    let prompt = read_prompt(prompt)?;

    let (stdout_with_ansi, stderr_with_ansi) = match color {
        cli::Color::Always => (true, true),
        cli::Color::Never => (false, false),
        cli::Color::Auto => (
            std::io::stdout().is_terminal(),
            std::io::stderr().is_terminal(),
        ),
    };
    init_logging(stderr_with_ansi);

    let config = Config::from_env()?;
    let deps = bootstrap::build_deps(config).await?;
    let surface = Surface::new(Arc::new(deps));

    let mut processor = EventProcessor::create_with_ansi(stdout_with_ansi);
    let rx = surface.stream(dataset_id, prompt, thread_id);

    let mut last_assistant_message: Option<String> = None;
    while let Ok(event) = rx.recv().await {
        if let AgentEvent::Result { response } = &event {
            last_assistant_message = Some(response.assistant_message.clone());
        }
        let done = processor.process_event(event);
        if done {
            break;
        }
    }

    handle_last_message(last_assistant_message, last_message_file.as_deref())?;
    Ok(())
}

fn handle_last_message(
    last_assistant_message: Option<String>,
    last_message_file: Option<&Path>,
) -> std::io::Result<()> {
    match (last_assistant_message, last_message_file) {
        (Some(message), Some(path)) => std::fs::write(path, message)?,
        (None, Some(path)) => {
            eprintln!("Warning: no assistant message to write to {}", path.to_string_lossy());
        }
        (_, None) => {}
    }
    Ok(())
}
