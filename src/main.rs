use anyhow::Result;
use clap::Parser;
use lifai_rs::{
    cli::{Cli, Command},
    controller::{ControllerHandle, TriggerStyle},
    logging::PipelineFormatter,
    prompts::PromptRegistry,
    ConfigManager, LifaiApp,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lifai_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().event_format(PipelineFormatter::new()))
        .init();

    let config_manager = match cli.config.as_deref() {
        Some(path) => ConfigManager::load_from(path)?,
        None => ConfigManager::load()?,
    };

    if let Some(Command::Prompts) = cli.command {
        let registry = PromptRegistry::from_overrides(&config_manager.get().prompts);
        for name in registry.names() {
            println!("{}", name);
        }
        return Ok(());
    }

    info!("🚀 lifai-rs starting up!");
    info!("{}", "=".repeat(50));

    config_manager.start_watching();
    let config = config_manager.get();
    info!("✅ Configuration loaded from {}", config_manager.path().display());
    info!("   Model: {}", config.ollama.model);
    info!("   Trigger style: {:?}", config.trigger.style);
    match config.shortcut() {
        Some(shortcut) => info!("   Shortcut: {}", shortcut),
        None => info!("   Shortcut: disabled"),
    }

    let mut app = LifaiApp::new(config_manager)?;
    app.set_prompt_override(cli.prompt);
    info!("   Default prompt: {}", app.default_prompt());

    if cli.test {
        spawn_test_console(app.controller(), app.default_prompt().to_string());
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!("Failed to set up SIGTERM handler: {}", err);
                if ctrl_c.await.is_ok() {
                    info!("Received SIGINT (Ctrl+C)");
                }
                let _ = shutdown_tx.send(());
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C)");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    });

    tokio::select! {
        result = app.run() => {
            if let Err(e) = result {
                info!("App error: {}", e);
            }
        }
        _ = shutdown_rx => {
            info!("Shutdown signal received");
        }
    }

    info!("🛑 Shutting down lifai-rs...");
    app.cleanup();
    info!("✅ Shutdown complete");

    Ok(())
}

/// Reads trigger commands from stdin so the pipeline can be driven without
/// the global shortcut.
fn spawn_test_console(controller: ControllerHandle, default_prompt: String) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    info!("🧪 Test Mode");
    info!("   Enter         enhance the current selection with '{}'", default_prompt);
    info!("   <prompt name> enhance the current selection with that prompt");
    info!("   arm           wait for the next drag-select, then enhance it");
    info!("   cancel        abandon the pending or running enhancement");

    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading input: {}", e);
                    break;
                }
            };

            let accepted = match line.trim() {
                "" => controller.trigger(default_prompt.clone(), TriggerStyle::Immediate),
                "arm" => controller.trigger(default_prompt.clone(), TriggerStyle::Armed),
                "cancel" => controller.cancel(),
                name => controller.trigger(name, TriggerStyle::Immediate),
            };
            if !accepted {
                warn!("Controller is busy; command dropped");
            }
        }
    });
}
