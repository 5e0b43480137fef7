use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pilot::results::{JsonFileSink, ResultSink};
use pilot::script::FlowScript;
use pilot::{run_blocking, Config, Pipeline, ScriptedFlow};
use shared_types::RunPayload;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "pilot", about = "Run scripted GUI automation flows on remote devices", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a flow script against a freshly allocated device.
    Run {
        /// Flow script (TOML).
        #[arg(long, value_name = "PATH")]
        script: PathBuf,
        /// Run payload (JSON).
        #[arg(long, value_name = "PATH")]
        payload: PathBuf,
        /// Device group; overrides the script's group.
        #[arg(long)]
        group: Option<String>,
        /// Write the run outcome here as JSON.
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// Parse and validate a flow script without connecting.
    Check {
        #[arg(long, value_name = "PATH")]
        script: PathBuf,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "pilot=info,warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    match std::env::var("PILOT_LOG_FORMAT").as_deref() {
        Ok("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn load_payload(path: &Path) -> anyhow::Result<RunPayload> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read payload {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid payload {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Check { script } => {
            let flow = FlowScript::load(&script)?;
            flow.validate()?;
            println!("{}: {} states, {} steps, ok", flow.name, flow.states.len(), flow.steps.len());
            Ok(())
        }
        Commands::Run {
            script,
            payload,
            group,
            out,
        } => {
            let config = Config::from_env()?;
            let flow = FlowScript::load(&script)?;
            flow.validate()?;
            let payload = load_payload(&payload)?;
            tracing::info!(flow = %flow.name, run_id = %payload.run_id, "Starting run");

            let pipeline = Pipeline::from_config(config, flow.registry()?);
            let automation = Arc::new(ScriptedFlow::new(flow).with_group(group));
            let outcome = run_blocking(&pipeline, automation, payload)?;

            if let Some(path) = out {
                JsonFileSink::new(path).persist(&outcome)?;
            }
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !outcome.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
