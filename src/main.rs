use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use physics_tool_client::config::{load_config, load_default_config, ClientConfig};
use physics_tool_client::logging;
use physics_tool_client::tool_client::ToolClient;

#[derive(Parser)]
#[command(name = "physics-tools")]
#[command(about = "Call tools on a particle-physics tool server", version)]
struct Args {
    /// Config file (default: $PHYSICS_TOOLS_CONFIG, then tool-client.yaml
    /// searched upward from the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write logs to the data directory instead of stderr
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Invoke a tool and print its normalized result
    Call {
        /// Tool name, e.g. search_particle
        tool: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Connect and print the session status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_file {
        let path = logging::init_tracing(None).context("failed to open log file")?;
        eprintln!("logging to {}", path.display());
    } else {
        logging::init_stderr();
    }

    let config = resolve_config(args.config.as_deref())?;
    let client = ToolClient::new(config).context("invalid tool client configuration")?;

    let failed = match args.command {
        Command::Call { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let result = client.call_tool(&tool, arguments).await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            result.get("error").is_some()
        }
        Command::Status => {
            let connected = client.connect().await;
            println!("{}", serde_json::to_string_pretty(&client.status().await)?);
            if let Err(e) = &connected {
                eprintln!("connect failed: {e}");
            }
            connected.is_err()
        }
    };

    client.disconnect().await;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn resolve_config(explicit: Option<&std::path::Path>) -> Result<ClientConfig> {
    match explicit {
        Some(path) => load_config(path).with_context(|| format!("failed to load {}", path.display())),
        None => load_default_config().context("failed to load tool client config"),
    }
}
