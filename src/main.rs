use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use reqwest::Method;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flareprox::backends::configuration;
use flareprox::endpoints::{FlareProx, DEFAULT_TARGET, ENDPOINTS_FILE};
use flareprox::error::{ConfigError, Result};
use flareprox::setup;

#[derive(Parser)]
#[command(
    name = "flareprox",
    about = "FlareProx - Simple URL Redirection via Cloudflare Workers",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(value_enum, help = "Command to execute")]
    command: Option<Command>,
    #[arg(long, help = "Target URL")]
    url: Option<String>,
    #[arg(long, default_value = "GET", value_parser = parse_method, help = "HTTP method")]
    method: Method,
    #[arg(long, default_value_t = 1, help = "Number of proxies to create")]
    count: u32,
    #[arg(long, help = "Configuration file path")]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Command {
    Config,
    Create,
    List,
    Test,
    Cleanup,
    Help,
}

fn parse_method(value: &str) -> std::result::Result<Method, String> {
    Method::from_bytes(value.to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method: {}", value))
}

async fn run(flareprox: &FlareProx, cli: &Cli, command: Command) -> Result<()> {
    match command {
        Command::Create => {
            flareprox.create_proxies(cli.count).await?;
        }
        Command::List => {
            flareprox.list_proxies().await;
        }
        Command::Test => {
            let target = cli.url.as_deref().unwrap_or(DEFAULT_TARGET);
            flareprox.test_proxies(target, &cli.method).await;
        }
        Command::Cleanup => {
            if setup::confirm("Delete ALL FlareProx endpoints? (y/N): ").await? {
                flareprox.cleanup_all().await?;
            } else {
                println!("Cleanup cancelled.");
            }
        }
        Command::Config | Command::Help => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flareprox=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let command = match cli.command {
        None => {
            setup::print_usage();
            return;
        }
        Some(Command::Config) => {
            if let Err(err) = setup::run_config_command() {
                println!("Configuration error: {}", err);
            }
            return;
        }
        Some(Command::Help) => {
            setup::print_detailed_help();
            return;
        }
        Some(command) => command,
    };

    let config = match configuration::load(cli.config.as_deref()) {
        Ok(config) => Some(config),
        Err(ConfigError::NotConfigured) => None,
        Err(err) => {
            println!("Configuration error: {}", err);
            return;
        }
    };

    let flareprox = FlareProx::new(config.as_ref(), ENDPOINTS_FILE);
    if !flareprox.is_configured() {
        println!("FlareProx not configured. Use 'flareprox config' for setup.");
        return;
    }

    tokio::select! {
        biased;
        _ = tokio::signal::ctrl_c() => {
            println!("\nOperation cancelled by user");
            // A prompt still waiting on stdin would hold up runtime shutdown.
            std::process::exit(130);
        }
        result = run(&flareprox, &cli, command) => {
            if let Err(err) = result {
                println!("Error: {}", err);
            }
        }
    }
}
