//! The `config` command and the static help screens.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use crate::backends::configuration::{self, CloudflareSection, ConfigFile, DEFAULT_CONFIG_FILE};
use crate::error::{ConfigError, Result};

pub fn print_usage() {
    println!("FlareProx - Simple URL Redirection via Cloudflare Workers");
    println!("\nUsage: flareprox <command> [options]");
    println!("\nCommands:");
    println!("  config    Show configuration help and setup");
    println!("  create    Create new proxy endpoints");
    println!("  list      List all proxy endpoints");
    println!("  test      Test proxy endpoints and show IP addresses");
    println!("  cleanup   Delete all proxy endpoints");
    println!("  help      Show detailed help");
    println!("\nExamples:");
    println!("  flareprox config");
    println!("  flareprox create --count 2");
    println!("  flareprox test");
    println!("  flareprox test --url https://httpbin.org/ip");
}

pub fn print_detailed_help() {
    println!("FlareProx - Detailed Help");
    println!("{}", "=".repeat(30));
    println!("\nFlareProx provides simple URL redirection through Cloudflare Workers.");
    println!("All traffic sent to your FlareProx endpoints will be redirected to");
    println!("the target URL you specify, supporting all HTTP methods.");
    println!("\nFeatures:");
    println!("- Support for all HTTP methods (GET, POST, PUT, DELETE, etc.)");
    println!("- Automatic CORS headers");
    println!("- IP masking through Cloudflare's global network");
    println!("- Simple URL-based redirection");
    println!("- Free tier: 100,000 requests/day");
}

fn prompt_from(reader: &mut impl BufRead, message: &str) -> io::Result<String> {
    print!("{}", message);
    io::stdout().flush()?;

    let mut line = String::new();
    reader.read_line(&mut line)?;
    Ok(line.trim().to_string())
}

pub fn prompt(message: &str) -> io::Result<String> {
    prompt_from(&mut io::stdin().lock(), message)
}

pub fn confirm_from(reader: &mut impl BufRead, message: &str) -> io::Result<bool> {
    Ok(prompt_from(reader, message)?.eq_ignore_ascii_case("y"))
}

/// Asks a yes/no question on a blocking thread so the runtime stays free to
/// notice Ctrl-C while the user is typing.
pub async fn confirm(message: &'static str) -> io::Result<bool> {
    off_runtime(move || confirm_from(&mut io::stdin().lock(), message)).await
}

async fn off_runtime<T, F>(read: F) -> io::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> io::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(read)
        .await
        .map_err(io::Error::other)?
}

fn has_real_credentials(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str::<ConfigFile>(&contents).ok())
        .is_some_and(|file| file.cloudflare.has_real_credentials())
}

/// Walks the user through creating `flareprox.json`.
pub fn run_config_command() -> Result<()> {
    println!("FlareProx Configuration");
    println!("{}", "=".repeat(40));

    let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
    if let Some(home) = home::home_dir() {
        candidates.push(home.join(".flareprox.json"));
    }
    let existing: Vec<PathBuf> = candidates.into_iter().filter(|p| p.exists()).collect();

    if existing.iter().any(|path| has_real_credentials(path)) {
        println!("\nFlareProx is already configured with valid credentials.");
        println!("Configuration files found:");
        for path in &existing {
            println!("  - {}", path.display());
        }
        println!();

        if !confirm_from(&mut io::stdin().lock(), "Do you want to reconfigure? (y/n): ")? {
            return Ok(());
        }
    } else if !existing.is_empty() {
        println!("\nConfiguration files exist but appear to contain placeholder values:");
        for path in &existing {
            println!("  - {}", path.display());
        }
        println!();
    }

    println!("Setting up FlareProx configuration...");
    println!();

    match setup_credentials(Path::new(DEFAULT_CONFIG_FILE)) {
        Ok(()) => {
            println!("\nYou can now use FlareProx:");
            println!("  flareprox create --count 2");
            println!("  flareprox test");
        }
        Err(err) => {
            println!("{}", err);
            println!("\nConfiguration failed. Please try again.");
        }
    }
    Ok(())
}

fn setup_credentials(path: &Path) -> Result<()> {
    println!("Getting Cloudflare Credentials:");
    println!("1. Sign up at https://cloudflare.com");
    println!("2. Go to https://dash.cloudflare.com/profile/api-tokens");
    println!("3. Click Create Token and use the 'Edit Cloudflare Workers' template");
    println!("4. Set the 'account resources' and 'zone resources' to all. Click 'Continue to Summary'");
    println!("5. Click 'Create Token' and copy the token and your Account ID from the dashboard");
    println!();

    let api_token = rpassword::prompt_password("Enter your Cloudflare API token: ")?
        .trim()
        .to_string();
    if api_token.is_empty() {
        return Err(ConfigError::MissingValue("API token").into());
    }

    let account_id = prompt("Enter your Cloudflare Account ID: ")?;
    if account_id.is_empty() {
        return Err(ConfigError::MissingValue("Account ID").into());
    }

    let section = CloudflareSection {
        api_token: Some(api_token),
        account_id: Some(account_id),
        zone_id: None,
    };
    configuration::save(path, &section)?;

    println!("\nConfiguration saved to {}", path.display());
    println!("FlareProx is now configured and ready to use!");
    Ok(())
}
