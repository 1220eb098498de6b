use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_FILE: &str = "flareprox.json";
const LEGACY_CONFIG_FILE: &str = "cloudproxy.json";
const HOME_CONFIG_FILE: &str = ".flareprox.json";

const PLACEHOLDER_TOKEN: &str = "your_cloudflare_api_token_here";
const PLACEHOLDER_ACCOUNT: &str = "your_cloudflare_account_id_here";

/// On-disk shape of `flareprox.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub cloudflare: CloudflareSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudflareSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<String>,
}

impl CloudflareSection {
    pub fn is_empty(&self) -> bool {
        self.api_token.is_none() && self.account_id.is_none() && self.zone_id.is_none()
    }

    /// True when both credentials are filled in with something other than
    /// the sample placeholders.
    pub fn has_real_credentials(&self) -> bool {
        let token = self.api_token.as_deref().unwrap_or_default().trim();
        let account = self.account_id.as_deref().unwrap_or_default().trim();

        token != PLACEHOLDER_TOKEN
            && account != PLACEHOLDER_ACCOUNT
            && token.len() > 10
            && account.len() > 10
    }
}

/// Credentials resolved from the first usable config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub api_token: String,
    pub account_id: String,
    pub zone_id: Option<String>,
}

impl TryFrom<CloudflareSection> for Config {
    type Error = ConfigError;

    fn try_from(section: CloudflareSection) -> Result<Self, Self::Error> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let api_token = non_empty(section.api_token).ok_or(ConfigError::NotConfigured)?;
        let account_id = non_empty(section.account_id).ok_or(ConfigError::NotConfigured)?;

        Ok(Self {
            api_token,
            account_id,
            zone_id: non_empty(section.zone_id),
        })
    }
}

/// A config file that was found and read, waiting to be resolved.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    pub contents: String,
}

impl ConfigSource {
    fn parse(&self) -> Result<ConfigFile, ConfigError> {
        serde_json::from_str(&self.contents).map_err(|source| ConfigError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

/// The well-known locations, most specific first.
pub fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![
        PathBuf::from(DEFAULT_CONFIG_FILE),
        PathBuf::from(LEGACY_CONFIG_FILE),
    ];
    if let Some(home) = home::home_dir() {
        paths.push(home.join(HOME_CONFIG_FILE));
    }
    paths
}

/// Reads the explicit file if it exists, then the first default location
/// that exists. Unreadable files are logged and skipped.
pub fn discover(explicit: Option<&Path>, defaults: &[PathBuf]) -> Vec<ConfigSource> {
    let explicit = explicit.filter(|path| path.exists());
    let first_default = defaults.iter().find(|path| path.exists());

    explicit
        .into_iter()
        .chain(first_default.map(PathBuf::as_path))
        .filter_map(|path| match read_source(path) {
            Ok(source) => Some(source),
            Err(err) => {
                tracing::warn!(error = %err, "Could not load config file");
                None
            }
        })
        .collect()
}

fn read_source(path: &Path) -> Result<ConfigSource, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(ConfigSource {
        path: path.to_path_buf(),
        contents,
    })
}

/// The first source with a non-empty `cloudflare` section wins; later
/// sources only fill in when everything before them was empty.
pub fn resolve(sources: &[ConfigSource]) -> Result<Config, ConfigError> {
    let mut section = CloudflareSection::default();

    for source in sources {
        match source.parse() {
            Ok(file) if section.is_empty() => section = file.cloudflare,
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "Could not load config file"),
        }
    }

    Config::try_from(section)
}

pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    resolve(&discover(explicit, &default_paths()))
}

pub fn save(path: &Path, section: &CloudflareSection) -> Result<(), ConfigError> {
    let file = ConfigFile {
        cloudflare: section.clone(),
    };
    let write_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    let json = serde_json::to_string_pretty(&file)
        .map_err(|err| write_err(std::io::Error::other(err)))?;
    std::fs::write(path, json).map_err(write_err)
}
