pub mod cloudflare;
pub mod configuration;

use serde::{Deserialize, Serialize};

/// Every worker this tool deploys is named with this prefix; anything else
/// in the account is left alone.
pub const WORKER_PREFIX: &str = "flareprox-";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
    #[serde(default = "unknown")]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

fn unknown() -> String {
    "unknown".to_string()
}

pub fn worker_url(name: &str, subdomain: &str) -> String {
    format!("https://{}.{}.workers.dev", name, subdomain)
}
