//! Local endpoint cache and the user-facing operations built on top of the
//! Cloudflare backend.
//!
//! The cache file is derived state: whenever the provider can be reached it is
//! overwritten with the provider's listing, and losing it only means the next
//! sync rebuilds it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};

use crate::backends::cloudflare::{self, CleanupReport, CloudflareManager, TestResult};
use crate::backends::configuration::Config;
use crate::backends::Endpoint;
use crate::error::{ConfigError, Result};

pub const ENDPOINTS_FILE: &str = "flareprox_endpoints.json";
pub const DEFAULT_TARGET: &str = "https://ifconfig.me/ip";

const IFCONFIG_TARGET: &str = "https://ifconfig.me/ip";
const HTTPBIN_TARGET: &str = "https://httpbin.org/ip";

const MAX_ATTEMPTS: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
pub struct CreateSummary {
    pub created: Vec<Endpoint>,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct TestReport {
    pub results: BTreeMap<String, TestResult>,
    pub successful: usize,
    pub unique_ips: BTreeSet<String>,
}

pub struct FlareProx {
    client: Client,
    cloudflare: Option<CloudflareManager>,
    endpoints_file: PathBuf,
}

impl FlareProx {
    pub fn new(config: Option<&Config>, endpoints_file: impl Into<PathBuf>) -> Self {
        let client = Client::new();
        let cloudflare = config.map(|config| CloudflareManager::new(client.clone(), config));
        Self::with_manager(client, cloudflare, endpoints_file)
    }

    pub fn with_manager(
        client: Client,
        cloudflare: Option<CloudflareManager>,
        endpoints_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            client,
            cloudflare,
            endpoints_file: endpoints_file.into(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.cloudflare.is_some()
    }

    pub fn endpoints_file(&self) -> &Path {
        &self.endpoints_file
    }

    fn manager(&self) -> Result<&CloudflareManager> {
        self.cloudflare
            .as_ref()
            .ok_or_else(|| ConfigError::NotConfigured.into())
    }

    /// Reads the cache. A missing or unreadable file is an empty list.
    pub fn load_endpoints(&self) -> Vec<Endpoint> {
        let contents = match std::fs::read_to_string(&self.endpoints_file) {
            Ok(contents) => contents,
            Err(_) => return Vec::new(),
        };

        serde_json::from_str(&contents).unwrap_or_else(|err| {
            tracing::debug!(
                path = %self.endpoints_file.display(),
                error = %err,
                "Ignoring unreadable endpoint cache"
            );
            Vec::new()
        })
    }

    pub fn save_endpoints(&self, endpoints: &[Endpoint]) {
        let written = serde_json::to_string_pretty(endpoints)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(&self.endpoints_file, json));

        if let Err(err) = written {
            tracing::warn!(
                path = %self.endpoints_file.display(),
                error = %err,
                "Could not save endpoints"
            );
        }
    }

    /// Replaces the cache with the provider's listing, or falls back to the
    /// cached list when the provider cannot be reached.
    pub async fn sync_endpoints(&self) -> Vec<Endpoint> {
        let Some(cloudflare) = &self.cloudflare else {
            return Vec::new();
        };

        match cloudflare.list_deployments().await {
            Ok(endpoints) => {
                self.save_endpoints(&endpoints);
                endpoints
            }
            Err(err) => {
                tracing::warn!(error = %err, "Could not sync endpoints, using cached list");
                self.load_endpoints()
            }
        }
    }

    pub async fn create_proxies(&self, count: u32) -> Result<CreateSummary> {
        let cloudflare = self.manager()?;
        let plural = if count == 1 { "" } else { "s" };
        println!("\nCreating {} FlareProx endpoint{}...", count, plural);

        let mut summary = CreateSummary::default();
        for i in 1..=count {
            match cloudflare.create_deployment(None).await {
                Ok(endpoint) => {
                    println!("  [{}/{}] {} -> {}", i, count, endpoint.name, endpoint.url);
                    summary.created.push(endpoint);
                }
                Err(err) => {
                    println!("  Failed to create endpoint {}: {}", i, err);
                    summary.failed += 1;
                }
            }
        }

        self.sync_endpoints().await;

        println!(
            "\nCreated: {}, Failed: {}",
            summary.created.len(),
            summary.failed
        );
        Ok(summary)
    }

    pub async fn list_proxies(&self) -> Vec<Endpoint> {
        let endpoints = self.sync_endpoints().await;

        if endpoints.is_empty() {
            println!("No FlareProx endpoints found");
            println!("Create some with: flareprox create");
            return endpoints;
        }

        let rule = "-".repeat(80);
        println!("\nFlareProx Endpoints ({} total):", endpoints.len());
        println!("{}", rule);
        println!("{:<35} {:<40} {:<8}", "Name", "URL", "Status");
        println!("{}", rule);
        for endpoint in &endpoints {
            println!("{:<35} {:<40} {:<8}", endpoint.name, endpoint.url, "Active");
        }

        endpoints
    }

    /// Sends one request through every cached endpoint. Uses the cache as is,
    /// without syncing first.
    pub async fn test_proxies(&self, target_url: &str, method: &Method) -> TestReport {
        let endpoints = self.load_endpoints();
        let mut report = TestReport::default();

        if endpoints.is_empty() {
            println!("No proxy endpoints available. Create some first.");
            return report;
        }

        println!(
            "Testing {} FlareProx endpoint(s) with {}",
            endpoints.len(),
            target_url
        );

        for endpoint in &endpoints {
            println!("\nTesting endpoint: {}", endpoint.name);
            let result = self
                .test_endpoint(endpoint, target_url, method, &mut report.unique_ips)
                .await;
            if result.success {
                report.successful += 1;
            }
            report.results.insert(endpoint.name.clone(), result);
        }

        print_test_summary(&report, endpoints.len());
        report
    }

    async fn test_endpoint(
        &self,
        endpoint: &Endpoint,
        target_url: &str,
        method: &Method,
        unique_ips: &mut BTreeSet<String>,
    ) -> TestResult {
        let mut last = None;

        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RETRY_DELAY).await;
                println!("   Retry {}...", attempt);
            }
            let final_attempt = attempt + 1 == MAX_ATTEMPTS;

            match cloudflare::probe(&self.client, &endpoint.url, target_url, method).await {
                Ok(response) if response.status == StatusCode::OK => {
                    println!("Request successful! Status: {}", response.status.as_u16());
                    match summarize_body(target_url, &response.body) {
                        BodySummary::OriginIp(ip) => {
                            println!("   Origin IP: {}", ip);
                            unique_ips.insert(ip);
                        }
                        BodySummary::Excerpt(text) => println!("   Response: {}...", text),
                        BodySummary::Length(length) => {
                            println!("   Response Length: {} bytes", length)
                        }
                    }
                    return TestResult::from_response(&response, true);
                }
                Ok(response) if response.status == StatusCode::SERVICE_UNAVAILABLE => {
                    println!("   Server unavailable (503) - target service may be overloaded");
                    last = Some(TestResult::from_response(&response, false));
                }
                Ok(response) => {
                    println!("Request failed! Status: {}", response.status.as_u16());
                    return TestResult::from_response(&response, false);
                }
                Err(err) if !final_attempt => {
                    tracing::debug!(endpoint = %endpoint.name, error = %err, "Probe failed");
                    println!("   Connection error, retrying...");
                }
                Err(err) => {
                    println!("Request failed: {}", err);
                    return TestResult::failed(err.to_string());
                }
            }
        }

        last.unwrap_or_else(|| TestResult::failed("Unknown error"))
    }

    /// Deletes every prefixed worker, then drops the cache file.
    pub async fn cleanup_all(&self) -> Result<Option<CleanupReport>> {
        let cloudflare = self.manager()?;
        println!("\nCleaning up FlareProx endpoints...");

        let report = match cloudflare.cleanup_all().await {
            Ok(report) => {
                for name in &report.deleted {
                    println!("Deleted worker: {}", name);
                }
                for (name, err) in &report.failed {
                    match err.status() {
                        Some(_) => println!("Could not delete worker: {}", name),
                        None => println!("Error deleting worker: {}", name),
                    }
                }
                Some(report)
            }
            Err(err) => {
                println!("Failed to cleanup: {}", err);
                None
            }
        };

        if self.endpoints_file.exists() {
            if let Err(err) = std::fs::remove_file(&self.endpoints_file) {
                tracing::debug!(error = %err, "Could not remove endpoint cache");
            }
        }

        Ok(report)
    }
}

/// Pulls the caller's apparent IP out of a response from one of the known
/// IP echo services.
pub fn extract_origin_ip(target_url: &str, body: &[u8]) -> Option<String> {
    match target_url {
        HTTPBIN_TARGET => {
            let json: serde_json::Value = serde_json::from_slice(body).ok()?;
            json.get("origin")?.as_str().map(str::to_string)
        }
        IFCONFIG_TARGET => {
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            (!text.is_empty() && text.len() < 100).then(|| text.to_string())
        }
        _ => None,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum BodySummary {
    OriginIp(String),
    Excerpt(String),
    Length(usize),
}

/// What to show for a successful test response. Plain-text echo bodies that
/// don't look like an address are cut to their first 100 characters.
pub fn summarize_body(target_url: &str, body: &[u8]) -> BodySummary {
    if let Some(ip) = extract_origin_ip(target_url, body) {
        return BodySummary::OriginIp(ip);
    }
    if target_url == IFCONFIG_TARGET {
        let text = String::from_utf8_lossy(body);
        return BodySummary::Excerpt(text.trim().chars().take(100).collect());
    }
    BodySummary::Length(body.len())
}

fn print_test_summary(report: &TestReport, total: usize) {
    println!("\nTest Results:");
    println!("   Working endpoints: {}/{}", report.successful, total);
    if report.successful < total {
        println!(
            "   Failed endpoints: {} (may be due to target service issues)",
            total - report.successful
        );
    }
    if !report.unique_ips.is_empty() {
        println!("   Unique IP addresses: {}", report.unique_ips.len());
        for ip in &report.unique_ips {
            println!("      - {}", ip);
        }
    }
}
