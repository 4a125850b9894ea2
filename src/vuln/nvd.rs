use std::time::Duration;
use anyhow::{ Result, Context, anyhow };
use serde::Deserialize;
use tracing::debug;
use async_trait::async_trait;

use super::{ VulnSource, VulnerabilityFinding };

pub const NVD_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";

#[derive(Deserialize)]
struct CveResponse {
    #[serde(default)]
    vulnerabilities: Vec<CveItem>,
}

#[derive(Deserialize)]
struct CveItem {
    cve: Cve,
}

#[derive(Deserialize)]
struct Cve {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    metrics: Metrics,
}

#[derive(Deserialize, Default)]
struct Metrics {
    #[serde(rename = "cvssMetricV31", default)]
    cvss_v31: Vec<CvssMetric>,
}

#[derive(Deserialize)]
struct CvssMetric {
    #[serde(rename = "cvssData")]
    cvss_data: CvssData,
}

#[derive(Deserialize)]
struct CvssData {
    #[serde(rename = "baseScore")]
    base_score: f64,
}

/// Keyword search against the NVD CVE 2.0 REST API.
pub struct Nvd {
    client: reqwest::Client,
    url: String,
}

impl Nvd {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client
            ::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("cannot create HTTP client")?;
        Ok(Nvd { client, url: url.into() })
    }
}

#[async_trait]
impl VulnSource for Nvd {
    async fn search(&self, keyword: &str, api_key: &str) -> Result<Vec<VulnerabilityFinding>> {
        debug!("searching {} for '{}'", self.url, keyword);
        let resp = self.client
            .get(&self.url)
            .query(&[("keywordSearch", keyword)])
            .header("apiKey", api_key)
            .header("Accept", "application/json")
            .send().await
            .context("cannot reach vulnerability database")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("vulnerability database returned status {}", status));
        }
        let text = resp.text().await.context("cannot read vulnerability database response")?;
        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<Vec<VulnerabilityFinding>> {
    let resp: CveResponse = serde_json
        ::from_str(text)
        .context("cannot parse vulnerability database response")?;
    let findings = resp.vulnerabilities
        .into_iter()
        .filter_map(|v| {
            let id = v.cve.id?;
            let score = v.cve.metrics.cvss_v31.first().map(|m| m.cvss_data.base_score);
            Some(VulnerabilityFinding { id, score })
        })
        .collect();
    Ok(findings)
}
