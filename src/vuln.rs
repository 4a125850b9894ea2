use std::{ cmp::Ordering, collections::HashMap, env, fmt, time::Duration };
use moka::sync::Cache;
use anyhow::{ Result, anyhow };
use tracing::{ info, debug, trace, warn };
use async_trait::async_trait;

use crate::version;
mod nvd;

pub use nvd::{ Nvd, NVD_URL };

pub const API_KEY_VAR: &str = "NVD_API_KEY";
const MAX_ATTEMPTS: u32 = 3;
const FIRST_DELAY_SECONDS: u64 = 2;
const DELAY_STEP_SECONDS: u64 = 2;
const CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct VulnerabilityFinding {
    pub id: String,
    /// CVSS v3.1 base score, `None` when the record carries no v3.1 metric.
    pub score: Option<f64>,
}

/// Findings for one product/version query, ranked by descending score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VulnerabilityReport {
    pub findings: Vec<VulnerabilityFinding>,
    /// Id of the highest ranked finding, empty when there are none.
    pub critical: String,
}

impl VulnerabilityReport {
    pub fn from_findings(mut findings: Vec<VulnerabilityFinding>) -> Self {
        rank(&mut findings);
        let critical = findings
            .first()
            .map(|f| f.id.clone())
            .unwrap_or_default();
        VulnerabilityReport { findings, critical }
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Reports keyed by the raw (product, version) pair taken from the scan.
pub type Findings = HashMap<(String, String), VulnerabilityReport>;

// stable sort: equal scores keep response order, unranked findings go last
fn rank(findings: &mut [VulnerabilityFinding]) {
    findings.sort_by(|a, b| {
        match (a.score, b.score) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    });
}

#[async_trait]
pub trait VulnSource: Send + Sync {
    async fn search(&self, keyword: &str, api_key: &str) -> Result<Vec<VulnerabilityFinding>>;
}

/// Additive backoff: the n-th failed attempt waits `first_delay + (n-1) * step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub first_delay: Duration,
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: MAX_ATTEMPTS,
            first_delay: Duration::from_secs(FIRST_DELAY_SECONDS),
            step: Duration::from_secs(DELAY_STEP_SECONDS),
        }
    }
}

impl RetryPolicy {
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        self.first_delay + self.step * failed_attempt.saturating_sub(1)
    }
}

pub struct VulnLookup {
    source: Box<dyn VulnSource>,
    api_key_var: String,
    retry: RetryPolicy,
    attempt_timeout: Duration,
    cache: Cache<(String, String), VulnerabilityReport>,
}

impl fmt::Debug for VulnLookup {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VulnLookup(retry={:?}, timeout={:?})", self.retry, self.attempt_timeout)
    }
}

impl VulnLookup {
    pub fn new(source: Box<dyn VulnSource>, attempt_timeout: Duration) -> Self {
        VulnLookup {
            source,
            api_key_var: API_KEY_VAR.to_owned(),
            retry: RetryPolicy::default(),
            attempt_timeout,
            cache: Cache::builder().max_capacity(CACHE_CAPACITY).build(),
        }
    }

    #[cfg(test)]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn with_api_key_var(mut self, name: impl Into<String>) -> Self {
        self.api_key_var = name.into();
        self
    }

    /// Never fails: skipped, unauthenticated and failed queries all yield an
    /// empty report. Each distinct pair is queried at most once per lookup
    /// instance.
    pub async fn lookup(&self, product: &str, version: &str) -> VulnerabilityReport {
        if product.is_empty() || version.is_empty() {
            trace!(product, version, "incomplete service fingerprint, skipping lookup");
            return VulnerabilityReport::default();
        }
        let key = (product.to_owned(), version.to_owned());
        if let Some(v) = self.cache.get(&key) {
            trace!("returning vulnerability report from cache for {} {}", product, version);
            return v;
        }
        let report = self.query(product, version).await;
        self.cache.insert(key, report.clone());
        report
    }

    async fn query(&self, product: &str, version: &str) -> VulnerabilityReport {
        let api_key = match env::var(&self.api_key_var) {
            Ok(v) if !v.is_empty() => v,
            _ => {
                warn!(
                    "{} is not set, skipping vulnerability lookup for {} {}",
                    self.api_key_var,
                    product,
                    version
                );
                return VulnerabilityReport::default();
            }
        };

        let keyword = version::keyword(product, version);
        info!(keyword = %keyword, "querying vulnerability database (might be slow)");
        for attempt in 1..=self.retry.attempts {
            let res = match
                tokio::time::timeout(
                    self.attempt_timeout,
                    self.source.search(&keyword, &api_key)
                ).await
            {
                Ok(v) => v,
                Err(_) => Err(anyhow!("no response within {:?}", self.attempt_timeout)),
            };
            match res {
                Ok(findings) => {
                    debug!(keyword = %keyword, count = findings.len(), "vulnerability query succeeded");
                    return VulnerabilityReport::from_findings(findings);
                }
                Err(err) => {
                    warn!(attempt, keyword = %keyword, "vulnerability query failed: {:#}", err);
                    if attempt < self.retry.attempts {
                        tokio::time::sleep(self.retry.delay_after(attempt)).await;
                    }
                }
            }
        }
        warn!(
            "failed to fetch vulnerabilities for {} after {} attempts, database seems down",
            keyword,
            self.retry.attempts
        );
        VulnerabilityReport::default()
    }
}
