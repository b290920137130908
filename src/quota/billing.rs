use crate::errors::{GatewayError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

/// Usage totals for one account and cycle as the billing service sees them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub tokens: u64,
    pub cost: f64,
}

/// Authoritative source of quota totals.
#[async_trait]
pub trait BillingService: Send + Sync {
    async fn fetch_usage(&self, account: &str, cycle_id: &str) -> Result<UsageTotals>;

    /// Add usage recorded by this instance since the last report.
    async fn report_usage(&self, account: &str, cycle_id: &str, usage: UsageTotals) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct UsageReport<'a> {
    cycle_id: &'a str,
    tokens: u64,
    cost: f64,
}

/// Accounts become a URL path segment; dot segments would be normalized away.
pub fn is_valid_account(account: &str) -> bool {
    !matches!(account, "" | "." | "..")
}

/// Billing service reached over HTTP:
/// `GET {base}/accounts/{account}/usage?cycle={id}` and
/// `POST {base}/accounts/{account}/usage`.
#[derive(Debug, Clone)]
pub struct HttpBillingService {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpBillingService {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GatewayError::Billing(format!("Invalid billing URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::Billing(format!("Billing URL {} cannot carry a path", base_url)));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Billing(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { base_url, client })
    }

    /// `{base}/accounts/{account}/usage` with the account percent-encoded
    /// as a single segment.
    fn usage_url(&self, account: &str) -> Result<Url> {
        if !is_valid_account(account) {
            return Err(GatewayError::InvalidRequest(format!("Invalid account id: {:?}", account)));
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Billing(format!("Billing URL {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(["accounts", account, "usage"]);
        Ok(url)
    }
}

#[async_trait]
impl BillingService for HttpBillingService {
    async fn fetch_usage(&self, account: &str, cycle_id: &str) -> Result<UsageTotals> {
        let url = self.usage_url(account)?;
        debug!("Fetching usage from {}", url);

        let response = self
            .client
            .get(url)
            .query(&[("cycle", cycle_id)])
            .send()
            .await
            .map_err(|e| {
                error!("Billing fetch failed: {}", e);
                GatewayError::Billing(format!("Request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Billing(format!(
                "Billing service returned: {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::Billing(format!("Failed to parse usage: {}", e)))
    }

    async fn report_usage(&self, account: &str, cycle_id: &str, usage: UsageTotals) -> Result<()> {
        let response = self
            .client
            .post(self.usage_url(account)?)
            .json(&UsageReport {
                cycle_id,
                tokens: usage.tokens,
                cost: usage.cost,
            })
            .send()
            .await
            .map_err(|e| {
                error!("Billing report failed: {}", e);
                GatewayError::Billing(format!("Request failed: {}", e))
            })?;

        if !response.status().is_success() {
            return Err(GatewayError::Billing(format!(
                "Billing service returned: {}",
                response.status()
            )));
        }

        Ok(())
    }
}

/// In-process billing backend; totals live as long as the process.
#[derive(Debug, Default)]
pub struct StaticBillingService {
    totals: DashMap<(String, String), UsageTotals>,
}

impl StaticBillingService {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingService for StaticBillingService {
    async fn fetch_usage(&self, account: &str, cycle_id: &str) -> Result<UsageTotals> {
        Ok(self
            .totals
            .get(&(account.to_string(), cycle_id.to_string()))
            .map(|t| *t)
            .unwrap_or_default())
    }

    async fn report_usage(&self, account: &str, cycle_id: &str, usage: UsageTotals) -> Result<()> {
        let mut totals = self
            .totals
            .entry((account.to_string(), cycle_id.to_string()))
            .or_default();
        totals.tokens = totals.tokens.saturating_add(usage.tokens);
        totals.cost += usage.cost;
        Ok(())
    }
}
