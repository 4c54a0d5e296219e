//! DigitalOcean API client
//!
//! Just enough of the v2 API to sanity-check preferences before creating a
//! farm, look up node prices, and clean up droplets without Terraform.
//!
//! Every check distinguishes three outcomes so the CLI can tell "wrong value"
//! apart from "couldn't ask":
//!
//! - [`Validation::Valid`]
//! - [`Validation::Invalid`]
//! - [`Validation::Unreachable`] (transport error or unexpected response)

use crate::error::{Result, TerrafarmError};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, info};

/// DigitalOcean API base URL
pub const DO_API: &str = "https://api.digitalocean.com/v2";

/// Name prefix of every farm droplet
pub const DROPLET_PREFIX: &str = "terrafarm";

/// Request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a preference check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// Value is accepted by DigitalOcean
    Valid,
    /// Value is rejected
    Invalid,
    /// DigitalOcean could not be asked
    Unreachable,
}

impl Validation {
    fn from_check(found: bool) -> Self {
        if found { Self::Valid } else { Self::Invalid }
    }
}

/// Droplet summary
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Droplet {
    /// Droplet ID
    pub id: u64,
    /// Droplet name
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    account: Account,
}

#[derive(Debug, Deserialize)]
struct Account {
    status: String,
}

#[derive(Debug, Deserialize)]
struct KeysInfo {
    #[serde(default)]
    ssh_keys: Vec<Key>,
}

#[derive(Debug, Deserialize)]
struct Key {
    fingerprint: String,
}

#[derive(Debug, Deserialize)]
struct RegionsInfo {
    #[serde(default)]
    regions: Vec<Slug>,
}

#[derive(Debug, Deserialize)]
struct Slug {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct SizesInfo {
    #[serde(default)]
    sizes: Vec<Size>,
}

#[derive(Debug, Deserialize)]
struct Size {
    slug: String,
    #[serde(default)]
    price_hourly: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DropletsInfo {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

/// DigitalOcean API client
#[derive(Debug, Clone)]
pub struct DigitalOceanClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DigitalOceanClient {
    /// Create a client for the public API
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(DO_API, token)
    }

    /// Create a client against another endpoint
    pub fn with_base_url(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(query)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json().await?)
    }

    /// Token belongs to an active account
    pub async fn validate_token(&self) -> Validation {
        match self.get::<AccountInfo>("/account", &[]).await {
            Ok(info) => Validation::from_check(account_active(&info)),
            Err(TerrafarmError::Http(e)) if e.status() == Some(StatusCode::UNAUTHORIZED) => {
                Validation::Invalid
            }
            Err(e) => api_unreachable(e),
        }
    }

    /// Key with `fingerprint` is registered in the account
    pub async fn validate_fingerprint(&self, fingerprint: &str) -> Validation {
        match self.get::<KeysInfo>("/account/keys", &[]).await {
            Ok(info) => Validation::from_check(info.ssh_keys.iter().any(|k| k.fingerprint == fingerprint)),
            Err(e) => api_unreachable(e),
        }
    }

    /// Region slug exists
    pub async fn validate_region(&self, region: &str) -> Validation {
        match self.get::<RegionsInfo>("/regions", &[]).await {
            Ok(info) => Validation::from_check(info.regions.iter().any(|r| r.slug == region)),
            Err(e) => api_unreachable(e),
        }
    }

    /// Size slug exists
    pub async fn validate_size(&self, size: &str) -> Validation {
        match self.get::<SizesInfo>("/sizes", &[]).await {
            Ok(info) => Validation::from_check(find_size_price(&info, size).is_some()),
            Err(e) => api_unreachable(e),
        }
    }

    /// Hourly price of a droplet of the given size, when known
    pub async fn size_price(&self, size: &str) -> Option<f64> {
        match self.get::<SizesInfo>("/sizes", &[]).await {
            Ok(info) => find_size_price(&info, size).flatten(),
            Err(e) => {
                debug!("Can't fetch sizes: {}", e);
                None
            }
        }
    }

    /// Droplets created for farms
    pub async fn list_farm_droplets(&self) -> Result<Vec<Droplet>> {
        let info: DropletsInfo = self
            .get("/droplets", &[("page", "1"), ("per_page", "999")])
            .await?;

        Ok(farm_droplets(info.droplets))
    }

    /// Destroy a droplet
    pub async fn destroy_droplet(&self, droplet: &Droplet) -> Result<()> {
        let url = format!("{}/droplets/{}", self.base_url, droplet.id);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() != StatusCode::NO_CONTENT {
            return Err(TerrafarmError::api(format!(
                "Can't destroy droplet {} - DigitalOcean return status code {}",
                droplet.name,
                response.status().as_u16()
            )));
        }

        info!("Droplet {} destroyed", droplet.name);

        Ok(())
    }

    /// Destroy every farm droplet; returns the destroyed droplets
    pub async fn destroy_farm_droplets(&self) -> Result<Vec<Droplet>> {
        let droplets = self.list_farm_droplets().await?;

        for droplet in &droplets {
            self.destroy_droplet(droplet).await?;
        }

        Ok(droplets)
    }
}

fn api_unreachable(e: TerrafarmError) -> Validation {
    debug!("DigitalOcean API request failed: {}", e);
    Validation::Unreachable
}

fn account_active(info: &AccountInfo) -> bool {
    info.account.status == "active"
}

/// `None` if the size doesn't exist, `Some(price)` otherwise
fn find_size_price(info: &SizesInfo, size: &str) -> Option<Option<f64>> {
    info.sizes
        .iter()
        .find(|s| s.slug == size)
        .map(|s| s.price_hourly)
}

fn farm_droplets(droplets: Vec<Droplet>) -> Vec<Droplet> {
    droplets
        .into_iter()
        .filter(|d| d.name.starts_with(DROPLET_PREFIX))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_status() {
        let info: AccountInfo =
            serde_json::from_str(r#"{"account": {"status": "active", "email": "ci@example.com"}}"#).unwrap();
        assert!(account_active(&info));

        let info: AccountInfo = serde_json::from_str(r#"{"account": {"status": "locked"}}"#).unwrap();
        assert!(!account_active(&info));
    }

    #[test]
    fn test_size_price_lookup() {
        let info: SizesInfo = serde_json::from_str(
            r#"{"sizes": [
                {"slug": "8gb", "price_hourly": 0.119},
                {"slug": "16gb", "price_hourly": 0.238},
                {"slug": "legacy"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(find_size_price(&info, "16gb"), Some(Some(0.238)));
        assert_eq!(find_size_price(&info, "legacy"), Some(None));
        assert_eq!(find_size_price(&info, "1tb"), None);
    }

    #[test]
    fn test_farm_droplets_filter() {
        let info: DropletsInfo = serde_json::from_str(
            r#"{"droplets": [
                {"id": 1, "name": "terrafarm-c7-x64"},
                {"id": 2, "name": "web-01"},
                {"id": 3, "name": "terrafarm-c7-x32"}
            ]}"#,
        )
        .unwrap();

        let ids: Vec<u64> = farm_droplets(info.droplets).iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn test_keys_parse() {
        let info: KeysInfo =
            serde_json::from_str(r#"{"ssh_keys": [{"id": 5, "fingerprint": "aa:bb", "name": "ci"}]}"#).unwrap();
        assert_eq!(info.ssh_keys[0].fingerprint, "aa:bb");
    }

    #[tokio::test]
    async fn test_unreachable_api() {
        // Port 9 on localhost: nothing listens, connection refused
        let client = DigitalOceanClient::with_base_url("http://127.0.0.1:9", "token").unwrap();
        assert_eq!(client.validate_token().await, Validation::Unreachable);
        assert_eq!(client.validate_region("fra1").await, Validation::Unreachable);
        assert!(client.size_price("16gb").await.is_none());
    }
}
