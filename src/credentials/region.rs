//! Region table and the endpoint allow-list.
//!
//! A base URL may only be pinned at runtime if it is a known region (by key
//! or by origin) or an HTTPS origin under the single allowed domain. Anything
//! else is rejected before a token request could carry the client secret to
//! it.

use reqwest::Url;

use super::CredentialError;

/// Built-in regions, in default auto-detection order.
pub const DEFAULT_REGIONS: &[(&str, &str)] = &[
    ("us", "https://app.ninjarmm.com"),
    ("eu", "https://eu.ninjarmm.com"),
    ("oc", "https://oc.ninjarmm.com"),
    ("ca", "https://ca.ninjarmm.com"),
    ("us2", "https://us2.ninjarmm.com"),
];

/// A named region and its base URL (an origin, no trailing slash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub key: String,
    pub base_url: String,
}

/// Decides which endpoints may be pinned.
#[derive(Debug, Clone)]
pub struct EndpointPolicy {
    regions: Vec<Region>,
    allowed_domain: String,
}

impl EndpointPolicy {
    pub fn new(regions: Vec<Region>, allowed_domain: impl Into<String>) -> Self {
        Self {
            regions,
            allowed_domain: allowed_domain.into().trim_start_matches('.').to_lowercase(),
        }
    }

    /// The built-in region table with `allowed_domain` as wildcard domain.
    pub fn with_default_regions(allowed_domain: impl Into<String>) -> Self {
        let regions = DEFAULT_REGIONS
            .iter()
            .map(|(key, url)| Region {
                key: (*key).to_string(),
                base_url: (*url).to_string(),
            })
            .collect();
        Self::new(regions, allowed_domain)
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Base URLs of every known region, in table order.
    pub fn default_candidates(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.base_url.clone()).collect()
    }

    /// Look up a region by key (case-insensitive; `app` is an alias of `us`).
    pub fn region(&self, key: &str) -> Option<&Region> {
        let key = key.trim().to_lowercase();
        let key = if key == "app" { "us".to_string() } else { key };
        self.regions.iter().find(|r| r.key == key)
    }

    /// Resolve a region key or URL to a normalized base URL, or reject it.
    ///
    /// Pure: never touches the network.
    pub fn resolve(&self, target: &str) -> Result<String, CredentialError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(CredentialError::EndpointRejected("empty endpoint".to_string()));
        }
        if let Some(region) = self.region(target) {
            return Ok(region.base_url.clone());
        }

        let url = Url::parse(target).map_err(|e| {
            CredentialError::EndpointRejected(format!(
                "'{target}' is neither a region key nor a URL ({e})"
            ))
        })?;
        if !url.username().is_empty() || url.password().is_some() {
            return Err(CredentialError::EndpointRejected(
                "URLs with embedded credentials are not allowed".to_string(),
            ));
        }
        let origin = url.origin().ascii_serialization();

        if self.regions.iter().any(|r| r.base_url == origin) {
            return Ok(origin);
        }

        let host = url.host_str().unwrap_or_default().to_lowercase();
        let under_domain = host == self.allowed_domain
            || host.ends_with(&format!(".{}", self.allowed_domain));
        if url.scheme() == "https" && under_domain && url.port().is_none() {
            return Ok(origin);
        }

        Err(CredentialError::EndpointRejected(format!(
            "{origin} is not a known region and not an https host under {}",
            self.allowed_domain
        )))
    }
}
