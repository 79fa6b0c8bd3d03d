//! Tool-executor HTTP client (skill sandbox + package inventory).
//!
//! Endpoint modes for the installed-package lookup:
//!   auto   — try `/v1/packages/installed` (compat list shape) first; on 404
//!            fall back to `/v1/packages` and parse the dict shape.
//!   modern — go straight to `/v1/packages`, never call the compat endpoint.
//!   compat — only `/v1/packages/installed`; no fallback on failure.
//!
//! All package names are normalised to lowercase — the executor compares
//! them case-insensitively against its allowlist.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use cortex_core::{CortexError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointMode {
    #[default]
    Auto,
    Modern,
    Compat,
}

impl EndpointMode {
    pub fn parse(s: &str) -> Self {
        match s {
            "modern" => Self::Modern,
            "compat" => Self::Compat,
            _ => Self::Auto,
        }
    }
}

/// One entry of the `/v1/packages` dict shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackagesResponse {
    #[serde(default)]
    pub packages: Vec<PackageInfo>,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

pub struct ToolExecutorClient {
    client: reqwest::Client,
    base_url: String,
    mode: EndpointMode,
}

impl ToolExecutorClient {
    pub fn new(base_url: impl Into<String>, mode: EndpointMode) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            mode,
        }
    }

    // ── skills ──────────────────────────────────────────────────────────────

    pub async fn create_skill(&self, description: &str, code: Option<&str>) -> Result<Value> {
        self.post(
            "/v1/skills/create",
            json!({ "description": description, "code": code }),
        )
        .await
    }

    pub async fn install_skill(&self, skill_name: &str) -> Result<Value> {
        self.post("/v1/skills/install", json!({ "skill_name": skill_name }))
            .await
    }

    pub async fn uninstall_skill(&self, skill_name: &str) -> Result<Value> {
        self.post("/v1/skills/uninstall", json!({ "skill_name": skill_name }))
            .await
    }

    pub async fn run_skill(&self, skill_name: &str, arguments: Value) -> Result<Value> {
        self.post(
            "/v1/skills/run",
            json!({ "skill_name": skill_name, "arguments": arguments }),
        )
        .await
    }

    // ── packages ────────────────────────────────────────────────────────────

    /// Full package inventory with allowlist (`/v1/packages` dict shape).
    pub async fn list_packages(&self) -> Result<PackagesResponse> {
        let value = self.get("/v1/packages").await?;
        serde_json::from_value(value).map_err(CortexError::Serialization)
    }

    /// Installed package names, lowercased, honoring the endpoint mode.
    pub async fn installed_packages(&self) -> Result<Vec<String>> {
        match self.mode {
            EndpointMode::Modern => self.installed_from_packages().await,
            EndpointMode::Compat => self.installed_from_compat().await,
            EndpointMode::Auto => match self.installed_from_compat().await {
                Ok(packages) => Ok(packages),
                Err(e) => {
                    debug!(error = %e, "compat endpoint unavailable — falling back");
                    self.installed_from_packages().await
                }
            },
        }
    }

    async fn installed_from_compat(&self) -> Result<Vec<String>> {
        let value = self.get("/v1/packages/installed").await?;
        let names = value
            .get("packages")
            .and_then(|p| p.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn installed_from_packages(&self) -> Result<Vec<String>> {
        let response = self.list_packages().await?;
        Ok(response
            .packages
            .into_iter()
            .map(|p| p.name.to_lowercase())
            .collect())
    }

    // ── transport ───────────────────────────────────────────────────────────

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CortexError::Hub(e.to_string()))?;
        Self::unwrap_response(path, response).await
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CortexError::Hub(e.to_string()))?;
        Self::unwrap_response(path, response).await
    }

    async fn unwrap_response(path: &str, response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(path, status = status.as_u16(), "executor http error");
            return Err(CortexError::Hub(format!("{path}: http {status}: {text}")));
        }
        response
            .json()
            .await
            .map_err(|e| CortexError::Hub(format!("{path}: bad response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_mode_parses_contract_values() {
        assert_eq!(EndpointMode::parse("auto"), EndpointMode::Auto);
        assert_eq!(EndpointMode::parse("modern"), EndpointMode::Modern);
        assert_eq!(EndpointMode::parse("compat"), EndpointMode::Compat);
        assert_eq!(EndpointMode::parse("anything-else"), EndpointMode::Auto);
    }

    #[test]
    fn packages_response_parses_dict_shape() {
        let raw = json!({
            "packages": [
                {"name": "Httpx", "version": "0.27.0"},
                {"name": "pydantic", "version": "2.8"},
            ],
            "allowlist": ["httpx", "pydantic", "numpy"],
        });
        let parsed: PackagesResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.packages.len(), 2);
        assert_eq!(parsed.allowlist.len(), 3);
        let lowered: Vec<String> = parsed
            .packages
            .into_iter()
            .map(|p| p.name.to_lowercase())
            .collect();
        assert_eq!(lowered, vec!["httpx", "pydantic"]);
    }
}
