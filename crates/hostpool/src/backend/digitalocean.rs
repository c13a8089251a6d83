//! DigitalOcean v1 droplet API client.
//!
//! Every call is a GET with `client_id`/`api_key` query credentials. A call
//! succeeds only when the HTTP status is 200 and the JSON envelope carries
//! `"status": "OK"`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use super::{BackendError, CreatedHost, HostInfo, HostSpec, HostSummary, ProvisioningBackend};
use crate::host::HostId;

pub const DEFAULT_API_BASE_URL: &str = "https://api.digitalocean.com";
/// New York 1.
pub const DEFAULT_REGION_ID: &str = "1";
/// 512MB.
pub const DEFAULT_SIZE_ID: &str = "66";

#[derive(Debug, Clone)]
pub struct DigitalOceanConfig {
    pub api_base_url: String,
    pub client_id: String,
    pub api_key: String,
    pub image_id: String,
    pub ssh_key_ids: Option<String>,
    pub region_id: String,
    pub size_id: String,
    pub request_timeout: Duration,
}

impl DigitalOceanConfig {
    pub fn new(client_id: String, api_key: String, image_id: String) -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            client_id,
            api_key,
            image_id,
            ssh_key_ids: None,
            region_id: DEFAULT_REGION_ID.to_string(),
            size_id: DEFAULT_SIZE_ID.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct DigitalOceanClient {
    client: reqwest::Client,
    config: DigitalOceanConfig,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NewDropletResponse {
    droplet: NewDroplet,
}

#[derive(Debug, Deserialize)]
struct NewDroplet {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(deserialize_with = "id_string")]
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    event: Event,
}

#[derive(Debug, Deserialize)]
struct Event {
    #[serde(default)]
    percentage: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletsResponse {
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    #[serde(deserialize_with = "id_string")]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    ip_address: Option<String>,
}

/// Accept ids as JSON numbers or strings.
fn id_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(v), _) => Ok(v.to_string()),
            (None, Some(v)) => Ok(format!("{}", v.trunc() as i64)),
            (None, None) => Err(D::Error::custom(format!("invalid id: {n}"))),
        },
        other => Err(D::Error::custom(format!("invalid id: {other}"))),
    }
}

/// Event percentage arrives as a string ("100") or a number; absent means 0.
fn parse_percentage(value: Option<&serde_json::Value>) -> Result<u8, BackendError> {
    let pct = match value {
        None | Some(serde_json::Value::Null) => 0.0,
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(serde_json::Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| BackendError::Decode(format!("invalid event percentage: {s:?}")))?,
        Some(other) => {
            return Err(BackendError::Decode(format!(
                "invalid event percentage: {other}"
            )));
        }
    };
    Ok(pct.clamp(0.0, 100.0) as u8)
}

impl DigitalOceanClient {
    pub fn new(config: DigitalOceanConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("hostpool/{}", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T, BackendError> {
        let resp = self
            .client
            .get(self.url(path))
            .query(&[
                ("client_id", self.config.client_id.as_str()),
                ("api_key", self.config.api_key.as_str()),
            ])
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.to_string(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| BackendError::Decode(format!("{path}: {e}")))?;
        if envelope.status != "OK" {
            return Err(BackendError::Api {
                status: envelope.status,
                message: envelope.error_message.unwrap_or_default(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| BackendError::Decode(format!("{path}: {e}")))
    }
}

#[async_trait]
impl ProvisioningBackend for DigitalOceanClient {
    async fn create(&self, spec: &HostSpec) -> Result<CreatedHost, BackendError> {
        let mut params = vec![
            ("name", spec.name.as_str()),
            ("image_id", self.config.image_id.as_str()),
            ("size_id", self.config.size_id.as_str()),
            ("region_id", self.config.region_id.as_str()),
        ];
        if let Some(keys) = self.config.ssh_key_ids.as_deref() {
            params.push(("ssh_key_ids", keys));
        }

        let resp: NewDropletResponse = self.call("droplets/new", &params).await?;
        Ok(CreatedHost {
            id: HostId::new(resp.droplet.id),
            event_id: resp.droplet.event_id,
        })
    }

    async fn poll_event(&self, event_id: &str) -> Result<u8, BackendError> {
        let resp: EventResponse = self.call(&format!("events/{event_id}"), &[]).await?;
        parse_percentage(resp.event.percentage.as_ref())
    }

    async fn describe(&self, id: &HostId) -> Result<HostInfo, BackendError> {
        let resp: DropletResponse = self.call(&format!("droplets/{id}"), &[]).await?;
        Ok(HostInfo {
            status: resp.droplet.status.unwrap_or_default(),
            ip_address: resp.droplet.ip_address.filter(|ip| !ip.is_empty()),
            name: resp.droplet.name,
        })
    }

    async fn destroy(&self, id: &HostId) -> Result<(), BackendError> {
        let _: Envelope = self.call(&format!("droplets/{id}/destroy"), &[]).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<HostSummary>, BackendError> {
        let resp: DropletsResponse = self.call("droplets", &[]).await?;
        Ok(resp
            .droplets
            .into_iter()
            .map(|d| HostSummary {
                id: HostId::new(d.id),
                name: d.name,
            })
            .collect())
    }
}
