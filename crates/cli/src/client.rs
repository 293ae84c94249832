//! HTTP client for the daemon's operator API

use anyhow::Result;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

const OPERATOR_HEADER: &str = "x-operator-id";

/// Error body returned by the daemon
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    kind: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{message}")]
    Api {
        status: StatusCode,
        kind: String,
        message: String,
    },

    #[error("cannot reach daemon at {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Api { status, .. } if *status == StatusCode::NOT_FOUND)
    }
}

/// Peer as returned by the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub name: String,
    pub address: String,
    pub public_key: String,
    pub expires_at: String,
    pub created_at: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedPeer {
    pub id: String,
    pub address: String,
    pub expires_at: String,
    pub config: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandFailure {
    pub id: Option<String>,
    pub public_key: String,
    pub op: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub archived: Vec<String>,
    pub applied: Vec<String>,
    pub removed: Vec<String>,
    pub failures: Vec<CommandFailure>,
    pub observe_error: Option<String>,
    pub restarted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    pub status: String,
    pub version: String,
    pub active: usize,
    pub archived: usize,
    pub cursor: String,
    pub key_provider: String,
}

/// Client for communicating with the wgwarden daemon
pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
    operator: Option<i64>,
}

impl DaemonClient {
    pub fn new(addr: &str, operator: Option<i64>) -> Result<Self> {
        let base = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        let http = reqwest::Client::builder()
            .user_agent(concat!("wgwarden-cli/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, base, operator })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        tracing::debug!("{} {}{}", method, self.base, path);
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match self.operator {
            Some(id) => builder.header(OPERATOR_HEADER, id.to_string()),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ClientError> {
        let response = builder.send().await.map_err(|source| ClientError::Unreachable {
            addr: self.base.clone(),
            source,
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let (kind, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.kind, body.error),
            Err(_) => (String::new(), format!("daemon returned {}: {}", status, text.trim())),
        };
        Err(ClientError::Api { status, kind, message })
    }

    async fn json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        Ok(self.send(builder).await?.json().await?)
    }

    pub async fn health(&self) -> Result<Health> {
        self.json(self.request(Method::GET, "/health")).await
    }

    pub async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.json(self.request(Method::GET, "/peers")).await
    }

    pub async fn list_archive(&self) -> Result<Vec<Peer>> {
        self.json(self.request(Method::GET, "/archive")).await
    }

    pub async fn create_peer(&self, name: &str, expires_at: &str) -> Result<CreatedPeer> {
        let body = serde_json::json!({ "name": name, "expires_at": expires_at });
        self.json(self.request(Method::POST, "/peers").json(&body)).await
    }

    pub async fn get_peer(&self, id: &str) -> Result<Peer> {
        self.json(self.request(Method::GET, &format!("/peers/{}", id))).await
    }

    pub async fn peer_config(&self, id: &str) -> Result<String> {
        let response = self
            .send(self.request(Method::GET, &format!("/peers/{}/config", id)))
            .await?;
        Ok(response.text().await?)
    }

    pub async fn remove_peer(&self, id: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/peers/{}", id)))
            .await?;
        Ok(())
    }

    pub async fn purge_peer(&self, id: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, &format!("/peers/{}?purge=true", id)))
            .await?;
        Ok(())
    }

    pub async fn renew_peer(&self, id: &str, expires_at: &str) -> Result<Peer> {
        let body = serde_json::json!({ "expires_at": expires_at });
        self.json(self.request(Method::PUT, &format!("/peers/{}/expiry", id)).json(&body))
            .await
    }

    pub async fn reconcile(&self) -> Result<ConvergenceReport> {
        self.json(self.request(Method::POST, "/reconcile")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_address_normalised() {
        let client = DaemonClient::new("127.0.0.1:7420", None).unwrap();
        assert_eq!(client.base(), "http://127.0.0.1:7420");

        let client = DaemonClient::new("https://wg.example.org/", Some(1)).unwrap();
        assert_eq!(client.base(), "https://wg.example.org");
    }

    #[test]
    fn test_report_deserializes() {
        let json = r#"{"archived": ["id5"], "applied": [], "removed": ["PUB"],
            "failures": [{"id": null, "public_key": "X", "op": "remove_peer", "error": "boom"}],
            "observe_error": null, "restarted": false}"#;
        let report: ConvergenceReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.archived, vec!["id5"]);
        assert_eq!(report.failures[0].op, "remove_peer");
    }
}
