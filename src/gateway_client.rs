use crate::error::{EnvoyError, Result};
use crate::poll_scheduler::{ResourceFetcher, ResourceKind};
use crate::stream_reader::{ChunkStream, StreamSource};
use crate::token_manager::TokenManager;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const STREAM_PATH: &str = "/stream/meter";
/// Local account used for digest authentication on legacy firmware.
pub const INSTALLER_USER: &str = "installer";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SLOW_REQUEST: Duration = Duration::from_secs(5);

/// How requests to the gateway authenticate.
pub enum GatewayAuth {
    None,
    /// Legacy firmware: HTTP digest with the installer password.
    Digest { username: String, password: String },
    /// Token firmware: the header is read from the manager on every request.
    Bearer(Arc<TokenManager>),
}

/// HTTP access to the local gateway.
pub struct GatewayClient {
    base_url: String,
    auth: GatewayAuth,
    client: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>, auth: GatewayAuth) -> Result<Self> {
        // Gateways serve a self-signed certificate.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
            client,
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(
        &self,
        path: &str,
        timeout: Option<Duration>,
        authorization: Option<String>,
    ) -> RequestBuilder {
        let mut request = self.client.get(self.url(path));
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        if let Some(authorization) = authorization {
            request = request.header(AUTHORIZATION, authorization);
        }
        request
    }

    /// Sends an authenticated GET and fails on anything but 200.
    async fn send(&self, path: &str, timeout: Option<Duration>) -> Result<Response> {
        let response = match &self.auth {
            GatewayAuth::None => self.request(path, timeout, None).send().await?,
            GatewayAuth::Bearer(tokens) => {
                let header = tokens
                    .authorization_header()
                    .ok_or_else(|| EnvoyError::Auth("no token available".into()))?;
                self.request(path, timeout, Some(header)).send().await?
            }
            GatewayAuth::Digest { username, password } => {
                let challenge = self.request(path, timeout, None).send().await?;
                if challenge.status() != StatusCode::UNAUTHORIZED {
                    challenge
                } else {
                    let header = digest_response(&challenge, username, password, path)?;
                    self.request(path, timeout, Some(header)).send().await?
                }
            }
        };

        if response.status() != StatusCode::OK {
            return Err(EnvoyError::Status {
                resource: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }

    /// Fetches and parses one JSON document.
    pub async fn get_json(&self, path: &str) -> Result<Value> {
        let started = Instant::now();
        let document = self.send(path, Some(REQUEST_TIMEOUT)).await?.json().await?;
        let elapsed = started.elapsed();
        if elapsed > SLOW_REQUEST {
            warn!("Slow gateway response for {path}: {:.1}s", elapsed.as_secs_f64());
        } else {
            debug!("Fetched {path} in {}ms", elapsed.as_millis());
        }
        Ok(document)
    }

    /// Opens the live meter stream. Only the connection phase is time
    /// limited; chunk timeouts are up to the reader.
    pub async fn open_stream(&self) -> Result<Response> {
        match tokio::time::timeout(CONNECT_TIMEOUT, self.send(STREAM_PATH, None)).await {
            Ok(response) => response,
            Err(_) => Err(EnvoyError::Timeout(format!("{STREAM_PATH} to answer"))),
        }
    }
}

fn digest_response(
    challenge: &Response,
    username: &str,
    password: &str,
    path: &str,
) -> Result<String> {
    let header = challenge
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| EnvoyError::Auth(format!("{path} sent 401 without a challenge")))?;
    let mut prompt = digest_auth::parse(header)
        .map_err(|e| EnvoyError::Auth(format!("unusable digest challenge: {e}")))?;
    let context = digest_auth::AuthContext::new(username, password, path);
    let answer = prompt
        .respond(&context)
        .map_err(|e| EnvoyError::Auth(format!("could not answer digest challenge: {e}")))?;
    Ok(answer.to_header_string())
}

#[async_trait]
impl ResourceFetcher for GatewayClient {
    async fn fetch(&self, resource: ResourceKind) -> Result<Value> {
        self.get_json(resource.path()).await
    }
}

#[async_trait]
impl StreamSource for GatewayClient {
    async fn connect(&self) -> Result<ChunkStream> {
        let response = self.open_stream().await?;
        Ok(Box::pin(response.bytes_stream().map(|chunk| {
            chunk.map(|bytes| bytes.to_vec()).map_err(EnvoyError::from)
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token_manager::{AuthToken, TokenIssuer, TokenSettings};
    use chrono::Utc;
    use mockito::Matcher;

    struct NoIssuer;

    #[async_trait]
    impl TokenIssuer for NoIssuer {
        async fn issue(&self) -> Result<String> {
            Err(EnvoyError::Auth("offline".into()))
        }
    }

    fn token_manager(dir: &tempfile::TempDir, token: Option<&str>) -> Arc<TokenManager> {
        let path = dir.path().join("token.json");
        if let Some(token) = token {
            let cached = AuthToken {
                auth_token: token.to_string(),
                created: Utc::now(),
            };
            std::fs::write(&path, serde_json::to_vec(&cached).unwrap()).unwrap();
        }
        Arc::new(TokenManager::new(Box::new(NoIssuer), path, TokenSettings::default()))
    }

    #[tokio::test]
    async fn test_get_json_with_bearer_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/production/inverters")
            .match_header("Authorization", "Bearer test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"serialNumber":"121900000001","lastReportDate":1700000000,"lastReportWatts":210}]"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = GatewayClient::new(
            server.url(),
            GatewayAuth::Bearer(token_manager(&dir, Some("test_token"))),
        )
        .unwrap();
        let document = client.fetch(ResourceKind::InverterList).await.unwrap();

        assert_eq!(document[0]["lastReportWatts"], 210);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_bearer_without_token_fails() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let client = GatewayClient::new(
            server.url(),
            GatewayAuth::Bearer(token_manager(&dir, None)),
        )
        .unwrap();

        let result = client.get_json("/inventory.json").await;
        assert!(matches!(result, Err(EnvoyError::Auth(_))));
    }

    #[tokio::test]
    async fn test_digest_challenge_is_answered() {
        let mut server = mockito::Server::new_async().await;
        let challenge = server
            .mock("GET", "/production.json")
            .match_query(Matcher::UrlEncoded("details".into(), "1".into()))
            .match_header("authorization", Matcher::Missing)
            .with_status(401)
            .with_header(
                "WWW-Authenticate",
                r#"Digest realm="enphaseenergy.com", qop="auth", nonce="1700000000""#,
            )
            .create_async()
            .await;
        let answered = server
            .mock("GET", "/production.json")
            .match_query(Matcher::UrlEncoded("details".into(), "1".into()))
            .match_header(
                "authorization",
                Matcher::Regex(r#"^Digest .*username="installer""#.into()),
            )
            .with_status(200)
            .with_body(r#"{"production":[]}"#)
            .create_async()
            .await;

        let client = GatewayClient::new(
            server.url(),
            GatewayAuth::Digest {
                username: INSTALLER_USER.into(),
                password: "12345678".into(),
            },
        )
        .unwrap();
        let document = client.fetch(ResourceKind::HistoricCounters).await.unwrap();

        assert!(document["production"].is_array());
        challenge.assert_async().await;
        answered.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_200_is_status_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/inventory.json")
            .with_status(500)
            .create_async()
            .await;

        let client = GatewayClient::new(server.url(), GatewayAuth::None).unwrap();
        match client.fetch(ResourceKind::DeviceInventory).await {
            Err(EnvoyError::Status { resource, status }) => {
                assert_eq!(resource, "/inventory.json");
                assert_eq!(status, 500);
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_chunks() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", STREAM_PATH)
            .with_status(200)
            .with_body("data: {\"production\":{}}\r\n\r\n")
            .create_async()
            .await;

        let client = GatewayClient::new(format!("{}/", server.url()), GatewayAuth::None).unwrap();
        let mut chunks = client.connect().await.unwrap();
        let mut body = Vec::new();
        while let Some(chunk) = chunks.next().await {
            body.extend(chunk.unwrap());
        }
        assert_eq!(body, b"data: {\"production\":{}}\r\n\r\n");
    }
}
