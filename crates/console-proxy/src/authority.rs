use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::token::ConnectionToken;

/// Category of remote console behind a session.
///
/// Kinds other than the built-in three are carried as [`ConsoleKind::Other`]
/// and are only usable when configuration names them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ConsoleKind {
    NoVnc,
    SpiceHtml5,
    Serial,
    Other(String),
}

impl ConsoleKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::NoVnc => "novnc",
            Self::SpiceHtml5 => "spice-html5",
            Self::Serial => "serial",
            Self::Other(name) => name,
        }
    }
}

impl From<&str> for ConsoleKind {
    fn from(name: &str) -> Self {
        match name {
            "novnc" => Self::NoVnc,
            "spice-html5" => Self::SpiceHtml5,
            "serial" => Self::Serial,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ConsoleKind {
    fn from(name: String) -> Self {
        Self::from(name.as_str())
    }
}

impl From<ConsoleKind> for String {
    fn from(kind: ConsoleKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for ConsoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The authority's answer for a valid token: where the console lives and
/// what kind it is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionDescriptor {
    pub host: String,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(rename = "console_type")]
    pub console_kind: ConsoleKind,
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match RawPort::deserialize(deserializer)? {
        RawPort::Number(port) => Ok(port),
        RawPort::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{text}'"))),
    }
}

/// Why the authority did not produce a descriptor. The gateway collapses all
/// of these into one client-visible outcome; the variants exist for logs.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("token rejected by authority")]
    Rejected,
    #[error("authority unreachable: {0}")]
    Transport(String),
    #[error("authority returned an undecodable response: {0}")]
    Malformed(String),
}

/// Token validation authority.
///
/// Implementations may suspend (remote call); the gateway bounds each call
/// with its own timeout.
#[async_trait]
pub trait SessionAuthority: Send + Sync {
    async fn validate(&self, token: &ConnectionToken)
        -> Result<SessionDescriptor, AuthorityError>;
}

/// [`SessionAuthority`] backed by an HTTP endpoint.
///
/// Sends `POST <url>` with `{"token": "..."}`. A 2xx response body is the
/// descriptor; 401, 403, 404 and 410 mean the token is not valid.
pub struct HttpAuthority {
    client: reqwest::Client,
    url: url::Url,
    bearer_token: Option<String>,
}

#[derive(Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

impl HttpAuthority {
    pub fn new(
        url: url::Url,
        timeout: Duration,
        bearer_token: Option<String>,
    ) -> Result<Self, AuthorityError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthorityError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            url,
            bearer_token,
        })
    }
}

#[async_trait]
impl SessionAuthority for HttpAuthority {
    async fn validate(
        &self,
        token: &ConnectionToken,
    ) -> Result<SessionDescriptor, AuthorityError> {
        let mut request = self.client.post(self.url.clone()).json(&ValidateRequest {
            token: token.as_str(),
        });
        if let Some(bearer) = &self.bearer_token {
            request = request.bearer_auth(bearer);
        }

        let response = request
            .send()
            .await
            .map_err(|err| AuthorityError::Transport(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SessionDescriptor>()
                .await
                .map_err(|err| AuthorityError::Malformed(err.to_string()));
        }

        match status {
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::GONE => Err(AuthorityError::Rejected),
            other => Err(AuthorityError::Transport(format!(
                "unexpected status {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    #[test]
    fn console_kind_names_round_trip() {
        for name in ["novnc", "spice-html5", "serial", "bad-console-type"] {
            assert_eq!(ConsoleKind::from(name).as_str(), name);
        }
        assert_eq!(ConsoleKind::from("novnc"), ConsoleKind::NoVnc);
        assert_eq!(
            ConsoleKind::from("bad-console-type"),
            ConsoleKind::Other("bad-console-type".to_string())
        );
    }

    #[test]
    fn descriptor_accepts_string_port() {
        let descriptor: SessionDescriptor = serde_json::from_value(serde_json::json!({
            "host": "node1",
            "port": "10000",
            "console_type": "novnc",
        }))
        .unwrap();
        assert_eq!(
            descriptor,
            SessionDescriptor {
                host: "node1".to_string(),
                port: 10000,
                console_kind: ConsoleKind::NoVnc,
            }
        );
    }

    #[test]
    fn descriptor_accepts_numeric_port() {
        let descriptor: SessionDescriptor = serde_json::from_value(serde_json::json!({
            "host": "node2",
            "port": 5900,
            "console_type": "serial",
        }))
        .unwrap();
        assert_eq!(descriptor.port, 5900);
        assert_eq!(descriptor.console_kind, ConsoleKind::Serial);
    }

    #[test]
    fn descriptor_rejects_out_of_range_port() {
        let result = serde_json::from_value::<SessionDescriptor>(serde_json::json!({
            "host": "node1",
            "port": "70000",
            "console_type": "novnc",
        }));
        assert!(result.is_err());
    }

    // -----------------------------------------------------------------------
    // HttpAuthority against a local endpoint
    // -----------------------------------------------------------------------

    async fn serve(router: Router) -> url::Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        url::Url::parse(&format!("http://{addr}/tokens")).unwrap()
    }

    fn authority(url: url::Url) -> HttpAuthority {
        HttpAuthority::new(url, Duration::from_secs(2), Some("s3cret".to_string())).unwrap()
    }

    fn token(value: &str) -> ConnectionToken {
        ConnectionToken::new(value).unwrap()
    }

    #[tokio::test]
    async fn http_authority_decodes_valid_reply() {
        let router = Router::new().route(
            "/tokens",
            post(
                |headers: http::HeaderMap, Json(body): Json<serde_json::Value>| async move {
                    let authorized = headers
                        .get(http::header::AUTHORIZATION)
                        .and_then(|v| v.to_str().ok())
                        == Some("Bearer s3cret");
                    if !authorized || body["token"] != "123-456-789" {
                        return Err(StatusCode::NOT_FOUND);
                    }
                    Ok(Json(serde_json::json!({
                        "host": "node1",
                        "port": "10000",
                        "console_type": "novnc",
                    })))
                },
            ),
        );
        let authority = authority(serve(router).await);

        let descriptor = authority.validate(&token("123-456-789")).await.unwrap();
        assert_eq!(descriptor.host, "node1");
        assert_eq!(descriptor.port, 10000);

        let err = authority.validate(&token("XXX")).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Rejected));
    }

    #[tokio::test]
    async fn http_authority_server_error_is_transport() {
        let router = Router::new().route(
            "/tokens",
            post(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let authority = authority(serve(router).await);

        let err = authority.validate(&token("abc")).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Transport(_)));
    }

    #[tokio::test]
    async fn http_authority_bad_body_is_malformed() {
        let router = Router::new().route(
            "/tokens",
            post(|| async { Json(serde_json::json!({"host": "node1"})) }),
        );
        let authority = authority(serve(router).await);

        let err = authority.validate(&token("abc")).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Malformed(_)));
    }

    #[tokio::test]
    async fn http_authority_unreachable_is_transport() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let url = url::Url::parse(&format!("http://{addr}/tokens")).unwrap();

        let err = authority(url).validate(&token("abc")).await.unwrap_err();
        assert!(matches!(err, AuthorityError::Transport(_)));
    }
}
