//! Outbound HTTP on behalf of scripts.
//!
//! ## Security: Attribution
//!
//! Every request carries two identity headers naming the member who
//! triggered the script and the member who wrote it. They are written after
//! the caller's headers, replacing anything the script supplied under the
//! same name, so a remote service can always tell who made the call.
//!
//! Response bodies are read through a capped reader; anything past the cap is
//! dropped rather than rejected.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, Url};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::types::Author;

/// Header carrying the message author's identity
pub const AUTHOR_HEADER: &str = "x-arch-author";
/// Header carrying the script author's identity
pub const SCRIPT_AUTHOR_HEADER: &str = "x-arch-script-author";

/// Network mediator errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// URL could not be parsed
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Parse failure
        reason: String,
    },

    /// URL is not http or https
    #[error("unsupported url scheme '{0}'")]
    UnsupportedScheme(String),

    /// Header name or value is not valid HTTP
    #[error("invalid header '{0}'")]
    InvalidHeader(String),

    /// JSON body could not be encoded
    #[error("could not encode json body: {0}")]
    Encode(#[from] serde_json::Error),

    /// Connection or protocol failure
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failure while reading the response body
    #[error("could not read response body: {0}")]
    Read(#[from] std::io::Error),
}

/// Identity fields sent to remote services, named the way consumers expect them
#[derive(Clone, Debug, Serialize)]
pub struct IdentitySnapshot<'a> {
    /// User snowflake
    #[serde(rename = "Id")]
    pub id: u64,
    /// Account name
    #[serde(rename = "Name")]
    pub name: &'a str,
    /// Avatar URL
    #[serde(rename = "AvatarUrl")]
    pub avatar_url: &'a str,
    /// Top role colour
    #[serde(rename = "Color")]
    pub color: &'a str,
    /// Discriminator
    #[serde(rename = "Discrim")]
    pub discrim: u32,
    /// Role snowflakes
    #[serde(rename = "Roles")]
    pub roles: &'a [u64],
    /// Guild nickname
    #[serde(rename = "Nick")]
    pub nick: &'a str,
    /// Display name
    #[serde(rename = "Display_name")]
    pub display_name: &'a str,
    /// Permission bitset
    #[serde(rename = "Permissions")]
    pub permissions: u64,
}

impl<'a> From<&'a Author> for IdentitySnapshot<'a> {
    fn from(author: &'a Author) -> Self {
        Self {
            id: author.id,
            name: &author.name,
            avatar_url: &author.avatar_url,
            color: &author.color,
            discrim: author.discriminator,
            roles: &author.roles,
            nick: &author.nick,
            display_name: &author.disp_name,
            permissions: author.permissions,
        }
    }
}

/// JSON value of the attribution header for `author`
///
/// # Errors
/// Returns error if serialization fails
pub fn identity_json(author: &Author) -> Result<String, NetworkError> {
    Ok(serde_json::to_string(&IdentitySnapshot::from(author))?)
}

/// Settings for outbound calls
#[derive(Clone, Debug)]
pub struct MediatorConfig {
    /// Bytes of response body handed to the script
    pub max_response_bytes: usize,
    /// User-Agent sent with every request
    pub user_agent: String,
    /// Timeout for one request, connect through last body byte
    pub request_timeout: Duration,
}

/// Body of an outbound request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    Empty,
    /// Raw bytes
    Raw(Vec<u8>),
    /// Already encoded JSON document
    Json(String),
}

impl RequestBody {
    /// Choose a body; JSON wins when both are given
    #[must_use]
    pub fn choose(raw: Option<Vec<u8>>, json: Option<String>) -> Self {
        match (raw, json) {
            (_, Some(json)) => Self::Json(json),
            (Some(raw), None) => Self::Raw(raw),
            (None, None) => Self::Empty,
        }
    }
}

/// Status and (possibly truncated) body of a response
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediatedResponse {
    /// HTTP status code
    pub status: u16,
    /// Body text, at most `max_response_bytes` long before lossy decoding
    pub body: String,
}

/// Performs HTTP calls for one execution, stamping that execution's identities
pub struct NetworkMediator {
    client: Client,
    config: MediatorConfig,
    author: HeaderValue,
    script_author: HeaderValue,
    user_agent: HeaderValue,
}

impl NetworkMediator {
    /// Create a mediator for one execution.
    ///
    /// Builds a blocking HTTP client, so this must run off the async runtime.
    ///
    /// # Errors
    /// Returns error if a header value is invalid or the client cannot be built
    pub fn new(
        config: MediatorConfig,
        author_json: &str,
        script_author_json: &str,
    ) -> Result<Self, NetworkError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self {
            author: header_value(AUTHOR_HEADER, author_json.as_bytes())?,
            script_author: header_value(SCRIPT_AUTHOR_HEADER, script_author_json.as_bytes())?,
            user_agent: header_value(USER_AGENT.as_str(), config.user_agent.as_bytes())?,
            client,
            config,
        })
    }

    /// Issue a GET request
    ///
    /// # Errors
    /// Returns error on invalid input, connection failure or read failure
    pub fn get(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<MediatedResponse, NetworkError> {
        self.send(Method::GET, url, headers, RequestBody::Empty)
    }

    /// Issue a POST request
    ///
    /// # Errors
    /// Returns error on invalid input, connection failure or read failure
    pub fn post(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: RequestBody,
    ) -> Result<MediatedResponse, NetworkError> {
        self.send(Method::POST, url, headers, body)
    }

    fn send(
        &self,
        method: Method,
        url: &str,
        headers: &BTreeMap<String, String>,
        body: RequestBody,
    ) -> Result<MediatedResponse, NetworkError> {
        let url = parse_url(url)?;
        let mut header_map = self.stamp(headers)?;

        let mut request = self.client.request(method.clone(), url.clone());
        match body {
            RequestBody::Empty => {}
            RequestBody::Raw(bytes) => request = request.body(bytes),
            RequestBody::Json(json) => {
                if !header_map.contains_key(CONTENT_TYPE) {
                    header_map.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
                request = request.body(json);
            }
        }

        debug!(%method, %url, "script http request");
        let response = request.headers(header_map).send()?;
        let status = response.status().as_u16();

        let mut bytes = Vec::new();
        let limit = u64::try_from(self.config.max_response_bytes).unwrap_or(u64::MAX);
        response.take(limit).read_to_end(&mut bytes)?;

        debug!(status, bytes = bytes.len(), "script http response");
        Ok(MediatedResponse {
            status,
            body: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }

    /// Merge caller headers, then overwrite the attribution headers
    fn stamp(&self, headers: &BTreeMap<String, String>) -> Result<HeaderMap, NetworkError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NetworkError::InvalidHeader(name.clone()))?;
            map.insert(header, header_value(name, value.as_bytes())?);
        }

        map.insert(HeaderName::from_static(AUTHOR_HEADER), self.author.clone());
        map.insert(
            HeaderName::from_static(SCRIPT_AUTHOR_HEADER),
            self.script_author.clone(),
        );
        map.insert(USER_AGENT, self.user_agent.clone());
        Ok(map)
    }
}

fn header_value(name: &str, bytes: &[u8]) -> Result<HeaderValue, NetworkError> {
    HeaderValue::from_bytes(bytes).map_err(|_| NetworkError::InvalidHeader(name.to_string()))
}

fn parse_url(raw: &str) -> Result<Url, NetworkError> {
    let url = Url::parse(raw).map_err(|e| NetworkError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(NetworkError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn mediator(max_response_bytes: usize) -> NetworkMediator {
        let config = MediatorConfig {
            max_response_bytes,
            user_agent: "scriptbox-test".to_string(),
            request_timeout: Duration::from_secs(5),
        };
        let author = identity_json(&Author::new(1, "alice")).unwrap();
        let script_author = identity_json(&Author::new(2, "bob")).unwrap();
        NetworkMediator::new(config, &author, &script_author).unwrap()
    }

    #[test]
    fn test_identity_json_field_names() {
        let mut author = Author::new(7, "jame");
        author.roles = vec![1, 2];
        author.discriminator = 11;

        let json = identity_json(&author).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["Id"], 7);
        assert_eq!(value["Name"], "jame");
        assert_eq!(value["Discrim"], 11);
        assert_eq!(value["Roles"], serde_json::json!([1, 2]));
        assert_eq!(value["Display_name"], "jame");
    }

    #[test]
    fn test_body_prefers_json() {
        let body = RequestBody::choose(Some(b"raw".to_vec()), Some("{}".to_string()));
        assert_eq!(body, RequestBody::Json("{}".to_string()));
        assert_eq!(RequestBody::choose(None, None), RequestBody::Empty);
        assert_eq!(
            RequestBody::choose(Some(b"raw".to_vec()), None),
            RequestBody::Raw(b"raw".to_vec())
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        let mediator = mediator(1024);
        assert!(matches!(
            mediator.get("not a url", &BTreeMap::new()),
            Err(NetworkError::InvalidUrl { .. })
        ));
        assert!(matches!(
            mediator.get("file:///etc/passwd", &BTreeMap::new()),
            Err(NetworkError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_attribution_headers_cannot_be_forged() {
        let mut server = mockito::Server::new();
        let author = identity_json(&Author::new(1, "alice")).unwrap();
        let script_author = identity_json(&Author::new(2, "bob")).unwrap();
        let mock = server
            .mock("GET", "/whoami")
            .match_header(AUTHOR_HEADER, author.as_str())
            .match_header(SCRIPT_AUTHOR_HEADER, script_author.as_str())
            .match_header("user-agent", "scriptbox-test")
            .match_header("x-custom", "kept")
            .with_status(200)
            .with_body("ok")
            .create();

        let mut headers = BTreeMap::new();
        headers.insert("X-Arch-Author".to_string(), "forged".to_string());
        headers.insert("x-arch-script-author".to_string(), "forged".to_string());
        headers.insert("User-Agent".to_string(), "forged".to_string());
        headers.insert("X-Custom".to_string(), "kept".to_string());

        let response = mediator(1024)
            .get(&format!("{}/whoami", server.url()), &headers)
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "ok");
        mock.assert();
    }

    #[test]
    fn test_body_truncated_to_cap() {
        let mut server = mockito::Server::new();
        server
            .mock("GET", "/big")
            .with_status(200)
            .with_body("x".repeat(100))
            .create();

        let response = mediator(16)
            .get(&format!("{}/big", server.url()), &BTreeMap::new())
            .unwrap();
        assert_eq!(response.body.len(), 16);
    }

    #[test]
    fn test_post_json_sets_content_type() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/submit")
            .match_header("content-type", "application/json")
            .match_body(Matcher::JsonString(r#"{"a":1}"#.to_string()))
            .with_status(201)
            .with_body("{}")
            .create();

        let response = mediator(1024)
            .post(
                &format!("{}/submit", server.url()),
                &BTreeMap::new(),
                RequestBody::Json(r#"{"a":1}"#.to_string()),
            )
            .unwrap();

        assert_eq!(response.status, 201);
        mock.assert();
    }

    #[test]
    fn test_post_raw_body() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/raw")
            .match_body("hello")
            .with_status(200)
            .create();

        let response = mediator(1024)
            .post(
                &format!("{}/raw", server.url()),
                &BTreeMap::new(),
                RequestBody::Raw(b"hello".to_vec()),
            )
            .unwrap();

        assert_eq!(response.status, 200);
        assert!(response.body.is_empty());
        mock.assert();
    }
}
