//! Azure Storage Queues provider using the HTTP REST API.
//!
//! Talks to the queue service directly with `reqwest` instead of an SDK so
//! every request can be exercised against a mock HTTP server in tests.
//!
//! ## Authentication
//!
//! - **Shared key**: connection string with `AccountName` and `AccountKey`;
//!   each request is signed with HMAC-SHA256 over the canonicalized request
//! - **Shared access signature**: connection string with
//!   `SharedAccessSignature`; the token is appended to every request URL
//! - **Bearer token**: service endpoint plus a [`TokenCredential`]
//! - **Development storage**: `UseDevelopmentStorage=true` targets a local
//!   emulator with its well-known account
//!
//! ## Operation mapping
//!
//! | Capability          | Request                                              |
//! |---------------------|------------------------------------------------------|
//! | `create_if_missing` | `PUT /{queue}`                                       |
//! | `exists`            | `GET /{queue}?comp=metadata`                         |
//! | `clear_all`         | `DELETE /{queue}/messages`                           |
//! | `enqueue`           | `POST /{queue}/messages?visibilitytimeout&messagettl`|
//! | `lease_one/many`    | `GET /{queue}/messages?numofmessages&visibilitytimeout`|
//! | `extend_lease`      | `PUT /{queue}/messages/{id}?popreceipt&visibilitytimeout`|
//! | `delete`            | `DELETE /{queue}/messages/{id}?popreceipt`           |

use crate::client::{QueueClient, QueueClientFactory};
use crate::error::{ConfigurationError, QueueError, ValidationError};
use crate::message::{LeaseExtension, LeaseToken, LeasedMessage, MessageId, QueueName, Timestamp};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};
use url::Url;
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "storage_tests.rs"]
mod tests;

type HmacSha256 = Hmac<Sha256>;

const API_VERSION: &str = "2021-12-02";
const PROVIDER_NAME: &str = "AzureStorageQueue";
const STORAGE_SCOPE: &str = "https://storage.azure.com/.default";
const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";

const DEVELOPMENT_ACCOUNT: &str = "devstoreaccount1";
const DEVELOPMENT_ACCOUNT_KEY: &str =
    "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";
const DEVELOPMENT_ENDPOINT: &str = "http://127.0.0.1:10001/devstoreaccount1";

/// Largest message text accepted by the service
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

const MAX_VISIBILITY_SECONDS: i64 = 7 * 24 * 60 * 60;
const MAX_MESSAGES_PER_REQUEST: u32 = 32;
const DEFAULT_REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// ============================================================================
// Error Types
// ============================================================================

/// Storage queue specific errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message not found or pop receipt mismatch: {0}")]
    InvalidPopReceipt(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Storage service error ({code}): {message}")]
    ServiceError { code: String, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StorageError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::Timeout(_) => true,
            Self::QueueNotFound(_) => false,
            Self::InvalidPopReceipt(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::ServiceError { .. } => true,
            Self::InvalidResponse(_) => false,
        }
    }

    /// Map storage error to QueueError
    pub fn into_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::NetworkError(message) => QueueError::ConnectionFailed { message },
            Self::Timeout(duration) => QueueError::Timeout {
                duration: crate::time::to_chrono(duration),
            },
            Self::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            Self::InvalidPopReceipt(lease_token) => QueueError::MessageNotFound { lease_token },
            Self::MessageTooLarge { size, max_size } => {
                QueueError::MessageTooLarge { size, max_size }
            }
            Self::ServiceError { code, message } => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code,
                message,
            },
            Self::InvalidResponse(message) => QueueError::ProviderError {
                provider: PROVIDER_NAME.to_string(),
                code: "InvalidResponse".to_string(),
                message,
            },
        }
    }
}

impl From<StorageError> for QueueError {
    fn from(err: StorageError) -> Self {
        err.into_queue_error()
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Source of OAuth bearer tokens for the storage service
#[async_trait]
pub trait TokenCredential: Send + Sync {
    /// Get a token valid for the given scope
    async fn get_token(&self, scope: &str) -> Result<String, QueueError>;
}

/// Credential that always returns the same pre-acquired token
pub struct StaticTokenCredential {
    token: Zeroizing<String>,
}

impl StaticTokenCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Zeroizing::new(token.into()),
        }
    }
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
    async fn get_token(&self, _scope: &str) -> Result<String, QueueError> {
        Ok(self.token.as_str().to_string())
    }
}

enum Credentials {
    SharedKey(SharedKeySigner),
    SharedAccessSignature(Zeroizing<String>),
    Token(Arc<dyn TokenCredential>),
}

/// Shared key signer for storage service requests.
///
/// Builds the string to sign from the verb, the standard headers, the
/// canonicalized `x-ms-*` headers and the canonicalized resource, then signs
/// it with HMAC-SHA256 keyed by the decoded account key.
///
/// See <https://learn.microsoft.com/rest/api/storageservices/authorize-with-shared-key>
struct SharedKeySigner {
    account: String,
    key: Zeroizing<Vec<u8>>,
}

impl SharedKeySigner {
    fn new(account: &str, key_base64: &str) -> Result<Self, ConfigurationError> {
        let key = general_purpose::STANDARD
            .decode(key_base64)
            .map_err(|_| ConfigurationError::Invalid {
                message: "AccountKey is not valid base64".to_string(),
            })?;

        Ok(Self {
            account: account.to_string(),
            key: Zeroizing::new(key),
        })
    }

    fn string_to_sign(
        &self,
        method: &Method,
        url: &Url,
        ms_headers: &BTreeMap<String, String>,
        content_length: usize,
        content_type: Option<&str>,
    ) -> String {
        let content_length = if content_length == 0 {
            String::new()
        } else {
            content_length.to_string()
        };

        // VERB, Content-Encoding, Content-Language, Content-Length, Content-MD5,
        // Content-Type, Date, If-Modified-Since, If-Match, If-None-Match,
        // If-Unmodified-Since, Range
        let mut value = format!(
            "{}\n\n\n{}\n\n{}\n\n\n\n\n\n\n",
            method.as_str(),
            content_length,
            content_type.unwrap_or_default()
        );

        for (name, header_value) in ms_headers {
            value.push_str(&format!("{}:{}\n", name, header_value.trim()));
        }

        value.push_str(&self.canonicalized_resource(url));
        value
    }

    fn canonicalized_resource(&self, url: &Url) -> String {
        let mut resource = format!("/{}{}", self.account, url.path());

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }

        for (name, mut values) in params {
            values.sort();
            resource.push_str(&format!("\n{}:{}", name, values.join(",")));
        }

        resource
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC can take key of any size");
        mac.update(string_to_sign.as_bytes());
        general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    fn authorization(
        &self,
        method: &Method,
        url: &Url,
        ms_headers: &BTreeMap<String, String>,
        content_length: usize,
        content_type: Option<&str>,
    ) -> String {
        let string_to_sign =
            self.string_to_sign(method, url, ms_headers, content_length, content_type);
        format!("SharedKey {}:{}", self.account, self.sign(&string_to_sign))
    }
}

// ============================================================================
// Connection String
// ============================================================================

/// Parse a storage connection string into a queue endpoint and credentials
fn parse_connection_string(value: &str) -> Result<(Url, Credentials), ConfigurationError> {
    let mut settings: HashMap<String, String> = HashMap::new();
    for segment in value.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, setting) =
            segment
                .split_once('=')
                .ok_or_else(|| ConfigurationError::Parsing {
                    message: "connection string segments must be key=value pairs".to_string(),
                })?;
        settings.insert(key.trim().to_ascii_lowercase(), setting.trim().to_string());
    }

    if settings
        .get("usedevelopmentstorage")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    {
        let endpoint = parse_endpoint(DEVELOPMENT_ENDPOINT)?;
        let signer = SharedKeySigner::new(DEVELOPMENT_ACCOUNT, DEVELOPMENT_ACCOUNT_KEY)?;
        return Ok((endpoint, Credentials::SharedKey(signer)));
    }

    let account = settings.get("accountname");
    let endpoint = match settings.get("queueendpoint") {
        Some(endpoint) => parse_endpoint(endpoint)?,
        None => {
            let account = account.ok_or_else(|| ConfigurationError::Missing {
                key: "AccountName".to_string(),
            })?;
            let protocol = settings
                .get("defaultendpointsprotocol")
                .map(String::as_str)
                .unwrap_or("https");
            let suffix = settings
                .get("endpointsuffix")
                .map(String::as_str)
                .unwrap_or("core.windows.net");
            parse_endpoint(&format!("{}://{}.queue.{}", protocol, account, suffix))?
        }
    };

    let credentials = if let Some(key) = settings.get("accountkey") {
        let account = account.ok_or_else(|| ConfigurationError::Missing {
            key: "AccountName".to_string(),
        })?;
        Credentials::SharedKey(SharedKeySigner::new(account, key)?)
    } else if let Some(sas) = settings.get("sharedaccesssignature") {
        Credentials::SharedAccessSignature(Zeroizing::new(sas.trim_start_matches('?').to_string()))
    } else {
        return Err(ConfigurationError::Missing {
            key: "AccountKey".to_string(),
        });
    };

    Ok((endpoint, credentials))
}

fn parse_endpoint(value: &str) -> Result<Url, ConfigurationError> {
    let mut url = Url::parse(value).map_err(|e| ConfigurationError::Invalid {
        message: format!("'{}' is not a valid queue endpoint: {}", value, e),
    })?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

// ============================================================================
// Configuration
// ============================================================================

/// How message payloads are represented in the service's message text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageEncoding {
    /// Payload is sent as (XML-escaped) UTF-8 text
    #[default]
    Text,
    /// Payload is base64 encoded
    Base64,
}

impl FromStr for MessageEncoding {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "none" => Ok(Self::Text),
            "base64" => Ok(Self::Base64),
            _ => Err(ValidationError::InvalidFormat {
                field: "message_encoding".to_string(),
                message: format!("'{}' is not one of: text, base64", s),
            }),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

struct StorageAccount {
    http_client: HttpClient,
    endpoint: Url,
    credentials: Credentials,
    encoding: MessageEncoding,
    request_timeout: std::time::Duration,
}

/// Storage queue service client factory.
///
/// Clients are cached per queue name; the HTTP connection pool is shared by
/// all of them.
pub struct StorageQueueFactory {
    account: Arc<StorageAccount>,
    clients: RwLock<HashMap<QueueName, Arc<StorageQueueClient>>>,
}

impl StorageQueueFactory {
    /// Create a factory from a storage connection string
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigurationError> {
        let (endpoint, credentials) = parse_connection_string(connection_string)?;
        Self::build(endpoint, credentials, MessageEncoding::default(), DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a factory for a queue service endpoint authenticated with bearer tokens
    pub fn with_token_credential(
        endpoint: &str,
        credential: Arc<dyn TokenCredential>,
    ) -> Result<Self, ConfigurationError> {
        let endpoint = parse_endpoint(endpoint)?;
        Self::build(
            endpoint,
            Credentials::Token(credential),
            MessageEncoding::default(),
            DEFAULT_REQUEST_TIMEOUT,
        )
    }

    /// Use a different message text encoding
    pub fn with_message_encoding(self, encoding: MessageEncoding) -> Result<Self, ConfigurationError> {
        let account = self.into_account()?;
        Self::build(account.endpoint, account.credentials, encoding, account.request_timeout)
    }

    /// Use a different per-request timeout
    pub fn with_request_timeout(
        self,
        timeout: std::time::Duration,
    ) -> Result<Self, ConfigurationError> {
        let account = self.into_account()?;
        Self::build(account.endpoint, account.credentials, account.encoding, timeout)
    }

    /// Queue service endpoint requests are sent to
    pub fn endpoint(&self) -> &Url {
        &self.account.endpoint
    }

    /// Get a concrete client, bypassing the trait object
    pub fn client(&self, queue: &QueueName) -> Arc<StorageQueueClient> {
        if let Ok(clients) = self.clients.read() {
            if let Some(client) = clients.get(queue) {
                return Arc::clone(client);
            }
        }

        let client = Arc::new(StorageQueueClient {
            name: queue.clone(),
            account: Arc::clone(&self.account),
        });

        if let Ok(mut clients) = self.clients.write() {
            return Arc::clone(clients.entry(queue.clone()).or_insert(client));
        }
        client
    }

    fn build(
        endpoint: Url,
        credentials: Credentials,
        encoding: MessageEncoding,
        request_timeout: std::time::Duration,
    ) -> Result<Self, ConfigurationError> {
        let http_client = HttpClient::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ConfigurationError::Invalid {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            account: Arc::new(StorageAccount {
                http_client,
                endpoint,
                credentials,
                encoding,
                request_timeout,
            }),
            clients: RwLock::new(HashMap::new()),
        })
    }

    fn into_account(self) -> Result<StorageAccount, ConfigurationError> {
        drop(self.clients);
        Arc::try_unwrap(self.account).map_err(|_| ConfigurationError::Invalid {
            message: "factory settings cannot change once clients are in use".to_string(),
        })
    }
}

impl QueueClientFactory for StorageQueueFactory {
    fn get_queue(&self, queue: &QueueName) -> Result<Arc<dyn QueueClient>, QueueError> {
        Ok(self.client(queue))
    }
}

// ============================================================================
// Client
// ============================================================================

struct StorageResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

/// Client bound to one storage queue
pub struct StorageQueueClient {
    name: QueueName,
    account: Arc<StorageAccount>,
}

impl StorageQueueClient {
    fn queue_url(&self, segments: &[&str]) -> Url {
        let mut url = self.account.endpoint.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(self.name.as_str());
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    /// Send a request and map non-success responses to errors
    async fn execute(
        &self,
        method: Method,
        mut url: Url,
        body: Option<String>,
        lease_token: Option<&LeaseToken>,
    ) -> Result<StorageResponse, StorageError> {
        if let Credentials::SharedAccessSignature(sas) = &self.account.credentials {
            let pairs: Vec<(String, String)> = url::form_urlencoded::parse(sas.as_bytes())
                .into_owned()
                .collect();
            url.query_pairs_mut().extend_pairs(pairs);
        }

        let mut ms_headers = BTreeMap::new();
        ms_headers.insert(
            "x-ms-date".to_string(),
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        ms_headers.insert("x-ms-version".to_string(), API_VERSION.to_string());

        let content_length = body.as_ref().map(String::len).unwrap_or(0);
        let content_type = body.as_ref().map(|_| XML_CONTENT_TYPE);

        let mut request = self.account.http_client.request(method.clone(), url.clone());
        for (name, value) in &ms_headers {
            request = request.header(name.as_str(), value.as_str());
        }

        match &self.account.credentials {
            Credentials::SharedKey(signer) => {
                let authorization =
                    signer.authorization(&method, &url, &ms_headers, content_length, content_type);
                request = request.header(AUTHORIZATION, authorization);
            }
            Credentials::Token(credential) => {
                let token = credential
                    .get_token(STORAGE_SCOPE)
                    .await
                    .map_err(|e| StorageError::Authentication(e.to_string()))?;
                request = request.bearer_auth(token);
            }
            Credentials::SharedAccessSignature(_) => {}
        }

        if let Some(content_type) = content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        if method != Method::GET {
            request = request.body(body.unwrap_or_default());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StorageError::Timeout(self.account.request_timeout)
            } else if e.is_connect() {
                StorageError::NetworkError(format!("Connection failed: {}", e))
            } else {
                StorageError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| StorageError::NetworkError(format!("Failed to read response body: {}", e)))?;

        debug!(
            queue = %self.name,
            method = %method,
            status = status.as_u16(),
            "Storage queue request completed"
        );

        if !status.is_success() {
            return Err(self.parse_error_response(&body, &headers, status, content_length, lease_token));
        }

        Ok(StorageResponse {
            status,
            headers,
            body,
        })
    }

    /// Map an error response (XML body and/or `x-ms-error-code` header)
    fn parse_error_response(
        &self,
        xml: &str,
        headers: &HeaderMap,
        status: StatusCode,
        request_size: usize,
        lease_token: Option<&LeaseToken>,
    ) -> StorageError {
        let (body_code, message) = parse_error_xml(xml);
        let code = body_code
            .or_else(|| {
                headers
                    .get("x-ms-error-code")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        let message = message.unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

        match code.as_str() {
            "QueueNotFound" | "QueueBeingDeleted" => StorageError::QueueNotFound(self.name.to_string()),
            "MessageNotFound" | "PopReceiptMismatch" => StorageError::InvalidPopReceipt(
                lease_token.map(|t| t.to_string()).unwrap_or(message),
            ),
            "RequestBodyTooLarge" | "MessageTooLarge" => StorageError::MessageTooLarge {
                size: request_size,
                max_size: MAX_MESSAGE_SIZE,
            },
            "AuthenticationFailed" | "AuthorizationFailure" | "InvalidAuthenticationInfo" => {
                StorageError::Authentication(format!("{}: {}", code, message))
            }
            _ if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                StorageError::Authentication(format!("{}: {}", code, message))
            }
            _ => StorageError::ServiceError {
                code: code.clone(),
                message,
            },
        }
    }

    fn encode_text(&self, payload: &[u8]) -> Result<String, QueueError> {
        match self.account.encoding {
            MessageEncoding::Base64 => Ok(general_purpose::STANDARD.encode(payload)),
            MessageEncoding::Text => std::str::from_utf8(payload)
                .map(str::to_string)
                .map_err(|_| {
                    QueueError::ValidationError(ValidationError::InvalidFormat {
                        field: "payload".to_string(),
                        message: "text message encoding requires a UTF-8 payload".to_string(),
                    })
                }),
        }
    }

    fn decode_text(&self, text: &str) -> Result<Bytes, StorageError> {
        match self.account.encoding {
            MessageEncoding::Text => Ok(Bytes::copy_from_slice(text.as_bytes())),
            MessageEncoding::Base64 => general_purpose::STANDARD
                .decode(text)
                .map(Bytes::from)
                .map_err(|e| StorageError::InvalidResponse(format!("message text is not base64: {}", e))),
        }
    }

    async fn get_messages(
        &self,
        count: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError> {
        let mut url = self.queue_url(&["messages"]);
        url.query_pairs_mut()
            .append_pair("numofmessages", &count.clamp(1, MAX_MESSAGES_PER_REQUEST).to_string())
            .append_pair("visibilitytimeout", &whole_seconds(lease, 1).to_string());

        let response = self.execute(Method::GET, url, None, None).await?;
        let raw = parse_message_list(&response.body)?;

        raw.into_iter()
            .map(|m| {
                Ok(LeasedMessage {
                    payload: self.decode_text(&m.text)?,
                    message_id: m.message_id,
                    lease_token: m.pop_receipt,
                    next_visible_on: m.time_next_visible,
                    dequeue_count: m.dequeue_count,
                })
            })
            .collect::<Result<Vec<_>, StorageError>>()
            .map_err(QueueError::from)
    }
}

#[async_trait]
impl QueueClient for StorageQueueClient {
    fn queue_name(&self) -> &QueueName {
        &self.name
    }

    async fn create_if_missing(&self) -> Result<(), QueueError> {
        let url = self.queue_url(&[]);
        match self.execute(Method::PUT, url, None, None).await {
            Ok(response) => {
                if response.status == StatusCode::NO_CONTENT {
                    debug!(queue = %self.name, "Queue already exists");
                }
                Ok(())
            }
            Err(StorageError::ServiceError { code, .. }) if code == "QueueAlreadyExists" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self) -> Result<bool, QueueError> {
        let mut url = self.queue_url(&[]);
        url.query_pairs_mut().append_pair("comp", "metadata");
        match self.execute(Method::GET, url, None, None).await {
            Ok(_) => Ok(true),
            Err(StorageError::QueueNotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_all(&self) -> Result<(), QueueError> {
        let url = self.queue_url(&["messages"]);
        self.execute(Method::DELETE, url, None, None).await?;
        Ok(())
    }

    async fn enqueue(
        &self,
        payload: Bytes,
        time_to_live: Option<Duration>,
        initial_delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        let text = self.encode_text(&payload)?;
        if text.len() > MAX_MESSAGE_SIZE {
            return Err(QueueError::MessageTooLarge {
                size: text.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }
        if let Some(delay) = initial_delay {
            if delay > Duration::seconds(MAX_VISIBILITY_SECONDS) {
                return Err(QueueError::ValidationError(ValidationError::OutOfRange {
                    field: "initial_delay".to_string(),
                    message: format!(
                        "{}s exceeds the service limit of {}s",
                        delay.num_seconds(),
                        MAX_VISIBILITY_SECONDS
                    ),
                }));
            }
        }

        let mut url = self.queue_url(&["messages"]);
        {
            let mut query = url.query_pairs_mut();
            if let Some(delay) = initial_delay {
                query.append_pair("visibilitytimeout", &whole_seconds(delay, 0).to_string());
            }
            if let Some(ttl) = time_to_live {
                let seconds = ((ttl.num_milliseconds() + 999).div_euclid(1000)).max(1);
                query.append_pair("messagettl", &seconds.to_string());
            }
        }

        let body = format!(
            "<QueueMessage><MessageText>{}</MessageText></QueueMessage>",
            quick_xml::escape::escape(&text)
        );

        self.execute(Method::POST, url, Some(body), None).await?;
        Ok(())
    }

    async fn lease_one(&self, lease: Duration) -> Result<Option<LeasedMessage>, QueueError> {
        Ok(self.get_messages(1, lease).await?.into_iter().next())
    }

    async fn lease_many(
        &self,
        max_messages: u32,
        lease: Duration,
    ) -> Result<Vec<LeasedMessage>, QueueError> {
        self.get_messages(max_messages, lease).await
    }

    async fn extend_lease(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
        duration: Duration,
    ) -> Result<LeaseExtension, QueueError> {
        let mut url = self.queue_url(&["messages", message_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("popreceipt", lease_token.as_str())
            .append_pair("visibilitytimeout", &whole_seconds(duration, 0).to_string());

        let response = self
            .execute(Method::PUT, url, None, Some(lease_token))
            .await?;

        let new_token = header_value(&response.headers, "x-ms-popreceipt")?;
        let next_visible = header_value(&response.headers, "x-ms-time-next-visible")?;

        Ok(LeaseExtension {
            lease_token: LeaseToken::new(new_token),
            next_visible_on: parse_http_date(&next_visible)?,
        })
    }

    async fn delete(
        &self,
        message_id: &MessageId,
        lease_token: &LeaseToken,
    ) -> Result<(), QueueError> {
        let mut url = self.queue_url(&["messages", message_id.as_str()]);
        url.query_pairs_mut()
            .append_pair("popreceipt", lease_token.as_str());

        self.execute(Method::DELETE, url, None, Some(lease_token))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Duration in whole seconds, rounded up and clamped to the service range
fn whole_seconds(duration: Duration, min: i64) -> i64 {
    let seconds = (duration.num_milliseconds() + 999).div_euclid(1000);
    seconds.clamp(min, MAX_VISIBILITY_SECONDS)
}

fn header_value(headers: &HeaderMap, name: &str) -> Result<String, StorageError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| StorageError::InvalidResponse(format!("response is missing header {}", name)))
}

/// Parse an RFC 1123 date as used by the storage service
fn parse_http_date(value: &str) -> Result<Timestamp, StorageError> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| Timestamp::from_datetime(dt.with_timezone(&Utc)))
        .map_err(|e| StorageError::InvalidResponse(format!("invalid date '{}': {}", value, e)))
}

/// Extract `Code` and `Message` from a storage error body
fn parse_error_xml(xml: &str) -> (Option<String>, Option<String>) {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut error_code = None;
    let mut error_message = None;
    let mut in_error = false;
    let mut in_code = false;
    let mut in_message = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"Error" => in_error = true,
                b"Code" if in_error => in_code = true,
                b"Message" if in_error => in_message = true,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                if in_code {
                    error_code = e.unescape().ok().map(|s| s.into_owned());
                    in_code = false;
                } else if in_message {
                    error_message = e.unescape().ok().map(|s| s.into_owned());
                    in_message = false;
                }
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == b"Error" => {
                in_error = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    (error_code, error_message)
}

#[derive(Debug)]
struct RawMessage {
    message_id: MessageId,
    pop_receipt: LeaseToken,
    time_next_visible: Timestamp,
    dequeue_count: u32,
    text: String,
}

#[derive(Default)]
struct RawMessageBuilder {
    message_id: Option<String>,
    pop_receipt: Option<String>,
    time_next_visible: Option<String>,
    dequeue_count: Option<String>,
    text: Option<String>,
}

impl RawMessageBuilder {
    fn build(self) -> Result<RawMessage, StorageError> {
        let missing = |field: &str| StorageError::InvalidResponse(format!("{} not found in message", field));

        let message_id = self.message_id.ok_or_else(|| missing("MessageId"))?;
        let pop_receipt = self.pop_receipt.ok_or_else(|| missing("PopReceipt"))?;
        let time_next_visible = self
            .time_next_visible
            .ok_or_else(|| missing("TimeNextVisible"))?;
        let dequeue_count = match self.dequeue_count {
            Some(count) => count.parse::<u32>().map_err(|_| {
                StorageError::InvalidResponse(format!("invalid DequeueCount '{}'", count))
            })?,
            None => 1,
        };

        Ok(RawMessage {
            message_id: MessageId::from_str(&message_id)
                .map_err(|e| StorageError::InvalidResponse(e.to_string()))?,
            pop_receipt: LeaseToken::new(pop_receipt),
            time_next_visible: parse_http_date(&time_next_visible)?,
            dequeue_count,
            text: self.text.unwrap_or_default(),
        })
    }
}

/// Parse a `QueueMessagesList` response
fn parse_message_list(xml: &str) -> Result<Vec<RawMessage>, StorageError> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut current: Option<RawMessageBuilder> = None;
    let mut element: Vec<u8> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"QueueMessage" {
                    current = Some(RawMessageBuilder::default());
                } else {
                    element = e.name().as_ref().to_vec();
                }
            }
            Ok(Event::Text(e)) => {
                if let Some(builder) = current.as_mut() {
                    let text = e
                        .unescape()
                        .map(|s| s.into_owned())
                        .map_err(|e| StorageError::InvalidResponse(format!("Failed to parse XML: {}", e)))?;
                    match element.as_slice() {
                        b"MessageId" => builder.message_id = Some(text),
                        b"PopReceipt" => builder.pop_receipt = Some(text),
                        b"TimeNextVisible" => builder.time_next_visible = Some(text),
                        b"DequeueCount" => builder.dequeue_count = Some(text),
                        b"MessageText" => builder.text = Some(text),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"QueueMessage" {
                    if let Some(builder) = current.take() {
                        messages.push(builder.build()?);
                    }
                }
                element.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!(error = %e, "Malformed message list from storage queue");
                return Err(StorageError::InvalidResponse(format!(
                    "XML parsing error: {}",
                    e
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}
