use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::blocking::Client;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MediaToolConfig;
use crate::content::{ContentItem, ItemKind, SettingEntry, SiteSettings};

const ADMIN_AUDIENCE: &str = "/admin/";
const TOKEN_REFRESH_MARGIN_SECS: u64 = 30;
const ITEM_FORMATS: &str = "html,lexical,mobiledoc";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("content API rate limited the request (HTTP {status})")]
    RateLimited { status: u16 },
    #[error("transient content API failure: {0}")]
    Transient(String),
    #[error("content API request failed with HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("content API unreachable: {0}")]
    Unreachable(String),
    #[error("failed to decode content API response: {0}")]
    Decode(String),
    #[error("content API authentication failed: {0}")]
    Auth(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ItemPage {
    pub items: Vec<Value>,
    pub next_page: Option<u32>,
}

/// Remote content store seam. Implemented by the Ghost Admin client and by
/// in-memory fakes in tests.
pub trait ContentApi {
    fn list_items(&mut self, kind: ItemKind, page: u32, limit: u32) -> Result<ItemPage, ApiError>;
    fn fetch_item(&mut self, kind: ItemKind, id: &str) -> Result<ContentItem, ApiError>;
    fn patch_item(&mut self, item: &ContentItem) -> Result<ContentItem, ApiError>;
    fn fetch_settings(&mut self) -> Result<SiteSettings, ApiError>;
    fn patch_settings(&mut self, entries: &[SettingEntry]) -> Result<SiteSettings, ApiError>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct GhostClientConfig {
    pub site_url: String,
    pub admin_api_key: String,
    pub token_ttl: Duration,
    pub accept_version: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl GhostClientConfig {
    pub fn from_config(config: &MediaToolConfig) -> Result<Self> {
        let (site_url, admin_api_key) = config.require_remote()?;
        Ok(Self {
            site_url: site_url.trim_end_matches('/').to_string(),
            admin_api_key,
            token_ttl: config.token_ttl(),
            accept_version: config.accept_version(),
            user_agent: config.user_agent(),
            timeout_ms: config.timeout_ms(),
            rate_limit_ms: config.rate_limit_ms(),
            max_retries: config.max_retries(),
            retry_delay_ms: u64::try_from(config.retry_delay().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

#[derive(Debug, Clone)]
struct AdminKey {
    id: String,
    secret: Vec<u8>,
}

impl AdminKey {
    fn parse(raw: &str) -> Result<Self, ApiError> {
        let (id, secret) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| ApiError::Auth("admin API key must have the form id:secret".into()))?;
        if id.is_empty() {
            return Err(ApiError::Auth("admin API key id is empty".into()));
        }
        let secret = hex::decode(secret)
            .map_err(|error| ApiError::Auth(format!("admin API key secret is not hex: {error}")))?;
        Ok(Self {
            id: id.to_string(),
            secret,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    iat: u64,
    exp: u64,
    aud: String,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: u64,
}

impl CachedToken {
    fn is_fresh(&self, now: u64) -> bool {
        self.expires_at > now.saturating_add(TOKEN_REFRESH_MARGIN_SECS)
    }
}

fn sign_token(key: &AdminKey, ttl: Duration, now: u64) -> Result<CachedToken, ApiError> {
    let header = Header {
        kid: Some(key.id.clone()),
        ..Header::new(Algorithm::HS256)
    };
    let expires_at = now.saturating_add(ttl.as_secs());
    let claims = TokenClaims {
        iat: now,
        exp: expires_at,
        aud: ADMIN_AUDIENCE.to_string(),
    };
    let value = encode(&header, &claims, &EncodingKey::from_secret(&key.secret))
        .map_err(|error| ApiError::Auth(format!("failed to sign admin token: {error}")))?;
    Ok(CachedToken { value, expires_at })
}

pub struct GhostAdminClient {
    client: Client,
    config: GhostClientConfig,
    key: AdminKey,
    token: Option<CachedToken>,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl GhostAdminClient {
    pub fn from_config(config: &MediaToolConfig) -> Result<Self> {
        Self::new(GhostClientConfig::from_config(config)?)
    }

    pub fn new(config: GhostClientConfig) -> Result<Self> {
        let key = AdminKey::parse(&config.admin_api_key).context("invalid admin API key")?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to build Ghost Admin HTTP client")?;
        Ok(Self {
            client,
            config,
            key,
            token: None,
            last_request_at: None,
            request_count: 0,
        })
    }

    fn authorization(&mut self) -> Result<String, ApiError> {
        let now = unix_timestamp();
        if let Some(token) = &self.token
            && token.is_fresh(now)
        {
            return Ok(format!("Ghost {}", token.value));
        }
        debug!("signing new admin API token");
        let token = sign_token(&self.key, self.config.token_ttl, now)?;
        let header = format!("Ghost {}", token.value);
        self.token = Some(token);
        Ok(header)
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}/ghost/api/admin/{path}", self.config.site_url)
    }

    /// GET requests are retried here; writes get a single attempt and are
    /// retried by the caller's policy.
    fn request(
        &mut self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let url = self.admin_url(path);
        let max_retries = if method == Method::GET {
            self.config.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            self.apply_rate_limit();
            let authorization = self.authorization()?;
            let mut request = self
                .client
                .request(method.clone(), &url)
                .header("Authorization", authorization)
                .header("Accept-Version", self.config.accept_version.clone())
                .query(query);
            if let Some(body) = body {
                request = request.json(body);
            }

            let outcome = match request.send() {
                Ok(response) => {
                    let status = response.status();
                    let text = response
                        .text()
                        .map_err(|error| ApiError::Decode(error.to_string()))?;
                    if status.is_success() {
                        return serde_json::from_str(&text)
                            .map_err(|error| ApiError::Decode(error.to_string()));
                    }
                    classify_status(status, &text)
                }
                Err(error) => classify_transport(&error),
            };

            if attempt < max_retries && outcome.is_retryable() {
                warn!(%url, attempt, error = %outcome, "retrying content API request");
                self.wait_before_retry(attempt);
                attempt += 1;
                continue;
            }
            return Err(outcome);
        }
    }

    fn apply_rate_limit(&mut self) {
        let delay = Duration::from_millis(self.config.rate_limit_ms);
        if let Some(last) = self.last_request_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                sleep(delay - elapsed);
            }
        }
        self.last_request_at = Some(Instant::now());
        self.request_count += 1;
    }

    fn wait_before_retry(&self, attempt: usize) {
        sleep(backoff_delay(
            Duration::from_millis(self.config.retry_delay_ms),
            attempt,
        ));
    }
}

impl ContentApi for GhostAdminClient {
    fn list_items(&mut self, kind: ItemKind, page: u32, limit: u32) -> Result<ItemPage, ApiError> {
        let payload = self.request(
            Method::GET,
            &format!("{}/", kind.collection()),
            &[
                ("page", page.to_string()),
                ("limit", limit.to_string()),
                ("formats", ITEM_FORMATS.to_string()),
            ],
            None,
        )?;
        parse_item_page(kind, payload)
    }

    fn fetch_item(&mut self, kind: ItemKind, id: &str) -> Result<ContentItem, ApiError> {
        let payload = self.request(
            Method::GET,
            &format!("{}/{id}/", kind.collection()),
            &[("formats", ITEM_FORMATS.to_string())],
            None,
        )?;
        first_item(kind, payload)
    }

    fn patch_item(&mut self, item: &ContentItem) -> Result<ContentItem, ApiError> {
        let value = item
            .to_value()
            .map_err(|error| ApiError::Decode(format!("{error:#}")))?;
        let mut envelope = serde_json::Map::new();
        envelope.insert(item.kind.collection().to_string(), Value::Array(vec![value]));
        let body = Value::Object(envelope);
        let mut query = vec![("formats", ITEM_FORMATS.to_string())];
        if !item.has_document() {
            query.push(("source", "html".to_string()));
        }
        let payload = self.request(
            Method::PUT,
            &format!("{}/{}/", item.kind.collection(), item.id),
            &query,
            Some(&body),
        )?;
        first_item(item.kind, payload)
    }

    fn fetch_settings(&mut self) -> Result<SiteSettings, ApiError> {
        let payload = self.request(Method::GET, "settings/", &[], None)?;
        parse_settings(payload)
    }

    fn patch_settings(&mut self, entries: &[SettingEntry]) -> Result<SiteSettings, ApiError> {
        let body = json!({ "settings": entries });
        let payload = self.request(Method::PUT, "settings/", &[], Some(&body))?;
        parse_settings(payload)
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Exponential backoff with up to 100ms of jitter.
pub fn backoff_delay(base: Duration, attempt: usize) -> Duration {
    let exponent = u32::try_from(attempt).unwrap_or(16).min(16);
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let scaled = base_ms.saturating_mul(2u64.saturating_pow(exponent));
    let jitter = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| u64::from(duration.subsec_millis() % 100))
        .unwrap_or(0);
    Duration::from_millis(scaled.saturating_add(jitter))
}

fn classify_status(status: StatusCode, body: &str) -> ApiError {
    let message = error_message(body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
            status: status.as_u16(),
        },
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::CONFLICT
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => {
            ApiError::Transient(format!("HTTP {}: {message}", status.as_u16()))
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(message),
        _ => ApiError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

fn classify_transport(error: &reqwest::Error) -> ApiError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        ApiError::Transient(error.to_string())
    } else {
        ApiError::Unreachable(error.to_string())
    }
}

fn error_message(body: &str) -> String {
    #[derive(Deserialize, Default)]
    struct ErrorBody {
        #[serde(default)]
        errors: Vec<ErrorEntry>,
    }
    #[derive(Deserialize, Default)]
    struct ErrorEntry {
        #[serde(default)]
        message: String,
        #[serde(default)]
        context: Option<String>,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.errors.is_empty() => parsed
            .errors
            .iter()
            .map(|entry| match &entry.context {
                Some(context) => format!("{} ({context})", entry.message),
                None => entry.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.chars().take(200).collect(),
    }
}

#[derive(Debug, Deserialize, Default)]
struct ListMeta {
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Debug, Deserialize, Default)]
struct Pagination {
    #[serde(default)]
    next: Option<u32>,
}

fn parse_item_page(kind: ItemKind, mut payload: Value) -> Result<ItemPage, ApiError> {
    let items = match payload.get_mut(kind.collection()).map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => {
            return Err(ApiError::Decode(format!(
                "response has no {} array",
                kind.collection()
            )));
        }
    };
    let meta: ListMeta = payload
        .get("meta")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|error| ApiError::Decode(error.to_string()))?
        .unwrap_or_default();
    Ok(ItemPage {
        items,
        next_page: meta.pagination.next,
    })
}

fn first_item(kind: ItemKind, payload: Value) -> Result<ContentItem, ApiError> {
    let page = parse_item_page(kind, payload)?;
    let value = page
        .items
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::Decode(format!("response has an empty {} array", kind.collection())))?;
    ContentItem::from_value(kind, value).map_err(|error| ApiError::Decode(format!("{error:#}")))
}

fn parse_settings(payload: Value) -> Result<SiteSettings, ApiError> {
    #[derive(Deserialize)]
    struct SettingsResponse {
        #[serde(default)]
        settings: Vec<SettingEntry>,
    }
    let parsed: SettingsResponse =
        serde_json::from_value(payload).map_err(|error| ApiError::Decode(error.to_string()))?;
    Ok(SiteSettings {
        entries: parsed.settings,
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};

    use super::*;

    #[test]
    fn admin_key_requires_id_and_hex_secret() {
        let key = AdminKey::parse("6489abc:00ff10").expect("key");
        assert_eq!(key.id, "6489abc");
        assert_eq!(key.secret, vec![0x00, 0xff, 0x10]);

        assert!(matches!(AdminKey::parse("no-colon"), Err(ApiError::Auth(_))));
        assert!(matches!(AdminKey::parse(":00ff"), Err(ApiError::Auth(_))));
        assert!(matches!(AdminKey::parse("id:zz"), Err(ApiError::Auth(_))));
    }

    #[test]
    fn signed_token_carries_kid_audience_and_expiry() {
        let key = AdminKey::parse("key-id:a1b2c3d4").expect("key");
        let now = unix_timestamp();
        let token = sign_token(&key, Duration::from_secs(300), now).expect("sign");
        assert_eq!(token.expires_at, now + 300);

        let header = decode_header(&token.value).expect("header");
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.kid.as_deref(), Some("key-id"));

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[ADMIN_AUDIENCE]);
        let decoded = decode::<TokenClaims>(
            &token.value,
            &DecodingKey::from_secret(&key.secret),
            &validation,
        )
        .expect("decode");
        assert_eq!(decoded.claims.iat, now);
        assert_eq!(decoded.claims.aud, "/admin/");
    }

    #[test]
    fn token_is_refreshed_inside_the_margin() {
        let token = CachedToken {
            value: "t".to_string(),
            expires_at: 1_000,
        };
        assert!(token.is_fresh(900));
        assert!(!token.is_fresh(971));
        assert!(!token.is_fresh(1_000));
    }

    #[test]
    fn statuses_map_to_retryable_and_permanent_errors() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "").is_retryable());
        assert!(classify_status(StatusCode::CONFLICT, "").is_retryable());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ApiError::Auth(_)
        ));
        let error = classify_status(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"errors":[{"message":"Validation error","context":"slug too long"}]}"#,
        );
        assert!(!error.is_retryable());
        assert_eq!(
            error.to_string(),
            "content API request failed with HTTP 422: Validation error (slug too long)"
        );
    }

    #[test]
    fn item_page_reads_pagination_and_rejects_missing_collection() {
        let page = parse_item_page(
            ItemKind::Page,
            json!({"pages": [{"id": "1"}, {"id": "2"}], "meta": {"pagination": {"page": 1, "next": 2}}}),
        )
        .expect("page");
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_page, Some(2));

        let last = parse_item_page(
            ItemKind::Post,
            json!({"posts": [], "meta": {"pagination": {"next": null}}}),
        )
        .expect("last page");
        assert_eq!(last.next_page, None);

        assert!(matches!(
            parse_item_page(ItemKind::Post, json!({"pages": []})),
            Err(ApiError::Decode(_))
        ));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        assert!(backoff_delay(base, 0) < Duration::from_millis(200));
        assert!(backoff_delay(base, 3) >= Duration::from_millis(800));
    }
}
