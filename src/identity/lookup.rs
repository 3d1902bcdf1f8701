//! Player name to account id resolution
//!
//! Names are resolved against a remote profile service. The service
//! rate-limits aggressively and answers "no content" for unknown names, so
//! lookups are cached for the whole session, rate limiting is retried after
//! the documented delay, and unknown names are treated as permanent misses.

use super::retry::{with_retry, RetryConfig};
use crate::config::IdentityConfig;
use crate::{MailError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Largest number of names the batch endpoint accepts per request
pub const BATCH_SIZE: usize = 10;

/// Remote source of name to id mappings
#[async_trait]
pub trait NameSource: Send + Sync {
    /// Id the name belonged to at `as_of` (now when `None`)
    async fn resolve_id(&self, name: &str, as_of: Option<DateTime<Utc>>) -> Result<Option<Uuid>>;

    /// Ids of up to [`BATCH_SIZE`] names; unknown names are absent from the map
    async fn resolve_ids(&self, names: &[String]) -> Result<HashMap<String, Uuid>>;
}

#[async_trait]
impl<T: NameSource + ?Sized> NameSource for Arc<T> {
    async fn resolve_id(&self, name: &str, as_of: Option<DateTime<Utc>>) -> Result<Option<Uuid>> {
        (**self).resolve_id(name, as_of).await
    }

    async fn resolve_ids(&self, names: &[String]) -> Result<HashMap<String, Uuid>> {
        (**self).resolve_ids(names).await
    }
}

/// Whether a string can be a player name at all
pub fn is_valid_name(name: &str) -> bool {
    (1..=16).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[derive(Debug, Deserialize)]
struct Profile {
    id: String,
    name: String,
}

impl Profile {
    fn uuid(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.id)
            .map_err(|e| MailError::Identity(format!("bad profile id '{}': {}", self.id, e)))
    }
}

/// What an HTTP status means for a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusMeaning {
    Found,
    Missing,
    RateLimited(u64),
    Failed,
}

fn classify(status: StatusCode, retry_after: Option<&str>, default_retry: u64) -> StatusMeaning {
    match status {
        StatusCode::OK => StatusMeaning::Found,
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => StatusMeaning::Missing,
        StatusCode::TOO_MANY_REQUESTS => StatusMeaning::RateLimited(
            retry_after
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default_retry),
        ),
        _ => StatusMeaning::Failed,
    }
}

/// Profile service over HTTP
pub struct HttpNameSource {
    client: reqwest::Client,
    endpoint: String,
    batch_endpoint: String,
    rate_limit_retry_secs: u64,
}

impl HttpNameSource {
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("postbox/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            batch_endpoint: config.batch_endpoint.clone(),
            rate_limit_retry_secs: config.rate_limit_retry_secs,
        })
    }

    fn profile_url(&self, name: &str, as_of: Option<DateTime<Utc>>) -> String {
        let url = self.endpoint.replace("{name}", name);
        match as_of {
            Some(at) => format!("{}?at={}", url, at.timestamp()),
            None => url,
        }
    }

    fn meaning(&self, response: &reqwest::Response) -> StatusMeaning {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok());
        classify(response.status(), retry_after, self.rate_limit_retry_secs)
    }
}

#[async_trait]
impl NameSource for HttpNameSource {
    async fn resolve_id(&self, name: &str, as_of: Option<DateTime<Utc>>) -> Result<Option<Uuid>> {
        let url = self.profile_url(name, as_of);
        debug!(name = name, url = %url, "Looking up player id");

        let response = self.client.get(&url).send().await?;
        match self.meaning(&response) {
            StatusMeaning::Found => {
                let profile: Profile = response.json().await?;
                Ok(Some(profile.uuid()?))
            }
            StatusMeaning::Missing => Ok(None),
            StatusMeaning::RateLimited(secs) => Err(MailError::RateLimited(secs)),
            StatusMeaning::Failed => Err(MailError::Identity(format!(
                "lookup of '{}' failed with status {}",
                name,
                response.status()
            ))),
        }
    }

    async fn resolve_ids(&self, names: &[String]) -> Result<HashMap<String, Uuid>> {
        let response = self
            .client
            .post(&self.batch_endpoint)
            .json(names)
            .send()
            .await?;

        match self.meaning(&response) {
            StatusMeaning::Found => {
                let profiles: Vec<Profile> = response.json().await?;
                let mut ids = HashMap::new();
                for profile in profiles {
                    match profile.uuid() {
                        Ok(id) => {
                            ids.insert(profile.name.to_lowercase(), id);
                        }
                        Err(e) => debug!("Skipping profile: {}", e),
                    }
                }
                Ok(ids)
            }
            StatusMeaning::Missing => Ok(HashMap::new()),
            StatusMeaning::RateLimited(secs) => Err(MailError::RateLimited(secs)),
            StatusMeaning::Failed => Err(MailError::Identity(format!(
                "batch lookup failed with status {}",
                response.status()
            ))),
        }
    }
}

/// Session cache in front of a [`NameSource`]
pub struct CachingNameResolver<S> {
    source: S,
    retry: RetryConfig,
    cache: RwLock<HashMap<String, Uuid>>,
}

impl<S: NameSource> CachingNameResolver<S> {
    pub fn new(source: S, retry: RetryConfig) -> Self {
        Self {
            source,
            retry,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Build with the retry policy from configuration
    pub fn from_config(source: S, config: &IdentityConfig) -> Self {
        Self::new(
            source,
            RetryConfig::rate_limited(
                Duration::from_secs(config.rate_limit_retry_secs),
                config.max_retries,
            ),
        )
    }

    fn cached(&self, name: &str) -> Option<Uuid> {
        self.cache
            .read()
            .ok()
            .and_then(|c| c.get(&name.to_lowercase()).copied())
    }

    /// Seed the cache, e.g. with names seen on connect
    pub fn remember(&self, name: &str, id: Uuid) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(name.to_lowercase(), id);
        }
    }

    /// Current id of a player name
    pub async fn resolve(&self, name: &str) -> Result<Option<Uuid>> {
        if let Some(id) = self.cached(name) {
            return Ok(Some(id));
        }
        self.resolve_at(name, None).await
    }

    /// Id a name belonged to at a point in time
    ///
    /// Bypasses the cache, but falls back to the last known id when the
    /// service cannot be reached.
    pub async fn resolve_at(
        &self,
        name: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<Uuid>> {
        if !is_valid_name(name) {
            return Err(MailError::Identity(format!("malformed player name '{}'", name)));
        }

        let result = with_retry(&self.retry, "resolve_id", || {
            self.source.resolve_id(name, as_of)
        })
        .await;

        match result {
            Ok(Some(id)) => {
                if as_of.is_none() {
                    self.remember(name, id);
                }
                Ok(Some(id))
            }
            Ok(None) => {
                debug!(name = name, "No player with this name");
                Ok(None)
            }
            Err(e) => match self.cached(name) {
                Some(id) => {
                    warn!(name = name, "Lookup failed, using last known id: {}", e);
                    Ok(Some(id))
                }
                None => Err(e),
            },
        }
    }

    /// Resolve many names, in chunks the service accepts
    ///
    /// Failures are logged and the affected names are left out; cached names
    /// never hit the service.
    pub async fn resolve_many(&self, names: &[String]) -> HashMap<String, Uuid> {
        let mut resolved = HashMap::new();
        let mut pending = Vec::new();

        for name in names {
            if !is_valid_name(name) {
                debug!(name = %name, "Skipping malformed player name");
                continue;
            }
            match self.cached(name) {
                Some(id) => {
                    resolved.insert(name.clone(), id);
                }
                None => pending.push(name.clone()),
            }
        }

        for chunk in pending.chunks(BATCH_SIZE) {
            let result =
                with_retry(&self.retry, "resolve_ids", || self.source.resolve_ids(chunk)).await;
            match result {
                Ok(ids) => {
                    for name in chunk {
                        if let Some(id) = ids.get(&name.to_lowercase()) {
                            self.remember(name, *id);
                            resolved.insert(name.clone(), *id);
                        } else {
                            debug!(name = %name, "No player with this name");
                        }
                    }
                }
                Err(e) => warn!(names = chunk.len(), "Batch lookup failed: {}", e),
            }
        }

        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        ids: HashMap<String, Uuid>,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        rate_limit_first: bool,
        offline: bool,
    }

    impl FakeSource {
        fn new(names: &[&str]) -> Self {
            Self {
                ids: names
                    .iter()
                    .map(|n| (n.to_lowercase(), Uuid::new_v4()))
                    .collect(),
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                rate_limit_first: false,
                offline: false,
            }
        }
    }

    #[async_trait]
    impl NameSource for FakeSource {
        async fn resolve_id(
            &self,
            name: &str,
            _as_of: Option<DateTime<Utc>>,
        ) -> Result<Option<Uuid>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.offline {
                return Err(MailError::Identity("service down".to_string()));
            }
            if self.rate_limit_first && call == 0 {
                return Err(MailError::RateLimited(60));
            }
            Ok(self.ids.get(&name.to_lowercase()).copied())
        }

        async fn resolve_ids(&self, names: &[String]) -> Result<HashMap<String, Uuid>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(names.len());
            Ok(names
                .iter()
                .filter_map(|n| {
                    let key = n.to_lowercase();
                    self.ids.get(&key).map(|id| (key, *id))
                })
                .collect())
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify(StatusCode::OK, None, 60), StatusMeaning::Found);
        assert_eq!(
            classify(StatusCode::NO_CONTENT, None, 60),
            StatusMeaning::Missing
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, Some("12"), 60),
            StatusMeaning::RateLimited(12)
        );
        assert_eq!(
            classify(StatusCode::TOO_MANY_REQUESTS, None, 60),
            StatusMeaning::RateLimited(60)
        );
        assert_eq!(
            classify(StatusCode::BAD_GATEWAY, None, 60),
            StatusMeaning::Failed
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("Notch"));
        assert!(is_valid_name("a_b_1"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("has space"));
        assert!(!is_valid_name("x".repeat(17).as_str()));
    }

    #[test]
    fn test_profile_url() {
        let source = HttpNameSource::new(&IdentityConfig::default()).unwrap();
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert!(source
            .profile_url("Steve", Some(at))
            .ends_with("/Steve?at=1700000000"));
    }

    #[tokio::test]
    async fn test_resolve_caches_for_session() {
        let resolver = CachingNameResolver::new(FakeSource::new(&["Steve"]), RetryConfig::quick());

        let first = resolver.resolve("Steve").await.unwrap();
        let second = resolver.resolve("steve").await.unwrap();
        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_name_is_permanent() {
        let resolver = CachingNameResolver::new(FakeSource::new(&[]), RetryConfig::quick());
        assert_eq!(resolver.resolve("Ghost").await.unwrap(), None);
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried() {
        let mut source = FakeSource::new(&["Alex"]);
        source.rate_limit_first = true;
        let resolver = CachingNameResolver::new(
            source,
            RetryConfig::rate_limited(Duration::from_secs(60), 2),
        );

        assert!(resolver.resolve("Alex").await.unwrap().is_some());
        assert_eq!(resolver.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_falls_back_to_last_known_id() {
        let mut source = FakeSource::new(&[]);
        source.offline = true;
        let resolver = CachingNameResolver::new(source, RetryConfig::quick());
        let id = Uuid::new_v4();
        resolver.remember("Herobrine", id);

        let at = Utc::now();
        assert_eq!(
            resolver.resolve_at("Herobrine", Some(at)).await.unwrap(),
            Some(id)
        );
        assert!(resolver.resolve_at("Nobody", Some(at)).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_resolves_in_chunks() {
        let names: Vec<String> = (0..23).map(|i| format!("player{}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let resolver = CachingNameResolver::new(FakeSource::new(&refs), RetryConfig::quick());
        resolver.remember("player0", Uuid::new_v4());

        let mut request = names.clone();
        request.push("bad name".to_string());
        let resolved = resolver.resolve_many(&request).await;

        assert_eq!(resolved.len(), 23);
        assert_eq!(*resolver.source.batch_sizes.lock().unwrap(), vec![10, 10, 2]);
    }
}
