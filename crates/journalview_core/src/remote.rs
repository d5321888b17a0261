use std::thread::sleep;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::blocking::Client;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{
    DEFAULT_RATE_LIMIT_MS, DEFAULT_RETRIES, DEFAULT_RETRY_DELAY_MS, DEFAULT_TIMEOUT_MS,
    JournalConfig, process_env,
};
use crate::facet::Facet;
use crate::filter::FilterCriteria;
use crate::paginate::PageRequest;
use crate::record::Article;

/// One page of `GET /articles`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemotePage {
    #[serde(default)]
    pub items: Vec<Article>,
    #[serde(default)]
    pub total: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MetaResponse {
    #[serde(default)]
    last_updated_at: Option<String>,
}

/// Read access to the article REST backend.
pub trait ArticleApi {
    fn fetch_page(&mut self, criteria: &FilterCriteria, request: PageRequest)
    -> Result<RemotePage>;
    /// Timestamp of the server's current data set.
    fn server_timestamp(&mut self) -> Result<Option<String>>;
    fn journals(&mut self) -> Result<Vec<Facet>>;
    fn request_count(&self) -> usize;
}

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub api_url: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub rate_limit_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl RestClientConfig {
    /// Config file values, then `JOURNALVIEW_HTTP_*` env overrides.
    pub fn from_config(config: &JournalConfig) -> Result<Self> {
        Self::from_config_with(config, process_env)
    }

    pub fn from_config_with<F: Fn(&str) -> Option<String>>(
        config: &JournalConfig,
        lookup: F,
    ) -> Result<Self> {
        let api_url = config.api_url_with(&lookup).ok_or_else(|| {
            anyhow::anyhow!("no REST backend configured (set [source].api_url or JOURNALVIEW_API_URL)")
        })?;
        Ok(Self {
            api_url,
            user_agent: config.user_agent_with(&lookup),
            timeout_ms: env_value(
                &lookup,
                "JOURNALVIEW_HTTP_TIMEOUT_MS",
                config.sync.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS),
            ),
            rate_limit_ms: env_value(
                &lookup,
                "JOURNALVIEW_HTTP_RATE_LIMIT_MS",
                config.sync.rate_limit_ms.unwrap_or(DEFAULT_RATE_LIMIT_MS),
            ),
            max_retries: env_value(
                &lookup,
                "JOURNALVIEW_HTTP_RETRIES",
                config.sync.retries.unwrap_or(DEFAULT_RETRIES),
            ),
            retry_delay_ms: env_value(
                &lookup,
                "JOURNALVIEW_HTTP_RETRY_DELAY_MS",
                config.sync.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
        })
    }
}

pub struct RestClient {
    client: Client,
    config: RestClientConfig,
    last_request_at: Option<Instant>,
    request_count: usize,
}

impl RestClient {
    pub fn new(config: RestClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build article API HTTP client")?;

        Ok(Self {
            client,
            config,
            last_request_at: None,
            request_count: 0,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.config.api_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let joined = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        Url::parse(&joined).with_context(|| format!("invalid article API URL: {joined}"))
    }

    fn request_json_get(&mut self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = self.endpoint(path)?;
        let pairs: Vec<(&str, String)> = params
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (*key, value.clone()))
            .collect();

        for attempt in 0..=self.config.max_retries {
            self.apply_rate_limit();
            debug!(url = %url, attempt, "article API request");
            let response = self
                .client
                .get(url.clone())
                .header("User-Agent", self.config.user_agent.clone())
                .header("Accept", "application/json")
                .query(&pairs)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        if attempt < self.config.max_retries && is_retryable_status(status) {
                            self.wait_before_retry(attempt);
                            continue;
                        }
                        bail!("article API request to /{path} failed with HTTP {status}");
                    }

                    let payload: Value = response
                        .json()
                        .context("failed to decode article API JSON response")?;
                    if let Some(error) = payload.as_object().and_then(|map| map.get("error")) {
                        let message = error
                            .as_str()
                            .map(str::to_string)
                            .or_else(|| {
                                error
                                    .get("message")
                                    .and_then(Value::as_str)
                                    .map(str::to_string)
                            })
                            .unwrap_or_else(|| error.to_string());
                        bail!("article API error on /{path}: {message}");
                    }
                    return Ok(payload);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call article API /{path}"));
                }
            }
        }

        bail!("article API request exhausted retry budget")
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
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl ArticleApi for RestClient {
    fn fetch_page(
        &mut self,
        criteria: &FilterCriteria,
        request: PageRequest,
    ) -> Result<RemotePage> {
        let params = query_pairs(criteria, request);
        let response = self.request_json_get("articles", &params)?;
        serde_json::from_value(response).context("failed to decode articles API response")
    }

    fn server_timestamp(&mut self) -> Result<Option<String>> {
        let response = self.request_json_get("meta", &[])?;
        let parsed: MetaResponse =
            serde_json::from_value(response).context("failed to decode meta API response")?;
        Ok(parsed
            .last_updated_at
            .filter(|value| !value.trim().is_empty()))
    }

    fn journals(&mut self) -> Result<Vec<Facet>> {
        let response = self.request_json_get("journals", &[])?;
        serde_json::from_value(response).context("failed to decode journals API response")
    }

    fn request_count(&self) -> usize {
        self.request_count
    }
}

/// Query string for `GET /articles`. Blank values are omitted by the client.
pub fn query_pairs(criteria: &FilterCriteria, request: PageRequest) -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("page", request.page.max(1).to_string()),
        ("page_size", request.page_size.max(1).to_string()),
        ("q", criteria.keyword.trim().to_string()),
    ];
    if let Some(journal) = criteria.journal_value() {
        pairs.push(("journal", journal.to_string()));
    }
    if let Some(from) = criteria.date_from_value() {
        pairs.push(("date_from", from.to_string()));
    }
    if let Some(to) = criteria.date_to_value() {
        pairs.push(("date_to", to.to_string()));
    }
    for kind in criteria.type_values() {
        pairs.push(("type", kind.to_string()));
    }
    for tag in &criteria.tags {
        let tag = tag.trim();
        if !tag.is_empty() {
            pairs.push(("tag", tag.to_string()));
        }
    }
    pairs
}

fn env_value<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeSet;

    use anyhow::{Result, bail};
    use reqwest::StatusCode;

    use super::{
        ArticleApi, RemotePage, RestClient, RestClientConfig, is_retryable_status, query_pairs,
    };
    use crate::config::{JournalConfig, SourceSection};
    use crate::facet::{Facet, journal_facets};
    use crate::filter::{FilterCriteria, filter};
    use crate::paginate::{PageRequest, paginate};
    use crate::record::{Article, sort_default};

    /// Serves a fixed record set with server-side filtering, and can be told
    /// to fail on a given page or on every request.
    #[derive(Default)]
    pub(crate) struct MockApi {
        pub records: Vec<Article>,
        pub timestamp: Option<String>,
        pub fail_on_page: Option<usize>,
        pub offline: bool,
        pub omit_total: bool,
        pub pages_served: BTreeSet<usize>,
        pub request_count: usize,
    }

    impl MockApi {
        pub(crate) fn with_records(records: Vec<Article>, timestamp: &str) -> Self {
            Self {
                records,
                timestamp: Some(timestamp.to_string()),
                ..Self::default()
            }
        }
    }

    impl ArticleApi for MockApi {
        fn fetch_page(
            &mut self,
            criteria: &FilterCriteria,
            request: PageRequest,
        ) -> Result<RemotePage> {
            self.request_count += 1;
            if self.offline || self.fail_on_page == Some(request.page) {
                bail!("connection reset while fetching page {}", request.page);
            }
            self.pages_served.insert(request.page);
            let mut ordered = self.records.clone();
            sort_default(&mut ordered);
            let subset: Vec<Article> = filter(&ordered, criteria).into_iter().cloned().collect();
            let total = subset.len();
            let start = (request.page.max(1) - 1).saturating_mul(request.page_size);
            let items = subset
                .into_iter()
                .skip(start)
                .take(request.page_size)
                .collect();
            Ok(RemotePage {
                items,
                total: if self.omit_total { None } else { Some(total) },
            })
        }

        fn server_timestamp(&mut self) -> Result<Option<String>> {
            self.request_count += 1;
            if self.offline {
                bail!("connection refused");
            }
            Ok(self.timestamp.clone())
        }

        fn journals(&mut self) -> Result<Vec<Facet>> {
            self.request_count += 1;
            Ok(journal_facets(&self.records))
        }

        fn request_count(&self) -> usize {
            self.request_count
        }
    }

    #[test]
    fn query_pairs_carry_every_clause() {
        let criteria = FilterCriteria {
            keyword: "  carbon sink ".to_string(),
            journal: Some("Nature".to_string()),
            date_from: Some("2024-01-01".to_string()),
            date_to: Some(" ".to_string()),
            types: vec!["review".to_string(), "letter".to_string()],
            tags: vec![" Ecology ".to_string(), String::new()],
        };
        let pairs = query_pairs(&criteria, PageRequest::new(3, 25));
        assert!(pairs.contains(&("page", "3".to_string())));
        assert!(pairs.contains(&("page_size", "25".to_string())));
        assert!(pairs.contains(&("q", "carbon sink".to_string())));
        assert!(pairs.contains(&("journal", "Nature".to_string())));
        assert!(pairs.contains(&("date_from", "2024-01-01".to_string())));
        assert!(!pairs.iter().any(|(key, _)| *key == "date_to"));
        assert_eq!(pairs.iter().filter(|(key, _)| *key == "type").count(), 2);
        assert_eq!(pairs.iter().filter(|(key, _)| *key == "tag").count(), 1);
    }

    #[test]
    fn client_config_requires_api_url() {
        let unset = |_: &str| None;
        let error =
            RestClientConfig::from_config_with(&JournalConfig::default(), unset).expect_err("must fail");
        assert!(error.to_string().contains("no REST backend configured"));

        let config = JournalConfig {
            source: SourceSection {
                api_url: Some("https://articles.example.org/api/".to_string()),
                ..SourceSection::default()
            },
            ..JournalConfig::default()
        };
        let resolved = RestClientConfig::from_config_with(&config, unset).expect("resolve");
        assert_eq!(resolved.api_url, "https://articles.example.org/api");
        let client = RestClient::new(resolved).expect("client");
        assert_eq!(
            client.endpoint("articles").expect("endpoint").as_str(),
            "https://articles.example.org/api/articles"
        );
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn remote_page_tolerates_missing_total() {
        let parsed: RemotePage =
            serde_json::from_str(r#"{"items": [{"uid": "a"}]}"#).expect("parse page");
        assert_eq!(parsed.items.len(), 1);
        assert!(parsed.total.is_none());
    }

    #[test]
    fn mock_api_paginates_like_memory() {
        let records: Vec<Article> = (0..5)
            .map(|index| Article {
                uid: format!("u{index}"),
                pub_date: Some(format!("2024-01-0{}", index + 1)),
                ..Article::default()
            })
            .collect();
        let mut api = MockApi::with_records(records.clone(), "t1");
        let page = api
            .fetch_page(&FilterCriteria::default(), PageRequest::new(2, 2))
            .expect("fetch");
        let mut ordered = records;
        sort_default(&mut ordered);
        assert_eq!(page.items, paginate(&ordered, PageRequest::new(2, 2)).items);
        assert_eq!(page.total, Some(5));
    }
}
