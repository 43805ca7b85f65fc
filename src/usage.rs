use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use reqwest::{Client, StatusCode, header::AUTHORIZATION};
use serde::{
    Deserialize, Deserializer, Serialize,
    de::{MapAccess, Visitor},
};
use thiserror::Error;
use url::Url;

use crate::mask_key;

pub const USAGE_PATH: &str = "/v0/management/usage";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
/// Model ids carrying this prefix win over bare upstream ids. External convention of the proxy.
pub const PREFERRED_MODEL_PREFIX: &str = "antigravity/";
const ERROR_BODY_PREVIEW: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelCallCount {
    pub model: String,
    pub requests: i64,
}

/// 单个 API key 的调用统计。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyUsage {
    pub id: String,
    pub label: String,
    pub total_requests: i64,
    pub total_tokens: i64,
    pub model_calls: Vec<ModelCallCount>,
}

/// 每次成功轮询重新计算的展示用汇总。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub total_tokens: i64,
    pub key_usages: Vec<KeyUsage>,
}

impl UsageSummary {
    /// Per-key sum when keys are known, the raw top-level total otherwise.
    pub fn display_requests(&self) -> i64 {
        if self.key_usages.is_empty() {
            return self.total_requests;
        }
        saturating_sum(self.key_usages.iter().map(|usage| usage.total_requests))
    }

    pub fn display_tokens(&self) -> i64 {
        if self.key_usages.is_empty() {
            return self.total_tokens;
        }
        saturating_sum(self.key_usages.iter().map(|usage| usage.total_tokens))
    }

    pub fn requests_for_key(&self, key: &str) -> i64 {
        self.key_usages
            .iter()
            .find(|usage| usage.id == key)
            .map(|usage| usage.total_requests)
            .unwrap_or(0)
    }

    /// Share of the display total, in percent.
    pub fn share_percent(&self, value: i64) -> f64 {
        let total = self.display_requests().max(1);
        value as f64 / total as f64 * 100.0
    }
}

// Counts come straight from the server payload and may be arbitrarily large.
fn saturating_sum(values: impl IntoIterator<Item = i64>) -> i64 {
    values.into_iter().fold(0, i64::saturating_add)
}

/// `1.2K`, `3.4M`, `1.0B`; smaller values verbatim.
pub fn compact_count(value: i64) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let absolute = (value as f64).abs();
    if absolute >= 1_000_000_000.0 {
        format!("{sign}{:.1}B", absolute / 1_000_000_000.0)
    } else if absolute >= 1_000_000.0 {
        format!("{sign}{:.1}M", absolute / 1_000_000.0)
    } else if absolute >= 1_000.0 {
        format!("{sign}{:.1}K", absolute / 1_000.0)
    } else {
        value.to_string()
    }
}

#[derive(Debug, Error)]
pub enum UsageError {
    #[error("invalid server URL")]
    InvalidBaseUrl,
    #[error("management API unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("invalid server response")]
    InvalidResponse,
    #[error("{}", http_error_message(*status, body))]
    Http { status: StatusCode, body: String },
    #[error("{0}")]
    ServerMessage(String),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

fn http_error_message(status: StatusCode, body: &str) -> String {
    if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {body}", status.as_u16())
    }
}

impl UsageError {
    /// 面向操作者的简短提示，不暴露上游载荷细节。
    pub fn friendly_message(&self, management_key: &str) -> String {
        match self {
            Self::Http { status, .. } if *status == StatusCode::UNAUTHORIZED => {
                if management_key.trim().is_empty() {
                    "monitoring unauthorized: missing management key".to_owned()
                } else {
                    "monitoring unauthorized: management key rejected".to_owned()
                }
            }
            Self::Decode(_) => "usage format temporarily incompatible, skipped".to_owned(),
            _ => "usage temporarily unavailable".to_owned(),
        }
    }
}

/// 管理端 usage 接口客户端，固定 8 秒超时，不重试。
#[derive(Debug, Clone)]
pub struct UsageClient {
    client: Client,
}

impl UsageClient {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { client })
    }

    pub async fn fetch_usage_summary(
        &self,
        base_url: &str,
        management_key: &str,
    ) -> Result<UsageSummary, UsageError> {
        let management_key = management_key.trim();
        let url = usage_url(base_url, management_key)?;

        let mut request = self.client.get(url);
        if !management_key.is_empty() {
            request = request.header(AUTHORIZATION, format!("Bearer {management_key}"));
        }

        let response = request.send().await.map_err(UsageError::Unreachable)?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|_| UsageError::InvalidResponse)?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            return Err(UsageError::Http {
                status,
                body: text.chars().take(ERROR_BODY_PREVIEW).collect(),
            });
        }

        let decoded: UsageResponse = serde_json::from_slice(&body)?;
        match decoded.usage {
            Some(payload) => Ok(summarize(payload)),
            None => Err(UsageError::ServerMessage(
                decoded
                    .error
                    .unwrap_or_else(|| "missing usage payload".to_owned()),
            )),
        }
    }
}

fn usage_url(base_url: &str, management_key: &str) -> Result<Url, UsageError> {
    let trimmed = base_url.trim();
    if trimmed.is_empty() {
        return Err(UsageError::InvalidBaseUrl);
    }
    let mut url = Url::parse(trimmed).map_err(|_| UsageError::InvalidBaseUrl)?;
    if url.cannot_be_a_base() {
        return Err(UsageError::InvalidBaseUrl);
    }
    url.set_path(USAGE_PATH);
    url.set_query(None);
    if !management_key.is_empty() {
        url.query_pairs_mut().append_pair("key", management_key);
    }
    Ok(url)
}

#[derive(Debug, Deserialize)]
pub struct UsageResponse {
    #[serde(default)]
    pub usage: Option<UsagePayload>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsagePayload {
    #[serde(default)]
    pub total_requests: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default)]
    pub apis: Option<HashMap<String, ApiPayload>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiPayload {
    #[serde(default)]
    pub total_requests: Option<i64>,
    #[serde(default)]
    pub total_tokens: Option<i64>,
    #[serde(default, deserialize_with = "summed_model_counts")]
    pub models: BTreeMap<String, i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ModelPayload {
    Count(i64),
    Detailed {
        #[serde(default)]
        total_requests: Option<i64>,
        #[serde(default)]
        requests: Option<i64>,
    },
}

impl ModelPayload {
    fn requests(&self) -> i64 {
        match self {
            Self::Count(count) => *count,
            Self::Detailed {
                total_requests,
                requests,
            } => total_requests.or(*requests).unwrap_or(0),
        }
    }
}

// Duplicate model ids inside one object are summed rather than overwritten.
fn summed_model_counts<'de, D>(deserializer: D) -> Result<BTreeMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct CountsVisitor;

    impl<'de> Visitor<'de> for CountsVisitor {
        type Value = BTreeMap<String, i64>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of model ids to request counts")
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(BTreeMap::new())
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut counts = BTreeMap::new();
            while let Some((model, payload)) = map.next_entry::<String, Option<ModelPayload>>()? {
                let requests = payload.as_ref().map(ModelPayload::requests).unwrap_or(0);
                let total = counts.entry(model).or_insert(0_i64);
                *total = total.saturating_add(requests);
            }
            Ok(counts)
        }
    }

    deserializer.deserialize_any(CountsVisitor)
}

/// 将管理端原始载荷归约为排序、脱敏后的汇总。
pub fn summarize(payload: UsagePayload) -> UsageSummary {
    let mut key_usages: Vec<KeyUsage> = payload
        .apis
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(id, api)| reduce_key(id, api))
        .collect();

    key_usages.sort_by(|lhs, rhs| {
        by_count_then_id(lhs.total_requests, &lhs.id, rhs.total_requests, &rhs.id)
    });

    UsageSummary {
        total_requests: payload.total_requests.unwrap_or(0),
        total_tokens: payload.total_tokens.unwrap_or(0),
        key_usages,
    }
}

fn reduce_key(id: String, api: ApiPayload) -> Option<KeyUsage> {
    let has_preferred = api
        .models
        .keys()
        .any(|model| model.starts_with(PREFERRED_MODEL_PREFIX));

    let mut model_calls: Vec<ModelCallCount> = api
        .models
        .iter()
        .filter(|(model, _)| !has_preferred || model.starts_with(PREFERRED_MODEL_PREFIX))
        .filter(|(_, requests)| **requests > 0)
        .map(|(model, requests)| ModelCallCount {
            model: model.clone(),
            requests: *requests,
        })
        .collect();
    model_calls.sort_by(|lhs, rhs| {
        by_count_then_id(lhs.requests, &lhs.model, rhs.requests, &rhs.model)
    });

    let total_requests = api
        .total_requests
        .unwrap_or_else(|| saturating_sum(api.models.values().copied()));
    let total_tokens = api.total_tokens.unwrap_or(0);
    if total_requests == 0 && model_calls.is_empty() {
        return None;
    }

    Some(KeyUsage {
        label: mask_key(&id),
        id,
        total_requests,
        total_tokens,
        model_calls,
    })
}

fn by_count_then_id(lhs_count: i64, lhs_id: &str, rhs_count: i64, rhs_id: &str) -> Ordering {
    rhs_count.cmp(&lhs_count).then_with(|| lhs_id.cmp(rhs_id))
}
