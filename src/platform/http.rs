//! HTTP plumbing shared by the REST adapters: requests, quota headers and
//! mapping of failures onto the error taxonomy.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{Error, Result};

use super::{Fetched, RateQuota};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Header names a platform uses to report its quota.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuotaHeaders {
  pub remaining: &'static str,
  pub limit: &'static str,
  /// Unix timestamp in seconds
  pub reset: &'static str,
}

/// A decoded response body with the metadata the adapters care about.
pub(crate) struct Reply<T> {
  pub value: T,
  pub headers: HeaderMap,
  pub quota: Option<RateQuota>,
}

impl<T> Reply<T> {
  pub fn fetched<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched::with_quota(f(self.value), self.quota)
  }
}

pub(crate) struct RestClient {
  platform: String,
  client: reqwest::Client,
  base_url: Url,
  quota_headers: QuotaHeaders,
}

impl RestClient {
  pub fn new(
    platform: &str,
    base_url: &str,
    headers: HeaderMap,
    quota_headers: QuotaHeaders,
  ) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| Error::permanent(platform, format!("invalid base url {}: {}", base_url, e)))?;
    if base_url.cannot_be_a_base() {
      return Err(Error::permanent(
        platform,
        format!("base url {} cannot take a path", base_url),
      ));
    }

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .user_agent(concat!("pipewatch/", env!("CARGO_PKG_VERSION")))
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| Error::permanent(platform, format!("failed to build HTTP client: {}", e)))?;

    Ok(Self {
      platform: platform.to_string(),
      client,
      base_url,
      quota_headers,
    })
  }

  pub fn url(&self, segments: &[&str]) -> Url {
    join_url(&self.base_url, segments)
  }

  pub async fn get_json<T: DeserializeOwned>(
    &self,
    segments: &[&str],
    query: &[(&str, String)],
  ) -> Result<Reply<T>> {
    self.get_url(self.url(segments), query).await
  }

  pub async fn get_url<T: DeserializeOwned>(
    &self,
    url: Url,
    query: &[(&str, String)],
  ) -> Result<Reply<T>> {
    tracing::trace!(platform = %self.platform, url = %url, "GET");

    let response = self
      .client
      .get(url)
      .query(query)
      .send()
      .await
      .map_err(|e| self.request_error(e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let quota = parse_quota(&headers, &self.quota_headers);

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(classify(&self.platform, status, &headers, quota, &body));
    }

    let body = response.bytes().await.map_err(|e| self.request_error(e))?;
    let value = serde_json::from_slice(&body).map_err(|e| {
      Error::permanent(&self.platform, format!("unexpected response body: {}", e))
    })?;

    Ok(Reply {
      value,
      headers,
      quota,
    })
  }

  fn request_error(&self, e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
      Error::transient(&self.platform, e.to_string())
    } else {
      Error::permanent(&self.platform, e.to_string())
    }
  }
}

/// `base` with `segments` appended, each percent-encoded on its own.
pub(crate) fn join_url(base: &Url, segments: &[&str]) -> Url {
  let mut url = base.clone();
  if let Ok(mut path) = url.path_segments_mut() {
    path.pop_if_empty().extend(segments);
  }
  url
}

pub(crate) fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
  headers
    .get(name)
    .and_then(|value| value.to_str().ok())
    .map(str::trim)
    .filter(|value| !value.is_empty())
}

pub(crate) fn parse_quota(headers: &HeaderMap, names: &QuotaHeaders) -> Option<RateQuota> {
  let remaining = header(headers, names.remaining)?.parse::<i64>().ok()?;
  let limit = header(headers, names.limit).and_then(|v| v.parse::<i64>().ok());
  let reset_at = header(headers, names.reset)
    .and_then(|v| v.parse::<i64>().ok())
    .and_then(|secs| Utc.timestamp_opt(secs, 0).single());

  Some(RateQuota {
    remaining,
    limit,
    reset_at,
  })
}

fn retry_after(headers: &HeaderMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  let secs = header(headers, "retry-after")?.parse::<i64>().ok()?;
  Some(now + chrono::Duration::seconds(secs))
}

/// Map a failed response onto the error taxonomy.
///
/// 429, and 403 with an exhausted quota, are rate limits. 5xx and 408 are
/// transient. Everything else is permanent.
pub(crate) fn classify(
  platform: &str,
  status: StatusCode,
  headers: &HeaderMap,
  quota: Option<RateQuota>,
  body: &str,
) -> Error {
  let exhausted = quota.is_some_and(|q| q.remaining == 0);
  if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
    return Error::RateLimited {
      platform: platform.to_string(),
      reset_at: retry_after(headers, Utc::now()).or(quota.and_then(|q| q.reset_at)),
    };
  }

  let snippet: String = body.trim().chars().take(200).collect();
  let message = if snippet.is_empty() {
    status.to_string()
  } else {
    format!("{}: {}", status, snippet)
  };

  let err = if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
    Error::transient(platform, message)
  } else {
    Error::permanent(platform, message)
  };
  err.with_quota(quota)
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::header::HeaderValue;

  const NAMES: QuotaHeaders = QuotaHeaders {
    remaining: "ratelimit-remaining",
    limit: "ratelimit-limit",
    reset: "ratelimit-reset",
  };

  fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
      map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    map
  }

  #[test]
  fn quota_needs_remaining() {
    assert!(parse_quota(&HeaderMap::new(), &NAMES).is_none());

    let quota = parse_quota(
      &headers(&[
        ("ratelimit-remaining", "12"),
        ("ratelimit-limit", "2000"),
        ("ratelimit-reset", "1767225600"),
      ]),
      &NAMES,
    )
    .unwrap();
    assert_eq!(quota.remaining, 12);
    assert_eq!(quota.limit, Some(2000));
    assert_eq!(
      quota.reset_at,
      Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
    );
  }

  #[test]
  fn too_many_requests_is_rate_limited() {
    let err = classify(
      "gitlab",
      StatusCode::TOO_MANY_REQUESTS,
      &headers(&[("retry-after", "30")]),
      None,
      "",
    );
    match err {
      Error::RateLimited { reset_at, .. } => assert!(reset_at.unwrap() > Utc::now()),
      other => panic!("unexpected {:?}", other),
    }
  }

  #[test]
  fn forbidden_is_rate_limited_only_when_exhausted() {
    let exhausted = RateQuota {
      remaining: 0,
      limit: Some(60),
      reset_at: None,
    };
    assert!(classify("github", StatusCode::FORBIDDEN, &HeaderMap::new(), Some(exhausted), "")
      .is_rate_limited());

    let budget = RateQuota {
      remaining: 30,
      ..exhausted
    };
    assert!(matches!(
      classify("github", StatusCode::FORBIDDEN, &HeaderMap::new(), Some(budget), "nope"),
      Error::Permanent { .. }
    ));
  }

  #[test]
  fn server_errors_are_transient() {
    assert!(classify("gitlab", StatusCode::BAD_GATEWAY, &HeaderMap::new(), None, "").is_transient());
    assert!(!classify("gitlab", StatusCode::NOT_FOUND, &HeaderMap::new(), None, "").is_transient());
  }

  #[test]
  fn failed_responses_keep_their_quota() {
    let low = RateQuota {
      remaining: 3,
      limit: Some(2000),
      reset_at: None,
    };
    let not_found = classify("gitlab", StatusCode::NOT_FOUND, &HeaderMap::new(), Some(low), "");
    assert!(matches!(not_found, Error::Permanent { .. }));
    assert_eq!(not_found.quota(), Some(low));

    let bad_gateway = classify("gitlab", StatusCode::BAD_GATEWAY, &HeaderMap::new(), Some(low), "");
    assert!(bad_gateway.is_transient());
    assert_eq!(bad_gateway.quota(), Some(low));
  }

  #[test]
  fn url_segments_are_encoded() {
    let base = Url::parse("https://gitlab.example.com/api/v4/").unwrap();
    let url = join_url(&base, &["projects", "7", "repository", "branches", "feature/login"]);
    assert_eq!(
      url.as_str(),
      "https://gitlab.example.com/api/v4/projects/7/repository/branches/feature%2Flogin"
    );
  }

  #[test]
  fn bad_base_url_is_rejected() {
    assert!(RestClient::new("gitlab", "not a url", HeaderMap::new(), NAMES).is_err());
  }
}
