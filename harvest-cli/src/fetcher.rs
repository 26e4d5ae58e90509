//! `HttpFetcher`: a `reqwest`-backed `Fetcher`, generalizing
//! `hook-worker::worker`'s `send_webhook`/`is_retryable_status` pair to
//! this substrate's richer `ResultStatus` outcome set (a webhook delivery
//! only ever needed retryable vs. terminal; a crawl fetch also needs to
//! tell a block or a captcha wall apart from an ordinary server error so
//! the feedback loop and proxy pool can react to each differently).

use std::time::Duration;

use async_trait::async_trait;
use harvest_common::model::{HttpMethod, Request, ResultRecord, ResultStatus};
use harvest_core::traits::Fetcher;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::warn;

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("harvest-crawler/0.1")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client");
        Self { client }
    }

    fn client_for(&self, proxy: Option<&str>) -> reqwest::Client {
        let Some(proxy_url) = proxy else {
            return self.client.clone();
        };
        match reqwest::Proxy::all(proxy_url) {
            Ok(p) => reqwest::Client::builder()
                .user_agent("harvest-crawler/0.1")
                .proxy(p)
                .build()
                .unwrap_or_else(|_| self.client.clone()),
            Err(e) => {
                warn!("invalid proxy url {}: {}", proxy_url, e);
                self.client.clone()
            }
        }
    }
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::GET => reqwest::Method::GET,
        HttpMethod::POST => reqwest::Method::POST,
        HttpMethod::PUT => reqwest::Method::PUT,
        HttpMethod::DELETE => reqwest::Method::DELETE,
        HttpMethod::PATCH => reqwest::Method::PATCH,
        HttpMethod::HEAD => reqwest::Method::HEAD,
    }
}

fn to_header_map(headers: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(k.as_bytes()),
            HeaderValue::from_str(v),
        ) else {
            continue;
        };
        map.append(name, value);
    }
    map
}

/// A response status in the 403/401/captcha-ish range is classified as a
/// block or captcha wall rather than an ordinary client error, matching
/// the common anti-bot signal set.
fn classify_status(status: u16, body: &[u8]) -> ResultStatus {
    if status == 403 || status == 429 {
        return ResultStatus::Blocked;
    }
    if status == 503 {
        let body_lower = String::from_utf8_lossy(body).to_ascii_lowercase();
        if body_lower.contains("captcha") {
            return ResultStatus::CaptchaRequired;
        }
    }
    let body_lower = String::from_utf8_lossy(&body[..body.len().min(4096)]).to_ascii_lowercase();
    if body_lower.contains("captcha") || body_lower.contains("are you a robot") {
        return ResultStatus::CaptchaRequired;
    }
    ResultStatus::HttpError
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request, proxy: Option<&str>) -> ResultRecord {
        let client = self.client_for(proxy);
        let started = std::time::Instant::now();

        let mut builder = client
            .request(to_reqwest_method(request.method), &request.url)
            .headers(to_header_map(&request.headers));
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let outcome = builder.send().await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                let http_status = response.status().as_u16();
                let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
                let status = if (200..300).contains(&http_status) {
                    ResultStatus::Success
                } else {
                    classify_status(http_status, &body)
                };
                ResultRecord {
                    request_id: request.id,
                    attempt: 0,
                    status,
                    http_status: Some(http_status),
                    body,
                    elapsed_ms,
                    proxy_used: proxy.map(str::to_owned),
                    error_message: None,
                    suspicious: false,
                }
            }
            Err(e) => {
                let status = if e.is_timeout() {
                    ResultStatus::Timeout
                } else {
                    ResultStatus::NetworkError
                };
                ResultRecord {
                    request_id: request.id,
                    attempt: 0,
                    status,
                    http_status: e.status().map(|s| s.as_u16()),
                    body: Vec::new(),
                    elapsed_ms,
                    proxy_used: proxy.map(str::to_owned),
                    error_message: Some(e.to_string()),
                    suspicious: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_and_too_many_requests_are_classified_as_blocked() {
        assert_eq!(classify_status(403, b""), ResultStatus::Blocked);
        assert_eq!(classify_status(429, b""), ResultStatus::Blocked);
    }

    #[test]
    fn captcha_keyword_in_body_is_classified_as_captcha_required() {
        assert_eq!(
            classify_status(200, b"please solve this captcha"),
            ResultStatus::CaptchaRequired
        );
    }

    #[test]
    fn ordinary_server_error_is_http_error() {
        assert_eq!(classify_status(500, b"internal error"), ResultStatus::HttpError);
    }
}
