use crate::config::{ANTHROPIC_BETA, USER_AGENT};
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::ErrorKind;
use crate::state::UsageSnapshot;
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use serde::Deserialize;
use serde_json::Value;
use std::error::Error as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn build_http_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiErrorResponse {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub message: Option<String>,
}

/// Performs one usage request per call and turns every outcome into a snapshot
pub struct UsageFetcher {
    client: reqwest::Client,
    usage_url: String,
    credentials: Arc<CredentialProvider>,
}

impl UsageFetcher {
    pub fn new(
        client: reqwest::Client,
        usage_url: impl Into<String>,
        credentials: Arc<CredentialProvider>,
    ) -> Self {
        Self {
            client,
            usage_url: usage_url.into(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    /// Obtain credentials and fetch; missing credentials become a `NoToken` snapshot
    pub async fn fetch_current(&self) -> UsageSnapshot {
        match self.credentials.obtain(false).await {
            Ok(credentials) => self.fetch(credentials, true).await,
            Err(e) => {
                warn!(error = %e, "No usable credentials");
                UsageSnapshot::failed(ErrorKind::NoToken, "No token", "")
            }
        }
    }

    /// At most one refresh-and-retry happens per call: after a 401 the request is
    /// repeated once with refreshing disabled.
    pub async fn fetch(&self, credentials: Credentials, allow_refresh: bool) -> UsageSnapshot {
        let mut credentials = credentials;

        if allow_refresh && credentials.is_expired() {
            info!("Access token expired, refreshing before request");
            if let Some(fresh) = self.refresh_and_reload(&credentials).await {
                credentials = fresh;
            }
        }

        let mut allow_refresh = allow_refresh;
        loop {
            let snapshot = self.request(&credentials).await;

            if snapshot.error_kind != ErrorKind::HttpError(401) {
                return snapshot;
            }

            self.credentials.invalidate();

            if !allow_refresh {
                return snapshot;
            }
            allow_refresh = false;

            info!("Usage request unauthorized, attempting token refresh");
            match self.refresh_and_reload(&credentials).await {
                Some(fresh) => credentials = fresh,
                None => return snapshot,
            }
        }
    }

    /// Best effort: `None` means the caller keeps its current credentials
    async fn refresh_and_reload(&self, credentials: &Credentials) -> Option<Credentials> {
        if let Err(e) = self.credentials.refresh(&credentials.refresh_token).await {
            warn!(error = %e, "Token refresh failed");
            return None;
        }

        match self.credentials.obtain(true).await {
            Ok(fresh) => Some(fresh),
            Err(e) => {
                warn!(error = %e, "Could not reload credentials after refresh");
                None
            }
        }
    }

    async fn request(&self, credentials: &Credentials) -> UsageSnapshot {
        let plan = credentials.plan_label.as_str();

        let bearer = match HeaderValue::from_str(&format!("Bearer {}", credentials.access_token)) {
            Ok(value) => value,
            Err(_) => return UsageSnapshot::failed(ErrorKind::NoToken, "Invalid token", plan),
        };

        debug!(url = %self.usage_url, "Fetching usage data");

        let response = match self
            .client
            .get(&self.usage_url)
            .header(AUTHORIZATION, bearer)
            .header(CONTENT_TYPE, "application/json")
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .header("anthropic-beta", ANTHROPIC_BETA)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let (kind, label) = classify_transport_error(&e);
                warn!(error = %e, kind = %kind, "Usage request failed");
                return UsageSnapshot::failed(kind, label, plan);
            }
        };

        let status = response.status().as_u16();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                let (kind, label) = classify_transport_error(&e);
                warn!(error = %e, kind = %kind, "Failed to read usage response");
                return UsageSnapshot::failed(kind, label, plan);
            }
        };

        if status != 200 {
            let message = http_error_message(status, &body);
            warn!(status, message = %message, "Usage request rejected");
            return UsageSnapshot::failed(ErrorKind::HttpError(status), message, plan);
        }

        parse_usage_body(&body, plan)
    }
}

/// Map a transport failure to an error kind and a short label
pub fn classify_transport_error(error: &reqwest::Error) -> (ErrorKind, &'static str) {
    let chain = error_chain_text(error).to_lowercase();

    let tls_patterns = ["certificate", "cert", "tls", "ssl", "handshake"];
    let dns_patterns = ["dns", "resolve", "lookup", "name or service"];

    if error.is_timeout() {
        (ErrorKind::NetworkTimeout, "Request timed out")
    } else if tls_patterns.iter().any(|p| chain.contains(p)) {
        (ErrorKind::NetworkTimeout, "Secure connection failed")
    } else if dns_patterns.iter().any(|p| chain.contains(p)) {
        (ErrorKind::NetworkOffline, "Cannot resolve host")
    } else if error.is_connect() {
        (ErrorKind::NetworkOffline, "No connection")
    } else {
        (ErrorKind::Unknown, "Request failed")
    }
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

fn http_error_message(status: u16, body: &str) -> String {
    let base = match status {
        401 => "Auth expired - re-login required".to_string(),
        429 => "Rate limited".to_string(),
        500..=599 => format!("Server error (HTTP {})", status),
        _ => format!("HTTP {}", status),
    };

    match serde_json::from_str::<ApiErrorResponse>(body) {
        Ok(ApiErrorResponse {
            error:
                ApiError {
                    message: Some(message),
                    error_type,
                },
        }) if status != 401 => match error_type {
            Some(error_type) => format!("{} ({} - {})", base, error_type, message),
            None => format!("{} ({})", base, message),
        },
        _ => base,
    }
}

/// Parse a successful usage body. Either window may be missing.
pub fn parse_usage_body(body: &str, plan_label: &str) -> UsageSnapshot {
    let json: Value = match serde_json::from_str(body) {
        Ok(Value::Object(map)) => Value::Object(map),
        Ok(_) | Err(_) => {
            warn!("Usage response is not a JSON object");
            return UsageSnapshot::failed(ErrorKind::ParseError, "Parse error", plan_label);
        }
    };

    let mut snapshot = UsageSnapshot {
        plan_label: plan_label.to_string(),
        ..Default::default()
    };

    if let Some(five_hour) = json.get("five_hour").filter(|v| v.is_object()) {
        snapshot.session_pct = parse_util(five_hour.get("utilization"));
        snapshot.session_reset_at = five_hour
            .get("resets_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
    }

    if let Some(seven_day) = json.get("seven_day").filter(|v| v.is_object()) {
        snapshot.weekly_pct = parse_util(seven_day.get("utilization"));
        snapshot.weekly_reset_at = seven_day
            .get("resets_at")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
    }

    debug!(
        session_pct = snapshot.session_pct,
        weekly_pct = snapshot.weekly_pct,
        "Usage body parsed"
    );

    snapshot
}

/// Utilization arrives as a number or as a string like `"42.5%"`. Anything unparsable
/// or non-finite is 0, the rest is clamped to 0..=100.
pub fn parse_util(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.replace('%', "").trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(pct) if pct.is_finite() => pct.clamp(0.0, 100.0),
        _ => 0.0,
    }
}

/// ISO-8601 with or without fractional seconds
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    const WITH_FRACTION: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";
    const WITHOUT_FRACTION: &str = "%Y-%m-%dT%H:%M:%S%:z";

    let s = s.trim();
    let normalized = match s.strip_suffix('Z').or_else(|| s.strip_suffix('z')) {
        Some(stripped) => format!("{}+00:00", stripped),
        None => s.to_string(),
    };

    DateTime::parse_from_str(&normalized, WITH_FRACTION)
        .or_else(|_| DateTime::parse_from_str(&normalized, WITHOUT_FRACTION))
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
