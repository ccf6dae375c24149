// Common test utilities and fixtures

use mockito::{Matcher, Mock, Server, ServerGuard};
use serde_json::json;
use std::sync::Arc;
use usage_sync_lib::config::OAUTH_CLIENT_ID;
use usage_sync_lib::{CredentialProvider, MemoryStore, UsageFetcher, build_http_client};

pub const SERVICE: &str = "Claude Code-credentials";
pub const ACCOUNT: &str = "test-user";

pub const USAGE_PATH: &str = "/api/oauth/usage";
pub const TOKEN_PATH: &str = "/v1/oauth/token";

/// Secret store payload in the shape the CLI writes
pub fn credential_payload(
    access_token: &str,
    refresh_token: Option<&str>,
    expires_at_ms: Option<i64>,
    subscription_type: &str,
) -> String {
    let mut oauth = json!({
        "accessToken": access_token,
        "subscriptionType": subscription_type,
        "scopes": ["user:inference", "user:profile"]
    });
    if let Some(refresh_token) = refresh_token {
        oauth["refreshToken"] = json!(refresh_token);
    }
    if let Some(expires_at_ms) = expires_at_ms {
        oauth["expiresAt"] = json!(expires_at_ms);
    }
    json!({ "claudeAiOauth": oauth }).to_string()
}

pub fn store_with(payload: &str) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::with_entry(SERVICE, ACCOUNT, payload))
}

/// Mock usage and token endpoints for testing
pub struct MockClaudeApi {
    pub server: ServerGuard,
}

impl MockClaudeApi {
    /// Create a new mock API server (async)
    pub async fn new() -> Self {
        let server = Server::new_async().await;
        Self { server }
    }

    pub fn usage_url(&self) -> String {
        format!("{}{}", self.server.url(), USAGE_PATH)
    }

    pub fn token_url(&self) -> String {
        format!("{}{}", self.server.url(), TOKEN_PATH)
    }

    /// Fetcher wired to this server, reading credentials from `store`
    pub fn fetcher(&self, store: Arc<MemoryStore>) -> UsageFetcher {
        fetcher_for(store, &self.usage_url(), &self.token_url())
    }

    /// Successful usage response for requests carrying `token`
    pub async fn mock_usage_success(&mut self, token: &str, session_pct: f64, weekly_pct: f64) -> Mock {
        let body = json!({
            "five_hour": {
                "utilization": session_pct,
                "resets_at": "2025-11-22T18:00:00.000000+00:00"
            },
            "seven_day": {
                "utilization": weekly_pct,
                "resets_at": "2025-11-29T00:00:00Z"
            },
            "seven_day_oauth_apps": null,
            "seven_day_opus": null
        });

        self.mock_usage_body(token, 200, &body.to_string()).await
    }

    /// Usage response with an arbitrary status and body for requests carrying `token`
    pub async fn mock_usage_body(&mut self, token: &str, status: usize, body: &str) -> Mock {
        self.server
            .mock("GET", USAGE_PATH)
            .match_header("authorization", format!("Bearer {}", token).as_str())
            .match_header("anthropic-beta", "oauth-2025-04-20")
            .match_header("user-agent", "claude-code/2.1.5")
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    /// 401 in the API's error envelope
    pub async fn mock_usage_unauthorized(&mut self, token: &str) -> Mock {
        let body = json!({
            "type": "error",
            "error": {
                "type": "authentication_error",
                "message": "OAuth token has expired"
            },
            "request_id": "req_123456"
        });
        self.mock_usage_body(token, 401, &body.to_string()).await
    }

    /// Successful refresh-token exchange for `refresh_token`
    pub async fn mock_token_success(
        &mut self,
        refresh_token: &str,
        new_access_token: &str,
        new_refresh_token: Option<&str>,
        expires_in: Option<i64>,
    ) -> Mock {
        let mut body = json!({
            "access_token": new_access_token,
            "token_type": "Bearer"
        });
        if let Some(new_refresh_token) = new_refresh_token {
            body["refresh_token"] = json!(new_refresh_token);
        }
        if let Some(expires_in) = expires_in {
            body["expires_in"] = json!(expires_in);
        }

        self.server
            .mock("POST", TOKEN_PATH)
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                Matcher::UrlEncoded("refresh_token".into(), refresh_token.into()),
                Matcher::UrlEncoded("client_id".into(), OAUTH_CLIENT_ID.into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await
    }

    /// Rejected refresh-token exchange
    pub async fn mock_token_failure(&mut self, status: usize) -> Mock {
        self.server
            .mock("POST", TOKEN_PATH)
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(json!({"error": "invalid_grant"}).to_string())
            .create_async()
            .await
    }
}

pub fn fetcher_for(store: Arc<MemoryStore>, usage_url: &str, token_url: &str) -> UsageFetcher {
    let client = build_http_client().expect("http client");
    let credentials = Arc::new(CredentialProvider::new(
        store,
        SERVICE,
        ACCOUNT,
        client.clone(),
        token_url,
    ));
    UsageFetcher::new(client, usage_url, credentials)
}
