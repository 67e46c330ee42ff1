//! Authenticated REST client for the marketplace backend. One retry on
//! 401 with a single-flight token refresh; everything else surfaces as a
//! typed [`ClientError`].

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use shared::{
    domain::{
        Application, ApplicationId, Deal, DealId, DealStatus, Session, UserId, UserProfile,
    },
    error::ClientError,
};
use storage::Storage;

pub type ApiResult<T> = Result<T, ClientError>;

/// Observed access-token field casings, most common first. The backend
/// has shipped all of these at one point or another.
const ACCESS_TOKEN_KEYS: &[&str] = &[
    "JWTtoken",
    "jwtToken",
    "jwTtoken",
    "token",
    "JwtToken",
    "accessToken",
];
const REFRESH_TOKEN_KEYS: &[&str] = &["RefreshToken", "refreshToken"];
const ERROR_MESSAGE_KEYS: &[&str] = &["message", "Message", "error", "Error"];

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub name: String,
    pub login: String,
    pub email: String,
    pub password: String,
    pub role: i64,
    #[serde(rename = "type")]
    pub user_type: i64,
}

pub struct BackendClient {
    http: Client,
    base_url: String,
    storage: Storage,
    /// Single-flight gate: at most one token refresh in flight. Callers
    /// that lose the race wait here, then re-read the store and skip
    /// straight to the retry if the token already rotated.
    refresh_gate: Mutex<()>,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, storage: Storage) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            storage,
            refresh_gate: Mutex::new(()),
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Core request path: bearer auth when a token is stored, one refresh
    /// + retry cycle on 401, typed errors otherwise.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ApiResult<Value> {
        let token = self.storage.access_token().await.map_err(storage_error)?;
        let response = self
            .execute(method.clone(), path, body, token.as_deref())
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(stale_token) = token {
                return self.refresh_and_retry(method, path, body, stale_token).await;
            }
        }

        decode_response(response).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> ApiResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.http.request(method, &url);
        if let Some(token) = token {
            // Older sessions stored the header value verbatim.
            let clean = token.strip_prefix("Bearer ").unwrap_or(token);
            builder = builder.bearer_auth(clean);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))
    }

    async fn refresh_and_retry(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        stale_token: String,
    ) -> ApiResult<Value> {
        let _gate = self.refresh_gate.lock().await;

        let current = self.storage.access_token().await.map_err(storage_error)?;
        if current.as_deref() == Some(stale_token.as_str()) {
            self.refresh_tokens().await?;
        } else {
            debug!("auth: token already rotated by a concurrent call, retrying directly");
        }

        let token = self.storage.access_token().await.map_err(storage_error)?;
        let response = self.execute(method, path, body, token.as_deref()).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Auth(
                "request kept failing after token refresh".into(),
            ));
        }
        decode_response(response).await
    }

    async fn refresh_tokens(&self) -> ApiResult<()> {
        let session = self
            .storage
            .load_session()
            .await
            .map_err(storage_error)?
            .ok_or_else(|| ClientError::Auth("no refresh token available".into()))?;

        info!("auth: access token rejected, refreshing");
        let response = self
            .http
            .post(format!("{}/Auth/RefreshToken", self.base_url))
            .json(&json!({ "refreshToken": session.refresh_token }))
            .send()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        // The backend has been seen answering a valid rotation with 400.
        if !status.is_success() && status != StatusCode::BAD_REQUEST {
            return Err(ClientError::Auth(extract_error_message(status, &text)));
        }

        let value: Value = serde_json::from_str(&text)
            .map_err(|_| ClientError::Auth("refresh response was not JSON".into()))?;
        let access = first_string(&value, ACCESS_TOKEN_KEYS)
            .ok_or_else(|| ClientError::Auth("refresh response carried no access token".into()))?;
        let refresh =
            first_string(&value, REFRESH_TOKEN_KEYS).unwrap_or(session.refresh_token.clone());

        self.storage
            .set_tokens(&access, &refresh)
            .await
            .map_err(storage_error)?;
        info!("auth: tokens rotated");
        Ok(())
    }

    // --- auth ---

    /// `POST /Auth/Authentication`. Persists the session on success. A
    /// soft-deleted account authenticates at the HTTP level but is
    /// rejected here and leaves no stored session behind.
    pub async fn login(&self, email: &str, password: &str) -> ApiResult<Session> {
        let response = self
            .http
            .post(format!("{}/Auth/Authentication", self.base_url))
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Auth(extract_error_message(status, &text)));
        }
        if !status.is_success() {
            return Err(ClientError::server(
                status.as_u16(),
                extract_error_message(status, &text),
            ));
        }

        let data: Value = serde_json::from_str(&text)
            .map_err(|_| ClientError::Auth("login response was not JSON".into()))?;
        let access = first_string(&data, ACCESS_TOKEN_KEYS)
            .ok_or_else(|| ClientError::Auth("login response carried no access token".into()))?;
        let refresh = first_string(&data, REFRESH_TOKEN_KEYS)
            .ok_or_else(|| ClientError::Auth("login response carried no refresh token".into()))?;

        let user_value = data.get("user").unwrap_or(&data);
        let profile: UserProfile = serde_json::from_value(user_value.clone())
            .map_err(|err| ClientError::Auth(format!("malformed user record: {err}")))?;

        if profile.is_deleted() {
            self.storage.clear_session().await.map_err(storage_error)?;
            warn!("auth: rejected login into a soft-deleted account");
            return Err(ClientError::Auth(
                "this account has been deleted and cannot be restored".into(),
            ));
        }

        let user_id = profile
            .id
            .ok_or_else(|| ClientError::Auth("login response carried no user id".into()))?;
        let session = Session {
            access_token: access,
            refresh_token: refresh,
            user_id,
            user_type: profile.user_type,
        };
        self.storage
            .save_session(&session)
            .await
            .map_err(storage_error)?;
        info!(user_id = user_id.0, "auth: logged in");
        Ok(session)
    }

    /// `POST /Auth/Registration`. 400/409 carry a user-facing message.
    pub async fn register(&self, request: &RegistrationRequest) -> ApiResult<Value> {
        let response = self
            .http
            .post(format!("{}/Auth/Registration", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| ClientError::Connection(err.to_string()))?;
        if !status.is_success() {
            return Err(ClientError::server(
                status.as_u16(),
                extract_error_message(status, &text),
            ));
        }
        serde_json::from_str(&text).map_err(|_| {
            ClientError::server(status.as_u16(), "registration response was not JSON")
        })
    }

    pub async fn me(&self) -> ApiResult<UserProfile> {
        let value = self.request(Method::GET, "/Auth/Me", None).await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::server(200, format!("malformed profile record: {err}")))
    }

    /// `DELETE /Auth/Delete` — soft delete. The stored session is cleared
    /// so the next start cannot resume into a dead account.
    pub async fn delete_account(&self) -> ApiResult<()> {
        self.request(Method::DELETE, "/Auth/Delete", None).await?;
        self.storage.clear_session().await.map_err(storage_error)?;
        Ok(())
    }

    // --- deals ---

    pub async fn get_deal(&self, deal_id: DealId) -> ApiResult<Deal> {
        let value = self
            .request(Method::GET, &format!("/Deal/GetDeal/{}", deal_id.0), None)
            .await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::server(200, format!("malformed deal record: {err}")))
    }

    pub async fn get_deal_by_application(&self, application_id: ApplicationId) -> ApiResult<Deal> {
        let value = self
            .request(
                Method::GET,
                &format!("/Deal/GetByApplication/{}", application_id.0),
                None,
            )
            .await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::server(200, format!("malformed deal record: {err}")))
    }

    /// The create endpoint takes its parameters in the query string and an
    /// empty JSON body.
    pub async fn create_deal(
        &self,
        application_id: ApplicationId,
        description: &str,
    ) -> ApiResult<Value> {
        let encoded = url_encode(description);
        self.request(
            Method::POST,
            &format!(
                "/Deal/CreateDeal?applicationId={}&description={}",
                application_id.0, encoded
            ),
            Some(&json!({})),
        )
        .await
    }

    pub async fn update_deal_status(&self, deal_id: DealId, status: DealStatus) -> ApiResult<()> {
        self.request(
            Method::PUT,
            &format!("/Deal/UpdateStatus/{}", deal_id.0),
            Some(&json!({ "status": i64::from(status) })),
        )
        .await?;
        Ok(())
    }

    // --- messages (REST fallback when the hub is down) ---

    pub async fn get_messages_page(
        &self,
        deal_id: DealId,
        page: u32,
        page_size: u32,
    ) -> ApiResult<Value> {
        self.request(
            Method::GET,
            &format!(
                "/Messages/GetByDeal/{}?page={page}&pageSize={page_size}",
                deal_id.0
            ),
            None,
        )
        .await
    }

    // --- applications (lookup only; the CRUD lives elsewhere) ---

    pub async fn get_application(&self, application_id: ApplicationId) -> ApiResult<Application> {
        let value = self
            .request(
                Method::GET,
                &format!("/Applications/GetApp/{}", application_id.0),
                None,
            )
            .await?;
        serde_json::from_value(value).map_err(|err| {
            ClientError::server(200, format!("malformed application record: {err}"))
        })
    }

    // --- users / balances ---

    pub async fn get_user(&self, user_id: UserId) -> ApiResult<UserProfile> {
        let value = self
            .request(Method::GET, &format!("/User/{}", user_id.0), None)
            .await?;
        serde_json::from_value(value)
            .map_err(|err| ClientError::server(200, format!("malformed profile record: {err}")))
    }

    pub async fn update_user(&self, user_id: UserId, profile: &UserProfile) -> ApiResult<Value> {
        let body = serde_json::to_value(profile)
            .map_err(|err| ClientError::Validation(format!("unserializable profile: {err}")))?;
        self.request(Method::PUT, &format!("/User/{}", user_id.0), Some(&body))
            .await
    }

    /// `POST /User/UpdateInformation` — the backend insists on PascalCase
    /// here and on `SocialLinks` being a list, never null.
    pub async fn update_own_info(&self, profile: &UserProfile) -> ApiResult<Value> {
        let body = json!({
            "Name": profile.name,
            "Login": profile.login,
            "Email": profile.email,
            "Role": profile.role,
            "Type": i64::from(profile.user_type),
            "Balance": profile.balance,
            "AvatarPath": profile.avatar_path,
            "Bio": profile.bio,
            "SocialLinks": profile.social_links,
        });
        self.request(Method::POST, "/User/UpdateInformation", Some(&body))
            .await
    }

    /// Read-modify-write against the user's balance field; the backend has
    /// no atomic increment. Negative results are rejected before the write.
    pub async fn adjust_balance(&self, user_id: UserId, delta: i64) -> ApiResult<i64> {
        let mut profile = self.get_user(user_id).await?;
        let new_balance = profile.balance + delta;
        if new_balance < 0 {
            return Err(ClientError::Validation(format!(
                "insufficient balance: {} available, {} required",
                profile.balance, -delta
            )));
        }
        profile.balance = new_balance;
        self.update_user(user_id, &profile).await?;
        debug!(
            user_id = user_id.0,
            delta, new_balance, "balance: read-modify-write applied"
        );
        Ok(new_balance)
    }
}

async fn decode_response(response: reqwest::Response) -> ApiResult<Value> {
    let status = response.status();
    if status == StatusCode::NO_CONTENT {
        // Success without a body; never parsed as JSON.
        return Ok(Value::Null);
    }

    let text = response
        .text()
        .await
        .map_err(|err| ClientError::Connection(err.to_string()))?;

    if status.is_success() {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        return Ok(serde_json::from_str(&text)
            .unwrap_or_else(|_| json!({ "success": true, "message": text })));
    }

    Err(ClientError::server(
        status.as_u16(),
        extract_error_message(status, &text),
    ))
}

fn extract_error_message(status: StatusCode, text: &str) -> String {
    if !text.trim().is_empty() {
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if let Some(message) = first_string(&value, ERROR_MESSAGE_KEYS) {
                return message;
            }
        }
        return text.to_string();
    }
    format!("HTTP error! status: {}", status.as_u16())
}

/// First-present precedence over known field casings.
fn first_string(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

fn storage_error(err: anyhow::Error) -> ClientError {
    ClientError::Storage(err.to_string())
}

/// Minimal percent-encoding for the query-string description parameter.
fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
