//! In-process stand-in for the TarotSync API, for tests.
//!
//! [`FakeServer`] implements [`HttpBackend`] directly, so tests exercise the
//! real transport, refresh and queue code without a socket. Behaviour that
//! tests need to provoke (unreachable network, slow refreshes, expired
//! tokens, rejected writes) is switched on through setters.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tarotsync_common::{Error, Result};

use crate::remote::config::ClientConfig;
use crate::remote::http::{HttpBackend, HttpRequest, HttpResponse, Method};

/// Base URL the fake answers on.
pub const FAKE_BASE_URL: &str = "http://fake.test/api";

/// Client configuration pointing at [`FAKE_BASE_URL`].
pub fn test_config() -> ClientConfig {
    ClientConfig {
        request_timeout_ms: 2_000,
        ..ClientConfig::new(FAKE_BASE_URL)
    }
}

/// One request as seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
}

struct Account {
    id: String,
    password: String,
}

/// A canned failure for the next matching request.
struct InjectedFailure {
    method: String,
    path_prefix: String,
    status: Option<u16>,
}

struct FakeState {
    reachable: bool,
    latency: Duration,
    refresh_delay: Duration,
    fail_refresh: bool,
    expires_in: String,
    next_token: u64,
    accounts: HashMap<String, Account>,
    access_tokens: HashMap<String, String>,
    refresh_tokens: HashMap<String, String>,
    sessions: BTreeMap<String, Value>,
    spreads: Vec<Value>,
    failures: VecDeque<InjectedFailure>,
    calls: Vec<RecordedCall>,
}

/// Scriptable in-memory API server.
pub struct FakeServer {
    state: Mutex<FakeState>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                reachable: true,
                latency: Duration::ZERO,
                refresh_delay: Duration::ZERO,
                fail_refresh: false,
                expires_in: "1h".to_string(),
                next_token: 0,
                accounts: HashMap::new(),
                access_tokens: HashMap::new(),
                refresh_tokens: HashMap::new(),
                sessions: BTreeMap::new(),
                spreads: Vec::new(),
                failures: VecDeque::new(),
                calls: Vec::new(),
            }),
        })
    }

    /// Server with one registered account.
    pub fn with_user(email: &str, password: &str) -> Arc<Self> {
        let server = Self::new();
        server.add_user(email, password);
        server
    }

    pub fn add_user(&self, email: &str, password: &str) {
        let mut state = self.lock();
        let id = format!("user-{}", state.accounts.len() + 1);
        state.accounts.insert(
            email.to_string(),
            Account {
                id,
                password: password.to_string(),
            },
        );
    }

    /// When unreachable every request fails with `NetworkUnavailable`.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Delay applied to every request before it is handled.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Extra delay applied to `/auth/refresh-token`.
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = delay;
    }

    /// Make every refresh answer 401.
    pub fn set_fail_refresh(&self, fail: bool) {
        self.lock().fail_refresh = fail;
    }

    /// Lifetime reported for newly issued tokens.
    pub fn set_expires_in(&self, expires_in: &str) {
        self.lock().expires_in = expires_in.to_string();
    }

    /// Invalidate every issued access token; refresh tokens stay valid.
    pub fn expire_access_tokens(&self) {
        self.lock().access_tokens.clear();
    }

    /// Answer the next request matching `method` and `path_prefix` with `status`.
    pub fn fail_next(&self, method: &str, path_prefix: &str, status: u16) {
        self.lock().failures.push_back(InjectedFailure {
            method: method.to_string(),
            path_prefix: path_prefix.to_string(),
            status: Some(status),
        });
    }

    /// Drop the connection on the next request matching `method` and `path_prefix`.
    pub fn disconnect_next(&self, method: &str, path_prefix: &str) {
        self.lock().failures.push_back(InjectedFailure {
            method: method.to_string(),
            path_prefix: path_prefix.to_string(),
            status: None,
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    /// Number of handled requests with this method and exact path.
    pub fn count_calls(&self, method: &str, path: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    /// Stored session for `date`, as the server holds it.
    pub fn session(&self, date: &str) -> Option<Value> {
        self.lock().sessions.get(date).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn spreads(&self) -> Vec<Value> {
        self.lock().spreads.clone()
    }

    /// Seed a session directly, bypassing authentication.
    pub fn insert_session(&self, session: Value) {
        if let Some(date) = session["date"].as_str().map(str::to_string) {
            self.lock().sessions.insert(date, session);
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl HttpBackend for FakeServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = request
            .url
            .strip_prefix(FAKE_BASE_URL)
            .unwrap_or(&request.url)
            .to_string();
        let route = path.split('?').next().unwrap_or_default().to_string();

        let (latency, refresh_delay) = {
            let state = self.lock();
            (state.latency, state.refresh_delay)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if route == "/auth/refresh-token" && !refresh_delay.is_zero() {
            tokio::time::sleep(refresh_delay).await;
        }

        let mut state = self.lock();
        if !state.reachable {
            return Err(Error::NetworkUnavailable(format!(
                "{} {} unreachable",
                request.method, path
            )));
        }

        let method = request.method.to_string();
        let injected = state
            .failures
            .iter()
            .position(|f| f.method == method && route.starts_with(&f.path_prefix));
        if let Some(failure) = injected.and_then(|i| state.failures.remove(i)) {
            state.calls.push(RecordedCall { method, path: route });
            return match failure.status {
                Some(status) => Ok(respond(status, json!({ "error": "Injected failure" }))),
                None => Err(Error::NetworkUnavailable("Connection reset".to_string())),
            };
        }

        state.calls.push(RecordedCall {
            method,
            path: route.clone(),
        });
        Ok(state.handle(&request, &route))
    }
}

fn respond(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        body: body.to_string(),
    }
}

fn error(status: u16, message: &str) -> HttpResponse {
    respond(status, json!({ "error": message, "code": "FAKE_ERROR" }))
}

impl FakeState {
    fn handle(&mut self, request: &HttpRequest, route: &str) -> HttpResponse {
        let body = request.body.clone().unwrap_or(Value::Null);
        let method = &request.method;

        match route {
            "/auth/register" if *method == Method::POST => return self.register(&body),
            "/auth/login" if *method == Method::POST => return self.login(&body),
            "/auth/refresh-token" if *method == Method::POST => return self.refresh(&body),
            _ => {}
        }

        let Some(user_id) = request
            .bearer
            .as_ref()
            .and_then(|token| self.access_tokens.get(token))
            .cloned()
        else {
            return error(401, "Invalid or expired token");
        };

        let segments: Vec<&str> = route.trim_start_matches('/').split('/').collect();
        match (method.as_str(), segments.as_slice()) {
            ("POST", ["auth", "logout"]) => {
                self.refresh_tokens.retain(|_, owner| *owner != user_id);
                respond(200, json!({ "message": "Logged out" }))
            }
            ("GET", ["auth", "me"]) => match self.user_json(&user_id) {
                Some(user) => respond(200, json!({ "user": user })),
                None => error(404, "User not found"),
            },
            ("GET", ["daily-sessions"]) => {
                let sessions: Vec<Value> = self.sessions.values().rev().cloned().collect();
                respond(200, json!({ "sessions": sessions }))
            }
            ("GET", ["daily-sessions", date]) => match self.sessions.get(*date) {
                Some(session) => {
                    let mut session = session.clone();
                    session["exists"] = json!(true);
                    respond(200, session)
                }
                None => respond(
                    200,
                    json!({
                        "date": date,
                        "cards": vec![Value::Null; 24],
                        "memos": {},
                        "insights": null,
                        "exists": false
                    }),
                ),
            },
            ("POST" | "PUT", ["daily-sessions"]) => self.save_session(body),
            ("DELETE", ["daily-sessions", date]) => match self.sessions.remove(*date) {
                Some(_) => respond(200, json!({ "message": "Deleted" })),
                None => error(404, "Session not found"),
            },
            ("GET", ["spreads"]) => respond(200, json!({ "spreads": self.spreads })),
            ("POST", ["spreads"]) => self.create_spread(body),
            ("PUT", ["spreads", id]) => self.update_spread(body, id),
            ("DELETE", ["spreads", id]) => {
                let before = self.spreads.len();
                self.spreads.retain(|spread| spread["id"] != json!(id));
                if self.spreads.len() == before {
                    error(404, "Spread not found")
                } else {
                    respond(200, json!({ "message": "Deleted" }))
                }
            }
            ("GET", ["sync", "status"]) => respond(
                200,
                json!({
                    "status": "healthy",
                    "dataStats": {
                        "dailySessions": self.sessions.len(),
                        "spreadReadings": self.spreads.len()
                    }
                }),
            ),
            ("GET", ["sync", "export"]) => {
                let sessions: Vec<Value> = self.sessions.values().cloned().collect();
                respond(
                    200,
                    json!({ "dailySessions": sessions, "spreadReadings": self.spreads }),
                )
            }
            ("POST", ["sync", "import"]) => {
                let mut imported = 0;
                if let Some(sessions) = body["dailySessions"].as_array() {
                    for session in sessions {
                        if let Some(date) = session["date"].as_str() {
                            self.sessions.insert(date.to_string(), session.clone());
                            imported += 1;
                        }
                    }
                }
                if let Some(spreads) = body["spreadReadings"].as_array() {
                    for spread in spreads {
                        self.upsert_spread(spread.clone());
                        imported += 1;
                    }
                }
                respond(200, json!({ "imported": imported }))
            }
            _ => error(404, "Route not found"),
        }
    }

    fn register(&mut self, body: &Value) -> HttpResponse {
        let (Some(email), Some(password)) = (body["email"].as_str(), body["password"].as_str())
        else {
            return error(400, "Email and password are required");
        };
        if self.accounts.contains_key(email) {
            return error(409, "User already exists");
        }

        let id = format!("user-{}", self.accounts.len() + 1);
        self.accounts.insert(
            email.to_string(),
            Account {
                id: id.clone(),
                password: password.to_string(),
            },
        );

        let tokens = self.issue_tokens(&id);
        respond(201, json!({ "user": self.user_json(&id), "tokens": tokens }))
    }

    fn login(&mut self, body: &Value) -> HttpResponse {
        let email = body["email"].as_str().unwrap_or_default();
        let password = body["password"].as_str().unwrap_or_default();

        let id = match self.accounts.get(email) {
            Some(account) if account.password == password => account.id.clone(),
            _ => return error(401, "Invalid email or password"),
        };

        let tokens = self.issue_tokens(&id);
        respond(200, json!({ "user": self.user_json(&id), "tokens": tokens }))
    }

    fn refresh(&mut self, body: &Value) -> HttpResponse {
        if self.fail_refresh {
            return error(401, "Invalid refresh token");
        }
        let Some(owner) = body["refreshToken"]
            .as_str()
            .and_then(|token| self.refresh_tokens.remove(token))
        else {
            return error(401, "Invalid refresh token");
        };

        // rotation invalidates every outstanding access token for the user
        self.access_tokens.retain(|_, user| *user != owner);
        let tokens = self.issue_tokens(&owner);
        respond(200, json!({ "tokens": tokens }))
    }

    fn issue_tokens(&mut self, user_id: &str) -> Value {
        self.next_token += 1;
        let access = format!("access-{}", self.next_token);
        let refresh = format!("refresh-{}", self.next_token);
        self.access_tokens
            .insert(access.clone(), user_id.to_string());
        self.refresh_tokens
            .insert(refresh.clone(), user_id.to_string());

        json!({
            "accessToken": access,
            "refreshToken": refresh,
            "expiresIn": self.expires_in
        })
    }

    fn user_json(&self, user_id: &str) -> Option<Value> {
        self.accounts
            .iter()
            .find(|(_, account)| account.id == user_id)
            .map(|(email, account)| {
                json!({
                    "id": account.id,
                    "email": email,
                    "name": null,
                    "language": "ko",
                    "timezone": "Asia/Seoul",
                    "subscriptionStatus": "trial"
                })
            })
    }

    fn save_session(&mut self, mut body: Value) -> HttpResponse {
        let Some(date) = body["date"].as_str().map(str::to_string) else {
            return error(400, "Date is required");
        };
        if body["cards"].as_array().map(Vec::len) != Some(24) {
            return error(400, "Cards must contain exactly 24 entries");
        }

        let now = chrono::Utc::now().to_rfc3339();
        let id = self
            .sessions
            .get(&date)
            .and_then(|existing| existing["id"].as_str().map(str::to_string))
            .unwrap_or_else(|| format!("session-{}", date));
        body["id"] = json!(id);
        body["updatedAt"] = json!(now);
        if let Some(map) = body.as_object_mut() {
            map.remove("duration");
        }

        self.sessions.insert(date, body.clone());
        respond(201, json!({ "session": body }))
    }

    fn has_spread(&self, id: &Value) -> bool {
        self.spreads.iter().any(|existing| existing["id"] == *id)
    }

    /// `POST /spreads` only inserts; an id the server already holds is a conflict.
    fn create_spread(&mut self, mut body: Value) -> HttpResponse {
        if body["title"].as_str().map_or(true, str::is_empty) {
            return error(400, "Title is required");
        }
        if body["id"].as_str().is_none() {
            body["id"] = json!(format!("spread-{}", self.spreads.len() + 1));
        }
        if self.has_spread(&body["id"]) {
            return error(409, "Spread reading already exists");
        }

        self.spreads.push(body.clone());
        respond(201, json!({ "spread": body }))
    }

    /// `PUT /spreads/:id` only updates; an unknown id is not found.
    fn update_spread(&mut self, mut body: Value, id: &str) -> HttpResponse {
        if !self.has_spread(&json!(id)) {
            return error(404, "Spread reading not found or update failed");
        }
        if body["title"].as_str().map_or(true, str::is_empty) {
            return error(400, "Title is required");
        }

        body["id"] = json!(id);
        self.upsert_spread(body.clone());
        respond(200, json!({ "spread": body }))
    }

    fn upsert_spread(&mut self, spread: Value) {
        match self
            .spreads
            .iter_mut()
            .find(|existing| existing["id"] == spread["id"])
        {
            Some(existing) => *existing = spread,
            None => self.spreads.push(spread),
        }
    }
}
