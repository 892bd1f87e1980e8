//! Credential lifecycle: login, registration, refresh and logout.
//!
//! The authority owns the single live [`AuthState`] inside a watch channel.
//! Every change (login, refresh, logout) is pushed to subscribers such as
//! the storage router; nobody else mutates it.
//!
//! Refresh is single-flight. A `refreshing` flag and the list of waiting
//! requests share one mutex: the first caller to observe an unauthorized
//! response leads the refresh, later callers park a oneshot sender in the
//! list, and the leader's drop guard hands every waiter the same outcome
//! before clearing the flag.

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tarotsync_common::{AuthState, Credentials, Error, Result, UserInfo};

use super::config::ClientConfig;
use super::http::{decode_response, error_message, send_with_timeout, HttpBackend, HttpRequest, HttpResponse};
use super::wire::{AuthResponse, MeResponse, RefreshResponse, RegisterRequest};

/// Refresh bookkeeping guarded by one lock.
#[derive(Default)]
struct RefreshGate {
    refreshing: bool,
    waiters: Vec<oneshot::Sender<bool>>,
}

/// Settles a refresh when dropped, even if the leading future is cancelled.
struct SettleGuard<'a> {
    gate: &'a Mutex<RefreshGate>,
    succeeded: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        let mut gate = match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        };

        let waiters = std::mem::take(&mut gate.waiters);
        if !waiters.is_empty() {
            debug!(
                "Releasing {} request(s) waiting on token refresh (success: {})",
                waiters.len(),
                self.succeeded
            );
        }
        for waiter in waiters {
            let _ = waiter.send(self.succeeded);
        }
        gate.refreshing = false;
    }
}

/// Owner of the credential lifecycle.
pub struct TokenAuthority {
    config: ClientConfig,
    backend: Arc<dyn HttpBackend>,
    state: watch::Sender<AuthState>,
    gate: Mutex<RefreshGate>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl TokenAuthority {
    /// Create a signed-out authority.
    ///
    /// # Errors
    /// - Invalid configuration
    pub fn new(config: ClientConfig, backend: Arc<dyn HttpBackend>) -> Result<Arc<Self>> {
        let config = config.validated()?;
        let (state, _) = watch::channel(AuthState::LoggedOut);

        Ok(Arc::new(Self {
            config,
            backend,
            state,
            gate: Mutex::new(RefreshGate::default()),
            timer: Mutex::new(None),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn backend(&self) -> Arc<dyn HttpBackend> {
        self.backend.clone()
    }

    /// Snapshot of the current authentication state.
    pub fn auth_state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Subscribe to authentication state changes.
    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    /// Current access token, if signed in.
    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token().map(str::to_string)
    }

    /// Whether a refresh network call is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.lock_gate().refreshing
    }

    /// Sign in with email and password.
    ///
    /// # Postconditions
    /// - Credentials are replaced and the proactive refresh timer restarted
    /// - Subscribers observe `Authenticated`
    ///
    /// # Errors
    /// - `InvalidCredentials` if the server rejects the login
    /// - `NetworkUnavailable` if the server cannot be reached
    pub async fn login(self: &Arc<Self>, email: &str, password: &str) -> Result<(UserInfo, Credentials)> {
        let body = json!({ "email": email, "password": password });
        let response = self.send(Method::POST, "/auth/login", None, Some(body)).await?;

        if matches!(response.status, 400 | 401) {
            return Err(Error::InvalidCredentials(error_message(&response)));
        }

        self.accept_auth_response(response)
    }

    /// Create an account and sign in with it.
    ///
    /// # Errors
    /// - `AlreadyExists` if the email is taken
    /// - `InvalidCredentials` if the server rejects the submitted fields
    /// - `NetworkUnavailable` if the server cannot be reached
    pub async fn register(self: &Arc<Self>, request: &RegisterRequest) -> Result<(UserInfo, Credentials)> {
        let body = serde_json::to_value(request)?;
        let response = self.send(Method::POST, "/auth/register", None, Some(body)).await?;

        match response.status {
            409 => return Err(Error::AlreadyExists(error_message(&response))),
            400 | 401 => return Err(Error::InvalidCredentials(error_message(&response))),
            _ => {}
        }

        self.accept_auth_response(response)
    }

    /// Resume a session whose credentials were kept by the platform.
    pub fn restore_session(self: &Arc<Self>, user: UserInfo, credentials: Credentials) {
        info!("Restoring session for {}", user.email);
        self.install_session(user, credentials);
    }

    /// Fetch the signed-in user from the server and refresh the cached copy.
    ///
    /// Returns `None` when signed out.
    pub async fn current_user(&self) -> Result<Option<UserInfo>> {
        let mut refreshed = false;

        loop {
            let Some(token) = self.access_token() else {
                return Ok(None);
            };

            let response = self.send(Method::GET, "/auth/me", Some(token), None).await?;
            if response.status == 401 {
                if refreshed {
                    return Err(Error::AuthenticationRequired(
                        "Profile request rejected after token refresh".to_string(),
                    ));
                }
                self.refresh_or_wait().await?;
                refreshed = true;
                continue;
            }

            let body: MeResponse = decode_response(response)?;
            let user = body.user;
            self.state.send_if_modified(|state| match state {
                AuthState::Authenticated { user: cached, .. } if *cached != user => {
                    *cached = user.clone();
                    true
                }
                _ => false,
            });
            return Ok(Some(user));
        }
    }

    /// Refresh the access token unless a refresh is already in flight.
    ///
    /// # Returns
    /// - `Ok(true)` once new credentials are installed
    /// - `Ok(false)` if another refresh was already running (nothing started)
    ///
    /// # Errors
    /// - `AuthenticationRequired` if the refresh failed; the session is ended
    pub async fn refresh(&self) -> Result<bool> {
        {
            let mut gate = self.lock_gate();
            if gate.refreshing {
                debug!("Token refresh already in flight");
                return Ok(false);
            }
            gate.refreshing = true;
        }

        self.lead_refresh().await.map(|()| true)
    }

    /// Refresh the access token, or wait for the refresh already in flight.
    ///
    /// Every caller that overlaps one refresh observes its outcome.
    ///
    /// # Errors
    /// - `AuthenticationRequired` if the refresh failed
    pub async fn refresh_or_wait(&self) -> Result<()> {
        let waiter = {
            let mut gate = self.lock_gate();
            if gate.refreshing {
                let (tx, rx) = oneshot::channel();
                gate.waiters.push(tx);
                Some(rx)
            } else {
                gate.refreshing = true;
                None
            }
        };

        match waiter {
            Some(rx) => match rx.await {
                Ok(true) => Ok(()),
                _ => Err(Error::AuthenticationRequired(
                    "Token refresh failed".to_string(),
                )),
            },
            None => self.lead_refresh().await,
        }
    }

    /// Sign out.
    ///
    /// The logout endpoint is called best-effort; local state is cleared
    /// regardless. An in-flight refresh is not cancelled, its result is
    /// discarded when it lands.
    pub async fn logout(&self) {
        if let Some(token) = self.access_token() {
            let result = self
                .send(Method::POST, "/auth/logout", Some(token), None)
                .await
                .and_then(decode_response::<serde_json::Value>);
            if let Err(e) = result {
                warn!("Logout request failed: {}", e);
            }
        }

        self.clear_session();
    }

    /// Run one refresh as leader. The gate flag must already be set.
    async fn lead_refresh(&self) -> Result<()> {
        let mut guard = SettleGuard {
            gate: &self.gate,
            succeeded: false,
        };

        let result = self.perform_refresh().await;
        guard.succeeded = result.is_ok();
        result
    }

    async fn perform_refresh(&self) -> Result<()> {
        let current = self
            .state
            .borrow()
            .credentials()
            .cloned()
            .ok_or_else(|| Error::AuthenticationRequired("Not signed in".to_string()))?;

        info!("Refreshing access token");
        let body = json!({ "refreshToken": current.refresh_token() });
        let result = match self
            .send(Method::POST, "/auth/refresh-token", None, Some(body))
            .await
        {
            Ok(response) => decode_response::<RefreshResponse>(response),
            Err(e) => Err(e),
        };

        let fresh = match result {
            Ok(response) => response.tokens.into_credentials(),
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                self.end_session_if_current(&current);
                return Err(Error::AuthenticationRequired(format!(
                    "Token refresh failed: {}",
                    e
                )));
            }
        };

        let mut outcome = Ok(());
        self.state.send_if_modified(|state| match state {
            AuthState::Authenticated { credentials, .. } if *credentials == current => {
                *credentials = fresh;
                true
            }
            AuthState::Authenticated { .. } => {
                debug!("Credentials replaced during refresh; keeping the newer ones");
                false
            }
            AuthState::LoggedOut => {
                debug!("Discarding refresh result for a signed-out session");
                outcome = Err(Error::AuthenticationRequired(
                    "Signed out during token refresh".to_string(),
                ));
                false
            }
        });

        outcome
    }

    fn accept_auth_response(self: &Arc<Self>, response: HttpResponse) -> Result<(UserInfo, Credentials)> {
        let body: AuthResponse = decode_response(response)?;
        let (user, tokens) = match (body.user, body.tokens) {
            (Some(user), Some(tokens)) => (user, tokens),
            _ => {
                return Err(Error::Decode(
                    "Auth response is missing user or tokens".to_string(),
                ))
            }
        };

        let credentials = tokens.into_credentials();
        info!("Signed in as {}", user.email);
        self.install_session(user.clone(), credentials.clone());
        Ok((user, credentials))
    }

    fn install_session(self: &Arc<Self>, user: UserInfo, credentials: Credentials) {
        self.state
            .send_replace(AuthState::Authenticated { credentials, user });
        self.start_refresh_timer();
    }

    /// Terminate the session if `credentials` are still the live ones.
    fn end_session_if_current(&self, credentials: &Credentials) {
        let ended = self.state.send_if_modified(|state| {
            if state.credentials() == Some(credentials) {
                *state = AuthState::LoggedOut;
                true
            } else {
                false
            }
        });

        if ended {
            self.cancel_refresh_timer();
            info!("Session ended after failed token refresh");
        }
    }

    fn clear_session(&self) {
        self.cancel_refresh_timer();
        let was_signed_in = self.state.send_if_modified(|state| {
            if state.is_authenticated() {
                *state = AuthState::LoggedOut;
                true
            } else {
                false
            }
        });

        if was_signed_in {
            info!("Signed out");
        }
    }

    fn start_refresh_timer(self: &Arc<Self>) {
        let authority = Arc::downgrade(self);
        let margin = self.config.refresh_margin();
        let handle = tokio::spawn(run_refresh_timer(authority, margin));

        if let Some(previous) = self.lock_timer().replace(handle) {
            previous.abort();
        }
    }

    fn cancel_refresh_timer(&self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        bearer: Option<String>,
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        let request = HttpRequest {
            method,
            url: self.config.endpoint(path),
            bearer,
            body,
        };
        send_with_timeout(self.backend.as_ref(), request, self.config.request_timeout()).await
    }

    fn lock_gate(&self) -> MutexGuard<'_, RefreshGate> {
        match self.gate.lock() {
            Ok(gate) => gate,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.timer.lock() {
            Ok(timer) => timer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for TokenAuthority {
    fn drop(&mut self) {
        if let Some(handle) = self.lock_timer().take() {
            handle.abort();
        }
    }
}

/// Proactive refresh loop; exits when the session ends.
///
/// Only a weak reference is held while sleeping. The refresh itself runs on
/// its own task so that aborting this timer (logout) does not cancel it.
async fn run_refresh_timer(authority: Weak<TokenAuthority>, margin: chrono::Duration) {
    loop {
        let deadline = {
            let Some(strong) = authority.upgrade() else {
                return;
            };
            let state = strong.state.borrow();
            match state.credentials() {
                Some(credentials) => credentials.refresh_deadline(margin),
                None => return,
            }
        };

        let wait = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!("Next proactive token refresh in {:?}", wait);
        tokio::time::sleep(wait).await;

        let Some(strong) = authority.upgrade() else {
            return;
        };

        let due = strong
            .state
            .borrow()
            .credentials()
            .map(|credentials| credentials.needs_refresh(margin));
        match due {
            None => return,
            Some(false) => continue,
            Some(true) => {}
        }

        let mut changes = strong.subscribe();
        let refresh = tokio::spawn({
            let strong = strong.clone();
            async move { strong.refresh().await }
        });

        match refresh.await {
            Ok(Ok(true)) => continue,
            Ok(Ok(false)) => {
                // a reactive refresh is running; wait for it to publish
                drop(strong);
                if changes.changed().await.is_err() {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!("Proactive token refresh failed: {}", e);
                strong.logout().await;
                return;
            }
            Err(e) => {
                warn!("Proactive token refresh task failed: {}", e);
                strong.logout().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_config, FakeServer};

    fn authority(server: &Arc<FakeServer>) -> Arc<TokenAuthority> {
        TokenAuthority::new(test_config(), server.clone()).unwrap()
    }

    #[tokio::test]
    async fn test_login_publishes_authenticated_state() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        let mut states = authority.subscribe();

        let (user, credentials) = authority.login("reader@example.com", "secret").await.unwrap();

        assert_eq!(user.email, "reader@example.com");
        assert!(states.has_changed().unwrap());
        assert!(states.borrow_and_update().is_authenticated());
        assert_eq!(authority.access_token().as_deref(), Some(credentials.access_token()));
    }

    #[tokio::test]
    async fn test_login_rejects_wrong_password() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);

        let result = authority.login("reader@example.com", "wrong").await;

        assert!(matches!(result, Err(Error::InvalidCredentials(_))));
        assert!(!authority.is_authenticated());
    }

    #[tokio::test]
    async fn test_login_offline_is_network_error() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        server.set_reachable(false);
        let authority = authority(&server);

        let result = authority.login("reader@example.com", "secret").await;
        assert!(matches!(result, Err(Error::NetworkUnavailable(_))));
    }

    #[tokio::test]
    async fn test_register_then_duplicate() {
        let server = FakeServer::new();
        let authority = authority(&server);
        let request = RegisterRequest::new("new@example.com", "pw123456");

        let (user, _) = authority.register(&request).await.unwrap();
        assert_eq!(user.email, "new@example.com");
        assert!(authority.is_authenticated());

        let again = authority.register(&request).await;
        assert!(matches!(again, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_refresh_replaces_credentials() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        let (_, before) = authority.login("reader@example.com", "secret").await.unwrap();

        assert!(authority.refresh().await.unwrap());

        let after = authority.auth_state().credentials().cloned().unwrap();
        assert_ne!(after.access_token(), before.access_token());
        assert_ne!(after.refresh_token(), before.refresh_token());
        assert!(!authority.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_is_noop_while_in_flight() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.set_refresh_delay(Duration::from_millis(200));

        let leader = tokio::spawn({
            let authority = authority.clone();
            async move { authority.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(authority.is_refreshing());
        assert!(!authority.refresh().await.unwrap());
        assert!(leader.await.unwrap().unwrap());
        assert_eq!(server.count_calls("POST", "/auth/refresh-token"), 1);
    }

    #[tokio::test]
    async fn test_waiters_share_refresh_outcome() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.set_refresh_delay(Duration::from_millis(100));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let authority = authority.clone();
                tokio::spawn(async move { authority.refresh_or_wait().await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(server.count_calls("POST", "/auth/refresh-token"), 1);
        assert!(!authority.is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_ends_session_for_all_waiters() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.set_refresh_delay(Duration::from_millis(100));
        server.set_fail_refresh(true);

        let tasks: Vec<_> = (0..3)
            .map(|_| {
                let authority = authority.clone();
                tokio::spawn(async move { authority.refresh_or_wait().await })
            })
            .collect();

        for task in tasks {
            let result = task.await.unwrap();
            assert!(matches!(result, Err(Error::AuthenticationRequired(_))));
        }
        assert_eq!(server.count_calls("POST", "/auth/refresh-token"), 1);
        assert_eq!(authority.auth_state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_logout_clears_state_even_when_server_unreachable() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.set_reachable(false);

        authority.logout().await;

        assert!(!authority.is_authenticated());
        assert!(authority.access_token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_landing_after_logout_is_discarded() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.set_refresh_delay(Duration::from_millis(150));

        let refresh = tokio::spawn({
            let authority = authority.clone();
            async move { authority.refresh().await }
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        authority.logout().await;

        assert!(refresh.await.unwrap().is_err());
        assert_eq!(authority.auth_state(), AuthState::LoggedOut);
    }

    #[tokio::test]
    async fn test_proactive_refresh_fires_before_expiry() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        // expires in 301s with a 300s margin: due one second after login
        server.set_expires_in("301s");
        let authority = authority(&server);
        let (_, first) = authority.login("reader@example.com", "secret").await.unwrap();

        server.set_expires_in("1h");
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let current = authority.auth_state().credentials().cloned().unwrap();
        assert_ne!(current.access_token(), first.access_token());
        assert_eq!(server.count_calls("POST", "/auth/refresh-token"), 1);
    }

    #[tokio::test]
    async fn test_proactive_refresh_failure_forces_logout() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        server.set_expires_in("300s");
        server.set_fail_refresh(true);
        let authority = authority(&server);
        let mut states = authority.subscribe();
        authority.login("reader@example.com", "secret").await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                states.changed().await.unwrap();
                if !states.borrow_and_update().is_authenticated() {
                    break;
                }
            }
        })
        .await
        .unwrap();

        assert!(!authority.is_authenticated());
    }

    #[tokio::test]
    async fn test_current_user_refreshes_on_401() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let authority = authority(&server);
        authority.login("reader@example.com", "secret").await.unwrap();
        server.expire_access_tokens();

        let user = authority.current_user().await.unwrap().unwrap();

        assert_eq!(user.email, "reader@example.com");
        assert_eq!(server.count_calls("POST", "/auth/refresh-token"), 1);
    }

    #[tokio::test]
    async fn test_restore_session() {
        let server = FakeServer::with_user("reader@example.com", "secret");
        let seed = authority(&server);
        let (user, credentials) = seed.login("reader@example.com", "secret").await.unwrap();

        let restored = authority(&server);
        restored.restore_session(user, credentials);

        assert!(restored.is_authenticated());
        assert!(restored.current_user().await.unwrap().is_some());
    }
}
