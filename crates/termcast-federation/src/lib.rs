//! Federation (§4.H, optional): an HQ aggregates sessions hosted by any
//! number of Remotes, proxying session-scoped requests to the owning
//! Remote by its stored bearer token. A Remote, symmetrically, registers
//! itself with an HQ on startup and retries with backoff until it
//! succeeds.

mod backoff;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use termcast_types::{CoreError, Kind, SessionSummary};
use tracing::{info, warn};

pub use backoff::Backoff;

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const UNHEALTHY_THRESHOLD: u8 = 3;

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("remote {0} is not registered")]
    UnknownRemote(String),
    #[error("remote {0} is unhealthy")]
    RemoteUnavailable(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl From<FederationError> for CoreError {
    fn from(e: FederationError) -> Self {
        let kind = match &e {
            FederationError::UnknownRemote(_) => Kind::NotFound,
            FederationError::RemoteUnavailable(_) => Kind::RemoteUnavailable,
            FederationError::Http(_) => Kind::Internal,
        };
        CoreError::new(kind, e.to_string())
    }
}

/// What a Remote POSTs to an HQ's `/api/remotes/register` (§4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDescriptor {
    pub id: String,
    pub name: String,
    pub public_url: String,
    pub bearer_token: String,
}

struct RemoteState {
    descriptor: RemoteDescriptor,
    healthy: AtomicBool,
    consecutive_failures: AtomicU8,
    session_count: AtomicUsize,
    registered_at: DateTime<Utc>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

/// `GET /api/remotes`'s element shape (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteStatus {
    pub id: String,
    pub name: String,
    pub url: String,
    pub healthy: bool,
    pub session_count: usize,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// The HQ-side registry of Remotes: liveness tracking plus request
/// proxying. Hidden sessions on unhealthy remotes reappear automatically
/// once health checks recover (§4.H "Failure model").
#[derive(Clone)]
pub struct HqRegistry {
    client: reqwest::Client,
    remotes: Arc<DashMap<String, Arc<RemoteState>>>,
    /// Caches which remote last reported owning a given session id, so a
    /// session-scoped route doesn't have to re-list every remote's
    /// sessions just to find where to proxy a single request.
    session_owners: Arc<DashMap<String, String>>,
}

impl HqRegistry {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            remotes: Arc::new(DashMap::new()),
            session_owners: Arc::new(DashMap::new()),
        }
    }

    /// Looks up which remote a session id was last seen owned by, per
    /// [`Self::list_remote_sessions`] or a prior [`Self::remember_session`].
    pub fn locate_session(&self, session_id: &str) -> Option<String> {
        self.session_owners.get(session_id).map(|e| e.value().clone())
    }

    /// Records that `session_id` is owned by `remote_id`, e.g. right
    /// after proxying a session creation there.
    pub fn remember_session(&self, session_id: String, remote_id: String) {
        self.session_owners.insert(session_id, remote_id);
    }

    /// Registers (or re-registers) a Remote and starts its health-check
    /// loop if this is the first time we've seen it.
    pub fn register(&self, descriptor: RemoteDescriptor) {
        let id = descriptor.id.clone();
        let is_new = !self.remotes.contains_key(&id);
        self.remotes.insert(
            id.clone(),
            Arc::new(RemoteState {
                descriptor,
                healthy: AtomicBool::new(true),
                consecutive_failures: AtomicU8::new(0),
                session_count: AtomicUsize::new(0),
                registered_at: Utc::now(),
                last_heartbeat: Mutex::new(None),
            }),
        );
        if is_new {
            self.spawn_health_loop(id);
        }
    }

    fn spawn_health_loop(&self, remote_id: String) {
        let client = self.client.clone();
        let remotes = self.remotes.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(HEALTH_CHECK_INTERVAL).await;
                let Some(state) = remotes.get(&remote_id).map(|e| e.value().clone()) else {
                    return;
                };
                let url = format!("{}/api/health", state.descriptor.public_url);
                let ok = client
                    .get(&url)
                    .timeout(HEALTH_TIMEOUT)
                    .send()
                    .await
                    .map(|r| r.status().is_success())
                    .unwrap_or(false);

                if ok {
                    let was_unhealthy = !state.healthy.swap(true, Ordering::SeqCst);
                    state.consecutive_failures.store(0, Ordering::SeqCst);
                    *state.last_heartbeat.lock() = Some(Utc::now());
                    if was_unhealthy {
                        info!(remote = %remote_id, "remote recovered");
                    }
                } else {
                    let failures = state.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures >= UNHEALTHY_THRESHOLD && state.healthy.swap(false, Ordering::SeqCst)
                    {
                        warn!(remote = %remote_id, failures, "remote marked unhealthy");
                    }
                }
            }
        });
    }

    pub fn is_healthy(&self, remote_id: &str) -> bool {
        self.remotes
            .get(remote_id)
            .map(|s| s.healthy.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// `GET /api/sessions`'s remote half: the union of all healthy
    /// remotes' sessions, each tagged with `remoteId` (§4.H).
    pub async fn list_remote_sessions(&self) -> Vec<SessionSummary> {
        let healthy: Vec<Arc<RemoteState>> = self
            .remotes
            .iter()
            .filter(|e| e.healthy.load(Ordering::SeqCst))
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for state in healthy {
            match self.fetch_sessions(&state).await {
                Ok(mut sessions) => {
                    for s in &mut sessions {
                        s.remote_id = Some(state.descriptor.id.clone());
                        self.remember_session(s.id.clone(), state.descriptor.id.clone());
                    }
                    state.session_count.store(sessions.len(), Ordering::SeqCst);
                    out.extend(sessions);
                }
                Err(e) => warn!(remote = %state.descriptor.id, error = %e, "failed to list remote sessions"),
            }
        }
        out
    }

    /// `GET /api/remotes` (§6): a snapshot of every registered remote's
    /// liveness, independent of whether any sessions were just listed.
    pub fn list_remotes(&self) -> Vec<RemoteStatus> {
        self.remotes
            .iter()
            .map(|e| {
                let s = e.value();
                RemoteStatus {
                    id: s.descriptor.id.clone(),
                    name: s.descriptor.name.clone(),
                    url: s.descriptor.public_url.clone(),
                    healthy: s.healthy.load(Ordering::SeqCst),
                    session_count: s.session_count.load(Ordering::SeqCst),
                    registered_at: s.registered_at,
                    last_heartbeat: *s.last_heartbeat.lock(),
                }
            })
            .collect()
    }

    async fn fetch_sessions(&self, state: &RemoteState) -> Result<Vec<SessionSummary>, FederationError> {
        let url = format!("{}/api/sessions", state.descriptor.public_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&state.descriptor.bearer_token)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Forwards a session-scoped request to the owning remote, attaching
    /// its stored bearer token. Returns `RemoteUnavailable` if the remote
    /// is known but currently unhealthy, `UnknownRemote` if it was never
    /// registered.
    pub async fn proxy_request(
        &self,
        remote_id: &str,
        method: reqwest::Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, FederationError> {
        let state = self
            .remotes
            .get(remote_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| FederationError::UnknownRemote(remote_id.to_string()))?;
        if !state.healthy.load(Ordering::SeqCst) {
            return Err(FederationError::RemoteUnavailable(remote_id.to_string()));
        }

        let url = format!("{}{}", state.descriptor.public_url, path);
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&state.descriptor.bearer_token);
        if let Some(body) = body {
            req = req.header("content-type", "application/json").body(body);
        }
        Ok(req.send().await?)
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }
}

impl Default for HqRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The Remote-side half: registers with an HQ on startup, retrying with
/// exponential backoff (§5: "starting at 2s") until the HQ accepts it.
pub async fn register_with_hq(
    client: &reqwest::Client,
    hq_url: &str,
    descriptor: &RemoteDescriptor,
) -> Result<(), FederationError> {
    let mut backoff = Backoff::new();
    loop {
        let url = format!("{hq_url}/api/remotes/register");
        match client.post(&url).json(descriptor).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(hq = %hq_url, "registered with hq");
                return Ok(());
            }
            Ok(resp) => {
                warn!(status = %resp.status(), "hq rejected registration, retrying");
            }
            Err(e) => {
                warn!(error = %e, "failed to reach hq, retrying");
            }
        }
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_remote_starts_healthy() {
        let hq = HqRegistry::new();
        hq.register(RemoteDescriptor {
            id: "r1".into(),
            name: "remote-one".into(),
            public_url: "http://127.0.0.1:9".into(),
            bearer_token: "secret".into(),
        });
        assert!(hq.is_healthy("r1"));
    }

    #[test]
    fn unknown_remote_is_unhealthy() {
        let hq = HqRegistry::new();
        assert!(!hq.is_healthy("ghost"));
    }

    #[tokio::test]
    async fn proxy_request_to_unregistered_remote_fails() {
        let hq = HqRegistry::new();
        let err = hq
            .proxy_request("ghost", reqwest::Method::GET, "/api/sessions", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::UnknownRemote(_)));
    }

    #[test]
    fn remembered_sessions_are_located_by_id() {
        let hq = HqRegistry::new();
        assert_eq!(hq.locate_session("sess_1"), None);
        hq.remember_session("sess_1".into(), "r1".into());
        assert_eq!(hq.locate_session("sess_1"), Some("r1".into()));
    }
}
