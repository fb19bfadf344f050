//! # Client Sessions
//!
//! Per-client context passed into each operation instead of ambient shared
//! state: the history refresh limiter, optimistic local rows, the last server
//! rows fetched for history and one cancellation token per job being waited on.
//!
//! Sessions are keyed by the `X-Session-Id` request header and kept in a
//! [`SessionRegistry`]. Requests without the header get an ephemeral session.

use super::error::JobResult;
use super::history::{merge, HistoryEntry, RefreshLimiter};
use super::model::TranscriptionJob;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const SESSION_HEADER: &str = "X-Session-Id";

const MAX_SESSION_ID_LEN: usize = 128;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActivePoll {
    generation: u64,
    token: CancellationToken,
}

pub struct ClientSession {
    id: Option<String>,
    refresh_interval_ms: Arc<AtomicU64>,
    limiter: Mutex<RefreshLimiter>,
    pending: Mutex<HashMap<String, TranscriptionJob>>,
    last_server: Mutex<Vec<TranscriptionJob>>,
    polls: Mutex<HashMap<String, ActivePoll>>,
    generation: AtomicU64,
    last_seen: Mutex<Instant>,
}

impl ClientSession {
    fn new(id: Option<String>, refresh_interval_ms: Arc<AtomicU64>) -> Self {
        Self {
            id,
            refresh_interval_ms,
            limiter: Mutex::new(RefreshLimiter::new()),
            pending: Mutex::new(HashMap::new()),
            last_server: Mutex::new(Vec::new()),
            polls: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    /// `None` for ephemeral sessions.
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*lock(&self.last_seen))
    }

    /// Remember a row created by this client before the server confirms it.
    pub fn record_pending(&self, job: TranscriptionJob) {
        lock(&self.pending).insert(job.id.clone(), job);
    }

    pub fn forget(&self, id: &str) {
        lock(&self.pending).remove(id);
        lock(&self.last_server).retain(|job| job.id != id);
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Merged history. The server is asked at most once per refresh
    /// interval; in between, the last server rows are merged again with the
    /// current pending rows, so a fresh submission shows up immediately.
    pub async fn history<F>(&self, fetch: F) -> JobResult<Vec<HistoryEntry>>
    where
        F: Future<Output = JobResult<Vec<TranscriptionJob>>>,
    {
        let min_interval = Duration::from_millis(self.refresh_interval_ms.load(Ordering::Relaxed));
        let server = if lock(&self.limiter).try_acquire(Instant::now(), min_interval) {
            let server = fetch.await?;
            *lock(&self.last_server) = server.clone();
            server
        } else {
            lock(&self.last_server).clone()
        };

        let local: Vec<TranscriptionJob> = {
            let mut pending = lock(&self.pending);
            for job in &server {
                pending.remove(&job.id);
            }
            pending.values().cloned().collect()
        };

        Ok(merge(server, local))
    }

    /// Register a wait on `job_id`, cancelling any earlier wait on the same
    /// job in this session.
    pub fn begin_poll(self: &Arc<Self>, job_id: &str) -> PollGuard {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        let previous = lock(&self.polls).insert(
            job_id.to_string(),
            ActivePoll {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(job_id, "Superseding earlier wait");
            previous.token.cancel();
        }

        PollGuard {
            session: Arc::clone(self),
            job_id: job_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancel the wait on `job_id`. Returns whether one was active.
    pub fn abandon_poll(&self, job_id: &str) -> bool {
        match lock(&self.polls).remove(job_id) {
            Some(poll) => {
                poll.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_polls(&self) -> usize {
        lock(&self.polls).len()
    }

    fn finish_poll(&self, job_id: &str, generation: u64) {
        let mut polls = lock(&self.polls);
        if polls.get(job_id).map_or(false, |poll| poll.generation == generation) {
            polls.remove(job_id);
        }
    }
}

/// Active wait registration; unregisters itself when dropped.
pub struct PollGuard {
    session: Arc<ClientSession>,
    job_id: String,
    generation: u64,
    token: CancellationToken,
}

impl PollGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for PollGuard {
    fn drop(&mut self) {
        self.session.finish_poll(&self.job_id, self.generation);
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    refresh_interval_ms: Arc<AtomicU64>,
    idle_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(refresh_interval: Duration, idle_ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            refresh_interval_ms: Arc::new(AtomicU64::new(refresh_interval.as_millis() as u64)),
            idle_ttl,
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.load(Ordering::Relaxed))
    }

    /// Applies to every session, existing ones included.
    pub fn set_refresh_interval(&self, interval: Duration) {
        self.refresh_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// Session for a header value; malformed or missing ids get an
    /// ephemeral session.
    pub fn resolve(&self, session_id: Option<&str>) -> Arc<ClientSession> {
        match session_id.map(str::trim).filter(|id| is_valid_session_id(id)) {
            Some(id) => self.get_or_create(id),
            None => self.ephemeral(),
        }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<ClientSession> {
        let now = Instant::now();
        let mut sessions = lock(&self.sessions);
        sessions.retain(|id, session| {
            id == session_id || session.active_polls() > 0 || session.idle_for(now) < self.idle_ttl
        });

        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(ClientSession::new(Some(session_id.to_string()), self.refresh_interval_ms.clone())))
            .clone();
        session.touch();
        session
    }

    pub fn ephemeral(&self) -> Arc<ClientSession> {
        Arc::new(ClientSession::new(None, self.refresh_interval_ms.clone()))
    }

    pub fn len(&self) -> usize {
        lock(&self.sessions).len()
    }
}

fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
