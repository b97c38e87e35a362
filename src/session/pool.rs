//! Bounded cache of idle sessions.
//!
//! Only idle sessions are capped; [`SessionPool::take`] always creates a new
//! session when the cache is empty, so a burst of clients never waits on
//! the pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionDeps};
use crate::{AppError, Result};

#[derive(Default)]
struct PoolState {
    idle: VecDeque<Session>,
    busy: HashMap<u64, Session>,
    done: bool,
}

pub(crate) struct PoolInner {
    max_idle: usize,
    termination_timeout: Duration,
    deps: Arc<SessionDeps>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return a session after it served a connection.
    pub(crate) fn give(&self, session: Session) {
        let retire = {
            let mut state = self.state();
            if state.done {
                return;
            }
            state.busy.remove(&session.id());
            if state.idle.len() < self.max_idle {
                state.idle.push_back(session);
                None
            } else {
                Some(session)
            }
        };

        if let Some(session) = retire {
            debug!(session_id = session.id(), "idle cache full; retiring session");
            session.shutdown();
        }
    }
}

/// Pool of [`Session`] workers.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool caching at most `max_idle` idle sessions.
    ///
    /// [`shutdown`](Self::shutdown) waits at most `termination_timeout` for
    /// all sessions to stop.
    #[must_use]
    pub fn new(max_idle: usize, termination_timeout: Duration, deps: SessionDeps) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_idle,
                termination_timeout,
                deps: Arc::new(deps),
                state: Mutex::new(PoolState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Get an idle session, or start a new one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shutdown` once the pool is shut down.
    pub fn take(&self) -> Result<Session> {
        let mut state = self.inner.state();
        if state.done {
            return Err(AppError::Shutdown("session pool is shut down".into()));
        }

        let session = if let Some(session) = state.idle.pop_front() {
            session
        } else {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = id, "starting new session");
            Session::spawn(id, Arc::clone(&self.inner.deps), Arc::downgrade(&self.inner))
        };
        state.busy.insert(session.id(), session.clone());
        Ok(session)
    }

    /// Return `session` to the pool, or retire it if the idle cache is full.
    ///
    /// Sessions call this themselves after each connection.
    pub fn give(&self, session: Session) {
        self.inner.give(session);
    }

    /// Stop all sessions and wait for them to finish.
    ///
    /// Further [`take`](Self::take) calls fail.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Shutdown` if any session is still running after
    /// the termination timeout.
    pub async fn shutdown(&self) -> Result<()> {
        let sessions: Vec<Session> = {
            let mut state = self.inner.state();
            state.done = true;
            let busy = std::mem::take(&mut state.busy);
            state.idle.drain(..).chain(busy.into_values()).collect()
        };

        info!(sessions = sessions.len(), "shutting down session pool");
        for session in &sessions {
            session.shutdown();
        }

        let deadline = Instant::now() + self.inner.termination_timeout;
        let mut stragglers = Vec::new();
        for session in sessions {
            if tokio::time::timeout_at(deadline, session.join()).await.is_err() {
                warn!(session_id = session.id(), "session did not stop in time");
                stragglers.push(session.id());
            }
        }

        if stragglers.is_empty() {
            Ok(())
        } else {
            Err(AppError::Shutdown(format!(
                "{} session(s) still running after {} ms: {stragglers:?}",
                stragglers.len(),
                self.inner.termination_timeout.as_millis()
            )))
        }
    }

    /// Number of cached idle sessions.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.state().idle.len()
    }

    /// Number of sessions currently serving a connection.
    #[must_use]
    pub fn busy_count(&self) -> usize {
        self.inner.state().busy.len()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.state().done
    }
}
