//! Per-prompt event routing.
//!
//! [`JobRouter`] maps a server-assigned `prompt_id` to the channel of
//! whoever is waiting on that prompt. The backend may emit a prompt's
//! first events before the `/prompt` response carrying its id reaches
//! us, so events for unknown ids are kept in a bounded backlog and
//! replayed when the id is registered.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::events::JobEvent;

/// Default number of unclaimed events kept for late registration.
pub const DEFAULT_BACKLOG_CAPACITY: usize = 256;

/// Routes prompt-scoped events to their registered subscriber.
pub struct JobRouter {
    inner: Mutex<RouterState>,
    backlog_capacity: usize,
}

struct RouterState {
    routes: HashMap<String, mpsc::UnboundedSender<JobEvent>>,
    backlog: VecDeque<(String, JobEvent)>,
}

impl Default for JobRouter {
    fn default() -> Self {
        Self::with_backlog_capacity(DEFAULT_BACKLOG_CAPACITY)
    }
}

impl JobRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backlog_capacity(backlog_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RouterState {
                routes: HashMap::new(),
                backlog: VecDeque::new(),
            }),
            backlog_capacity,
        }
    }

    /// Start receiving events for `prompt_id`.
    ///
    /// Backlogged events for the id are delivered first, in arrival
    /// order. The route lives until the returned subscription is dropped.
    pub fn register(self: &Arc<Self>, prompt_id: &str) -> JobSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let mut replayed = 0usize;
        let mut kept = VecDeque::with_capacity(state.backlog.len());
        for (id, event) in state.backlog.drain(..) {
            if id == prompt_id {
                // The receiver is alive in this scope.
                let _ = tx.send(event);
                replayed += 1;
            } else {
                kept.push_back((id, event));
            }
        }
        state.backlog = kept;

        if state.routes.insert(prompt_id.to_string(), tx).is_some() {
            tracing::warn!(prompt_id, "Replaced existing route for prompt");
        }
        drop(state);

        tracing::debug!(prompt_id, replayed, "Registered prompt route");

        JobSubscription {
            prompt_id: prompt_id.to_string(),
            router: Arc::clone(self),
            rx,
        }
    }

    /// Deliver `event` to the subscriber of `prompt_id`.
    ///
    /// Returns `true` when a live subscriber received it; otherwise the
    /// event is backlogged, evicting the oldest entry when full.
    pub fn dispatch(&self, prompt_id: &str, event: JobEvent) -> bool {
        let mut state = self.lock();

        if let Some(tx) = state.routes.get(prompt_id) {
            match tx.send(event) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(event)) => {
                    state.routes.remove(prompt_id);
                    tracing::debug!(prompt_id, ?event, "Dropping event for closed route");
                    return false;
                }
            }
        }

        if self.backlog_capacity == 0 {
            return false;
        }
        if state.backlog.len() >= self.backlog_capacity {
            state.backlog.pop_front();
        }
        state.backlog.push_back((prompt_id.to_string(), event));
        false
    }

    /// Number of prompts currently awaiting events.
    pub fn active_routes(&self) -> usize {
        self.lock().routes.len()
    }

    /// Number of events waiting for a registration.
    pub fn backlog_len(&self) -> usize {
        self.lock().backlog.len()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of one prompt's route.
///
/// Dropping the subscription deregisters the route, so a job that
/// finishes, fails or times out never receives a second delivery.
pub struct JobSubscription {
    prompt_id: String,
    router: Arc<JobRouter>,
    rx: mpsc::UnboundedReceiver<JobEvent>,
}

impl JobSubscription {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Next event for this prompt, or `None` if the route was replaced.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.rx.close();
        let mut state = self.router.lock();
        // Leave a newer registration for the same id alone.
        if state
            .routes
            .get(&self.prompt_id)
            .is_some_and(|tx| tx.is_closed())
        {
            state.routes.remove(&self.prompt_id);
            tracing::debug!(prompt_id = %self.prompt_id, "Unregistered prompt route");
        }
    }
}
