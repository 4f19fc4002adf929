use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, trace, warn};

use crate::config::SyncSettings;
use crate::error::SyncError;
use crate::record::{Checkpoint, LogsPage};
use crate::session::{Resource, SessionContext, SessionSnapshot, StatusTransition};
use crate::source::TelemetrySource;

struct StopHandle {
    _stop: Sender<()>,
}

#[derive(Default)]
struct InFlight {
    logs: AtomicBool,
    checkpoints: AtomicBool,
}

impl InFlight {
    fn flag(&self, resource: Resource) -> &AtomicBool {
        match resource {
            Resource::Logs => &self.logs,
            Resource::Checkpoints => &self.checkpoints,
        }
    }
}

struct InFlightGuard {
    flights: Arc<InFlight>,
    resource: Resource,
}

impl InFlightGuard {
    fn begin(flights: Arc<InFlight>, resource: Resource) -> Option<Self> {
        flights
            .flag(resource)
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { flights, resource })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flights.flag(self.resource).store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct SupervisorState {
    generation: u64,
    context: Option<SessionContext>,
    in_flight: Arc<InFlight>,
    pollers: Vec<StopHandle>,
    grace: Option<StopHandle>,
    revision_base: u64,
}

impl SupervisorState {
    fn revision(&self) -> u64 {
        self.context
            .as_ref()
            .map_or(self.revision_base, SessionContext::revision)
    }

    fn current_mut(&mut self, generation: u64, session_id: &str) -> Option<&mut SessionContext> {
        if self.generation != generation {
            return None;
        }
        self.context
            .as_mut()
            .filter(|context| context.session_id() == session_id)
    }
}

struct Inner<S> {
    this: Weak<Inner<S>>,
    source: S,
    settings: SyncSettings,
    state: Mutex<SupervisorState>,
}

pub struct SessionSupervisor<S: TelemetrySource + 'static> {
    inner: Arc<Inner<S>>,
}

impl<S: TelemetrySource + 'static> SessionSupervisor<S> {
    pub fn new(source: S, settings: SyncSettings) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            source,
            settings,
            state: Mutex::new(SupervisorState::default()),
        });
        Self { inner }
    }

    pub fn supervise(&self, session_id: Option<&str>) {
        let session_id = session_id.map(str::trim).filter(|id| !id.is_empty());
        let mut state = self.inner.lock();
        let current = state.context.as_ref().map(SessionContext::session_id);
        if current == session_id {
            return;
        }

        state.generation += 1;
        state.pollers.clear();
        state.grace = None;
        state.in_flight = Arc::new(InFlight::default());
        state.revision_base = state.revision() + 1;
        let generation = state.generation;

        let Some(session_id) = session_id else {
            state.context = None;
            info!("no session supervised");
            return;
        };

        state.context = Some(SessionContext::with_revision(
            session_id,
            self.inner.settings.ghost_retention,
            state.revision_base,
        ));
        for resource in [Resource::Logs, Resource::Checkpoints] {
            match self.inner.spawn_poller(resource, generation) {
                Ok(handle) => state.pollers.push(handle),
                Err(err) => warn!(error = %err, ?resource, "failed to start poller thread"),
            }
        }
        info!(
            session_id,
            interval_ms = self.inner.settings.poll_interval.as_millis() as u64,
            "supervising session"
        );
    }

    pub fn refresh(&self) {
        let generation = self.inner.lock().generation;
        for resource in [Resource::Logs, Resource::Checkpoints] {
            let _ = self.inner.poll(resource, generation);
        }
    }

    pub fn clear_ghosts(&self) -> usize {
        self.inner
            .lock()
            .context
            .as_mut()
            .map_or(0, SessionContext::clear_ghosts)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock();
        match state.context.as_ref() {
            Some(context) => context.snapshot(),
            None => SessionSnapshot::unsupervised(state.revision_base),
        }
    }

    pub fn snapshot_if_changed(&self, since: Option<u64>) -> Option<SessionSnapshot> {
        let state = self.inner.lock();
        if since == Some(state.revision()) {
            return None;
        }
        Some(match state.context.as_ref() {
            Some(context) => context.snapshot(),
            None => SessionSnapshot::unsupervised(state.revision_base),
        })
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision()
    }

    pub fn is_polling(&self) -> bool {
        !self.inner.lock().pollers.is_empty()
    }

    pub fn supervised_session(&self) -> Option<String> {
        self.inner
            .lock()
            .context
            .as_ref()
            .map(|context| context.session_id().to_string())
    }

    pub fn source(&self) -> &S {
        &self.inner.source
    }
}

impl<S: TelemetrySource + 'static> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_poller(&self, resource: Resource, generation: u64) -> std::io::Result<StopHandle> {
        let weak = self.this.clone();
        let name = match resource {
            Resource::Logs => "logs-poller",
            Resource::Checkpoints => "checkpoints-poller",
        };
        spawn_ticker(name, self.settings.poll_interval, move || {
            let Some(inner) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            inner.poll(resource, generation)
        })
    }

    // Breaks once `generation` is superseded.
    fn poll(&self, resource: Resource, generation: u64) -> ControlFlow<()> {
        let (session_id, cursor, flights) = {
            let state = self.lock();
            if state.generation != generation {
                return ControlFlow::Break(());
            }
            let Some(context) = state.context.as_ref() else {
                return ControlFlow::Break(());
            };
            (
                context.session_id().to_string(),
                context.cursor().to_string(),
                Arc::clone(&state.in_flight),
            )
        };

        let Some(_guard) = InFlightGuard::begin(flights, resource) else {
            trace!(%session_id, ?resource, "previous request still in flight; skipping tick");
            return ControlFlow::Continue(());
        };

        match resource {
            Resource::Logs => {
                let result = self.source.fetch_logs(&session_id, &cursor);
                self.apply_logs(generation, &session_id, result);
            }
            Resource::Checkpoints => {
                let result = self.source.fetch_checkpoints(&session_id);
                self.apply_checkpoints(generation, &session_id, result);
            }
        }
        ControlFlow::Continue(())
    }

    fn apply_logs(&self, generation: u64, session_id: &str, result: Result<LogsPage, SyncError>) {
        let mut state = self.lock();
        let Some(context) = state.current_mut(generation, session_id) else {
            debug!(session_id, "discarding stale logs response");
            return;
        };

        match result {
            Ok(page) => {
                let applied = context.apply_logs(page, Utc::now());
                if let Some(transition) = applied.status {
                    self.on_status_transition(&mut state, generation, transition);
                }
            }
            Err(err) => {
                if context.record_error(Resource::Logs, &err) {
                    warn!(session_id, error = %err.display_chain(), "logs poll failed");
                } else {
                    debug!(session_id, error = %err, "logs poll still failing");
                }
            }
        }
    }

    fn apply_checkpoints(
        &self,
        generation: u64,
        session_id: &str,
        result: Result<Vec<Checkpoint>, SyncError>,
    ) {
        let mut state = self.lock();
        let Some(context) = state.current_mut(generation, session_id) else {
            debug!(session_id, "discarding stale checkpoints response");
            return;
        };

        match result {
            Ok(checkpoints) => {
                if context.apply_checkpoints(checkpoints) {
                    debug!(
                        session_id,
                        pending = ?context.checkpoint().map(|checkpoint| checkpoint.id.as_str()),
                        "pending checkpoint changed"
                    );
                }
            }
            Err(err) => {
                if context.record_error(Resource::Checkpoints, &err) {
                    warn!(session_id, error = %err.display_chain(), "checkpoints poll failed");
                } else {
                    debug!(session_id, error = %err, "checkpoints poll still failing");
                }
            }
        }
    }

    fn on_status_transition(
        &self,
        state: &mut SupervisorState,
        generation: u64,
        transition: StatusTransition,
    ) {
        if !transition.finished() {
            if state.grace.take().is_some() {
                info!(status = ?transition.current, "session resumed; grace timer cancelled");
            }
            return;
        }
        if state.grace.is_some() || state.pollers.is_empty() {
            return;
        }

        let weak = self.this.clone();
        let grace_period = self.settings.grace_period;
        match spawn_oneshot("grace-timer", grace_period, move || {
            if let Some(inner) = weak.upgrade() {
                inner.expire(generation);
            }
        }) {
            Ok(handle) => {
                state.grace = Some(handle);
                info!(
                    status = ?transition.current,
                    grace_ms = grace_period.as_millis() as u64,
                    "session finished; polling stops after grace period"
                );
            }
            Err(err) => warn!(error = %err, "failed to start grace timer"),
        }
    }

    fn expire(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        state.pollers.clear();
        state.grace = None;
        info!(
            session_id = state.context.as_ref().map(SessionContext::session_id),
            "pollers stopped"
        );
    }
}

fn spawn_ticker<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<StopHandle>
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    let (stop, stopped) = mpsc::channel::<()>();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        let mut deadline = Instant::now();
        loop {
            if tick().is_break() {
                break;
            }
            deadline += interval;
            let now = Instant::now();
            if deadline < now {
                deadline = now;
            }
            match stopped.recv_timeout(deadline - now) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })?;
    Ok(StopHandle { _stop: stop })
}

fn spawn_oneshot<F>(name: &str, delay: Duration, fire: F) -> std::io::Result<StopHandle>
where
    F: FnOnce() + Send + 'static,
{
    let (stop, stopped) = mpsc::channel::<()>();
    thread::Builder::new().name(name.to_string()).spawn(move || {
        if let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(delay) {
            fire();
        }
    })?;
    Ok(StopHandle { _stop: stop })
}
