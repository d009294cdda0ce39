//! Unit lifecycle.
//!
//! A [`Unit`] is a handle on one running instance of the sandbox image. Its
//! state only moves forward (`Created -> Running -> Terminated`). A monitor
//! thread blocks on an engine wait until the keep-alive process exits and then
//! moves the unit to `Terminated`, so liveness is never polled.
//!
//! A handle starts its monitor when it starts the unit, or when an attached
//! handle is first asked to observe liveness (`subscribe`, `wait_terminated`,
//! `terminate`). Dropping the handle cancels the wait.

mod exec;

use anyhow::{Context, Result, anyhow};
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::engine::{Engine, Signal, UnitSpec, UnitStatus, UnitWaiter, WaitOutcome};

/// How long `terminate` waits for the monitor to observe the exit.
const TERMINATE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Created,
    Running,
    Terminated { exit_code: Option<i64> },
}

impl UnitState {
    fn rank(&self) -> u8 {
        match self {
            UnitState::Created => 0,
            UnitState::Running => 1,
            UnitState::Terminated { .. } => 2,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, UnitState::Terminated { .. })
    }
}

impl From<UnitStatus> for UnitState {
    fn from(status: UnitStatus) -> Self {
        match status {
            UnitStatus::Created => UnitState::Created,
            UnitStatus::Running => UnitState::Running,
            UnitStatus::Exited(exit_code) => UnitState::Terminated { exit_code },
        }
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitState::Created => write!(f, "created"),
            UnitState::Running => write!(f, "running"),
            UnitState::Terminated {
                exit_code: Some(code),
            } => write!(f, "terminated ({code})"),
            UnitState::Terminated { exit_code: None } => write!(f, "terminated"),
        }
    }
}

/// A state transition, delivered to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitEvent {
    pub unit: String,
    pub from: UnitState,
    pub to: UnitState,
}

/// Returned when a command is attached to a unit that is not running.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unit '{unit}' is no longer alive ({state})")]
pub struct UnitTerminated {
    pub unit: String,
    pub state: UnitState,
}

/// State shared between a handle and its monitor thread.
struct Lifecycle {
    name: String,
    state: Mutex<UnitState>,
    changed: Condvar,
    subscribers: Mutex<Vec<Sender<UnitEvent>>>,
}

impl Lifecycle {
    fn new(name: &str, state: UnitState) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(state),
            changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    fn current(&self) -> UnitState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move forward to `to`. Backward or repeated transitions are ignored.
    fn advance(&self, to: UnitState) -> bool {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if to.rank() <= state.rank() {
                return false;
            }
            let from = *state;
            *state = to;
            from
        };
        self.changed.notify_all();

        info!(unit = %self.name, %from, %to, "unit:transition");
        let event = UnitEvent {
            unit: self.name.clone(),
            from,
            to,
        };
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        true
    }

    fn wait_terminated(&self, timeout: Duration) -> Option<UnitState> {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !state.is_terminated())
            .unwrap_or_else(|e| e.into_inner());
        guard.is_terminated().then_some(*guard)
    }
}

struct Monitor {
    waiter: Arc<dyn UnitWaiter>,
    thread: JoinHandle<()>,
}

/// Handle on one instance of the sandbox image.
pub struct Unit {
    engine: Arc<dyn Engine>,
    id: String,
    name: String,
    workdir: String,
    lifecycle: Arc<Lifecycle>,
    monitor: Mutex<Option<Monitor>>,
}

impl Unit {
    /// Create a unit from `spec` without starting it.
    pub fn create(engine: Arc<dyn Engine>, spec: &UnitSpec) -> Result<Self> {
        debug!(unit = %spec.name, image = %spec.image, "unit:create");
        let id = engine
            .create_unit(spec)
            .with_context(|| format!("Failed to create unit '{}'", spec.name))?;
        info!(unit = %spec.name, id = %id, "unit:created");

        Ok(Self {
            engine,
            id,
            name: spec.name.clone(),
            workdir: spec.workdir.clone(),
            lifecycle: Lifecycle::new(&spec.name, UnitState::Created),
            monitor: Mutex::new(None),
        })
    }

    /// Build a handle for a unit that already exists. `Ok(None)` if it doesn't.
    pub fn attach(engine: Arc<dyn Engine>, name_or_id: &str) -> Result<Option<Self>> {
        let Some(info) = engine.inspect_unit(name_or_id)? else {
            return Ok(None);
        };
        let state = UnitState::from(info.status);
        debug!(unit = %info.name, id = %info.id, %state, "unit:attach");

        let workdir = if info.workdir.is_empty() {
            "/".to_string()
        } else {
            info.workdir
        };
        Ok(Some(Self {
            engine,
            id: info.id,
            name: info.name.clone(),
            workdir,
            lifecycle: Lifecycle::new(&info.name, state),
            monitor: Mutex::new(None),
        }))
    }

    /// Start the keep-alive process and begin monitoring it.
    pub fn start(&self) -> Result<()> {
        match self.state() {
            UnitState::Created => {}
            UnitState::Running => return Ok(()),
            state @ UnitState::Terminated { .. } => {
                return Err(UnitTerminated {
                    unit: self.name.clone(),
                    state,
                }
                .into());
            }
        }

        self.engine
            .start_unit(&self.id)
            .with_context(|| format!("Failed to start unit '{}'", self.name))?;
        self.lifecycle.advance(UnitState::Running);
        self.watch()
    }

    /// Start the monitor if the unit is running and nobody watches it yet.
    fn watch(&self) -> Result<()> {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.is_some() || self.state() != UnitState::Running {
            return Ok(());
        }

        let waiter: Arc<dyn UnitWaiter> = self
            .engine
            .watch_unit(&self.id)
            .with_context(|| format!("Failed to watch unit '{}'", self.name))?
            .into();
        let lifecycle = Arc::clone(&self.lifecycle);
        let thread_waiter = Arc::clone(&waiter);
        let thread = thread::Builder::new()
            .name(format!("unit-monitor-{}", self.name))
            .spawn(move || {
                let exit_code = match thread_waiter.wait() {
                    Ok(WaitOutcome::Exited(code)) => code,
                    Ok(WaitOutcome::Cancelled) => {
                        debug!(unit = %lifecycle.name, "unit:monitor cancelled");
                        return;
                    }
                    Err(e) => {
                        warn!(unit = %lifecycle.name, error = %e, "unit:monitor wait failed");
                        None
                    }
                };
                debug!(unit = %lifecycle.name, ?exit_code, "unit:keep-alive exited");
                lifecycle.advance(UnitState::Terminated { exit_code });
            })
            .context("Failed to spawn unit monitor")?;
        *monitor = Some(Monitor { waiter, thread });
        Ok(())
    }

    /// Cancel the monitor's wait and join it.
    fn unwatch(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Monitor { waiter, thread }) = monitor {
            waiter.cancel();
            let _ = thread.join();
        }
    }

    fn watch_or_warn(&self) {
        if let Err(e) = self.watch() {
            warn!(unit = %self.name, error = %e, "unit:failed to start monitor");
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn state(&self) -> UnitState {
        self.lifecycle.current()
    }

    /// Alive exactly while the keep-alive process is.
    pub fn is_alive(&self) -> bool {
        self.state() == UnitState::Running
    }

    /// Receive every transition from now on.
    pub fn subscribe(&self) -> Receiver<UnitEvent> {
        let (tx, rx) = mpsc::channel();
        self.lifecycle
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        self.watch_or_warn();
        rx
    }

    /// Block until the unit is terminated or `timeout` elapses.
    pub fn wait_terminated(&self, timeout: Duration) -> Option<UnitState> {
        self.watch_or_warn();
        self.lifecycle.wait_terminated(timeout)
    }

    /// Signal the keep-alive process. Immediate: there is no drain period.
    ///
    /// A unit that was never started has no process to signal; it is removed
    /// from the engine instead so it cannot be started later.
    pub fn terminate(&self, signal: Signal) -> Result<UnitState> {
        match self.state() {
            state @ UnitState::Terminated { .. } => return Ok(state),
            UnitState::Created => {
                info!(unit = %self.name, "unit:terminate never-started unit");
                self.engine
                    .remove_unit(&self.id)
                    .with_context(|| format!("Failed to remove unit '{}'", self.name))?;
                self.lifecycle
                    .advance(UnitState::Terminated { exit_code: None });
                return Ok(self.state());
            }
            UnitState::Running => self.watch()?,
        }

        info!(unit = %self.name, signal = signal.as_str(), "unit:terminate");
        let started = Instant::now();
        self.engine
            .kill_unit(&self.id, signal)
            .with_context(|| format!("Failed to signal unit '{}'", self.name))?;

        if let Some(state) = self.wait_terminated(TERMINATE_WAIT) {
            debug!(unit = %self.name, elapsed_ms = started.elapsed().as_millis(), "unit:terminated");
            return Ok(state);
        }

        // The monitor may have lost its wait; ask the engine directly.
        match self.engine.inspect_unit(&self.id)? {
            Some(info) if matches!(info.status, UnitStatus::Exited(_)) => {
                self.lifecycle.advance(info.status.into());
                Ok(self.state())
            }
            None => {
                self.lifecycle
                    .advance(UnitState::Terminated { exit_code: None });
                Ok(self.state())
            }
            Some(_) => Err(anyhow!(
                "unit '{}' is still running after {}",
                self.name,
                signal.as_str()
            )),
        }
    }

    /// Terminate if needed and remove the unit from the engine.
    pub fn destroy(&self) -> Result<()> {
        if !self.state().is_terminated() {
            self.terminate(Signal::Kill)?;
        }
        self.engine
            .remove_unit(&self.id)
            .with_context(|| format!("Failed to remove unit '{}'", self.name))?;
        self.unwatch();
        info!(unit = %self.name, "unit:destroyed");
        Ok(())
    }

    fn ensure_running(&self) -> Result<(), UnitTerminated> {
        match self.state() {
            UnitState::Running => Ok(()),
            state => Err(UnitTerminated {
                unit: self.name.clone(),
                state,
            }),
        }
    }
}

/// Random lowercase hex, `bytes * 2` characters long.
pub fn random_hex(bytes: usize) -> Result<String> {
    let mut buf = vec![0u8; bytes];
    getrandom::fill(&mut buf).map_err(|e| anyhow!("Failed to gather randomness: {e}"))?;
    Ok(buf.iter().map(|b| format!("{b:02x}")).collect())
}

impl Drop for Unit {
    fn drop(&mut self) {
        self.unwatch();
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("workdir", &self.workdir)
            .field("state", &self.state())
            .finish()
    }
}
