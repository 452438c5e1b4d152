use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use super::engine::{EngineLink, TransportEngine, TransportError};
use crate::net::NetworkError;

thread_local! {
    static LAST_PANIC_LOCATION: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chains onto the current panic hook so the location of a panic is still
/// known after `catch_unwind` has swallowed it.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let location = info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()));
            LAST_PANIC_LOCATION.with(|slot| *slot.borrow_mut() = location);
            previous(info);
        }));
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPhase {
    Startup,
    Running,
    Shutdown,
}

impl fmt::Display for CrashPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashPhase::Startup => write!(f, "startup"),
            CrashPhase::Running => write!(f, "running"),
            CrashPhase::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Diagnostics captured on the transport thread when its engine fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashInfo {
    pub message: String,
    pub location: Option<String>,
    pub phase: CrashPhase,
}

impl CrashInfo {
    fn from_error(error: &TransportError, phase: CrashPhase) -> Self {
        Self {
            message: error.to_string(),
            location: None,
            phase,
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>, phase: CrashPhase) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_owned()
        };
        Self {
            message,
            location: LAST_PANIC_LOCATION.with(|slot| slot.borrow_mut().take()),
            phase,
        }
    }

    pub fn pretty(&self) -> String {
        match &self.location {
            Some(location) => format!("{} ({} phase, at {})", self.message, self.phase, location),
            None => format!("{} ({} phase)", self.message, self.phase),
        }
    }
}

#[derive(Debug, Default)]
struct Gate {
    ready: bool,
    crash: Option<CrashInfo>,
}

#[derive(Debug, Default)]
struct Shared {
    gate: Mutex<Gate>,
    changed: Condvar,
    shutdown_requested: AtomicBool,
    clean_shutdown: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_ready(&self) {
        self.lock().ready = true;
        self.changed.notify_all();
    }

    fn record_crash(&self, crash: CrashInfo) {
        self.lock().crash = Some(crash);
        self.changed.notify_all();
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }
}

/// A protocol engine running on its own named thread.
///
/// The owner polls `is_alive` and `crash_info` from its tick; nothing here
/// interrupts the main thread. Dropping the handle requests shutdown and joins.
#[derive(Debug)]
pub struct TransportThread {
    name: String,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl TransportThread {
    /// Spawns the engine and blocks until it reports ready, fails, or
    /// `timeout` elapses. Only a ready thread is returned.
    pub fn spawn_and_wait(
        name: impl Into<String>,
        engine: Box<dyn TransportEngine>,
        link: EngineLink,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        install_panic_hook();

        let name = name.into();
        let shared = Arc::new(Shared::default());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&shared, engine, link)
            })
            .map_err(|e| NetworkError::StartupFailure(format!("failed to spawn {name}: {e}")))?;

        let mut transport = Self {
            name,
            shared,
            handle: Some(handle),
        };

        let (ready, crash) = {
            let gate = transport.shared.lock();
            let (gate, _) = transport
                .shared
                .changed
                .wait_timeout_while(gate, timeout, |g| !g.ready && g.crash.is_none())
                .unwrap_or_else(PoisonError::into_inner);
            (gate.ready, gate.crash.clone())
        };

        if let Some(crash) = crash {
            // Dropping `transport` joins the finished thread.
            return Err(NetworkError::StartupFailure(format!(
                "{} failed to start: {}",
                transport.name,
                crash.pretty()
            )));
        }

        if !ready {
            transport.request_shutdown();
            // A hung engine cannot be joined; leave it detached.
            transport.handle.take();
            return Err(NetworkError::StartupFailure(format!(
                "{} did not start within {:?}",
                transport.name, timeout
            )));
        }

        Ok(transport)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn request_shutdown(&self) {
        self.shared.shutdown_requested.store(true, Ordering::Release);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested()
    }

    pub fn clean_shutdown(&self) -> bool {
        self.shared.clean_shutdown.load(Ordering::Acquire)
    }

    pub fn crash_info(&self) -> Option<CrashInfo> {
        self.shared.lock().crash.clone()
    }
}

impl Drop for TransportThread {
    fn drop(&mut self) {
        self.request_shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Transport thread {} panicked outside its engine", self.name);
            }
        }
    }
}

fn run(shared: &Shared, mut engine: Box<dyn TransportEngine>, link: EngineLink) {
    let phase = Cell::new(CrashPhase::Startup);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        drive(shared, engine.as_mut(), link, &phase)
    }));

    let crash = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(crash)) => Some(crash),
        Err(payload) => Some(CrashInfo::from_panic(payload, phase.get())),
    };

    match crash {
        Some(crash) => shared.record_crash(crash),
        None => {
            shared.clean_shutdown.store(true, Ordering::Release);
            debug!("Transport thread stopped cleanly");
        }
    }
}

fn drive(
    shared: &Shared,
    engine: &mut dyn TransportEngine,
    link: EngineLink,
    phase: &Cell<CrashPhase>,
) -> Result<(), CrashInfo> {
    engine
        .start(link)
        .map_err(|e| CrashInfo::from_error(&e, CrashPhase::Startup))?;
    shared.mark_ready();
    phase.set(CrashPhase::Running);

    while !shared.shutdown_requested() {
        if let Err(e) = engine.tick() {
            // Channels close under us while the owner tears down.
            if shared.shutdown_requested() {
                break;
            }
            phase.set(CrashPhase::Shutdown);
            engine.shutdown();
            return Err(CrashInfo::from_error(&e, CrashPhase::Running));
        }
    }

    phase.set(CrashPhase::Shutdown);
    engine.shutdown();
    Ok(())
}
