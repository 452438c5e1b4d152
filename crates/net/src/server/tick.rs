use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};

use super::error::ServerError;
use super::stats::TickStats;
use crate::net::{Network, NetworkInterface};

pub const DEFAULT_TICK_RATE: u32 = 20;

#[derive(Debug, Clone)]
pub struct TickConfig {
    pub tick_rate: u32,
    /// How far the loop may fall behind before it stops trying to catch up
    /// and reschedules from now.
    pub max_catch_up_ticks: u32,
    pub shutdown_reason: String,
}

impl Default for TickConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            max_catch_up_ticks: DEFAULT_TICK_RATE,
            shutdown_reason: "Server closed".to_owned(),
        }
    }
}

impl TickConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Crashed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerState::Starting => "starting",
            ServerState::Running => "running",
            ServerState::ShuttingDown => "shutting down",
            ServerState::Stopped => "stopped",
            ServerState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Anything else that advances once per server tick.
pub trait TickSubsystem {
    fn name(&self) -> &str;

    fn tick(&mut self, tick: u64, network: &mut Network) -> Result<(), ServerError>;
}

/// Fixed-rate loop driving the network and the registered subsystems.
pub struct Server {
    config: TickConfig,
    network: Network,
    subsystems: Vec<Box<dyn TickSubsystem>>,
    state: ServerState,
    tick_counter: u64,
    stats: TickStats,
    running: Arc<AtomicBool>,
    has_stopped: bool,
}

impl Server {
    /// Registers every interface on `network`. If one fails to start, the ones
    /// already registered are shut down again and the error is returned.
    pub fn start(
        config: TickConfig,
        network: Network,
        interfaces: Vec<Box<dyn NetworkInterface>>,
    ) -> Result<Self, ServerError> {
        let mut server = Self {
            config,
            network,
            subsystems: Vec::new(),
            state: ServerState::Starting,
            tick_counter: 0,
            stats: TickStats::new(),
            running: Arc::new(AtomicBool::new(true)),
            has_stopped: false,
        };

        let mut started = Vec::with_capacity(interfaces.len());
        for interface in interfaces {
            let description = interface.describe();
            match server.network.register_interface(interface) {
                Ok(_) => started.push(description),
                Err(e) => {
                    error!("Failed to start network interface on [{}]: {}", description, e);
                    server.force_shutdown();
                    return Err(e.into());
                }
            }
        }

        info!(
            "{} booted successfully on [{}]",
            server.network.name(),
            started.join(", ")
        );
        server.state = ServerState::Running;
        Ok(server)
    }

    pub fn add_subsystem(&mut self, subsystem: Box<dyn TickSubsystem>) {
        self.subsystems.push(subsystem);
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn tick_counter(&self) -> u64 {
        self.tick_counter
    }

    pub fn tick_stats(&self) -> &TickStats {
        &self.stats
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Asks the loop to stop after the current tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Runs until the running flag is cleared or a tick fails.
    ///
    /// A transport crash leaves the server `Crashed` and is returned; any other
    /// tick error is logged and ends the loop with an orderly shutdown.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let period = self.config.period();
        let catch_up = period * self.config.max_catch_up_ticks.max(1);
        let mut next_tick = Instant::now();
        let mut last_tick = next_tick;

        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now < next_tick {
                thread::sleep((next_tick - now).min(period));
                continue;
            }

            let result = self.tick_once();
            let finished = Instant::now();
            self.stats
                .record(now.duration_since(last_tick), finished - now, period);
            last_tick = now;

            if let Err(e) = result {
                if e.is_fatal() {
                    error!("{} - the server cannot continue and is shutting down", e);
                    self.state = ServerState::Crashed;
                    self.force_shutdown();
                    return Err(e);
                }
                error!("Error in tick {}: {}", self.tick_counter, e);
                break;
            }

            next_tick += period;
            if finished > next_tick + catch_up {
                debug!(
                    "Tick loop is {:?} behind, skipping ahead",
                    finished - next_tick
                );
                next_tick = finished;
            }
        }

        self.force_shutdown();
        Ok(())
    }

    /// Executes exactly one tick.
    pub fn tick_once(&mut self) -> Result<(), ServerError> {
        self.tick_counter += 1;
        self.network.tick()?;

        for subsystem in &mut self.subsystems {
            subsystem.tick(self.tick_counter, &mut self.network)?;
        }

        if self.tick_counter % u64::from(self.config.tick_rate.max(1)) == 0 {
            self.network.bandwidth_mut().rotate_history();
        }
        Ok(())
    }

    /// Closes every session and unregisters every interface. Safe to call
    /// more than once; only the first call does anything.
    pub fn force_shutdown(&mut self) {
        if self.has_stopped {
            return;
        }
        if self.running.load(Ordering::SeqCst) && self.state == ServerState::Running {
            error!("Forcing server shutdown...");
        }
        self.has_stopped = true;
        if self.state != ServerState::Crashed {
            self.state = ServerState::ShuttingDown;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.stop_network()));
        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(
                payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic during shutdown".to_owned()),
            ),
        };

        if let Some(message) = fault {
            error!("{}", ServerError::DoubleFault(message));
            error!("Crashed while crashing, killing process");
            std::process::exit(1);
        }

        if self.state != ServerState::Crashed {
            self.state = ServerState::Stopped;
        }
        info!("Server stopped after {} ticks", self.tick_counter);
    }

    fn stop_network(&mut self) -> Result<(), ServerError> {
        self.running.store(false, Ordering::SeqCst);
        self.network.sessions_mut().close(&self.config.shutdown_reason);

        debug!("Stopping network interfaces.");
        for id in self.network.interface_ids() {
            if let Some(description) = self.network.describe_interface(id) {
                debug!("Stopping network interface {} ({})", id, description);
            }
            self.network.unregister_interface(id)?;
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.force_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::context::Context;
    use crate::net::{InterfaceIo, NetworkError};

    #[derive(Debug, Default)]
    struct Trace {
        started: u32,
        ticks: u32,
        shut_down: u32,
    }

    struct TraceInterface {
        label: &'static str,
        fail_start: bool,
        crash_on_tick: Option<u32>,
        trace: Rc<RefCell<Trace>>,
    }

    impl TraceInterface {
        fn new(label: &'static str, trace: &Rc<RefCell<Trace>>) -> Self {
            Self {
                label,
                fail_start: false,
                crash_on_tick: None,
                trace: Rc::clone(trace),
            }
        }
    }

    fn boxed(interfaces: Vec<TraceInterface>) -> Vec<Box<dyn NetworkInterface>> {
        interfaces
            .into_iter()
            .map(|i| Box::new(i) as Box<dyn NetworkInterface>)
            .collect()
    }

    impl NetworkInterface for TraceInterface {
        fn describe(&self) -> String {
            self.label.to_owned()
        }

        fn start(&mut self) -> Result<(), NetworkError> {
            if self.fail_start {
                return Err(NetworkError::StartupFailure(format!("{} refused", self.label)));
            }
            self.trace.borrow_mut().started += 1;
            Ok(())
        }

        fn set_name(&mut self, _name: &str) {}

        fn tick(&mut self, io: &mut InterfaceIo<'_>) -> Result<(), NetworkError> {
            let mut trace = self.trace.borrow_mut();
            trace.ticks += 1;
            if self.crash_on_tick == Some(trace.ticks) {
                return Err(NetworkError::TransportCrash(format!("{} died", self.label)));
            }
            io.bandwidth.add(100, 50);
            Ok(())
        }

        fn shutdown(&mut self) {
            self.trace.borrow_mut().shut_down += 1;
        }
    }

    struct FailingSubsystem {
        fail_at: u64,
    }

    impl TickSubsystem for FailingSubsystem {
        fn name(&self) -> &str {
            "failing"
        }

        fn tick(&mut self, tick: u64, _network: &mut Network) -> Result<(), ServerError> {
            if tick == self.fail_at {
                return Err(ServerError::Subsystem {
                    name: self.name().to_owned(),
                    message: "gave up".into(),
                });
            }
            Ok(())
        }
    }

    fn single(trace: &Rc<RefCell<Trace>>, config: TickConfig) -> Server {
        Server::start(config, network(), boxed(vec![TraceInterface::new("a", trace)])).unwrap()
    }

    fn network() -> Network {
        Network::new(Context::system(), "SkyWing Net")
    }

    fn fast() -> TickConfig {
        TickConfig {
            tick_rate: 1000,
            ..TickConfig::default()
        }
    }

    #[test]
    fn test_tick_counter_advances_by_one() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut server = single(&trace, TickConfig::default());

        for expected in 1..=250 {
            server.tick_once().unwrap();
            assert_eq!(server.tick_counter(), expected);
        }
        assert_eq!(trace.borrow().ticks, 250);
    }

    #[test]
    fn test_bandwidth_rotates_once_per_second_of_ticks() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut server = single(&trace, TickConfig::default());

        for _ in 0..19 {
            server.tick_once().unwrap();
        }
        assert_eq!(server.network().bandwidth().send().average_bytes(), 0);

        server.tick_once().unwrap();
        // 20 ticks of 100 bytes, averaged over a history of 5 slots.
        assert_eq!(server.network().bandwidth().send().average_bytes(), 2000 / 5);
        assert_eq!(server.network().bandwidth().receive().average_bytes(), 1000 / 5);
    }

    #[test]
    fn test_startup_failure_unwinds_started_interfaces() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut broken = TraceInterface::new("broken", &trace);
        broken.fail_start = true;

        let result = Server::start(
            TickConfig::default(),
            network(),
            boxed(vec![TraceInterface::new("ok", &trace), broken]),
        );

        assert!(matches!(
            result,
            Err(ServerError::Network(NetworkError::StartupFailure(_)))
        ));
        let trace = trace.borrow();
        assert_eq!(trace.started, 1);
        assert_eq!(trace.shut_down, 1);
    }

    #[test]
    fn test_transport_crash_stops_the_server_as_crashed() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut crashing = TraceInterface::new("crashing", &trace);
        crashing.crash_on_tick = Some(3);
        let mut server = Server::start(fast(), network(), boxed(vec![crashing])).unwrap();

        let result = server.run();

        assert!(matches!(
            result,
            Err(ServerError::Network(NetworkError::TransportCrash(_)))
        ));
        assert_eq!(server.state(), ServerState::Crashed);
        assert_eq!(server.tick_counter(), 3);
        assert_eq!(server.network().interface_count(), 0);
        assert_eq!(trace.borrow().shut_down, 1);
    }

    #[test]
    fn test_subsystem_error_is_an_orderly_shutdown() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut server = single(&trace, fast());
        server.add_subsystem(Box::new(FailingSubsystem { fail_at: 5 }));

        assert!(server.run().is_ok());
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.tick_counter(), 5);
        assert!(!server.running().load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_flag_ends_run_and_is_idempotent() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut server = single(&trace, fast());
        server.shutdown();

        assert!(server.run().is_ok());
        server.force_shutdown();

        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.tick_counter(), 0);
        assert_eq!(trace.borrow().shut_down, 1);
    }

    #[test]
    fn test_run_records_tick_stats() {
        let trace = Rc::new(RefCell::new(Trace::default()));
        let mut server = single(&trace, fast());
        server.add_subsystem(Box::new(FailingSubsystem { fail_at: 30 }));

        server.run().unwrap();

        assert!(server.tick_stats().average_tps() > 0.0);
        assert!(server.tick_stats().average_tps() <= 1000.0);
        assert!(server.tick_stats().current_usage() <= 1.0);
    }
}
