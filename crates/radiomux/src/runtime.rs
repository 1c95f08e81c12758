//! # Subsystem Runtime
//!
//! [`RadioMux`] owns one complete instance: request table, endpoint
//! table, dispatcher, supervisor, timer thread and supervisor thread.
//! Nothing is global, so several instances (one per modem) can coexist.
//!
//! Dropping the handle shuts the instance down: threads stop, every
//! pending request fails with `ServiceUnavailable`, connections close.

use std::sync::Arc;
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Sender};
use tracing::{info, warn};

use crate::command::Command;
use crate::config::MuxConfig;
use crate::dispatcher::{Dispatcher, DispatcherParts};
use crate::domain::{Domain, Topology};
use crate::endpoint::{EndpointSnapshot, EndpointState, EndpointTable};
use crate::error::{ConfigError, MuxError, RequestError};
use crate::hold::{AttributionTag, LoggingPower, PowerResource};
use crate::observer::EventHub;
use crate::request::{Completion, RequestCode, RequestTable};
use crate::supervisor::{BindOutcome, EndpointSupervisor, SupervisorEvent};
use crate::telemetry::{NoopTelemetry, TelemetrySink};
use crate::timer::Timer;
use crate::transport::ServiceLocator;

pub struct RadioMuxBuilder {
    locator: Arc<dyn ServiceLocator>,
    config: Result<MuxConfig, ConfigError>,
    table: RequestTable,
    power: Arc<dyn PowerResource>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl RadioMuxBuilder {
    pub fn config(mut self, config: MuxConfig) -> Self {
        self.config = Ok(config);
        self
    }

    /// Uses configuration parsed from a TOML document. A parse or
    /// validation error surfaces from [`build`](Self::build).
    pub fn config_toml(mut self, document: &str) -> Self {
        self.config = MuxConfig::from_toml_str(document);
        self
    }

    pub fn request_table(mut self, table: RequestTable) -> Self {
        self.table = table;
        self
    }

    pub fn power(mut self, power: Arc<dyn PowerResource>) -> Self {
        self.power = power;
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Probes the topology, binds every served domain and starts the
    /// worker threads.
    pub fn build(self) -> Result<RadioMux, MuxError> {
        let RadioMuxBuilder {
            locator,
            config,
            table,
            power,
            telemetry,
        } = self;
        let config = config?;

        let topology = if Domain::SPLIT.iter().any(|d| locator.is_declared(*d)) {
            Topology::Split
        } else {
            Topology::Legacy
        };
        let endpoints = Arc::new(EndpointTable::new(topology));
        for domain in &config.disabled_domains {
            endpoints.disable(*domain, "disabled by configuration");
        }

        let hub = Arc::new(EventHub::new());
        let (events_tx, events_rx) = unbounded();
        let mut timer = Timer::new();

        let dispatcher = Arc::new(Dispatcher::new(DispatcherParts {
            table: Arc::new(table),
            endpoints: endpoints.clone(),
            hub: hub.clone(),
            telemetry: telemetry.clone(),
            power,
            scheduler: Arc::new(timer.handle()),
            supervisor: events_tx.clone(),
            hold_timeouts: config.holds,
            blocking_timeout: config.blocking_timeout,
        }));
        for o in &config.compat_overrides {
            dispatcher.gate().set_override(o.request, o.version);
        }

        let weak = Arc::downgrade(&dispatcher);
        timer
            .start("radiomux-timer", move |event| {
                if let Some(dispatcher) = weak.upgrade() {
                    dispatcher.on_timer(event);
                }
            })
            .map_err(|source| MuxError::Spawn {
                name: "timer",
                source,
            })?;

        let supervisor = Arc::new(EndpointSupervisor::new(
            endpoints.clone(),
            locator,
            dispatcher.clone(),
            hub.clone(),
            telemetry,
            config.supervisor.clone(),
            events_tx.clone(),
        ));
        let bound = supervisor
            .bind_all()
            .iter()
            .filter(|(_, outcome)| matches!(outcome, BindOutcome::Bound(_)))
            .count();

        let supervisor_thread = supervisor
            .clone()
            .spawn(events_rx)
            .map_err(|source| MuxError::Spawn {
                name: "supervisor",
                source,
            })?;

        info!(
            ?topology,
            bound,
            policy = %config.supervisor.reset_policy,
            "radio multiplexer started"
        );

        Ok(RadioMux {
            dispatcher,
            supervisor,
            hub,
            endpoints,
            events_tx,
            timer,
            supervisor_thread: Some(supervisor_thread),
            config,
            stopped: false,
        })
    }
}

/// Handle to one running subsystem instance.
pub struct RadioMux {
    dispatcher: Arc<Dispatcher>,
    supervisor: Arc<EndpointSupervisor>,
    hub: Arc<EventHub>,
    endpoints: Arc<EndpointTable>,
    events_tx: Sender<SupervisorEvent>,
    timer: Timer,
    supervisor_thread: Option<thread::JoinHandle<()>>,
    config: MuxConfig,
    stopped: bool,
}

impl RadioMux {
    pub fn builder(locator: Arc<dyn ServiceLocator>) -> RadioMuxBuilder {
        RadioMuxBuilder {
            locator,
            config: Ok(MuxConfig::default()),
            table: RequestTable::standard(),
            power: Arc::new(LoggingPower),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Arc<EndpointSupervisor> {
        &self.supervisor
    }

    pub fn events(&self) -> &EventHub {
        &self.hub
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.endpoints.topology()
    }

    pub fn endpoint(&self, domain: Domain) -> EndpointSnapshot {
        self.endpoints.snapshot(domain)
    }

    pub fn endpoint_state(&self, domain: Domain) -> EndpointState {
        self.endpoints.state(domain)
    }

    /// See [`Dispatcher::issue`].
    pub fn issue(
        &self,
        domain: Domain,
        code: RequestCode,
        args: Bytes,
        tag: AttributionTag,
        completion: Completion,
    ) {
        self.dispatcher.issue(domain, code, args, tag, completion);
    }

    /// See [`Dispatcher::call`].
    pub fn call<C, F>(&self, command: &C, tag: AttributionTag, on_done: F)
    where
        C: Command,
        F: FnOnce(Result<C::Output, RequestError>) + Send + 'static,
    {
        self.dispatcher.call(command, tag, on_done);
    }

    /// Full restart: fails everything pending, restarts serial numbering
    /// and rebinds every domain not disabled by configuration. The
    /// topology probed at build time is kept.
    pub fn restart(&self) {
        if self.stopped {
            return;
        }
        self.supervisor.restart(&self.config.disabled_domains);
    }

    /// Stops the threads, fails everything pending and closes every
    /// connection. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let _ = self.events_tx.send(SupervisorEvent::Shutdown);
        if let Some(handle) = self.supervisor_thread.take() {
            if handle.join().is_err() {
                warn!("supervisor thread panicked");
            }
        }
        self.supervisor.shutdown();
        let drained = self.dispatcher.drain_all();
        self.timer.shutdown();
        self.dispatcher.holds().clear();
        info!(drained, "radio multiplexer stopped");
    }
}

impl Drop for RadioMux {
    fn drop(&mut self) {
        self.shutdown();
    }
}
