//! # radiomux
//!
//! Command multiplexing and recovery between a telephony control plane
//! and a set of independently versioned modem service endpoints.
//!
//! Callers issue requests through the [`Dispatcher`]; each one gets a
//! serial, a pending-registry entry and a work hold, and its continuation
//! runs exactly once whatever happens to the endpoint underneath. The
//! [`EndpointSupervisor`] binds endpoints, notices when they die and runs
//! the reset protocol that drains and rebinds them.
//!
//! ## Modules
//!
//! - [`serial`]: correlation identifiers
//! - [`registry`]: pending request map, the exactly-once gate
//! - [`hold`]: work and ack holds with sequence-checked auto-release
//! - [`timer`]: the deferred event thread
//! - [`compat`]: minimum-version gate and per-code overrides
//! - [`endpoint`]: per-domain connection slots and generation cookies
//! - [`supervisor`]: bind, loss handling, reset policy, bind retries
//! - [`dispatcher`]: issue path and the response protocol
//! - [`transport`]: the codec boundary
//! - [`observer`]: indication and radio state fan-out
//! - [`telemetry`]: latency histograms and loss counters
//! - [`config`]: TOML configuration
//! - [`runtime`]: [`RadioMux`], one owned subsystem instance

pub mod command;
pub mod compat;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod endpoint;
pub mod error;
pub mod hold;
pub mod observer;
pub mod registry;
pub mod request;
pub mod runtime;
pub mod serial;
pub mod supervisor;
pub mod telemetry;
pub mod timer;
pub mod transport;

pub use command::Command;
pub use config::MuxConfig;
pub use dispatcher::Dispatcher;
pub use domain::{Domain, HalVersion, Topology};
pub use endpoint::{EndpointSnapshot, EndpointState};
pub use error::{BindError, ConfigError, MuxError, RadioError, RequestError, SendError};
pub use hold::{AttributionTag, HoldKind, PowerResource};
pub use observer::{EventHub, Indication, RadioPowerState};
pub use request::{
    EventCode, IndicationKind, Outcome, RequestCode, RequestSpec, RequestTable, Response,
    ResponseInfo, ResponseKind,
};
pub use runtime::{RadioMux, RadioMuxBuilder};
pub use serial::Serial;
pub use supervisor::{EndpointSupervisor, ResetPolicy, SupervisorEvent};
pub use telemetry::{LossReason, RequestHistograms, TelemetrySink};
pub use transport::{Connection, LinkHooks, OutboundRequest, Origin, ServiceLocator};
