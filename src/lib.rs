//! The I/O trunk of a peer-to-peer networking core: a single-threaded
//! readiness reactor and a rate-limited fair-share read scheduler.
//!
//! The two primitives are deliberately independent. The [`reactor::Reactor`]
//! owns one dedicated thread that blocks on the OS readiness primitive and
//! dispatches readable/writable events to a pluggable handler. The
//! [`sched::FairScheduler`] has no thread of its own; an outer orchestrator
//! invokes it once per processing round, and it spreads the round's byte
//! budget over every active connection in round-robin order.
//!
//! Neither component defines a transport protocol or an encryption layer.
//! Connections are opaque handles behind the [`sched::SchedConnection`] and
//! [`reactor::ReactorHandle`] trait seams, so the same core drives TCP, QUIC
//! streams, or anything else that can report readiness and perform a bounded
//! non-blocking read.

pub mod reactor;
pub mod sched;

pub use reactor::{
    EventHandler, Interest, Reactor, ReactorConfig, ReactorHandle, RegisterError,
};
pub use sched::{
    FairScheduler, RateBudget, ReadReadiness, SchedConnection, SchedulerConfig,
};
