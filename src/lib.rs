//! crs-core: the native recording core of the Connected Runtime Services
//! telemetry subsystem.
//!
//! Application threads record events (class loads, first method calls)
//! with negligible latency into thread-local buffers carved from one
//! reserved virtual region. A single dispatcher flushes the buffers into
//! structured notification events that a service thread delivers to the
//! upstream agent. A safepoint-time eviction protocol rewrites records
//! that pin runtime metadata into self-describing form before the
//! metadata is freed.
//!
//! Layers, leaves first:
//! - [`alist`]: lock-free intrusive buffer pools
//! - [`tlb`] / [`manager`]: buffers, commit/uncommit, the flush walk
//! - [`arena`]: the thread-facing record allocator
//! - [`record`] / [`evict`]: the message family and the blow protocol
//! - [`event`]: the latch between mutators and the service thread
//! - [`crs`]: the facade the host runtime calls
//!
//! The host runtime plugs in via [`runtime::RuntimeEnv`].

pub mod alist;
pub mod arena;
pub mod config;
pub mod crs;
pub mod error;
pub mod event;
pub mod evict;
pub mod manager;
pub mod platform;
pub mod record;
pub mod runtime;
pub mod stats;
pub mod tlb;

/// Nominal buffer size (~128 records of typical size).
pub const NOMINAL_BUFFER_SIZE: usize = 8 * 1024;

/// Hard cap on buffer size: record lengths are 16 bits.
pub const MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Bytes of buffers committed eagerly at init.
pub const INITIAL_COMMIT_ESTIMATE: usize = 640 * 1024;

/// The reserved region must hold at least this many buffers.
pub const MIN_BUFFERS: usize = 2;

pub use arena::{FlushReport, RecordArena};
pub use config::{Enable, Options, Origin};
pub use crs::Crs;
pub use error::{CrsError, UpstreamError};
pub use event::{Event, EventQueue};
pub use record::{ClassLoadView, FirstCallView, RecordSink};
pub use runtime::{ClassRef, CrsThread, LoaderRef, MethodRef, RuntimeEnv, UpcallArg};
