//! Typed error taxonomy for the query-evaluation engine.
//!
//! The four variants below correspond to the four non-signal error classes
//! in the protocol design: engine errors are fatal to the process, protocol
//! and device errors drop the current connection but keep the server alive,
//! and external-resource errors drop the connection while leaving the prior
//! database installed.

use std::fmt;

/// Raw OpenCL error code, as returned by a `cl*` entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClError(pub i32);

impl fmt::Display for ClError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpenCL error {}", self.0)
    }
}

impl std::error::Error for ClError {}

/// Errors that prevent the engine from continuing to serve any client and
/// are fatal to the process: device enumeration, context/program setup, or
/// memory exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to enumerate accelerator devices: {0}")]
    DeviceEnumeration(#[source] ClError),
    #[error("no accelerator device at index {0}")]
    NoSuchDevice(usize),
    #[error("failed to create accelerator context: {0}")]
    ContextCreate(#[source] ClError),
    #[error("kernel program failed to build:\n{0}")]
    CompileFailure(String),
    #[error("device has insufficient memory for the requested database")]
    OutOfDeviceMemory,
    #[error("device operation failed: {0}")]
    Device(#[source] ClError),
}

/// Errors caused by the client's use of the wire protocol. These terminate
/// only the current connection; the server keeps listening.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command byte {0:#04x}")]
    UnknownCommand(u8),
    #[error("short read: expected {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("short write: expected {expected} bytes, wrote {got}")]
    ShortWrite { expected: usize, got: usize },
    #[error("bad configuration: {0}")]
    BadConfig(&'static str),
    #[error("read or write issued before a successful configure")]
    NotConfigured,
    #[error("engine state is poisoned by a prior device error, reconfigure required")]
    Poisoned,
}

/// Errors occurring in an in-flight device operation (enqueue, launch,
/// read-back). These poison engine state until the next successful
/// `configure`, per the connection-vs-process distinction in the protocol
/// design.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to enqueue a device write: {0}")]
    EnqueueFailed(#[source] ClError),
    #[error("failed to read back device output: {0}")]
    ReadbackFailed(#[source] ClError),
    #[error("failed to enqueue a kernel launch: {0}")]
    LaunchFailed(#[source] ClError),
}

/// Errors attaching or validating an external resource (the shared-memory
/// database segment). The previously installed database, if any, is left
/// untouched.
#[derive(Debug, thiserror::Error)]
pub enum ExternalError {
    #[error("failed to attach shared-memory segment {handle}: {source}")]
    ShmAttachFailed { handle: i32, source: std::io::Error },
    #[error("shared-memory segment is {actual} bytes, need at least {needed}")]
    ShmTooSmall { actual: usize, needed: usize },
    #[error("failed to query shared-memory segment size: {0}")]
    ShmStatFailed(std::io::Error),
}

/// Top-level error a connection handler can observe, used to decide
/// whether the server keeps running and whether the connection is
/// terminated cleanly or the process exits.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    External(#[from] ExternalError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("I/O error on control channel: {0}")]
    Io(#[from] std::io::Error),
}
