//! Domain model module declarations.

pub mod capability;
pub mod message;
pub mod process;

pub use capability::{Capability, CapabilityKind, CapabilitySet};
pub use message::{BroadcastSet, Message, MessageKind, PriorityClass, RouteTarget};
pub use process::{ExitStatus, ProcessId, ProcessRecord, ProcessRole, ProcessState, ProcessTable};
