//! vmexec - run a shell script inside a VM guest through the vSphere guest
//! operations API and bring its output back.
//!
//! The guest is never contacted directly: the script is uploaded through a
//! signed transfer URL, started as a detached guest process, polled until it
//! finishes, and its captured output downloaded the same way.

#![forbid(unsafe_code)]

pub mod guest;
pub mod mock;
pub mod run;
pub mod shutdown;
pub mod transfer;
pub mod vsphere;

pub use guest::{GuestOperations, GuestOpsError, TransferHandle};
pub use run::{Orchestrator, RunConfig, RunError, RunFailure, RunOutcome, RunReport};
pub use transfer::{HttpTransfer, Transfer, TransferError};
