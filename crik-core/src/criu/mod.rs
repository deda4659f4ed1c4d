//! Checkpoint engine driver.
//!
//! Dump goes through the engine's swrk RPC so the pre-dump hooks can run at
//! exactly the right moment; restore goes through the CLI so the inherited
//! descriptor table can be wired up with plain process plumbing.

mod dump;
mod restore;
pub mod rpc;

pub use dump::take_checkpoint;
pub use restore::restore_with_cmd;
pub use rpc::Criu;
