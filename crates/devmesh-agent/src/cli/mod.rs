//! The line-delimited JSON protocol with the external agent CLI.

pub mod envelope;
pub mod process;
pub mod testing;
pub mod transport;

pub use envelope::{unwrap_result_payload, CliEnvelope};
pub use process::{ChildProcessLauncher, ChildProcessTransport};
pub use transport::{CliLauncher, CliTransport, LaunchSpec};
