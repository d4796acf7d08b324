pub mod capture;
pub mod classify;
pub mod cli;
pub mod config;
pub mod error;
pub mod filter;
pub mod hook;
pub mod metrics;
pub mod session;
pub mod transport;

pub use classify::{classify, Classification, Direction, Reason};
pub use config::ProbeConfig;
pub use error::{NcpError, Result};
pub use filter::AddressFilter;
pub use hook::{HookDispatcher, Verdict};
pub use session::{Handshake, Session};
pub use transport::{Inbound, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
