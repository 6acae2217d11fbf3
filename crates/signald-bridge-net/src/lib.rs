// Unix socket bridge to signald: transport, reply correlation, typed calls.

pub mod client;
pub mod correlator;
pub mod error;
pub mod subscription;
pub mod transport;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use client::{DaemonClient, SendTarget};
pub use correlator::{Correlator, Route};
pub use error::NetError;
pub use subscription::Subscription;
pub use transport::Transport;
