//! Ambient stack shared by every crate in the tunnel connection core:
//! the error taxonomy, immutable credentials/properties, build info,
//! logging setup, and the process-wide metrics registry.

pub mod activity;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod metrics;
mod tokio_collector;

pub use activity::{ActivityBarrier, ActivityGuard};
pub use credentials::{BuildInfo, ConnectionOptions, Credentials, TunnelProperties};
pub use error::{ConnectionError, RegistrationError};
