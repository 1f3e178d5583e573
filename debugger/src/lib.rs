//! Controller-side view of a backend process.
//!
//! [`proxy::BackendProxy`] owns the child process and its connection, pumps
//! decoded messages into a queue the application drains by polling, and
//! tracks the controller-visible run state. The application never blocks on
//! the backend; it polls [`proxy::BackendProxy::fetch_next_message`] on a
//! short interval and correlates responses by command id.

pub mod proxy;
pub mod state;

pub use proxy::{BackendProxy, ProxyError};
pub use state::{Event, RunnerState};

#[cfg(feature = "launch-configuration")]
pub fn options_from_configuration(
    config: &launch_configuration::LaunchConfiguration,
) -> server::LaunchOptions {
    config.to_launch_options()
}
