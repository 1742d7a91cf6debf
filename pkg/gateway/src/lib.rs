//! Authenticated TLS endpoint for interactive sessions inside a running
//! container.
//!
//! The controller connects over TLS, proves knowledge of the shared
//! secret, and upgrades the connection to SSH. The SSH engine itself is a
//! [`SessionHandler`]; this crate does the routing, authentication and
//! dispatch of each session into the container runtime.

pub mod auth;
mod server;
pub mod session;

pub use auth::GatewayAuth;
pub use server::{Gateway, GatewayHandle};
pub use session::{
    DEFAULT_COMMAND, GatewayStream, SSH_USER, SessionContext, SessionHandler, parse_command,
    run_session, validate_user,
};
