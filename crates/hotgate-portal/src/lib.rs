//! Captive portal HTTP front end.
//!
//! A raw TCP server answers exactly one request per connection. Requests are
//! queued per source address, classified (browser boilerplate, OS
//! connectivity probe, loopback admin, portal client) and gated on whether
//! the caller's MAC has a session.

pub mod boilerplate;
pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod http;
pub mod logging;
pub mod pages;
pub mod probe;
pub mod server;
pub mod session;
pub mod settings;

pub use error::{PortalError, Result};
pub use handler::{PortalContext, PortalHandler};
pub use http::{HttpPetition, HttpResponse};
pub use probe::CaptivePortalType;
pub use server::{HttpServer, ServerOptions};
pub use session::{
    InMemorySessionStore, InMemoryUserDirectory, Session, SessionStore, UserDirectory,
};
pub use settings::PortalSettings;
