//! An Express-style HTTP server that scripts drive through deno_core.
//!
//! [`Application`] is usable directly from Rust. [`ScriptHost`] exposes the
//! same application to JavaScript as a global `Application` constructor.

pub mod address;
pub mod application;
pub mod error;
pub mod file_server;
pub mod filesystem;
pub mod format;
pub mod method;
pub mod middleware;
pub mod options;
pub mod request;
pub mod response;
pub mod router;
pub mod runner;
pub mod script;
pub mod server;

pub use address::{Address, ListenArgs};
pub use application::Application;
pub use error::{Error, Result};
pub use method::Method;
pub use middleware::{Middleware, Next};
pub use options::Options;
pub use request::Request;
pub use response::Response;
pub use script::ScriptHost;
