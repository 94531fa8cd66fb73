pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod http;
pub mod mime;
pub mod prelude;
pub mod sendfile;
pub mod server;
pub mod timeouts;
pub mod workers;
