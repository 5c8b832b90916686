//! Buildgate.
//!
//! Buildgate is a gateway in front of one or more build execution clusters. It authenticates and
//! authorizes every request by consulting a remote decision service, and routes execution calls
//! to the backend responsible for the instance name of the request.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;
mod service;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
