//! anevt.
//!
//! anevt is a standalone web service hosting pluggable analytics modules. Modules
//! register views (HTML endpoints), queries (JSON endpoints) and event handlers
//! against an explicit registry; expensive queries are wrapped in a shared-store
//! memoization engine that deduplicates concurrent computations.

#![warn(missing_docs, missing_debug_implementations, clippy::all)]

mod builtin;
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
