//! Clipcache.
//!
//! A maintenance tool for the local cache of synthesized speech clips. It inspects, prunes and
//! deletes clips in an existing cache database without ever contacting a speech provider.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod logging;

#[cfg(test)]
use clipcache_test as _;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
