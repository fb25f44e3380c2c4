//! Image loader.
//!
//! Command line frontend of the image loading service. It downloads images through the same
//! cache and downloader that embedding applications use, and maintains the on-disk cache.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
