//! Worker process for the detached backend: answers requests on stdio.
//!
//! Logs go to stderr; stdout carries only responses.

use std::io;

use anyhow::Result;
use weft_server::Handler;
use weft_server::worker::{serve, storage_from_env};

fn main() -> Result<()> {
    env_logger::Builder::from_default_env().init();

    let storage = storage_from_env();
    if let Some(storage) = &storage {
        log::info!(
            "worker storage at {} ({})",
            storage.root().root().display(),
            storage.namespace()
        );
    }
    let handler = Handler::new(storage);

    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(stdin.lock(), stdout.lock(), &handler)?;
    Ok(())
}
