//! Push processing: part demultiplexing and bundle storage.
//!
//! A push arrives as one part container. The processor routes each part
//! (store, forward, or handle in place), then hands any captured
//! changegroup to the storage step, which writes the blob and updates
//! the index under its exclusive lock.

pub mod processor;
pub mod storebundle;

use std::time::Instant;

use crate::bundle::Bundler;
use crate::error::Result;

pub use processor::process_parts;
pub use storebundle::store_bundle;

/// Mutable state of one push operation. Threaded explicitly through the
/// processor and storage steps; never ambient.
#[derive(Debug, Default)]
pub struct PushOperation {
    /// Reply container. Present once a `replycaps` part announced the
    /// client can receive replies.
    pub reply: Option<Bundler>,
    /// Capabilities announced by `replycaps`.
    pub reply_caps: Vec<String>,
    /// The scratch storage step already covers bookmark updates; the
    /// default pushkey handler must not apply them again.
    pub skip_pushkey: bool,
    /// Same, for phase updates.
    pub skip_phaseheads: bool,
}

impl PushOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_push_back(&self) -> bool {
        self.reply.is_some() && self.reply_caps.iter().any(|c| c == "pushback")
    }
}

/// Run `f` with start/success/failure events around it, carrying the
/// elapsed time. Failures are logged and re-raised, never swallowed.
pub fn log_service_call<T>(
    service: &'static str,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let start = Instant::now();
    tracing::info!(service, event = "start");
    match f() {
        Ok(value) => {
            tracing::info!(
                service,
                event = "success",
                elapsed_ms = start.elapsed().as_millis() as u64
            );
            Ok(value)
        }
        Err(e) => {
            tracing::warn!(
                service,
                event = "failure",
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e
            );
            Err(e)
        }
    }
}
