//! Guarded task spawning.
//!
//! Every background unit of work is spawned through here so a panic in one
//! of them is logged and contained instead of disappearing silently with
//! its `JoinHandle`.

use std::any::Any;
use std::future::Future;

use tokio::task::{JoinError, JoinHandle};
use tracing::error;

/// Spawns `fut` as a detached task whose panics are logged under `label`.
pub fn spawn_guarded<F>(label: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::spawn(fut).await {
            if e.is_panic() {
                error!(task = label, panic = %panic_message(e), "Task panicked");
            }
        }
    })
}

/// Extracts a printable message from a panicked task.
pub fn panic_message(err: JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload_message(payload.as_ref()),
        Err(err) => err.to_string(),
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
