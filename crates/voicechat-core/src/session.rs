//! Browser session bootstrap.
//!
//! The backend routes tool-call results by the browser session id, so the id
//! is fixed before delivery starts and registered in the background.

use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::api::{BackendClient, BrowserSessionRequest};
use crate::config::Config;

/// Offsets from the first attempt at which registration is tried.
pub const REGISTER_SCHEDULE: [Duration; 4] = [
    Duration::from_millis(500),
    Duration::from_millis(1_500),
    Duration::from_millis(3_000),
    Duration::from_millis(5_000),
];

/// The pinned session from the config, or a fresh one.
pub fn browser_session_id(config: &Config) -> String {
    match config.session_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("browser_{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Runs `attempt` at each offset of `schedule` until one succeeds.
///
/// Returns None once the schedule is exhausted; failures are only logged.
pub async fn retry_with_schedule<F, Fut, T>(label: &str, schedule: &[Duration], mut attempt: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    for (n, offset) in schedule.iter().enumerate() {
        time::sleep_until(start + *offset).await;
        match attempt().await {
            Ok(value) => {
                log::debug!("{} succeeded on attempt {}", label, n + 1);
                return Some(value);
            }
            Err(e) => log::warn!("{} attempt {} failed: {}", label, n + 1, e),
        }
    }
    log::warn!("Giving up on {} after {} attempts", label, schedule.len());
    None
}

/// Registers the browser session with the backend. Returns whether the
/// backend acknowledged it.
pub async fn register(client: &BackendClient, config: &Config, session_id: &str) -> bool {
    let request = BrowserSessionRequest::new(session_id, config.profile.clone());
    retry_with_schedule("Browser session registration", &REGISTER_SCHEDULE, || {
        client.register_browser_session(&request)
    })
    .await
    .is_some()
}
