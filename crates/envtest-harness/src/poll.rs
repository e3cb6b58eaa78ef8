//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Polling helper for eventually-consistent assertions."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use tokio::time::Instant;

/// Call `probe` every `interval` until it succeeds or `timeout` elapses.
///
/// A probe that is still running when the deadline passes is cancelled. The
/// returned error carries the last probe failure.
pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut probe: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let deadline = Instant::now() + timeout;
    let mut attempts = 0u32;
    let mut last_error = None;
    loop {
        attempts += 1;
        match tokio::time::timeout_at(deadline, probe()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => last_error = Some(err),
            Err(_) => break,
        }
        if Instant::now() + interval > deadline {
            break;
        }
        tokio::time::sleep(interval).await;
    }
    let detail = last_error
        .map(|err| format!("{err:#}"))
        .unwrap_or_else(|| "probe never completed".to_owned());
    Err(anyhow!(
        "condition not met within {timeout:?} after {attempts} attempt(s): {detail}"
    ))
}
