use std::future::Future;
use std::time::Duration;

/// Runs `operation` up to `attempts` times, sleeping `delay` between
/// failures. Returns the first success or the last error.
///
/// `attempts` of zero is treated as one.
pub async fn retry<T, E, F, Fut>(attempts: u32, delay: Duration, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
        }
    }
}
