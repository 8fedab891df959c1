//! Network utilities

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Open a raw TCP connection to `host:port` and report how long the
/// handshake took. `None` on refusal, resolution failure or timeout.
pub async fn measure_connect(host: &str, port: u16, limit: Duration) -> Option<Duration> {
    let start = Instant::now();
    match timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(_stream)) => Some(start.elapsed()),
        Ok(Err(e)) => {
            debug!("connect {}:{} failed: {}", host, port, e);
            None
        }
        Err(_) => {
            debug!("connect {}:{} timed out after {:?}", host, port, limit);
            None
        }
    }
}

/// Millisecond value of a measured latency, saturating at `u32::MAX`
pub fn latency_millis(elapsed: Duration) -> u32 {
    u32::try_from(elapsed.as_millis()).unwrap_or(u32::MAX)
}
