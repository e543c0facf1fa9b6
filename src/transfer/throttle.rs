use std::time::Duration;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(1);

/// Keeps received bytes per second at or below a budget.
///
/// Bytes are counted from the start of a window. Once they reach the budget
/// the caller sleeps until they are paid for at `bytes_per_second`, so a
/// single chunk larger than the budget holds the caller for several seconds.
#[derive(Debug)]
pub struct ThrottlingManager {
    bytes_per_second: u64,
    window_start: Instant,
    window_bytes: u64,
}

impl ThrottlingManager {
    /// A budget of 0 disables throttling.
    pub fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second,
            window_start: Instant::now(),
            window_bytes: 0,
        }
    }

    pub async fn throttle(&mut self, bytes: u64) {
        if self.bytes_per_second == 0 {
            return;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.window_bytes = 0;
        }

        self.window_bytes += bytes;
        if self.window_bytes < self.bytes_per_second {
            return;
        }

        let earned = Duration::from_millis(
            self.window_bytes.saturating_mul(1000) / self.bytes_per_second,
        );
        let elapsed = now.duration_since(self.window_start);
        if elapsed < earned {
            let pause = earned - elapsed;
            tracing::debug!(
                "Throttling state transfer for {:?} ({} bytes this window)",
                pause,
                self.window_bytes
            );
            tokio::time::sleep(pause).await;
        }
        self.window_start = Instant::now();
        self.window_bytes = 0;
    }
}
