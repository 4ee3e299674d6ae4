//! Client-side keep-alive driver.

use crate::connection::ConnectionHandle;
use crate::protocol::Envelope;

use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

/// Sends a keep-alive whenever the connection has been send-idle for a
/// full interval.
///
/// Any application traffic pushes the next keep-alive back, so a busy
/// connection carries no heartbeat overhead.
#[derive(Debug)]
pub struct HeartbeatDriver {
    connection: ConnectionHandle,
    interval: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl HeartbeatDriver {
    /// Create a driver for `connection`.
    #[must_use]
    pub const fn new(
        connection: ConnectionHandle,
        interval: Duration,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connection,
            interval,
            poll_interval,
            shutdown,
        }
    }

    /// Run until shutdown or until the connection closes.
    ///
    /// Returns the number of keep-alives sent. A failed send closes the
    /// connection and stops the driver.
    #[instrument(skip(self), fields(connection = %self.connection.id()))]
    pub async fn run(self) -> u64 {
        let mut sent = 0;

        loop {
            let due = self.connection.last_send() + self.interval;
            let wake = due.max(Instant::now() + self.poll_interval);

            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                () = self.connection.closed() => break,
                () = sleep_until(wake) => {}
            }

            if self.connection.send_idle() < self.interval {
                continue;
            }

            match self.connection.send(&Envelope::keep_alive()).await {
                Ok(()) => {
                    sent += 1;
                    trace!("Keep-alive sent");
                }
                Err(e) => {
                    warn!("Keep-alive failed: {e}");
                    self.connection.close().await;
                    break;
                }
            }
        }

        debug!(sent, "Heartbeat stopped");
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::protocol::{KeepAlive, MAX_FRAME_SIZE, Message};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct Chatter;

    impl Message for Chatter {
        const MESSAGE_TYPE: &'static str = "chatter";
    }

    fn pair() -> (Connection, Connection) {
        let (local, remote) = tokio::io::duplex(4096);
        (
            Connection::new(Box::new(local), "local", MAX_FRAME_SIZE),
            Connection::new(Box::new(remote), "remote", MAX_FRAME_SIZE),
        )
    }

    fn driver(connection: &Connection, shutdown: &CancellationToken) -> HeartbeatDriver {
        HeartbeatDriver::new(
            connection.handle().clone(),
            Duration::from_millis(100),
            Duration::from_millis(10),
            shutdown.clone(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sends_when_idle() {
        let (local, mut remote) = pair();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(driver(&local, &shutdown).run());

        let started = Instant::now();
        for _ in 0..3 {
            let envelope = remote.receive().await.unwrap().unwrap();
            assert!(envelope.is::<KeepAlive>());
        }
        assert!(started.elapsed() >= Duration::from_millis(300));

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_suppresses_keep_alive() {
        let (local, mut remote) = pair();
        let shutdown = CancellationToken::new();
        let handle = local.handle().clone();
        let task = tokio::spawn(driver(&local, &shutdown).run());

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(60)).await;
            handle.send_message(&Chatter).await.unwrap();
        }
        for _ in 0..5 {
            assert!(remote.receive().await.unwrap().unwrap().is::<Chatter>());
        }

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stops_when_connection_closes() {
        let (local, _remote) = pair();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(driver(&local, &shutdown).run());

        local.handle().close().await;
        let sent = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(sent, 0);
    }
}
