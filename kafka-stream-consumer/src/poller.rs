use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::actor::Request;

/// Drives the actor even when no stream is asking for anything: enqueues
/// a poll request every `poll_interval` until shutdown. Enqueues never
/// block; a poll still being handled just means the next one queues
/// behind it. The interval is a floor on poll frequency, not a latency
/// ceiling.
pub(crate) fn spawn(
    requests: mpsc::UnboundedSender<Request>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if requests.send(Request::Poll).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("poll source stopped");
    })
}
