//! Emission schedule of empty (heartbeat) frames.

use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use futures_util::Stream;
use tokio_stream::wrappers::IntervalStream;

/// A stream ticking at the heartbeat period, or never when the peer did
/// not advertise an idle timeout.
#[derive(Debug)]
pub(crate) struct HeartBeat {
    interval: Option<IntervalStream>,
}

impl HeartBeat {
    /// A heartbeat that never ticks.
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// Ticks every `period`.
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        // The first tick fires immediately; skipping it keeps the wire
        // quiet right after the open exchange
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self {
            interval: Some(IntervalStream::new(interval)),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match &mut self.interval {
            Some(interval) => Pin::new(interval).poll_next(cx).map(|tick| tick.map(|_| ())),
            None => Poll::Pending,
        }
    }
}
