//! Initial-sync readiness tracking.
//!
//! # State Machine
//!
//! ```text
//!                 up-to-date (flag, callback, in-band, poll)
//! Establishing ──────────────────────────────────────────────▶ CaughtUp
//!      │  deadline                         ▲
//!      ├──────────────▶ TimedOut ──────────┘ late up-to-date
//!      │  error / cancelled
//!      └──────────────▶ Failed
//!
//! Contended is assigned to placeholder handles and never changes.
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::subscriber::{ShapeStream, StreamEvent};

/// Where a shape is in its initial sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessPhase {
    Establishing,
    CaughtUp,
    /// The backstop deadline passed first. The stream keeps running.
    TimedOut,
    /// Subscription was contended; the handle is a placeholder.
    Contended,
    Failed(String),
}

/// Inputs to [`ReadinessPhase::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessEvent {
    /// Stream flag read right after subscribing.
    ImmediateFlag(bool),
    /// The subscriber's initial-sync callback fired.
    InitialSyncCallback,
    /// An up-to-date control message was observed on the stream.
    StreamUpToDate,
    /// Periodic read of the stream flag.
    Poll(bool),
    DeadlineElapsed,
    Error(String),
    Cancelled,
}

impl ReadinessPhase {
    /// Waiters may stop waiting.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Self::Establishing)
    }

    pub fn is_caught_up(&self) -> bool {
        matches!(self, Self::CaughtUp)
    }

    pub fn transition(&self, event: &ReadinessEvent) -> ReadinessPhase {
        use ReadinessEvent as E;

        let up_to_date = matches!(
            event,
            E::ImmediateFlag(true) | E::Poll(true) | E::InitialSyncCallback | E::StreamUpToDate
        );

        match self {
            Self::Establishing => match event {
                _ if up_to_date => Self::CaughtUp,
                E::DeadlineElapsed => Self::TimedOut,
                E::Error(message) => Self::Failed(message.clone()),
                E::Cancelled => Self::Failed("unsubscribed before initial sync".to_string()),
                _ => Self::Establishing,
            },
            Self::TimedOut if up_to_date => Self::CaughtUp,
            other => other.clone(),
        }
    }
}

/// Timers for the readiness driver.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessTiming {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Shared readiness state, observable through a watch channel.
#[derive(Debug)]
pub(crate) struct ReadinessTracker {
    tx: watch::Sender<ReadinessPhase>,
}

impl ReadinessTracker {
    pub fn new(initial: ReadinessPhase) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn phase(&self) -> ReadinessPhase {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessPhase> {
        self.tx.subscribe()
    }

    /// Feed one event through the state machine; returns the resulting phase.
    pub fn apply(&self, event: ReadinessEvent) -> ReadinessPhase {
        self.tx.send_if_modified(|phase| {
            let next = phase.transition(&event);
            if next == *phase {
                return false;
            }
            debug!(from = ?phase, to = ?next, event = ?event, "readiness transition");
            *phase = next;
            true
        });
        self.phase()
    }
}

/// Drive a tracker from every readiness source until it leaves `Establishing`
/// and then, if timed out, until the stream confirms it is caught up or fails.
pub(crate) async fn drive_readiness(
    tracker: Arc<ReadinessTracker>,
    stream: Arc<dyn ShapeStream>,
    mut callbacks: mpsc::UnboundedReceiver<ReadinessEvent>,
    timing: ReadinessTiming,
) {
    let mut messages = stream.events();
    tracker.apply(ReadinessEvent::ImmediateFlag(stream.is_up_to_date()));

    let deadline = tokio::time::sleep(timing.timeout);
    tokio::pin!(deadline);
    let mut deadline_armed = true;

    let mut ticker = tokio::time::interval(timing.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut callbacks_open = true;
    let mut messages_open = true;

    loop {
        match tracker.phase() {
            ReadinessPhase::Establishing | ReadinessPhase::TimedOut => {}
            _ => return,
        }

        tokio::select! {
            event = callbacks.recv(), if callbacks_open => match event {
                Some(ReadinessEvent::Error(message))
                    if tracker.phase() == ReadinessPhase::TimedOut =>
                {
                    // The phase stays TimedOut; a failed stream can never catch up.
                    warn!(error = %message, "shape stream failed after readiness timeout");
                    return;
                }
                Some(event) => {
                    tracker.apply(event);
                }
                None => callbacks_open = false,
            },
            message = messages.recv(), if messages_open => match message {
                Ok(StreamEvent::UpToDate) => {
                    tracker.apply(ReadinessEvent::StreamUpToDate);
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => messages_open = false,
            },
            _ = ticker.tick() => {
                tracker.apply(ReadinessEvent::Poll(stream.is_up_to_date()));
            }
            _ = &mut deadline, if deadline_armed => {
                deadline_armed = false;
                if tracker.apply(ReadinessEvent::DeadlineElapsed) == ReadinessPhase::TimedOut {
                    warn!(
                        timeout_ms = timing.timeout.as_millis() as u64,
                        "initial sync not confirmed before deadline, continuing in background"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ReadinessEvent as E;
    use ReadinessPhase as P;

    #[test]
    fn test_establishing_transitions() {
        assert_eq!(P::Establishing.transition(&E::ImmediateFlag(false)), P::Establishing);
        assert_eq!(P::Establishing.transition(&E::ImmediateFlag(true)), P::CaughtUp);
        assert_eq!(P::Establishing.transition(&E::Poll(true)), P::CaughtUp);
        assert_eq!(P::Establishing.transition(&E::InitialSyncCallback), P::CaughtUp);
        assert_eq!(P::Establishing.transition(&E::StreamUpToDate), P::CaughtUp);
        assert_eq!(P::Establishing.transition(&E::DeadlineElapsed), P::TimedOut);
        assert_eq!(
            P::Establishing.transition(&E::Error("boom".into())),
            P::Failed("boom".into())
        );
        assert!(matches!(P::Establishing.transition(&E::Cancelled), P::Failed(_)));
    }

    #[test]
    fn test_timed_out_can_catch_up() {
        assert_eq!(P::TimedOut.transition(&E::Poll(true)), P::CaughtUp);
        assert_eq!(P::TimedOut.transition(&E::Poll(false)), P::TimedOut);
        assert_eq!(P::TimedOut.transition(&E::Error("late".into())), P::TimedOut);
    }

    #[test]
    fn test_terminal_phases_absorb() {
        for phase in [P::CaughtUp, P::Contended, P::Failed("x".into())] {
            for event in [
                E::ImmediateFlag(true),
                E::Poll(false),
                E::DeadlineElapsed,
                E::Error("y".into()),
                E::Cancelled,
            ] {
                assert_eq!(phase.transition(&event), phase);
            }
        }
    }

    #[test]
    fn test_tracker_notifies_waiters() {
        let tracker = ReadinessTracker::new(P::Establishing);
        let mut rx = tracker.subscribe();
        assert!(!rx.has_changed().unwrap());

        assert_eq!(tracker.apply(E::Poll(false)), P::Establishing);
        assert!(!rx.has_changed().unwrap());

        assert_eq!(tracker.apply(E::StreamUpToDate), P::CaughtUp);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), P::CaughtUp);
    }

    /// A stream that never catches up on its own.
    struct Idle {
        events: broadcast::Sender<StreamEvent>,
    }

    impl ShapeStream for Idle {
        fn is_up_to_date(&self) -> bool {
            false
        }

        fn shape_handle(&self) -> Option<String> {
            None
        }

        fn events(&self) -> broadcast::Receiver<StreamEvent> {
            self.events.subscribe()
        }

        fn unsubscribe(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_timeout_stops_driver() {
        let (events, _) = broadcast::channel(4);
        let stream: Arc<dyn ShapeStream> = Arc::new(Idle { events });
        let tracker = Arc::new(ReadinessTracker::new(P::Establishing));
        let (tx, rx) = mpsc::unbounded_channel();
        let timing = ReadinessTiming {
            timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
        };
        let driver = tokio::spawn(drive_readiness(tracker.clone(), stream, rx, timing));

        tokio::time::sleep(Duration::from_millis(1050)).await;
        assert_eq!(tracker.phase(), P::TimedOut);
        assert!(!driver.is_finished());

        tx.send(E::Error("connection reset".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .expect("driver should stop after a fatal error")
            .unwrap();
        assert_eq!(tracker.phase(), P::TimedOut);
        drop(tx);
    }
}
