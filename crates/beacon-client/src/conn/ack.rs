//! Acknowledgement tracker for in-flight publishes.
//!
//! # Purpose
//! Pairs outbound publishes, in ascending `msg_serial` order, with the
//! `Ack`/`Nack` that eventually resolves them. Driven solely by the
//! connection state machine so that resume and teardown semantics stay a
//! single transition effect.
use std::collections::VecDeque;

use tokio::sync::oneshot;

use beacon_wire::{ErrorInfo, ProtocolMessage};

use crate::error::{Error, Result};

pub(crate) struct PendingPublish {
    pub msg_serial: i64,
    pub count: u32,
    /// The frame as sent, kept for replay on a successful resume.
    pub frame: ProtocolMessage,
    pub completion: oneshot::Sender<Result<()>>,
}

pub(crate) struct AckTracker {
    entries: VecDeque<PendingPublish>,
    limit: usize,
}

impl AckTracker {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Track a sent publish. At capacity the oldest entry is failed with
    /// `QueueOverflow` to bound memory under a silent broker.
    pub fn push(&mut self, entry: PendingPublish) {
        if self.entries.len() >= self.limit
            && let Some(oldest) = self.entries.pop_front()
        {
            metrics::counter!("beacon_client_ack_overflow_total").increment(1);
            let _ = oldest.completion.send(Err(Error::QueueOverflow));
        }
        self.entries.push_back(entry);
        metrics::gauge!("beacon_client_pending_acks").set(self.entries.len() as f64);
    }

    /// Complete every entry whose serial falls in `[serial, serial + count)`.
    pub fn ack(&mut self, serial: i64, count: u32) -> Result<()> {
        self.resolve(serial, count, None)
    }

    /// Fail every entry in the range with the broker-supplied error.
    pub fn nack(&mut self, serial: i64, count: u32, error: ErrorInfo) -> Result<()> {
        self.resolve(serial, count, Some(error))
    }

    fn resolve(&mut self, serial: i64, count: u32, error: Option<ErrorInfo>) -> Result<()> {
        let end = serial + i64::from(count);
        let Some(tail) = self.entries.back() else {
            // A duplicate terminal frame after everything resolved; ignore.
            return Ok(());
        };
        if end > tail.msg_serial + i64::from(tail.count) {
            return Err(Error::ProtocolViolation(format!(
                "ack range [{serial}, {end}) exceeds highest pending serial"
            )));
        }
        let mut index = 0;
        while index < self.entries.len() {
            let entry_serial = self.entries[index].msg_serial;
            if entry_serial >= end {
                break;
            }
            if entry_serial >= serial {
                if let Some(entry) = self.entries.remove(index) {
                    let outcome = match &error {
                        None => Ok(()),
                        Some(info) => Err(Error::from_error_info(info.clone())),
                    };
                    let _ = entry.completion.send(outcome);
                }
            } else {
                index += 1;
            }
        }
        metrics::gauge!("beacon_client_pending_acks").set(self.entries.len() as f64);
        Ok(())
    }

    /// Frames to replay, in serial order, when the broker accepts a resume.
    pub fn frames_for_resend(&self) -> Vec<ProtocolMessage> {
        self.entries.iter().map(|entry| entry.frame.clone()).collect()
    }

    /// Fail everything still pending; used on non-resumable reconnect and on
    /// close.
    pub fn fail_all(&mut self, error: &Error) {
        for entry in self.entries.drain(..) {
            let _ = entry.completion.send(Err(error.clone()));
        }
        metrics::gauge!("beacon_client_pending_acks").set(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_wire::Action;

    fn entry(serial: i64) -> (PendingPublish, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut frame = ProtocolMessage::with_channel(Action::Message, "news");
        frame.msg_serial = Some(serial);
        (
            PendingPublish {
                msg_serial: serial,
                count: 1,
                frame,
                completion: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn ack_completes_the_serial_range() {
        let mut tracker = AckTracker::new(16);
        let (first, first_rx) = entry(0);
        let (second, second_rx) = entry(1);
        let (third, third_rx) = entry(2);
        tracker.push(first);
        tracker.push(second);
        tracker.push(third);

        tracker.ack(0, 2).expect("in range");
        first_rx.await.expect("resolved").expect("ok");
        second_rx.await.expect("resolved").expect("ok");
        assert_eq!(tracker.len(), 1);

        tracker.ack(2, 1).expect("in range");
        third_rx.await.expect("resolved").expect("ok");
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn nack_fails_with_the_attached_error() {
        let mut tracker = AckTracker::new(16);
        let (pending, rx) = entry(5);
        tracker.push(pending);
        tracker
            .nack(5, 1, ErrorInfo::new(90_001, 400, "rejected"))
            .expect("in range");
        let err = rx.await.expect("resolved").expect_err("failed");
        assert!(matches!(err, Error::ChannelFailed(info) if info.code == 90_001));
    }

    #[tokio::test]
    async fn ack_beyond_pending_tail_is_a_protocol_violation() {
        let mut tracker = AckTracker::new(16);
        let (pending, _rx) = entry(0);
        tracker.push(pending);
        let err = tracker.ack(0, 3).expect_err("out of range");
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn duplicate_ack_after_resolution_is_ignored() {
        let mut tracker = AckTracker::new(16);
        assert!(tracker.ack(0, 1).is_ok());
    }

    #[tokio::test]
    async fn overflow_fails_the_oldest_entry() {
        let mut tracker = AckTracker::new(2);
        let (first, first_rx) = entry(0);
        let (second, _second_rx) = entry(1);
        let (third, _third_rx) = entry(2);
        tracker.push(first);
        tracker.push(second);
        tracker.push(third);
        let err = first_rx.await.expect("resolved").expect_err("overflowed");
        assert!(matches!(err, Error::QueueOverflow));
        assert_eq!(tracker.len(), 2);
    }

    #[tokio::test]
    async fn fail_all_resolves_every_completion() {
        let mut tracker = AckTracker::new(16);
        let (first, first_rx) = entry(0);
        let (second, second_rx) = entry(1);
        tracker.push(first);
        tracker.push(second);
        tracker.fail_all(&Error::disconnected());
        assert!(matches!(
            first_rx.await.expect("resolved").expect_err("failed"),
            Error::Disconnected(_)
        ));
        assert!(matches!(
            second_rx.await.expect("resolved").expect_err("failed"),
            Error::Disconnected(_)
        ));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn resend_frames_keep_their_original_serials() {
        let mut tracker = AckTracker::new(16);
        let (first, _rx1) = entry(3);
        let (second, _rx2) = entry(4);
        tracker.push(first);
        tracker.push(second);
        let frames = tracker.frames_for_resend();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].msg_serial, Some(3));
        assert_eq!(frames[1].msg_serial, Some(4));
        assert_eq!(tracker.len(), 2);
    }
}
