/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! One-way termination channel from devices (and the deadline timer) to the
//! engine.
//!
//! Devices never hold a reference to the engine.  Each one receives a
//! [`TerminationNotifier`] at construction; sending on it is cheap, never
//! blocks, and is safe from any thread, including a device's own execution
//! thread.  The engine owns the single [`TriggerReceiver`].

use std::fmt;

use tokio::sync::mpsc;
use tracing::debug;

/// Why termination was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateTrigger {
    /// A device observed the end of its test (e.g. a test-complete packet).
    Device(String),
    /// The task deadline elapsed.
    Deadline,
    /// An outside caller asked via `HardwareEngine::notify_terminate`.
    External,
}

impl fmt::Display for TerminateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminateTrigger::Device(name) => write!(f, "device '{name}'"),
            TerminateTrigger::Deadline => write!(f, "deadline"),
            TerminateTrigger::External => write!(f, "external request"),
        }
    }
}

/// Sending half handed to every device.
#[derive(Debug, Clone)]
pub struct TerminationNotifier {
    tx: mpsc::UnboundedSender<TerminateTrigger>,
}

impl TerminationNotifier {
    /// Ask the engine to terminate the running task.
    ///
    /// Repeated or concurrent calls are fine; the engine terminates once.
    pub fn notify(&self, trigger: TerminateTrigger) {
        if self.tx.send(trigger).is_err() {
            debug!("engine gone, termination request dropped");
        }
    }

    /// Shorthand for `notify(TerminateTrigger::Device(name))`.
    pub fn device_finished(&self, name: &str) {
        self.notify(TerminateTrigger::Device(name.to_string()));
    }
}

/// Receiving half owned by the engine.
#[derive(Debug)]
pub struct TriggerReceiver {
    rx: mpsc::UnboundedReceiver<TerminateTrigger>,
}

impl TriggerReceiver {
    pub(crate) async fn recv(&mut self) -> Option<TerminateTrigger> {
        self.rx.recv().await
    }

    /// Discard triggers left over from a previous task.
    pub(crate) fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// Create a connected notifier / receiver pair.
pub fn termination_channel() -> (TerminationNotifier, TriggerReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TerminationNotifier { tx }, TriggerReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_arrive_in_order() {
        let (notifier, mut rx) = termination_channel();
        notifier.device_finished("tester");
        notifier.notify(TerminateTrigger::Deadline);

        assert_eq!(
            rx.recv().await,
            Some(TerminateTrigger::Device("tester".into()))
        );
        assert_eq!(rx.recv().await, Some(TerminateTrigger::Deadline));
    }

    #[test]
    fn drain_discards_stale_triggers() {
        let (notifier, mut rx) = termination_channel();
        let clone = notifier.clone();
        std::thread::spawn(move || clone.notify(TerminateTrigger::External))
            .join()
            .unwrap();
        notifier.notify(TerminateTrigger::Deadline);

        assert_eq!(rx.drain(), 2);
        assert_eq!(rx.drain(), 0);
    }

    #[test]
    fn notify_after_receiver_dropped_is_harmless() {
        let (notifier, rx) = termination_channel();
        drop(rx);
        notifier.notify(TerminateTrigger::External);
    }
}
