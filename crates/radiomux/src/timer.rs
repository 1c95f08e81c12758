//! # Deferred Events
//!
//! A single timer thread drives hold auto-release and blocking-call
//! deadlines. Producers only see the [`Scheduler`] trait, so tests can
//! substitute a recorder and fire events by hand.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use quanta::Instant;
use tracing::debug;

use crate::serial::Serial;

/// Event delivered when a deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Carries the work-hold sequence current when the hold was taken.
    WorkHoldExpired { seq: u64 },
    /// Carries the ack-hold sequence current when the hold was taken.
    AckHoldExpired { seq: u64 },
    /// Blocking-call deadline; `epoch` is the serial allocator epoch.
    BlockingDeadline { serial: Serial, epoch: u64 },
}

/// Something that can fire a [`TimerEvent`] after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, event: TimerEvent);
}

enum TimerCommand {
    Schedule { deadline: Instant, event: TimerEvent },
    Shutdown,
}

/// Cloneable scheduling handle, usable before the thread starts.
#[derive(Clone)]
pub struct TimerHandle {
    tx: Sender<TimerCommand>,
}

impl Scheduler for TimerHandle {
    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let deadline = Instant::now() + delay;
        // After shutdown the receiver is gone; the event is moot by then.
        let _ = self.tx.send(TimerCommand::Schedule { deadline, event });
    }
}

struct Entry {
    deadline: Instant,
    order: u64,
    event: TimerEvent,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.order == other.order
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap and the earliest deadline wins.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// Owner of the timer thread.
pub struct Timer {
    handle: TimerHandle,
    rx: Option<Receiver<TimerCommand>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Timer {
            handle: TimerHandle { tx },
            rx: Some(rx),
            thread: None,
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Spawns the timer thread. Events scheduled earlier are kept.
    ///
    /// Calling `start` a second time is a no-op.
    pub fn start<F>(&mut self, name: &str, on_fire: F) -> std::io::Result<()>
    where
        F: FnMut(TimerEvent) + Send + 'static,
    {
        let Some(rx) = self.rx.take() else {
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name(name.into())
            .spawn(move || timer_loop(rx, on_fire))?;
        self.thread = Some(handle);
        Ok(())
    }

    /// Stops the thread, dropping every pending event. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.handle.tx.send(TimerCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop<F: FnMut(TimerEvent)>(rx: Receiver<TimerCommand>, mut on_fire: F) {
    let mut heap: BinaryHeap<Entry> = BinaryHeap::new();
    let mut order = 0u64;

    loop {
        let now = Instant::now();
        while heap.peek().is_some_and(|e| e.deadline <= now) {
            if let Some(entry) = heap.pop() {
                on_fire(entry.event);
            }
        }

        let cmd = match heap.peek() {
            Some(next) => {
                let wait = next.deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match rx.recv() {
                Ok(cmd) => cmd,
                Err(_) => break,
            },
        };

        match cmd {
            TimerCommand::Schedule { deadline, event } => {
                order += 1;
                heap.push(Entry {
                    deadline,
                    order,
                    event,
                });
            }
            TimerCommand::Shutdown => break,
        }
    }
    debug!(pending = heap.len(), "timer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let (tx, rx) = unbounded();
        let mut timer = Timer::new();
        let handle = timer.handle();
        handle.schedule(Duration::from_millis(40), TimerEvent::AckHoldExpired { seq: 2 });
        handle.schedule(Duration::from_millis(10), TimerEvent::AckHoldExpired { seq: 1 });
        timer
            .start("timer-test", move |ev| {
                let _ = tx.send(ev);
            })
            .unwrap();

        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first, TimerEvent::AckHoldExpired { seq: 1 });
        assert_eq!(second, TimerEvent::AckHoldExpired { seq: 2 });
        timer.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_events() {
        let (tx, rx) = unbounded();
        let mut timer = Timer::new();
        timer
            .start("timer-test", move |ev| {
                let _ = tx.send(ev);
            })
            .unwrap();
        timer
            .handle()
            .schedule(Duration::from_secs(30), TimerEvent::WorkHoldExpired { seq: 1 });
        timer.shutdown();
        timer.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}
