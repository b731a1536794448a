use std::collections::VecDeque;

use tokio::sync::oneshot;

/// FIFO list of blocked consumers.
///
/// Each waiter holds the receiving half of a single-shot channel; the queue
/// holds the sending half here, in enrolment order. Producers wake exactly
/// one waiter per new item, and lifecycle transitions (close, pause) wake
/// everyone. A waiter that gives up (deadline reached) deregisters itself by
/// token, which closes the race between "timed out" and "just signalled"
/// down to a final non-blocking retry on the caller's side.
pub(crate) struct WaitQueue {
    waiters: VecDeque<Waiter>,
    next_token: u64,
}

struct Waiter {
    token: u64,
    signal: oneshot::Sender<()>,
}

impl WaitQueue {
    pub(crate) fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
            next_token: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Enrols a new waiter at the tail, returning its token and the signal
    /// to wait on.
    pub(crate) fn enroll(&mut self) -> (u64, oneshot::Receiver<()>) {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        let (signal, wait) = oneshot::channel();
        self.waiters.push_back(Waiter { token, signal });
        (token, wait)
    }

    /// Deregisters a waiter by token.
    ///
    /// Returns `false` if the waiter was already gone, which means a wakeup
    /// was already dispatched to it; the caller should make one last
    /// non-blocking attempt before giving up.
    pub(crate) fn cancel(&mut self, token: u64) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|waiter| waiter.token != token);
        self.waiters.len() != before
    }

    /// Wakes the longest-enrolled waiter.
    ///
    /// A waiter whose receiving half is already dropped timed out without
    /// deregistering yet; the signal falls through to the next waiter in
    /// line rather than being lost.
    pub(crate) fn wake_one(&mut self) {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.signal.send(()).is_ok() {
                return;
            }
        }
    }

    /// Wakes every enrolled waiter.
    pub(crate) fn wake_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.signal.send(());
        }
    }
}
