//! # Dispatch Queue
//!
//! One logical queue per bus. Every delivery goes through it:
//!
//! ```text
//! publish ──► push ──► queue idle? ──yes──► this thread drains until empty
//!                          │
//!                          no ──► return, the draining thread picks it up
//! ```
//!
//! Handlers therefore never run in parallel, and a publish made from
//! inside a handler is queued behind the delivery in progress.

use bifrost_types::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Deferred work executed by the bus.
pub(crate) enum Task {
    /// Deliver an envelope to its channel.
    Publish(Envelope),
    /// Run a closure, e.g. a synthesized timeout response.
    Invoke {
        channel: String,
        job: Box<dyn FnOnce() + Send>,
    },
}

#[cfg(test)]
impl Task {
    fn channel(&self) -> &str {
        match self {
            Task::Publish(envelope) => &envelope.channel,
            Task::Invoke { channel, .. } => channel,
        }
    }
}

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    draining: bool,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    state: Mutex<QueueState>,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Queue `task` and, if nobody is draining, drain on this thread.
    pub(crate) fn submit<F>(&self, task: Task, run: F)
    where
        F: FnMut(Task),
    {
        {
            let mut state = self.state.lock();
            state.tasks.push_back(task);
            if state.draining {
                return;
            }
            state.draining = true;
        }
        self.drain(run);
    }

    fn drain<F>(&self, mut run: F)
    where
        F: FnMut(Task),
    {
        let guard = DrainGuard { dispatcher: self };
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            run(next);
        }
        std::mem::forget(guard);
    }

    /// Drop every queued task. Returns how many were dropped.
    pub(crate) fn clear(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.tasks.len();
        state.tasks.clear();
        dropped
    }

    #[cfg(test)]
    fn queued(&self) -> usize {
        self.state.lock().tasks.len()
    }

    #[cfg(test)]
    fn is_draining(&self) -> bool {
        self.state.lock().draining
    }
}

/// Releases the drain flag if a task unwinds out of `drain`.
struct DrainGuard<'a> {
    dispatcher: &'a Dispatcher,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.dispatcher.state.lock().draining = false;
    }
}
