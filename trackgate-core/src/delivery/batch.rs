//! Buffer of accepted events awaiting a batched flush

use tokio::task::JoinHandle;

use crate::types::TrackedEvent;

/// What the caller must do after [`BatchBuffer::push`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// First event of a batch; arm the flush timer
    ArmTimer,
    /// Keep buffering
    Buffered,
    /// Size threshold reached; flush now
    Full,
}

/// Ordered pending events plus the timer armed by the first of them.
#[derive(Debug)]
pub struct BatchBuffer {
    events: Vec<TrackedEvent>,
    batch_size: usize,
    timer: Option<JoinHandle<()>>,
}

impl BatchBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            events: Vec::new(),
            batch_size: batch_size.max(1),
            timer: None,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[TrackedEvent] {
        &self.events
    }

    pub fn push(&mut self, event: TrackedEvent) -> PushOutcome {
        self.events.push(event);
        if self.events.len() >= self.batch_size {
            PushOutcome::Full
        } else if self.events.len() == 1 && self.timer.is_none() {
            PushOutcome::ArmTimer
        } else {
            PushOutcome::Buffered
        }
    }

    /// Hold the flush timer so it can be cancelled with the batch.
    pub fn set_timer(&mut self, timer: JoinHandle<()>) {
        if let Some(old) = self.timer.replace(timer) {
            old.abort();
        }
    }

    pub fn has_timer(&self) -> bool {
        self.timer.is_some()
    }

    /// Take every buffered event in order and cancel the timer.
    pub fn take(&mut self) -> Vec<TrackedEvent> {
        self.cancel_timer();
        std::mem::take(&mut self.events)
    }

    /// Forget the timer without aborting it. Called from the timer itself.
    pub fn timer_fired(&mut self) {
        self.timer = None;
    }

    pub fn clear(&mut self) {
        self.cancel_timer();
        self.events.clear();
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}
