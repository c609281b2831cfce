//! The debounce state machine, expressed as a pure transition function so that it can be tested
//! without timers.

/// Where the debounced queue is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Nothing queued and no timer running.
    #[default]
    Idle,
    /// Operations are queued and the debounce timer is running.
    Armed,
    /// The queue is being drained as one batch.
    Draining,
}

/// Something that happened to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A debounced operation was added to (or replaced in) the queue.
    Enqueued,
    /// The debounce timer elapsed.
    TimerFired,
    /// A drain took the queue, whether because the timer fired or because it was asked to.
    DrainStarted,
    /// A drain ran its whole batch. `queue_empty` tells whether more work arrived meanwhile.
    DrainFinished { queue_empty: bool },
}

/// What the coordinator must do after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    /// Start the debounce timer, cancelling the running one if any. Only the trailing edge fires.
    ArmTimer,
    /// Cancel the running debounce timer.
    CancelTimer,
    /// Start draining the queue.
    Drain,
}

/// Returns the phase after `event` and the effect to apply.
pub fn next(phase: Phase, event: Event) -> (Phase, Effect) {
    match (phase, event) {
        (Phase::Idle | Phase::Armed, Event::Enqueued) => (Phase::Armed, Effect::ArmTimer),
        // Work arriving mid-drain waits for the drain to finish, which re-arms the timer.
        (Phase::Draining, Event::Enqueued) => (Phase::Draining, Effect::None),

        (Phase::Armed, Event::TimerFired) => (Phase::Draining, Effect::Drain),
        // A timer that was superseded.
        (p, Event::TimerFired) => (p, Effect::None),

        (Phase::Armed, Event::DrainStarted) => (Phase::Draining, Effect::CancelTimer),
        (_, Event::DrainStarted) => (Phase::Draining, Effect::None),

        (Phase::Draining, Event::DrainFinished { queue_empty: true }) => {
            (Phase::Idle, Effect::None)
        }
        (Phase::Draining, Event::DrainFinished { queue_empty: false }) => {
            (Phase::Armed, Effect::ArmTimer)
        }
        (p, Event::DrainFinished { .. }) => (p, Effect::None),
    }
}
