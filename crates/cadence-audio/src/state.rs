//! The playback state machine.
//!
//! States are plain values. What an operation does in a given state is
//! decided by [`transition`], a pure lookup returning the side effect to run
//! and the state to enter on success or failure. [`dispatch`] executes a
//! transition against whatever implements [`Transitions`], which for the
//! real engine is a locked engine session.

use std::fmt;

use cadence_core::Result;
use tracing::{debug, error, trace};

/// Playback state of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
    /// The output device failed; only device re-acquisition leaves this state.
    Error,
}

impl PlaybackState {
    /// Whether a decoder position is meaningful in this state.
    ///
    /// Stopped and Error report a zero position.
    pub const fn has_position(self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Operations that may change the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Play,
    Pause,
    Stop,
    /// The output device went away or was switched.
    SinkChange,
}

/// Side effect of a transition, executed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// Validate the position, acquire a sink, open the current track,
    /// negotiate its format and start the device.
    OpenAndStart,
    PauseSink,
    ResumeSink,
    StopSink,
    /// Replace a failed sink with a fresh one from the output manager.
    AcquireSink,
    /// Move playback to a new sink, keeping the position.
    Reopen { paused: bool },
    /// Re-check the playlist position without touching the device.
    Revalidate,
}

/// Whether an effect actually ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Done,
    /// Nothing to do; the state stays as it is.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub effect: Effect,
    pub success: PlaybackState,
    pub failure: PlaybackState,
    /// Events replayed after a successful transition.
    pub then: &'static [Event],
}

const fn to(effect: Effect, success: PlaybackState) -> Transition {
    Transition {
        effect,
        success,
        failure: PlaybackState::Error,
        then: &[],
    }
}

/// What `event` does in `state`, or `None` when it is a no-op.
pub(crate) const fn transition(state: PlaybackState, event: Event) -> Option<Transition> {
    use PlaybackState::{Error, Paused, Playing, Stopped};

    let t = match (state, event) {
        (Stopped, Event::Play) => to(Effect::OpenAndStart, Playing),
        (Stopped, _) => return None,

        (Playing, Event::Pause) => to(Effect::PauseSink, Paused),
        (Playing, Event::Stop) => to(Effect::StopSink, Stopped),
        (Playing, Event::SinkChange) => to(Effect::Reopen { paused: false }, Playing),
        (Playing, Event::Play) => return None,

        (Paused, Event::Play) => to(Effect::ResumeSink, Playing),
        (Paused, Event::Stop) => to(Effect::StopSink, Stopped),
        (Paused, Event::SinkChange) => to(Effect::Reopen { paused: true }, Paused),
        (Paused, Event::Pause) => return None,

        (Error, Event::Play) => Transition {
            then: &[Event::Play],
            ..to(Effect::AcquireSink, Stopped)
        },
        (Error, Event::Pause) => Transition {
            then: &[Event::Play, Event::Pause],
            ..to(Effect::AcquireSink, Stopped)
        },
        (Error, Event::Stop) => to(Effect::Revalidate, Error),
        (Error, Event::SinkChange) => to(Effect::AcquireSink, Stopped),
    };
    Some(t)
}

/// The engine side of a transition.
pub(crate) trait Transitions {
    fn current(&self) -> PlaybackState;

    /// Run a side effect. Errors send the machine to the failure state.
    fn apply(&mut self, effect: Effect) -> Result<Applied>;

    /// Swap in `next`, run its entry actions and return the replaced state.
    fn change_state(&mut self, next: PlaybackState) -> PlaybackState;
}

/// Execute `event` against the current state.
pub(crate) fn dispatch<T: Transitions + ?Sized>(ctx: &mut T, event: Event) {
    let current = ctx.current();
    let Some(t) = transition(current, event) else {
        trace!("{:?} ignored while {}", event, current);
        return;
    };

    match ctx.apply(t.effect) {
        Ok(Applied::Done) => {
            enter(ctx, current, t.success);
            for &next in t.then {
                dispatch(ctx, next);
            }
        }
        Ok(Applied::Skipped) => trace!("{:?} had nothing to do while {}", event, current),
        Err(e) if e.is_cancellation() => {}
        Err(e) => {
            error!("{:?} failed while {} ({:?}): {e}", event, current, t.effect);
            enter(ctx, current, t.failure);
        }
    }
}

fn enter<T: Transitions + ?Sized>(ctx: &mut T, from: PlaybackState, next: PlaybackState) {
    if from == next {
        return;
    }
    let previous = ctx.change_state(next);
    debug_assert_eq!(previous, from, "state replaced out of order");
    debug!("State changed: {:?} -> {:?}", previous, next);
}
