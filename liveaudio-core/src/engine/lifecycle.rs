//! Device lifecycle sequencing for [`LiveAudioSource`].
//!
//! ```text
//!            NullToReady          ReadyToPaused         PausedToPlaying
//!   Null ───────────────► Ready ───────────────► Paused ───────────────► Playing
//!        ◄───────────────       ◄───────────────        ◄───────────────
//!            ReadyToNull          PausedToReady         PlayingToPaused
//! ```
//!
//! | transition | device work | when |
//! |---|---|---|
//! | NullToReady | create backend + ring buffer, open device, next sample = 0 | before delegation |
//! | ReadyToPaused | clear flushing | before delegation |
//! | PausedToPlaying | allow the ring buffer to start | before delegation |
//! | PlayingToPaused | forbid start, pause ring buffer | after delegation |
//! | PausedToReady | set flushing, release, next sample = 0 | after delegation |
//! | ReadyToNull | close device, destroy ring buffer | after delegation |

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::LiveAudioSource;
use crate::buffering::SegmentedRingBuffer;
use crate::error::{LiveAudioError, Result};
use crate::ipc::events::SourceStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl ElementState {
    pub fn status(self) -> SourceStatus {
        match self {
            Self::Null => SourceStatus::Null,
            Self::Ready => SourceStatus::Ready,
            Self::Paused => SourceStatus::Paused,
            Self::Playing => SourceStatus::Playing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl StateChange {
    pub fn from_state(self) -> ElementState {
        match self {
            Self::NullToReady => ElementState::Null,
            Self::ReadyToPaused | Self::ReadyToNull => ElementState::Ready,
            Self::PausedToPlaying | Self::PausedToReady => ElementState::Paused,
            Self::PlayingToPaused => ElementState::Playing,
        }
    }

    pub fn to_state(self) -> ElementState {
        match self {
            Self::ReadyToNull => ElementState::Null,
            Self::NullToReady | Self::PausedToReady => ElementState::Ready,
            Self::ReadyToPaused | Self::PlayingToPaused => ElementState::Paused,
            Self::PausedToPlaying => ElementState::Playing,
        }
    }

    /// The single step from `current` toward `target`, if any.
    pub fn next_toward(current: ElementState, target: ElementState) -> Option<Self> {
        use ElementState::*;
        match (current, current.cmp(&target)) {
            (_, std::cmp::Ordering::Equal) => None,
            (Null, std::cmp::Ordering::Less) => Some(Self::NullToReady),
            (Ready, std::cmp::Ordering::Less) => Some(Self::ReadyToPaused),
            (Paused, std::cmp::Ordering::Less) => Some(Self::PausedToPlaying),
            (Playing, std::cmp::Ordering::Greater) => Some(Self::PlayingToPaused),
            (Paused, std::cmp::Ordering::Greater) => Some(Self::PausedToReady),
            (Ready, std::cmp::Ordering::Greater) => Some(Self::ReadyToNull),
            _ => None,
        }
    }
}

/// Outcome of a successful transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChangeSuccess {
    Success,
    /// Reached paused but cannot preroll, as live sources never do.
    NoPreroll,
}

impl LiveAudioSource {
    /// Step through every transition between the current state and `target`.
    pub fn set_state(&self, target: ElementState) -> Result<StateChangeSuccess> {
        let mut result = StateChangeSuccess::Success;
        while let Some(transition) = StateChange::next_toward(self.current_state(), target) {
            result = self.change_state(transition)?;
        }
        Ok(result)
    }

    /// Perform one transition. Forward device work runs before the generic
    /// state bookkeeping, reverse work after it.
    pub fn change_state(&self, transition: StateChange) -> Result<StateChangeSuccess> {
        let _serial = self.transition_lock.lock();
        if self.current_state() != transition.from_state() {
            return Err(LiveAudioError::WrongState("transition does not start at current state"));
        }
        debug!(?transition, "state change");

        match transition {
            StateChange::NullToReady => self.enter_ready()?,
            StateChange::ReadyToPaused => self.ring_handle()?.set_flushing(false),
            StateChange::PausedToPlaying => self.ring_handle()?.set_may_start(true),
            _ => {}
        }

        let result = self.delegate_state_change(transition);

        if let Err(e) = self.reverse_work(transition) {
            // The device is still in the state we were leaving.
            *self.state.lock() = transition.from_state();
            return Err(e);
        }
        Ok(result)
    }

    /// Device work for downward transitions, run after delegation.
    fn reverse_work(&self, transition: StateChange) -> Result<()> {
        match transition {
            StateChange::PlayingToPaused => {
                let ring = self.ring_handle()?;
                ring.set_may_start(false);
                match ring.pause() {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => debug!("pause skipped: {e}"),
                    Err(e) => warn!("pause failed: {e}"),
                }
            }
            StateChange::PausedToReady => {
                let ring = self.ring_handle()?;
                ring.set_flushing(true);
                if let Err(e) = ring.release() {
                    self.post_error(&e);
                    return Err(e);
                }
                *self.next_sample.lock() = Some(0);
            }
            StateChange::ReadyToNull => self.leave_ready()?,
            _ => {}
        }
        Ok(())
    }

    fn enter_ready(&self) -> Result<()> {
        let ring = {
            let mut slot = self.ring.write();
            match slot.as_ref() {
                Some(ring) => Arc::clone(ring),
                None => {
                    let backend = self.provider.create_backend()?;
                    let ring = Arc::new(SegmentedRingBuffer::new(backend));
                    self.clock.attach(&ring);
                    *slot = Some(Arc::clone(&ring));
                    ring
                }
            }
        };

        if let Err(e) = ring.open_device() {
            let err = match e {
                LiveAudioError::DeviceOpenFailure(_) => e,
                other => LiveAudioError::DeviceOpenFailure(other.to_string()),
            };
            warn!("{err}");
            self.post_error(&err);
            return Err(err);
        }
        *self.next_sample.lock() = Some(0);
        info!("device open");
        Ok(())
    }

    fn leave_ready(&self) -> Result<()> {
        let ring = self.ring_handle()?;
        if let Err(e) = ring.close_device() {
            self.post_error(&e);
            return Err(e);
        }
        self.clock.detach();
        *self.ring.write() = None;
        info!("device closed");
        Ok(())
    }

    /// Generic bookkeeping shared by every transition.
    fn delegate_state_change(&self, transition: StateChange) -> StateChangeSuccess {
        self.set_status(transition.to_state());
        match transition {
            StateChange::ReadyToPaused | StateChange::PlayingToPaused if self.is_live() => {
                StateChangeSuccess::NoPreroll
            }
            _ => StateChangeSuccess::Success,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::simulated::{DriveMode, SimulatedConfig, SimulatedProvider};
    use crate::buffering::{AudioCaps, RingState};
    use crate::engine::SourceConfig;

    fn source_with(config: SimulatedConfig) -> (LiveAudioSource, SimulatedProvider) {
        let provider = SimulatedProvider::new(config);
        let source = LiveAudioSource::new(SourceConfig::default(), Arc::new(provider.clone()))
            .expect("source");
        (source, provider)
    }

    fn manual() -> SimulatedConfig {
        SimulatedConfig {
            drive: DriveMode::Manual,
            ..SimulatedConfig::default()
        }
    }

    #[test]
    fn next_toward_walks_one_step_at_a_time() {
        use ElementState::*;
        assert_eq!(StateChange::next_toward(Null, Playing), Some(StateChange::NullToReady));
        assert_eq!(StateChange::next_toward(Paused, Playing), Some(StateChange::PausedToPlaying));
        assert_eq!(StateChange::next_toward(Playing, Null), Some(StateChange::PlayingToPaused));
        assert_eq!(StateChange::next_toward(Ready, Null), Some(StateChange::ReadyToNull));
        assert_eq!(StateChange::next_toward(Ready, Ready), None);
    }

    #[test]
    fn forward_sequence_arms_ring_buffer() {
        let (source, _) = source_with(manual());
        source.set_state(ElementState::Ready).expect("ready");
        let ring = source.ring().expect("ring created on ready");
        assert!(ring.is_open());
        assert!(ring.is_flushing());

        assert_eq!(
            source.set_state(ElementState::Paused).expect("paused"),
            StateChangeSuccess::NoPreroll
        );
        assert!(!ring.is_flushing());
        assert!(!ring.may_start());

        source.set_state(ElementState::Playing).expect("playing");
        assert!(ring.may_start());
        assert_eq!(source.current_state(), ElementState::Playing);
    }

    #[test]
    fn reverse_sequence_releases_and_closes() {
        let (source, provider) = source_with(manual());
        source.set_state(ElementState::Paused).expect("paused");
        source
            .set_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("caps");
        source.set_state(ElementState::Playing).expect("playing");
        let ring = source.ring().expect("ring");
        assert!(ring.start().expect("start"));

        assert_eq!(
            source.set_state(ElementState::Paused).expect("paused"),
            StateChangeSuccess::NoPreroll
        );
        assert!(!ring.may_start());
        assert_eq!(ring.state(), RingState::Paused);

        source.set_state(ElementState::Ready).expect("ready");
        assert!(!ring.is_acquired());
        assert!(ring.is_flushing());

        source.set_state(ElementState::Null).expect("null");
        assert!(source.ring().is_none());
        assert!(!ring.is_open());

        assert_eq!(
            provider.call_log().entries(),
            vec![
                "open", "acquire", "activate", "start", "pause", "stop", "deactivate",
                "release", "close"
            ]
        );
    }

    #[test]
    fn open_failure_aborts_ready() {
        let (source, _) = source_with(SimulatedConfig {
            fail_open: true,
            ..manual()
        });
        let mut status = source.subscribe_status();
        assert!(matches!(
            source.set_state(ElementState::Ready).unwrap_err(),
            LiveAudioError::DeviceOpenFailure(_)
        ));
        assert_eq!(source.current_state(), ElementState::Null);
        let event = status.try_recv().expect("status event");
        assert_eq!(event.status, SourceStatus::Error);
    }

    #[test]
    fn status_events_follow_transitions() {
        let (source, _) = source_with(manual());
        let mut status = source.subscribe_status();
        source.set_state(ElementState::Playing).expect("playing");
        source.set_state(ElementState::Null).expect("null");

        let seen: Vec<SourceStatus> = std::iter::from_fn(|| status.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(
            seen,
            vec![
                SourceStatus::Ready,
                SourceStatus::Paused,
                SourceStatus::Playing,
                SourceStatus::Paused,
                SourceStatus::Ready,
                SourceStatus::Null,
            ]
        );
    }

    #[test]
    fn failed_release_keeps_paused_state() {
        let (source, _) = source_with(SimulatedConfig {
            fail_release: true,
            ..manual()
        });
        source.set_state(ElementState::Paused).expect("paused");
        source
            .set_caps(&AudioCaps::fixed_raw_int(44_100, 2, 16, 16, true))
            .expect("caps");
        let mut status = source.subscribe_status();

        assert!(matches!(
            source.set_state(ElementState::Ready).unwrap_err(),
            LiveAudioError::Device(_)
        ));
        assert_eq!(source.current_state(), ElementState::Paused);
        let ring = source.ring().expect("ring");
        assert!(ring.is_acquired());

        let seen: Vec<SourceStatus> = std::iter::from_fn(|| status.try_recv().ok())
            .map(|e| e.status)
            .collect();
        assert_eq!(seen, vec![SourceStatus::Ready, SourceStatus::Error]);
    }

    #[test]
    fn change_state_rejects_mismatched_transition() {
        let (source, _) = source_with(manual());
        assert!(matches!(
            source.change_state(StateChange::ReadyToPaused).unwrap_err(),
            LiveAudioError::WrongState(_)
        ));
    }
}
