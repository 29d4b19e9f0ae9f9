//! Shutter actuation sequence
//!
//! Half press, wait for focus, full press, let go. The release write is
//! attempted no matter how the earlier writes went, otherwise the camera
//! stays with a button held down.

use crate::error::{SessionError, TransportError};
use crate::infrastructure::bluetooth::protocol::{ActuationPhase, GattProfile};
use crate::infrastructure::bluetooth::transport::{Link, WriteMode};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActuationTiming {
    /// Between Focus and ShutterAndFocus
    pub focus_delay: Duration,
    /// Between ShutterAndFocus and Release
    pub release_delay: Duration,
}

impl ActuationTiming {
    /// How long to hold `phase` before writing the next one
    pub fn hold_after(&self, phase: ActuationPhase) -> Duration {
        match phase {
            ActuationPhase::Focus => self.focus_delay,
            ActuationPhase::ShutterAndFocus => self.release_delay,
            ActuationPhase::Idle | ActuationPhase::Release => Duration::ZERO,
        }
    }
}

impl Default for ActuationTiming {
    fn default() -> Self {
        Self {
            focus_delay: Duration::from_millis(300),
            release_delay: Duration::ZERO,
        }
    }
}

/// Tracks whether a press may still be latched on the camera.
///
/// Armed before the first press is written and cleared once the release
/// has been attempted. A sequence interrupted in between leaves it armed,
/// and the owner must then send a release itself.
#[derive(Debug, Default)]
pub struct ButtonLatch {
    held: Option<ActuationPhase>,
}

impl ButtonLatch {
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    pub fn held_phase(&self) -> Option<ActuationPhase> {
        self.held
    }

    fn press(&mut self, phase: ActuationPhase) {
        self.held = Some(phase);
    }

    fn clear(&mut self) {
        self.held = None;
    }
}

async fn write_phase(
    link: &Link<'_>,
    profile: &GattProfile,
    phase: ActuationPhase,
) -> Result<(), TransportError> {
    debug!("Shutter write: {} ({:#04X})", phase, phase.bitmask());
    link.write(profile.shutter, &[phase.bitmask()], WriteMode::WithoutResponse)
        .await
}

/// Write Release to the shutter characteristic and clear the latch
pub async fn release_buttons(
    link: &Link<'_>,
    profile: &GattProfile,
    latch: &mut ButtonLatch,
) -> Result<(), TransportError> {
    let result = write_phase(link, profile, ActuationPhase::Release).await;
    latch.clear();
    result
}

/// Walk the phases from `Idle` (Focus -> ShutterAndFocus -> Release).
///
/// Returns the first failure, tagged with its phase. Later phases still run.
pub async fn trigger_shutter(
    link: &Link<'_>,
    profile: &GattProfile,
    timing: &ActuationTiming,
    latch: &mut ButtonLatch,
) -> Result<(), SessionError> {
    info!("--- Triggering Shutter Sequence ---");
    let mut first_error: Option<SessionError> = None;
    let mut record = |phase: ActuationPhase, result: Result<(), TransportError>| {
        if let Err(source) = result {
            warn!("Shutter write failed during {}: {}", phase, source);
            if first_error.is_none() {
                first_error = Some(SessionError::ActuationWriteFailed { phase, source });
            }
        }
    };

    let mut phase = ActuationPhase::Idle;
    while let Some(next) = phase.next() {
        let result = match next {
            ActuationPhase::Release => release_buttons(link, profile, latch).await,
            pressed => {
                latch.press(pressed);
                write_phase(link, profile, pressed).await
            }
        };
        record(next, result);

        let hold = timing.hold_after(next);
        if !hold.is_zero() {
            tokio::time::sleep(hold).await;
        }
        phase = next;
    }

    match first_error {
        Some(err) => Err(err),
        None => {
            info!("Shutter sequence complete");
            Ok(())
        }
    }
}
