//! Ringback scheduling
//!
//! SIP does not provide audio while an outgoing call is ringing, so the service plays a
//! local tone instead: first after `initial_delay`, then every `period`.
//!
//! Timer ticks are not acted on by the timer task itself. Each tick is sent back into the
//! session engine as a [`RingbackTick`], so the tone is played from the serialized event
//! loop. Ticks carry the generation of the timer that produced them; ticks of a cancelled
//! timer that are still queued are recognised and dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RingbackConfig;
use crate::error::{EngineError, ServiceError, ServiceResult};

/// Locally generated tones
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    /// Supervisory dial tone used as ringback
    Ringback,
}

/// Plays local tones on the device
pub trait TonePlayer: Send + Sync {
    fn play(&self, tone: Tone, duration: Duration) -> Result<(), EngineError>;
}

/// Tone player for hosts without a tone generator
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentTonePlayer;

impl TonePlayer for SilentTonePlayer {
    fn play(&self, tone: Tone, duration: Duration) -> Result<(), EngineError> {
        tracing::trace!("Skipping {:?} tone of {:?}", tone, duration);
        Ok(())
    }
}

/// A tick of a running ringback timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingbackTick {
    pub generation: u64,
}

/// Starts ringback timers whose ticks feed the session engine
#[derive(Debug)]
pub struct RingbackScheduler {
    config: RingbackConfig,
    ticks: mpsc::UnboundedSender<RingbackTick>,
    next_generation: AtomicU64,
}

impl RingbackScheduler {
    /// Fails when the ringback period is zero
    pub fn new(
        config: RingbackConfig,
        ticks: mpsc::UnboundedSender<RingbackTick>,
    ) -> ServiceResult<Self> {
        if config.period.is_zero() {
            return Err(ServiceError::config("ringback period must be greater than 0"));
        }
        Ok(Self {
            config,
            ticks,
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &RingbackConfig {
        &self.config
    }

    /// Spawn a new repeating timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> RingbackTimer {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let ticks = self.ticks.clone();
        let first = Instant::now() + self.config.initial_delay;
        let period = self.config.period;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if ticks.send(RingbackTick { generation }).is_err() {
                    break;
                }
            }
        });

        RingbackTimer { generation, task }
    }
}

/// Handle of a running ringback timer
///
/// Dropping the handle cancels the timer.
#[derive(Debug)]
pub struct RingbackTimer {
    generation: u64,
    task: JoinHandle<()>,
}

impl RingbackTimer {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cancel(self) {
        // Drop does the abort
    }
}

impl Drop for RingbackTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
