//! The call session state machine
//!
//! A [`CallSession`] represents the one call the service manages. It is owned and mutated
//! exclusively by the session engine.
//!
//! # State machine
//!
//! ```text
//!          inbound offer                 placeCall
//!   Idle ───────────────► Offered   Idle ──────────► Dialing
//!                            │                          │
//!                            └──── provisional ─────────┴──► Early
//!                                                              │
//!              any non-terminal state ── engine CONNECTED ──► Connected ◄──► OnHold
//!                                                                  (hold toggle)
//!
//!   any state ── engine DISCONNECTED / INVALID / local hangup ──► Disconnected
//! ```
//!
//! The ringback timer lives on the session. It runs only for an outgoing call that is in
//! `Early` without bound media; [`CallSession::sync_ringback`] enforces that after every
//! transition.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::{CallHandle, MediaHandle};
use crate::ringback::{RingbackScheduler, RingbackTimer};

/// Direction of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Inbound call ringing locally, not answered yet
    Offered,
    /// Outbound call waiting for the remote side
    Dialing,
    /// Provisional response received
    Early,
    Connected,
    OnHold,
    /// Terminal
    Disconnected,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// States in which DTMF and microphone commands are accepted
    pub fn accepts_media_commands(&self) -> bool {
        matches!(self, Self::Connected | Self::OnHold)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Offered => "OFFERED",
            Self::Dialing => "DIALING",
            Self::Early => "EARLY",
            Self::Connected => "CONNECTED",
            Self::OnHold => "ON_HOLD",
            Self::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Engine primitive a hold toggle has to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldAction {
    /// Put the call on hold
    Hold,
    /// Re-invite with the unhold flag
    Resume,
}

/// One live call
#[derive(Debug)]
pub struct CallSession {
    pub handle: CallHandle,
    pub direction: CallDirection,
    pub peer_number: String,
    pub peer_display_name: Option<String>,
    state: CallState,
    on_hold: bool,
    media: Option<MediaHandle>,
    answered: bool,
    ringback: Option<RingbackTimer>,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Session for an inbound offer
    pub fn offered(
        handle: CallHandle,
        peer_number: impl Into<String>,
        peer_display_name: Option<String>,
    ) -> Self {
        Self::new(handle, CallDirection::Incoming, CallState::Offered, peer_number.into(), peer_display_name)
    }

    /// Session for an outbound dial request the engine accepted
    pub fn dialing(
        handle: CallHandle,
        peer_number: impl Into<String>,
        peer_display_name: Option<String>,
    ) -> Self {
        Self::new(handle, CallDirection::Outgoing, CallState::Dialing, peer_number.into(), peer_display_name)
    }

    fn new(
        handle: CallHandle,
        direction: CallDirection,
        state: CallState,
        peer_number: String,
        peer_display_name: Option<String>,
    ) -> Self {
        Self {
            handle,
            direction,
            peer_number,
            peer_display_name,
            state,
            on_hold: false,
            media: None,
            answered: false,
            ringback: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_on_hold(&self) -> bool {
        self.on_hold
    }

    pub fn media_bound(&self) -> bool {
        self.media.is_some()
    }

    pub fn media(&self) -> Option<MediaHandle> {
        self.media
    }

    pub fn ringback_active(&self) -> bool {
        self.ringback.is_some()
    }

    /// Whether a tick of the given timer generation belongs to this call's live timer
    pub fn owns_ringback_tick(&self, generation: u64) -> bool {
        self.ringback
            .as_ref()
            .map_or(false, |timer| timer.generation() == generation)
    }

    /// Whether the user may still answer this call
    pub fn can_answer(&self) -> bool {
        self.direction == CallDirection::Incoming
            && !self.answered
            && matches!(self.state, CallState::Offered | CallState::Early)
    }

    pub fn mark_answered(&mut self) {
        self.answered = true;
    }

    /// Provisional response; returns `true` when the state changed
    pub fn enter_early(&mut self) -> bool {
        match self.state {
            CallState::Offered | CallState::Dialing => {
                self.state = CallState::Early;
                true
            }
            _ => false,
        }
    }

    /// Call confirmed; returns `true` only for the first confirmation
    pub fn mark_connected(&mut self) -> bool {
        match self.state {
            CallState::Offered | CallState::Dialing | CallState::Early => {
                self.state = CallState::Connected;
                self.connected_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn bind_media(&mut self, media: MediaHandle) {
        self.media = Some(media);
    }

    pub fn unbind_media(&mut self) {
        self.media = None;
    }

    /// Flip the local hold flag and return the primitive matching the previous flag
    ///
    /// The flag is flipped whether or not the engine primitive later succeeds.
    pub fn toggle_hold(&mut self) -> Option<HoldAction> {
        let action = match self.state {
            CallState::Connected => HoldAction::Hold,
            CallState::OnHold => HoldAction::Resume,
            _ => return None,
        };
        self.on_hold = !self.on_hold;
        self.state = if self.on_hold {
            CallState::OnHold
        } else {
            CallState::Connected
        };
        Some(action)
    }

    /// Move to the terminal state and release the ringback timer
    pub fn mark_disconnected(&mut self) {
        self.state = CallState::Disconnected;
        self.stop_ringback();
    }

    /// Whether the ringback tone should currently be playing
    ///
    /// Only an outgoing call in `Early` without bound media qualifies. A `Dialing` call has
    /// no provisional response yet, and an `Offered` call rings through the host, not a tone.
    pub fn wants_ringback(&self) -> bool {
        self.direction == CallDirection::Outgoing
            && self.state == CallState::Early
            && !self.media_bound()
    }

    /// Start or stop the ringback timer so it matches [`wants_ringback`](Self::wants_ringback)
    pub fn sync_ringback(&mut self, scheduler: &RingbackScheduler) {
        if self.wants_ringback() {
            if self.ringback.is_none() {
                tracing::debug!("Starting ringback for {}", self.handle);
                self.ringback = Some(scheduler.start());
            }
        } else {
            self.stop_ringback();
        }
    }

    fn stop_ringback(&mut self) {
        if let Some(timer) = self.ringback.take() {
            tracing::debug!("Stopping ringback for {}", self.handle);
            timer.cancel();
        }
    }
}
