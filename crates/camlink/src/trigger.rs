//! Correlates 3A state changes with the triggers that caused them.
//!
//! At most one trigger of each kind is pending. Issuing a new trigger
//! replaces the previous one, and state changes tagged with a replaced id
//! resolve nothing.

use camlink_device::{
    metadata::{AeState, AfState, FrameMetadata},
    request::{CaptureRequest, RequestId, TriggerId},
};
use smallvec::SmallVec;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    AutoFocus,
    Precapture,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTrigger {
    pub id: TriggerId,
    pub kind: TriggerKind,
    /// Request that carried the trigger.
    pub issued_at: RequestId,
    /// One-shot submitted once the trigger resolves.
    pub follow_up: Option<CaptureRequest>,
}

/// What a resolved trigger produced.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    AutoFocus {
        trigger_id: TriggerId,
        focused: bool,
    },
    Precapture {
        trigger_id: TriggerId,
        settled: bool,
        follow_up: Option<CaptureRequest>,
    },
}

/// Pending autofocus and precapture triggers.
///
/// # Example
/// ```rust
/// use camlink::prelude::*;
///
/// let mut tracker = TriggerTracker::default();
/// let first = tracker.next_id();
/// tracker.issue(TriggerKind::AutoFocus, first, RequestId(4000), None);
/// let second = tracker.next_id();
/// tracker.issue(TriggerKind::AutoFocus, second, RequestId(4001), None);
///
/// // the superseded trigger resolves nothing
/// assert!(tracker.resolve_af(AfState::FocusedLocked, first).is_none());
/// assert!(tracker.resolve_af(AfState::FocusedLocked, second).is_some());
/// ```
#[derive(Debug, Default)]
pub struct TriggerTracker {
    last_id: i32,
    af: Option<PendingTrigger>,
    precapture: Option<PendingTrigger>,
}

impl TriggerTracker {
    /// Allocate a fresh trigger id; ids are positive and never reused
    /// until they wrap.
    pub fn next_id(&mut self) -> TriggerId {
        self.last_id = if self.last_id == i32::MAX {
            1
        } else {
            self.last_id + 1
        };
        TriggerId(self.last_id)
    }

    /// Record a trigger, replacing any pending one of the same kind.
    pub fn issue(
        &mut self,
        kind: TriggerKind,
        id: TriggerId,
        issued_at: RequestId,
        follow_up: Option<CaptureRequest>,
    ) {
        let trigger = PendingTrigger {
            id,
            kind,
            issued_at,
            follow_up,
        };
        if let Some(previous) = self.slot(kind).replace(trigger) {
            debug!(?kind, superseded = previous.id.0, by = id.0, "trigger superseded");
        }
    }

    /// Drop the pending trigger of `kind`.
    pub fn cancel(&mut self, kind: TriggerKind) -> Option<PendingTrigger> {
        self.slot(kind).take()
    }

    pub fn clear(&mut self) {
        self.af = None;
        self.precapture = None;
    }

    pub fn pending(&self, kind: TriggerKind) -> Option<&PendingTrigger> {
        match kind {
            TriggerKind::AutoFocus => self.af.as_ref(),
            TriggerKind::Precapture => self.precapture.as_ref(),
        }
    }

    /// Resolve the pending autofocus trigger once its scan has locked.
    pub fn resolve_af(&mut self, state: AfState, id: TriggerId) -> Option<TriggerOutcome> {
        if !state.is_locked() || self.af.as_ref()?.id != id {
            return None;
        }
        self.af.take();
        Some(TriggerOutcome::AutoFocus {
            trigger_id: id,
            focused: state == AfState::FocusedLocked,
        })
    }

    /// Resolve the pending precapture trigger once metering has settled.
    pub fn resolve_ae(&mut self, state: AeState, id: TriggerId) -> Option<TriggerOutcome> {
        if !state.is_settled() || self.precapture.as_ref()?.id != id {
            return None;
        }
        let pending = self.precapture.take()?;
        Some(TriggerOutcome::Precapture {
            trigger_id: id,
            settled: state != AeState::FlashRequired,
            follow_up: pending.follow_up,
        })
    }

    /// Resolve whatever the frame's 3A state settles.
    pub fn observe(&mut self, metadata: &FrameMetadata) -> SmallVec<[TriggerOutcome; 2]> {
        let mut outcomes = SmallVec::new();
        if let Some(outcome) = self.resolve_af(metadata.af_state, metadata.af_trigger_id) {
            outcomes.push(outcome);
        }
        if let Some(outcome) = self.resolve_ae(metadata.ae_state, metadata.ae_trigger_id) {
            outcomes.push(outcome);
        }
        outcomes
    }

    fn slot(&mut self, kind: TriggerKind) -> &mut Option<PendingTrigger> {
        match kind {
            TriggerKind::AutoFocus => &mut self.af,
            TriggerKind::Precapture => &mut self.precapture,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlocked_states_do_not_resolve() {
        let mut tracker = TriggerTracker::default();
        let id = tracker.next_id();
        tracker.issue(TriggerKind::AutoFocus, id, RequestId(4000), None);
        assert!(tracker.resolve_af(AfState::ActiveScan, id).is_none());
        assert_eq!(
            tracker.resolve_af(AfState::NotFocusedLocked, id),
            Some(TriggerOutcome::AutoFocus {
                trigger_id: id,
                focused: false
            })
        );
        // resolved exactly once
        assert!(tracker.resolve_af(AfState::NotFocusedLocked, id).is_none());
    }

    #[test]
    fn observe_resolves_each_kind_once() {
        let mut tracker = TriggerTracker::default();
        let af = tracker.next_id();
        let ae = tracker.next_id();
        tracker.issue(TriggerKind::AutoFocus, af, RequestId(4000), None);
        tracker.issue(TriggerKind::Precapture, ae, RequestId(4001), None);
        let metadata = FrameMetadata {
            af_state: AfState::FocusedLocked,
            af_trigger_id: af,
            ae_state: AeState::Converged,
            ae_trigger_id: ae,
            ..FrameMetadata::default()
        };
        assert_eq!(tracker.observe(&metadata).len(), 2);
        assert!(tracker.observe(&metadata).is_empty());
    }

    #[test]
    fn cancel_silences_late_results() {
        let mut tracker = TriggerTracker::default();
        let id = tracker.next_id();
        tracker.issue(TriggerKind::Precapture, id, RequestId(4000), None);
        assert!(tracker.cancel(TriggerKind::Precapture).is_some());
        assert!(tracker.resolve_ae(AeState::Converged, id).is_none());
    }

    #[test]
    fn ids_wrap_to_one() {
        let mut tracker = TriggerTracker {
            last_id: i32::MAX,
            ..TriggerTracker::default()
        };
        assert_eq!(tracker.next_id(), TriggerId(1));
    }
}
