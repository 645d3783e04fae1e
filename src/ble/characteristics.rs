//! GATT characteristic operation tracking.
//!
//! A link tracks at most one outstanding operation per [`OpKind`]. Every
//! call gets an [`OpTicket`] carrying the characteristic UUID and a
//! link-wide sequence number. Platform completions only carry the UUID, so
//! they are matched by UUID into the slot, and a waiter only accepts an
//! outcome from the slot while the slot still carries its own sequence
//! number. A call that overwrites the slot therefore makes the earlier
//! waiter fail with [`Error::Superseded`](crate::Error::Superseded) instead
//! of stealing its completion.

use tracing::{debug, trace};
use uuid::Uuid;

/// Kind of confirmed characteristic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Descriptor write (subscription changes).
    Descriptor,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Descriptor => write!(f, "descriptor write"),
        }
    }
}

/// Subscription mode written to the client characteristic configuration descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionMode {
    /// Unacknowledged notifications.
    Notification,
    /// Acknowledged indications.
    Indication,
    /// No pushes.
    Disabled,
}

impl SubscriptionMode {
    /// Build the mode from the `enable` / `use_indication` pair.
    pub fn from_flags(enable: bool, use_indication: bool) -> Self {
        match (enable, use_indication) {
            (false, _) => Self::Disabled,
            (true, true) => Self::Indication,
            (true, false) => Self::Notification,
        }
    }

    /// Descriptor value for this mode.
    pub fn cccd_value(&self) -> [u8; 2] {
        match self {
            Self::Notification => [0x01, 0x00],
            Self::Indication => [0x02, 0x00],
            Self::Disabled => [0x00, 0x00],
        }
    }

    /// Whether pushes are enabled.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

/// Result reported by the platform for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum OpOutcome {
    /// Successful read with its value.
    Value(Vec<u8>),
    /// Successful write.
    Done,
    /// The platform reported failure.
    Failed,
}

/// Identifies one call's claim on a tracking slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OpTicket {
    pub kind: OpKind,
    pub uuid: Uuid,
    pub seq: u64,
}

/// What a waiter sees when it checks its ticket.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TicketState {
    Pending,
    Ready(OpOutcome),
    Superseded,
}

#[derive(Debug)]
struct PendingOp {
    uuid: Uuid,
    seq: u64,
    outcome: Option<OpOutcome>,
}

/// Per-link tracking slots.
#[derive(Debug, Default)]
pub(crate) struct OpTracker {
    next_seq: u64,
    read: Option<PendingOp>,
    write: Option<PendingOp>,
    descriptor: Option<PendingOp>,
}

impl OpTracker {
    fn slot(&mut self, kind: OpKind) -> &mut Option<PendingOp> {
        match kind {
            OpKind::Read => &mut self.read,
            OpKind::Write => &mut self.write,
            OpKind::Descriptor => &mut self.descriptor,
        }
    }

    /// Claim the slot for `kind`, replacing whatever was tracked there.
    pub fn begin(&mut self, kind: OpKind, uuid: Uuid) -> OpTicket {
        self.next_seq += 1;
        let seq = self.next_seq;

        let slot = self.slot(kind);
        if let Some(previous) = slot.as_ref() {
            if previous.outcome.is_none() {
                debug!(
                    "{} on {} (seq {}) supersedes pending seq {} on {}",
                    kind, uuid, seq, previous.seq, previous.uuid
                );
            }
        }
        *slot = Some(PendingOp {
            uuid,
            seq,
            outcome: None,
        });

        OpTicket { kind, uuid, seq }
    }

    /// Record a platform completion. Returns whether it matched a pending op.
    pub fn complete(&mut self, kind: OpKind, uuid: Uuid, outcome: OpOutcome) -> bool {
        match self.slot(kind) {
            Some(op) if op.uuid == uuid && op.outcome.is_none() => {
                trace!("{} completion for {} (seq {})", kind, uuid, op.seq);
                op.outcome = Some(outcome);
                true
            }
            _ => {
                trace!("Unmatched {} completion for {}", kind, uuid);
                false
            }
        }
    }

    /// Check a ticket, consuming the outcome when it is ready.
    pub fn poll(&mut self, ticket: &OpTicket) -> TicketState {
        let slot = self.slot(ticket.kind);
        match slot {
            Some(op) if op.seq == ticket.seq => match op.outcome.take() {
                Some(outcome) => {
                    *slot = None;
                    TicketState::Ready(outcome)
                }
                None => TicketState::Pending,
            },
            _ => TicketState::Superseded,
        }
    }

    /// Drop a ticket's claim if it still owns the slot.
    pub fn release(&mut self, ticket: &OpTicket) {
        let slot = self.slot(ticket.kind);
        if slot.as_ref().map(|op| op.seq) == Some(ticket.seq) {
            *slot = None;
        }
    }

    /// Forget every pending operation.
    pub fn clear(&mut self) {
        self.read = None;
        self.write = None;
        self.descriptor = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::*;

    #[test]
    fn test_subscription_mode_values() {
        assert_eq!(SubscriptionMode::from_flags(true, true).cccd_value(), [0x02, 0x00]);
        assert_eq!(SubscriptionMode::from_flags(true, false).cccd_value(), [0x01, 0x00]);
        assert_eq!(SubscriptionMode::from_flags(false, true).cccd_value(), [0x00, 0x00]);
        assert!(!SubscriptionMode::Disabled.is_enabled());
        assert!(SubscriptionMode::Indication.is_enabled());
    }

    #[test]
    fn test_ticket_completes() {
        let mut tracker = OpTracker::default();
        let ticket = tracker.begin(OpKind::Read, CONTROL_CHARACTERISTIC_UUID);
        assert_eq!(tracker.poll(&ticket), TicketState::Pending);

        assert!(tracker.complete(
            OpKind::Read,
            CONTROL_CHARACTERISTIC_UUID,
            OpOutcome::Value(vec![1, 0])
        ));
        assert_eq!(
            tracker.poll(&ticket),
            TicketState::Ready(OpOutcome::Value(vec![1, 0]))
        );
    }

    #[test]
    fn test_completion_for_other_uuid_is_ignored() {
        let mut tracker = OpTracker::default();
        let ticket = tracker.begin(OpKind::Write, CONTROL_CHARACTERISTIC_UUID);
        assert!(!tracker.complete(
            OpKind::Write,
            WAVEFORM_CONTROL_CHARACTERISTIC_UUID,
            OpOutcome::Done
        ));
        assert_eq!(tracker.poll(&ticket), TicketState::Pending);
    }

    #[test]
    fn test_second_op_supersedes_first() {
        let mut tracker = OpTracker::default();
        let first = tracker.begin(OpKind::Read, CONTROL_CHARACTERISTIC_UUID);
        let second = tracker.begin(OpKind::Read, CONTROL_CHARACTERISTIC_UUID);
        assert!(second.seq > first.seq);

        tracker.complete(
            OpKind::Read,
            CONTROL_CHARACTERISTIC_UUID,
            OpOutcome::Value(vec![3]),
        );
        assert_eq!(tracker.poll(&first), TicketState::Superseded);
        assert_eq!(
            tracker.poll(&second),
            TicketState::Ready(OpOutcome::Value(vec![3]))
        );
    }

    #[test]
    fn test_kinds_are_independent() {
        let mut tracker = OpTracker::default();
        let read = tracker.begin(OpKind::Read, CONTROL_CHARACTERISTIC_UUID);
        let write = tracker.begin(OpKind::Write, CONTROL_CHARACTERISTIC_UUID);
        tracker.complete(OpKind::Write, CONTROL_CHARACTERISTIC_UUID, OpOutcome::Done);
        assert_eq!(tracker.poll(&read), TicketState::Pending);
        assert_eq!(tracker.poll(&write), TicketState::Ready(OpOutcome::Done));
    }

    #[test]
    fn test_release_only_own_slot() {
        let mut tracker = OpTracker::default();
        let first = tracker.begin(OpKind::Descriptor, WAVEFORM_READ_CHARACTERISTIC_UUID);
        let second = tracker.begin(OpKind::Descriptor, WAVEFORM_READ_CHARACTERISTIC_UUID);
        tracker.release(&first);
        assert_eq!(tracker.poll(&second), TicketState::Pending);
        tracker.release(&second);
        assert_eq!(tracker.poll(&second), TicketState::Superseded);
    }
}
