//! Conflict Resolution
//!
//! Last-writer-wins over the hybrid logical clock, with the origin
//! server id as the final tie-break. Both apply paths (pulling from a
//! peer and receiving a push) run incoming records through the same
//! rule, so any two nodes seeing the same set of changes converge on
//! the same winner no matter the arrival order. Losing a conflict is
//! not an error: the loser is kept in the ledger as history.

use crate::clock::HlcStamp;
use crate::ledger::ChangeRecord;

/// Outcome of weighing an incoming record against local history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Incoming record is the newest writer; apply it
    Apply,
    /// A newer write is already known; record the incoming one as
    /// history without touching the application store
    Suppress { winner_origin: String },
}

impl Resolution {
    pub fn is_apply(&self) -> bool {
        matches!(self, Resolution::Apply)
    }
}

/// Weigh an incoming record against the newest stamp already recorded
/// for its (table, key). `latest` is None when the key has no history.
pub fn resolve(incoming: &ChangeRecord, latest: Option<(HlcStamp, String)>) -> Resolution {
    match latest {
        None => Resolution::Apply,
        Some((stamp, origin)) => {
            let incoming_key = (incoming.stamp(), incoming.origin_server_id.as_str());
            let existing_key = (stamp, origin.as_str());
            if incoming_key > existing_key {
                Resolution::Apply
            } else {
                Resolution::Suppress {
                    winner_origin: origin,
                }
            }
        }
    }
}
