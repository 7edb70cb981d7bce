//! Mapping from raw probe counters to a status category.

use crate::types::{Classification, ProbeStatus, Severity};

/// Classify a probe from its packet counters.
///
/// Total over the input domain. A reply count above `sent` (duplicate replies)
/// is treated like a full answer.
pub fn classify(sent: u32, received: u32, hops_complete: bool) -> Classification {
    let (status, severity) = if received == 0 {
        (ProbeStatus::NoResponse, Severity::High)
    } else if received < sent || !hops_complete {
        (ProbeStatus::PartialLoss, Severity::Medium)
    } else {
        (ProbeStatus::Success, Severity::Ok)
    };

    Classification { status, severity }
}
