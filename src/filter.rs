use crate::types::{Confidence, ScanReport};

/// Drop every row whose confidence is below `min`.
pub fn by_confidence(mut rows: Vec<ScanReport>, min: Confidence) -> Vec<ScanReport> {
    rows.retain(|r| r.confidence >= min);
    rows
}
