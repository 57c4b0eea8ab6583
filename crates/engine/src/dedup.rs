// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;

use weft_protocol::{DedupInformation, DedupSource};
use weft_types::identifiers::MessageIndex;

/// Tracks the highest sequence number observed per producer. Hosts deliver
/// at-least-once; a message whose sequence number does not advance past the
/// recorded one is a duplicate and must not be applied again.
#[derive(Debug, Default)]
pub struct DedupTable {
    last_applied: HashMap<DedupSource, MessageIndex>,
}

impl DedupTable {
    pub fn entries(&self) -> Vec<(DedupSource, MessageIndex)> {
        let mut entries: Vec<_> = self
            .last_applied
            .iter()
            .map(|(producer, seq)| (producer.clone(), *seq))
            .collect();
        entries.sort();
        entries
    }

    pub fn from_entries(entries: Vec<(DedupSource, MessageIndex)>) -> Self {
        DedupTable {
            last_applied: entries.into_iter().collect(),
        }
    }

    /// Returns true if the message is fresh and records it; false if it is a
    /// duplicate.
    pub fn observe(&mut self, dedup: &DedupInformation) -> bool {
        match self.last_applied.get(&dedup.producer) {
            Some(last) if dedup.sequence_number <= *last => false,
            _ => {
                self.last_applied
                    .insert(dedup.producer.clone(), dedup.sequence_number);
                true
            }
        }
    }
}
