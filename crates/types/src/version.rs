// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

/// Version number of a declared entity. Entities marked replaced-by carry the
/// version in which the replacement was introduced; snapshots and messages
/// written by older versions are migrated on deserialization.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    derive_more::From,
    derive_more::Into,
    derive_more::Display,
    derive_more::Debug,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
#[serde(transparent)]
#[display("v{}", _0)]
#[debug("v{}", _0)]
pub struct EntityVersion(u32);

impl EntityVersion {
    pub const INITIAL: EntityVersion = EntityVersion(1);

    pub const fn new(version: u32) -> Self {
        EntityVersion(version)
    }

    pub fn next(self) -> Self {
        EntityVersion(self.0 + 1)
    }
}

impl Default for EntityVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}
