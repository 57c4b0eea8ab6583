// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This crate contains the core types used by the various weft components.

pub mod affinity;
pub mod config;
pub mod errors;
pub mod identifiers;
pub mod retries;
pub mod storage;
pub mod time;

mod version;

pub use version::EntityVersion;
