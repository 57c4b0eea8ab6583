// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Arbitrary typed option blocks keyed by type, e.g. engine options or
/// application-specific knobs. Filled at build time, read-only afterwards.
#[derive(Default)]
pub struct ConfigRegistry {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ConfigRegistry {
    pub fn set<T: Any + Send + Sync>(&mut self, options: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(options));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.downcast_ref())
    }

    /// Returns the registered block, or a default if none was attached.
    pub fn get_or_default<T: Any + Send + Sync + Default + Clone>(&self) -> T {
        self.get::<T>().cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct Knobs {
        verbosity: u8,
    }

    #[test]
    fn set_get() {
        let mut registry = ConfigRegistry::default();
        registry.set(Knobs { verbosity: 3 });
        assert_eq!(registry.get::<Knobs>(), Some(&Knobs { verbosity: 3 }));
    }

    #[test]
    fn missing_block_falls_back_to_default() {
        let registry = ConfigRegistry::default();
        assert_eq!(registry.get_or_default::<Knobs>(), Knobs::default());
    }
}
