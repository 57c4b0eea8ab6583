// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Activities are retried on timeout. This module contains the types defining
//! the retry policies.

use std::cmp;
use std::time::Duration;

/// This struct represents the policy to execute retries.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(
    tag = "type",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case"
)]
pub enum RetryPolicy {
    /// No retry strategy: the first timeout is final.
    #[default]
    None,
    /// Retry with a fixed delay between attempts.
    FixedDelay {
        interval: Duration,
        /// Number of attempts, including the first. `None` retries forever.
        max_attempts: Option<u32>,
    },
    /// Retry with an exponentially growing delay between attempts.
    Exponential {
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<u32>,
        max_interval: Option<Duration>,
    },
}

impl RetryPolicy {
    pub fn fixed_delay(interval: Duration, max_attempts: Option<u32>) -> Self {
        RetryPolicy::FixedDelay {
            interval,
            max_attempts,
        }
    }

    pub fn exponential(
        initial_interval: Duration,
        factor: f32,
        max_attempts: Option<u32>,
        max_interval: Option<Duration>,
    ) -> Self {
        RetryPolicy::Exponential {
            initial_interval,
            factor,
            max_attempts,
            max_interval,
        }
    }

    pub fn max_attempts(&self) -> Option<u32> {
        match self {
            RetryPolicy::None => Some(1),
            RetryPolicy::FixedDelay { max_attempts, .. }
            | RetryPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn iter(&self) -> RetryIter {
        RetryIter {
            policy: self.clone(),
            attempts: 0,
            last_retry: None,
        }
    }
}

impl IntoIterator for RetryPolicy {
    type Item = Duration;
    type IntoIter = RetryIter;

    fn into_iter(self) -> Self::IntoIter {
        RetryIter {
            policy: self,
            attempts: 0,
            last_retry: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryIter {
    policy: RetryPolicy,
    attempts: u32,
    last_retry: Option<Duration>,
}

impl RetryIter {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Iterator for RetryIter {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempts += 1;
        match &self.policy {
            RetryPolicy::None => None,
            RetryPolicy::FixedDelay {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| self.attempts > max) {
                    None
                } else {
                    Some(*interval)
                }
            }
            RetryPolicy::Exponential {
                initial_interval,
                factor,
                max_attempts,
                max_interval,
            } => {
                if max_attempts.is_some_and(|max| self.attempts > max) {
                    return None;
                }
                let next = match self.last_retry {
                    Some(last) => {
                        let grown = last.mul_f32(*factor);
                        match max_interval {
                            Some(cap) => cmp::min(grown, *cap),
                            None => grown,
                        }
                    }
                    None => *initial_interval,
                };
                self.last_retry = Some(next);
                Some(next)
            }
        }
    }
}
