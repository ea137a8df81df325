// This file is part of Astarte.
//
// Copyright 2024 SECO Mind Srl
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Exponential backoff with jitter used to pace reconnections.

use std::time::Duration;

use rand::Rng;

/// Error for an invalid backoff configuration.
#[non_exhaustive]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffError {
    /// The multiplier must be greater than zero.
    #[error("backoff multiplier must be greater than 0")]
    Multiplier,
    /// The cutoff must be greater than zero and at least the multiplier.
    #[error("backoff cutoff must be greater or equal to the multiplier")]
    Cutoff,
}

/// Generator of exponentially increasing delays, bounded by a cutoff, with a
/// symmetric jitter of one multiplier around the nominal delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    mul: u32,
    cutoff: u32,
    prev: u32,
}

impl ExponentialBackoff {
    /// Creates a backoff generator with the given multiplier and cutoff, in
    /// milliseconds.
    pub fn new(mul: u32, cutoff: u32) -> Result<Self, BackoffError> {
        if mul == 0 {
            return Err(BackoffError::Multiplier);
        }

        if cutoff == 0 || cutoff < mul {
            return Err(BackoffError::Cutoff);
        }

        Ok(Self {
            mul,
            cutoff,
            prev: 0,
        })
    }

    /// Returns the next delay.
    ///
    /// The nominal delay starts from the multiplier and doubles on every
    /// call, saturating at the cutoff. The returned delay is drawn uniformly
    /// from the nominal delay plus or minus one multiplier.
    pub fn next_delay(&mut self) -> Duration {
        let base = if self.prev == 0 {
            self.mul
        } else if self.prev <= u32::MAX / 2 {
            self.prev * 2
        } else {
            u32::MAX - self.mul
        };

        let bounded = base.min(self.cutoff);
        self.prev = bounded;

        let low = bounded.saturating_sub(self.mul);
        let high = bounded.saturating_add(self.mul);

        let delay = rand::thread_rng().gen_range(low..=high);

        Duration::from_millis(delay.into())
    }

    /// Restarts the sequence, so the next delay is again about one
    /// multiplier.
    pub fn reset(&mut self) {
        self.prev = 0;
    }
}
