/*
 * Copyright (C) 2024 The Sandboxd Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::sandboxd::config::ControllerConfig;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

/// Per-key capped exponential backoff: `initial * 2^failures`, clamped to `max`.
pub struct Backoff<K> {
    initial: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> Backoff<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.backoff_initial, config.backoff_max)
    }

    /// Records a failure for `key` and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|p| p.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = (*count).min(20);
        *count = count.saturating_add(1);
        self.initial
            .checked_mul(1u32 << exponent)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }

    pub fn reset(&self, key: &K) {
        self.failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped_and_reset() {
        let backoff = Backoff::new(Duration::from_millis(200), Duration::from_millis(1000));
        let key = "pool";
        let delays: Vec<u128> = (0..5)
            .map(|_| backoff.next_delay(&key).as_millis())
            .collect();
        assert_eq!(delays, vec![200, 400, 800, 1000, 1000]);

        backoff.reset(&key);
        assert_eq!(backoff.next_delay(&key), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(&"other"), Duration::from_millis(200));
    }
}
