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

use std::env;
use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Supported configuration parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Config {
    MetricsAddress,
    ResyncSeconds,
    ReadyTimeoutSeconds,
    BackoffInitialMillis,
    BackoffMaxMillis,
    Workers,
    MaxAdoptionAttempts,
    LogFormat,
    LogLevel,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::MetricsAddress => "SANDBOXD_METRICS_ADDRESS",
            Config::ResyncSeconds => "SANDBOXD_RESYNC_SECONDS",
            Config::ReadyTimeoutSeconds => "SANDBOXD_READY_TIMEOUT_SECONDS",
            Config::BackoffInitialMillis => "SANDBOXD_BACKOFF_INITIAL_MS",
            Config::BackoffMaxMillis => "SANDBOXD_BACKOFF_MAX_MS",
            Config::Workers => "SANDBOXD_WORKERS",
            Config::MaxAdoptionAttempts => "SANDBOXD_MAX_ADOPTION_ATTEMPTS",
            Config::LogFormat => "SANDBOXD_LOG_FORMAT",
            Config::LogLevel => "SANDBOXD_LOG_LEVEL",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            Config::MetricsAddress => "0.0.0.0:8080",
            Config::ResyncSeconds => "30",
            // Matches the largest startup latency bucket.
            Config::ReadyTimeoutSeconds => "240",
            Config::BackoffInitialMillis => "200",
            Config::BackoffMaxMillis => "10000",
            Config::Workers => "4",
            Config::MaxAdoptionAttempts => "5",
            Config::LogFormat => "text",
            Config::LogLevel => "info",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get(&self) -> String {
        env::var(self.env_var())
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.default_value().to_string())
    }

    pub fn parse<T>(&self) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let raw = self.get();
        raw.trim().parse::<T>().map_err(|err| ConfigError {
            variable: self.env_var(),
            value: raw.clone(),
            reason: err.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid value '{}' for {}: {}",
            self.value, self.variable, self.reason
        )
    }
}

impl Error for ConfigError {}

/// Tunables shared by the controllers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub resync_interval: Duration,
    /// Window a bound sandbox has to become ready before the claim fails.
    pub ready_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub workers: usize,
    pub max_adoption_attempts: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            ready_timeout: Duration::from_secs(240),
            backoff_initial: Duration::from_millis(200),
            backoff_max: Duration::from_millis(10_000),
            workers: 4,
            max_adoption_attempts: 5,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            resync_interval: Duration::from_secs(Config::ResyncSeconds.parse()?),
            ready_timeout: Duration::from_secs(Config::ReadyTimeoutSeconds.parse()?),
            backoff_initial: Duration::from_millis(Config::BackoffInitialMillis.parse()?),
            backoff_max: Duration::from_millis(Config::BackoffMaxMillis.parse()?),
            workers: Config::Workers.parse()?,
            max_adoption_attempts: Config::MaxAdoptionAttempts.parse()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError {
                variable: Config::Workers.env_var(),
                value: "0".into(),
                reason: "at least one worker is required".into(),
            });
        }
        if self.backoff_initial > self.backoff_max {
            return Err(ConfigError {
                variable: Config::BackoffInitialMillis.env_var(),
                value: self.backoff_initial.as_millis().to_string(),
                reason: "initial backoff exceeds the maximum".into(),
            });
        }
        Ok(())
    }
}
