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

use crate::sandboxd::observability::tracing;
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
#[cfg(not(test))]
use std::io::{self, Write};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

const SERVICE_NAME: &str = "sandboxd";

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogFormat {
    Text = 0,
    Json = 1,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

static LOG_FORMAT: AtomicU8 = AtomicU8::new(LogFormat::Text as u8);
static MIN_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Debug as u8);

pub fn set_log_format(format: LogFormat) {
    LOG_FORMAT.store(format as u8, Ordering::Relaxed);
}

pub fn current_log_format() -> LogFormat {
    match LOG_FORMAT.load(Ordering::Relaxed) {
        1 => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    #[cfg_attr(test, allow(dead_code))]
    fn is_stderr(self) -> bool {
        matches!(self, LogLevel::Warn | LogLevel::Error)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Lines below `level` are dropped.
pub fn set_min_level(level: LogLevel) {
    MIN_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn min_level() -> LogLevel {
    LogLevel::from_u8(MIN_LEVEL.load(Ordering::Relaxed))
}

fn encode_field_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value.chars().any(|c| {
            c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '[' | ']' | '{' | '}' | ',')
        });

    if !needs_quotes {
        return value.to_string();
    }

    let mut encoded = String::with_capacity(value.len() + 2);
    encoded.push('"');
    for ch in value.chars() {
        match ch {
            '"' => encoded.push_str("\\\""),
            '\\' => encoded.push_str("\\\\"),
            '\n' => encoded.push_str("\\n"),
            '\r' => encoded.push_str("\\r"),
            '\t' => encoded.push_str("\\t"),
            _ => encoded.push(ch),
        }
    }
    encoded.push('"');
    encoded
}

fn push_field(buffer: &mut String, key: &str, value: &str) {
    if !buffer.is_empty() {
        buffer.push(' ');
    }
    buffer.push_str(key);
    buffer.push('=');
    buffer.push_str(&encode_field_value(value));
}

fn render_text(level: LogLevel, component: &str, message: &str, fields: &[(&str, &str)]) -> String {
    let mut line = String::new();
    push_field(
        &mut line,
        "ts",
        &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
    push_field(&mut line, "level", level.as_str());
    push_field(&mut line, "service", SERVICE_NAME);
    push_field(&mut line, "component", component);
    push_field(&mut line, "msg", message);
    if let Some(ctx) = tracing::current_context() {
        push_field(&mut line, "trace_id", ctx.trace_id());
        push_field(&mut line, "span_id", ctx.span_id());
    }
    for (key, value) in fields.iter().filter(|(key, _)| !key.is_empty()) {
        push_field(&mut line, key, value);
    }
    line
}

fn render_json(level: LogLevel, component: &str, message: &str, fields: &[(&str, &str)]) -> String {
    let mut payload = serde_json::Map::new();
    payload.insert(
        "ts".into(),
        Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    payload.insert("level".into(), Value::String(level.as_str().to_string()));
    payload.insert("service".into(), Value::String(SERVICE_NAME.to_string()));
    payload.insert("component".into(), Value::String(component.to_string()));
    payload.insert("msg".into(), Value::String(message.to_string()));
    if let Some(ctx) = tracing::current_context() {
        payload.insert("trace_id".into(), Value::String(ctx.trace_id().to_string()));
        payload.insert("span_id".into(), Value::String(ctx.span_id().to_string()));
    }
    for (key, value) in fields.iter().filter(|(key, _)| !key.is_empty()) {
        payload.insert((*key).to_string(), Value::String((*value).to_string()));
    }
    Value::Object(payload).to_string()
}

pub fn log_event(level: LogLevel, component: &str, message: &str, fields: &[(&str, &str)]) {
    if level < min_level() {
        return;
    }
    let line = match current_log_format() {
        LogFormat::Text => render_text(level, component, message, fields),
        LogFormat::Json => render_json(level, component, message, fields),
    };
    write_line(level, &line);
}

pub fn log_debug(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Debug, component, message, fields);
}

pub fn log_info(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Info, component, message, fields);
}

pub fn log_warn(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Warn, component, message, fields);
}

pub fn log_error(component: &str, message: &str, fields: &[(&str, &str)]) {
    log_event(LogLevel::Error, component, message, fields);
}

#[cfg(not(test))]
fn write_line(level: LogLevel, line: &str) {
    let write_result = if level.is_stderr() {
        let mut stderr = io::stderr().lock();
        writeln!(stderr, "{}", line)
    } else {
        let mut stdout = io::stdout().lock();
        writeln!(stdout, "{}", line)
    };

    if let Err(error) = write_result {
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "sandboxd: failed to write log line: {error} (original: {line})");
    }
}

#[cfg(test)]
fn write_line(level: LogLevel, line: &str) {
    let mut guard = test_log_store().lock().unwrap_or_else(|p| p.into_inner());
    guard.push((level, line.to_string()));
}

#[cfg(test)]
fn test_log_store() -> &'static Mutex<Vec<(LogLevel, String)>> {
    static STORE: OnceLock<Mutex<Vec<(LogLevel, String)>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(Vec::new()))
}

/// Drains captured lines emitted by `component`. Other components' lines stay.
#[cfg(test)]
pub(crate) fn take_test_logs(component: &str) -> Vec<(LogLevel, String)> {
    let mut guard = test_log_store().lock().unwrap_or_else(|p| p.into_inner());
    let needle_text = format!("component={}", encode_field_value(component));
    let needle_json = format!("\"component\":\"{component}\"");
    let (taken, kept): (Vec<_>, Vec<_>) = guard
        .drain(..)
        .partition(|(_, line)| line.contains(&needle_text) || line.contains(&needle_json));
    *guard = kept;
    taken
}
