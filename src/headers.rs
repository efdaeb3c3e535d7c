//! Rate-limit header vocabulary
//!
//! Parsing and emission for the structured headers the gateway understands:
//! - `X-RateLimit-Group`: names the group whose counters a response describes
//! - `X-RateLimit-Limit`: `[<burst> ] <n>;w=<period> (, <n>;w=<period>)*`
//!   with period in {1, 60, 3600, 86400} seconds
//! - `Retry-After`: delay-seconds or an HTTP-date
//!
//! Parsers are lenient at the boundary: a malformed header yields `None` and
//! the caller drops it with a debug trace. Header trouble never fails a
//! request.

use chrono::{DateTime, Utc};
use http::HeaderMap;

use crate::interval::Interval;

/// Names the rate-limit group a response's counters apply to.
pub const RATE_LIMIT_GROUP: &str = "x-ratelimit-group";

/// Structured quota announcement.
pub const RATE_LIMIT_LIMIT: &str = "x-ratelimit-limit";

pub const RETRY_AFTER: &str = "retry-after";

pub const LOCATION: &str = "location";

/// Burst quota assumed when the limit header carries no leading integer.
pub const DEFAULT_BURST_QUOTA: u32 = 10;

/// Parsed form of an `X-RateLimit-Limit` value.
///
/// `windows` preserves the order pairs appeared on the wire so that parsing
/// and re-emitting a value yields the same quota tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSpec {
    /// Leading bare integer, when present.
    pub burst: Option<u32>,
    /// `(interval, quota)` pairs in wire order.
    pub windows: Vec<(Interval, u32)>,
}

impl LimitSpec {
    /// Parses a header value. Returns `None` when the value does not conform
    /// to the grammar; partial garbage is rejected rather than guessed at.
    pub fn parse(value: &str) -> Option<LimitSpec> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }

        let mut burst = None;
        let mut windows = Vec::new();

        for (i, chunk) in value.split(',').enumerate() {
            let chunk = chunk.trim();
            if chunk.is_empty() {
                return None;
            }

            let mut tokens = chunk.split_whitespace();
            let first = tokens.next()?;
            let second = tokens.next();
            if tokens.next().is_some() {
                return None;
            }

            match second {
                // "<burst> <n>;w=<p>" is only legal as the leading chunk.
                Some(pair) => {
                    if i != 0 {
                        return None;
                    }
                    burst = Some(first.parse().ok()?);
                    windows.push(Self::parse_pair(pair)?);
                }
                None => {
                    if first.contains(';') {
                        windows.push(Self::parse_pair(first)?);
                    } else if i == 0 {
                        // A bare integer alone announces only the burst quota.
                        burst = Some(first.parse().ok()?);
                    } else {
                        return None;
                    }
                }
            }
        }

        if burst.is_none() && windows.is_empty() {
            return None;
        }

        Some(LimitSpec { burst, windows })
    }

    fn parse_pair(pair: &str) -> Option<(Interval, u32)> {
        let (count, window) = pair.split_once(';')?;
        let count = count.trim().parse().ok()?;
        let period = window.trim().strip_prefix("w=")?.parse().ok()?;
        let interval = Interval::from_window_period(period)?;
        Some((interval, count))
    }

    /// Re-emits the wire form. Parsing the result yields an equal spec.
    pub fn emit(&self) -> String {
        let pairs: Vec<String> = self
            .windows
            .iter()
            .filter_map(|(interval, count)| {
                interval
                    .window_period()
                    .map(|period| format!("{count};w={period}"))
            })
            .collect();

        match (self.burst, pairs.is_empty()) {
            (Some(burst), true) => burst.to_string(),
            (Some(burst), false) => format!("{burst} {}", pairs.join(", ")),
            (None, _) => pairs.join(", "),
        }
    }

    /// Effective burst quota, applying the default when none was announced.
    pub fn burst_quota(&self) -> u32 {
        self.burst.unwrap_or(DEFAULT_BURST_QUOTA)
    }
}

/// Extracts the group name a response's counters apply to.
pub fn group_name(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(RATE_LIMIT_GROUP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Extracts and parses the limit announcement, if any.
pub fn limit_spec(headers: &HeaderMap) -> Option<LimitSpec> {
    headers
        .get(RATE_LIMIT_LIMIT)
        .and_then(|v| v.to_str().ok())
        .and_then(LimitSpec::parse)
}

/// Parses a `Retry-After` value into milliseconds.
///
/// Accepts delay-seconds or an HTTP-date; a date in the past yields zero.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds.saturating_mul(1_000));
    }

    let when = DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&Utc) - Utc::now();
    Some(delta.num_milliseconds().max(0) as u64)
}

/// Extracts and parses `Retry-After` from a header map.
pub fn retry_after_ms(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after)
}
