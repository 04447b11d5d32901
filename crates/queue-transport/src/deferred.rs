//! Routing of outgoing messages, including deferred delivery.
//!
//! A message sent to [`DEFERRED_MESSAGES_ADDRESS`] is redirected to the queue
//! named by its deferred-recipient header. When native deferral is enabled
//! its deferred-until header becomes an initial invisibility delay on the
//! enqueue; otherwise the header is left for an external deferral mechanism.

use crate::error::{ConfigurationError, TransportError, ValidationError};
use crate::message::{headers, Headers, QueueName, Timestamp, TransportMessage};
use chrono::Duration;
use tracing::warn;

#[cfg(test)]
#[path = "deferred_tests.rs"]
mod tests;

/// Reserved destination for messages whose delivery is deferred
pub const DEFERRED_MESSAGES_ADDRESS: &str = "___deferred___";

/// A message waiting in a transaction for its commit
#[derive(Debug, Clone)]
pub struct OutgoingEnvelope {
    pub destination: QueueName,
    pub message: TransportMessage,
}

/// Resolve the real destination of an outgoing message.
///
/// Messages for the deferred address must carry both deferral headers; the
/// recipient header is removed from the routed copy.
pub fn route(destination: &str, message: TransportMessage) -> Result<OutgoingEnvelope, TransportError> {
    if destination.is_empty() {
        return Err(ValidationError::Required {
            field: "destination".to_string(),
        }
        .into());
    }

    if destination != DEFERRED_MESSAGES_ADDRESS {
        return Ok(OutgoingEnvelope {
            destination: destination.parse()?,
            message,
        });
    }

    let message_id = message.message_id().unwrap_or("<unknown>").to_string();
    let (mut hdrs, body) = message.into_parts();

    let recipient = hdrs.remove(headers::DEFERRED_RECIPIENT).ok_or_else(|| {
        ConfigurationError::Invalid {
            message: format!(
                "Cannot defer message with ID {}: the '{}' header is missing",
                message_id,
                headers::DEFERRED_RECIPIENT
            ),
        }
    })?;

    if !hdrs.contains_key(headers::DEFERRED_UNTIL) {
        return Err(ConfigurationError::Invalid {
            message: format!(
                "Cannot defer message with ID {}: the '{}' header is missing",
                message_id,
                headers::DEFERRED_UNTIL
            ),
        }
        .into());
    }

    Ok(OutgoingEnvelope {
        destination: recipient.parse()?,
        message: TransportMessage::new(hdrs, body),
    })
}

/// Compute the initial invisibility delay of an outgoing message.
///
/// With native deferral the deferred-until header is consumed and turned
/// into `deferred_until - now`; a due time in the past means no delay.
pub fn visibility_delay(
    hdrs: &mut Headers,
    native_deferral: bool,
    now: Timestamp,
) -> Result<Option<Duration>, TransportError> {
    if !native_deferral {
        return Ok(None);
    }

    let Some(value) = hdrs.remove(headers::DEFERRED_UNTIL) else {
        return Ok(None);
    };

    let due: Timestamp = value.parse().map_err(|e| {
        ConfigurationError::Parsing {
            message: format!(
                "'{}' header value '{}' is not an ISO-8601 timestamp: {}",
                headers::DEFERRED_UNTIL,
                value,
                e
            ),
        }
    })?;

    let delay = due.duration_since(&now);
    Ok((delay > Duration::zero()).then_some(delay))
}

/// Read the time-to-live of an outgoing message from its headers.
///
/// Only an unparsable value is an error; zero or negative spans mean no expiry.
pub fn time_to_live(hdrs: &Headers) -> Result<Option<Duration>, TransportError> {
    let Some(value) = hdrs.get(headers::TIME_TO_BE_RECEIVED) else {
        return Ok(None);
    };

    let ttl = parse_time_span(value)?;
    if ttl <= Duration::zero() {
        warn!(
            header = headers::TIME_TO_BE_RECEIVED,
            value = %value,
            "Ignoring non-positive time-to-be-received; message will not expire"
        );
        return Ok(None);
    }
    Ok(Some(ttl))
}

/// Parse a time span in `[-]d`, `[-][d.]hh:mm` or `[-][d.]hh:mm:ss[.fffffff]` form
pub fn parse_time_span(value: &str) -> Result<Duration, ValidationError> {
    let invalid = || ValidationError::InvalidFormat {
        field: headers::TIME_TO_BE_RECEIVED.to_string(),
        message: format!("'{}' is not a valid time span", value),
    };

    let trimmed = value.trim();
    let (negative, rest) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let span = if rest.contains(':') {
        let (days, clock) = match rest.split_once('.') {
            Some((days, clock)) if !days.contains(':') => (time_span_component(days, i64::MAX)?, clock),
            _ => (0, rest),
        };

        let parts: Vec<&str> = clock.split(':').collect();
        let (hours, minutes, seconds) = match parts.as_slice() {
            [h, m] => (*h, *m, None),
            [h, m, s] => (*h, *m, Some(*s)),
            _ => return Err(invalid()),
        };

        let mut span = Duration::days(days.min(10_675_199))
            + Duration::hours(time_span_component(hours, 23)?)
            + Duration::minutes(time_span_component(minutes, 59)?);

        if let Some(seconds) = seconds {
            let (whole, fraction) = match seconds.split_once('.') {
                Some((whole, fraction)) => (whole, Some(fraction)),
                None => (seconds, None),
            };
            span = span + Duration::seconds(time_span_component(whole, 59)?);

            if let Some(fraction) = fraction {
                if fraction.is_empty() || fraction.len() > 7 {
                    return Err(invalid());
                }
                let digits = time_span_component(fraction, 9_999_999)?;
                let nanos = digits * 10_i64.pow(9 - fraction.len() as u32);
                span = span + Duration::nanoseconds(nanos);
            }
        }
        span
    } else {
        Duration::days(time_span_component(rest, 10_675_199)?)
    };

    Ok(if negative { -span } else { span })
}

fn time_span_component(text: &str, max: i64) -> Result<i64, ValidationError> {
    let parsed = if !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit()) {
        text.parse::<i64>().ok()
    } else {
        None
    };
    parsed
        .filter(|n| *n <= max)
        .ok_or_else(|| ValidationError::InvalidFormat {
            field: headers::TIME_TO_BE_RECEIVED.to_string(),
            message: format!("'{}' is not a valid time span component", text),
        })
}
