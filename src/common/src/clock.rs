/*
 * Compute user accounts resolution for cloud VM guests
 * Copyright (C) David Mulder <dmulder@samba.org> 2025
 *
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use futures::FutureExt;

/// Time source for the resolver. All time arithmetic in the caching core
/// goes through this trait so tests can substitute both the current time and
/// the periodic timer.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> SystemTime;
    /// A future that resolves exactly once, after the given delay.
    fn after(&self, delay: Duration) -> BoxFuture<'static, ()>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }

    fn after(&self, delay: Duration) -> BoxFuture<'static, ()> {
        tokio::time::sleep(delay).boxed()
    }
}

/// Whether `now` falls outside the window `[start, start + span]`.
///
/// `UNIX_EPOCH` is the "never happened" timestamp; it is outside any finite
/// window ending in the past, which is what forces initial fetches. A span
/// too large to represent pins the window end at infinity.
pub fn outside_timespan(now: SystemTime, start: SystemTime, span: Duration) -> bool {
    match start.checked_add(span) {
        Some(end) => now < start || now > end,
        None => now < start,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_timespan() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        let span = Duration::from_secs(10);

        assert!(outside_timespan(start - Duration::from_secs(1), start, span));
        assert!(!outside_timespan(start, start, span));
        assert!(!outside_timespan(start + Duration::from_secs(10), start, span));
        assert!(outside_timespan(
            start + Duration::from_secs(11),
            start,
            span
        ));
    }

    #[test]
    fn test_epoch_start_is_always_stale() {
        // A zero timestamp must force a refresh no matter the span.
        assert!(outside_timespan(
            SystemTime::now(),
            SystemTime::UNIX_EPOCH,
            Duration::from_secs(3600)
        ));
    }

    #[test]
    fn test_unrepresentable_span_never_expires() {
        assert!(!outside_timespan(
            SystemTime::now(),
            SystemTime::UNIX_EPOCH,
            Duration::MAX
        ));
    }
}
