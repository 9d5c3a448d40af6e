//! Lightweight counters for the membership core.
//!
//! All counters are lock-free atomics; they exist for operator
//! visibility and for assertions in tests, not for control flow.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics instance for the Murmur core.
pub static METRICS: Metrics = Metrics::new();

/// Counters tracked by the core.
#[derive(Debug)]
pub struct Metrics {
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    messages_rebroadcast: AtomicU64,
    events_delivered: AtomicU64,
    queries_served: AtomicU64,
    query_duplicates: AtomicU64,
    query_responses_dropped: AtomicU64,
    coordinate_rejections: AtomicU64,
    member_flaps: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_rebroadcast: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            queries_served: AtomicU64::new(0),
            query_duplicates: AtomicU64::new(0),
            query_responses_dropped: AtomicU64::new(0),
            coordinate_rejections: AtomicU64::new(0),
            member_flaps: AtomicU64::new(0),
        }
    }

    counter!(incr_messages_received, messages_received_total, messages_received);
    counter!(incr_messages_dropped, messages_dropped_total, messages_dropped);
    counter!(
        incr_messages_rebroadcast,
        messages_rebroadcast_total,
        messages_rebroadcast
    );
    counter!(incr_events_delivered, events_delivered_total, events_delivered);
    counter!(incr_queries_served, queries_served_total, queries_served);
    counter!(incr_query_duplicates, query_duplicates_total, query_duplicates);
    counter!(
        incr_query_responses_dropped,
        query_responses_dropped_total,
        query_responses_dropped
    );
    counter!(
        incr_coordinate_rejections,
        coordinate_rejections_total,
        coordinate_rejections
    );
    counter!(incr_member_flaps, member_flaps_total, member_flaps);
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr_messages_received();
        metrics.incr_messages_received();
        metrics.incr_member_flaps();
        assert_eq!(metrics.messages_received_total(), 2);
        assert_eq!(metrics.member_flaps_total(), 1);
        assert_eq!(metrics.messages_dropped_total(), 0);
    }
}
