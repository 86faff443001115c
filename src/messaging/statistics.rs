use std::sync::atomic::{AtomicU64, Ordering};


macro_rules! statistics {
    ($($counter:ident),* $(,)?) => {
        /// Counters for everything the messaging core does internally. They are the only way
        ///  retries, duplicates, rejections etc. become visible to the outside.
        #[derive(Default, Debug)]
        pub struct MessagingStatistics {
            $(pub $counter: AtomicU64,)*
        }

        /// A point-in-time copy of [MessagingStatistics]. Counters are read individually, so a
        ///  snapshot taken under load is not guaranteed to be consistent across counters.
        #[derive(Default, Debug, Clone, Eq, PartialEq)]
        pub struct StatisticsSnapshot {
            $(pub $counter: u64,)*
        }

        impl MessagingStatistics {
            pub fn snapshot(&self) -> StatisticsSnapshot {
                StatisticsSnapshot {
                    $($counter: self.$counter.load(Ordering::Relaxed),)*
                }
            }
        }
    }
}

statistics!(
    received_normal,
    received_ack,
    received_nack,
    received_heartbeat,
    invalid,
    duplicates,
    delivered,
    delivery_failures,
    rejected,
    dropped,
    unexpected_acks,
    duplicate_acks,
    ack_anomalies,
    messages_sent,
    retransmissions,
    send_successes,
    send_failures,
    send_cancellations,
    heartbeats_sent,
    send_errors,
);

pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
