// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Property tests for channel ordering and capacity.

use proptest::prelude::*;
use weave_rt::{make_channel, make_ref, Scheduler, SchedulerConfig, TrySendError};

fn sched(seed: u64) -> Scheduler {
    Scheduler::with_config(SchedulerConfig::new().seed(seed))
}

/// Send `values` from one task and receive them from another.
fn transfer(seed: u64, capacity: usize, values: Vec<u32>) -> Vec<u32> {
    let sched = sched(seed);
    let ch = make_channel::<u32>(capacity);
    let received = make_ref(Vec::new());

    let tx = ch.clone();
    sched
        .spawn(async move {
            for v in values {
                tx.send(v).await.unwrap();
            }
            tx.close().unwrap();
        })
        .unwrap();
    let sink = received.clone();
    sched
        .spawn(async move {
            while let Some(v) = ch.recv().await {
                sink.write(|out| out.push(v));
            }
        })
        .unwrap();

    sched.run().unwrap();
    received.take()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn rendezvous_preserves_send_order(
        seed in any::<u64>(),
        values in prop::collection::vec(any::<u32>(), 0..40),
    ) {
        prop_assert_eq!(transfer(seed, 0, values.clone()), values);
    }

    #[test]
    fn buffered_preserves_send_order(
        seed in any::<u64>(),
        capacity in 1usize..8,
        values in prop::collection::vec(any::<u32>(), 0..40),
    ) {
        prop_assert_eq!(transfer(seed, capacity, values.clone()), values);
    }

    #[test]
    fn buffer_accepts_exactly_capacity(capacity in 0usize..10, extra in 1usize..5) {
        let ch = make_channel::<usize>(capacity);
        for i in 0..capacity {
            prop_assert!(ch.try_send(i).is_ok());
        }
        for i in 0..extra {
            prop_assert_eq!(ch.try_send(i), Err(TrySendError::Full(i)));
        }
        prop_assert_eq!(ch.len(), capacity);
        for i in 0..capacity {
            prop_assert_eq!(ch.try_recv(), Ok(i));
        }
        prop_assert!(ch.is_empty());
    }

    #[test]
    fn parked_senders_complete_in_fifo_order(
        seed in any::<u64>(),
        capacity in 0usize..4,
        senders in 1usize..6,
    ) {
        let sched = sched(seed);
        let ch = make_channel::<usize>(capacity);
        for id in 0..senders {
            let tx = ch.clone();
            sched
                .spawn(async move { tx.send(id).await.unwrap() })
                .unwrap();
        }
        let received = make_ref(Vec::new());
        let sink = received.clone();
        sched
            .spawn(async move {
                for _ in 0..senders {
                    if let Some(v) = ch.recv().await {
                        sink.write(|out| out.push(v));
                    }
                }
            })
            .unwrap();
        sched.run().unwrap();
        prop_assert_eq!(received.take(), (0..senders).collect::<Vec<_>>());
    }
}
