//! Two forked processes move 100000 integers through one queue.
//!
//! Kept in its own test binary so both children are forked from a harness
//! with no other tests running.

#![cfg(unix)]

use std::time::Duration;

use anyhow::{ensure, Context as _};
use hyperprocess_common::{Context, Process, StartMethod};
use hyperprocess_queue::Queue;

const ITEMS: u64 = 100_000;

#[test]
fn producer_and_consumer_processes_preserve_order() {
    let ctx = Context::with_start_method(StartMethod::Fork);
    let queue: Queue<u64> = Queue::new(&ctx, 1000).unwrap();

    let consumer_queue = queue.clone();
    let mut consumer = Process::new(&ctx, "consumer", move || {
        for expected in 0..ITEMS {
            let item = consumer_queue
                .get(true, Some(Duration::from_secs(30)))
                .with_context(|| format!("waiting for item {expected}"))?;
            ensure!(item == expected, "expected {expected}, got {item}");
        }
        ensure!(
            consumer_queue.get(false, None).is_err(),
            "queue should be drained"
        );
        Ok(())
    });

    let producer_queue = queue.clone();
    let mut producer = Process::new(&ctx, "producer", move || {
        for i in 0..ITEMS {
            producer_queue.put(i, true, Some(Duration::from_secs(30)))?;
        }
        producer_queue.close();
        producer_queue.join_thread()?;
        Ok(())
    });

    consumer.start().unwrap();
    producer.start().unwrap();

    producer.join(Some(Duration::from_secs(120))).unwrap();
    consumer.join(Some(Duration::from_secs(120))).unwrap();

    assert_eq!(producer.exitcode(), Some(0), "producer failed");
    assert_eq!(consumer.exitcode(), Some(0), "consumer lost, duplicated or reordered items");
    assert_eq!(queue.qsize(), 0);
}
