use std::{
    collections::{BTreeMap, HashMap},
    thread,
    time::{Duration, Instant},
};

use hyperprocess_common::{Codec, Context, StartMethod};
use hyperprocess_queue::{JoinableQueue, Queue, QueueError, SimpleQueue};
use serde::{Deserialize, Serialize};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn ctx() -> Context {
    Context::with_start_method(StartMethod::Thread)
}

#[test]
fn items_come_out_in_put_order() {
    let queue: Queue<u32> = Queue::new(&ctx(), 8).unwrap();
    let producer = queue.clone();

    let handle = thread::spawn(move || {
        for i in 0..500 {
            producer.put(i, true, WAIT).unwrap();
        }
    });

    for expected in 0..500 {
        assert_eq!(queue.get(true, WAIT).unwrap(), expected);
    }
    handle.join().unwrap();
    assert!(queue.empty());
}

#[test]
fn put_on_full_queue_fails_within_its_timeout() {
    let queue: Queue<String> = Queue::new(&ctx(), 1).unwrap();
    queue.put("only".to_string(), true, None).unwrap();
    assert!(queue.full());

    let start = Instant::now();
    let result = queue.put("extra".to_string(), true, Some(Duration::from_millis(100)));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(QueueError::Full)));
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
    assert!(matches!(queue.put_nowait("extra".to_string()), Err(QueueError::Full)));
}

#[test]
fn get_on_empty_queue_fails_after_its_timeout() {
    let queue: Queue<u8> = Queue::new(&ctx(), 0).unwrap();

    let start = Instant::now();
    let result = queue.get(true, Some(Duration::from_millis(100)));
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(QueueError::Empty)));
    assert!(elapsed >= Duration::from_millis(95));
    assert!(elapsed < Duration::from_secs(2));
    assert!(matches!(queue.get_nowait(), Err(QueueError::Empty)));
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Job {
    id:      u64,
    name:    String,
    params:  BTreeMap<String, Vec<Option<f64>>>,
    retries: (u8, bool),
}

#[test]
fn nested_values_round_trip_with_either_codec() {
    let mut params = BTreeMap::new();
    params.insert("weights".to_string(), vec![Some(0.5), None, Some(-2.0)]);
    params.insert("empty".to_string(), vec![]);
    let job = Job {
        id: 42,
        name: "résumé".to_string(),
        params,
        retries: (3, true),
    };

    for codec in [Codec::Bincode, Codec::Json] {
        let queue: Queue<Job> = Queue::new(&ctx().codec(codec), 0).unwrap();
        queue.put(job.clone(), true, None).unwrap();
        assert_eq!(queue.get(true, WAIT).unwrap(), job);
    }

    let queue: Queue<HashMap<String, Vec<(i32, String)>>> = Queue::new(&ctx(), 0).unwrap();
    let mut map = HashMap::new();
    map.insert("k".to_string(), vec![(1, "a".to_string()), (2, "b".to_string())]);
    queue.put(map.clone(), true, None).unwrap();
    assert_eq!(queue.get(true, WAIT).unwrap(), map);
}

#[test]
fn two_slot_queue_fills_and_drains() {
    let queue: Queue<i32> = Queue::new(&ctx(), 2).unwrap();
    assert_eq!(queue.maxsize(), 2);

    queue.put(1, true, None).unwrap();
    queue.put(2, true, None).unwrap();
    assert_eq!(queue.qsize(), 2);
    assert!(queue.full());

    assert_eq!(queue.get(true, WAIT).unwrap(), 1);
    assert_eq!(queue.get(true, WAIT).unwrap(), 2);
    assert!(queue.empty());
    assert_eq!(queue.qsize(), 0);
}

#[test]
fn joinable_queue_join_waits_for_every_task() {
    const N: usize = 25;
    let queue: JoinableQueue<usize> = JoinableQueue::new(&ctx(), 0).unwrap();
    for i in 0..N {
        queue.put(i, true, None).unwrap();
    }
    assert_eq!(queue.unfinished_tasks(), N);

    let worker = {
        let queue = queue.clone();
        thread::spawn(move || {
            for _ in 0..N {
                queue.get(true, WAIT).unwrap();
                queue.task_done().unwrap();
            }
        })
    };

    queue.join();
    worker.join().unwrap();
    assert_eq!(queue.unfinished_tasks(), 0);
    assert!(matches!(queue.task_done(), Err(QueueError::TaskDoneTooManyTimes)));
}

#[test]
fn join_thread_requires_close() {
    let queue: Queue<u8> = Queue::new(&ctx(), 0).unwrap();
    queue.put(1, true, None).unwrap();
    assert!(matches!(queue.join_thread(), Err(QueueError::NotClosed)));

    queue.close();
    queue.join_thread().unwrap();
    assert_eq!(queue.get(true, WAIT).unwrap(), 1);
}

#[test]
fn close_without_any_put_still_joins() {
    let queue: Queue<u8> = Queue::new(&ctx(), 3).unwrap();
    queue.close();
    assert!(queue.is_closed());
    queue.join_thread().unwrap();
    assert!(matches!(queue.put(1, false, None), Err(QueueError::Closed)));
}

#[test]
fn cancelled_join_lets_drop_return() {
    let queue: Queue<u8> = Queue::new(&ctx(), 0).unwrap();
    queue.put(7, true, None).unwrap();
    queue.cancel_join_thread();
    drop(queue);
}

#[test]
fn simple_queue_moves_items_between_threads() {
    let queue: SimpleQueue<String> = SimpleQueue::new(&ctx()).unwrap();
    let producer = queue.clone();

    let handle = thread::spawn(move || {
        for i in 0..50 {
            producer.put(format!("item-{i}")).unwrap();
        }
    });

    for i in 0..50 {
        assert_eq!(queue.get().unwrap(), format!("item-{i}"));
    }
    handle.join().unwrap();
    assert!(queue.empty().unwrap());
}

#[cfg(unix)]
#[test]
fn forked_queue_state_is_shared() {
    use hyperprocess_common::Process;

    let ctx = Context::with_start_method(StartMethod::Fork);
    let queue: JoinableQueue<String> = JoinableQueue::new(&ctx, 4).unwrap();

    let child_queue = queue.clone();
    let mut child = Process::new(&ctx, "worker", move || {
        child_queue.put("from child".to_string(), true, Some(Duration::from_secs(5)))?;
        child_queue.close();
        child_queue.join_thread()?;
        Ok(())
    });
    child.start().unwrap();
    child.join(Some(Duration::from_secs(10))).unwrap();
    assert_eq!(child.exitcode(), Some(0));

    assert_eq!(queue.qsize(), 1);
    assert_eq!(queue.unfinished_tasks(), 1);
    assert_eq!(queue.get(true, WAIT).unwrap(), "from child");
    queue.task_done().unwrap();
    assert!(queue.join_timeout(Duration::from_secs(1)));
}
