use std::time::Duration;

use anyhow::{Context as _, Result};
use hyperprocess_common::{Context, Process};
use hyperprocess_queue::{JoinableQueue, Queue, QueueError};
use serde::{Deserialize, Serialize};
use tracing::info;

const WORKERS: usize = 3;
const JOBS: u64 = 30;

#[derive(Debug, Serialize, Deserialize)]
enum Job {
    Square(u64),
    Stop,
}

/// Fans jobs out to worker processes and collects their results
fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("=== hyperprocess Pipeline Example ===");

    let ctx = Context::from_env().context("Invalid configuration")?;
    println!("Start method: {}", ctx.start_method);

    let jobs: JoinableQueue<Job> = JoinableQueue::new(&ctx, 8)?;
    let results: Queue<(u64, u64)> = Queue::new(&ctx, 0)?;

    let mut workers = Vec::new();
    for n in 0..WORKERS {
        let jobs = jobs.clone();
        let results = results.clone();
        let forked = ctx.start_method.is_multiprocess();
        let mut worker = Process::new(&ctx, format!("worker-{n}"), move || {
            loop {
                let job = jobs.get(true, None)?;
                jobs.task_done()?;
                match job {
                    Job::Square(x) => results.put((x, x * x), true, None)?,
                    Job::Stop => break,
                }
            }
            // Forked workers exit without destructors; flush explicitly
            if forked {
                results.close();
                results.join_thread()?;
            }
            Ok(())
        });
        worker.start()?;
        workers.push(worker);
    }

    for x in 0..JOBS {
        jobs.put(Job::Square(x), true, None)?;
    }
    for _ in 0..WORKERS {
        jobs.put(Job::Stop, true, None)?;
    }

    jobs.join();
    info!("All jobs processed");

    let mut total = 0;
    for _ in 0..JOBS {
        match results.get(true, Some(Duration::from_secs(10))) {
            Ok((x, square)) => {
                println!("  {x}^2 = {square}");
                total += square;
            }
            Err(QueueError::Empty) => anyhow::bail!("a worker stopped producing results"),
            Err(e) => return Err(e.into()),
        }
    }
    println!("Sum of squares: {total}");

    for worker in &mut workers {
        worker.join(Some(Duration::from_secs(10)))?;
    }

    jobs.close();
    jobs.join_thread()?;
    println!("✓ Pipeline completed");
    Ok(())
}
