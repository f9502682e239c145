use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytesize::ByteSize;
use parking_lot::Mutex;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::client::BucketClient;
use crate::workload::{Action, Workload, WorkloadConfig};

struct WorkloadStats {
    config: WorkloadConfig,
    task_durations: DDSketch,
    failures: u64,
}

pub async fn perform_stresstest(
    remote: BucketClient,
    workloads: Vec<Workload>,
    duration: Duration,
) -> Result<()> {
    let remote = Arc::new(remote);
    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| tokio::spawn(run_workload(Arc::clone(&remote), workload, duration)))
        .collect();

    let finished_tasks = futures_util::future::join_all(tasks).await;

    let mut total_failures = 0;
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let stats = task??;
        let config = &stats.config;
        total_failures += stats.failures;

        let ops = stats.task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "# Workload {i}: {} (concurrency: {})",
            config.name, config.concurrency
        );
        println!(
            "  file sizes {}-{}",
            ByteSize::b(config.p50_size),
            ByteSize::b(config.p99_size)
        );
        println!("=> {ops} operations, {ops_ps:.2} ops/s, {} failed", stats.failures);

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = stats.task_durations.quantile(q).ok().flatten();
            Duration::from_secs_f64(secs.unwrap_or_default())
        };
        let avg = Duration::from_secs_f64(stats.task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    if total_failures > 0 {
        anyhow::bail!("{total_failures} operations failed");
    }
    Ok(())
}

async fn run_workload(
    remote: Arc<BucketClient>,
    workload: Workload,
    duration: Duration,
) -> Result<WorkloadStats> {
    let concurrency = workload.config.concurrency;
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let deadline = tokio::time::Instant::now() + duration;

    let workload = Arc::new(Mutex::new(workload));
    let task_durations = Arc::new(Mutex::new(DDSketch::default()));
    let failures = Arc::new(AtomicU64::new(0));

    // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
    let sleep = tokio::time::sleep_until(deadline);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                let permit = permit?;
                let workload = Arc::clone(&workload);
                let remote = Arc::clone(&remote);
                let task_durations = Arc::clone(&task_durations);
                let failures = Arc::clone(&failures);

                tokio::spawn(async move {
                    let task_start = Instant::now();
                    let action = workload.lock().next_action();
                    let result = match action {
                        Action::Write(internal_id, payload) => {
                            remote
                                .write(internal_id.filename(), payload)
                                .await
                                .map(|external_id| workload.lock().push_file(internal_id, external_id))
                        }
                        Action::Read(internal_id, external_id, payload) => {
                            let result = remote.read(&external_id, payload).await;
                            workload.lock().push_file(internal_id, external_id);
                            result
                        }
                        Action::Delete(external_id) => remote.delete(&external_id).await,
                    };

                    match result {
                        Ok(()) => task_durations.lock().add(task_start.elapsed().as_secs_f64()),
                        Err(err) => {
                            eprintln!("operation failed: {err:#}");
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }

                    drop(permit);
                });
            }
            _ = &mut sleep => {
                break;
            }
        }
    }

    // by acquiring *all* the permits, we essentially wait for all outstanding tasks to finish
    let _permits = semaphore.acquire_many(concurrency as u32).await?;

    let task_durations = std::mem::take(&mut *task_durations.lock());
    let config = workload.lock().config.clone();

    Ok(WorkloadStats {
        config,
        task_durations,
        failures: failures.load(Ordering::Relaxed),
    })
}
