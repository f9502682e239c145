use std::time::Duration;

use crate::client::BucketClient;
use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod client;
mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // GRIDBUCKET_STORAGE=memory cargo run --release
    let base_url =
        std::env::var("BUCKET_URL").unwrap_or_else(|_| "http://127.0.0.1:3000".into());
    let remote = BucketClient::new(base_url);

    let workloads = vec![
        Workload::builder("small files")
            .concurrency(32)
            .size_distribution(16 * 1024, 1024 * 1024) // p50 = 16K, p99 = 1M
            .action_weights(90, 8, 2)
            .build()?,
        Workload::builder("large files")
            .concurrency(4)
            .size_distribution(4 * 1024 * 1024, 32 * 1024 * 1024)
            .action_weights(50, 40, 10)
            .build()?,
    ];

    perform_stresstest(remote, workloads, Duration::from_secs(10)).await
}
