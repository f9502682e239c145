use std::io;
use std::thread::available_parallelism;

use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::weighted::WeightedIndex;
use rand_distr::{Distribution, LogNormal, Zipf};

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub name: &'static str,
    pub concurrency: usize,
    pub seed: u64,

    pub p50_size: u64,
    pub p99_size: u64,

    pub write_weight: u8,
    pub read_weight: u8,
    pub delete_weight: u8,
}

pub struct WorkloadBuilder {
    config: WorkloadConfig,
}

impl WorkloadBuilder {
    #[allow(dead_code)]
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn size_distribution(mut self, p50: u64, p99: u64) -> Self {
        self.config.p50_size = p50;
        self.config.p99_size = p99;
        self
    }

    pub fn action_weights(mut self, writes: u8, reads: u8, deletes: u8) -> Self {
        self.config.write_weight = writes;
        self.config.read_weight = reads;
        self.config.delete_weight = deletes;
        self
    }

    pub fn build(self) -> Result<Workload> {
        let config = self.config;
        let rng = SmallRng::seed_from_u64(config.seed);

        // Inspired by <https://stats.stackexchange.com/a/649432>
        let p50 = config.p50_size as f64;
        let p99 = config.p99_size as f64;
        let mu = p50.ln();
        let sigma = (p99.ln() - mu) / 2.3263;

        let size_distribution = LogNormal::new(mu, sigma)?;
        let action_distribution = WeightedIndex::new([
            config.write_weight,
            config.read_weight,
            config.delete_weight,
        ])?;

        Ok(Workload {
            config,
            rng,
            size_distribution,
            action_distribution,
            existing_files: Default::default(),
        })
    }
}

pub struct Workload {
    pub config: WorkloadConfig,

    /// The RNG driving all our distributions.
    rng: SmallRng,
    /// A distribution that generates payload sizes for the `write` action.
    size_distribution: LogNormal<f64>,
    /// A distribution that generates actions, such as write/read/delete.
    action_distribution: WeightedIndex<u8>,

    /// All the written files that we can then read or delete.
    existing_files: Vec<(InternalId, ExternalId)>,
}

impl Workload {
    pub fn builder(name: &'static str) -> WorkloadBuilder {
        WorkloadBuilder {
            config: WorkloadConfig {
                name,
                concurrency: available_parallelism().map_or(4, |n| n.get()),
                seed: rand::random(),

                p50_size: 16 * 1024,
                p99_size: 1024 * 1024,

                write_weight: 33,
                read_weight: 33,
                delete_weight: 33,
            },
        }
    }

    fn get_payload(&self, seed: u64) -> Payload {
        let mut rng = SmallRng::seed_from_u64(seed);
        let len = self.size_distribution.sample(&mut rng) as u64;

        Payload { len, rng }
    }

    fn sample_readback(&mut self) -> Option<(InternalId, ExternalId)> {
        let len = self.existing_files.len();
        let zipf = Zipf::new(len as f64, 2.0).ok()?;
        // favor the most recently written files
        let idx = len - (self.rng.sample(zipf) as usize).clamp(1, len);

        Some(self.existing_files.remove(idx))
    }

    pub fn next_action(&mut self) -> Action {
        loop {
            match self.action_distribution.sample(&mut self.rng) {
                0 => {
                    let seed = self.rng.next_u64();
                    let payload = self.get_payload(seed);
                    return Action::Write(InternalId(seed), payload);
                }
                // with nothing written yet, fall back to another roll
                1 => {
                    let Some((internal, external)) = self.sample_readback() else {
                        continue;
                    };
                    let payload = self.get_payload(internal.0);
                    return Action::Read(internal, external, payload);
                }
                _ => {
                    let Some((_internal, external)) = self.sample_readback() else {
                        continue;
                    };
                    return Action::Delete(external);
                }
            }
        }
    }

    /// Adds a file to the internal store, so it can be yielded for reads or deletes.
    ///
    /// This has to be called once a write or read has completed.
    /// Files currently being read are never deleted concurrently.
    pub fn push_file(&mut self, internal: InternalId, external: ExternalId) {
        self.existing_files.push((internal, external))
    }
}

#[derive(Debug, Eq, Hash, PartialEq)]
pub struct InternalId(u64);

impl InternalId {
    pub fn filename(&self) -> String {
        format!("stress-{:016x}.bin", self.0)
    }
}

pub type ExternalId = String;

pub enum Action {
    Write(InternalId, Payload),
    Read(InternalId, ExternalId, Payload),
    Delete(ExternalId),
}

pub struct Payload {
    pub len: u64,
    pub rng: SmallRng,
}

impl io::Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len_to_fill = (buf.len() as u64).min(self.len) as usize;

        let fill_buf = &mut buf[..len_to_fill];
        self.rng.fill_bytes(fill_buf);

        self.len -= len_to_fill as u64;
        Ok(len_to_fill)
    }
}
