//! Descriptor-clustering simulation
//!
//! Every client holds a synthetic partition transformed by its group's
//! instruction. Each round the orchestrator asks all Encoding clients for
//! per-class descriptors, clusters them with mini-batch k-means (the model is
//! carried across rounds) and scores the labels against the groups. When
//! training is enabled, clients then train the model of their cluster and
//! the cluster models are averaged.

use anyhow::{bail, Context, Result};
use fedclust_ai::{GridStyleExtractor, Image, LinearModel, Model, ParameterVector, Tensor};
use fedclust_common::{ModelKind, SimulationConfig};
use fedclust_fl::{
    cluster_report, clustering_accuracy, descriptor_matrix, make_clusters, Client, ClientCore,
    DataSource, FlClient, ImageDataset, InMemoryPartitions, MiniBatchKMeans, RoundConfig,
    TimingLedger, TimingSummary, TASK_COMPUTE_LOW_DIM,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::trainer::SgdTrainer;

/// Run-time switches not carried by the YAML plan
#[derive(Debug, Clone, Default)]
pub struct SimOptions {
    /// Report the silhouette-optimal cluster count every round
    pub find_optimal: bool,
    /// Skip the per-cluster training rounds
    pub skip_training: bool,
    /// Overrides `client.seed`
    pub seed: Option<u64>,
}

/// Outcome of one descriptor round
#[derive(Debug, Clone)]
pub struct RoundSummary {
    /// Round number, starting at 1
    pub round: u64,
    /// Cluster label per client
    pub labels: Vec<usize>,
    /// Adjusted Rand Index against the client groups
    pub ari: f64,
    /// Silhouette-optimal cluster count, if requested
    pub optimal_clusters: Option<usize>,
    /// Mean validation accuracy after the training round
    pub mean_accuracy: Option<f32>,
}

/// Outcome of a whole simulation
#[derive(Debug)]
pub struct SimulationReport {
    /// One entry per round
    pub rounds: Vec<RoundSummary>,
    /// Cluster listing of the last round
    pub cluster_report: String,
    /// Descriptor and training times
    pub ledger: TimingLedger,
}

impl SimulationReport {
    /// Labels of the last round
    pub fn final_labels(&self) -> &[usize] {
        self.rounds
            .last()
            .map(|r| r.labels.as_slice())
            .unwrap_or_default()
    }

    /// ARI of the last round
    pub fn final_ari(&self) -> Option<f64> {
        self.rounds.last().map(|r| r.ari)
    }

    /// Averaged timings
    pub fn timings(&self) -> TimingSummary {
        self.ledger.summary()
    }
}

/// Synthetic sample: a bright vertical band whose position encodes the class
fn class_image<R: Rng + ?Sized>(
    config: &SimulationConfig,
    label: usize,
    rng: &mut R,
) -> Result<Image> {
    let spec = config.image;
    let n_classes = config.client.n_classes;
    let mut pixels = Vec::with_capacity(spec.flat_dim());
    for _y in 0..spec.height {
        for x in 0..spec.width {
            let lit = x * n_classes / spec.width.max(1) == label;
            for c in 0..spec.channels {
                let level: u8 = match (lit, c == label % spec.channels) {
                    (true, true) => 220,
                    (true, false) => 110,
                    (false, _) => 0,
                };
                pixels.push(level.saturating_add(rng.gen_range(0..40)));
            }
        }
    }
    Ok(Image::new(spec.width, spec.height, spec.channels, pixels)?)
}

fn dataset<R: Rng + ?Sized>(
    config: &SimulationConfig,
    len: usize,
    rng: &mut R,
) -> Result<ImageDataset> {
    let n_classes = config.client.n_classes;
    (0..len)
        .map(|i| Ok((class_image(config, i % n_classes, rng)?, i % n_classes)))
        .collect::<Result<Vec<_>>>()
        .map(|samples| samples.into_iter().collect())
}

/// One partition per client, numbered by client index
pub fn synthetic_partitions(config: &SimulationConfig, seed: u64) -> Result<InMemoryPartitions> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut partitions = InMemoryPartitions::new(seed);
    let n_val = (config.samples_per_client / 4).max(1);
    for _ in 0..config.n_clients() {
        let train = dataset(config, config.samples_per_client, &mut rng)?;
        let val = dataset(config, n_val, &mut rng)?;
        partitions.push(train, val);
    }
    debug!(
        "Generated {} partitions of {} + {} samples",
        partitions.len(),
        config.samples_per_client,
        n_val
    );
    Ok(partitions)
}

/// Sample-weighted mean of client parameters
pub fn weighted_average(updates: &[(ParameterVector, usize)]) -> Result<ParameterVector> {
    let total: usize = updates.iter().map(|(_, n)| n).sum();
    if total == 0 {
        bail!("no samples to aggregate");
    }
    let Some((first, _)) = updates.first() else {
        bail!("no updates to aggregate");
    };
    let mut sums: Vec<Vec<f32>> = first.tensors().iter().map(|t| vec![0.0; t.len()]).collect();
    for (params, n) in updates {
        if params.len() != sums.len() {
            bail!("expected {} tensors, got {}", sums.len(), params.len());
        }
        let factor = *n as f32 / total as f32;
        for (sum, tensor) in sums.iter_mut().zip(params.tensors()) {
            if sum.len() != tensor.len() {
                bail!("tensor of {} values, expected {}", tensor.len(), sum.len());
            }
            for (s, v) in sum.iter_mut().zip(tensor.data()) {
                *s += factor * v;
            }
        }
    }
    first
        .tensors()
        .iter()
        .zip(sums)
        .map(|(t, sum)| Ok(Tensor::new(sum, t.shape().clone())?))
        .collect::<Result<Vec<_>>>()
        .map(ParameterVector::new)
}

/// Simulated orchestrator with its clients
pub struct Simulation {
    config: SimulationConfig,
    options: SimOptions,
    truth: Vec<String>,
    clients: Vec<FlClient>,
    initial_params: ParameterVector,
}

impl Simulation {
    /// Builds the clients and their partitions
    pub fn new(config: SimulationConfig, options: SimOptions) -> Result<Self> {
        config.validate()?;
        let seed = options.seed.unwrap_or(config.client.seed);
        let partitions = synthetic_partitions(&config, seed)?;

        let flat_dim = config.image.flat_dim();
        let out_features = match config.client.model {
            ModelKind::Cnn => config.client.n_classes,
            ModelKind::Regression => 1,
        };
        let encoder_in = if config.client.grayscale_descriptors() {
            config.image.width * config.image.height
        } else {
            flat_dim
        };

        // Shared random projection, so every client embeds into the same space
        let mut rng = StdRng::seed_from_u64(seed);
        let encoder = LinearModel::random(encoder_in, config.client.z_dim, &mut rng)
            .with_name("encoder");
        let initial_params = LinearModel::random(flat_dim, out_features, &mut rng).get_parameters();

        let clients = (0..config.n_clients())
            .map(|i| {
                let args = config.client.clone().with_seed(seed + i as u64);
                let core = ClientCore::new(
                    args,
                    Box::new(LinearModel::new(flat_dim, out_features).with_name("classifier")),
                    Box::new(SgdTrainer::default()),
                    DataSource::Simulated(Box::new(partitions.clone())),
                )?;
                Ok(FlClient::encoding(
                    core,
                    Box::new(encoder.clone()),
                    Box::new(GridStyleExtractor),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            "Simulation: {} clients, {} groups, {} clusters, {} rounds",
            clients.len(),
            config.groups.len(),
            config.n_clusters,
            config.rounds
        );
        Ok(Self {
            truth: config.cluster_truth(),
            config,
            options,
            clients,
            initial_params,
        })
    }

    fn round_config(&self, round: u64, client: usize) -> RoundConfig {
        RoundConfig::new()
            .with_round(round)
            .with_partition(client as u64)
            .with_client_number(client as u64)
            .with_transform(self.truth[client].clone())
    }

    fn descriptor_round(&mut self, round: u64, ledger: &mut TimingLedger) -> Result<Vec<Vec<f32>>> {
        let mut descriptors = Vec::with_capacity(self.clients.len());
        for i in 0..self.clients.len() {
            let config = self.round_config(round, i).with_task(TASK_COMPUTE_LOW_DIM);
            let res = self.clients[i]
                .fit(ParameterVector::default(), &config)
                .with_context(|| format!("descriptor round failed on client {i}"))?;
            ledger.record_metadata(&res.metrics);
            let descriptor = res
                .parameters
                .into_tensors()
                .into_iter()
                .next()
                .map(Tensor::into_data)
                .context("client returned no descriptor")?;
            descriptors.push(descriptor);
        }
        Ok(descriptors)
    }

    fn training_round(
        &mut self,
        round: u64,
        labels: &[usize],
        cluster_params: &mut [ParameterVector],
        ledger: &mut TimingLedger,
    ) -> Result<f32> {
        let mut updates: Vec<Vec<(ParameterVector, usize)>> = vec![Vec::new(); cluster_params.len()];
        for (i, &k) in labels.iter().enumerate() {
            let mut config = self.round_config(round, i).with_cluster_id(k as u64);
            if let Some(t_comp) = ledger.client(i as u64).and_then(|t| t.mean_comp()) {
                config = config.with_t_comp(t_comp);
            }
            let res = self.clients[i]
                .fit(cluster_params[k].clone(), &config)
                .with_context(|| format!("training round failed on client {i}"))?;
            ledger.record_metadata(&res.metrics);
            updates[k].push((res.parameters, res.num_examples));
        }
        for (k, cluster_updates) in updates.iter().enumerate() {
            if !cluster_updates.is_empty() {
                cluster_params[k] = weighted_average(cluster_updates)?;
            }
        }

        let mut accuracy = 0.0;
        for (i, &k) in labels.iter().enumerate() {
            let config = self.round_config(round, i).with_cluster_id(k as u64);
            let res = self.clients[i].evaluate(cluster_params[k].clone(), &config)?;
            accuracy += res.metrics.get("accuracy").and_then(|v| v.as_f64()).unwrap_or(0.0);
        }
        Ok((accuracy / labels.len().max(1) as f64) as f32)
    }

    /// Runs every round and returns the scores
    pub fn run(&mut self) -> Result<SimulationReport> {
        let seed = self.options.seed.unwrap_or(self.config.client.seed);
        let n_clusters = self.config.n_clusters;
        let find_optimal = self.options.find_optimal || self.config.find_optimal;
        let mut ledger = TimingLedger::new();
        let mut kmeans: Option<MiniBatchKMeans> = None;
        let mut cluster_params = vec![self.initial_params.clone(); n_clusters];
        let mut rounds = Vec::new();
        let mut report = String::new();

        for round in 1..=self.config.rounds {
            info!("Round {}: collecting descriptors", round);
            let descriptors = self.descriptor_round(round, &mut ledger)?;
            let x = descriptor_matrix(&descriptors)?;
            let (assignment, model) = make_clusters(
                x.view(),
                n_clusters,
                self.clients.len(),
                kmeans.take(),
                find_optimal,
                seed,
            )?;
            kmeans = Some(model);

            let ari = clustering_accuracy(&assignment.labels, &self.truth)?;
            info!("Round {}: ARI {:.4}", round, ari);
            report = cluster_report(&assignment.labels, &self.truth, n_clusters);

            let mean_accuracy = if self.options.skip_training {
                None
            } else {
                let accuracy =
                    self.training_round(round, &assignment.labels, &mut cluster_params, &mut ledger)?;
                info!("Round {}: mean accuracy {:.4}", round, accuracy);
                Some(accuracy)
            };

            rounds.push(RoundSummary {
                round,
                labels: assignment.labels,
                ari,
                optimal_clusters: assignment.optimal_clusters,
                mean_accuracy,
            });
        }

        info!("{}", ledger.summary());
        Ok(SimulationReport {
            rounds,
            cluster_report: report,
            ledger,
        })
    }
}
