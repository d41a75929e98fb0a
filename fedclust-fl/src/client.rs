//! Federated client protocol variants
//!
//! Every client speaks the same four-call protocol with the orchestrator
//! ([`Client`]). [`FlClient`] implements it once on top of a shared
//! [`ClientCore`] (model, trainer, data, RNG) and dispatches the
//! variant-specific parts on [`Protocol`]:
//!
//! - **Standard**: load the round's partition, train, return weights.
//! - **Encoding**: in descriptor rounds (`task == "compute_low_dim"`) return
//!   per-class descriptors instead of training; otherwise train and time it.
//! - **IFCA**: estimate the cluster from `base ++ block_k` hybrids, load the
//!   winning hybrid, train and report the cluster.

use std::time::Instant;

use fedclust_ai::{
    compute_descriptors, grayscale_tensor, DescriptorOptions, Model, ParameterSplit,
    ParameterVector, StyleExtractor, Tensor, TransformSelector,
};
use fedclust_common::{format_seconds, ClientArgs, Device, ModelKind};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::data::{
    DataLoader, EvalOutcome, LoaderPair, LocalTrainer, PartitionLoader, TrainOptions,
};
use crate::error::ClientError;
use crate::ifca::assign_cluster;
use crate::round_config::{Metadata, RoundConfig};

/// Result of a `fit` call
#[derive(Debug, Clone)]
pub struct FitRes {
    /// Updated weights, or a single descriptor tensor in descriptor rounds
    pub parameters: ParameterVector,
    /// Local training samples, used as aggregation weight
    pub num_examples: usize,
    /// Protocol metadata
    pub metrics: Metadata,
}

/// Result of an `evaluate` call
#[derive(Debug, Clone)]
pub struct EvaluateRes {
    /// Validation loss
    pub loss: f32,
    /// Local validation samples
    pub num_examples: usize,
    /// Protocol metadata, always including `accuracy`
    pub metrics: Metadata,
}

/// The orchestrator-facing client protocol
pub trait Client: Send {
    /// Snapshot of the local weights in stable order
    fn get_parameters(&self) -> ParameterVector;

    /// Strictly loads weights into the local model
    fn set_parameters(&mut self, params: ParameterVector) -> Result<(), ClientError>;

    /// One local round
    fn fit(&mut self, params: ParameterVector, config: &RoundConfig) -> Result<FitRes, ClientError>;

    /// Local validation of `params`
    fn evaluate(
        &mut self,
        params: ParameterVector,
        config: &RoundConfig,
    ) -> Result<EvaluateRes, ClientError>;
}

/// Where a client's data comes from
pub enum DataSource {
    /// Loaders fixed at construction with a known transform
    Fixed {
        /// Training loader
        train: Box<dyn DataLoader>,
        /// Validation loader
        val: Box<dyn DataLoader>,
        /// Transform instruction the loaders were built with
        transform: String,
    },
    /// Partition and transform chosen by each round's config
    Simulated(Box<dyn PartitionLoader>),
}

/// State shared by all protocol variants
pub struct ClientCore {
    args: ClientArgs,
    model: Box<dyn Model>,
    trainer: Box<dyn LocalTrainer>,
    partitions: Option<Box<dyn PartitionLoader>>,
    loaders: Option<LoaderPair>,
    transform: Option<String>,
    rng: StdRng,
}

fn train_model(
    kind: ModelKind,
    trainer: &mut dyn LocalTrainer,
    model: &mut dyn Model,
    loader: &mut dyn DataLoader,
    options: &TrainOptions,
) -> Result<(), ClientError> {
    match kind {
        ModelKind::Cnn => trainer.train_classifier(model, loader, options),
        ModelKind::Regression => trainer.train_regression(model, loader, options),
    }
}

fn test_model(
    kind: ModelKind,
    trainer: &mut dyn LocalTrainer,
    model: &mut dyn Model,
    loader: &mut dyn DataLoader,
    device: &Device,
) -> Result<EvalOutcome, ClientError> {
    match kind {
        ModelKind::Cnn => trainer.test_classifier(model, loader, device),
        ModelKind::Regression => trainer.test_regression(model, loader, device),
    }
}

impl ClientCore {
    /// Creates the shared client state; the RNG is seeded from `args.seed`
    pub fn new(
        args: ClientArgs,
        model: Box<dyn Model>,
        trainer: Box<dyn LocalTrainer>,
        source: DataSource,
    ) -> Result<Self, ClientError> {
        args.validate()?;
        let (partitions, loaders, transform) = match source {
            DataSource::Fixed {
                train,
                val,
                transform,
            } => (None, Some((train, val)), Some(transform)),
            DataSource::Simulated(partitions) => (Some(partitions), None, None),
        };
        debug!(
            "Client core: model {} ({}), device {}, seed {}",
            model.name(),
            args.model,
            args.device,
            args.seed
        );
        Ok(Self {
            rng: StdRng::seed_from_u64(args.seed),
            args,
            model,
            trainer,
            partitions,
            loaders,
            transform,
        })
    }

    /// Static client arguments
    pub fn args(&self) -> &ClientArgs {
        &self.args
    }

    /// Transform instruction of the loaded data, if any
    pub fn transform(&self) -> Option<&str> {
        self.transform.as_deref()
    }

    /// Loads the round's partition in simulation mode.
    ///
    /// With `required == false` a config without partition keys keeps the
    /// previously loaded data.
    fn prepare(&mut self, config: &RoundConfig, required: bool) -> Result<(), ClientError> {
        let Some(partitions) = self.partitions.as_mut() else {
            return Ok(());
        };
        if !required && (config.partition.is_none() || config.transform.is_none()) {
            return Ok(());
        }
        let instruction = config.require_transform()?;
        let partition = config.require_partition()?;
        info!("Loading partition {} with transform {}", partition, instruction);
        let pair = TransformSelector::with_classes(self.args.n_classes).select(&instruction);
        self.loaders = Some(partitions.load_partition(partition, self.args.batch_size, &pair)?);
        self.transform = Some(instruction);
        Ok(())
    }

    fn loaders(&mut self, what: &str) -> Result<&mut LoaderPair, ClientError> {
        self.loaders.as_mut().ok_or_else(|| ClientError::NoData {
            reason: format!("{what} before any partition was loaded"),
        })
    }

    fn train_options(&self, config: &RoundConfig) -> TrainOptions {
        TrainOptions {
            epochs: config.local_epochs.unwrap_or(1),
            learning_rate: config.learning_rate,
            device: self.args.device,
        }
    }

    /// Trains on the loaded partition, returning the number of samples
    fn train(&mut self, config: &RoundConfig) -> Result<usize, ClientError> {
        let options = self.train_options(config);
        let kind = self.args.model;
        let (train, _) = self.loaders.as_mut().ok_or_else(|| ClientError::NoData {
            reason: "fit before any partition was loaded".to_string(),
        })?;
        train_model(
            kind,
            &mut *self.trainer,
            &mut *self.model,
            &mut **train,
            &options,
        )?;
        Ok(train.num_samples())
    }

    /// Validates the current weights
    fn test(&mut self) -> Result<(EvalOutcome, usize), ClientError> {
        let kind = self.args.model;
        let device = self.args.device;
        let (_, val) = self.loaders.as_mut().ok_or_else(|| ClientError::NoData {
            reason: "evaluate before any partition was loaded".to_string(),
        })?;
        let outcome = test_model(
            kind,
            &mut *self.trainer,
            &mut *self.model,
            &mut **val,
            &device,
        )?;
        Ok((outcome, val.num_samples()))
    }

    fn transform_metadata(&self) -> Metadata {
        let mut metrics = Metadata::new();
        metrics.insert(
            "transform".to_string(),
            self.transform.clone().unwrap_or_default().into(),
        );
        metrics
    }
}

/// Variant-specific behavior and state
pub enum Protocol {
    /// Plain federated averaging client
    Standard,
    /// Descriptor-producing client
    Encoding {
        /// Encoder used for descriptors
        embedding_model: Box<dyn Model>,
        /// Style extractor used when style extraction is enabled
        style: Box<dyn StyleExtractor + Send>,
        /// Duration of the last descriptor computation, in seconds
        last_t_comp: Option<f64>,
    },
    /// Iterative Federated Clustering client
    Ifca,
}

impl Protocol {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Standard => "standard",
            Protocol::Encoding { .. } => "encoding",
            Protocol::Ifca => "ifca",
        }
    }
}

/// A federated client: shared core plus protocol variant
pub struct FlClient {
    core: ClientCore,
    protocol: Protocol,
}

impl FlClient {
    /// Standard client
    pub fn standard(core: ClientCore) -> Self {
        Self {
            core,
            protocol: Protocol::Standard,
        }
    }

    /// Encoding client with an embedding model and a style extractor
    pub fn encoding(
        core: ClientCore,
        embedding_model: Box<dyn Model>,
        style: Box<dyn StyleExtractor + Send>,
    ) -> Self {
        Self {
            core,
            protocol: Protocol::Encoding {
                embedding_model,
                style,
                last_t_comp: None,
            },
        }
    }

    /// IFCA client
    pub fn ifca(core: ClientCore) -> Self {
        Self {
            core,
            protocol: Protocol::Ifca,
        }
    }

    /// Protocol variant
    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Shared state
    pub fn core(&self) -> &ClientCore {
        &self.core
    }

    fn fit_standard(
        &mut self,
        params: ParameterVector,
        config: &RoundConfig,
    ) -> Result<FitRes, ClientError> {
        self.core.prepare(config, true)?;
        self.core.model.set_parameters(params)?;
        let num_examples = self.core.train(config)?;
        Ok(FitRes {
            parameters: self.core.model.get_parameters(),
            num_examples,
            metrics: self.core.transform_metadata(),
        })
    }

    fn fit_encoding(
        &mut self,
        params: ParameterVector,
        config: &RoundConfig,
    ) -> Result<FitRes, ClientError> {
        let Protocol::Encoding {
            embedding_model,
            style,
            last_t_comp,
        } = &mut self.protocol
        else {
            return Err(ClientError::Training(
                "encoding fit on a non-encoding client".to_string(),
            ));
        };
        let core = &mut self.core;
        let client_number = config.require_client_number()?;

        if config.is_descriptor_round() {
            core.prepare(config, true)?;
            let start = Instant::now();
            info!("Client {}: computing class descriptors", client_number);

            // Grayscale runs on the corrupted sample; the round's transform stays applied
            let grayscale = core.args.grayscale_descriptors();
            let (train, _) = core.loaders("descriptor round")?;
            let samples = train.samples();
            let num_examples = samples.len();
            let sample_flat_dim = match samples.first() {
                Some((sample, _)) if grayscale => grayscale_tensor(sample)?.len(),
                Some((sample, _)) => sample.len(),
                None => 0,
            };
            let options = DescriptorOptions::new(
                core.args.z_dim,
                sample_flat_dim,
                core.args.n_classes,
            )
            .with_style_extraction(core.args.style_extraction)
            .with_grayscale(grayscale);
            let descriptors = compute_descriptors(
                &mut **embedding_model,
                samples,
                &options,
                &**style,
                &mut core.rng,
            )?;
            debug!("Client {}: {} descriptor values", client_number, descriptors.len());

            let t_comp = start.elapsed().as_secs_f64();
            *last_t_comp = Some(t_comp);
            info!(
                "Client {}: descriptors computed in {}",
                client_number,
                format_seconds(t_comp)
            );

            let mut metrics = core.transform_metadata();
            metrics.insert("client_number".to_string(), client_number.into());
            metrics.insert("t_comp".to_string(), t_comp.into());
            return Ok(FitRes {
                parameters: ParameterVector::new(vec![Tensor::from_vec(descriptors)]),
                num_examples,
                metrics,
            });
        }

        core.prepare(config, false)?;
        let start = Instant::now();
        core.model.set_parameters(params)?;
        let num_examples = core.train(config)?;
        let parameters = core.model.get_parameters();
        let t_train = start.elapsed().as_secs_f64();

        match config.t_comp.or(*last_t_comp) {
            Some(t_comp) if t_train > 0.0 => info!(
                "Client {}: t_comp {}, t_train {}, ratio {:.3}",
                client_number,
                format_seconds(t_comp),
                format_seconds(t_train),
                t_comp / t_train
            ),
            _ => info!(
                "Client {}: trained in {}",
                client_number,
                format_seconds(t_train)
            ),
        }

        let mut metrics = core.transform_metadata();
        metrics.insert("client_number".to_string(), client_number.into());
        metrics.insert("t_train".to_string(), t_train.into());
        Ok(FitRes {
            parameters,
            num_examples,
            metrics,
        })
    }

    fn fit_ifca(
        &mut self,
        params: ParameterVector,
        config: &RoundConfig,
    ) -> Result<FitRes, ClientError> {
        let core = &mut self.core;
        core.prepare(config, true)?;
        let round = config.require_round()?;
        let (n_clusters, n_base_layers, n_pers_layers) = config.require_layout()?;
        let client_number = config.require_client_number()?;
        let split = ParameterSplit::new(&params, n_base_layers, n_pers_layers, n_clusters)?;

        let kind = core.args.model;
        let device = core.args.device;
        let model = &mut *core.model;
        let trainer = &mut *core.trainer;
        let loaders = core.loaders.as_mut();
        let cluster_id = match loaders {
            Some((_, val)) => assign_cluster(round, &split, &mut core.rng, |hybrid| {
                model.set_parameters(hybrid)?;
                Ok(test_model(kind, trainer, model, &mut **val, &device)?.loss)
            })?,
            None => {
                return Err(ClientError::NoData {
                    reason: "fit before any partition was loaded".to_string(),
                })
            }
        };

        core.model.set_parameters(split.hybrid(cluster_id)?)?;
        let num_examples = core.train(config)?;

        let mut metrics = core.transform_metadata();
        metrics.insert("cluster_id".to_string(), cluster_id.into());
        metrics.insert("client_number".to_string(), client_number.into());
        Ok(FitRes {
            parameters: core.model.get_parameters(),
            num_examples,
            metrics,
        })
    }
}

impl Client for FlClient {
    fn get_parameters(&self) -> ParameterVector {
        self.core.model.get_parameters()
    }

    fn set_parameters(&mut self, params: ParameterVector) -> Result<(), ClientError> {
        Ok(self.core.model.set_parameters(params)?)
    }

    fn fit(&mut self, params: ParameterVector, config: &RoundConfig) -> Result<FitRes, ClientError> {
        debug!("{} fit, round {:?}", self.protocol.name(), config.round);
        match self.protocol {
            Protocol::Standard => self.fit_standard(params, config),
            Protocol::Encoding { .. } => self.fit_encoding(params, config),
            Protocol::Ifca => self.fit_ifca(params, config),
        }
    }

    fn evaluate(
        &mut self,
        params: ParameterVector,
        config: &RoundConfig,
    ) -> Result<EvaluateRes, ClientError> {
        self.core.model.set_parameters(params)?;
        let (outcome, num_examples) = self.core.test()?;

        let mut metrics = Metadata::new();
        metrics.insert("accuracy".to_string(), outcome.accuracy.into());
        match (&self.protocol, config.cluster_id) {
            (Protocol::Standard, _) | (_, None) => info!(
                "EVAL model performance - accuracy: {:.4}, loss: {:.4}",
                outcome.accuracy, outcome.loss
            ),
            (_, Some(cluster_id)) => {
                info!(
                    "Cluster {} EVAL model performance - accuracy: {:.4}, loss: {:.4} | transform {}",
                    cluster_id,
                    outcome.accuracy,
                    outcome.loss,
                    self.core.transform().unwrap_or("none")
                );
                metrics.insert("cluster_id".to_string(), cluster_id.into());
            }
        }

        Ok(EvaluateRes {
            loss: outcome.loss,
            num_examples,
            metrics,
        })
    }
}
