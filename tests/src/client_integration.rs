//! Integration tests for the client protocol variants
//!
//! This module tests complete client rounds:
//! - Standard fit and evaluate over a simulated partition
//! - Encoding descriptor rounds and the training rounds that follow them
//! - IFCA cluster identity estimation against server-side cluster blocks
//! - Round configs arriving as orchestrator JSON

use fedclust_ai::{GridStyleExtractor, LinearModel, Model, ParameterVector, Tensor};
use fedclust_common::{ClientArgs, Compression, Dataset};
use fedclust_fl::{
    Client, ClientCore, ClientError, DataSource, FlClient, RoundConfig, TASK_COMPUTE_LOW_DIM,
};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::mock_trainer::MockTrainer;
use crate::test_fixtures::{encoding_client, pattern_partitions, TestDataConfig};
use crate::test_utils::{assert_close, init_test_logging};

const Z_DIM: usize = 3;

fn descriptor_config(partition: u64, transform: &str) -> RoundConfig {
    RoundConfig::new()
        .with_round(1)
        .with_partition(partition)
        .with_transform(transform)
        .with_client_number(partition)
        .with_task(TASK_COMPUTE_LOW_DIM)
}

fn descriptors(client: &mut FlClient, config: &RoundConfig) -> Vec<f32> {
    let res = client.fit(ParameterVector::default(), config).unwrap();
    assert_eq!(res.parameters.len(), 1);
    res.parameters.tensors()[0].data().to_vec()
}

fn bias_block(values: &[f32]) -> Tensor {
    Tensor::from_vec(values.to_vec())
}

// ============================================================================
// Standard
// ============================================================================

#[test]
fn test_standard_client_round_trip() {
    init_test_logging();
    let data = TestDataConfig::default();
    let trainer = MockTrainer::new();
    let stats = trainer.stats();
    let core = ClientCore::new(
        data.client_args(Z_DIM),
        Box::new(LinearModel::new(data.flat_dim(), data.n_classes)),
        Box::new(trainer),
        DataSource::Simulated(Box::new(pattern_partitions(&data, 2, 0))),
    )
    .unwrap();
    let mut client = FlClient::standard(core);
    let params = client.get_parameters();

    let config = RoundConfig::new().with_partition(1).with_transform("invert");
    let res = client.fit(params.clone(), &config).unwrap();
    assert_eq!(res.num_examples, data.train_samples);
    assert_eq!(res.metrics["transform"].as_str(), Some("invert"));
    assert_close(res.parameters.tensors()[1].data(), &[1.0; 4], 0.0);

    let eval = client.evaluate(res.parameters, &config).unwrap();
    assert_eq!(eval.num_examples, data.val_samples);
    assert!(eval.metrics.contains_key("accuracy"));
    assert!(!eval.metrics.contains_key("cluster_id"));

    let stats = stats.lock().unwrap();
    assert_eq!(stats.trained, 1);
    assert_eq!(stats.tested, 1);
}

#[test]
fn test_standard_client_requires_partition_keys() {
    let data = TestDataConfig::default();
    let core = ClientCore::new(
        data.client_args(Z_DIM),
        Box::new(LinearModel::new(data.flat_dim(), data.n_classes)),
        Box::new(MockTrainer::new()),
        DataSource::Simulated(Box::new(pattern_partitions(&data, 1, 0))),
    )
    .unwrap();
    let mut client = FlClient::standard(core);
    let params = client.get_parameters();
    let err = client
        .fit(params, &RoundConfig::new().with_transform("none"))
        .unwrap_err();
    assert!(matches!(err, ClientError::MissingConfig { key: "partition" }));
}

// ============================================================================
// Encoding
// ============================================================================

#[test]
fn test_label_flip_shifts_descriptor_blocks() {
    init_test_logging();
    let data = TestDataConfig::default();
    let partitions = pattern_partitions(&data, 1, 3);
    let mut plain = encoding_client(&data, data.client_args(Z_DIM), partitions.clone(), 11);
    let mut flipped = encoding_client(&data, data.client_args(Z_DIM), partitions, 11);

    let a = descriptors(&mut plain, &descriptor_config(0, "none"));
    let b = descriptors(&mut flipped, &descriptor_config(0, "label_flip_1"));
    assert_eq!(a.len(), data.n_classes * Z_DIM);
    assert_eq!(b.len(), a.len());

    // Samples of class c are bucketed under c + 1 after the flip
    for c in 0..data.n_classes {
        let shifted = (c + 1) % data.n_classes;
        assert_close(
            &b[shifted * Z_DIM..(shifted + 1) * Z_DIM],
            &a[c * Z_DIM..(c + 1) * Z_DIM],
            1e-5,
        );
    }
}

#[test]
fn test_style_descriptors_on_mnist_geometry() {
    let data = TestDataConfig::default().with_image(28, 28, 1);
    let args = data.client_args(Z_DIM).with_style_extraction(true);
    let mut client = encoding_client(&data, args, pattern_partitions(&data, 1, 0), 0);
    let values = descriptors(&mut client, &descriptor_config(0, "rotate90"));
    assert_eq!(values.len(), data.n_classes * 25);
    assert!(values.iter().all(|v| (0.0..=1.0).contains(v)));
}

#[test]
fn test_autoencoder_cifar_descriptors_keep_transform() {
    let data = TestDataConfig::default().with_image(8, 8, 3);
    let mut args = data.client_args(Z_DIM);
    args.compression = Compression::Autoencoder;
    args.dataset = Dataset::Cifar10;
    // The encoder only accepts single-channel samples
    let client = |args: &ClientArgs| {
        let mut rng = StdRng::seed_from_u64(3);
        let encoder = LinearModel::random(data.width * data.height, Z_DIM, &mut rng)
            .with_name("encoder");
        let core = ClientCore::new(
            args.clone(),
            Box::new(LinearModel::new(data.flat_dim(), data.n_classes)),
            Box::new(MockTrainer::new()),
            DataSource::Simulated(Box::new(pattern_partitions(&data, 1, 0))),
        )
        .unwrap();
        FlClient::encoding(core, Box::new(encoder), Box::new(GridStyleExtractor))
    };

    let plain = descriptors(&mut client(&args), &descriptor_config(0, "none"));
    let inverted = descriptors(&mut client(&args), &descriptor_config(0, "invert"));
    assert_eq!(plain.len(), data.n_classes * Z_DIM);
    assert_ne!(plain, inverted);

    // Linear encoder: gray(1 - x) + gray(x) is the same for every class
    let sums: Vec<f32> = plain.iter().zip(&inverted).map(|(a, b)| a + b).collect();
    for c in 1..data.n_classes {
        assert_close(&sums[c * Z_DIM..(c + 1) * Z_DIM], &sums[..Z_DIM], 1e-4);
    }
}

#[test]
fn test_encoding_training_round_after_descriptors() {
    init_test_logging();
    let data = TestDataConfig::default();
    let mut client = encoding_client(&data, data.client_args(Z_DIM), pattern_partitions(&data, 2, 0), 0);
    let initial = client.get_parameters();

    let desc = client.fit(initial.clone(), &descriptor_config(1, "equalize")).unwrap();
    let t_comp = desc.metrics["t_comp"].as_f64().unwrap();
    assert!(t_comp >= 0.0);
    assert_eq!(desc.metrics["client_number"].as_i64(), Some(1));
    assert_eq!(client.get_parameters(), initial);

    // No partition keys: the descriptor round's data is reused
    let train_config = RoundConfig::new()
        .with_round(1)
        .with_client_number(1)
        .with_t_comp(t_comp);
    let res = client.fit(initial, &train_config).unwrap();
    assert_eq!(res.num_examples, data.train_samples);
    assert_eq!(res.metrics["transform"].as_str(), Some("equalize"));
    assert!(res.metrics.contains_key("t_train"));
    assert!(!res.metrics.contains_key("t_comp"));

    let eval = client
        .evaluate(res.parameters, &train_config.clone().with_cluster_id(2))
        .unwrap();
    assert_eq!(eval.metrics["cluster_id"].as_i64(), Some(2));
}

#[test]
fn test_encoding_round_config_from_json() {
    let data = TestDataConfig::default();
    let mut client = encoding_client(&data, data.client_args(Z_DIM), pattern_partitions(&data, 1, 0), 0);
    let config: RoundConfig = serde_json::from_str(
        r#"{"transform": "rotate180", "partition": 0, "round": 3,
            "task": "compute_low_dim", "client_number": 4}"#,
    )
    .unwrap();
    let res = client.fit(ParameterVector::default(), &config).unwrap();
    assert_eq!(res.metrics["client_number"].as_i64(), Some(4));
    assert_eq!(res.metrics["transform"].as_str(), Some("rotate180"));
    assert_eq!(res.parameters.tensors()[0].len(), data.n_classes * Z_DIM);
}

// ============================================================================
// IFCA
// ============================================================================

fn ifca_client(data: &TestDataConfig, trainer: MockTrainer) -> FlClient {
    let core = ClientCore::new(
        data.client_args(Z_DIM),
        Box::new(LinearModel::new(data.flat_dim(), data.n_classes)),
        Box::new(trainer),
        DataSource::Simulated(Box::new(pattern_partitions(data, 1, 0))),
    )
    .unwrap();
    FlClient::ifca(core)
}

/// `[weight, bias_0, bias_1, bias_2]`: one shared layer, three cluster heads
fn server_params(data: &TestDataConfig, blocks: &[[f32; 4]]) -> ParameterVector {
    let weight = LinearModel::new(data.flat_dim(), data.n_classes)
        .get_parameters()
        .into_tensors()
        .remove(0);
    let mut tensors = vec![weight];
    tensors.extend(blocks.iter().map(|b| bias_block(b)));
    ParameterVector::new(tensors)
}

fn ifca_config(round: u64) -> RoundConfig {
    RoundConfig::new()
        .with_round(round)
        .with_partition(0)
        .with_transform("none")
        .with_layout(3, 1, 1)
        .with_client_number(9)
}

#[test]
fn test_ifca_selects_lowest_loss_cluster() {
    init_test_logging();
    let data = TestDataConfig::default();
    let trainer = MockTrainer::new().with_target(vec![0.5; 4]);
    let stats = trainer.stats();
    let mut client = ifca_client(&data, trainer);
    let params = server_params(&data, &[[0.0; 4], [0.5; 4], [2.0; 4]]);

    let res = client.fit(params, &ifca_config(2)).unwrap();
    assert_eq!(res.metrics["cluster_id"].as_i64(), Some(1));
    assert_eq!(res.metrics["client_number"].as_i64(), Some(9));
    // Hybrid of block 1, then one training step
    assert_eq!(res.parameters.len(), 2);
    assert_close(res.parameters.tensors()[1].data(), &[1.5; 4], 1e-6);

    let stats = stats.lock().unwrap();
    assert_eq!(stats.tested, 3);
    assert_eq!(stats.trained, 1);
    assert_close(&stats.losses, &[1.0, 0.0, 9.0], 1e-6);
}

#[test]
fn test_ifca_first_round_skips_evaluation() {
    let data = TestDataConfig::default();
    let trainer = MockTrainer::new();
    let stats = trainer.stats();
    let mut client = ifca_client(&data, trainer);
    let params = server_params(&data, &[[0.0; 4], [1.0; 4], [2.0; 4]]);

    let res = client.fit(params, &ifca_config(1)).unwrap();
    let cluster_id = res.metrics["cluster_id"].as_i64().unwrap();
    assert!((0..3).contains(&cluster_id));
    assert_eq!(stats.lock().unwrap().tested, 0);
}

#[test]
fn test_ifca_rejects_mismatched_layout() {
    let data = TestDataConfig::default();
    let mut client = ifca_client(&data, MockTrainer::new());
    // Two heads shipped, three announced
    let params = server_params(&data, &[[0.0; 4], [1.0; 4]]);
    let err = client.fit(params, &ifca_config(2)).unwrap_err();
    assert!(matches!(err, ClientError::Model(_)));
}

#[test]
fn test_ifca_requires_round() {
    let data = TestDataConfig::default();
    let mut client = ifca_client(&data, MockTrainer::new());
    let params = server_params(&data, &[[0.0; 4], [1.0; 4], [2.0; 4]]);
    let config = RoundConfig::new()
        .with_partition(0)
        .with_transform("none")
        .with_layout(3, 1, 1)
        .with_client_number(0);
    assert!(matches!(
        client.fit(params, &config),
        Err(ClientError::MissingConfig { key: "round" })
    ));
}
