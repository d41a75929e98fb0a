//! Integration tests for descriptor clustering
//!
//! Encoding clients compute descriptors over differently transformed
//! partitions; the orchestrator-side utilities must recover the groups:
//! - Mini-batch k-means carried across rounds
//! - Adjusted Rand Index and cluster report against the groups
//! - Silhouette sweep reported next to the applied clustering
//! - Timing ledger fed from client metadata

use fedclust_ai::ParameterVector;
use fedclust_common::SimulationConfig;
use fedclust_fl::{
    cluster_report, clustering_accuracy, descriptor_matrix, make_clusters, Client, FlClient,
    RoundConfig, TimingLedger, TASK_COMPUTE_LOW_DIM,
};

use crate::test_fixtures::{encoding_client, pattern_partitions, TestDataConfig};
use crate::test_utils::init_test_logging;

const Z_DIM: usize = 6;

struct Federation {
    clients: Vec<FlClient>,
    truth: Vec<String>,
}

impl Federation {
    fn new(data: &TestDataConfig, groups: &[(&str, usize)]) -> Self {
        let truth: Vec<String> = groups
            .iter()
            .flat_map(|(t, n)| std::iter::repeat(t.to_string()).take(*n))
            .collect();
        let partitions = pattern_partitions(data, truth.len(), 5);
        let clients = (0..truth.len())
            .map(|i| {
                let args = data.client_args(Z_DIM).with_seed(i as u64);
                encoding_client(data, args, partitions.clone(), 42)
            })
            .collect();
        Self { clients, truth }
    }

    fn descriptor_round(&mut self, round: u64, ledger: &mut TimingLedger) -> Vec<Vec<f32>> {
        let truth = &self.truth;
        self.clients
            .iter_mut()
            .enumerate()
            .map(|(i, client)| {
                let config = RoundConfig::new()
                    .with_round(round)
                    .with_partition(i as u64)
                    .with_transform(truth[i].clone())
                    .with_client_number(i as u64)
                    .with_task(TASK_COMPUTE_LOW_DIM);
                let res = client.fit(ParameterVector::default(), &config).unwrap();
                assert!(ledger.record_metadata(&res.metrics));
                res.parameters.tensors()[0].data().to_vec()
            })
            .collect()
    }
}

#[test]
fn test_descriptors_cluster_by_transform() {
    init_test_logging();
    let data = TestDataConfig::default().with_noise(30);
    let mut federation = Federation::new(&data, &[("none", 3), ("invert", 3)]);
    let mut ledger = TimingLedger::new();

    let descriptors = federation.descriptor_round(1, &mut ledger);
    let x = descriptor_matrix(&descriptors).unwrap();
    assert_eq!(x.dim(), (6, data.n_classes * Z_DIM));

    let (assignment, _) = make_clusters(x.view(), 2, 6, None, false, 0).unwrap();
    assert_eq!(assignment.optimal_clusters, None);
    let ari = clustering_accuracy(&assignment.labels, &federation.truth).unwrap();
    assert_eq!(ari, 1.0);

    let report = cluster_report(&assignment.labels, &federation.truth, 2);
    assert_eq!(report.matches("####").count(), 2);
    assert_eq!(report.matches("- invert").count(), 3);
}

#[test]
fn test_kmeans_model_carried_across_rounds() {
    let data = TestDataConfig::default().with_noise(30);
    let mut federation = Federation::new(&data, &[("rotate90", 2), ("none", 2), ("invert", 2)]);
    let mut ledger = TimingLedger::new();

    let first = descriptor_matrix(&federation.descriptor_round(1, &mut ledger)).unwrap();
    let (round1, model) = make_clusters(first.view(), 3, 6, None, false, 1).unwrap();
    assert_eq!(model.n_steps(), 1);

    let second = descriptor_matrix(&federation.descriptor_round(2, &mut ledger)).unwrap();
    let (round2, model) = make_clusters(second.view(), 3, 6, Some(model), false, 1).unwrap();
    assert_eq!(model.n_steps(), 2);
    assert_eq!(model.counts().iter().sum::<f64>(), 12.0);

    assert_eq!(clustering_accuracy(&round1.labels, &federation.truth).unwrap(), 1.0);
    assert_eq!(clustering_accuracy(&round2.labels, &federation.truth).unwrap(), 1.0);

    // Two descriptor rounds per client, no training yet
    let timing = ledger.client(5).unwrap();
    assert_eq!(timing.comp_rounds, 2);
    assert_eq!(timing.train_rounds, 0);
    assert_eq!(ledger.summary().ratio, None);
}

#[test]
fn test_optimal_cluster_count_is_reported_not_applied() {
    let data = TestDataConfig::default();
    let mut federation =
        Federation::new(&data, &[("none", 3), ("rotate90", 3), ("invert", 3)]);
    let mut ledger = TimingLedger::new();
    let x = descriptor_matrix(&federation.descriptor_round(1, &mut ledger)).unwrap();

    let (assignment, model) = make_clusters(x.view(), 4, 9, None, true, 0).unwrap();
    assert_eq!(assignment.optimal_clusters, Some(3));
    assert_eq!(assignment.centers.nrows(), 4);
    assert_eq!(model.n_clusters(), 4);
}

#[test]
fn test_timing_ledger_from_training_rounds() {
    let data = TestDataConfig::default();
    let mut federation = Federation::new(&data, &[("none", 1), ("equalize", 1)]);
    let mut ledger = TimingLedger::new();
    federation.descriptor_round(1, &mut ledger);

    for (i, client) in federation.clients.iter_mut().enumerate() {
        let config = RoundConfig::new().with_round(1).with_client_number(i as u64);
        let params = client.get_parameters();
        let res = client.fit(params, &config).unwrap();
        assert!(ledger.record_metadata(&res.metrics));
    }

    let summary = ledger.summary();
    assert_eq!(summary.num_clients, 2);
    assert!(summary.mean_comp.is_some());
    assert!(summary.mean_train.is_some());

    let json = ledger.export_json().unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["clients"][1]["train_rounds"], 1);
}

#[test]
fn test_simulation_plan_file_matches_groups() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "n_clusters: 2\nrounds: 3\ngroups:\n  - transform: none\n    clients: 2\n  \
         - transform: label_flip_3\n    clients: 1\nclient:\n  model: regression\n"
    )
    .unwrap();
    let config = SimulationConfig::from_yaml_file(file.path()).unwrap();
    assert_eq!(config.n_clients(), 3);
    assert_eq!(config.rounds, 3);
    assert_eq!(config.cluster_truth(), vec!["none", "none", "label_flip_3"]);
}
