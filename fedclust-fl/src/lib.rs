//! Clustered federated learning clients
//!
//! Client-side protocol variants for clustered and personalized federated
//! learning, and the clustering utilities the orchestrator runs on the
//! descriptors those clients return.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                 Clustered Federated Learning Client                 │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │ FlClient (Client trait)                                       │  │
//! │  │  • Standard: load partition, train                            │  │
//! │  │  • Encoding: per-class descriptors or timed training          │  │
//! │  │  • IFCA: cluster identity estimation, hybrid parameters       │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │ Local data                                                    │  │
//! │  │  • PartitionLoader / DataLoader                               │  │
//! │  │  • LocalTrainer                                               │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! │  ┌───────────────────────────────────────────────────────────────┐  │
//! │  │ Orchestrator utilities                                        │  │
//! │  │  • Mini-batch k-means, silhouette sweep                       │  │
//! │  │  • Adjusted Rand Index, cluster report                        │  │
//! │  │  • Timing ledger                                              │  │
//! │  └───────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod clustering;
pub mod data;
pub mod error;
pub mod ifca;
pub mod metrics;
pub mod round_config;

pub use client::{Client, ClientCore, DataSource, EvaluateRes, FitRes, FlClient, Protocol};
pub use clustering::{
    adjusted_rand_score, cluster_report, clustering_accuracy, descriptor_matrix,
    find_optimal_clustering, make_clusters, silhouette_score, ClusterAssignment, KMeans,
    KMeansFit, MiniBatchKMeans,
};
pub use data::{
    Batch, DataLoader, EvalOutcome, ImageDataset, InMemoryLoader, InMemoryPartitions,
    LoaderPair, LocalTrainer, PartitionLoader, TrainOptions,
};
pub use error::{ClientError, ClusteringError};
pub use ifca::{assign_cluster, estimate_cluster_identity};
pub use metrics::{ClientTiming, TimingLedger, TimingSummary};
pub use round_config::{Metadata, RoundConfig, Scalar, TASK_COMPUTE_LOW_DIM};
