//! Descriptor and training time accounting
//!
//! Encoding clients report `t_comp` (descriptor computation) and `t_train`
//! (local training) in their fit metadata. The orchestrator folds those into
//! a [`TimingLedger`] to see how expensive descriptor rounds are relative to
//! training.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::round_config::Metadata;

/// Accumulated timings of one client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientTiming {
    /// Client number
    pub client_number: u64,
    /// Descriptor rounds seen
    pub comp_rounds: u64,
    /// Total descriptor time in seconds
    pub total_comp: f64,
    /// Training rounds seen
    pub train_rounds: u64,
    /// Total training time in seconds
    pub total_train: f64,
}

impl ClientTiming {
    /// Mean descriptor time
    pub fn mean_comp(&self) -> Option<f64> {
        (self.comp_rounds > 0).then(|| self.total_comp / self.comp_rounds as f64)
    }

    /// Mean training time
    pub fn mean_train(&self) -> Option<f64> {
        (self.train_rounds > 0).then(|| self.total_train / self.train_rounds as f64)
    }

    /// Mean descriptor time over mean training time
    pub fn ratio(&self) -> Option<f64> {
        match (self.mean_comp(), self.mean_train()) {
            (Some(comp), Some(train)) if train > 0.0 => Some(comp / train),
            _ => None,
        }
    }
}

/// Summary over all clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    /// Clients with at least one timing
    pub num_clients: usize,
    /// Mean descriptor time across clients
    pub mean_comp: Option<f64>,
    /// Mean training time across clients
    pub mean_train: Option<f64>,
    /// `mean_comp / mean_train`
    pub ratio: Option<f64>,
}

impl std::fmt::Display for TimingSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
        write!(
            f,
            "Clients: {}, t_comp: {}, t_train: {}, ratio: {}",
            self.num_clients,
            show(self.mean_comp),
            show(self.mean_train),
            show(self.ratio),
        )
    }
}

/// Orchestrator-side collection of client timings
#[derive(Debug, Clone, Default)]
pub struct TimingLedger {
    clients: HashMap<u64, ClientTiming>,
}

impl TimingLedger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, client_number: u64) -> &mut ClientTiming {
        self.clients
            .entry(client_number)
            .or_insert_with(|| ClientTiming {
                client_number,
                ..ClientTiming::default()
            })
    }

    /// Records a descriptor computation time
    pub fn record_comp(&mut self, client_number: u64, seconds: f64) {
        let timing = self.entry(client_number);
        timing.comp_rounds += 1;
        timing.total_comp += seconds;
    }

    /// Records a training time
    pub fn record_train(&mut self, client_number: u64, seconds: f64) {
        let timing = self.entry(client_number);
        timing.train_rounds += 1;
        timing.total_train += seconds;
    }

    /// Records whatever `client_number`, `t_comp` and `t_train` fit metadata
    /// carries. Returns false when there is no client number.
    pub fn record_metadata(&mut self, metadata: &Metadata) -> bool {
        let Some(client_number) = metadata
            .get("client_number")
            .and_then(|v| v.as_i64())
            .and_then(|v| u64::try_from(v).ok())
        else {
            return false;
        };
        if let Some(t) = metadata.get("t_comp").and_then(|v| v.as_f64()) {
            self.record_comp(client_number, t);
        }
        if let Some(t) = metadata.get("t_train").and_then(|v| v.as_f64()) {
            self.record_train(client_number, t);
        }
        debug!("Timing recorded for client {}", client_number);
        true
    }

    /// Timings of one client
    pub fn client(&self, client_number: u64) -> Option<&ClientTiming> {
        self.clients.get(&client_number)
    }

    /// Number of clients with timings
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// True if nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Averages over clients
    pub fn summary(&self) -> TimingSummary {
        let mean = |values: Vec<f64>| {
            (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
        };
        let mean_comp = mean(self.clients.values().filter_map(ClientTiming::mean_comp).collect());
        let mean_train = mean(self.clients.values().filter_map(ClientTiming::mean_train).collect());
        let ratio = match (mean_comp, mean_train) {
            (Some(comp), Some(train)) if train > 0.0 => Some(comp / train),
            _ => None,
        };
        TimingSummary {
            num_clients: self.clients.len(),
            mean_comp,
            mean_train,
            ratio,
        }
    }

    /// Exports per-client timings and the summary as JSON
    pub fn export_json(&self) -> Result<String, serde_json::Error> {
        #[derive(Serialize)]
        struct LedgerExport<'a> {
            clients: Vec<&'a ClientTiming>,
            summary: TimingSummary,
        }

        let mut clients: Vec<&ClientTiming> = self.clients.values().collect();
        clients.sort_by_key(|c| c.client_number);
        serde_json::to_string_pretty(&LedgerExport {
            clients,
            summary: self.summary(),
        })
    }
}
