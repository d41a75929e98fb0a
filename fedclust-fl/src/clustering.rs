//! Clustering of client descriptors
//!
//! The orchestrator stacks the descriptor vectors returned by Encoding
//! clients into a `[n_clients, dim]` matrix and groups clients with
//! mini-batch k-means. The model is kept between rounds and updated with
//! [`MiniBatchKMeans::partial_fit`], so centers drift with the data instead
//! of being recomputed from scratch.
//!
//! Clustering quality is scored against the known client groups with the
//! Adjusted Rand Index, or without ground truth via the silhouette score.

use std::collections::HashMap;
use std::fmt::{Display, Write as _};
use std::hash::Hash;

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::error::ClusteringError;

/// Default number of k-means++ initialisations
pub const DEFAULT_N_INIT: usize = 10;

fn squared_distance(a: ArrayView1<'_, f64>, b: ArrayView1<'_, f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn nearest_center(row: ArrayView1<'_, f64>, centers: &Array2<f64>) -> (usize, f64) {
    centers
        .outer_iter()
        .enumerate()
        .map(|(k, c)| (k, squared_distance(row, c)))
        .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
        .unwrap_or((0, f64::INFINITY))
}

/// Labels of the nearest centers and the total squared distance
fn assign(x: ArrayView2<'_, f64>, centers: &Array2<f64>) -> (Vec<usize>, f64) {
    let mut inertia = 0.0;
    let labels = x
        .outer_iter()
        .map(|row| {
            let (k, d) = nearest_center(row, centers);
            inertia += d;
            k
        })
        .collect();
    (labels, inertia)
}

/// k-means++ seeding: first center uniform, then proportional to D^2
fn kmeans_plus_plus<R: Rng + ?Sized>(x: ArrayView2<'_, f64>, k: usize, rng: &mut R) -> Array2<f64> {
    let n = x.nrows();
    let mut centers = Array2::zeros((k, x.ncols()));
    let first = rng.gen_range(0..n);
    centers.row_mut(0).assign(&x.row(first));

    let mut distances: Vec<f64> = x
        .outer_iter()
        .map(|row| squared_distance(row, centers.row(0)))
        .collect();
    for c in 1..k {
        let total: f64 = distances.iter().sum();
        let chosen = if total <= 0.0 {
            rng.gen_range(0..n)
        } else {
            let threshold = rng.gen::<f64>() * total;
            let mut cumulative = 0.0;
            distances
                .iter()
                .position(|d| {
                    cumulative += d;
                    cumulative >= threshold
                })
                .unwrap_or(n - 1)
        };
        centers.row_mut(c).assign(&x.row(chosen));
        for (d, row) in distances.iter_mut().zip(x.outer_iter()) {
            *d = d.min(squared_distance(row, centers.row(c)));
        }
    }
    centers
}

fn check_input(x: ArrayView2<'_, f64>, n_clusters: usize) -> Result<(), ClusteringError> {
    if x.nrows() == 0 {
        return Err(ClusteringError::EmptyInput);
    }
    if n_clusters == 0 || n_clusters > x.nrows() {
        return Err(ClusteringError::InvalidClusterCount {
            n_clusters,
            n_samples: x.nrows(),
        });
    }
    Ok(())
}

/// Stacks equally long descriptor vectors into a `[n, dim]` matrix
pub fn descriptor_matrix(rows: &[Vec<f32>]) -> Result<Array2<f64>, ClusteringError> {
    let dim = rows.first().ok_or(ClusteringError::EmptyInput)?.len();
    let mut matrix = Array2::zeros((rows.len(), dim));
    for (i, row) in rows.iter().enumerate() {
        if row.len() != dim {
            return Err(ClusteringError::DimensionMismatch {
                expected: dim,
                actual: row.len(),
            });
        }
        for (dst, &v) in matrix.row_mut(i).iter_mut().zip(row) {
            *dst = f64::from(v);
        }
    }
    Ok(matrix)
}

/// Incremental k-means updated one batch at a time.
///
/// The first batch seeds the centers with the best (lowest inertia) of
/// `n_init` k-means++ draws. Every batch then moves each center to the
/// count-weighted mean of everything it has been assigned so far.
#[derive(Debug, Clone)]
pub struct MiniBatchKMeans {
    n_clusters: usize,
    n_init: usize,
    batch_size: usize,
    centers: Option<Array2<f64>>,
    counts: Vec<f64>,
    labels: Vec<usize>,
    n_steps: u64,
    rng: StdRng,
}

impl MiniBatchKMeans {
    /// Creates an unfitted model
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            n_init: DEFAULT_N_INIT,
            batch_size: 1024,
            centers: None,
            counts: vec![0.0; n_clusters],
            labels: Vec::new(),
            n_steps: 0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Sets the number of initialisations tried on the first batch
    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    /// Sets the number of rows per update step
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Seeds the initialisation RNG
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of clusters
    pub fn n_clusters(&self) -> usize {
        self.n_clusters
    }

    /// Current centers, `None` before the first batch
    pub fn centers(&self) -> Option<&Array2<f64>> {
        self.centers.as_ref()
    }

    /// Labels of the last batch passed to `partial_fit`
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Samples absorbed by each center so far
    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    /// Number of update steps taken
    pub fn n_steps(&self) -> u64 {
        self.n_steps
    }

    fn init_centers(&mut self, x: ArrayView2<'_, f64>) -> Array2<f64> {
        let mut best: Option<(Array2<f64>, f64)> = None;
        for _ in 0..self.n_init {
            let candidate = kmeans_plus_plus(x, self.n_clusters, &mut self.rng);
            let (_, inertia) = assign(x, &candidate);
            if best.as_ref().map_or(true, |(_, b)| inertia < *b) {
                best = Some((candidate, inertia));
            }
        }
        best.map(|(c, _)| c)
            .unwrap_or_else(|| Array2::zeros((self.n_clusters, x.ncols())))
    }

    fn step(centers: &mut Array2<f64>, counts: &mut [f64], batch: ArrayView2<'_, f64>) {
        let (labels, _) = assign(batch, centers);
        let mut sums = Array2::<f64>::zeros(centers.raw_dim());
        let mut batch_counts = vec![0.0; counts.len()];
        for (row, &k) in batch.outer_iter().zip(&labels) {
            let mut sum = sums.row_mut(k);
            sum += &row;
            batch_counts[k] += 1.0;
        }
        for (k, &m) in batch_counts.iter().enumerate() {
            if m == 0.0 {
                continue;
            }
            let total = counts[k] + m;
            let mut center = centers.row_mut(k);
            center *= counts[k];
            center += &sums.row(k);
            center /= total;
            counts[k] = total;
        }
    }

    /// Updates the model with one batch of descriptors
    pub fn partial_fit(&mut self, x: ArrayView2<'_, f64>) -> Result<&mut Self, ClusteringError> {
        let mut centers = match self.centers.take() {
            Some(centers) => {
                if x.ncols() != centers.ncols() {
                    let expected = centers.ncols();
                    self.centers = Some(centers);
                    return Err(ClusteringError::DimensionMismatch {
                        expected,
                        actual: x.ncols(),
                    });
                }
                if x.nrows() == 0 {
                    self.centers = Some(centers);
                    return Err(ClusteringError::EmptyInput);
                }
                centers
            }
            None => {
                check_input(x, self.n_clusters)?;
                let centers = self.init_centers(x);
                debug!(
                    "Initialised {} centers from {} samples ({} inits)",
                    self.n_clusters,
                    x.nrows(),
                    self.n_init
                );
                centers
            }
        };

        for start in (0..x.nrows()).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(x.nrows());
            Self::step(&mut centers, &mut self.counts, x.slice(ndarray::s![start..end, ..]));
            self.n_steps += 1;
        }
        let (labels, inertia) = assign(x, &centers);
        debug!("partial_fit step {}: inertia {:.6}", self.n_steps, inertia);
        self.labels = labels;
        self.centers = Some(centers);
        Ok(self)
    }

    /// Nearest-center labels for `x`
    pub fn predict(&self, x: ArrayView2<'_, f64>) -> Result<Vec<usize>, ClusteringError> {
        let centers = self.centers.as_ref().ok_or(ClusteringError::EmptyInput)?;
        if x.ncols() != centers.ncols() {
            return Err(ClusteringError::DimensionMismatch {
                expected: centers.ncols(),
                actual: x.ncols(),
            });
        }
        Ok(assign(x, centers).0)
    }
}

/// Batch k-means (Lloyd iterations) with k-means++ restarts
#[derive(Debug, Clone)]
pub struct KMeans {
    n_clusters: usize,
    n_init: usize,
    max_iterations: usize,
    tolerance: f64,
    seed: u64,
}

/// Result of a batch k-means fit
#[derive(Debug, Clone)]
pub struct KMeansFit {
    /// Label per sample
    pub labels: Vec<usize>,
    /// `[n_clusters, dim]` centers
    pub centers: Array2<f64>,
    /// Sum of squared distances to the assigned centers
    pub inertia: f64,
}

impl KMeans {
    /// Creates a k-means with 10 restarts and at most 300 iterations each
    pub fn new(n_clusters: usize) -> Self {
        Self {
            n_clusters,
            n_init: DEFAULT_N_INIT,
            max_iterations: 300,
            tolerance: 1e-4,
            seed: 0,
        }
    }

    /// Seeds the restarts
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Sets the number of restarts
    pub fn with_n_init(mut self, n_init: usize) -> Self {
        self.n_init = n_init.max(1);
        self
    }

    fn lloyd(&self, x: ArrayView2<'_, f64>, mut centers: Array2<f64>) -> KMeansFit {
        let mut labels = vec![0; x.nrows()];
        for _ in 0..self.max_iterations {
            labels = assign(x, &centers).0;
            let mut next = Array2::<f64>::zeros(centers.raw_dim());
            let mut counts = vec![0usize; self.n_clusters];
            for (row, &k) in x.outer_iter().zip(&labels) {
                let mut sum = next.row_mut(k);
                sum += &row;
                counts[k] += 1;
            }
            for (k, &count) in counts.iter().enumerate() {
                if count == 0 {
                    // Empty cluster keeps its previous center
                    next.row_mut(k).assign(&centers.row(k));
                } else {
                    let mut row = next.row_mut(k);
                    row /= count as f64;
                }
            }
            let shift: f64 = centers
                .outer_iter()
                .zip(next.outer_iter())
                .map(|(a, b)| squared_distance(a, b))
                .sum();
            centers = next;
            if shift <= self.tolerance {
                break;
            }
        }
        let (final_labels, inertia) = assign(x, &centers);
        if final_labels != labels {
            debug!("k-means stopped before labels settled");
        }
        KMeansFit {
            labels: final_labels,
            centers,
            inertia,
        }
    }

    /// Fits and returns the lowest-inertia run
    pub fn fit(&self, x: ArrayView2<'_, f64>) -> Result<KMeansFit, ClusteringError> {
        check_input(x, self.n_clusters)?;
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut best: Option<KMeansFit> = None;
        for _ in 0..self.n_init {
            let init = kmeans_plus_plus(x, self.n_clusters, &mut rng);
            let fit = self.lloyd(x, init);
            if best.as_ref().map_or(true, |b| fit.inertia < b.inertia) {
                best = Some(fit);
            }
        }
        best.ok_or(ClusteringError::EmptyInput)
    }
}

/// Mean silhouette coefficient of a labelling.
///
/// Samples alone in their cluster score 0. Requires between 2 and
/// `n_samples - 1` distinct labels.
pub fn silhouette_score(x: ArrayView2<'_, f64>, labels: &[usize]) -> Result<f64, ClusteringError> {
    let n = x.nrows();
    if n == 0 {
        return Err(ClusteringError::EmptyInput);
    }
    if labels.len() != n {
        return Err(ClusteringError::LabelCountMismatch {
            left: n,
            right: labels.len(),
        });
    }
    let mut index: HashMap<usize, usize> = HashMap::new();
    let dense: Vec<usize> = labels
        .iter()
        .map(|l| {
            let next = index.len();
            *index.entry(*l).or_insert(next)
        })
        .collect();
    let n_labels = index.len();
    if n_labels < 2 || n_labels > n - 1 {
        return Err(ClusteringError::TooFewLabels {
            n_labels,
            max: n.saturating_sub(1),
        });
    }

    let mut sizes = vec![0usize; n_labels];
    for &l in &dense {
        sizes[l] += 1;
    }

    let mut total = 0.0;
    for i in 0..n {
        let mut sums = vec![0.0f64; n_labels];
        for j in 0..n {
            if i != j {
                sums[dense[j]] += squared_distance(x.row(i), x.row(j)).sqrt();
            }
        }
        let own = dense[i];
        if sizes[own] <= 1 {
            continue;
        }
        let a = sums[own] / (sizes[own] - 1) as f64;
        let b = (0..n_labels)
            .filter(|&l| l != own)
            .map(|l| sums[l] / sizes[l] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Ok(total / n as f64)
}

/// Cluster count in `2..=max_clusters` with the highest silhouette score.
///
/// Counts whose fit collapses to fewer than two labels are skipped; ties
/// keep the smaller count.
pub fn find_optimal_clustering(
    x: ArrayView2<'_, f64>,
    max_clusters: usize,
    seed: u64,
) -> Result<usize, ClusteringError> {
    let upper = max_clusters.min(x.nrows().saturating_sub(1));
    if upper < 2 {
        return Err(ClusteringError::InvalidClusterCount {
            n_clusters: max_clusters,
            n_samples: x.nrows(),
        });
    }
    let mut best: Option<(usize, f64)> = None;
    for k in 2..=upper {
        let fit = KMeans::new(k).with_seed(seed).fit(x)?;
        let score = match silhouette_score(x, &fit.labels) {
            Ok(score) => score,
            Err(ClusteringError::TooFewLabels { n_labels, .. }) => {
                debug!("n_clusters: {} collapsed to {} labels, skipped", k, n_labels);
                continue;
            }
            Err(e) => return Err(e),
        };
        info!("n_clusters: {} - score: {:.4}", k, score);
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((k, score));
        }
    }
    best.map(|(k, _)| k)
        .ok_or(ClusteringError::TooFewLabels { n_labels: 1, max: upper })
}

/// Output of [`make_clusters`]
#[derive(Debug, Clone)]
pub struct ClusterAssignment {
    /// Cluster label per client index
    pub labels: Vec<usize>,
    /// `[n_clusters, dim]` centers
    pub centers: Array2<f64>,
    /// Silhouette-optimal cluster count, when requested (not applied)
    pub optimal_clusters: Option<usize>,
}

/// Clusters one round of client descriptors.
///
/// Without a `prior` model a new [`MiniBatchKMeans`] is created with
/// `n_init = 10` and one update step per `n_clients` rows; otherwise the
/// prior model is updated in place and returned.
pub fn make_clusters(
    x: ArrayView2<'_, f64>,
    n_clusters: usize,
    n_clients: usize,
    prior: Option<MiniBatchKMeans>,
    find_optimal: bool,
    seed: u64,
) -> Result<(ClusterAssignment, MiniBatchKMeans), ClusteringError> {
    // Sweep failures are logged, not returned
    let optimal_clusters = if find_optimal {
        match find_optimal_clustering(x, n_clusters, seed) {
            Ok(optimal) => {
                info!("Optimal number of clusters: {}", optimal);
                Some(optimal)
            }
            Err(e) => {
                warn!("Optimal cluster search failed: {}", e);
                None
            }
        }
    } else {
        None
    };

    let mut kmeans = prior.unwrap_or_else(|| {
        MiniBatchKMeans::new(n_clusters)
            .with_n_init(DEFAULT_N_INIT)
            .with_batch_size(n_clients)
            .with_seed(seed)
    });
    kmeans.partial_fit(x)?;
    let centers = kmeans
        .centers()
        .cloned()
        .ok_or(ClusteringError::EmptyInput)?;
    let assignment = ClusterAssignment {
        labels: kmeans.labels().to_vec(),
        centers,
        optimal_clusters,
    };
    Ok((assignment, kmeans))
}

/// Adjusted Rand Index between two labellings.
///
/// Invariant to label permutation. Identical partitions score 1.0 and
/// independent ones score close to 0.
pub fn adjusted_rand_score<T, U>(truth: &[T], pred: &[U]) -> Result<f64, ClusteringError>
where
    T: Eq + Hash,
    U: Eq + Hash,
{
    if truth.len() != pred.len() {
        return Err(ClusteringError::LabelCountMismatch {
            left: truth.len(),
            right: pred.len(),
        });
    }
    let n = truth.len() as f64;
    let mut contingency: HashMap<(usize, usize), f64> = HashMap::new();
    let mut truth_index: HashMap<&T, usize> = HashMap::new();
    let mut pred_index: HashMap<&U, usize> = HashMap::new();
    for (t, p) in truth.iter().zip(pred) {
        let next = truth_index.len();
        let i = *truth_index.entry(t).or_insert(next);
        let next = pred_index.len();
        let j = *pred_index.entry(p).or_insert(next);
        *contingency.entry((i, j)).or_insert(0.0) += 1.0;
    }

    let mut row_sums = vec![0.0; truth_index.len()];
    let mut col_sums = vec![0.0; pred_index.len()];
    let mut sum_squares = 0.0;
    for (&(i, j), &count) in &contingency {
        row_sums[i] += count;
        col_sums[j] += count;
        sum_squares += count * count;
    }
    let squares = |v: &[f64]| v.iter().map(|c| c * c).sum::<f64>();

    // Pair confusion matrix
    let tp = sum_squares - n;
    let fp = squares(&col_sums) - sum_squares;
    let fn_ = squares(&row_sums) - sum_squares;
    let tn = n * n - fp - fn_ - sum_squares;

    if fn_ == 0.0 && fp == 0.0 {
        return Ok(1.0);
    }
    Ok(2.0 * (tp * tn - fn_ * fp) / ((tp + fn_) * (fn_ + tn) + (tp + fp) * (fp + tn)))
}

/// ARI of predicted cluster labels against ground-truth group names
pub fn clustering_accuracy<T: Eq + Hash>(
    labels: &[usize],
    truth: &[T],
) -> Result<f64, ClusteringError> {
    adjusted_rand_score(truth, labels)
}

/// Lists the clients of every cluster with their ground truth
pub fn cluster_report<T: Display>(labels: &[usize], truth: &[T], n_clusters: usize) -> String {
    let mut report = String::new();
    for k in 0..n_clusters {
        info!("CLUSTER {}:", k);
        let _ = writeln!(report, "CLUSTER {k}:");
        for (j, _) in labels.iter().enumerate().filter(|&(_, &l)| l == k) {
            let group = truth.get(j).map(ToString::to_string).unwrap_or_default();
            info!("Client {} - {}", j, group);
            let _ = writeln!(report, "Client {j} - {group}");
        }
        let _ = writeln!(report, "####");
    }
    report
}

/// Mean of rows per label, used to compare centers against batch means
pub fn label_means(x: ArrayView2<'_, f64>, labels: &[usize], n_clusters: usize) -> Array2<f64> {
    let mut means = Array2::zeros((n_clusters, x.ncols()));
    let mut counts = vec![0usize; n_clusters];
    for (row, &k) in x.outer_iter().zip(labels) {
        if k < n_clusters {
            let mut m = means.row_mut(k);
            m += &row;
            counts[k] += 1;
        }
    }
    for (k, mut m) in means.axis_iter_mut(Axis(0)).enumerate() {
        if counts[k] > 0 {
            m /= counts[k] as f64;
        }
    }
    means
}
