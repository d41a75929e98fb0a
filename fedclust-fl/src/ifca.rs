//! Cluster identity estimation for IFCA clients
//!
//! The orchestrator ships one shared base plus one personalization block per
//! cluster. A client tries every `base ++ block_k` hybrid on its validation
//! data and joins the cluster whose hybrid has the lowest loss.

use fedclust_ai::{ParameterSplit, ParameterVector};
use rand::Rng;
use tracing::{debug, info};

use crate::error::ClientError;

/// Evaluates every hybrid and returns the index with the lowest loss.
///
/// Ties go to the lowest index: the running best is only replaced by a
/// strictly lower loss. Runs `split.n_clusters()` validation passes.
pub fn estimate_cluster_identity<F>(
    split: &ParameterSplit<'_>,
    mut eval: F,
) -> Result<usize, ClientError>
where
    F: FnMut(ParameterVector) -> Result<f32, ClientError>,
{
    let mut best: Option<(usize, f32)> = None;
    for k in 0..split.n_clusters() {
        let loss = eval(split.hybrid(k)?)?;
        debug!("Cluster {} hybrid loss {:.6}", k, loss);
        match best {
            Some((_, best_loss)) if loss >= best_loss || loss.is_nan() => {}
            _ => best = Some((k, loss)),
        }
    }
    // n_clusters >= 1 is enforced by ParameterSplit::new
    Ok(best.map(|(k, _)| k).unwrap_or(0))
}

/// Picks the cluster for this round.
///
/// Round 1 has no trained personalization blocks yet, so the cluster is drawn
/// uniformly from `0..n_clusters` without evaluating anything.
pub fn assign_cluster<R, F>(
    round: u64,
    split: &ParameterSplit<'_>,
    rng: &mut R,
    eval: F,
) -> Result<usize, ClientError>
where
    R: Rng + ?Sized,
    F: FnMut(ParameterVector) -> Result<f32, ClientError>,
{
    let cluster = if round <= 1 {
        let k = rng.gen_range(0..split.n_clusters());
        debug!("Round {}: random cluster {}", round, k);
        k
    } else {
        estimate_cluster_identity(split, eval)?
    };
    info!("Round {}: assigned to cluster {}", round, cluster);
    Ok(cluster)
}
