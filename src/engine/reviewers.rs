use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::ReviewerMode;
use crate::scm::Actor;

/// Picks at most `limit` reviewers from `candidates`.
///
/// `Linear` takes the first candidates in order, `Random` takes the head of a uniform
/// permutation drawn from `rng`.
pub fn select_reviewers<R: Rng + ?Sized>(
    candidates: &[Actor],
    limit: usize,
    mode: ReviewerMode,
    rng: &mut R,
) -> Vec<Actor> {
    let limit = limit.min(candidates.len());
    match mode {
        ReviewerMode::Linear => candidates[..limit].to_vec(),
        ReviewerMode::Random => {
            let mut shuffled = candidates.to_vec();
            shuffled.shuffle(rng);
            shuffled.truncate(limit);
            shuffled
        }
    }
}

/// Numeric ids of `reviewers`. Reviewers without a valid id are dropped with a warning.
pub fn reviewer_ids(reviewers: &[Actor]) -> Vec<u64> {
    reviewers
        .iter()
        .filter_map(|reviewer| {
            let id = reviewer.numeric_id();
            if id.is_none() {
                tracing::warn!("Invalid reviewer ID {:?}, skipping", reviewer.id);
            }
            id
        })
        .collect()
}
