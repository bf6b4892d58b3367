//! Ranking of merged candidate lists.
//!
//! `score = 0.55 * cat_overlap + 0.45 * designer_overlap + quality` where
//! `quality = avgscore + 0.15 * log10(numvotes + 1)`.

use super::{GameStats, GameStore, StoreResult};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

const CATEGORY_WEIGHT: f64 = 0.55;
const DESIGNER_WEIGHT: f64 = 0.45;
const VOTES_WEIGHT: f64 = 0.15;

/// One entry of a candidate list as callers send it: either a bare game id
/// or a candidate object carrying overlap counts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CandidateSignal {
    Id(i64),
    Overlaps {
        g_id: i64,
        #[serde(default)]
        cat_overlap: Option<f64>,
        #[serde(default)]
        designer_overlap: Option<f64>,
    },
}

impl CandidateSignal {
    /// Decodes a raw list, dropping entries that are neither an id nor a
    /// candidate object.
    pub fn from_values(values: &[Value]) -> Vec<CandidateSignal> {
        values
            .iter()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    fn g_id(&self) -> i64 {
        match self {
            CandidateSignal::Id(g_id) | CandidateSignal::Overlaps { g_id, .. } => *g_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Overlap {
    categories: f64,
    designers: f64,
}

/// Merges signals per game, keeping the larger overlap of each kind.
/// Games appear in first-seen order.
fn merge(signals: &[CandidateSignal], exclude: &HashSet<i64>) -> Vec<(i64, Overlap)> {
    let mut order: Vec<i64> = Vec::new();
    let mut merged: HashMap<i64, Overlap> = HashMap::new();
    for signal in signals {
        let g_id = signal.g_id();
        if exclude.contains(&g_id) {
            continue;
        }
        let entry = merged.entry(g_id).or_insert_with(|| {
            order.push(g_id);
            Overlap::default()
        });
        if let CandidateSignal::Overlaps {
            cat_overlap,
            designer_overlap,
            ..
        } = signal
        {
            if let Some(c) = cat_overlap {
                entry.categories = entry.categories.max(*c);
            }
            if let Some(d) = designer_overlap {
                entry.designers = entry.designers.max(*d);
            }
        }
    }
    order
        .into_iter()
        .filter_map(|g_id| merged.get(&g_id).map(|o| (g_id, *o)))
        .collect()
}

fn score(overlap: Overlap, stats: Option<&GameStats>) -> f64 {
    let stats = stats.copied().unwrap_or_default();
    let quality = stats.avgscore + VOTES_WEIGHT * (stats.numvotes + 1.0).log10();
    CATEGORY_WEIGHT * overlap.categories + DESIGNER_WEIGHT * overlap.designers + quality
}

/// Pure ranking step: the top `limit` game ids by score, ties broken by
/// first appearance.
pub fn rank_candidates(
    signals: &[CandidateSignal],
    exclude: &[i64],
    stats: &HashMap<i64, GameStats>,
    limit: usize,
) -> Vec<i64> {
    let exclude: HashSet<i64> = exclude.iter().copied().collect();
    let mut scored: Vec<(i64, f64)> = merge(signals, &exclude)
        .into_iter()
        .map(|(g_id, overlap)| (g_id, score(overlap, stats.get(&g_id))))
        .collect();
    // Stable sort keeps first-seen order among equal scores.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.into_iter().take(limit).map(|(g_id, _)| g_id).collect()
}

/// Looks up quality stats for the merged candidates and ranks them.
pub fn score_candidates(
    store: &dyn GameStore,
    signals: &[CandidateSignal],
    exclude: &[i64],
    limit: usize,
) -> StoreResult<Vec<i64>> {
    let exclude_set: HashSet<i64> = exclude.iter().copied().collect();
    let ids: Vec<i64> = merge(signals, &exclude_set)
        .into_iter()
        .map(|(g_id, _)| g_id)
        .collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let stats = store.game_stats(&ids)?;
    Ok(rank_candidates(signals, exclude, &stats, limit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::fixture_store;
    use serde_json::json;

    fn overlaps(g_id: i64, cat: f64, des: f64) -> CandidateSignal {
        CandidateSignal::Overlaps {
            g_id,
            cat_overlap: Some(cat),
            designer_overlap: Some(des),
        }
    }

    #[test]
    fn test_overlap_ordering_without_stats() {
        let signals = vec![
            overlaps(10, 3.0, 0.0),
            overlaps(20, 2.0, 1.0),
            overlaps(30, 1.0, 2.0),
            overlaps(40, 0.0, 1.0),
            overlaps(100, 5.0, 3.0),
        ];
        let ranked = rank_candidates(&signals, &[100], &HashMap::new(), 8);
        assert_eq!(ranked, vec![10, 20, 30, 40]);

        let top_two = rank_candidates(&signals, &[100], &HashMap::new(), 2);
        assert_eq!(top_two, vec![10, 20]);
    }

    #[test]
    fn test_quality_lifts_low_overlap_game() {
        let signals = vec![overlaps(1, 2.0, 0.0), overlaps(2, 0.0, 1.0)];
        let stats = HashMap::from([
            (1, GameStats { avgscore: 5.0, numvotes: 9.0 }),
            (2, GameStats { avgscore: 8.0, numvotes: 999.0 }),
        ]);
        // 1.1 + 5.0 + 0.15 vs 0.45 + 8.0 + 0.45
        assert_eq!(rank_candidates(&signals, &[], &stats, 8), vec![2, 1]);
    }

    #[test]
    fn test_merge_keeps_max_overlap_per_kind() {
        let signals = vec![
            CandidateSignal::Overlaps {
                g_id: 7,
                cat_overlap: Some(1.0),
                designer_overlap: None,
            },
            CandidateSignal::Overlaps {
                g_id: 7,
                cat_overlap: None,
                designer_overlap: Some(2.0),
            },
            CandidateSignal::Id(7),
        ];
        let merged = merge(&signals, &HashSet::new());
        assert_eq!(
            merged,
            vec![(7, Overlap { categories: 1.0, designers: 2.0 })]
        );
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let signals = vec![
            CandidateSignal::Id(5),
            CandidateSignal::Id(3),
            CandidateSignal::Id(9),
        ];
        assert_eq!(rank_candidates(&signals, &[], &HashMap::new(), 8), vec![5, 3, 9]);
    }

    #[test]
    fn test_from_values_skips_malformed_entries() {
        let raw = vec![
            json!(4),
            json!({"g_id": 2, "cat_overlap": 2}),
            json!("seven"),
            json!({"name": "no id"}),
            json!(null),
        ];
        let signals = CandidateSignal::from_values(&raw);
        assert_eq!(
            signals,
            vec![
                CandidateSignal::Id(4),
                CandidateSignal::Overlaps {
                    g_id: 2,
                    cat_overlap: Some(2.0),
                    designer_overlap: None
                }
            ]
        );
    }

    #[test]
    fn test_score_candidates_uses_store_stats() {
        let store = fixture_store();
        // Equal overlap, so quality decides: Pandemic Legacy (8.5) beats Catan (7.1).
        let signals = vec![overlaps(1, 1.0, 0.0), overlaps(3, 1.0, 0.0), overlaps(2, 1.0, 0.0)];
        let ranked = score_candidates(&store, &signals, &[2], 8).unwrap();
        assert_eq!(ranked, vec![3, 1]);
    }

    #[test]
    fn test_score_candidates_all_excluded() {
        let store = fixture_store();
        let ranked = score_candidates(&store, &[CandidateSignal::Id(1)], &[1], 8).unwrap();
        assert!(ranked.is_empty());
    }
}
