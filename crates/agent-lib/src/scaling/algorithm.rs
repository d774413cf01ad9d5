//! Scale recommendation algorithm
//!
//! Pure function over per-application ELU means. Scale-downs are unbounded
//! per cycle; at most one application scales up, either under the worker cap
//! or by reallocating a worker from the least loaded application.

use crate::models::{AppInfo, ScaleDirection, ScaleRecommendation};
use std::cmp::Ordering;

/// Thresholds and limits driving [`recommend`].
#[derive(Debug, Clone)]
pub struct ScalerOptions {
    /// Cap on the total number of workers across applications.
    pub max_workers: u32,
    pub scale_up_elu: f64,
    pub scale_down_elu: f64,
    /// Minimum ELU gap required to reallocate a worker at the cap.
    pub min_elu_diff: f64,
}

impl Default for ScalerOptions {
    fn default() -> Self {
        Self {
            max_workers: 10,
            scale_up_elu: 0.8,
            scale_down_elu: 0.2,
            min_elu_diff: 0.2,
        }
    }
}

/// Produce scale recommendations for one cycle.
///
/// Applications are ordered by ELU ascending (worker count descending on
/// ties); the emission order of recommendations follows that ordering and is
/// part of the contract.
pub fn recommend(apps: &[AppInfo], options: &ScalerOptions) -> Vec<ScaleRecommendation> {
    if apps.is_empty() {
        return Vec::new();
    }

    let mut sorted: Vec<AppInfo> = apps.to_vec();
    sorted.sort_by(|a, b| {
        a.elu
            .partial_cmp(&b.elu)
            .unwrap_or(Ordering::Equal)
            .then(b.worker_count.cmp(&a.worker_count))
    });

    let mut recommendations = Vec::new();
    let mut post_workers: Vec<u32> = sorted.iter().map(|app| app.worker_count).collect();

    for (i, app) in sorted.iter().enumerate() {
        if app.elu < options.scale_down_elu && app.worker_count > 1 {
            post_workers[i] -= 1;
            recommendations.push(ScaleRecommendation {
                application_id: app.application_id.clone(),
                workers: post_workers[i],
                direction: ScaleDirection::Down,
            });
        }
    }

    let candidate_idx = sorted.len() - 1;
    let candidate = &sorted[candidate_idx];
    if candidate.elu > options.scale_up_elu {
        let total: u32 = post_workers.iter().sum();
        if total < options.max_workers {
            recommendations.push(ScaleRecommendation {
                application_id: candidate.application_id.clone(),
                workers: post_workers[candidate_idx] + 1,
                direction: ScaleDirection::Up,
            });
        } else {
            let donor = &sorted[0];
            let worker_gap = post_workers[0].saturating_sub(post_workers[candidate_idx]);
            if donor.application_id != candidate.application_id
                && post_workers[0] > 1
                && (candidate.elu - donor.elu >= options.min_elu_diff || worker_gap >= 2)
            {
                recommendations.push(ScaleRecommendation {
                    application_id: donor.application_id.clone(),
                    workers: post_workers[0] - 1,
                    direction: ScaleDirection::Down,
                });
                recommendations.push(ScaleRecommendation {
                    application_id: candidate.application_id.clone(),
                    workers: post_workers[candidate_idx] + 1,
                    direction: ScaleDirection::Up,
                });
            }
        }
    }

    recommendations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(id: &str, workers: u32, elu: f64) -> AppInfo {
        AppInfo {
            application_id: id.to_string(),
            elu,
            worker_count: workers,
        }
    }

    fn options(max_workers: u32) -> ScalerOptions {
        ScalerOptions {
            max_workers,
            ..ScalerOptions::default()
        }
    }

    #[test]
    fn test_scale_up_under_limit() {
        let apps = vec![app("A", 2, 0.85), app("B", 1, 0.30)];

        let recs = recommend(&apps, &options(10));

        assert_eq!(
            recs,
            vec![ScaleRecommendation {
                application_id: "A".to_string(),
                workers: 3,
                direction: ScaleDirection::Up,
            }]
        );
    }

    #[test]
    fn test_reallocation_at_limit() {
        let apps = vec![app("A", 2, 0.9), app("B", 2, 0.15)];

        let recs = recommend(&apps, &options(4));

        assert_eq!(
            recs,
            vec![
                ScaleRecommendation {
                    application_id: "B".to_string(),
                    workers: 1,
                    direction: ScaleDirection::Down,
                },
                ScaleRecommendation {
                    application_id: "A".to_string(),
                    workers: 3,
                    direction: ScaleDirection::Up,
                },
            ]
        );
    }

    #[test]
    fn test_noop_when_elu_gap_insufficient() {
        let apps = vec![app("A", 3, 0.85), app("B", 3, 0.70)];

        let recs = recommend(&apps, &options(6));

        assert!(recs.is_empty());
    }

    #[test]
    fn test_reallocation_by_worker_count_gap() {
        // ELU gap below minELUDiff, but the donor has two more workers
        let apps = vec![app("A", 2, 0.95), app("B", 4, 0.81)];

        let recs = recommend(&apps, &options(6));

        assert_eq!(
            recs,
            vec![
                ScaleRecommendation {
                    application_id: "B".to_string(),
                    workers: 3,
                    direction: ScaleDirection::Down,
                },
                ScaleRecommendation {
                    application_id: "A".to_string(),
                    workers: 3,
                    direction: ScaleDirection::Up,
                },
            ]
        );
    }

    #[test]
    fn test_scale_down_never_below_one_worker() {
        let apps = vec![app("A", 1, 0.05), app("B", 2, 0.5)];

        let recs = recommend(&apps, &options(10));

        assert!(recs.is_empty());
    }

    #[test]
    fn test_multiple_apps_scale_down_in_one_cycle() {
        let apps = vec![app("A", 3, 0.05), app("B", 2, 0.1), app("C", 2, 0.5)];

        let recs = recommend(&apps, &options(10));

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].application_id, "A");
        assert_eq!(recs[0].workers, 2);
        assert_eq!(recs[1].application_id, "B");
        assert_eq!(recs[1].workers, 1);
    }

    #[test]
    fn test_single_app_never_reallocates_from_itself() {
        let apps = vec![app("A", 4, 0.95)];

        let recs = recommend(&apps, &options(4));

        assert!(recs.is_empty());
    }

    #[test]
    fn test_tie_break_prefers_larger_app_as_candidate() {
        // equal ELU: the sort places the larger app first, so the smaller
        // one becomes the scale-up candidate
        let apps = vec![app("A", 4, 0.9), app("B", 1, 0.9)];

        let recs = recommend(&apps, &options(10));

        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].application_id, "B");
        assert_eq!(recs[0].direction, ScaleDirection::Up);
    }

    #[test]
    fn test_deterministic_over_repeated_input() {
        let apps = vec![app("A", 2, 0.85), app("B", 3, 0.1), app("C", 1, 0.4)];
        let opts = options(10);

        let first = recommend(&apps, &opts);
        let second = recommend(&apps, &opts);

        assert_eq!(first, second);
    }
}
