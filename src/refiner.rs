use crate::models::Recommendation;
use std::collections::HashMap;

pub trait NarrativeRefiner: Send + Sync {
    fn refine(&self, account_id: &str, drafts: &[Recommendation]) -> anyhow::Result<Vec<Recommendation>>;
}

#[derive(Debug, Default, Clone)]
pub struct NoopRefiner;

impl NarrativeRefiner for NoopRefiner {
    fn refine(&self, _account_id: &str, drafts: &[Recommendation]) -> anyhow::Result<Vec<Recommendation>> {
        Ok(drafts.to_vec())
    }
}

pub fn merge_rationales(drafts: &mut [Recommendation], refined: Vec<Recommendation>) -> usize {
    let mut by_audience = refined
        .into_iter()
        .filter(|rec| !rec.rationale.trim().is_empty())
        .map(|rec| (rec.audience_id, rec.rationale))
        .collect::<HashMap<_, _>>();

    let mut unchanged = 0;
    for draft in drafts.iter_mut() {
        match by_audience.remove(&draft.audience_id) {
            Some(rationale) => draft.rationale = rationale,
            None => unchanged += 1,
        }
    }
    unchanged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PerformanceLabel, RecommendedAction};
    use chrono::Utc;

    fn draft(audience_id: &str, action: RecommendedAction, magnitude: f64) -> Recommendation {
        Recommendation {
            id: format!("rec-{}", audience_id),
            audience_id: audience_id.to_string(),
            generated_at: Utc::now(),
            label: PerformanceLabel::Winner,
            action,
            magnitude,
            rationale: "rule".to_string(),
            audience_name: None,
            audience_type: None,
        }
    }

    #[test]
    fn merge_only_touches_rationale() {
        let mut drafts = vec![
            draft("a", RecommendedAction::Scale, 15.0),
            draft("b", RecommendedAction::Hold, 0.0),
        ];
        let mut refined = draft("a", RecommendedAction::Pause, 90.0);
        refined.rationale = "strong week, keep pushing".to_string();
        let mut blank = draft("b", RecommendedAction::Scale, 50.0);
        blank.rationale = "  ".to_string();

        let unchanged = merge_rationales(&mut drafts, vec![refined, blank, draft("zzz", RecommendedAction::Scale, 1.0)]);

        assert_eq!(unchanged, 1);
        assert_eq!(drafts[0].rationale, "strong week, keep pushing");
        assert_eq!(drafts[0].action, RecommendedAction::Scale);
        assert_eq!(drafts[0].magnitude, 15.0);
        assert_eq!(drafts[1].rationale, "rule");
    }
}
