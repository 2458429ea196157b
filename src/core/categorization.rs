//! GAMP categorization from classifier signals.
//!
//! The engine turns one classifier response into one authoritative
//! [`CategorizationResult`]:
//! - raw signal scores decide the predicted category (ties go to the riskier one)
//! - the oracle's confidence for that category is the only confidence
//! - ambiguity compares authoritative confidences, never raw scores
//!
//! Anything the oracle omits or gets wrong is a
//! [`WorkflowError::ClassificationOracle`]; nothing is defaulted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{CategorizationResult, ClassifierResponse, GampCategory, SignalCounts};
use crate::error::{WorkflowError, WorkflowResult};

/// Tunable scoring and threshold parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationPolicy {
    #[serde(default = "default_strong_weight")]
    pub strong_weight: f64,

    #[serde(default = "default_weak_weight")]
    pub weak_weight: f64,

    #[serde(default = "default_exclusion_weight")]
    pub exclusion_weight: f64,

    /// Score of a category with no net evidence
    #[serde(default = "default_midpoint")]
    pub midpoint: f64,

    /// Top two authoritative scores closer than this are ambiguous
    #[serde(default = "default_dominance_gap_threshold")]
    pub dominance_gap_threshold: f64,

    /// Both contenders must reach this for ambiguity to apply
    #[serde(default = "default_ambiguity_floor")]
    pub ambiguity_floor: f64,

    /// Predictions below this confidence need consultation
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
}

fn default_strong_weight() -> f64 {
    0.4
}

fn default_weak_weight() -> f64 {
    0.2
}

fn default_exclusion_weight() -> f64 {
    0.3
}

fn default_midpoint() -> f64 {
    0.5
}

fn default_dominance_gap_threshold() -> f64 {
    0.20
}

fn default_ambiguity_floor() -> f64 {
    0.5
}

fn default_confidence_floor() -> f64 {
    0.7
}

impl Default for CategorizationPolicy {
    fn default() -> Self {
        Self {
            strong_weight: default_strong_weight(),
            weak_weight: default_weak_weight(),
            exclusion_weight: default_exclusion_weight(),
            midpoint: default_midpoint(),
            dominance_gap_threshold: default_dominance_gap_threshold(),
            ambiguity_floor: default_ambiguity_floor(),
            confidence_floor: default_confidence_floor(),
        }
    }
}

impl CategorizationPolicy {
    pub fn validate(&self) -> WorkflowResult<()> {
        for (name, weight) in [
            ("strong_weight", self.strong_weight),
            ("weak_weight", self.weak_weight),
            ("exclusion_weight", self.exclusion_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(WorkflowError::Configuration(format!(
                    "categorization.{} must be a non-negative number, got {}",
                    name, weight
                )));
            }
        }

        for (name, value) in [
            ("midpoint", self.midpoint),
            ("dominance_gap_threshold", self.dominance_gap_threshold),
            ("ambiguity_floor", self.ambiguity_floor),
            ("confidence_floor", self.confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(WorkflowError::Configuration(format!(
                    "categorization.{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        Ok(())
    }
}

/// Derives categorization results from classifier responses
#[derive(Debug, Clone, Default)]
pub struct CategorizationEngine {
    policy: CategorizationPolicy,
}

impl CategorizationEngine {
    pub fn new(policy: CategorizationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CategorizationPolicy {
        &self.policy
    }

    /// Weighted signal score, clamped to [0, 1] around the midpoint
    pub fn raw_score(&self, counts: &SignalCounts) -> f64 {
        let p = &self.policy;
        let weighted = p.strong_weight * counts.strong as f64 + p.weak_weight * counts.weak as f64
            - p.exclusion_weight * counts.exclusion as f64;
        let total = counts.total().max(1) as f64;

        (p.midpoint + weighted / total).clamp(0.0, 1.0)
    }

    pub fn categorize(&self, response: &ClassifierResponse) -> WorkflowResult<CategorizationResult> {
        let diagnostics = serde_json::to_string(response).ok();
        let contract_error = |message: String| WorkflowError::ClassificationOracle {
            message,
            diagnostics: diagnostics.clone(),
        };

        if response.signals.is_empty() {
            return Err(contract_error("classifier returned no signals".to_string()));
        }

        let mut signals = BTreeMap::new();
        for (number, counts) in &response.signals {
            let category = GampCategory::try_from(*number).map_err(&contract_error)?;
            signals.insert(category, *counts);
        }

        let raw_scores: BTreeMap<GampCategory, f64> = signals
            .iter()
            .map(|(category, counts)| (*category, self.raw_score(counts)))
            .collect();

        let predicted = raw_scores
            .iter()
            .max_by(|a, b| {
                a.1.total_cmp(b.1)
                    .then_with(|| a.0.risk_rank().cmp(&b.0.risk_rank()))
            })
            .map(|(category, _)| *category)
            .ok_or_else(|| contract_error("classifier returned no signals".to_string()))?;

        let confidence = response
            .confidence
            .ok_or_else(|| contract_error("classifier returned no confidence".to_string()))?;
        check_unit_interval(confidence).map_err(|m| contract_error(format!("confidence {}", m)))?;

        if let Some(number) = response.predicted_category {
            let named = GampCategory::try_from(number).map_err(&contract_error)?;
            if named != predicted {
                return Err(contract_error(format!(
                    "classifier confidence refers to {} but signals predict {}",
                    named, predicted
                )));
            }
        }

        let mut authoritative_scores = BTreeMap::new();
        authoritative_scores.insert(predicted, confidence);
        for (number, score) in &response.alternative_confidences {
            let category = GampCategory::try_from(*number).map_err(&contract_error)?;
            check_unit_interval(*score)
                .map_err(|m| contract_error(format!("confidence for {} {}", category, m)))?;
            if category == predicted {
                if *score != confidence {
                    return Err(contract_error(format!(
                        "conflicting confidences for {}: {} and {}",
                        category, confidence, score
                    )));
                }
                continue;
            }
            authoritative_scores.insert(category, *score);
        }

        let mut result = CategorizationResult {
            predicted,
            confidence,
            ambiguous: false,
            dominance_gap: 0.0,
            signals,
            raw_scores,
            authoritative_scores,
            risk_flag: response.risk_flag,
            rationale: response.rationale.clone(),
        };

        let (ambiguous, gap) = self.ambiguity(&result);
        result.ambiguous = ambiguous;
        result.dominance_gap = gap;

        debug!(
            category = predicted.number(),
            confidence,
            ambiguous,
            dominance_gap = gap,
            "Document categorized"
        );

        Ok(result)
    }

    /// Ambiguity verdict and dominance gap over the authoritative scores
    fn ambiguity(&self, result: &CategorizationResult) -> (bool, f64) {
        let ranked = result.ranked_scores();
        let top = ranked.first().map_or(0.0, |(_, s)| *s);

        match ranked.get(1) {
            Some((_, second)) => {
                let gap = top - second;
                let ambiguous = gap < self.policy.dominance_gap_threshold
                    && top >= self.policy.ambiguity_floor
                    && *second >= self.policy.ambiguity_floor;
                (ambiguous, gap)
            }
            // A sole authoritative score has nothing to be confused with
            None => (false, top),
        }
    }

    /// Recoverable problems with a result, low confidence first
    pub fn assess(&self, result: &CategorizationResult) -> WorkflowResult<()> {
        if result.confidence < self.policy.confidence_floor {
            return Err(WorkflowError::LowConfidence {
                category: result.predicted,
                confidence: result.confidence,
                floor: self.policy.confidence_floor,
            });
        }

        if result.ambiguous {
            let ranked = result.ranked_scores();
            let top = ranked.first().map_or(0.0, |(_, s)| *s);
            let second = ranked.get(1).map_or(0.0, |(_, s)| *s);
            return Err(WorkflowError::AmbiguityDetected {
                top,
                second,
                gap: result.dominance_gap,
            });
        }

        Ok(())
    }
}

fn check_unit_interval(value: f64) -> Result<(), String> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} is outside [0, 1]", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(signals: &[(u8, SignalCounts)], predicted: Option<u8>, confidence: Option<f64>) -> ClassifierResponse {
        ClassifierResponse {
            signals: signals.iter().copied().collect(),
            predicted_category: predicted,
            confidence,
            ..Default::default()
        }
    }

    #[test]
    fn test_strong_category_five_is_unambiguous() {
        let engine = CategorizationEngine::default();
        let result = engine
            .categorize(&response(
                &[(5, SignalCounts::new(8, 2, 0)), (4, SignalCounts::new(1, 1, 2))],
                Some(5),
                Some(1.0),
            ))
            .unwrap();

        assert_eq!(result.predicted, GampCategory::Category5);
        assert_eq!(result.confidence, 1.0);
        assert!(!result.ambiguous);
        assert!(engine.assess(&result).is_ok());
    }

    #[test]
    fn test_raw_scores_never_drive_ambiguity() {
        // Raw scores for 3 and 4 are nearly identical; the oracle only
        // reports confidence for the prediction
        let engine = CategorizationEngine::default();
        let result = engine
            .categorize(&response(
                &[(4, SignalCounts::new(3, 1, 0)), (3, SignalCounts::new(3, 1, 0))],
                Some(4),
                Some(0.9),
            ))
            .unwrap();

        assert_eq!(result.raw_scores[&GampCategory::Category3], result.raw_scores[&GampCategory::Category4]);
        assert_eq!(result.authoritative_scores.len(), 1);
        assert!(!result.ambiguous);
        assert_eq!(result.dominance_gap, 0.9);
    }

    #[test]
    fn test_low_confidence_is_reported() {
        let engine = CategorizationEngine::default();
        let result = engine
            .categorize(&response(&[(4, SignalCounts::new(2, 1, 0))], Some(4), Some(0.45)))
            .unwrap();

        match engine.assess(&result) {
            Err(WorkflowError::LowConfidence {
                category,
                confidence,
                floor,
            }) => {
                assert_eq!(category, GampCategory::Category4);
                assert_eq!(confidence, 0.45);
                assert_eq!(floor, 0.7);
            }
            other => panic!("expected low confidence, got {:?}", other),
        }
    }

    #[test]
    fn test_close_authoritative_scores_are_ambiguous() {
        let engine = CategorizationEngine::default();
        let mut resp = response(
            &[(4, SignalCounts::new(4, 1, 0)), (5, SignalCounts::new(3, 2, 0))],
            Some(4),
            Some(0.82),
        );
        resp.alternative_confidences.insert(5, 0.80);

        let result = engine.categorize(&resp).unwrap();
        assert_eq!(result.predicted, GampCategory::Category4);
        assert!(result.ambiguous);
        assert!((result.dominance_gap - 0.02).abs() < 1e-9);
        assert!(matches!(
            engine.assess(&result),
            Err(WorkflowError::AmbiguityDetected { .. })
        ));
    }

    #[test]
    fn test_close_scores_below_floor_are_not_ambiguous() {
        let engine = CategorizationEngine::default();
        let mut resp = response(&[(3, SignalCounts::new(1, 0, 0))], Some(3), Some(0.45));
        resp.alternative_confidences.insert(1, 0.40);

        let result = engine.categorize(&resp).unwrap();
        assert!(!result.ambiguous);
    }

    #[test]
    fn test_ties_break_toward_higher_risk() {
        let engine = CategorizationEngine::default();
        let result = engine
            .categorize(&response(
                &[(3, SignalCounts::new(2, 0, 0)), (4, SignalCounts::new(2, 0, 0))],
                None,
                Some(0.8),
            ))
            .unwrap();
        assert_eq!(result.predicted, GampCategory::Category4);
    }

    #[test]
    fn test_raw_score_formula() {
        let engine = CategorizationEngine::default();
        // 0.5 + (0.4*8 + 0.2*2 - 0) / 10 = 0.86
        assert!((engine.raw_score(&SignalCounts::new(8, 2, 0)) - 0.86).abs() < 1e-9);
        // 0.5 + (0.4 + 0.2 - 0.6) / 4 = 0.5
        assert!((engine.raw_score(&SignalCounts::new(1, 1, 2)) - 0.5).abs() < 1e-9);
        assert_eq!(engine.raw_score(&SignalCounts::default()), 0.5);
        assert!((engine.raw_score(&SignalCounts::new(0, 0, 5)) - 0.2).abs() < 1e-9);
        assert_eq!(engine.raw_score(&SignalCounts::new(0, 0, 1)), 0.2);
    }

    #[test]
    fn test_oracle_contract_violations() {
        let engine = CategorizationEngine::default();
        let cases = vec![
            response(&[(5, SignalCounts::new(1, 0, 0))], Some(5), None),
            response(&[], Some(5), Some(0.9)),
            response(&[(2, SignalCounts::new(1, 0, 0))], None, Some(0.9)),
            response(&[(5, SignalCounts::new(1, 0, 0))], Some(5), Some(1.5)),
            response(
                &[(5, SignalCounts::new(5, 0, 0)), (3, SignalCounts::new(0, 1, 0))],
                Some(3),
                Some(0.9),
            ),
        ];

        for case in cases {
            let result = engine.categorize(&case);
            assert!(
                matches!(result, Err(WorkflowError::ClassificationOracle { .. })),
                "expected oracle error for {:?}, got {:?}",
                case,
                result
            );
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(CategorizationPolicy::default().validate().is_ok());

        let bad = CategorizationPolicy {
            confidence_floor: 1.2,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(WorkflowError::Configuration(_))));
    }
}
