//! GAMP categories, classifier signals and categorization results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// GAMP software category (1, 3, 4, 5)
///
/// Serialized as the bare category number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum GampCategory {
    /// Infrastructure software
    Category1,
    /// Non-configured products
    Category3,
    /// Configured products
    Category4,
    /// Custom applications
    Category5,
}

impl GampCategory {
    pub const ALL: [GampCategory; 4] = [
        GampCategory::Category1,
        GampCategory::Category3,
        GampCategory::Category4,
        GampCategory::Category5,
    ];

    pub fn number(self) -> u8 {
        match self {
            Self::Category1 => 1,
            Self::Category3 => 3,
            Self::Category4 => 4,
            Self::Category5 => 5,
        }
    }

    /// Rank used for tie-breaking; higher means riskier
    pub fn risk_rank(self) -> u8 {
        match self {
            Self::Category1 => 0,
            Self::Category3 => 1,
            Self::Category4 => 2,
            Self::Category5 => 3,
        }
    }
}

impl TryFrom<u8> for GampCategory {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Category1),
            3 => Ok(Self::Category3),
            4 => Ok(Self::Category4),
            5 => Ok(Self::Category5),
            other => Err(format!("invalid GAMP category {other} (expected 1, 3, 4 or 5)")),
        }
    }
}

impl From<GampCategory> for u8 {
    fn from(category: GampCategory) -> Self {
        category.number()
    }
}

impl fmt::Display for GampCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Category {}", self.number())
    }
}

/// Indicator counts reported by the classifier for one category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalCounts {
    #[serde(default)]
    pub strong: u32,
    #[serde(default)]
    pub weak: u32,
    #[serde(default)]
    pub exclusion: u32,
}

impl SignalCounts {
    pub fn new(strong: u32, weak: u32, exclusion: u32) -> Self {
        Self {
            strong,
            weak,
            exclusion,
        }
    }

    pub fn total(&self) -> u32 {
        self.strong + self.weak + self.exclusion
    }
}

/// Raw response from the classifier oracle
///
/// Signals are keyed by category number so that unknown categories can be
/// detected instead of silently dropped during deserialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassifierResponse {
    pub signals: BTreeMap<u8, SignalCounts>,

    /// Category the oracle's confidence refers to
    #[serde(default)]
    pub predicted_category: Option<u8>,

    /// Confidence for the predicted category only
    #[serde(default)]
    pub confidence: Option<f64>,

    /// Confidences the oracle explicitly reports for competing categories
    #[serde(default)]
    pub alternative_confidences: BTreeMap<u8, f64>,

    /// Oracle-side risk flag (e.g. patient-safety impact)
    #[serde(default)]
    pub risk_flag: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Authoritative categorization for a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub predicted: GampCategory,

    /// Oracle-reported confidence for `predicted`
    pub confidence: f64,

    pub ambiguous: bool,

    /// Top authoritative score minus the runner-up (or minus zero)
    pub dominance_gap: f64,

    pub signals: BTreeMap<GampCategory, SignalCounts>,

    /// Weighted signal scores, used for prediction only
    pub raw_scores: BTreeMap<GampCategory, f64>,

    /// Oracle-reported confidences, used for ambiguity
    pub authoritative_scores: BTreeMap<GampCategory, f64>,

    pub risk_flag: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

impl CategorizationResult {
    /// Authoritative scores sorted best first; ties rank the riskier category first
    pub fn ranked_scores(&self) -> Vec<(GampCategory, f64)> {
        let mut ranked: Vec<(GampCategory, f64)> = self
            .authoritative_scores
            .iter()
            .map(|(c, s)| (*c, *s))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then_with(|| b.0.risk_rank().cmp(&a.0.risk_rank()))
        });
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_serializes_as_number() {
        let json = serde_json::to_string(&GampCategory::Category4).unwrap();
        assert_eq!(json, "4");

        let parsed: GampCategory = serde_json::from_str("5").unwrap();
        assert_eq!(parsed, GampCategory::Category5);

        assert!(serde_json::from_str::<GampCategory>("2").is_err());
    }

    #[test]
    fn test_risk_rank_order() {
        assert!(GampCategory::Category5.risk_rank() > GampCategory::Category4.risk_rank());
        assert!(GampCategory::Category4.risk_rank() > GampCategory::Category3.risk_rank());
        assert!(GampCategory::Category3.risk_rank() > GampCategory::Category1.risk_rank());
    }

    #[test]
    fn test_classifier_response_parsing() {
        let json = r#"{
            "signals": {"5": {"strong": 8, "weak": 2}, "4": {"strong": 1, "weak": 1, "exclusion": 2}},
            "predicted_category": 5,
            "confidence": 1.0
        }"#;
        let response: ClassifierResponse = serde_json::from_str(json).unwrap();

        assert_eq!(response.signals[&5], SignalCounts::new(8, 2, 0));
        assert_eq!(response.confidence, Some(1.0));
        assert!(response.alternative_confidences.is_empty());
        assert!(!response.risk_flag);
    }
}
