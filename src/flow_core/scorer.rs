//! Route risk scoring against the current correlated analysis

use super::correlator::CorrelatedAnalysis;
use super::normalizer::RouteRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recommendation {
    #[serde(rename = "FIND_ALTERNATIVE")]
    FindAlternative,
    #[serde(rename = "CAUTION_ADVISED")]
    CautionAdvised,
    #[serde(rename = "ROUTE_OK")]
    RouteOk,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::FindAlternative => "FIND_ALTERNATIVE",
            Recommendation::CautionAdvised => "CAUTION_ADVISED",
            Recommendation::RouteOk => "ROUTE_OK",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRecommendation {
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
    /// Whether an analysis existed for the bound segment
    pub matched: bool,
    pub adjusted_eta: f64,
    pub risk_level: f64,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingThresholds {
    pub alternative_congestion_index: f64,
    pub alternative_event_count: u64,
    pub critical_severity: u32,
    pub elevated_severity: u32,
    pub caution_risk: f64,
}

impl RoutingThresholds {
    pub fn with_defaults() -> Self {
        Self {
            alternative_congestion_index: 0.6,
            alternative_event_count: 1,
            critical_severity: 4,
            elevated_severity: 2,
            caution_risk: 0.5,
        }
    }
}

impl Default for RoutingThresholds {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct RoutingRiskScorer {
    thresholds: RoutingThresholds,
}

impl RoutingRiskScorer {
    pub fn new(thresholds: RoutingThresholds) -> Self {
        Self { thresholds }
    }

    pub fn with_defaults() -> Self {
        Self::new(RoutingThresholds::with_defaults())
    }

    /// estimated_time * (1 + max(0, 1 - congestion_index))
    pub fn adjusted_eta(&self, estimated_time: f64, congestion_index: f64) -> f64 {
        estimated_time * (1.0 + (1.0 - congestion_index).max(0.0))
    }

    /// 1.0 for critical severity, 0.5 for elevated, else 0.0
    pub fn risk_score(&self, max_severity: u32) -> f64 {
        if max_severity >= self.thresholds.critical_severity {
            1.0
        } else if max_severity >= self.thresholds.elevated_severity {
            0.5
        } else {
            0.0
        }
    }

    /// Score a request against the analysis for its bound segment.
    ///
    /// With no analysis the congestion index is coalesced to 0.0, which applies
    /// the full ETA penalty and asks for an alternative. Incident fields
    /// default to zero.
    pub fn score(
        &self,
        request: &RouteRequest,
        analysis: Option<&CorrelatedAnalysis>,
    ) -> RouteRecommendation {
        let congestion_index = analysis.map_or(0.0, |a| a.congestion_index);
        let event_count = analysis.map_or(0, |a| a.event_count);
        let max_severity = analysis.map_or(0, |a| a.max_severity);

        let adjusted_eta = self.adjusted_eta(request.estimated_time, congestion_index);
        let risk_level = self.risk_score(max_severity);
        let alternative_needed = congestion_index < self.thresholds.alternative_congestion_index
            || event_count > self.thresholds.alternative_event_count;

        let recommendation = if alternative_needed {
            Recommendation::FindAlternative
        } else if risk_level > self.thresholds.caution_risk {
            Recommendation::CautionAdvised
        } else {
            Recommendation::RouteOk
        };

        RouteRecommendation {
            route_id: request.route_id.clone(),
            segment_id: request.segment_id.clone(),
            matched: analysis.is_some(),
            adjusted_eta,
            risk_level,
            recommendation,
        }
    }
}
