//! Alert classification with ordered, first-match-wins thresholds

use super::correlator::CorrelatedAnalysis;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertType {
    #[serde(rename = "SEVERE_CONGESTION")]
    SevereCongestion,
    #[serde(rename = "MULTIPLE_INCIDENTS")]
    MultipleIncidents,
    #[serde(rename = "CRITICAL_EVENT")]
    CriticalEvent,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::SevereCongestion => "SEVERE_CONGESTION",
            AlertType::MultipleIncidents => "MULTIPLE_INCIDENTS",
            AlertType::CriticalEvent => "CRITICAL_EVENT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub segment_id: String,
    pub details: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierThresholds {
    /// congestion_index strictly below this is severe congestion
    pub severe_congestion_index: f64,
    /// event_count strictly above this is multiple incidents
    pub multiple_incidents_count: u64,
    /// max_severity at or above this is a critical event
    pub critical_severity: u32,
}

impl ClassifierThresholds {
    pub fn with_defaults() -> Self {
        Self {
            severe_congestion_index: 0.5,
            multiple_incidents_count: 2,
            critical_severity: 4,
        }
    }
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self::with_defaults()
    }
}

pub struct AlertClassifier {
    thresholds: ClassifierThresholds,
}

impl AlertClassifier {
    pub fn new(thresholds: ClassifierThresholds) -> Self {
        Self { thresholds }
    }

    pub fn with_defaults() -> Self {
        Self::new(ClassifierThresholds::with_defaults())
    }

    /// Pick at most one alert type for the given values.
    ///
    /// # Priority
    /// SEVERE_CONGESTION, then MULTIPLE_INCIDENTS, then CRITICAL_EVENT. A
    /// congested segment is always reported as congestion even when incident
    /// thresholds are also met.
    pub fn classify_values(
        &self,
        congestion_index: f64,
        event_count: u64,
        max_severity: u32,
    ) -> Option<AlertType> {
        if congestion_index < self.thresholds.severe_congestion_index {
            return Some(AlertType::SevereCongestion);
        }

        if event_count > self.thresholds.multiple_incidents_count {
            return Some(AlertType::MultipleIncidents);
        }

        if max_severity >= self.thresholds.critical_severity {
            return Some(AlertType::CriticalEvent);
        }

        None
    }

    pub fn classify(&self, analysis: &CorrelatedAnalysis) -> Option<Alert> {
        let alert_type = self.classify_values(
            analysis.congestion_index,
            analysis.event_count,
            analysis.max_severity,
        )?;

        Some(Alert {
            alert_type,
            segment_id: analysis.segment_id.clone(),
            details: format!(
                "Congestion: {:.3}, Events: {}",
                analysis.congestion_index, analysis.event_count
            ),
            timestamp: analysis.update_time,
        })
    }
}
