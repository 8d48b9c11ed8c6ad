//! Record normalization from JSONL lines to typed telemetry records

use chrono::{DateTime, NaiveDateTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A source record that failed schema or type validation.
#[derive(Debug)]
pub enum RecordError {
    Parse(serde_json::Error),
    Invalid(String),
}

impl From<serde_json::Error> for RecordError {
    fn from(err: serde_json::Error) -> Self {
        RecordError::Parse(err)
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::Parse(e) => write!(f, "Malformed record: {}", e),
            RecordError::Invalid(msg) => write!(f, "Invalid record: {}", msg),
        }
    }
}

impl std::error::Error for RecordError {}

/// Typed input record that can be parsed from a single JSONL line.
pub trait Record: DeserializeOwned + Serialize {
    /// Reject values serde accepts but the engine cannot use
    fn validate(&self) -> Result<(), RecordError>;

    fn from_jsonl(line: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(line)?;
        record.validate()?;
        Ok(record)
    }
}

/// Record that carries an event time and can be windowed.
pub trait TimedRecord: Record {
    fn timestamp(&self) -> i64;

    fn record_id(&self) -> Option<&str>;

    /// Identity used for replay de-duplication: the source id when present,
    /// otherwise a hash of the record content.
    fn dedup_key(&self) -> String {
        if let Some(id) = self.record_id() {
            return format!("id:{}", id);
        }
        let content = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        format!("hash:{:016x}", hasher.finish())
    }
}

/// Parse a timestamp given as Unix seconds, RFC 3339, or `YYYY-MM-DD HH:MM:SS` (UTC)
pub fn parse_timestamp(raw: &str) -> Result<i64, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return Ok(secs);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|dt| dt.and_utc().timestamp())
        .map_err(|_| format!("unrecognized timestamp '{}'", raw))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Secs(i64),
        Text(String),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Secs(secs) => Ok(secs),
        RawTimestamp::Text(text) => parse_timestamp(&text).map_err(serde::de::Error::custom),
    }
}

/// Event times must be representable as a calendar date
fn check_timestamp(timestamp: i64) -> Result<(), RecordError> {
    if DateTime::from_timestamp(timestamp, 0).is_none() {
        return Err(RecordError::Invalid(format!(
            "timestamp out of range: {}",
            timestamp
        )));
    }
    Ok(())
}

fn check_coordinate(lat: f64, lon: f64) -> Result<(), RecordError> {
    if !lat.is_finite() || !lon.is_finite() || lat.abs() > 90.0 || lon.abs() > 180.0 {
        return Err(RecordError::Invalid(format!(
            "coordinate out of range: ({}, {})",
            lat, lon
        )));
    }
    Ok(())
}

fn check_non_negative(name: &str, value: f64) -> Result<(), RecordError> {
    if !value.is_finite() || value < 0.0 {
        return Err(RecordError::Invalid(format!("{} must be >= 0, got {}", name, value)));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: i64,
    pub event_type: String,
    pub latitude: f64,
    pub longitude: f64,
    pub severity: u32,
    #[serde(default)]
    pub description: String,
}

impl Record for IncidentEvent {
    fn validate(&self) -> Result<(), RecordError> {
        check_timestamp(self.timestamp)?;
        check_coordinate(self.latitude, self.longitude)
    }
}

impl TimedRecord for IncidentEvent {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSample {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: i64,
    pub segment_id: String,
    pub speed: f64,
    pub free_flow_speed: f64,
    /// Provider-reported congestion level, carried through but not used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_level: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl FlowSample {
    /// speed / free_flow_speed, undefined when free_flow_speed <= 0
    pub fn congestion_ratio(&self) -> Option<f64> {
        if self.free_flow_speed > 0.0 {
            Some(self.speed / self.free_flow_speed)
        } else {
            None
        }
    }

    pub fn coordinate(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => None,
        }
    }
}

impl Record for FlowSample {
    fn validate(&self) -> Result<(), RecordError> {
        check_timestamp(self.timestamp)?;
        if self.segment_id.trim().is_empty() {
            return Err(RecordError::Invalid("segment_id cannot be empty".to_string()));
        }
        check_non_negative("speed", self.speed)?;
        if !self.free_flow_speed.is_finite() {
            return Err(RecordError::Invalid("free_flow_speed must be finite".to_string()));
        }
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) => check_coordinate(lat, lon),
            (None, None) => Ok(()),
            _ => Err(RecordError::Invalid(
                "latitude and longitude must be given together".to_string(),
            )),
        }
    }
}

impl TimedRecord for FlowSample {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn record_id(&self) -> Option<&str> {
        self.record_id.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRequest {
    pub route_id: String,
    pub start_lat: f64,
    pub start_lon: f64,
    pub end_lat: f64,
    pub end_lon: f64,
    /// Baseline travel time
    pub estimated_time: f64,
    pub distance: f64,
    /// Segment binding supplied by the routing collaborator
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segment_id: Option<String>,
}

impl Record for RouteRequest {
    fn validate(&self) -> Result<(), RecordError> {
        if self.route_id.trim().is_empty() {
            return Err(RecordError::Invalid("route_id cannot be empty".to_string()));
        }
        check_coordinate(self.start_lat, self.start_lon)?;
        check_coordinate(self.end_lat, self.end_lon)?;
        check_non_negative("estimated_time", self.estimated_time)?;
        check_non_negative("distance", self.distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_incident_jsonl() {
        let line = r#"{"timestamp":1700000100,"event_type":"ACCIDENT","latitude":40.7128,"longitude":-74.006,"severity":3,"description":"Two-car collision"}"#;

        let event = IncidentEvent::from_jsonl(line).unwrap();
        assert_eq!(event.timestamp, 1700000100);
        assert_eq!(event.event_type, "ACCIDENT");
        assert_eq!(event.severity, 3);
        assert_eq!(event.description, "Two-car collision");
        assert!(event.record_id.is_none());
    }

    #[test]
    fn test_parse_flow_with_rfc3339_timestamp() {
        let line = r#"{"timestamp":"2023-11-14T22:13:20Z","segment_id":"seg-1","speed":30.0,"congestion_level":2,"free_flow_speed":60.0}"#;

        let sample = FlowSample::from_jsonl(line).unwrap();
        assert_eq!(sample.timestamp, 1700000000);
        assert_eq!(sample.congestion_level, Some(2));
        assert_eq!(sample.congestion_ratio(), Some(0.5));
        assert!(sample.coordinate().is_none());
    }

    #[test]
    fn test_out_of_range_timestamp_is_invalid() {
        let line = r#"{"timestamp":9223372036854775807,"segment_id":"seg-1","speed":30.0,"free_flow_speed":60.0}"#;
        assert!(matches!(FlowSample::from_jsonl(line), Err(RecordError::Invalid(_))));

        let line = r#"{"timestamp":-9223372036854775808,"event_type":"ACCIDENT","latitude":40.7,"longitude":-74.0,"severity":3}"#;
        assert!(matches!(IncidentEvent::from_jsonl(line), Err(RecordError::Invalid(_))));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("1700000000"), Ok(1700000000));
        assert_eq!(parse_timestamp("2023-11-14 22:13:20"), Ok(1700000000));
        assert_eq!(parse_timestamp("2023-11-14T23:13:20+01:00"), Ok(1700000000));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_zero_free_flow_is_not_malformed() {
        let line = r#"{"timestamp":1700000000,"segment_id":"seg-1","speed":30.0,"free_flow_speed":0.0}"#;

        let sample = FlowSample::from_jsonl(line).unwrap();
        assert_eq!(sample.congestion_ratio(), None);
    }

    #[test]
    fn test_malformed_records() {
        assert!(IncidentEvent::from_jsonl(r#"{"invalid": "json"#).is_err());
        // Negative severity does not fit the unsigned schema
        assert!(IncidentEvent::from_jsonl(
            r#"{"timestamp":1,"event_type":"X","latitude":1.0,"longitude":1.0,"severity":-1}"#
        )
        .is_err());
        assert!(IncidentEvent::from_jsonl(
            r#"{"timestamp":1,"event_type":"X","latitude":91.0,"longitude":1.0,"severity":2}"#
        )
        .is_err());
        assert!(FlowSample::from_jsonl(
            r#"{"timestamp":1,"segment_id":"","speed":10.0,"free_flow_speed":20.0}"#
        )
        .is_err());
        assert!(FlowSample::from_jsonl(
            r#"{"timestamp":1,"segment_id":"a","speed":-5.0,"free_flow_speed":20.0}"#
        )
        .is_err());
        assert!(FlowSample::from_jsonl(
            r#"{"timestamp":1,"segment_id":"a","speed":5.0,"free_flow_speed":20.0,"latitude":1.0}"#
        )
        .is_err());
    }

    #[test]
    fn test_parse_route_request() {
        let line = r#"{"route_id":"r1","start_lat":40.71,"start_lon":-74.0,"end_lat":40.67,"end_lon":-73.94,"estimated_time":1200,"distance":9.5,"segment_id":"seg-1"}"#;

        let request = RouteRequest::from_jsonl(line).unwrap();
        assert_eq!(request.estimated_time, 1200.0);
        assert_eq!(request.segment_id.as_deref(), Some("seg-1"));

        let bad = r#"{"route_id":"r1","start_lat":40.71,"start_lon":-74.0,"end_lat":40.67,"end_lon":-73.94,"estimated_time":-1,"distance":9.5}"#;
        assert!(RouteRequest::from_jsonl(bad).is_err());
    }

    #[test]
    fn test_dedup_key_prefers_record_id() {
        let mut event = IncidentEvent {
            record_id: Some("evt-42".to_string()),
            timestamp: 1000,
            event_type: "JAM".to_string(),
            latitude: 1.0,
            longitude: 2.0,
            severity: 3,
            description: String::new(),
        };
        assert_eq!(event.dedup_key(), "id:evt-42");

        event.record_id = None;
        let copy = event.clone();
        assert!(event.dedup_key().starts_with("hash:"));
        assert_eq!(event.dedup_key(), copy.dedup_key());

        let mut other = event.clone();
        other.severity = 4;
        assert_ne!(event.dedup_key(), other.dedup_key());
    }
}
