//! Latest-analysis table readable from any thread

use crate::flow_core::correlator::CorrelatedAnalysis;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Concurrent view of the newest `CorrelatedAnalysis` per segment.
///
/// Writers swap whole `Arc` values under the write lock, so a reader holding
/// a snapshot never observes a record mid-update.
#[derive(Debug, Clone, Default)]
pub struct AnalysisStore {
    inner: Arc<RwLock<HashMap<String, Arc<CorrelatedAnalysis>>>>,
}

impl AnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the segment's analysis unless the stored one covers a newer window.
    /// Returns whether the table changed.
    pub fn publish(&self, analysis: CorrelatedAnalysis) -> bool {
        let mut table = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(current) = table.get(&analysis.segment_id) {
            if current.window_start > analysis.window_start {
                return false;
            }
        }

        table.insert(analysis.segment_id.clone(), Arc::new(analysis));
        true
    }

    pub fn latest(&self, segment_id: &str) -> Option<CorrelatedAnalysis> {
        self.latest_shared(segment_id).map(|a| (*a).clone())
    }

    pub fn latest_shared(&self, segment_id: &str) -> Option<Arc<CorrelatedAnalysis>> {
        let table = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        table.get(segment_id).cloned()
    }

    /// Segment ids with an analysis, sorted
    pub fn segments(&self) -> Vec<String> {
        let table = match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut ids: Vec<String> = table.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        match self.inner.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(segment: &str, window_start: i64, ci: f64) -> CorrelatedAnalysis {
        CorrelatedAnalysis {
            segment_id: segment.to_string(),
            window_start,
            avg_speed: 30.0,
            congestion_index: ci,
            event_count: 0,
            max_severity: 0,
            update_time: window_start + 60,
        }
    }

    #[test]
    fn test_publish_replaces_per_segment() {
        let store = AnalysisStore::new();
        assert!(store.is_empty());
        assert!(store.latest("seg-1").is_none());

        assert!(store.publish(analysis("seg-1", 300, 0.8)));
        assert!(store.publish(analysis("seg-1", 600, 0.4)));
        assert!(store.publish(analysis("seg-2", 300, 0.9)));

        assert_eq!(store.len(), 2);
        assert_eq!(store.latest("seg-1").unwrap().congestion_index, 0.4);
        assert_eq!(store.segments(), vec!["seg-1".to_string(), "seg-2".to_string()]);
    }

    #[test]
    fn test_older_window_does_not_replace() {
        let store = AnalysisStore::new();
        store.publish(analysis("seg-1", 600, 0.4));
        assert!(!store.publish(analysis("seg-1", 300, 0.9)));
        assert_eq!(store.latest("seg-1").unwrap().window_start, 600);

        // Same window re-emitted with incident data replaces
        let mut refreshed = analysis("seg-1", 600, 0.4);
        refreshed.event_count = 3;
        assert!(store.publish(refreshed));
        assert_eq!(store.latest("seg-1").unwrap().event_count, 3);
    }

    #[test]
    fn test_concurrent_readers_see_whole_records() {
        let store = AnalysisStore::new();
        store.publish(analysis("seg-1", 0, 0.5));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 1..500 {
                    let mut a = analysis("seg-1", i * 300, 0.5);
                    a.update_time = i * 300 + 60;
                    store.publish(a);
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let a = store.latest("seg-1").unwrap();
                        assert_eq!(a.update_time, a.window_start + 60);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.latest("seg-1").unwrap().window_start, 499 * 300);
    }
}
