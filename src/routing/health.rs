use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthSample {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub success: bool,
}

/// Snapshot of one route's ring, oldest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub route_id: i64,
    /// `None` until the route has been used at least once.
    pub success_rate: Option<f64>,
    pub samples: Vec<HealthSample>,
}

type Ring = Arc<Mutex<VecDeque<HealthSample>>>;

/// Rolling success window per route. In-memory only: after a restart every
/// route is unknown and treated as healthy.
pub struct HealthTracker {
    window: usize,
    rings: RwLock<HashMap<i64, Ring>>,
}

impl HealthTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            rings: RwLock::new(HashMap::new()),
        }
    }

    fn ring(&self, route_id: i64) -> Option<Ring> {
        self.rings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&route_id)
            .cloned()
    }

    pub fn record(&self, route_id: i64, success: bool) {
        let ring = match self.ring(route_id) {
            Some(ring) => ring,
            None => self
                .rings
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(route_id)
                .or_insert_with(|| Arc::new(Mutex::new(VecDeque::with_capacity(self.window))))
                .clone(),
        };

        let mut samples = ring.lock().unwrap_or_else(PoisonError::into_inner);
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(HealthSample {
            timestamp: crate::db::now_millis(),
            success,
        });
    }

    pub fn sample(&self, route_id: i64) -> HealthReport {
        let samples: Vec<HealthSample> = self
            .ring(route_id)
            .map(|ring| {
                ring.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        let success_rate = if samples.is_empty() {
            None
        } else {
            let ok = samples.iter().filter(|s| s.success).count();
            Some(ok as f64 / samples.len() as f64)
        };

        HealthReport {
            route_id,
            success_rate,
            samples,
        }
    }

    /// Unknown routes count as healthy.
    pub fn is_healthy(&self, route_id: i64, threshold: f64) -> bool {
        self.sample(route_id)
            .success_rate
            .is_none_or(|rate| rate >= threshold)
    }

    /// Drop a deleted route's history.
    pub fn forget(&self, route_id: i64) {
        self.rings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&route_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_route_is_healthy() {
        let tracker = HealthTracker::new(50);
        let report = tracker.sample(7);
        assert_eq!(report.success_rate, None);
        assert!(report.samples.is_empty());
        assert!(tracker.is_healthy(7, 0.2));
    }

    #[test]
    fn rate_covers_only_the_window() {
        let tracker = HealthTracker::new(4);
        for _ in 0..10 {
            tracker.record(1, false);
        }
        tracker.record(1, true);
        tracker.record(1, true);
        tracker.record(1, true);

        let report = tracker.sample(1);
        assert_eq!(report.samples.len(), 4);
        assert_eq!(report.success_rate, Some(0.75));
        assert!(!report.samples[0].success);
        assert!(report.samples[3].success);
    }

    #[test]
    fn threshold_marks_failing_routes() {
        let tracker = HealthTracker::new(50);
        for i in 0..10 {
            tracker.record(2, i == 0);
        }
        assert!(!tracker.is_healthy(2, 0.2));
        assert!(tracker.is_healthy(2, 0.1));

        tracker.forget(2);
        assert!(tracker.is_healthy(2, 0.2));
    }

    #[test]
    fn rate_is_bounded() {
        let tracker = HealthTracker::new(50);
        for i in 0..120 {
            tracker.record(3, i % 3 == 0);
            let rate = tracker.sample(3).success_rate.unwrap();
            assert!((0.0..=1.0).contains(&rate));
        }
        assert_eq!(tracker.sample(3).samples.len(), 50);
    }
}
