//! Anomaly detection (spec §4.6): three independent detectors run against
//! every finalized trace and report [`Violation`]s for the alert manager.
//! None of them consult policy state — they watch behavior the policy
//! layer has no vocabulary for (repetition, cost drift, degenerate output).

mod cost_detector;
mod loop_detector;
mod spiral_detector;

use std::sync::Arc;
use std::time::Duration;

use crate::config::DetectionConfig;
use crate::models::alert::Violation;
use crate::models::trace::Trace;

pub use cost_detector::CostAnomalyDetector;
pub use loop_detector::LoopDetector;
pub use spiral_detector::SpiralDetector;

pub struct DetectionEngine {
    loop_detector: LoopDetector,
    loop_enabled: bool,
    cost_detector: CostAnomalyDetector,
    cost_enabled: bool,
    spiral_detector: SpiralDetector,
    spiral_enabled: bool,
}

impl DetectionEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            loop_detector: LoopDetector::default(),
            loop_enabled: true,
            cost_detector: CostAnomalyDetector::default(),
            cost_enabled: true,
            spiral_detector: SpiralDetector::default(),
            spiral_enabled: true,
        })
    }

    pub fn from_config(cfg: &DetectionConfig) -> Arc<Self> {
        Arc::new(Self {
            loop_detector: LoopDetector::new(
                cfg.loop_threshold as usize,
                Duration::from_secs(cfg.loop_window_secs),
            ),
            loop_enabled: cfg.loop_enabled,
            cost_detector: CostAnomalyDetector::new(cfg.cost_multiplier, 5),
            cost_enabled: cfg.cost_anomaly_enabled,
            spiral_detector: SpiralDetector::new(cfg.spiral_similarity, cfg.spiral_min_consecutive as usize),
            spiral_enabled: cfg.spiral_enabled,
        })
    }

    /// Feeds one finalized trace to every enabled detector. Cheap enough to
    /// run inline on the hot path's cold tail, but callers typically spawn
    /// this off the request future so it never adds latency to the
    /// response (spec §5, "detector runs... execute in background tasks").
    pub fn analyze(&self, trace: &Trace) -> Vec<Violation> {
        let mut violations = Vec::new();
        if self.loop_enabled {
            if let Some(v) = self.loop_detector.observe(trace) {
                violations.push(v);
            }
        }
        if self.cost_enabled {
            if let Some(v) = self.cost_detector.observe(trace) {
                violations.push(v);
            }
        }
        if self.spiral_enabled {
            if let Some(v) = self.spiral_detector.observe(trace) {
                violations.push(v);
            }
        }
        violations
    }
}
