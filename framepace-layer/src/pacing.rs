//! Adaptive frame-time and thermal controller.
//!
//! The controller watches how long each augmented present takes, reads
//! the platform's GPU thermal zone, and publishes two scalars: a
//! synthesis quality in [0, 1] and a synthesiser resolution scale in
//! [0.25, 0.75]. It also exposes an engage flag the engine consults
//! before it attempts synthesis. It issues no graphics calls of its
//! own.
//!
//! Adjustment is deliberately asymmetric: quality steps down quickly
//! (0.15 / 0.10 per step) and back up slowly (0.05 / 0.05 per step).

use std::collections::VecDeque;
use std::path::Path;

/// Samples kept for the running average/min/max.
const HISTORY_SIZE: usize = 60;

/// Celsius threshold above which the controller reports throttling.
const THERMAL_THROTTLE_C: f32 = 75.0;
/// Celsius threshold that snaps quality and scale to their floors.
const THERMAL_CRITICAL_C: f32 = 85.0;

const QUALITY_MIN: f32 = 0.0;
const QUALITY_MAX: f32 = 1.0;
const SCALE_MIN: f32 = 0.25;
const SCALE_MAX: f32 = 0.75;

const QUALITY_STEP_DOWN: f32 = 0.15;
const SCALE_STEP_DOWN: f32 = 0.10;
const QUALITY_STEP_UP: f32 = 0.05;
const SCALE_STEP_UP: f32 = 0.05;

/// Over-budget streak that forces a step down while throttled.
const THROTTLED_OVER_STREAK: u32 = 3;
/// Over-budget streak that forces a step down at any temperature.
const OVER_STREAK: u32 = 5;
/// Under-budget streak required before stepping back up.
const UNDER_STREAK: u32 = 30;
/// The running average must also sit below this fraction of the budget
/// before a step up is taken.
const HEADROOM_FRACTION: f32 = 0.7;

/// Running statistics over the sample history.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameStats {
    pub avg_ms: f32,
    pub min_ms: f32,
    pub max_ms: f32,
}

/// Per-device pacing state. One lives inside each device's engine
/// state and is fed a sample after every augmented present.
#[derive(Debug)]
pub struct TimingController {
    target_ms: f32,
    quality: f32,
    scale: f32,
    thermal_protection: bool,
    history: VecDeque<f32>,
    stats: FrameStats,
    consecutive_over: u32,
    consecutive_under: u32,
    throttled: bool,
    engaged: bool,
}

impl TimingController {
    pub fn new(config: &crate::config::LayerConfig) -> Self {
        tracing::debug!(
            target: crate::log::TARGET,
            "Pacing: budget={:.2}ms quality={:.2} scale={:.2}",
            config.target_frame_time_ms,
            config.quality,
            config.model_scale,
        );
        Self {
            target_ms: config.target_frame_time_ms,
            quality: config.quality.clamp(QUALITY_MIN, QUALITY_MAX),
            scale: config.model_scale.clamp(SCALE_MIN, SCALE_MAX),
            thermal_protection: config.thermal_protection,
            history: VecDeque::with_capacity(HISTORY_SIZE),
            stats: FrameStats::default(),
            consecutive_over: 0,
            consecutive_under: 0,
            throttled: false,
            engaged: true,
        }
    }

    /// Feed one completed present cycle into the controller.
    ///
    /// `temperature_c` is the current GPU temperature, or `None` when
    /// the sensor could not be read (a single failed read never drives
    /// adjustment). Returns true when the sample was on budget.
    pub fn on_frame_complete(
        &mut self,
        frame_ms: f32,
        temperature_c: Option<f32>,
    ) -> bool {
        if self.history.len() == HISTORY_SIZE {
            self.history.pop_front();
        }
        self.history.push_back(frame_ms);
        self.recompute_stats();

        let over_budget = frame_ms > self.target_ms;
        if over_budget {
            self.consecutive_over += 1;
            self.consecutive_under = 0;
        } else {
            self.consecutive_under += 1;
            self.consecutive_over = 0;
        }

        if self.thermal_protection
            && let Some(temp) = temperature_c
        {
            self.throttled = temp >= THERMAL_THROTTLE_C;

            if temp >= THERMAL_CRITICAL_C {
                self.quality = QUALITY_MIN;
                self.scale = SCALE_MIN;
                self.engaged = false;
                tracing::warn!(
                    target: crate::log::TARGET,
                    "Pacing: thermal critical ({temp:.1}C), \
                     synthesis disengaged"
                );
                return false;
            }

            if self.throttled
                && self.consecutive_over >= THROTTLED_OVER_STREAK
            {
                self.step_down();
                return false;
            }
        }

        if self.consecutive_over >= OVER_STREAK {
            self.step_down();
            return false;
        }

        if self.consecutive_under >= UNDER_STREAK
            && self.stats.avg_ms < self.target_ms * HEADROOM_FRACTION
        {
            self.step_up();
        }

        !over_budget
    }

    /// Quality the synthesis hook should run at, in [0, 1].
    pub fn quality(&self) -> f32 {
        self.quality
    }

    /// Resolution scale the synthesis hook should run at.
    pub fn model_scale(&self) -> f32 {
        self.scale
    }

    /// True while the last temperature sample was at or above the
    /// throttle threshold.
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// False after a thermal-critical sample until the next step up.
    /// The engine bypasses presents while this is false.
    pub fn is_engaged(&self) -> bool {
        self.engaged
    }

    /// Whether the engine should bother reading the thermal sensor.
    pub fn thermal_protection(&self) -> bool {
        self.thermal_protection
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    fn recompute_stats(&mut self) {
        let len = self.history.len() as f32;
        let mut sum = 0.0f32;
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        for &sample in &self.history {
            sum += sample;
            min = min.min(sample);
            max = max.max(sample);
        }
        self.stats = FrameStats {
            avg_ms: sum / len,
            min_ms: min,
            max_ms: max,
        };
    }

    fn step_down(&mut self) {
        self.quality = (self.quality - QUALITY_STEP_DOWN).max(QUALITY_MIN);
        self.scale = (self.scale - SCALE_STEP_DOWN).max(SCALE_MIN);
        self.consecutive_over = 0;
        self.consecutive_under = 0;
        tracing::debug!(
            target: crate::log::TARGET,
            "Pacing: step down, quality={:.2} scale={:.2} \
             (avg={:.2}ms, budget={:.2}ms)",
            self.quality,
            self.scale,
            self.stats.avg_ms,
            self.target_ms,
        );
    }

    fn step_up(&mut self) {
        self.quality = (self.quality + QUALITY_STEP_UP).min(QUALITY_MAX);
        self.scale = (self.scale + SCALE_STEP_UP).min(SCALE_MAX);
        self.consecutive_over = 0;
        self.consecutive_under = 0;
        self.engaged = true;
        tracing::debug!(
            target: crate::log::TARGET,
            "Pacing: step up, quality={:.2} scale={:.2} \
             (avg={:.2}ms, budget={:.2}ms)",
            self.quality,
            self.scale,
            self.stats.avg_ms,
            self.target_ms,
        );
    }
}

// ---------------------------------------------------------------------------
// Thermal sensor
// ---------------------------------------------------------------------------

/// Zones that host the GPU sensor on the SoCs we care about.
const THERMAL_ZONE_PATHS: &[&str] = &[
    "/sys/class/thermal/thermal_zone0/temp",
    "/sys/class/thermal/thermal_zone1/temp",
    "/sys/class/thermal/thermal_zone3/temp",
    "/sys/devices/virtual/thermal/thermal_zone0/temp",
];

/// Read the GPU temperature in Celsius, or `None` when no sensor
/// responds. Tries the well-known zone paths first, then scans
/// `/sys/class/thermal` for a zone whose type mentions "gpu".
pub fn read_gpu_temperature() -> Option<f32> {
    for path in THERMAL_ZONE_PATHS {
        if let Some(temp) = read_thermal_zone(Path::new(path)) {
            return Some(temp);
        }
    }

    let entries = std::fs::read_dir("/sys/class/thermal").ok()?;
    for entry in entries.flatten() {
        let type_path = entry.path().join("type");
        let Ok(zone_type) = std::fs::read_to_string(type_path) else {
            continue;
        };
        if zone_type.to_ascii_lowercase().contains("gpu")
            && let Some(temp) = read_thermal_zone(&entry.path().join("temp"))
        {
            return Some(temp);
        }
    }
    None
}

fn read_thermal_zone(path: &Path) -> Option<f32> {
    let raw: i64 = std::fs::read_to_string(path).ok()?.trim().parse().ok()?;
    (raw > 0).then(|| normalize_thermal_reading(raw))
}

/// Zones report either degrees or millidegrees Celsius; anything above
/// 1000 is taken as millidegrees.
fn normalize_thermal_reading(raw: i64) -> f32 {
    if raw > 1000 {
        raw as f32 / 1000.0
    } else {
        raw as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerConfig;

    fn controller() -> TimingController {
        TimingController::new(&LayerConfig::default())
    }

    #[track_caller]
    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn over_budget_streak_steps_down() {
        // Ten 12ms samples against the default 8ms budget: the fifth
        // over-budget sample triggers the step, counters reset, and the
        // remaining samples start a fresh streak.
        let mut ctrl = controller();
        for _ in 0..4 {
            ctrl.on_frame_complete(12.0, None);
        }
        assert_close(ctrl.quality(), 0.5);

        ctrl.on_frame_complete(12.0, None);
        assert_close(ctrl.quality(), 0.35);
        assert_close(ctrl.model_scale(), 0.4);

        for _ in 0..4 {
            ctrl.on_frame_complete(12.0, None);
        }
        assert_close(ctrl.quality(), 0.35);
        ctrl.on_frame_complete(12.0, None);
        assert_close(ctrl.quality(), 0.2);
    }

    #[test]
    fn scale_clamps_at_floor() {
        let mut ctrl = controller();
        for _ in 0..30 {
            ctrl.on_frame_complete(20.0, None);
        }
        assert_eq!(ctrl.model_scale(), SCALE_MIN);
        assert_eq!(ctrl.quality(), QUALITY_MIN);
    }

    #[test]
    fn thermal_critical_snaps_to_minimum_and_disengages() {
        let mut ctrl = controller();
        assert!(ctrl.is_engaged());

        ctrl.on_frame_complete(5.0, Some(86.0));

        assert_eq!(ctrl.quality(), QUALITY_MIN);
        assert_eq!(ctrl.model_scale(), SCALE_MIN);
        assert!(ctrl.is_throttled());
        assert!(!ctrl.is_engaged());
    }

    #[test]
    fn reengages_on_step_up_after_critical() {
        let mut ctrl = controller();
        ctrl.on_frame_complete(5.0, Some(86.0));
        assert!(!ctrl.is_engaged());

        // Thirty cool under-budget samples with plenty of headroom.
        for _ in 0..30 {
            ctrl.on_frame_complete(2.0, Some(50.0));
        }
        assert!(ctrl.is_engaged());
        assert!(ctrl.quality() > QUALITY_MIN);
    }

    #[test]
    fn throttled_streak_steps_down_early() {
        let mut ctrl = controller();
        for _ in 0..2 {
            ctrl.on_frame_complete(12.0, Some(78.0));
        }
        assert_close(ctrl.quality(), 0.5);

        // The third hot over-budget sample is enough, well before the
        // temperature-independent streak of five.
        ctrl.on_frame_complete(12.0, Some(78.0));
        assert_close(ctrl.quality(), 0.35);
        assert!(ctrl.is_throttled());
    }

    #[test]
    fn unknown_temperature_does_not_drive_thermal_branches() {
        let mut ctrl = controller();
        for _ in 0..3 {
            ctrl.on_frame_complete(12.0, None);
        }
        // No thermal step: only the plain five-sample rule applies.
        assert_close(ctrl.quality(), 0.5);
        assert!(!ctrl.is_throttled());
    }

    #[test]
    fn step_up_requires_streak_and_headroom() {
        let mut ctrl = controller();
        // Knock quality down once.
        for _ in 0..5 {
            ctrl.on_frame_complete(12.0, None);
        }
        assert_close(ctrl.quality(), 0.35);

        // 29 under-budget samples are not enough.
        for _ in 0..29 {
            ctrl.on_frame_complete(2.0, None);
        }
        assert_close(ctrl.quality(), 0.35);

        ctrl.on_frame_complete(2.0, None);
        assert_close(ctrl.quality(), 0.4);
        assert_close(ctrl.model_scale(), 0.45);
    }

    #[test]
    fn under_budget_average_gate_blocks_step_up() {
        let mut ctrl = controller();
        // Under budget but with the average above 70% of the budget
        // (7.9ms of an 8ms budget): never steps up.
        for _ in 0..40 {
            ctrl.on_frame_complete(7.9, None);
        }
        assert_close(ctrl.quality(), 0.5);
    }

    #[test]
    fn stats_track_min_max_avg() {
        let mut ctrl = controller();
        ctrl.on_frame_complete(4.0, None);
        ctrl.on_frame_complete(8.0, None);
        let stats = ctrl.stats();
        assert_eq!(stats.min_ms, 4.0);
        assert_eq!(stats.max_ms, 8.0);
        assert_eq!(stats.avg_ms, 6.0);
    }

    #[test]
    fn history_is_bounded() {
        let mut ctrl = controller();
        for _ in 0..200 {
            ctrl.on_frame_complete(1.0, None);
        }
        assert!(ctrl.history.len() <= HISTORY_SIZE);
    }

    #[test]
    fn millidegree_readings_are_normalized() {
        assert_eq!(normalize_thermal_reading(45_000), 45.0);
        assert_eq!(normalize_thermal_reading(45), 45.0);
    }
}
