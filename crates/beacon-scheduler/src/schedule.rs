use std::time::Duration;

use beacon_core::config::BeaconConfig;
use beacon_core::{BackendConfig, WidgetDefinition};
use chrono::{DateTime, Utc};
use rand::Rng;

/// Backend config key that overrides a widget's refresh interval for one instance.
pub const REFRESH_INTERVAL_PARAM: &str = "REFRESH_INTERVAL";

/// Timing rules shared by every instance.
#[derive(Debug, Clone)]
pub struct SchedulePolicy {
    pub default_interval: Duration,
    pub min_interval: Duration,
    pub max_jitter: Duration,
    pub default_budget: Duration,
}

impl SchedulePolicy {
    pub fn from_config(config: &BeaconConfig) -> Self {
        Self {
            default_interval: Duration::from_secs(config.scheduler.default_interval_secs),
            min_interval: Duration::from_secs(config.scheduler.min_interval_secs),
            max_jitter: Duration::from_millis(config.scheduler.jitter_ms),
            default_budget: Duration::from_secs(config.sandbox.timeout_secs),
        }
    }

    /// Resolve the refresh interval: instance override, then widget, then global default.
    pub fn refresh_interval(&self, definition: &WidgetDefinition, config: &BackendConfig) -> Duration {
        let from_instance = config
            .get(REFRESH_INTERVAL_PARAM)
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0);
        let from_widget = definition.delay_secs.filter(|secs| *secs > 0);

        from_instance
            .or(from_widget)
            .map(Duration::from_secs)
            .unwrap_or(self.default_interval)
            .max(self.min_interval)
    }

    /// Wall-clock budget for one execution of `definition`.
    pub fn time_budget(&self, definition: &WidgetDefinition) -> Duration {
        definition
            .timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(self.default_budget)
    }

    /// Delay before the next run, jitter included.
    pub fn next_delay(
        &self,
        interval: Duration,
        last_execution: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Duration {
        remaining_interval(interval, last_execution, now) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Part of `interval` not yet elapsed since `last_execution`.
///
/// Never executed or already overdue means run now. A last execution in the
/// future (clock skew) counts as just executed.
pub fn remaining_interval(
    interval: Duration,
    last_execution: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let Some(last) = last_execution else {
        return Duration::ZERO;
    };
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    interval.saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(delay_secs: Option<u64>, timeout_secs: Option<u64>) -> WidgetDefinition {
        WidgetDefinition {
            id: 1,
            technical_name: "weather".into(),
            category_id: None,
            parameters: Vec::new(),
            script: String::new(),
            delay_secs,
            timeout_secs,
        }
    }

    fn policy() -> SchedulePolicy {
        let mut config = BeaconConfig::default();
        config.scheduler.jitter_ms = 0;
        SchedulePolicy::from_config(&config)
    }

    #[test]
    fn instance_override_beats_widget_delay() {
        let p = policy();
        let cfg = BackendConfig::parse("REFRESH_INTERVAL=10");
        assert_eq!(
            p.refresh_interval(&definition(Some(30), None), &cfg),
            Duration::from_secs(10)
        );
        assert_eq!(
            p.refresh_interval(&definition(Some(30), None), &BackendConfig::new()),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn unusable_values_fall_back_to_default() {
        let p = policy();
        let cfg = BackendConfig::parse("REFRESH_INTERVAL=soon");
        assert_eq!(p.refresh_interval(&definition(Some(0), None), &cfg), p.default_interval);
    }

    #[test]
    fn interval_is_clamped_to_minimum() {
        let mut p = policy();
        p.min_interval = Duration::from_secs(5);
        let cfg = BackendConfig::parse("REFRESH_INTERVAL=1");
        assert_eq!(
            p.refresh_interval(&definition(None, None), &cfg),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn widget_timeout_overrides_default_budget() {
        let p = policy();
        assert_eq!(p.time_budget(&definition(None, Some(5))), Duration::from_secs(5));
        assert_eq!(p.time_budget(&definition(None, None)), p.default_budget);
    }

    #[test]
    fn never_executed_runs_immediately() {
        let now = Utc::now();
        assert_eq!(remaining_interval(Duration::from_secs(30), None, now), Duration::ZERO);
    }

    #[test]
    fn deferred_start_waits_out_the_interval() {
        let now = Utc::now();
        let last = now - chrono::Duration::seconds(10);
        assert_eq!(
            remaining_interval(Duration::from_secs(30), Some(last), now),
            Duration::from_secs(20)
        );
        let overdue = now - chrono::Duration::seconds(90);
        assert_eq!(
            remaining_interval(Duration::from_secs(30), Some(overdue), now),
            Duration::ZERO
        );
    }

    #[test]
    fn future_last_execution_counts_as_just_run() {
        let now = Utc::now();
        let skewed = now + chrono::Duration::seconds(5);
        assert_eq!(
            remaining_interval(Duration::from_secs(30), Some(skewed), now),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn jitter_stays_within_bound() {
        let mut p = policy();
        p.max_jitter = Duration::from_millis(50);
        for _ in 0..100 {
            let d = p.next_delay(Duration::from_secs(1), None, Utc::now());
            assert!(d <= Duration::from_millis(50));
        }
    }
}
