use crate::domain::{DynamicSettings, QueueMetrics};

/// Rewrites the dynamic strategy settings before a rescan.
///
/// `previous_scan` is the snapshot the strategy is about to replace. Updaters
/// run in registration order, each receiving the previous one's output.
pub trait DynamicSettingsUpdater: Send + Sync {
    fn update(&self, settings: DynamicSettings, previous_scan: &[QueueMetrics]) -> DynamicSettings;
}

impl<F> DynamicSettingsUpdater for F
where
    F: Fn(DynamicSettings, &[QueueMetrics]) -> DynamicSettings + Send + Sync,
{
    fn update(&self, settings: DynamicSettings, previous_scan: &[QueueMetrics]) -> DynamicSettings {
        self(settings, previous_scan)
    }
}
