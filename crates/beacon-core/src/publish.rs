use crate::types::{DashboardId, InstanceId, UpdateEvent};

/// Fan-out of update events to dashboard viewers.
///
/// Delivery is best effort: publishing with nobody listening is not an error.
pub trait NotificationPublisher: Send + Sync {
    /// Every subscriber of the dashboard token.
    fn publish(&self, dashboard_token: &str, event: UpdateEvent);

    /// Subscribers scoped to one instance of the dashboard.
    fn publish_to_instance(&self, dashboard_token: &str, instance_id: InstanceId, event: UpdateEvent);

    /// Every screen currently showing the dashboard, whatever it subscribed to.
    fn publish_to_all_viewers(&self, dashboard_id: DashboardId, event: UpdateEvent);
}
