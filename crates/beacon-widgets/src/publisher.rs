use beacon_core::{DashboardId, InstanceId, NotificationPublisher, UpdateEvent};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

const BROADCAST_CAPACITY: usize = 256;

/// Who an event is addressed to.
#[derive(Debug, Clone, PartialEq)]
pub enum Audience {
    /// Subscribers of a dashboard token.
    Dashboard { token: String },
    /// Subscribers of one instance on a dashboard.
    Instance { token: String, instance_id: InstanceId },
    /// Every screen showing the dashboard, token or not.
    AllViewers { dashboard_id: DashboardId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub audience: Audience,
    pub event: UpdateEvent,
}

/// Fan-out of update events to live viewers over a tokio broadcast channel.
pub struct EventBroadcaster {
    tx: broadcast::Sender<Envelope>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Raw feed of every envelope.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    /// Events for a dashboard: dashboard-wide, instance-scoped under its
    /// token, and all-viewer refreshes for `dashboard_id`.
    pub fn subscribe_dashboard(
        &self,
        token: impl Into<String>,
        dashboard_id: DashboardId,
    ) -> impl Stream<Item = UpdateEvent> {
        let token = token.into();
        self.filtered(move |audience| match audience {
            Audience::Dashboard { token: t } | Audience::Instance { token: t, .. } => *t == token,
            Audience::AllViewers { dashboard_id: d } => *d == dashboard_id,
        })
    }

    /// Only the events scoped to one instance.
    pub fn subscribe_instance(
        &self,
        token: impl Into<String>,
        instance_id: InstanceId,
    ) -> impl Stream<Item = UpdateEvent> {
        let token = token.into();
        self.filtered(move |audience| {
            matches!(audience, Audience::Instance { token: t, instance_id: i } if *t == token && *i == instance_id)
        })
    }

    fn filtered(
        &self,
        wants: impl Fn(&Audience) -> bool + Send + 'static,
    ) -> impl Stream<Item = UpdateEvent> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| match item {
            Ok(envelope) if wants(&envelope.audience) => Some(envelope.event),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "update subscriber lagged; events dropped");
                None
            }
        })
    }

    fn send(&self, audience: Audience, event: UpdateEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(Envelope { audience, event });
    }
}

impl NotificationPublisher for EventBroadcaster {
    fn publish(&self, dashboard_token: &str, event: UpdateEvent) {
        self.send(
            Audience::Dashboard {
                token: dashboard_token.to_string(),
            },
            event,
        );
    }

    fn publish_to_instance(&self, dashboard_token: &str, instance_id: InstanceId, event: UpdateEvent) {
        self.send(
            Audience::Instance {
                token: dashboard_token.to_string(),
                instance_id,
            },
            event,
        );
    }

    fn publish_to_all_viewers(&self, dashboard_id: DashboardId, event: UpdateEvent) {
        self.send(Audience::AllViewers { dashboard_id }, event);
    }
}
