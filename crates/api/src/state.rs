use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway_service: Arc<dyn services::gateway::ports::GatewayService>,
    pub entitlement_service: Arc<dyn services::entitlement::ports::EntitlementService>,
    pub subscription_service: Arc<dyn services::subscription::ports::SubscriptionService>,
}
