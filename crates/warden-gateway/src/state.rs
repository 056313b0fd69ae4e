use std::sync::Arc;

use warden_runtime::Supervisor;

use crate::audit::AuditWriter;
use crate::auth::AuthConfig;
use crate::metrics::HttpMetrics;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub auth: AuthConfig,
    pub metrics: Arc<HttpMetrics>,
    pub audit: Option<Arc<AuditWriter>>,
}

impl AppState {
    pub fn new(supervisor: Arc<Supervisor>, auth: AuthConfig) -> Self {
        Self {
            supervisor,
            auth,
            metrics: Arc::new(HttpMetrics::default()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Option<Arc<AuditWriter>>) -> Self {
        self.audit = audit;
        self
    }
}

impl AsRef<AuthConfig> for AppState {
    fn as_ref(&self) -> &AuthConfig {
        &self.auth
    }
}
