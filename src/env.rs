//! Construction-time environment passed explicitly through constructors in
//! place of the process-wide globals the original kept (spec §9 Design
//! Notes, "Global state").

use crate::vitals::VitalCounter;
use std::sync::Arc;

/// Identity and shared facilities threaded through every component that
/// needs to know who it is speaking for.
#[derive(Clone)]
pub struct Env {
    pub user: String,
    pub application: String,
    pub module: String,
    /// Process-wide counter of schema-validation rejects across every
    /// [`crate::vitals::VitalThreshold`] built from this `Env` (spec §4.5).
    pub invalid_input: Arc<VitalCounter>,
}

impl Env {
    pub fn new(user: impl Into<String>, application: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            application: application.into(),
            module: module.into(),
            invalid_input: Arc::new(VitalCounter::new("invalid_input", "rejected out-of-range vital input")),
        }
    }

    /// The channel name an [`crate::supervisor::AppEventProxy`] binds for
    /// this `(user, application)` pair, matching the original's
    /// colon-joined identity convention.
    pub fn event_proxy_address(&self) -> String {
        format!("{}:{}", self.user, self.application)
    }
}
