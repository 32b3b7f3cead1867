use std::sync::{Arc, Mutex, PoisonError};

use crate::state::ConnectorStateStore;
use crate::traits::ControlPlane;

/// Identity and mutable bookkeeping shared between the runtime and its
/// consumers.
pub struct ConnectorContext {
    connector_id: String,
    state: ConnectorStateStore,
    control_plane: Arc<dyn ControlPlane>,
    applicant_id: Mutex<Option<String>>,
    work_id: Mutex<Option<String>>,
}

impl ConnectorContext {
    pub fn new(
        connector_id: impl Into<String>,
        state: ConnectorStateStore,
        control_plane: Arc<dyn ControlPlane>,
        applicant_id: Option<String>,
    ) -> Self {
        Self {
            connector_id: connector_id.into(),
            state,
            control_plane,
            applicant_id: Mutex::new(applicant_id),
            work_id: Mutex::new(None),
        }
    }

    pub fn connector_id(&self) -> &str {
        &self.connector_id
    }

    pub fn state(&self) -> &ConnectorStateStore {
        &self.state
    }

    pub fn control_plane(&self) -> &Arc<dyn ControlPlane> {
        &self.control_plane
    }

    pub fn applicant_id(&self) -> Option<String> {
        self.applicant_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Switches the identity API calls are made for.
    pub fn set_applicant_id(&self, applicant_id: &str) {
        *self
            .applicant_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(applicant_id.to_string());
        self.control_plane.set_applicant_id(Some(applicant_id));
    }

    /// Work unit of the queue message currently being processed.
    pub fn work_id(&self) -> Option<String> {
        self.work_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_work_id(&self, work_id: Option<String>) {
        *self.work_id.lock().unwrap_or_else(PoisonError::into_inner) = work_id;
    }
}
