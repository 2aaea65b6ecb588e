use serde::{Deserialize, Serialize};

use super::types::EndpointId;

/// Per-request selection hints.
///
/// Created by the caller for one logical request. The rotator never mutates
/// the caller's value; retries work on an internal copy that accumulates the
/// ids of endpoints already tried.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionContext {
    /// Session identifier for sticky routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Region tag the request should egress from (e.g. "EU")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_region: Option<String>,

    /// Country tag the request should egress from (e.g. "DE")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_country: Option<String>,

    /// Endpoints already tried for this request
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_proxy_ids: Vec<EndpointId>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.target_region = Some(region.into());
        self
    }

    pub fn with_country(mut self, country: impl Into<String>) -> Self {
        self.target_country = Some(country.into());
        self
    }

    /// Whether the request carries any geographic constraint.
    pub fn has_geo_target(&self) -> bool {
        self.target_region.is_some() || self.target_country.is_some()
    }

    pub fn has_tried(&self, endpoint_id: &str) -> bool {
        self.failed_proxy_ids
            .iter()
            .any(|id| id.as_ref() == endpoint_id)
    }

    pub(crate) fn mark_tried(&mut self, endpoint_id: &EndpointId) {
        if !self.has_tried(endpoint_id) {
            self.failed_proxy_ids.push(endpoint_id.clone());
        }
    }
}
