/**
 * Resource keys of the syndesis REST API and the paths they are fetched from
 */
use super::changes::ResourceKey;

pub const INTEGRATIONS: &str = "integrations";
pub const MONITORED_INTEGRATIONS: &str = "monitored-integrations";
pub const INTEGRATION_METRICS: &str = "integration-metrics";
pub const CONNECTIONS: &str = "connections";
pub const CONNECTORS: &str = "connectors";
pub const API_CONNECTORS: &str = "api-connectors";
pub const EXTENSIONS: &str = "extensions";
pub const VIRTUALIZATIONS: &str = "virtualizations";

impl ResourceKey {
    #[must_use]
    pub fn integrations() -> Self {
        Self::new(INTEGRATIONS)
    }

    #[must_use]
    pub fn integration(id: &str) -> Self {
        Self::entity(INTEGRATIONS, id)
    }

    #[must_use]
    pub fn monitored_integrations() -> Self {
        Self::new(MONITORED_INTEGRATIONS)
    }

    /// Metrics summed over all integrations
    #[must_use]
    pub fn integration_metrics() -> Self {
        Self::new(INTEGRATION_METRICS)
    }

    #[must_use]
    pub fn integration_metrics_for(id: &str) -> Self {
        Self::entity(INTEGRATION_METRICS, id)
    }

    #[must_use]
    pub fn connections() -> Self {
        Self::new(CONNECTIONS)
    }

    #[must_use]
    pub fn connection(id: &str) -> Self {
        Self::entity(CONNECTIONS, id)
    }

    #[must_use]
    pub fn connectors() -> Self {
        Self::new(CONNECTORS)
    }

    #[must_use]
    pub fn connector(id: &str) -> Self {
        Self::entity(CONNECTORS, id)
    }

    #[must_use]
    pub fn api_connectors() -> Self {
        Self::new(API_CONNECTORS)
    }

    #[must_use]
    pub fn extensions() -> Self {
        Self::new(EXTENSIONS)
    }

    #[must_use]
    pub fn extension(id: &str) -> Self {
        Self::entity(EXTENSIONS, id)
    }

    #[must_use]
    pub fn virtualizations() -> Self {
        Self::new(VIRTUALIZATIONS)
    }

    #[must_use]
    pub fn entity(collection: &str, id: &str) -> Self {
        Self::new(format!("{collection}:{id}"))
    }

    /// REST path relative to the API base, without a leading slash
    #[must_use]
    pub fn api_path(&self) -> String {
        let id = self.id();
        match (self.collection(), id) {
            (MONITORED_INTEGRATIONS, _) => "monitoring/integrations".to_string(),
            (INTEGRATION_METRICS, None) => "metrics/integrations".to_string(),
            (INTEGRATION_METRICS, Some(id)) => format!("metrics/integrations/{id}"),
            (API_CONNECTORS, _) => "connectors?query=connectorGroupId%3Dswagger-connector-template"
                .to_string(),
            (collection, None) => collection.to_string(),
            (collection, Some(id)) => format!("{collection}/{id}"),
        }
    }
}

/// Collection name for the `kind` field of a server change event
#[must_use]
pub fn collection_for_kind(kind: &str) -> String {
    match kind {
        "integration" | "integration-deployment" => INTEGRATIONS.to_string(),
        "connection" => CONNECTIONS.to_string(),
        "connector" => CONNECTORS.to_string(),
        "extension" => EXTENSIONS.to_string(),
        "virtualization" => VIRTUALIZATIONS.to_string(),
        other if other.ends_with('s') => other.to_string(),
        other => format!("{other}s"),
    }
}
