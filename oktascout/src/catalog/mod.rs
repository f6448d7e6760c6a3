//! Static, read-only index of Okta REST operations.
//!
//! The catalog is embedded at compile time (`okta_endpoints.yaml`) and never
//! mutated; the planner and the endpoint tools only ever see the READ subset.

use once_cell::sync::Lazy;
use serde::Deserialize;

/// Whether an operation reads or mutates the tenant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    Read,
    Write,
}

/// One REST operation: id, method, path, owning entity, summary, params.
#[derive(Clone, Debug, Deserialize)]
pub struct EndpointSummary {
    pub id: String,
    pub method: String,
    pub path: String,
    pub entity: String,
    pub summary: String,
    #[serde(default)]
    pub params: Vec<String>,
}

impl EndpointSummary {
    pub fn kind(&self) -> EndpointKind {
        if self.method.eq_ignore_ascii_case("GET") {
            EndpointKind::Read
        } else {
            EndpointKind::Write
        }
    }

    /// Compact one-line rendering for prompts.
    pub fn render_line(&self) -> String {
        format!(
            "{} [{} {}] ({}) — {}",
            self.id, self.method, self.path, self.entity, self.summary
        )
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    endpoints: Vec<EndpointSummary>,
}

const EMBEDDED_CATALOG: &str = include_str!("okta_endpoints.yaml");

static CATALOG: Lazy<Vec<EndpointSummary>> = Lazy::new(|| {
    // Embedded asset; validity is covered by tests.
    let file: CatalogFile =
        serde_yaml::from_str(EMBEDDED_CATALOG).expect("embedded okta_endpoints.yaml is valid");
    file.endpoints
});

/// Read-only view over the embedded operation index.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiCatalog;

impl ApiCatalog {
    pub fn new() -> Self {
        Self
    }

    pub fn all(&self) -> &'static [EndpointSummary] {
        &CATALOG
    }

    /// Operations of the given kinds, catalog order preserved.
    pub fn filter(&self, kinds: &[EndpointKind]) -> Vec<&'static EndpointSummary> {
        CATALOG
            .iter()
            .filter(|e| kinds.contains(&e.kind()))
            .collect()
    }

    /// Resolves ids; unknown ids are reported back, not silently dropped.
    pub fn select<'a>(
        &self,
        ids: &'a [String],
    ) -> (Vec<&'static EndpointSummary>, Vec<&'a str>) {
        let mut found = Vec::new();
        let mut unknown = Vec::new();
        for id in ids {
            match CATALOG.iter().find(|e| &e.id == id) {
                Some(e) => found.push(e),
                None => unknown.push(id.as_str()),
            }
        }
        (found, unknown)
    }

    /// Prompt block of all READ operations.
    pub fn read_summary(&self) -> String {
        self.filter(&[EndpointKind::Read])
            .iter()
            .map(|e| e.render_line())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_catalog_parses_and_has_both_kinds() {
        let catalog = ApiCatalog::new();
        assert!(!catalog.all().is_empty());
        assert!(!catalog.filter(&[EndpointKind::Read]).is_empty());
        assert!(!catalog.filter(&[EndpointKind::Write]).is_empty());
    }

    #[test]
    fn read_filter_excludes_mutating_operations() {
        let catalog = ApiCatalog::new();
        for e in catalog.filter(&[EndpointKind::Read]) {
            assert_eq!(e.method, "GET", "{} leaked into READ set", e.id);
        }
        let summary = catalog.read_summary();
        assert!(summary.contains("list_users"));
        assert!(!summary.contains("deactivate_user"));
    }

    #[test]
    fn select_reports_unknown_ids() {
        let catalog = ApiCatalog::new();
        let ids = vec![
            "list_group_users".to_string(),
            "no_such_operation".to_string(),
        ];
        let (found, unknown) = catalog.select(&ids);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "list_group_users");
        assert_eq!(unknown, vec!["no_such_operation"]);
    }
}
