//! Option structs for the list/watch/patch capabilities.

/// Options for a single list call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListOptions {
    /// Label filter expressions, e.g. `app=frontend`
    pub label_filters: Vec<String>,

    /// Field selector expressions, e.g. `metadata.name=foo`
    pub field_selectors: Vec<String>,

    /// Continue token from a previous paginated response
    pub continue_token: Option<String>,

    /// Page size cap; `None` lets the server decide
    pub limit: Option<i64>,

    /// Resource version to list at; `None` for the latest
    pub resource_version: Option<String>,
}

impl ListOptions {
    /// Add a label filter
    #[must_use]
    pub fn labels(mut self, filter: &str) -> Self {
        self.label_filters.push(filter.to_string());
        self
    }

    /// Add a field selector
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selectors.push(selector.to_string());
        self
    }

    /// Cap the page size
    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// How the server should interpret [`WatchOptions::resource_version`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceVersionMatch {
    /// Return data no older than the provided version
    #[default]
    NotOlderThan,
    /// Return data at exactly the provided version
    Exact,
}

/// Options for opening a watch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WatchOptions {
    /// Resource version to start the watch from
    pub resource_version: Option<String>,

    /// Matching semantics for `resource_version`
    pub resource_version_match: ResourceVersionMatch,

    /// Label filter expressions
    pub label_filters: Vec<String>,

    /// Field selector expressions
    pub field_selectors: Vec<String>,
}

impl WatchOptions {
    /// Start the watch at `resource_version`
    #[must_use]
    pub fn at(mut self, resource_version: &str) -> Self {
        self.resource_version = Some(resource_version.to_string());
        self
    }

    /// Add a label filter
    #[must_use]
    pub fn labels(mut self, filter: &str) -> Self {
        self.label_filters.push(filter.to_string());
        self
    }

    /// Add a field selector
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selectors.push(selector.to_string());
        self
    }
}

/// Options for a patch call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchOptions {
    /// Validate without persisting
    pub dry_run: bool,

    /// Field manager name recorded for the change
    pub field_manager: Option<String>,
}

impl PatchOptions {
    /// Record the change under `manager`
    #[must_use]
    pub fn field_manager(mut self, manager: &str) -> Self {
        self.field_manager = Some(manager.to_string());
        self
    }
}
