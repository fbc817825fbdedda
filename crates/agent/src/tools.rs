use std::collections::HashMap;

use datapilot_core::{Intent, ToolDescriptor};

/// Tool subsets offered to the model per intent, computed once from a catalog
/// snapshot: DATABASE sees only the query tool, API sees everything else and
/// GENERAL sees nothing.
#[derive(Clone, Debug, Default)]
pub struct ToolBindings {
    database: Vec<ToolDescriptor>,
    api: Vec<ToolDescriptor>,
    catalog: HashMap<String, ToolDescriptor>,
}

impl ToolBindings {
    pub fn build(catalog: &[ToolDescriptor], query_tool: &str) -> Self {
        let (database, api): (Vec<_>, Vec<_>) =
            catalog.iter().cloned().partition(|tool| tool.name == query_tool);
        let catalog = catalog.iter().map(|tool| (tool.name.clone(), tool.clone())).collect();
        Self { database, api, catalog }
    }

    pub fn for_intent(&self, intent: Intent) -> &[ToolDescriptor] {
        match intent {
            Intent::Database => &self.database,
            Intent::Api => &self.api,
            Intent::General => &[],
        }
    }

    /// Lookup across the whole catalog, independent of the active intent.
    pub fn descriptor(&self, name: &str) -> Option<&ToolDescriptor> {
        self.catalog.get(name)
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}
