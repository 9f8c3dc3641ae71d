//! Operation registry
//!
//! Immutable table of [`OperationSpec`]s built once at startup and shared
//! with intake and the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use super::catalog::builtin_operations;
use super::types::{OperationInfo, OperationSpec};
use crate::config::ToolPaths;

/// Process-wide operation table
#[derive(Debug)]
pub struct OperationRegistry {
    specs: BTreeMap<&'static str, OperationSpec>,
    tools: ToolPaths,
}

impl OperationRegistry {
    /// Build the registry from the built-in operations
    ///
    /// `timeouts` overrides per-operation timeouts in seconds. Unknown names
    /// are logged and ignored.
    pub fn builtin(tools: ToolPaths, timeouts: &HashMap<String, u64>) -> Self {
        Self::from_specs(builtin_operations(), tools, timeouts)
    }

    pub fn from_specs(
        specs: Vec<OperationSpec>,
        tools: ToolPaths,
        timeouts: &HashMap<String, u64>,
    ) -> Self {
        let mut specs: BTreeMap<&'static str, OperationSpec> =
            specs.into_iter().map(|spec| (spec.name, spec)).collect();

        for (name, secs) in timeouts {
            match specs.get_mut(name.as_str()) {
                Some(spec) => {
                    tracing::info!(operation = %name, timeout_secs = secs, "Timeout override");
                    spec.timeout = Duration::from_secs(*secs);
                }
                None => tracing::warn!(operation = %name, "Timeout override for unknown operation"),
            }
        }

        Self { specs, tools }
    }

    pub fn get(&self, name: &str) -> Option<&OperationSpec> {
        self.specs.get(name)
    }

    pub fn tools(&self) -> &ToolPaths {
        &self.tools
    }

    /// Catalog in name order
    pub fn list(&self) -> Vec<OperationInfo> {
        self.specs.values().map(OperationInfo::from).collect()
    }

    /// Longest configured timeout
    pub fn max_timeout(&self) -> Duration {
        self.specs
            .values()
            .map(|spec| spec.timeout)
            .max()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = OperationRegistry::builtin(ToolPaths::default(), &HashMap::new());
        assert!(registry.get("rotate").is_some());
        assert!(registry.get("ocr").is_some());
        assert!(registry.get("bogus").is_none());
        assert_eq!(registry.list().len(), registry.len());
    }

    #[test]
    fn test_timeout_override() {
        let mut timeouts = HashMap::new();
        timeouts.insert("rotate".to_string(), 5);
        timeouts.insert("nope".to_string(), 5);

        let registry = OperationRegistry::builtin(ToolPaths::default(), &timeouts);
        assert_eq!(registry.get("rotate").unwrap().timeout, Duration::from_secs(5));
        assert_eq!(registry.max_timeout(), Duration::from_secs(600));
    }
}
