//! Named resource groups and the context object that owns them.
//!
//! Models and dictionaries are loaded elsewhere and shared by reference
//! between groups; a group is only swapped into use when an utterance begins.

use crate::defaults;
use crate::error::{ErrorCode, PipelineError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Acoustic model as far as the pipeline is concerned.
#[derive(Debug, Clone, PartialEq)]
pub struct AcousticModel {
    pub name: String,
    /// Length of the feature vectors the model consumes.
    pub feature_dim: usize,
}

/// Word list of a recognition vocabulary.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Dictionary {
    pub words: Vec<String>,
}

impl Dictionary {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            words: words.into_iter().map(Into::into).collect(),
        }
    }
}

/// A bundle of resources the recognizer uses for one utterance.
#[derive(Debug, Clone)]
pub struct ResourceGroup {
    pub name: String,
    pub model: Arc<AcousticModel>,
    pub dictionary: Arc<Dictionary>,
}

impl ResourceGroup {
    pub fn new(name: &str, model: Arc<AcousticModel>, dictionary: Arc<Dictionary>) -> Self {
        Self {
            name: name.to_string(),
            model,
            dictionary,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.model.feature_dim
    }
}

/// Registry of resource groups, built once and handed to every stage.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    groups: BTreeMap<String, Arc<ResourceGroup>>,
    default_group: String,
}

impl Default for ResourceContext {
    fn default() -> Self {
        Self::new(defaults::DEFAULT_GROUP)
    }
}

impl ResourceContext {
    /// Creates an empty context whose default group is `default_group`.
    pub fn new(default_group: &str) -> Self {
        Self {
            groups: BTreeMap::new(),
            default_group: default_group.to_string(),
        }
    }

    /// Registers a group, replacing one with the same name.
    pub fn with_group(mut self, group: ResourceGroup) -> Self {
        self.add_group(group);
        self
    }

    pub fn add_group(&mut self, group: ResourceGroup) {
        self.groups.insert(group.name.clone(), Arc::new(group));
    }

    pub fn set_default_group(&mut self, name: &str) {
        self.default_group = name.to_string();
    }

    pub fn default_group_name(&self) -> &str {
        &self.default_group
    }

    /// Looks up a group by name.
    pub fn group(&self, name: &str) -> Result<Arc<ResourceGroup>> {
        self.groups
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::Resource {
                code: ErrorCode::MissingResourceGroup,
                message: format!("no resource group named '{}'", name),
            })
    }

    pub fn default_group(&self) -> Result<Arc<ResourceGroup>> {
        self.group(&self.default_group)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Group names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Checks that every group matches a decoder's feature dimension.
    pub fn check_feature_dim(&self, feature_dim: usize) -> Result<()> {
        for group in self.groups.values() {
            if group.feature_dim() != feature_dim {
                return Err(PipelineError::Resource {
                    code: ErrorCode::IncompatibleResources,
                    message: format!(
                        "group '{}' expects {} features, decoder uses {}",
                        group.name,
                        group.feature_dim(),
                        feature_dim
                    ),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(dim: usize) -> Arc<AcousticModel> {
        Arc::new(AcousticModel {
            name: "mono".to_string(),
            feature_dim: dim,
        })
    }

    #[test]
    fn test_groups_share_model_by_reference() {
        let shared = model(2);
        let ctx = ResourceContext::new("digits")
            .with_group(ResourceGroup::new(
                "digits",
                shared.clone(),
                Arc::new(Dictionary::new(["one", "two"])),
            ))
            .with_group(ResourceGroup::new(
                "commands",
                shared.clone(),
                Arc::new(Dictionary::new(["yes", "no"])),
            ));

        let digits = ctx.group("digits").unwrap();
        let commands = ctx.group("commands").unwrap();
        assert!(Arc::ptr_eq(&digits.model, &commands.model));
        assert_eq!(ctx.names().collect::<Vec<_>>(), vec!["commands", "digits"]);
    }

    #[test]
    fn test_missing_group_is_resource_error() {
        let ctx = ResourceContext::default();
        let err = ctx.default_group().unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::MissingResourceGroup));
        assert!(err.to_string().contains("'default'"));
    }

    #[test]
    fn test_check_feature_dim() {
        let ctx = ResourceContext::default().with_group(ResourceGroup::new(
            "default",
            model(3),
            Arc::new(Dictionary::default()),
        ));

        assert!(ctx.check_feature_dim(3).is_ok());
        let err = ctx.check_feature_dim(2).unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::IncompatibleResources));
    }

    #[test]
    fn test_set_default_group() {
        let mut ctx = ResourceContext::default();
        ctx.add_group(ResourceGroup::new("alt", model(1), Arc::new(Dictionary::default())));
        assert!(ctx.contains("alt"));
        assert!(!ctx.contains("default"));

        ctx.set_default_group("alt");
        assert_eq!(ctx.default_group_name(), "alt");
        assert_eq!(ctx.default_group().unwrap().name, "alt");
    }
}
