use crate::{Gvk, ResourceTypeDescriptor};

/// Decides which registered types belong to the tracked domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMatcher {
    suffix: String,
}

impl ResourceMatcher {
    pub fn new(suffix: impl Into<String>) -> Self {
        Self { suffix: suffix.into() }
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    /// One GVK per served version when the descriptor's name ends with the suffix.
    pub fn matches(&self, descriptor: &ResourceTypeDescriptor) -> Vec<Gvk> {
        if !descriptor.name.ends_with(&self.suffix) {
            return Vec::new();
        }
        descriptor
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| Gvk::new(descriptor.group.clone(), v.name.clone(), descriptor.kind.clone()))
            .collect()
    }
}
