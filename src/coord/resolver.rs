//! Resource hierarchy resolution seam.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::catalog::Catalog;
use crate::model::{DataObject, Hierarchy};
use crate::storage::ResourceRegistry;
use crate::utils::{ErrorKind, StrataError};

/// What the caller intends to do with the object.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Intent {
    Create,
    Open { write: bool },
}

/// Outcome of resolution: the hierarchy to target and the object's current
/// catalog state, if it exists.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub hierarchy: Hierarchy,
    pub object: Option<DataObject>,
}

/// Chooses the resource hierarchy a request lands on.
#[async_trait]
pub trait ResourceResolver: fmt::Debug + Send + Sync {
    async fn resolve(
        &self,
        catalog: &dyn Catalog,
        logical_path: &str,
        intent: Intent,
        requested: Option<&str>,
    ) -> Result<Resolution, StrataError>;
}

/// Resolver honoring an explicitly requested resource, otherwise preferring
/// the first good replica for opens and the default resource for creates.
#[derive(Debug)]
pub struct DefaultResolver {
    registry: Arc<ResourceRegistry>,
    default_resource: String,
}

impl DefaultResolver {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        default_resource: impl ToString,
    ) -> Self {
        DefaultResolver {
            registry,
            default_resource: default_resource.to_string(),
        }
    }
}

#[async_trait]
impl ResourceResolver for DefaultResolver {
    async fn resolve(
        &self,
        catalog: &dyn Catalog,
        logical_path: &str,
        intent: Intent,
        requested: Option<&str>,
    ) -> Result<Resolution, StrataError> {
        let object = catalog.fetch_object(logical_path).await?;

        let hierarchy = if let Some(name) = requested {
            self.registry.by_name(name)?.hierarchy.clone()
        } else {
            let existing = match (&object, intent) {
                (Some(obj), Intent::Open { .. }) => obj
                    .first_good()
                    .or_else(|| obj.replicas.first())
                    .map(|r| r.hierarchy.clone()),
                _ => None,
            };
            match existing {
                Some(hier) => hier,
                None => self
                    .registry
                    .by_name(&self.default_resource)
                    .map_err(|e| {
                        StrataError::new(
                            ErrorKind::ResourceResolution,
                            format!("no default resource: {}", e),
                        )
                    })?
                    .hierarchy
                    .clone(),
            }
        };

        Ok(Resolution { hierarchy, object })
    }
}
