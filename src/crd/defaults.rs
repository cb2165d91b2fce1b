//! Field defaulting and validation for TribefireRuntime specs
//!
//! Runs at the start of every sync pass. Defaulting is a plain field-by-field
//! fill; validation rejects what defaulting cannot repair.

use std::collections::HashSet;

use super::component::{Component, ComponentKind};
use super::runtime::{TribefireRuntimeSpec, DEFAULT_DOMAIN};
use super::types::{BackendParam, MessagingBackend};
use crate::quantity::parse_quantity;
use crate::Error;

/// Default etcd endpoint for runtimes that do not configure one
pub const DEFAULT_ETCD_URL: &str = "http://etcd-tribefire:2379";

/// Default image tag
pub const DEFAULT_IMAGE_TAG: &str = "latest";

/// Default log level
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

/// Upper bound on replicas per component
pub const MAX_REPLICAS: i32 = 10;

/// Accepted log levels
pub const LOG_LEVELS: [&str; 7] = ["SEVERE", "WARNING", "INFO", "CONFIG", "FINE", "FINER", "FINEST"];

/// Fill unset fields of `spec` in place and validate the result.
///
/// Returns the resolved components in declaration order.
pub fn apply_defaults(
    spec: &mut TribefireRuntimeSpec,
    image_registry: &str,
) -> Result<Vec<Component>, Error> {
    if spec.domain.as_deref().is_none_or_empty() {
        spec.domain = Some(DEFAULT_DOMAIN.to_string());
    }

    if spec.backend.type_ == MessagingBackend::Etcd && spec.backend.params.is_empty() {
        spec.backend.params = vec![BackendParam::new("url", DEFAULT_ETCD_URL)];
    }

    let mut seen = HashSet::new();
    let mut components = Vec::with_capacity(spec.components.len());

    for component in &mut spec.components {
        if !seen.insert(component.name.clone()) {
            return Err(Error::validation(format!(
                "component name '{}' is declared more than once",
                component.name
            )));
        }

        let kind = ComponentKind::resolve(component)?;

        if component.replicas == 0 {
            component.replicas = 1;
        }
        if !(1..=MAX_REPLICAS).contains(&component.replicas) {
            return Err(Error::validation(format!(
                "component '{}' replicas must be between 1 and {MAX_REPLICAS}, got {}",
                component.name, component.replicas
            )));
        }

        if component.image.as_deref().is_none_or_empty() {
            component.image = Some(kind.default_image(image_registry));
        }
        if component.image_tag.as_deref().is_none_or_empty() {
            component.image_tag = Some(DEFAULT_IMAGE_TAG.to_string());
        }
        if component.api_path.as_deref().is_none_or_empty() {
            component.api_path = Some(kind.default_api_path(&component.name));
        }

        match component.log_level.as_deref() {
            None | Some("") => component.log_level = Some(DEFAULT_LOG_LEVEL.to_string()),
            Some(level) if LOG_LEVELS.contains(&level) => {}
            Some(level) => {
                return Err(Error::validation(format!(
                    "component '{}' has invalid log level '{}', expected one of: {}",
                    component.name,
                    level,
                    LOG_LEVELS.join(", ")
                )))
            }
        }

        if let Some(resources) = &component.resources {
            let lists = [("requests", &resources.requests), ("limits", &resources.limits)];
            for (field, list) in lists {
                for (resource, qty) in list.iter().flatten() {
                    if parse_quantity(&qty.0).is_none() {
                        return Err(Error::validation(format!(
                            "component '{}' {field}.{resource}: invalid quantity '{}'",
                            component.name, qty.0
                        )));
                    }
                }
            }
        }

        components.push(Component {
            kind,
            spec: component.clone(),
        });
    }

    Ok(components)
}

trait NoneOrEmpty {
    fn is_none_or_empty(&self) -> bool;
}

impl NoneOrEmpty for Option<&str> {
    fn is_none_or_empty(&self) -> bool {
        self.map_or(true, str::is_empty)
    }
}
