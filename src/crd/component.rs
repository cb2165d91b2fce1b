//! Typed view of a runtime's components
//!
//! On the wire a component's type is a free string. Before anything is
//! provisioned it is resolved into [`ComponentKind`], a closed enum that every
//! per-type decision matches on exhaustively.

use super::types::ComponentSpec;
use crate::Error;

/// The closed set of component types
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ComponentKind {
    /// The master (services) node
    Services,
    /// Control center web application
    ControlCenter,
    /// Modeler web application
    Modeler,
    /// Explorer web application
    Explorer,
    /// Web reader web application
    WebReader,
    /// Custom cartridge; always carries its image since there is no default
    Cartridge {
        /// Container image without tag
        image: String,
    },
}

impl ComponentKind {
    /// Wire names of the known component types
    pub const TYPE_NAMES: [&'static str; 6] = [
        "services",
        "control-center",
        "modeler",
        "explorer",
        "web-reader",
        "cartridge",
    ];

    /// Resolve a component's declared type.
    ///
    /// Unknown types and cartridges without an image are configuration errors.
    pub fn resolve(spec: &ComponentSpec) -> Result<Self, Error> {
        match spec.type_.as_str() {
            "services" => Ok(Self::Services),
            "control-center" => Ok(Self::ControlCenter),
            "modeler" => Ok(Self::Modeler),
            "explorer" => Ok(Self::Explorer),
            "web-reader" => Ok(Self::WebReader),
            "cartridge" => match spec.image.as_deref() {
                Some(image) if !image.is_empty() => Ok(Self::Cartridge {
                    image: image.to_string(),
                }),
                _ => Err(Error::configuration(format!(
                    "cartridge '{}' has no image",
                    spec.name
                ))),
            },
            other => Err(Error::configuration(format!(
                "component '{}' has unknown type '{}', expected one of: {}",
                spec.name,
                other,
                Self::TYPE_NAMES.join(", ")
            ))),
        }
    }

    /// Wire name of the type
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Services => "services",
            Self::ControlCenter => "control-center",
            Self::Modeler => "modeler",
            Self::Explorer => "explorer",
            Self::WebReader => "web-reader",
            Self::Cartridge { .. } => "cartridge",
        }
    }

    /// Application name used in resource names and the `app` label
    pub fn app_name(&self, component_name: &str) -> String {
        match self {
            Self::Services => "tribefire-master".to_string(),
            Self::ControlCenter => "tribefire-control-center".to_string(),
            Self::Modeler => "tribefire-modeler".to_string(),
            Self::Explorer => "tribefire-explorer".to_string(),
            Self::WebReader => "tribefire-web-reader".to_string(),
            Self::Cartridge { .. } => format!("tribefire-{component_name}"),
        }
    }

    /// Image under the given registry prefix, used when the spec names none
    pub fn default_image(&self, registry: &str) -> String {
        let registry = registry.trim_end_matches('/');
        match self {
            Self::Services => format!("{registry}/tribefire-master"),
            Self::ControlCenter => format!("{registry}/tribefire-control-center"),
            Self::Modeler => format!("{registry}/tribefire-modeler"),
            Self::Explorer => format!("{registry}/tribefire-explorer"),
            Self::WebReader => format!("{registry}/tribefire-web-reader"),
            Self::Cartridge { image } => image.clone(),
        }
    }

    /// Path the component is exposed under when the spec names none
    pub fn default_api_path(&self, component_name: &str) -> String {
        match self {
            Self::Services => "/services".to_string(),
            Self::ControlCenter => "/control-center".to_string(),
            Self::Modeler => "/modeler".to_string(),
            Self::Explorer => "/explorer".to_string(),
            Self::WebReader => "/web-reader".to_string(),
            Self::Cartridge { .. } => format!("/{component_name}"),
        }
    }

    /// Returns true if the component is exposed through an ingress
    pub fn has_ingress(&self) -> bool {
        !matches!(self, Self::Cartridge { .. })
    }

    /// Short label used in event messages and error-origin metric labels
    pub fn short_name(&self) -> &'static str {
        match self {
            Self::Services => "master",
            Self::ControlCenter => "controlcenter",
            Self::Modeler => "modeler",
            Self::Explorer => "explorer",
            Self::WebReader => "webreader",
            Self::Cartridge { .. } => "cartridge",
        }
    }
}

impl std::fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// A declared component with its resolved kind
#[derive(Clone, Debug, PartialEq)]
pub struct Component {
    /// Resolved type
    pub kind: ComponentKind,
    /// Declared (and defaulted) spec
    pub spec: ComponentSpec,
}

impl Component {
    /// Resolve a component spec
    pub fn resolve(spec: &ComponentSpec) -> Result<Self, Error> {
        Ok(Self {
            kind: ComponentKind::resolve(spec)?,
            spec: spec.clone(),
        })
    }

    /// Component name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Application name of this component
    pub fn app_name(&self) -> String {
        self.kind.app_name(&self.spec.name)
    }

    /// Full image reference including tag
    pub fn image_reference(&self) -> String {
        let image = self
            .spec
            .image
            .clone()
            .unwrap_or_else(|| self.kind.default_image(""));
        let tag = self.spec.image_tag.as_deref().unwrap_or("latest");
        format!("{image}:{tag}")
    }

    /// Log level, `INFO` if unset
    pub fn log_level(&self) -> &str {
        self.spec.log_level.as_deref().unwrap_or("INFO")
    }

    /// API path with the type default applied
    pub fn api_path(&self) -> String {
        self.spec
            .api_path
            .clone()
            .unwrap_or_else(|| self.kind.default_api_path(&self.spec.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, type_: &str) -> ComponentSpec {
        ComponentSpec {
            name: name.to_string(),
            type_: type_.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn resolves_every_known_type() {
        for type_ in ComponentKind::TYPE_NAMES.iter().filter(|t| **t != "cartridge") {
            let kind = ComponentKind::resolve(&spec("c", type_)).unwrap();
            assert_eq!(kind.type_name(), *type_);
        }
    }

    #[test]
    fn unknown_type_is_a_configuration_error() {
        let err = ComponentKind::resolve(&spec("x", "database")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("unknown type 'database'"));
    }

    #[test]
    fn cartridge_needs_an_image() {
        let err = ComponentKind::resolve(&spec("billing", "cartridge")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let mut with_image = spec("billing", "cartridge");
        with_image.image = Some("registry.example/billing".to_string());
        assert_eq!(
            ComponentKind::resolve(&with_image).unwrap(),
            ComponentKind::Cartridge {
                image: "registry.example/billing".to_string()
            }
        );
    }

    #[test]
    fn cartridges_have_no_ingress() {
        let cartridge = ComponentKind::Cartridge {
            image: "img".to_string(),
        };
        assert!(!cartridge.has_ingress());
        assert!(ComponentKind::Services.has_ingress());
        assert_eq!(cartridge.app_name("billing"), "tribefire-billing");
        assert_eq!(cartridge.default_api_path("billing"), "/billing");
    }

    #[test]
    fn master_names_and_paths() {
        assert_eq!(ComponentKind::Services.app_name("master"), "tribefire-master");
        assert_eq!(ComponentKind::Services.default_api_path("master"), "/services");
        assert_eq!(
            ComponentKind::Services.default_image("registry.example/cloud/"),
            "registry.example/cloud/tribefire-master"
        );
    }

    #[test]
    fn image_reference_joins_image_and_tag() {
        let mut s = spec("master", "services");
        s.image = Some("registry.example/tribefire-master".to_string());
        s.image_tag = Some("2.1".to_string());
        let component = Component::resolve(&s).unwrap();
        assert_eq!(
            component.image_reference(),
            "registry.example/tribefire-master:2.1"
        );
    }
}
