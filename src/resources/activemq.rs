//! ActiveMQ broker for runtimes on the legacy messaging backend

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{owned_meta, selector_labels};
use crate::crd::TribefireRuntime;

/// OpenWire port
pub const ACTIVEMQ_PORT: i32 = 61616;

const APP: &str = "activemq";

/// `<runtime>-activemq`
pub fn activemq_name(runtime: &TribefireRuntime) -> String {
    format!("{}-{APP}", runtime.name_any())
}

/// Single-replica broker deployment
pub fn activemq_deployment(runtime: &TribefireRuntime, image_registry: &str) -> Deployment {
    let labels = selector_labels(runtime, APP);
    Deployment {
        metadata: owned_meta(runtime, activemq_name(runtime), APP),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: APP.to_string(),
                        image: Some(format!(
                            "{}/tribefire-activemq:latest",
                            image_registry.trim_end_matches('/')
                        )),
                        ports: Some(vec![ContainerPort {
                            name: Some("openwire".to_string()),
                            container_port: ACTIVEMQ_PORT,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service in front of the broker
pub fn activemq_service(runtime: &TribefireRuntime) -> Service {
    Service {
        metadata: owned_meta(runtime, activemq_name(runtime), APP),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(runtime, APP)),
            ports: Some(vec![ServicePort {
                name: Some("openwire".to_string()),
                port: ACTIVEMQ_PORT,
                target_port: Some(IntOrString::Int(ACTIVEMQ_PORT)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
