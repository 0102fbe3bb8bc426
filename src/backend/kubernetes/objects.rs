//! Desired-state builders for the three kinds of objects the kubernetes backend manages:
//! the shared ConfigMap and one Service/Deployment pair per account.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub const HERITAGE_LABEL: &str = "heritage";
pub const HERITAGE_VALUE: &str = "keppel-api";
pub const MARKER_LABEL: &str = "marker";
pub const ACCOUNT_SELECTOR_LABEL: &str = "name";
pub const CONFIGMAP_NAME: &str = "registry";
pub const CONFIG_MOUNT_PATH: &str = "/etc/keppel";

pub fn heritage_labels(marker: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HERITAGE_LABEL.to_string(), HERITAGE_VALUE.to_string()),
        (MARKER_LABEL.to_string(), marker.to_string()),
    ])
}

pub fn labels_match(labels: &BTreeMap<String, String>, marker: &str) -> bool {
    labels.get(HERITAGE_LABEL).map(String::as_str) == Some(HERITAGE_VALUE)
        && labels.get(MARKER_LABEL).map(String::as_str) == Some(marker)
}

fn pod_selector(marker: &str, account: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        ACCOUNT_SELECTOR_LABEL.to_string(),
        format!("{marker}-{account}"),
    )])
}

fn meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

// --- ConfigMap -------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConfigMapDesired {
    pub base_yaml: String,
    pub cert_bundle: String,
}

pub fn new_configmap(namespace: &str, marker: &str) -> ConfigMap {
    ConfigMap {
        metadata: meta(CONFIGMAP_NAME, namespace, heritage_labels(marker)),
        ..Default::default()
    }
}

pub fn apply_configmap(spec: &ConfigMapDesired, cm: &mut ConfigMap) {
    cm.data = Some(BTreeMap::from([
        ("registry-base.yaml".to_string(), spec.base_yaml.clone()),
        ("issuer-cert-bundle.pem".to_string(), spec.cert_bundle.clone()),
    ]));
}

// --- Service -----------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceDesired {
    pub marker: String,
    pub account: String,
}

pub fn new_service(namespace: &str, account: &str, marker: &str) -> Service {
    Service {
        metadata: meta(
            &service_name(account),
            namespace,
            heritage_labels(marker),
        ),
        ..Default::default()
    }
}

pub fn service_name(account: &str) -> String {
    format!("keppel-{account}")
}

pub fn apply_service(spec: &ServiceDesired, svc: &mut Service) {
    svc.spec = Some(ServiceSpec {
        selector: Some(pod_selector(&spec.marker, &spec.account)),
        ports: Some(vec![ServicePort {
            name: Some("http".to_string()),
            port: 8080,
            target_port: Some(IntOrString::Int(8080)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..svc.spec.clone().unwrap_or_default()
    });
}

// --- Deployment --------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeploymentDesired {
    pub marker: String,
    pub account: String,
    pub registry_image: String,
    pub secret: String,
    pub env_vars: HashMap<String, String>,
}

pub fn new_deployment(namespace: &str, account: &str, marker: &str) -> Deployment {
    Deployment {
        metadata: meta(
            &deployment_name(account),
            namespace,
            heritage_labels(marker),
        ),
        ..Default::default()
    }
}

pub fn deployment_name(account: &str) -> String {
    format!("keppel-{account}")
}

pub fn apply_deployment(spec: &DeploymentDesired, dep: &mut Deployment) {
    let labels = pod_selector(&spec.marker, &spec.account);

    let mut env: Vec<EnvVar> = spec
        .env_vars
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();
    env.sort_by(|a, b| a.name.cmp(&b.name));
    env.push(EnvVar {
        name: "REGISTRY_HTTP_ADDR".to_string(),
        value: Some(":8080".to_string()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "REGISTRY_HTTP_SECRET".to_string(),
        value: Some(spec.secret.clone()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "REGISTRY_LOG_FIELDS_KEPPEL.ACCOUNT".to_string(),
        value: Some(spec.account.clone()),
        ..Default::default()
    });

    dep.spec = Some(DeploymentSpec {
        replicas: Some(2),
        min_ready_seconds: Some(10),
        strategy: Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_unavailable: Some(IntOrString::Int(0)),
                max_surge: Some(IntOrString::Int(1)),
            }),
        }),
        selector: LabelSelector {
            match_labels: Some(labels.clone()),
            match_expressions: None,
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "registry".to_string(),
                    image: Some(spec.registry_image.clone()),
                    ports: Some(vec![ContainerPort {
                        container_port: 8080,
                        ..Default::default()
                    }]),
                    env: Some(env),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "config".to_string(),
                        mount_path: CONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "config".to_string(),
                    config_map: Some(ConfigMapVolumeSource {
                        name: Some(CONFIGMAP_NAME.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
        ..Default::default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applying_the_same_desired_state_twice_is_idempotent() {
        let desired = ServiceDesired {
            marker: "registry".into(),
            account: "a1".into(),
        };
        let mut svc = new_service("keppel", "a1", "registry");
        apply_service(&desired, &mut svc);
        let once = svc.clone();
        apply_service(&desired, &mut svc);
        assert_eq!(once, svc);
    }

    #[test]
    fn deployment_carries_account_specific_env() {
        let desired = DeploymentDesired {
            marker: "registry".into(),
            account: "a1".into(),
            registry_image: "keppel/registry:latest".into(),
            secret: "s3cr3t".into(),
            env_vars: HashMap::new(),
        };
        let mut dep = new_deployment("keppel", "a1", "registry");
        apply_deployment(&desired, &mut dep);

        let spec = dep.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        let container = &spec.template.spec.unwrap().containers[0];
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "REGISTRY_HTTP_SECRET"
            && e.value.as_deref() == Some("s3cr3t")));
    }

    #[test]
    fn labels_match_requires_both_heritage_and_marker() {
        let labels = heritage_labels("registry");
        assert!(labels_match(&labels, "registry"));
        assert!(!labels_match(&labels, "other-marker"));
        assert!(!labels_match(&BTreeMap::new(), "registry"));
    }
}
