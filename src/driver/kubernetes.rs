//! Kubernetes container driver.
//!
//! Materializes a deployment as an apps/v1 Deployment plus a ClusterIP
//! Service in the configured namespace. Creation is idempotent: a 409 from
//! the API server means an object with our logical name already exists, and
//! the driver adopts it instead of failing.

use super::{BackendPhase, BackendStatus, ContainerDriver, ContainerSpec, DriverError};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment as K8sDeployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, Namespace, Pod, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

pub struct KubernetesDriver {
    client: Client,
    namespace: String,
}

impl KubernetesDriver {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect using the ambient kubeconfig / in-cluster configuration.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, DriverError> {
        let client = Client::try_default()
            .await
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Self::new(client, namespace))
    }

    fn deployments(&self) -> Api<K8sDeployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn service_name(handle: &str) -> String {
        format!("{handle}-service")
    }

    /// Create the namespace if it does not exist yet.
    async fn ensure_namespace(&self) -> Result<(), DriverError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let manifest = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            ..Default::default()
        };
        match namespaces.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "Created namespace");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(map_kube_error(e)),
        }
    }

    fn build_manifest(&self, spec: &ContainerSpec) -> (K8sDeployment, Service) {
        let labels: BTreeMap<String, String> = spec
            .labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(std::iter::once(("app".to_string(), spec.name.clone())))
            .collect();
        let selector: BTreeMap<String, String> =
            std::iter::once(("app".to_string(), spec.name.clone())).collect();

        let env: Vec<EnvVar> = spec
            .env
            .iter()
            .map(|(name, value)| EnvVar {
                name: name.clone(),
                value: Some(value.clone()),
                ..Default::default()
            })
            .collect();

        let probe = |path: &str, initial: i32, period: i32| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(spec.container_port),
                ..Default::default()
            }),
            initial_delay_seconds: Some(initial),
            period_seconds: Some(period),
            ..Default::default()
        };

        let limits: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), Quantity(spec.cpu_limit.clone())),
            ("memory".to_string(), Quantity(spec.memory_limit.clone())),
        ]
        .into_iter()
        .collect();
        let requests: BTreeMap<String, Quantity> = [
            ("cpu".to_string(), Quantity("100m".to_string())),
            ("memory".to_string(), Quantity("128Mi".to_string())),
        ]
        .into_iter()
        .collect();

        let deployment = K8sDeployment {
            metadata: ObjectMeta {
                name: Some(spec.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(spec.replicas),
                selector: LabelSelector {
                    match_labels: Some(selector.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(selector.clone()),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: spec.name.clone(),
                            image: Some(spec.image.clone()),
                            ports: Some(vec![ContainerPort {
                                container_port: spec.container_port,
                                ..Default::default()
                            }]),
                            env: Some(env),
                            resources: Some(ResourceRequirements {
                                limits: Some(limits),
                                requests: Some(requests),
                                ..Default::default()
                            }),
                            liveness_probe: Some(probe(&spec.health_check_path, 30, 10)),
                            readiness_probe: Some(probe(&spec.health_check_path, 5, 5)),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let service = Service {
            metadata: ObjectMeta {
                name: Some(Self::service_name(&spec.name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(selector),
                ports: Some(vec![ServicePort {
                    port: spec.container_port,
                    target_port: Some(IntOrString::Int(spec.container_port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                type_: Some("ClusterIP".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        (deployment, service)
    }
}

fn map_kube_error(error: kube::Error) -> DriverError {
    match error {
        kube::Error::Api(ae) => match ae.code {
            404 => DriverError::NotFound(ae.message),
            409 => DriverError::Conflict(ae.message),
            422 => DriverError::InvalidSpec(ae.message),
            403 if ae.message.contains("quota") => DriverError::ResourceExhausted(ae.message),
            _ => DriverError::Backend(format!("{} ({})", ae.message, ae.code)),
        },
        // Anything below the API layer is transport trouble; retryable.
        other => DriverError::Connection(other.to_string()),
    }
}

#[async_trait]
impl ContainerDriver for KubernetesDriver {
    fn backend_name(&self) -> &'static str {
        "kubernetes"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        self.ensure_namespace().await?;

        let (deployment, service) = self.build_manifest(spec);

        match self
            .deployments()
            .create(&PostParams::default(), &deployment)
            .await
        {
            Ok(_) => {
                info!(workload = %spec.name, namespace = %self.namespace, "Created deployment");
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // Adopt the existing object rather than erroring.
                info!(workload = %spec.name, "Deployment already exists, adopting");
                self.deployments()
                    .get(&spec.name)
                    .await
                    .map_err(map_kube_error)?;
            }
            Err(e) => return Err(map_kube_error(e)),
        }

        match self.services().create(&PostParams::default(), &service).await {
            Ok(_) => {
                info!(service = %Self::service_name(&spec.name), "Created service");
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(service = %Self::service_name(&spec.name), "Service already exists, adopting");
            }
            Err(e) => return Err(map_kube_error(e)),
        }

        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        // A stopped cluster workload is one scaled to zero; starting means
        // bringing at least one replica back. The orchestrator follows up
        // with a scale to the desired count.
        self.scale(handle, 1).await
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        self.scale(handle, 0).await
    }

    async fn scale(&self, handle: &str, replicas: i32) -> Result<(), DriverError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        self.deployments()
            .patch_scale(handle, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_error)?;
        info!(workload = %handle, replicas, "Scaled deployment");
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<(), DriverError> {
        match self
            .deployments()
            .delete(handle, &DeleteParams::default())
            .await
        {
            Ok(_) => info!(workload = %handle, "Deleted deployment"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(workload = %handle, "Deployment already gone");
            }
            Err(e) => return Err(map_kube_error(e)),
        }

        match self
            .services()
            .delete(&Self::service_name(handle), &DeleteParams::default())
            .await
        {
            Ok(_) => info!(service = %Self::service_name(handle), "Deleted service"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(map_kube_error(e)),
        }

        Ok(())
    }

    async fn get_status(&self, handle: &str) -> Result<BackendStatus, DriverError> {
        let deployment = self
            .deployments()
            .get(handle)
            .await
            .map_err(map_kube_error)?;

        let desired = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0);
        let status = deployment.status.as_ref();
        let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);

        // A Progressing=False condition is a terminal rollout failure.
        let failure_message = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "Progressing" && c.status == "False")
                    .map(|c| c.message.clone().unwrap_or_else(|| c.type_.clone()))
            });

        let phase = if let Some(message) = &failure_message {
            warn!(workload = %handle, message = %message, "Deployment rollout failed");
            BackendPhase::Failed
        } else if desired == 0 {
            BackendPhase::Stopped
        } else if ready > 0 {
            BackendPhase::Running
        } else {
            BackendPhase::Pending
        };

        Ok(BackendStatus {
            phase,
            replicas_desired: desired,
            replicas_ready: ready,
            message: failure_message,
        })
    }

    async fn stream_logs(&self, handle: &str, tail: i64) -> Result<String, DriverError> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&format!("app={handle}")))
            .await
            .map_err(map_kube_error)?;

        let Some(pod_name) = pods
            .items
            .first()
            .and_then(|pod| pod.metadata.name.clone())
        else {
            return Ok("No pods found for deployment".to_string());
        };

        self.pods()
            .logs(
                &pod_name,
                &LogParams {
                    tail_lines: Some(tail),
                    ..Default::default()
                },
            )
            .await
            .map_err(map_kube_error)
    }
}
