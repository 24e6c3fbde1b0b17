//! Kubernetes-backed host gateway.
//!
//! All mutations go through server-side apply under a single field
//! manager, so re-running a task converges on the already-applied
//! object instead of failing or duplicating it. Deletes tolerate 404.

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::{Deployment, DeploymentSpec},
    batch::v1::{Job, JobSpec},
    core::v1::{
        Container, EnvVar, EnvVarSource, Namespace, Pod, PodSpec, PodTemplateSpec, ResourceQuota,
        Secret, SecretKeySelector, Service, ServicePort, ServiceSpec,
    },
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use ::kube::{
    Api, Client,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, ObjectMeta, Patch, PatchParams},
    core::GroupVersionKind,
};
use std::{collections::BTreeMap, future::Future, time::Duration};

use super::*;
use crate::{
    error::{Error, Result},
    names,
};
use atoll_common::labels;
use atoll_types::{VCluster, VClusterPhase, VClusterResources, VClusterSpec, hnc};

/// Field manager for server-side apply.
const MANAGER_NAME: &str = "atoll-control";

/// Namespace velero objects live in.
const VELERO_NAMESPACE: &str = "velero";

/// Host components whose health the control plane reports.
const SYSTEM_COMPONENTS: &[(&str, &str, &str)] = &[
    ("vcluster-operator", "atoll-system", "vcluster-operator"),
    ("hnc-controller", "hnc-system", "hnc-controller-manager"),
    ("tekton-pipelines", "tekton-pipelines", "tekton-pipelines-controller"),
    ("velero", VELERO_NAMESPACE, "velero"),
];

pub struct KubeHostGateway {
    client: Client,
    call_timeout: Duration,
}

impl KubeHostGateway {
    pub fn new(client: Client, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.call_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{what} exceeded {:?}", self.call_timeout)))?
    }

    fn apply_params() -> PatchParams {
        PatchParams::apply(MANAGER_NAME).force()
    }

    async fn ensure_namespace(&self, name: &str, extra_labels: &BTreeMap<String, String>) -> Result<()> {
        let mut ns_labels = extra_labels.clone();
        ns_labels.insert(labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(ns_labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.patch(name, &Self::apply_params(), &Patch::Apply(&ns))
            .await?;
        Ok(())
    }

    fn anchor_api(&self, parent: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), parent, &hnc::api_resource())
    }

    fn velero_api(&self, kind: &str, plural: &str) -> Api<DynamicObject> {
        let ar = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("velero.io", "v1", kind),
            plural,
        );
        Api::namespaced_with(self.client.clone(), VELERO_NAMESPACE, &ar)
    }

    fn kubeconfig_secret_name(instance_name: &str) -> String {
        format!("{instance_name}-kubeconfig")
    }
}

fn dynamic_phase(obj: &DynamicObject) -> Option<String> {
    obj.data
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(|p| p.as_str())
        .map(|p| p.to_string())
}

/// Exit code of the first terminated container among a job's pods.
fn first_exit_code(pods: &[Pod]) -> Option<i32> {
    for pod in pods {
        let Some(statuses) = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.as_ref())
        else {
            continue;
        };
        for cs in statuses {
            if let Some(term) = cs
                .state
                .as_ref()
                .and_then(|s| s.terminated.as_ref())
            {
                return Some(term.exit_code);
            }
        }
    }
    None
}

#[async_trait]
impl HostGateway for KubeHostGateway {
    async fn apply_vcluster(&self, spec: &VClusterSpecReq) -> Result<VClusterHandle> {
        self.bounded("apply vcluster", async {
            let mut ns_labels = BTreeMap::new();
            ns_labels.insert(labels::WORKSPACE_ID.into(), spec.workspace_id.to_string());
            self.ensure_namespace(&spec.namespace, &ns_labels).await?;

            let resources: VClusterResources = spec
                .resources
                .clone()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();
            let dedicated_nodes = spec
                .dedicated_node_config
                .clone()
                .map(serde_json::from_value)
                .transpose()?;

            let vcluster_spec = VClusterSpec {
                plan: spec.plan.clone(),
                kubernetes_version: spec.kubernetes_version.clone(),
                sync_replicas: 1,
                paused: spec.paused,
                resources,
                dedicated_nodes,
                overrides: BTreeMap::new(),
            };
            let mut annotations = BTreeMap::new();
            annotations.insert(labels::SPEC_HASH.into(), names::spec_hash(&vcluster_spec));
            let obj = VCluster {
                metadata: ObjectMeta {
                    name: Some(spec.instance_name.clone()),
                    namespace: Some(spec.namespace.clone()),
                    labels: Some(BTreeMap::from([
                        (labels::MANAGED_BY.into(), labels::MANAGED_BY_VALUE.into()),
                        (labels::WORKSPACE_ID.into(), spec.workspace_id.to_string()),
                    ])),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                spec: vcluster_spec,
                status: None,
            };

            let api: Api<VCluster> = Api::namespaced(self.client.clone(), &spec.namespace);
            api.patch(&spec.instance_name, &Self::apply_params(), &Patch::Apply(&obj))
                .await?;

            Ok(VClusterHandle {
                instance_name: spec.instance_name.clone(),
                kubeconfig_ref: format!(
                    "{}/{}",
                    spec.namespace,
                    Self::kubeconfig_secret_name(&spec.instance_name)
                ),
            })
        })
        .await
    }

    async fn delete_vcluster(&self, namespace: &str, instance_name: &str) -> Result<()> {
        self.bounded("delete vcluster", async {
            let api: Api<VCluster> = Api::namespaced(self.client.clone(), namespace);
            match api.delete(instance_name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn get_vcluster_status(
        &self,
        namespace: &str,
        instance_name: &str,
    ) -> Result<VClusterObserved> {
        self.bounded("get vcluster status", async {
            let api: Api<VCluster> = Api::namespaced(self.client.clone(), namespace);
            let obj = api.get_opt(instance_name).await?;
            let Some(obj) = obj else {
                return Ok(VClusterObserved {
                    phase: VClusterPhase::Unknown,
                    message: Some("instance not found".into()),
                    conditions: vec![],
                });
            };
            let Some(status) = obj.status else {
                return Ok(VClusterObserved {
                    phase: VClusterPhase::Pending,
                    message: None,
                    conditions: vec![],
                });
            };
            Ok(VClusterObserved {
                phase: status.phase,
                message: status.message,
                conditions: status
                    .conditions
                    .into_iter()
                    .map(|c| (c.type_, c.status))
                    .collect(),
            })
        })
        .await
    }

    async fn export_kubeconfig(&self, namespace: &str, instance_name: &str) -> Result<Vec<u8>> {
        self.bounded("export kubeconfig", async {
            let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
            let name = Self::kubeconfig_secret_name(instance_name);
            let secret = api
                .get_opt(&name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("kubeconfig secret {namespace}/{name}")))?;
            secret
                .data
                .and_then(|mut d| d.remove("config"))
                .map(|b| b.0)
                .ok_or_else(|| Error::Internal(format!("secret {name} has no 'config' key")))
        })
        .await
    }

    async fn apply_namespace_with_anchor(&self, parent: &str, name: &str) -> Result<()> {
        self.bounded("apply namespace anchor", async {
            self.ensure_namespace(parent, &BTreeMap::new()).await?;
            let mut anchor = DynamicObject::new(name, &hnc::api_resource());
            anchor.metadata.namespace = Some(parent.to_string());
            anchor.metadata.labels = Some(BTreeMap::from([(
                labels::MANAGED_BY.to_string(),
                labels::MANAGED_BY_VALUE.to_string(),
            )]));
            self.anchor_api(parent)
                .patch(name, &Self::apply_params(), &Patch::Apply(&anchor))
                .await?;
            Ok(())
        })
        .await
    }

    async fn namespace_active(&self, name: &str) -> Result<bool> {
        self.bounded("check namespace", async {
            let api: Api<Namespace> = Api::all(self.client.clone());
            let Some(ns) = api.get_opt(name).await? else {
                return Ok(false);
            };
            Ok(ns
                .status
                .and_then(|s| s.phase)
                .map(|p| p == "Active")
                .unwrap_or(false))
        })
        .await
    }

    async fn delete_namespace_anchor(&self, parent: &str, name: &str) -> Result<()> {
        self.bounded("delete namespace anchor", async {
            match self
                .anchor_api(parent)
                .delete(name, &DeleteParams::default())
                .await
            {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        self.bounded("delete namespace", async {
            let api: Api<Namespace> = Api::all(self.client.clone());
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn get_namespace_resource_quota(&self, namespace: &str) -> Result<QuotaStatus> {
        self.bounded("get resource quota", async {
            let api: Api<ResourceQuota> = Api::namespaced(self.client.clone(), namespace);
            let quotas = api.list(&ListParams::default()).await?;
            let mut out = QuotaStatus::default();
            for quota in quotas {
                let Some(status) = quota.status else { continue };
                for (k, v) in status.hard.unwrap_or_default() {
                    out.hard.insert(k, v.0);
                }
                for (k, v) in status.used.unwrap_or_default() {
                    out.used.insert(k, v.0);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn get_pod_metrics(&self, namespace: &str) -> Result<Vec<PodMetricsEntry>> {
        self.bounded("get pod metrics", async {
            let ar = ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics"),
                "pods",
            );
            let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
            let list = api.list(&ListParams::default()).await?;
            let mut out = Vec::new();
            for item in list {
                let pod = item.metadata.name.clone().unwrap_or_default();
                let containers = item
                    .data
                    .get("containers")
                    .and_then(|c| c.as_array())
                    .map(|arr| {
                        arr.iter()
                            .map(|c| ContainerUsage {
                                name: c
                                    .get("name")
                                    .and_then(|n| n.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                                cpu: c
                                    .pointer("/usage/cpu")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("0")
                                    .to_string(),
                                memory: c
                                    .pointer("/usage/memory")
                                    .and_then(|v| v.as_str())
                                    .unwrap_or("0")
                                    .to_string(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                out.push(PodMetricsEntry { pod, containers });
            }
            Ok(out)
        })
        .await
    }

    async fn check_component_health(&self) -> Result<BTreeMap<String, ComponentHealth>> {
        self.bounded("check component health", async {
            let mut out = BTreeMap::new();
            for (component, namespace, deployment) in SYSTEM_COMPONENTS {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                let health = match api.get_opt(deployment).await {
                    Ok(Some(dep)) => {
                        let ready = dep
                            .status
                            .as_ref()
                            .and_then(|s| s.ready_replicas)
                            .unwrap_or(0);
                        if ready > 0 {
                            ComponentHealth {
                                healthy: true,
                                message: format!("{ready} replica(s) ready"),
                            }
                        } else {
                            ComponentHealth {
                                healthy: false,
                                message: "no ready replicas".into(),
                            }
                        }
                    }
                    Ok(None) => ComponentHealth {
                        healthy: false,
                        message: format!("deployment {namespace}/{deployment} not found"),
                    },
                    Err(e) => ComponentHealth {
                        healthy: false,
                        message: e.to_string(),
                    },
                };
                out.insert(component.to_string(), health);
            }
            Ok(out)
        })
        .await
    }

    async fn apply_workload(&self, spec: &WorkloadSpecReq) -> Result<()> {
        self.bounded("apply workload", async {
            let mut match_labels = BTreeMap::new();
            match_labels.insert("app".to_string(), spec.name.clone());
            let mut pod_labels = spec.labels.clone();
            pod_labels.extend(match_labels.clone());

            let env: Vec<EnvVar> = spec
                .env
                .iter()
                .map(|(k, v)| EnvVar {
                    name: k.clone(),
                    value: Some(v.clone()),
                    ..Default::default()
                })
                .collect();

            let mut annotations = BTreeMap::new();
            annotations.insert(labels::SPEC_HASH.into(), names::spec_hash(spec));

            let deployment = Deployment {
                metadata: ObjectMeta {
                    name: Some(spec.name.clone()),
                    namespace: Some(spec.namespace.clone()),
                    labels: Some(pod_labels.clone()),
                    annotations: Some(annotations),
                    ..Default::default()
                },
                spec: Some(DeploymentSpec {
                    replicas: Some(spec.replicas),
                    selector: LabelSelector {
                        match_labels: Some(match_labels.clone()),
                        ..Default::default()
                    },
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(pod_labels.clone()),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: "app".to_string(),
                                image: Some(spec.image.clone()),
                                env: Some(env),
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
                    name: Some(spec.name.clone()),
                    namespace: Some(spec.namespace.clone()),
                    labels: Some(pod_labels),
                    ..Default::default()
                },
                spec: Some(ServiceSpec {
                    selector: Some(match_labels),
                    ports: Some(vec![ServicePort {
                        port: spec.container_port,
                        target_port: Some(IntOrString::Int(spec.container_port)),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let deployments: Api<Deployment> =
                Api::namespaced(self.client.clone(), &spec.namespace);
            deployments
                .patch(&spec.name, &Self::apply_params(), &Patch::Apply(&deployment))
                .await?;
            let services: Api<Service> = Api::namespaced(self.client.clone(), &spec.namespace);
            services
                .patch(&spec.name, &Self::apply_params(), &Patch::Apply(&service))
                .await?;
            Ok(())
        })
        .await
    }

    async fn observe_workload(&self, namespace: &str, name: &str) -> Result<ObservedWorkload> {
        self.bounded("observe workload", async {
            let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            let Some(dep) = api.get_opt(name).await? else {
                return Ok(ObservedWorkload::default());
            };
            let status = dep.status.unwrap_or_default();
            Ok(ObservedWorkload {
                replicas: status.replicas.unwrap_or(0),
                ready_replicas: status.ready_replicas.unwrap_or(0),
            })
        })
        .await
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> Result<()> {
        self.bounded("delete workload", async {
            let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
            match deployments.delete(name, &DeleteParams::default()).await {
                Ok(_) => {}
                Err(::kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(Error::from(e)),
            }
            let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
            match services.delete(name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn create_job(&self, spec: &JobSpecReq) -> Result<()> {
        self.bounded("create job", async {
            let env: Vec<EnvVar> = spec
                .env
                .iter()
                .map(|(k, v)| EnvVar {
                    name: k.clone(),
                    value: Some(v.clone()),
                    ..Default::default()
                })
                .chain(spec.secret_refs.iter().enumerate().map(|(i, secret)| {
                    EnvVar {
                        name: format!("ATOLL_SECRET_{i}"),
                        value_from: Some(EnvVarSource {
                            secret_key_ref: Some(SecretKeySelector {
                                name: secret.clone(),
                                key: "token".to_string(),
                                optional: Some(true),
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }
                }))
                .collect();

            let job = Job {
                metadata: ObjectMeta {
                    name: Some(spec.name.clone()),
                    namespace: Some(spec.namespace.clone()),
                    labels: Some(spec.labels.clone()),
                    ..Default::default()
                },
                spec: Some(JobSpec {
                    backoff_limit: Some(spec.backoff_limit),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(spec.labels.clone()),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            restart_policy: Some("Never".to_string()),
                            containers: vec![Container {
                                name: "job".to_string(),
                                image: Some(spec.image.clone()),
                                command: if spec.command.is_empty() {
                                    None
                                } else {
                                    Some(spec.command.clone())
                                },
                                env: Some(env),
                                ..Default::default()
                            }],
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            };

            let api: Api<Job> = Api::namespaced(self.client.clone(), &spec.namespace);
            // Jobs are immutable once created; an AlreadyExists answer
            // means a prior attempt got this far, which is convergence.
            match api.create(&Default::default(), &job).await {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn observe_job(&self, namespace: &str, name: &str) -> Result<ObservedJob> {
        self.bounded("observe job", async {
            let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
            let job = api
                .get_opt(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("job {namespace}/{name}")))?;
            let status = job.status.unwrap_or_default();

            if status.succeeded.unwrap_or(0) > 0 {
                return Ok(ObservedJob {
                    state: JobState::Succeeded,
                    exit_code: Some(0),
                });
            }
            if status.failed.unwrap_or(0) > 0 {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                let list = pods
                    .list(&ListParams::default().labels(&format!("job-name={name}")))
                    .await?;
                return Ok(ObservedJob {
                    state: JobState::Failed,
                    exit_code: first_exit_code(&list.items).or(Some(1)),
                });
            }
            Ok(ObservedJob {
                state: JobState::Active,
                exit_code: None,
            })
        })
        .await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.bounded("delete job", async {
            let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
            match api
                .delete(name, &DeleteParams::background())
                .await
            {
                Ok(_) => Ok(()),
                Err(::kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
    }

    async fn create_snapshot(&self, namespace: &str, snapshot_name: &str) -> Result<String> {
        self.bounded("create snapshot", async {
            let api = self.velero_api("Backup", "backups");
            let ar = ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("velero.io", "v1", "Backup"),
                "backups",
            );
            let mut backup = DynamicObject::new(snapshot_name, &ar);
            backup.metadata.namespace = Some(VELERO_NAMESPACE.to_string());
            backup.data = serde_json::json!({
                "spec": {
                    "includedNamespaces": [namespace],
                    "ttl": "720h0m0s",
                }
            });
            api.patch(snapshot_name, &Self::apply_params(), &Patch::Apply(&backup))
                .await?;
            Ok(format!("{VELERO_NAMESPACE}/{snapshot_name}"))
        })
        .await
    }

    async fn get_snapshot_state(&self, snapshot_ref: &str) -> Result<SnapshotState> {
        self.bounded("get snapshot state", async {
            let name = snapshot_ref
                .rsplit('/')
                .next()
                .ok_or_else(|| Error::Validation(format!("bad snapshot ref {snapshot_ref:?}")))?;
            let api = self.velero_api("Backup", "backups");
            let obj = api
                .get_opt(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("snapshot {snapshot_ref}")))?;
            Ok(match dynamic_phase(&obj).as_deref() {
                Some("Completed") => SnapshotState::Completed,
                Some("Failed") | Some("PartiallyFailed") | Some("FailedValidation") => {
                    SnapshotState::Failed
                }
                _ => SnapshotState::InProgress,
            })
        })
        .await
    }

    async fn restore_snapshot(&self, namespace: &str, snapshot_ref: &str) -> Result<String> {
        self.bounded("restore snapshot", async {
            let backup_name = snapshot_ref
                .rsplit('/')
                .next()
                .ok_or_else(|| Error::Validation(format!("bad snapshot ref {snapshot_ref:?}")))?;
            let restore_name = format!("{backup_name}-restore");
            let ar = ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk("velero.io", "v1", "Restore"),
                "restores",
            );
            let mut restore = DynamicObject::new(&restore_name, &ar);
            restore.metadata.namespace = Some(VELERO_NAMESPACE.to_string());
            restore.data = serde_json::json!({
                "spec": {
                    "backupName": backup_name,
                    "includedNamespaces": [namespace],
                    "existingResourcePolicy": "update",
                }
            });
            self.velero_api("Restore", "restores")
                .patch(&restore_name, &Self::apply_params(), &Patch::Apply(&restore))
                .await?;
            Ok(format!("{VELERO_NAMESPACE}/{restore_name}"))
        })
        .await
    }

    async fn get_restore_state(&self, restore_ref: &str) -> Result<SnapshotState> {
        self.bounded("get restore state", async {
            let name = restore_ref
                .rsplit('/')
                .next()
                .ok_or_else(|| Error::Validation(format!("bad restore ref {restore_ref:?}")))?;
            let obj = self
                .velero_api("Restore", "restores")
                .get_opt(name)
                .await?
                .ok_or_else(|| Error::NotFound(format!("restore {restore_ref}")))?;
            Ok(match dynamic_phase(&obj).as_deref() {
                Some("Completed") => SnapshotState::Completed,
                Some("Failed") | Some("PartiallyFailed") | Some("FailedValidation") => {
                    SnapshotState::Failed
                }
                _ => SnapshotState::InProgress,
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus};

    fn pod_with_exit(exit_code: Option<i32>) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: exit_code.map(|code| {
                    vec![ContainerStatus {
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: code,
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn first_exit_code_picks_terminated_container() {
        assert_eq!(first_exit_code(&[pod_with_exit(None)]), None);
        assert_eq!(first_exit_code(&[pod_with_exit(Some(3))]), Some(3));
        assert_eq!(
            first_exit_code(&[pod_with_exit(None), pod_with_exit(Some(137))]),
            Some(137)
        );
    }

    #[test]
    fn dynamic_phase_reads_status() {
        let ar = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("velero.io", "v1", "Backup"),
            "backups",
        );
        let mut obj = DynamicObject::new("b", &ar);
        assert_eq!(dynamic_phase(&obj), None);
        obj.data = serde_json::json!({"status": {"phase": "Completed"}});
        assert_eq!(dynamic_phase(&obj).as_deref(), Some("Completed"));
    }
}
