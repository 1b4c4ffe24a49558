//! Built-in health rules for common resource kinds.

use serde_json::Value;

use super::{HealthAssessment, HealthRegistry, HealthStatus};
use crate::resource::{Manifest, GROUP};

pub fn register_all(registry: &mut HealthRegistry) {
    registry.register("", "PersistentVolume", persistent_volume);
    registry.register("", "PersistentVolumeClaim", persistent_volume_claim);
    registry.register("", "Pod", pod);
    registry.register("", "Service", service);
    registry.register("", "Namespace", namespace);
    registry.register("apps", "Deployment", deployment);
    registry.register("apps", "StatefulSet", stateful_set);
    registry.register("apps", "DaemonSet", daemon_set);
    registry.register("apps", "ReplicaSet", replica_set);
    registry.register("batch", "Job", job);
    registry.register("networking.k8s.io", "Ingress", ingress);
    registry.register(GROUP, "Application", application);
    registry.register("bitnami.com", "SealedSecret", sealed_secret);
}

fn int_at(m: &Manifest, path: &str) -> i64 {
    m.pointer(path).and_then(Value::as_i64).unwrap_or(0)
}

fn progressing(message: impl Into<String>) -> HealthAssessment {
    HealthAssessment::with_message(HealthStatus::Progressing, message)
}

fn degraded(message: impl Into<String>) -> HealthAssessment {
    HealthAssessment::with_message(HealthStatus::Degraded, message)
}

/// Finds a condition by type in `status.conditions`.
fn condition<'a>(m: &'a Manifest, type_: &str) -> Option<&'a Value> {
    m.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn condition_is(c: &Value, status: &str) -> bool {
    c.get("status").and_then(Value::as_str) == Some(status)
}

fn condition_message(c: &Value) -> String {
    c.get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The controller has not yet observed the latest spec.
fn generation_pending(m: &Manifest) -> bool {
    let observed = m.pointer("/status/observedGeneration").and_then(Value::as_i64);
    matches!(observed, Some(o) if o < m.generation()) || (observed.is_none() && m.generation() > 0)
}

fn persistent_volume(m: &Manifest) -> HealthAssessment {
    match m.str_at("/status/phase") {
        Some("Bound") | Some("Available") => HealthAssessment::healthy(),
        Some(phase @ ("Released" | "Failed")) => degraded(format!("Volume is {}", phase)),
        _ => progressing("Waiting for volume to become available"),
    }
}

fn persistent_volume_claim(m: &Manifest) -> HealthAssessment {
    match m.str_at("/status/phase") {
        Some("Bound") => HealthAssessment::healthy(),
        Some("Lost") => degraded("Claim lost its underlying volume"),
        _ => progressing("Waiting for claim to be bound"),
    }
}

fn pod(m: &Manifest) -> HealthAssessment {
    if let Some(statuses) = m.pointer("/status/containerStatuses").and_then(Value::as_array) {
        for status in statuses {
            let reason = status
                .pointer("/state/waiting/reason")
                .and_then(Value::as_str);
            if let Some(reason @ ("CrashLoopBackOff" | "ErrImagePull" | "ImagePullBackOff"
            | "CreateContainerConfigError" | "InvalidImageName")) = reason
            {
                return degraded(reason.to_string());
            }
        }
    }
    match m.str_at("/status/phase") {
        Some("Succeeded") => HealthAssessment::healthy(),
        Some("Failed") => degraded(
            m.str_at("/status/message")
                .unwrap_or("Pod failed")
                .to_string(),
        ),
        Some("Running") => match condition(m, "Ready") {
            Some(c) if condition_is(c, "True") => HealthAssessment::healthy(),
            _ => progressing("Waiting for pod to become ready"),
        },
        _ => progressing("Pod is pending"),
    }
}

fn service(m: &Manifest) -> HealthAssessment {
    if m.str_at("/spec/type") != Some("LoadBalancer") {
        return HealthAssessment::healthy();
    }
    let has_ingress = m
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .is_some_and(|i| !i.is_empty());
    if has_ingress {
        HealthAssessment::healthy()
    } else {
        progressing("Waiting for load balancer address")
    }
}

fn namespace(m: &Manifest) -> HealthAssessment {
    match m.str_at("/status/phase") {
        Some("Terminating") => progressing("Namespace is terminating"),
        _ => HealthAssessment::healthy(),
    }
}

fn deployment(m: &Manifest) -> HealthAssessment {
    if m.pointer("/spec/paused").and_then(Value::as_bool) == Some(true) {
        return HealthAssessment::with_message(HealthStatus::Suspended, "Deployment is paused");
    }
    if generation_pending(m) {
        return progressing("Waiting for rollout to finish: observed generation is behind");
    }
    if let Some(c) = condition(m, "Progressing") {
        if c.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded") {
            return degraded(condition_message(c));
        }
    }
    let desired = m
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let updated = int_at(m, "/status/updatedReplicas");
    let total = int_at(m, "/status/replicas");
    let available = int_at(m, "/status/availableReplicas");
    if updated < desired {
        return progressing(format!(
            "Waiting for rollout to finish: {} of {} replicas updated",
            updated, desired
        ));
    }
    if total > updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} old replicas pending termination",
            total - updated
        ));
    }
    if available < updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} of {} updated replicas available",
            available, updated
        ));
    }
    HealthAssessment::healthy()
}

fn stateful_set(m: &Manifest) -> HealthAssessment {
    if generation_pending(m) {
        return progressing("Waiting for statefulset spec update to be observed");
    }
    let desired = m
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    let ready = int_at(m, "/status/readyReplicas");
    if ready < desired {
        return progressing(format!("Waiting for {} pods to be ready", desired - ready));
    }
    if m.str_at("/spec/updateStrategy/type") == Some("OnDelete") {
        return HealthAssessment::healthy();
    }
    let current = m.str_at("/status/currentRevision");
    let update = m.str_at("/status/updateRevision");
    if update.is_some() && current != update {
        return progressing("Waiting for partitioned roll out to finish");
    }
    HealthAssessment::healthy()
}

fn daemon_set(m: &Manifest) -> HealthAssessment {
    if generation_pending(m) {
        return progressing("Waiting for daemon set spec update to be observed");
    }
    let desired = int_at(m, "/status/desiredNumberScheduled");
    let updated = int_at(m, "/status/updatedNumberScheduled");
    let available = int_at(m, "/status/numberAvailable");
    if updated < desired {
        return progressing(format!(
            "Waiting for daemon set rollout: {} of {} updated",
            updated, desired
        ));
    }
    if available < desired {
        return progressing(format!(
            "Waiting for daemon set rollout: {} of {} available",
            available, desired
        ));
    }
    HealthAssessment::healthy()
}

fn replica_set(m: &Manifest) -> HealthAssessment {
    if generation_pending(m) {
        return progressing("Waiting for replica set spec update to be observed");
    }
    if let Some(c) = condition(m, "ReplicaFailure") {
        if condition_is(c, "True") {
            return degraded(condition_message(c));
        }
    }
    let desired = m
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    if int_at(m, "/status/availableReplicas") < desired {
        return progressing("Waiting for replicas to become available");
    }
    HealthAssessment::healthy()
}

fn job(m: &Manifest) -> HealthAssessment {
    if let Some(c) = condition(m, "Failed") {
        if condition_is(c, "True") {
            let message = condition_message(c);
            return degraded(if message.is_empty() {
                "Job failed".to_string()
            } else {
                message
            });
        }
    }
    if let Some(c) = condition(m, "Complete") {
        if condition_is(c, "True") {
            return HealthAssessment::healthy();
        }
    }
    if m.pointer("/spec/suspend").and_then(Value::as_bool) == Some(true) {
        return HealthAssessment::with_message(HealthStatus::Suspended, "Job is suspended");
    }
    progressing("Job is running")
}

fn ingress(m: &Manifest) -> HealthAssessment {
    let has_ingress = m
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .is_some_and(|i| !i.is_empty());
    if has_ingress {
        HealthAssessment::healthy()
    } else {
        progressing("Waiting for ingress address")
    }
}

/// Child Applications report their own aggregated health.
fn application(m: &Manifest) -> HealthAssessment {
    let message = m.str_at("/status/health/message").map(String::from);
    match m
        .str_at("/status/health/status")
        .and_then(|s| s.parse::<HealthStatus>().ok())
    {
        Some(HealthStatus::Unknown) | Some(HealthStatus::Missing) | None => {
            progressing("Waiting for child application to report health")
        }
        Some(status) => HealthAssessment { status, message },
    }
}

/// Encrypted secrets materialize once the in-cluster decrypting controller
/// has processed them, which may take extra cycles.
fn sealed_secret(m: &Manifest) -> HealthAssessment {
    if generation_pending(m) && m.status().is_some() {
        return progressing("Waiting for decryption controller to observe update");
    }
    match condition(m, "Synced") {
        Some(c) if condition_is(c, "True") => HealthAssessment::healthy(),
        Some(c) if condition_is(c, "False") => degraded(condition_message(c)),
        _ => progressing("Waiting for secret to be decrypted"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn m(value: serde_json::Value) -> Manifest {
        Manifest::from_value(value).unwrap()
    }

    #[test]
    fn test_persistent_volume_phases() {
        let pv = |phase: &str| {
            m(json!({"apiVersion": "v1", "kind": "PersistentVolume",
                "metadata": {"name": "pv"}, "status": {"phase": phase}}))
        };
        assert_eq!(persistent_volume(&pv("Bound")).status, HealthStatus::Healthy);
        assert_eq!(persistent_volume(&pv("Available")).status, HealthStatus::Healthy);
        assert_eq!(persistent_volume(&pv("Released")).status, HealthStatus::Degraded);
        assert_eq!(persistent_volume(&pv("Failed")).status, HealthStatus::Degraded);
        assert_eq!(persistent_volume(&pv("Pending")).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_deployment_rollout() {
        let mut dep = json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3}
        });
        assert_eq!(deployment(&m(dep.clone())).status, HealthStatus::Healthy);

        dep["status"]["availableReplicas"] = json!(1);
        assert_eq!(deployment(&m(dep.clone())).status, HealthStatus::Progressing);

        dep["status"]["observedGeneration"] = json!(1);
        assert_eq!(deployment(&m(dep.clone())).status, HealthStatus::Progressing);

        dep["spec"]["paused"] = json!(true);
        assert_eq!(deployment(&m(dep)).status, HealthStatus::Suspended);
    }

    #[test]
    fn test_deployment_deadline_exceeded() {
        let dep = m(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "web", "generation": 1},
            "spec": {"replicas": 1},
            "status": {"observedGeneration": 1, "conditions": [
                {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded",
                 "message": "ReplicaSet web-1 has timed out progressing"}
            ]}
        }));
        let health = deployment(&dep);
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(health.message.unwrap().contains("timed out"));
    }

    #[test]
    fn test_job_conditions() {
        let job_with = |conditions: serde_json::Value| {
            m(json!({"apiVersion": "batch/v1", "kind": "Job",
                "metadata": {"name": "j"}, "status": {"conditions": conditions}}))
        };
        assert_eq!(
            job(&job_with(json!([{"type": "Complete", "status": "True"}]))).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            job(&job_with(json!([{"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}]))).status,
            HealthStatus::Degraded
        );
        assert_eq!(job(&job_with(json!([]))).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_pod_crash_loop() {
        let pod_value = m(json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": {"name": "p"},
            "status": {"phase": "Running", "containerStatuses": [
                {"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
            ]}
        }));
        assert_eq!(pod(&pod_value).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_child_application_health() {
        let app = |status: serde_json::Value| {
            m(json!({"apiVersion": "keel.io/v1", "kind": "Application",
                "metadata": {"name": "child"}, "status": status}))
        };
        assert_eq!(
            application(&app(json!({"health": {"status": "Healthy"}}))).status,
            HealthStatus::Healthy
        );
        assert_eq!(
            application(&app(json!({"health": {"status": "Degraded", "message": "x"}}))).status,
            HealthStatus::Degraded
        );
        assert_eq!(application(&app(json!({}))).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_sealed_secret_waits_for_decryption() {
        let mut ss = json!({"apiVersion": "bitnami.com/v1alpha1", "kind": "SealedSecret",
            "metadata": {"name": "db", "generation": 1}, "spec": {"encryptedData": {"password": "AgB..."}}});
        assert_eq!(sealed_secret(&m(ss.clone())).status, HealthStatus::Progressing);
        ss["status"] = json!({"observedGeneration": 1, "conditions": [{"type": "Synced", "status": "True"}]});
        assert_eq!(sealed_secret(&m(ss)).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_load_balancer_service() {
        let svc = m(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"type": "LoadBalancer"}}));
        assert_eq!(service(&svc).status, HealthStatus::Progressing);
        let cluster_ip = m(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"},
            "spec": {"type": "ClusterIP"}}));
        assert_eq!(service(&cluster_ip).status, HealthStatus::Healthy);
    }
}
