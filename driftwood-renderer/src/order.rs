//! Kind-priority apply order.
//!
//! | Priority | Kinds                                                       |
//! |----------|-------------------------------------------------------------|
//! | 0        | Namespace                                                   |
//! | 1        | CustomResourceDefinition                                    |
//! | 2        | PriorityClass, StorageClass, PersistentVolume               |
//! | 3        | ServiceAccount, ClusterRole, Role, *RoleBinding             |
//! | 4        | ConfigMap, Secret, PersistentVolumeClaim, LimitRange, ResourceQuota |
//! | 5        | Service                                                     |
//! | 6        | workloads and everything not listed                         |
//! | 7        | Ingress, HorizontalPodAutoscaler, PodDisruptionBudget, NetworkPolicy |
//! | 8        | admission webhooks, APIService                              |

use std::cmp::Ordering;

use driftwood_core::DesiredObject;

/// Lower applies first. Unknown kinds (custom resources included) sit with
/// workloads, after the CRDs that define them.
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "PriorityClass" | "StorageClass" | "PersistentVolume" => 2,
        "ServiceAccount" | "ClusterRole" | "Role" | "ClusterRoleBinding" | "RoleBinding" => 3,
        "ConfigMap" | "Secret" | "PersistentVolumeClaim" | "LimitRange" | "ResourceQuota" => 4,
        "Service" => 5,
        "Ingress" | "HorizontalPodAutoscaler" | "PodDisruptionBudget" | "NetworkPolicy" => 7,
        "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" | "APIService" => 8,
        _ => 6,
    }
}

/// Kinds that never live in a namespace.
pub fn is_cluster_scoped(kind: &str) -> bool {
    matches!(
        kind,
        "Namespace"
            | "CustomResourceDefinition"
            | "PriorityClass"
            | "StorageClass"
            | "PersistentVolume"
            | "ClusterRole"
            | "ClusterRoleBinding"
            | "MutatingWebhookConfiguration"
            | "ValidatingWebhookConfiguration"
            | "APIService"
            | "Node"
    )
}

/// Priority, then name, then namespace, then group/version/kind.
pub fn apply_order(a: &DesiredObject, b: &DesiredObject) -> Ordering {
    kind_priority(&a.id.gvk.kind)
        .cmp(&kind_priority(&b.id.gvk.kind))
        .then_with(|| a.id.name.cmp(&b.id.name))
        .then_with(|| a.id.namespace.cmp(&b.id.namespace))
        .then_with(|| a.id.gvk.cmp(&b.id.gvk))
}
