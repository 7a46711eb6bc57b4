//! Prometheus metrics for the mesh operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `mesh_reconcile_duration_seconds` (histogram): reconcile duration labeled by controller.
//! - `mesh_reconcile_errors_total` (counter): reconcile errors labeled by controller and kind.
//! - `mesh_object_operations_total` (counter): cluster mutations labeled by object kind and verb.
//! - `mesh_component_installed` (gauge): 1 when a component of a control plane is installed.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for operator reconcile metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    /// Controller name, e.g. "servicemeshcontrolplane"
    pub controller: String,
}

/// Labels for operator error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error kind/category, e.g. "kube", "manifest", "conflict"
    pub kind: String,
}

/// Labels for object mutations issued by the engine
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ObjectLabels {
    pub kind: String,
    /// "create", "patch" or "delete"
    pub verb: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ComponentLabels {
    pub namespace: String,
    pub name: String,
    pub component: String,
}

/// Histogram tracking reconcile duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

/// Counter tracking reconcile errors
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static OBJECT_OPERATIONS_TOTAL: Lazy<Family<ObjectLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static COMPONENT_INSTALLED: Lazy<Family<ComponentLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "mesh_reconcile_duration_seconds",
        "Duration of reconcile loops in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "mesh_reconcile_errors_total",
        "Total number of reconcile errors",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "mesh_object_operations_total",
        "Objects created, patched or deleted by the engine",
        OBJECT_OPERATIONS_TOTAL.clone(),
    );
    registry.register(
        "mesh_component_installed",
        "Whether a control plane component is installed (1) or not (0)",
        COMPONENT_INSTALLED.clone(),
    );

    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(controller: &str, kind: &str) {
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_object_operation(kind: &str, verb: &str) {
    let labels = ObjectLabels {
        kind: kind.to_string(),
        verb: verb.to_string(),
    };
    OBJECT_OPERATIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_component_installed(namespace: &str, name: &str, component: &str, installed: bool) {
    let labels = ComponentLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        component: component.to_string(),
    };
    COMPONENT_INSTALLED
        .get_or_create(&labels)
        .set(i64::from(installed));
}
