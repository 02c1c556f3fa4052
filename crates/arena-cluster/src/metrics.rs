use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

/// Cluster-level prometheus metrics.
pub struct ClusterMetrics {
    /// Number of members in the current snapshot.
    pub members: IntGauge,
    /// Number of distinct service ids in the current snapshot.
    pub services: IntGauge,
    /// Number of cached connection pools (including no-instance entries).
    pub rpc_pools: IntGauge,
    /// Coordination sessions re-established after a disconnect.
    pub reconnects: IntCounter,
    /// Outbound RPC calls attempted.
    pub rpc_calls: IntCounter,
    /// Outbound RPC failures, labelled by error code.
    pub rpc_failures: IntCounterVec,
}

impl ClusterMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.members.clone()))?;
        registry.register(Box::new(metrics.services.clone()))?;
        registry.register(Box::new(metrics.rpc_pools.clone()))?;
        registry.register(Box::new(metrics.reconnects.clone()))?;
        registry.register(Box::new(metrics.rpc_calls.clone()))?;
        registry.register(Box::new(metrics.rpc_failures.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric definitions")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            members: IntGauge::with_opts(Opts::new(
                "cluster_members",
                "Number of members in the current snapshot",
            ))?,
            services: IntGauge::with_opts(Opts::new(
                "cluster_services",
                "Number of distinct service ids in the current snapshot",
            ))?,
            rpc_pools: IntGauge::with_opts(Opts::new(
                "cluster_rpc_pools",
                "Number of cached RPC connection pools",
            ))?,
            reconnects: IntCounter::with_opts(Opts::new(
                "cluster_reconnects_total",
                "Coordination sessions re-established after a disconnect",
            ))?,
            rpc_calls: IntCounter::with_opts(Opts::new(
                "cluster_rpc_calls_total",
                "Outbound RPC calls attempted",
            ))?,
            rpc_failures: IntCounterVec::new(
                Opts::new("cluster_rpc_failures_total", "Outbound RPC failures by code"),
                &["code"],
            )?,
        })
    }

    pub(crate) fn record_failure(&self, code: &str) {
        self.rpc_failures.with_label_values(&[code]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ClusterMetrics::unregistered();
        m.members.set(5);
        assert_eq!(m.members.get(), 5);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ClusterMetrics::new(&r).unwrap();
        m.rpc_pools.set(2);
        m.record_failure("NodeNotAvailable");
        m.record_failure("NodeNotAvailable");
        assert_eq!(m.rpc_pools.get(), 2);
        assert_eq!(
            m.rpc_failures
                .with_label_values(&["NodeNotAvailable"])
                .get(),
            2
        );
        assert_eq!(r.gather().len(), 6);
    }
}
