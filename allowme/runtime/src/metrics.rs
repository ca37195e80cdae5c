use crate::core::UpdateOutcome;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct RequestMetrics {
    requests: Family<OutcomeLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct OutcomeLabels {
    outcome: &'static str,
}

// === impl RequestMetrics ===

impl RequestMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let requests = Family::<OutcomeLabels, Counter>::default();
        reg.register(
            "requests",
            "Total number of allow requests handled, by outcome",
            requests.clone(),
        );
        Self { requests }
    }

    pub(crate) fn observe(&self, outcome: &UpdateOutcome) {
        let outcome = match outcome {
            UpdateOutcome::Added(_) => "added",
            UpdateOutcome::AlreadyPresent(_) => "already_present",
            UpdateOutcome::Rejected(_) => "rejected",
            UpdateOutcome::Failed(..) => "failed",
        };
        self.requests.get_or_create(&OutcomeLabels { outcome }).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{classify, Rejection};

    #[test]
    fn counts_by_outcome() {
        let mut registry = Registry::default();
        let metrics = RequestMetrics::register(registry.sub_registry_with_prefix("allowme"));

        let addr = classify("203.0.113.5").unwrap();
        metrics.observe(&UpdateOutcome::Added(addr));
        metrics.observe(&UpdateOutcome::AlreadyPresent(addr));
        metrics.observe(&UpdateOutcome::AlreadyPresent(addr));
        metrics.observe(&UpdateOutcome::Rejected(Rejection::Private));

        let mut out = String::new();
        prometheus_client::encoding::text::encode(&mut out, &registry).unwrap();
        assert!(out.contains("allowme_requests_total{outcome=\"added\"} 1"), "{out}");
        assert!(
            out.contains("allowme_requests_total{outcome=\"already_present\"} 2"),
            "{out}"
        );
        assert!(out.contains("allowme_requests_total{outcome=\"rejected\"} 1"), "{out}");
        assert!(!out.contains("outcome=\"failed\""), "{out}");
    }
}
