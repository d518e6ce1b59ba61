//! A shared filter chain prefix, grounded on `DataLogger.add_handler`'s
//! `(key, parent_key, filterlist)` registration triples.

use ess_contracts::filter::Filter;
use ess_model::record::PartialRecord;
use std::sync::Arc;
use tracing::warn;

pub struct FilterChain {
    pub(super) parent_key: Option<String>,
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self {
            parent_key: None,
            filters,
        }
    }

    /// Applies this chain's filters in order on top of `base`, which is
    /// already the parent chain's output (or the raw merged record for a
    /// root chain). A filter error is logged and that filter is skipped;
    /// the rest of the chain still runs so sibling handlers downstream of
    /// this chain still receive the other filters' output.
    pub fn apply(&self, base: PartialRecord) -> PartialRecord {
        let mut current = base;
        for filter in &self.filters {
            match filter.apply(&current) {
                Ok(next) => current = next,
                Err(err) => {
                    warn!(filter = filter.label(), error = %err, "filter failed, passing record through unchanged");
                }
            }
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_model::error::Result;

    struct AddOne;
    impl Filter for AddOne {
        fn label(&self) -> &str {
            "add_one"
        }
        fn apply(&self, record: &PartialRecord) -> Result<PartialRecord> {
            let mut out = record.clone();
            let v = out.fields.get("x").and_then(|f| f.as_f64()).unwrap_or(0.0);
            out.insert("x", v + 1.0);
            Ok(out)
        }
    }

    struct AlwaysFails;
    impl Filter for AlwaysFails {
        fn label(&self) -> &str {
            "always_fails"
        }
        fn apply(&self, _record: &PartialRecord) -> Result<PartialRecord> {
            Err(ess_model::error::EssError::Invariant("boom".to_string()))
        }
    }

    #[test]
    fn chain_applies_filters_in_order() {
        let chain = FilterChain::new(vec![Arc::new(AddOne), Arc::new(AddOne)]);
        let mut base = PartialRecord::new();
        base.insert("x", 0.0);
        let result = chain.apply(base);
        assert_eq!(result.fields["x"].as_f64(), Some(2.0));
    }

    #[test]
    fn failing_filter_is_skipped_not_fatal() {
        let chain = FilterChain::new(vec![Arc::new(AlwaysFails), Arc::new(AddOne)]);
        let mut base = PartialRecord::new();
        base.insert("x", 0.0);
        let result = chain.apply(base);
        assert_eq!(result.fields["x"].as_f64(), Some(1.0));
    }
}
