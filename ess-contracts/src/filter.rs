use ess_model::record::PartialRecord;
use ess_model::Result;

/// A transformation step in the aggregator's filter chain. Filters are pure
/// and synchronous: they read a record and produce a derived one. The
/// aggregator catches and logs any error per-handler without affecting
/// other handlers sharing the same chain prefix.
pub trait Filter: Send + Sync {
    fn label(&self) -> &str;

    fn apply(&self, record: &PartialRecord) -> Result<PartialRecord>;
}
