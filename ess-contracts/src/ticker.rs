use ess_model::tick::{TickDetail, TickOffset};

/// A lazy, possibly infinite source of `(offset, detail)` pairs emitted in
/// strictly increasing offset order. Sealed to `Periodic`, `Point`, `List`
/// and `OneShot` in `ess-core::scheduler`; modeled as a trait here so the
/// scheduler can hold a dynamic dispatch vector keyed by flag name.
pub trait Ticker: Send {
    /// Returns the next `(offset, detail)` pair, or `None` once the source
    /// is exhausted (mirrors `StopIteration` in the Python generators).
    fn next(&mut self) -> Option<(TickOffset, TickDetail)>;
}
