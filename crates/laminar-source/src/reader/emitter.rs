//! Conversion of raw fetched records into output records.

use super::output::SplitOutput;
use crate::error::Result;

/// Turns a raw record `R` of one split into zero or more output records `T`,
/// advancing the split's progress `St`.
///
/// Runs on the reader's owning task, never on a fetcher. The state update and
/// the emission happen together, so a checkpoint taken between two calls
/// always matches what was emitted.
pub trait RecordEmitter<R, T, St>: Send + 'static {
    /// Emits `element` and updates `state`.
    ///
    /// # Errors
    ///
    /// An error fails the reader.
    fn emit_record(&mut self, element: R, output: &mut SplitOutput<'_, T>, state: &mut St) -> Result<()>;
}
