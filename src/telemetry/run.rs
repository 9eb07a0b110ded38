//! Run and item span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::event::StatusKind;

/// Start a span covering one processor run.
///
/// `run.items` is declared empty and filled in by [`record_run_size`] once
/// the announce phase has walked the source.
pub fn start_run_span(run_id: &Uuid, concurrency: usize) -> Span {
    tracing::info_span!(
        "batchrun.run",
        "run.id" = %run_id,
        "run.concurrency" = concurrency,
        "run.items" = tracing::field::Empty,
    )
}

pub fn record_run_size(span: &Span, items: usize) {
    span.record("run.items", items);
}

/// Start a span for one item's trip through a worker.
pub fn start_item_span(index: usize) -> Span {
    tracing::debug_span!("batchrun.item", "item.index" = index)
}

/// Emit a `status_transition` event scoped to `span`.
pub fn record_status_transition(span: &Span, index: usize, from: StatusKind, to: StatusKind) {
    span.in_scope(|| {
        tracing::debug!(
            index,
            from = from.as_str(),
            to = to.as_str(),
            "status_transition"
        );
    });
}
