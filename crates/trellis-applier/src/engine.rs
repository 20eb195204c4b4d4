//! One reconciliation pass: apply, then translate for real

use tracing::{info, info_span, warn};
use uuid::Uuid;

use trellis_common::InputSnapshot;
use trellis_translator::{LoggingReporter, OutputSnapshot, Translate};

use crate::applier::{ApplySummary, Applier};

/// Everything one pass produced besides the rewritten statuses
#[derive(Debug)]
pub struct PassOutcome {
    /// Approval counts from the applier
    pub summary: ApplySummary,
    /// Backend objects for every cluster
    pub outputs: OutputSnapshot,
    /// Problems reported by the real translation; non-zero means it disagreed
    /// with the dry run
    pub late_reports: usize,
}

/// Run the applier over `snapshot`, then translate the stamped result
///
/// Statuses in `snapshot` are rewritten in place. `pass_id` only tags the
/// tracing span.
pub fn run_pass(
    snapshot: &mut InputSnapshot,
    translator: &dyn Translate,
    pass_id: Uuid,
) -> PassOutcome {
    let span = info_span!("pass", pass = %pass_id);
    let _entered = span.enter();

    let summary = Applier::new(translator).apply(snapshot);
    let mut reporter = LoggingReporter::default();
    let outputs = translator.translate(snapshot, &mut reporter);
    if reporter.count() > 0 {
        warn!(
            reports = reporter.count(),
            "translation reported problems the dry run did not"
        );
    }
    info!(
        accepted = summary.accepted,
        invalid = summary.invalid,
        outputs = outputs.total_count(),
        "pass complete"
    );
    PassOutcome {
        summary,
        outputs,
        late_reports: reporter.count(),
    }
}
