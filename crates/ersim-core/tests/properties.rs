//! Property tests for cursor correlation and resumability
//!
//! An interrupted batch, resumed by a fresh runner over the same stores,
//! must leave the sink exactly as an uninterrupted run would.

use ersim_core::cursor::batch_range;
use ersim_core::error::StateError;
use ersim_core::rowspec::{decode_rows, encode_rows};
use ersim_core::state::{allowed_transitions, validate_transition};
use ersim_core::{
    BatchMode, BatchRunner, BatchState, PipelineConfig, RetryPolicy, RowCursor, SheetRef,
};
use ersim_sheets::{Grid, MemoryKv, MemoryWorkbook, SheetLayout, TabularStore};
use ersim_test_utils::{workbook, ScriptedModel, SINK};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const POOL: [&str; 4] = [
    "",
    "case 1: chest pain",
    "case 2: shortness of breath",
    "case 3: syncope",
];

fn runner(store: &Arc<MemoryWorkbook>, kv: &Arc<MemoryKv>) -> BatchRunner {
    let config = PipelineConfig::default()
        .with_step_delay(Duration::ZERO)
        .with_retry(RetryPolicy::none());
    BatchRunner::new(
        config,
        store.clone(),
        kv.clone(),
        Arc::new(ScriptedModel::converting()),
    )
}

/// Run a full batch, restarting with a new runner after `interrupt_after` steps
async fn run_batch(texts: &[&str], interrupt_after: Option<usize>) -> Grid {
    let store = Arc::new(workbook(texts));
    let kv = Arc::new(MemoryKv::new());

    let first = runner(&store, &kv);
    first.start(BatchMode::All).unwrap();
    let mut remaining = first.status().unwrap().map_or(0, |s| s.remaining);
    if let Some(k) = interrupt_after {
        for _ in 0..k {
            let outcome = first.step().await.unwrap();
            if outcome.done {
                break;
            }
            assert_eq!(outcome.remaining, remaining - 1);
            remaining = outcome.remaining;
        }
    }
    drop(first);

    let resumed = runner(&store, &kv);
    loop {
        if resumed.step().await.unwrap().done {
            break;
        }
    }
    assert!(resumed.status().unwrap().is_none());
    store.sheet(SINK).unwrap()
}

fn any_state() -> impl Strategy<Value = BatchState> {
    prop_oneof![
        Just(BatchState::Idle),
        Just(BatchState::Running),
        Just(BatchState::Suspended),
        Just(BatchState::Completed),
        Just(BatchState::Stopped),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_resumed_batch_matches_uninterrupted(
        picks in prop::collection::vec(0..POOL.len(), 1..8),
        interrupt_after in 0usize..10,
    ) {
        let texts: Vec<&str> = picks.iter().map(|&i| POOL[i]).collect();
        let uninterrupted = tokio_test::block_on(run_batch(&texts, None));
        let resumed = tokio_test::block_on(run_batch(&texts, Some(interrupt_after)));

        prop_assert_eq!(&uninterrupted, &resumed);
        // one sink row per source row up to the last non-blank one
        let attempted = texts.iter().rposition(|t| !t.is_empty()).map_or(0, |i| i + 1);
        prop_assert_eq!(uninterrupted.len(), attempted + 2);
    }

    #[test]
    fn prop_next_batch_starts_at_sink_size(
        sink_rows in 0usize..40,
        source_rows in 0usize..60,
        max in 1usize..30,
    ) {
        let filled = |n: usize| -> Grid {
            let mut grid = vec![vec!["h".to_string()], vec!["h".to_string()]];
            grid.extend((0..n).map(|i| vec![format!("r{i}")]));
            grid
        };
        let store = MemoryWorkbook::new()
            .with_sheet("src", filled(source_rows))
            .with_sheet("dst", filled(sink_rows));
        let layout = SheetLayout { header_rows: 2 };
        let cursor = RowCursor::new(SheetRef::new("src", layout), SheetRef::new("dst", layout));

        let next = cursor.expected_next_row(&store).unwrap();
        prop_assert_eq!(next, 3 + sink_rows);
        prop_assert_eq!(cursor.sink_row_for(next), next);

        let rows = cursor.next_batch(&store, max).unwrap();
        let expected: Vec<usize> = batch_range(next, source_rows + 2, max).collect();
        prop_assert_eq!(&rows, &expected);
        prop_assert!(rows.len() <= max);
        prop_assert!(rows.iter().all(|&r| r >= next && r <= source_rows + 2));
        prop_assert_eq!(store.last_row("src").unwrap(), source_rows + 2);
    }

    #[test]
    fn prop_pending_rows_survive_encoding(rows in prop::collection::btree_set(3usize..500, 0..60)) {
        let rows: Vec<usize> = rows.into_iter().collect();
        prop_assert_eq!(decode_rows(&encode_rows(&rows)).unwrap(), rows);
    }

    #[test]
    fn prop_finished_batches_only_return_to_idle(
        choices in prop::collection::vec(0usize..3, 1..20),
        illegal in any_state(),
    ) {
        let mut state = BatchState::Idle;
        for choice in choices {
            let next = allowed_transitions(state);
            let to = next[choice % next.len()];
            prop_assert!(validate_transition(state, to).is_ok());
            if state.is_terminal() {
                prop_assert_eq!(to, BatchState::Idle);
            }
            state = to;
        }

        if !allowed_transitions(state).contains(&illegal) {
            let err = validate_transition(state, illegal).unwrap_err();
            let rejected = matches!(
                err,
                StateError::IllegalTransition { from, to } if from == state && to == illegal
            );
            prop_assert!(rejected);
        }
    }
}
