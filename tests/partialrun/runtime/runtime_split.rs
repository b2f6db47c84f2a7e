use anyhow::Result;
use partialrun::{
    create_and_initialize_feeds_fetches_manager, run_core, CancellationToken,
    PartialGraphExecutionState, Session, TensorValue, TraceEventKind, ValueCache,
};

use crate::common;

fn full_run(session: &Session, x: &TensorValue) -> Result<Vec<TensorValue>> {
    let manager = create_and_initialize_feeds_fetches_manager(session, &["x"], &["f", "g"], &[])?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(0);
    state.set_program_counter_end(session.node_count());
    let mut fetches = Vec::new();
    run_core(
        session,
        std::slice::from_ref(x),
        &mut fetches,
        &mut state,
        &manager,
        None,
        &CancellationToken::new(),
    )?;
    Ok(fetches)
}

#[test]
fn split_runs_match_full_run() -> Result<()> {
    for streams in common::test_stream_counts() {
        let (session, mut rng) = common::diamond_session(11, common::options_for(streams))?;
        let x = TensorValue::from(common::random_f32(&mut rng, &[5, 3])?);
        let expected = full_run(&session, &x)?;
        assert_eq!(expected.len(), 2);

        let none: [&str; 0] = [];
        let head = create_and_initialize_feeds_fetches_manager(&session, &["x"], &none, &[])?;
        let tail = create_and_initialize_feeds_fetches_manager(&session, &none, &["f", "g"], &[])?;
        let token = CancellationToken::new();
        for split in 1..session.node_count() {
            let mut state = PartialGraphExecutionState::new();
            let mut fetches = Vec::new();

            state.set_program_counter_start(0);
            state.set_program_counter_end(split);
            run_core(
                &session,
                std::slice::from_ref(&x),
                &mut fetches,
                &mut state,
                &head,
                None,
                &token,
            )?;
            assert!(fetches.is_empty());

            state.set_program_counter_start(split);
            state.set_program_counter_end(session.node_count());
            run_core(&session, &[], &mut fetches, &mut state, &tail, None, &token)?;

            for (actual, expected) in fetches.iter().zip(expected.iter()) {
                common::assert_tensor_close(actual, expected)?;
            }
            assert_eq!(state.context_constructions(), 1);
        }
    }
    Ok(())
}

#[test]
fn split_runs_resume_through_a_populated_cache() -> Result<()> {
    for streams in common::test_stream_counts() {
        let (session, mut rng) = common::diamond_session(23, common::options_for(streams))?;
        let x = TensorValue::from(common::random_f32(&mut rng, &[4, 3])?);
        let expected = full_run(&session, &x)?;
        let node_count = session.node_count();

        let none: [&str; 0] = [];
        let head = create_and_initialize_feeds_fetches_manager(&session, &["x"], &none, &[])?;
        let tail = create_and_initialize_feeds_fetches_manager(&session, &none, &["f", "g"], &[])?;
        let token = CancellationToken::new();
        for split in 0..=node_count {
            let cache = ValueCache::new();
            let mut state = PartialGraphExecutionState::new();
            let mut fetches = Vec::new();
            state.set_program_counter_start(0);
            state.set_program_counter_end(split);
            run_core(
                &session,
                std::slice::from_ref(&x),
                &mut fetches,
                &mut state,
                &head,
                Some(cache.clone()),
                &token,
            )?;
            if split == node_count {
                assert!(cache.get("f").is_some());
                assert!(cache.get("g").is_some());
            }

            // a state that never saw the head run recovers everything by name
            let mut resumed = PartialGraphExecutionState::new();
            resumed.set_program_counter_start(split);
            resumed.set_program_counter_end(node_count);
            let mut resumed_fetches = Vec::new();
            run_core(
                &session,
                &[],
                &mut resumed_fetches,
                &mut resumed,
                &tail,
                Some(cache.clone()),
                &token,
            )?;

            state.set_program_counter_start(split);
            state.set_program_counter_end(node_count);
            run_core(
                &session,
                &[],
                &mut fetches,
                &mut state,
                &tail,
                Some(cache.clone()),
                &token,
            )?;

            assert_eq!(fetches.len(), expected.len());
            assert_eq!(resumed_fetches.len(), expected.len());
            for ((same, fresh), expected) in fetches.iter().zip(&resumed_fetches).zip(&expected) {
                common::assert_tensor_close(same, expected)?;
                common::assert_tensor_close(fresh, expected)?;
            }
            assert_eq!(state.context_constructions(), 1);
        }
    }
    Ok(())
}

#[test]
fn boundary_keeps_only_values_needed_later() -> Result<()> {
    let (session, mut rng) = common::diamond_session(11, common::options_for(2))?;
    let x = TensorValue::from(common::random_f32(&mut rng, &[2, 3])?);
    let none: [&str; 0] = [];
    let manager = create_and_initialize_feeds_fetches_manager(&session, &["x"], &none, &[])?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(0);
    state.set_program_counter_end(4);
    let mut fetches = Vec::new();
    run_core(
        &session,
        std::slice::from_ref(&x),
        &mut fetches,
        &mut state,
        &manager,
        None,
        &CancellationToken::new(),
    )?;
    let context = state.context().expect("context built by the run");
    // `a` feeds `gate`, `d` feeds `gate`; `x`, `b` and `c` are dead after node 3
    assert_eq!(context.live_values(), vec!["a".to_string(), "d".to_string()]);
    let stats = context.stats();
    assert_eq!(stats.nodes_launched, 4);
    assert_eq!(stats.kernels_executed, 4);
    assert_eq!(stats.values_retained, 2);
    assert_eq!(stats.values_released, 3);
    Ok(())
}

#[test]
fn cross_stream_edges_wait() -> Result<()> {
    let options = common::options_for(2).with_trace();
    let (session, mut rng) = common::diamond_session(11, options)?;
    let x = TensorValue::from(common::random_f32(&mut rng, &[2, 3])?);
    let manager = create_and_initialize_feeds_fetches_manager(&session, &["x"], &["f", "g"], &[])?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(0);
    state.set_program_counter_end(session.node_count());
    let mut fetches = Vec::new();
    run_core(
        &session,
        std::slice::from_ref(&x),
        &mut fetches,
        &mut state,
        &manager,
        None,
        &CancellationToken::new(),
    )?;
    let stats = state.last_run_stats().expect("stats after a run").clone();
    assert!(stats.cross_stream_waits > 0);
    let trace = state.trace();
    let waits = trace
        .iter()
        .filter(|event| event.kind == TraceEventKind::Wait)
        .count();
    assert_eq!(waits, stats.cross_stream_waits);
    let executed = trace
        .iter()
        .filter(|event| event.kind == TraceEventKind::OpExecute)
        .count();
    assert_eq!(executed, session.node_count());

    let json = serde_json::to_string(&trace)?;
    assert!(json.contains("\"OpExecute\""));
    Ok(())
}

#[test]
fn fetch_slots_are_reused_in_place() -> Result<()> {
    let (session, mut rng) = common::diamond_session(3, common::options_for(1))?;
    let x = TensorValue::from(common::random_f32(&mut rng, &[2, 3])?);
    let expected = full_run(&session, &x)?;
    let manager = create_and_initialize_feeds_fetches_manager(&session, &["x"], &["f", "g"], &[])?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(0);
    state.set_program_counter_end(session.node_count());
    let mut fetches = expected
        .iter()
        .map(|value| TensorValue::zeros(value.dtype(), value.shape()))
        .collect::<Vec<_>>();
    let before = fetches[0].as_f32()?.data.as_ptr();
    run_core(
        &session,
        std::slice::from_ref(&x),
        &mut fetches,
        &mut state,
        &manager,
        None,
        &CancellationToken::new(),
    )?;
    assert_eq!(fetches[0].as_f32()?.data.as_ptr(), before);
    for (actual, expected) in fetches.iter().zip(expected.iter()) {
        common::assert_tensor_close(actual, expected)?;
    }
    Ok(())
}
