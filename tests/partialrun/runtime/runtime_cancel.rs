use anyhow::Result;
use partialrun::{
    create_and_initialize_feeds_fetches_manager, run_core, CancellationToken, DType, Error,
    Graph, KernelRegistry, OpAttrs, OpKind, PartialGraphExecutionState, Session, TensorValue,
    ValueCache,
};

use crate::common;

/// Four chained relus; the first one is a custom op that trips `token`.
fn tripwire_session(token: &CancellationToken, streams: usize) -> Result<Session> {
    let mut kernels = KernelRegistry::with_builtins();
    let trip = token.clone();
    kernels.register(OpKind::Custom("tripwire".to_string()), move |_, inputs| {
        trip.cancel();
        Ok(vec![inputs[0].try_clone()?])
    });
    let mut g = Graph::new();
    g.add_input("x", Some(DType::F32), None)?;
    g.add_node("trip", OpKind::Custom("tripwire".to_string()), OpAttrs::none(), &["x"], &["h0"])?;
    g.add_node("relu_1", OpKind::Relu, OpAttrs::none(), &["h0"], &["h1"])?;
    g.add_node("relu_2", OpKind::Relu, OpAttrs::none(), &["h1"], &["h2"])?;
    g.add_node("relu_3", OpKind::Relu, OpAttrs::none(), &["h2"], &["h3"])?;
    g.mark_output("h3")?;
    Session::with_kernels(g, common::options_for(streams), kernels)
}

#[test]
fn cancel_before_launch_runs_nothing() -> Result<()> {
    let (session, mut rng) = common::training_session(9, common::options_for(2))?;
    let manager =
        create_and_initialize_feeds_fetches_manager(&session, &["x"], &["activation_4"], &[])?;
    let x = TensorValue::from(common::random_f32(&mut rng, &[2, 4])?);
    let cache = ValueCache::new();
    let token = CancellationToken::new();
    token.cancel();

    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(0);
    state.set_program_counter_end(4);
    let mut fetches = Vec::new();
    let err = run_core(
        &session,
        std::slice::from_ref(&x),
        &mut fetches,
        &mut state,
        &manager,
        Some(cache.clone()),
        &token,
    )
    .unwrap_err();
    assert!(err.is_cancelled());
    let stats = state.last_run_stats().expect("context built before cancellation");
    assert_eq!(stats.nodes_launched, 0);
    assert_eq!(stats.kernels_executed, 0);
    assert!(fetches.is_empty());
    assert!(cache.is_empty());

    // the same state runs normally once the token is reset
    token.reset();
    run_core(
        &session,
        std::slice::from_ref(&x),
        &mut fetches,
        &mut state,
        &manager,
        Some(cache.clone()),
        &token,
    )?;
    assert_eq!(fetches.len(), 1);
    assert!(!cache.is_empty());
    assert_eq!(state.context_constructions(), 1);
    Ok(())
}

#[test]
fn cancel_after_first_kernel_stops_the_run() -> Result<()> {
    for streams in common::test_stream_counts() {
        let token = CancellationToken::new();
        let session = tripwire_session(&token, streams)?;
        let manager = create_and_initialize_feeds_fetches_manager(&session, &["x"], &["h3"], &[])?;
        let x = common::f32_value(vec![1.0, -1.0, 2.0], &[3])?;
        let cache = ValueCache::new();
        let mut state = PartialGraphExecutionState::new();
        state.set_program_counter_start(0);
        state.set_program_counter_end(session.node_count());
        let mut fetches = vec![TensorValue::zeros(DType::F32, &[3])];

        let err = run_core(
            &session,
            std::slice::from_ref(&x),
            &mut fetches,
            &mut state,
            &manager,
            Some(cache.clone()),
            &token,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "unexpected error: {}", err);
        let stats = state.last_run_stats().expect("stats after a run");
        assert_eq!(stats.kernels_executed, 1);
        // fetch slots and cache are untouched on cancellation
        assert_eq!(fetches, vec![TensorValue::zeros(DType::F32, &[3])]);
        assert!(cache.is_empty());
    }
    Ok(())
}
