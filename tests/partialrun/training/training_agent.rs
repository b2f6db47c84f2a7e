use std::sync::Arc;

use anyhow::Result;
use partialrun::{
    CancellationToken, DType, Device, Graph, OpAttrs, OpKind, PartialGraphExecutionState,
    Session, SessionOptions, TensorValue, TrainingAgent,
};

use crate::common;

fn agent_for(session: &Arc<Session>) -> partialrun::Result<TrainingAgent> {
    TrainingAgent::new(session.clone(), &["x"], &[], &["grad_w1", "grad_w2"], &[])
}

#[test]
fn agent_splits_at_first_yield() -> Result<()> {
    let (session, _) = common::training_session(1, SessionOptions::default())?;
    let agent = agent_for(&session)?;
    assert_eq!(agent.fw_program_counter_end(), 4);
    assert_eq!(agent.bw_program_counter_end(), 13);
    assert_eq!(agent.fw_manager().feed_names(), &["x".to_string()]);
    assert_eq!(agent.fw_manager().fetch_names(), &["activation_4".to_string()]);
    assert_eq!(agent.bw_manager().feed_names(), &["d_activation_4".to_string()]);
    assert_eq!(
        agent.bw_manager().fetch_names(),
        &["grad_w1".to_string(), "grad_w2".to_string()]
    );
    Ok(())
}

#[test]
fn graph_without_yield_is_rejected() -> Result<()> {
    let mut g = Graph::new();
    g.add_input("x", Some(DType::F32), None)?;
    g.add_node("relu", OpKind::Relu, OpAttrs::none(), &["x"], &["y"])?;
    let session = Arc::new(Session::new(g, SessionOptions::default())?);
    let err = TrainingAgent::new(session, &["x"], &[], &["y"], &[]).unwrap_err();
    assert!(err.is_invalid_argument());
    Ok(())
}

#[test]
fn forward_backward_matches_reference() -> Result<()> {
    for streams in common::test_stream_counts() {
        let (session, mut rng) = common::training_session(21, common::options_for(streams))?;
        let (w1, w2) = common::session_weights(&session)?;
        let agent = agent_for(&session)?;
        let token = CancellationToken::new();
        let mut state = PartialGraphExecutionState::new();

        let x = common::random_f32(&mut rng, &[3, 4])?;
        let dy = common::random_f32(&mut rng, &[3, 2])?;
        let (activation_4, grad_w1, grad_w2) = common::reference_step(&x, &w1, &w2, &dy);

        let mut fw_fetches = Vec::new();
        agent.run_forward(
            &[TensorValue::from(x.clone())],
            &mut fw_fetches,
            &mut state,
            None,
            &token,
        )?;
        common::assert_close(&fw_fetches[0], &activation_4, &[3, 2])?;

        let mut bw_fetches = Vec::new();
        agent.run_backward(&[TensorValue::from(dy)], &mut bw_fetches, &mut state, &token)?;
        common::assert_close(&bw_fetches[0], &grad_w1, &[4, 3])?;
        common::assert_close(&bw_fetches[1], &grad_w2, &[3, 2])?;
    }
    Ok(())
}

#[test]
fn context_is_reused_across_steps() -> Result<()> {
    let (session, mut rng) = common::training_session(33, common::options_for(2))?;
    let (w1, w2) = common::session_weights(&session)?;
    let agent = agent_for(&session)?;
    let token = CancellationToken::new();
    let mut state = PartialGraphExecutionState::new();
    let mut fw_fetches = Vec::new();
    let mut bw_fetches = Vec::new();
    let mut context_id = None;

    for step in 0..5 {
        let x = common::random_f32(&mut rng, &[2, 4])?;
        let dy = common::random_f32(&mut rng, &[2, 2])?;
        let (_, grad_w1, grad_w2) = common::reference_step(&x, &w1, &w2, &dy);

        agent.run_forward(&[TensorValue::from(x)], &mut fw_fetches, &mut state, None, &token)?;
        if step == 0 {
            context_id = state.context_id();
        }
        assert_eq!(state.context_id(), context_id);

        agent.run_backward(&[TensorValue::from(dy)], &mut bw_fetches, &mut state, &token)?;
        assert_eq!(state.context_id(), context_id);
        common::assert_close(&bw_fetches[0], &grad_w1, &[4, 3])?;
        common::assert_close(&bw_fetches[1], &grad_w2, &[3, 2])?;

        // only graph outputs survive the end of a step
        let context = state.context().expect("context after a step");
        assert_eq!(
            context.live_values(),
            vec!["grad_w1".to_string(), "grad_w2".to_string()]
        );
    }
    assert_eq!(state.context_constructions(), 1);
    assert_eq!(state.context().map(|context| context.runs()), Some(10));
    Ok(())
}

#[test]
fn backward_keeps_forward_residents() -> Result<()> {
    let (session, mut rng) = common::training_session(8, SessionOptions::default())?;
    let agent = agent_for(&session)?;
    let token = CancellationToken::new();
    let mut state = PartialGraphExecutionState::new();
    let x = common::random_f32(&mut rng, &[2, 4])?;
    let mut fetches = Vec::new();
    agent.run_forward(&[TensorValue::from(x)], &mut fetches, &mut state, None, &token)?;

    let context = state.context().expect("context after forward");
    assert_eq!(
        context.live_values(),
        vec![
            "activation_1".to_string(),
            "activation_2".to_string(),
            "activation_3".to_string(),
            "activation_4".to_string(),
            "x".to_string(),
        ]
    );
    assert_eq!(context.stats().cache_writes, 0);
    Ok(())
}

#[test]
fn emulated_outputs_are_traced_as_transfers() -> Result<()> {
    let options = SessionOptions::default().with_trace();
    let (session, mut rng) = common::training_session(4, options)?;
    let agent = TrainingAgent::new(
        session.clone(),
        &["x"],
        &[Device::Emulated(1)],
        &["grad_w1", "grad_w2"],
        &[],
    )?;
    let token = CancellationToken::new();
    let mut state = PartialGraphExecutionState::new();
    let x = common::random_f32(&mut rng, &[2, 4])?;
    let mut fetches = Vec::new();
    agent.run_forward(&[TensorValue::from(x)], &mut fetches, &mut state, None, &token)?;
    let transfers = state
        .trace()
        .iter()
        .filter(|event| event.kind == partialrun::TraceEventKind::Transfer)
        .count();
    assert_eq!(transfers, 1);
    assert_eq!(fetches[0].shape(), &[2, 2]);
    Ok(())
}
