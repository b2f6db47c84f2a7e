use std::sync::Arc;

use anyhow::Result;
use partialrun::{PartialGraphExecutionState, ProgramRegion, SessionOptions};

use crate::common;

#[test]
fn regions_split_at_yield() -> Result<()> {
    for streams in common::test_stream_counts() {
        let (session, _) = common::training_session(7, common::options_for(streams))?;
        let regions = session.program_regions();
        let bounds = regions
            .iter()
            .map(|region| (region.node_start, region.node_end))
            .collect::<Vec<_>>();
        assert_eq!(bounds, vec![(0, 4), (4, 13)]);
        for region in regions.iter() {
            assert_eq!(region.stream_pc_range.len(), streams);
            assert_eq!(region.node_count(), region.node_end - region.node_start);
        }
    }
    Ok(())
}

#[test]
fn region_list_is_computed_once() -> Result<()> {
    let (session, _) = common::training_session(7, SessionOptions::default())?;
    let first = session.program_regions();
    let second = session.program_regions();
    assert!(Arc::ptr_eq(&first, &second));

    let mut state = PartialGraphExecutionState::new();
    let from_state = state.program_regions(&session);
    assert!(Arc::ptr_eq(&first, &from_state));
    Ok(())
}

#[test]
fn extra_boundaries_add_regions() -> Result<()> {
    let options = SessionOptions::default().with_boundaries(vec![2, 9]);
    let (session, _) = common::training_session(7, options)?;
    let bounds = session
        .program_regions()
        .iter()
        .map(|region| (region.node_start, region.node_end))
        .collect::<Vec<_>>();
    assert_eq!(bounds, vec![(0, 2), (2, 4), (4, 9), (9, 13)]);
    Ok(())
}

#[test]
fn overlapping_regions_follow_bounds() -> Result<()> {
    let (session, _) = common::training_session(7, SessionOptions::default())?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(2);
    state.set_program_counter_end(6);
    let overlapping = state.overlapping_regions(&session);
    assert_eq!(overlapping.len(), 2);

    state.set_program_counter_start(5);
    state.set_program_counter_end(13);
    let overlapping = state.overlapping_regions(&session);
    assert_eq!(overlapping.len(), 1);
    assert_eq!(overlapping[0].node_start, 4);
    Ok(())
}

#[test]
fn clipped_region_covers_requested_range() -> Result<()> {
    let options = common::options_for(2);
    let (session, _) = common::training_session(7, options)?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(3);
    state.set_program_counter_end(8);
    let region: ProgramRegion = state.program_region(&session)?.clone();
    assert_eq!((region.node_start, region.node_end), (3, 8));
    // round-robin: odd nodes on stream 1, even nodes on stream 0
    assert_eq!(region.stream_pc_range, vec![(2, 4), (1, 4)]);
    assert_eq!(region.node_count(), 5);

    let again = state.program_region(&session)?.clone();
    assert_eq!(region, again);
    Ok(())
}

#[test]
fn empty_range_has_empty_region() -> Result<()> {
    let (session, _) = common::training_session(7, SessionOptions::default())?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(4);
    state.set_program_counter_end(4);
    let region = state.program_region(&session)?;
    assert!(region.is_empty());
    assert_eq!(region.node_count(), 0);
    Ok(())
}

#[test]
fn invalid_bounds_are_rejected() -> Result<()> {
    let (session, _) = common::training_session(7, SessionOptions::default())?;
    let mut state = PartialGraphExecutionState::new();
    state.set_program_counter_start(5);
    state.set_program_counter_end(3);
    let err = state.program_region(&session).unwrap_err();
    assert!(err.is_invalid_argument());

    state.set_program_counter_start(0);
    state.set_program_counter_end(14);
    let err = state.program_region(&session).unwrap_err();
    assert!(err.is_invalid_argument());
    Ok(())
}
