//! Membership lifecycle over the simulated mesh: join admission,
//! rejoin-by-slot, leave removal and config-sequence arbitration.

use synchromesh::sim::Mesh;
use synchromesh::{
    Max32, MergeCommit, OutcomeFlags, Phase, RejoinReason, RoundConfig, SoftRng, WantedJoinState,
};

#[test]
fn new_node_joins_and_gets_the_next_free_index() {
    let config = RoundConfig::default();
    let mut mesh = Mesh::<Max32>::established(&[1, 2], config, 0xA11CE).unwrap();
    let joiner = MergeCommit::new(3, config, SoftRng::new(33)).unwrap();
    mesh.push_node(joiner);

    let mut values = vec![Max32(1), Max32(2), Max32(0)];
    let reports = mesh.run_round(1, &mut values);

    assert!(reports[2].outcome.contains(OutcomeFlags::JOINED));
    assert!(mesh.node(2).has_joined());
    let joined = mesh.node(2).state();
    assert!(joined.has_node_index);
    assert_eq!(joined.node_index, 2);

    let initiator = mesh.node(0).state();
    assert_eq!(initiator.joined_nodes[2], 3);
    assert_eq!(initiator.node_count, 3);

    // the joiner adopted the network's config and bumped it with everyone
    for node in &mesh.nodes {
        assert_eq!(node.state().table.config(), 1);
    }
}

#[test]
fn member_leave_is_committed_and_its_index_freed() {
    let mut mesh = Mesh::<Max32>::established(&[1, 2, 3, 4], RoundConfig::default(), 0x1EAF).unwrap();
    mesh.node_mut(2).wanted_join_state = WantedJoinState::Leave;

    let mut values = vec![Max32(0); 4];
    let reports = mesh.run_round(1, &mut values);

    assert!(reports.iter().all(|r| r.phase == Phase::Commit));
    assert!(reports[2].outcome.contains(OutcomeFlags::LEFT));
    assert!(mesh.node(2).has_left());
    assert!(!mesh.node(2).state().has_node_index);

    let initiator = mesh.node(0).state();
    assert_eq!(initiator.joined_nodes[2], 0);
    assert_eq!(initiator.node_count, 3);
}

#[test]
fn known_node_rejoins_through_the_rejoin_slot() {
    let mut mesh = Mesh::<Max32>::established(&[1, 2], RoundConfig::default(), 0x2E01).unwrap();
    {
        // node 2 lost its index without leaving; the initiator still lists it
        let st = mesh.node_mut(1).state_mut();
        st.has_node_index = false;
        st.node_index = 0;
        st.rejoin_needed = true;
    }

    let mut values = vec![Max32(0), Max32(0)];
    let reports = mesh.run_round(1, &mut values);

    // the index is back immediately, through the rejoin channel
    assert!(mesh.node(1).has_joined());
    assert_eq!(mesh.node(1).state().node_index, 1);
    // but the round itself cannot complete: the restored member never got
    // to raise its participation flag mid-round
    assert_eq!(reports[0].phase, Phase::Merge);
    assert_eq!(reports[0].completion_slot, 0);

    // the next round commits as usual
    let mut values = vec![Max32(4), Max32(6)];
    let reports = mesh.run_round(2, &mut values);
    assert!(reports.iter().all(|r| r.phase == Phase::Commit));
    assert_eq!(values[0], Max32(6));
}

#[test]
fn stale_coordinator_rejoins_after_partition_heal() {
    let config = RoundConfig::default();
    let mut a = MergeCommit::<Max32, SoftRng>::new(1, config, SoftRng::new(11)).unwrap();
    a.bootstrap_as_initiator();
    a.state_mut().table.set_config(8);
    let mut b = MergeCommit::<Max32, SoftRng>::new(2, config, SoftRng::new(22)).unwrap();
    b.bootstrap_as_initiator();
    b.state_mut().table.set_config(7);

    let mut mesh = Mesh::new(vec![a, b], 0xBEEF);
    let mut values = vec![Max32(4), Max32(9)];
    let reports = mesh.run_round(1, &mut values);

    // the lower-config coordinator was forced out and only forwarded
    let stale = mesh.node(1).state();
    assert!(!stale.is_initiator);
    assert!(!stale.has_node_index);
    assert!(stale.rejoin_needed);
    assert_eq!(
        stale.last_rejoin_reason,
        Some(RejoinReason { local_config: 7, observed_config: 8 })
    );
    assert_eq!(reports[0].phase, Phase::Commit);
    // both ride the surviving sequence: adopted 8, bumped to 9
    assert_eq!(mesh.node(0).state().table.config(), 9);
    assert_eq!(mesh.node(1).state().table.config(), 9);

    // next round the forced-out node joins the surviving network; as a
    // joiner without an index it contributes no proposal of its own yet
    let mut values = vec![Max32(4), Max32(9)];
    let reports = mesh.run_round(2, &mut values);
    assert!(reports[1].outcome.contains(OutcomeFlags::JOINED));
    assert_eq!(mesh.node(1).state().node_index, 1);
    assert_eq!(mesh.node(0).state().joined_nodes[1], 2);
    assert_eq!(values[0], Max32(4));
}

#[test]
fn full_network_rejects_another_joiner() {
    let config = RoundConfig::default();
    let ids: Vec<u16> = (1..=synchromesh::MAX_NODE_COUNT as u16).collect();
    let mut mesh = Mesh::<Max32>::established(&ids, config, 0xF011).unwrap();
    let joiner = MergeCommit::new(99, config, SoftRng::new(99)).unwrap();
    mesh.push_node(joiner);

    let mut values = vec![Max32(0); ids.len() + 1];
    let reports = mesh.run_round(1, &mut values);

    let last = reports.len() - 1;
    assert!(!reports[last].outcome.contains(OutcomeFlags::JOINED));
    assert!(!mesh.node(last).state().has_node_index);
    // the round itself still commits for the members
    assert_eq!(reports[0].phase, Phase::Commit);
}
