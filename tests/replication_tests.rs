//! Log replication, commitment and leader-side request tests.


use std::time::Duration;

use ballot::{BallotError, Command, MemberId};
use test_harness::{assert_eventually, member_uri, TestCluster};

#[tokio::test]
async fn test_committed_entry_reaches_every_state_machine() {
    let cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let leader = cluster.get_node(leader_id).unwrap();

    let index = leader
        .cluster
        .consensus()
        .propose(b"set x=1".to_vec())
        .await
        .expect("Leader should accept proposals");

    assert_eventually(
        || async { leader.commit_index() >= index },
        Duration::from_secs(2),
        "Leader should commit once a majority stores the entry",
    )
    .await;

    // Followers learn the commit index from the next append
    assert!(
        cluster
            .wait_for_applied_on_all(index, Duration::from_secs(2))
            .await,
        "Every member should apply the entry"
    );

    for node in cluster.nodes.values() {
        let applied = node.applied();
        // Leader no-op first, then the command
        assert_eq!(applied[0].command, Command::Noop);
        let entry = applied.iter().find(|e| e.index == index).unwrap();
        assert_eq!(entry.command, Command::Apply(b"set x=1".to_vec()));
        assert!(node.commit_index() >= index);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_entries_apply_in_order_exactly_once() {
    let cluster = TestCluster::new(3).await;
    let observer = cluster.observe();

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");

    let mut last = 0;
    for i in 0..20 {
        last = cluster
            .propose(format!("cmd-{}", i).as_bytes())
            .await
            .expect("propose");
    }
    assert!(cluster.wait_for_applied_on_all(last, Duration::from_secs(3)).await);

    let expected: Vec<Vec<u8>> = (0..20).map(|i| format!("cmd-{}", i).into_bytes()).collect();
    for node in cluster.nodes.values() {
        assert_eq!(node.applied_commands(), expected, "member {}", node.id);

        let indices: Vec<u64> = node.applied().iter().map(|e| e.index).collect();
        let contiguous: Vec<u64> = (1..=indices.len() as u64).collect();
        assert_eq!(indices, contiguous, "member {} applied out of order", node.id);
    }

    let observations = observer.stop();
    assert!(observations.commit_regressions.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_follower_rejects_proposal_with_leader_hint() {
    let cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let follower = cluster
        .nodes
        .values()
        .find(|node| node.id != leader_id)
        .unwrap();

    assert_eventually(
        || async { follower.cluster.consensus().leader().is_some() },
        Duration::from_secs(2),
        "Follower should learn the leader",
    )
    .await;

    match follower.cluster.consensus().propose(b"nope".to_vec()).await {
        Err(BallotError::NotLeader(Some(uri))) => assert_eq!(uri, member_uri(leader_id)),
        other => panic!("expected NotLeader with a hint, got {:?}", other),
    }
    assert!(matches!(
        follower.cluster.consensus().confirm_leadership().await,
        Err(BallotError::NotLeader(_))
    ));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_confirm_leadership_records_contact_on_followers() {
    let cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let leader = cluster.get_node(leader_id).unwrap();

    // Followers must know the leader before they recognize its heartbeats
    assert_eventually(
        || async {
            cluster
                .nodes
                .values()
                .all(|node| node.cluster.consensus().leader() == Some(member_uri(leader_id)))
        },
        Duration::from_secs(2),
        "All members should know the leader",
    )
    .await;

    assert!(leader.cluster.consensus().confirm_leadership().await.unwrap());

    let leader_member = MemberId::new(leader_id).unwrap();
    for node in cluster.nodes.values().filter(|node| node.id != leader_id) {
        let since = node
            .cluster
            .consensus()
            .last_contact(leader_member)
            .await
            .unwrap()
            .expect("Follower should have heard the leader's heartbeat");
        assert!(since < Duration::from_secs(2));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_new_member_joins_and_catches_up() {
    let mut cluster = TestCluster::new(3).await;

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let first = cluster.propose(b"before-join").await.expect("propose");
    assert!(cluster.wait_for_applied_on_all(first, Duration::from_secs(2)).await);

    cluster.add_node(4).await;
    for node in cluster.nodes.values() {
        assert_eventually(
            || async { node.cluster.members().len() == 4 },
            Duration::from_secs(2),
            "Every member should see the new member",
        )
        .await;
    }

    let second = cluster.propose(b"after-join").await.expect("propose");
    assert!(
        cluster
            .wait_for_applied_on_all(second, Duration::from_secs(5))
            .await,
        "New member should catch up through replication"
    );
    assert_eq!(
        cluster.get_node(4).unwrap().applied_commands(),
        vec![b"before-join".to_vec(), b"after-join".to_vec()]
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_departed_member_no_longer_counts_toward_quorum() {
    let mut cluster = TestCluster::new(3).await;

    let leader_id = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let departing: Vec<u32> = cluster
        .node_ids()
        .into_iter()
        .filter(|&id| id != leader_id)
        .collect();

    // Remove both followers from the leader's view, then stop them
    for &id in &departing {
        assert!(cluster
            .get_node(leader_id)
            .unwrap()
            .coordinator
            .leave(&member_uri(id)));
    }
    let leader = cluster.get_node(leader_id).unwrap();
    assert_eventually(
        || async { leader.cluster.members().len() == 1 },
        Duration::from_secs(2),
        "Leader should drop departed members",
    )
    .await;
    for &id in &departing {
        cluster.shutdown_node(id).await;
    }

    // Alone in its membership, the member leads and commits by itself
    cluster
        .wait_for_leader_in_group(&[leader_id], Duration::from_secs(2))
        .await
        .expect("Remaining member should lead");
    let index = cluster.propose(b"solo").await.expect("propose");
    assert!(
        cluster
            .wait_for_applied_in_group(&[leader_id], index, Duration::from_secs(2))
            .await
    );

    cluster.shutdown().await;
}
