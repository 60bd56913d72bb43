//! Network partition tests.
//!
//! These tests verify that only a majority side makes progress, that at most
//! one leader exists per term, and that logs converge after healing.


use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use ballot::BallotError;
use test_harness::{assert_eventually, TestCluster};

/// Split the members so that `leader` lands in the majority
fn split_around(leader: u32, ids: &[u32], majority_size: usize) -> (Vec<u32>, Vec<u32>) {
    let mut majority = vec![leader];
    let mut minority = Vec::new();
    for &id in ids.iter().filter(|&&id| id != leader) {
        if majority.len() < majority_size {
            majority.push(id);
        } else {
            minority.push(id);
        }
    }
    (majority, minority)
}

#[tokio::test]
async fn test_majority_partition_elects_leader() {
    let cluster = TestCluster::new(5).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    // Put the leader on the minority side
    let (minority, majority) = split_around(leader, &cluster.node_ids(), 2);
    cluster.create_partition(&majority, &minority);

    let new_leader = cluster
        .wait_for_leader_in_group(&majority, Duration::from_secs(5))
        .await
        .expect("Majority partition should elect a leader");
    assert!(majority.contains(&new_leader));

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_minority_partition_cannot_commit() {
    let cluster = TestCluster::new(5).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let (majority, minority) = split_around(leader, &cluster.node_ids(), 3);
    cluster.create_partition(&majority, &minority);

    // Minority members keep campaigning but never win
    tokio::time::sleep(Duration::from_millis(800)).await;
    for id in &minority {
        assert!(
            !cluster.get_node(*id).unwrap().is_leader(),
            "Member {} in the minority must not lead",
            id
        );
    }

    // The majority still commits
    let index = cluster
        .get_node(leader)
        .unwrap()
        .cluster
        .consensus()
        .propose(b"majority".to_vec())
        .await
        .expect("Leader should accept proposals");
    assert!(
        cluster
            .wait_for_applied_in_group(&majority, index, Duration::from_secs(3))
            .await
    );

    cluster.heal_all();
    assert!(
        cluster
            .wait_for_applied_on_all(index, Duration::from_secs(5))
            .await,
        "Minority should catch up after healing"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_leader_cannot_commit() {
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let node = cluster.get_node(leader).unwrap();

    cluster.isolate_node(leader);
    let index = node
        .cluster
        .consensus()
        .propose(b"lost".to_vec())
        .await
        .expect("Stale leader still appends locally");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(node.commit_index() < index);
    assert!(node.status().last_applied < index);

    // A leader cut off from everyone cannot confirm its leadership
    match node.cluster.consensus().confirm_leadership().await {
        Ok(confirmed) => assert!(!confirmed),
        Err(e) => assert!(matches!(e, BallotError::NotLeader(_))),
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_logs_converge_after_partition_heals() {
    let cluster = TestCluster::new(5).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let (majority, minority) = split_around(leader, &cluster.node_ids(), 3);

    let first = cluster.propose(b"before").await.expect("propose before partition");
    assert!(cluster.wait_for_applied_on_all(first, Duration::from_secs(3)).await);

    cluster.create_partition(&majority, &minority);
    let mut last = first;
    for i in 0..5 {
        last = cluster
            .get_node(leader)
            .unwrap()
            .cluster
            .consensus()
            .propose(format!("during-{}", i).into_bytes())
            .await
            .expect("Majority leader should accept proposals");
    }
    assert!(
        cluster
            .wait_for_applied_in_group(&majority, last, Duration::from_secs(3))
            .await
    );

    cluster.heal_partition(&majority, &minority);
    assert!(cluster.wait_for_applied_on_all(last, Duration::from_secs(5)).await);

    let expected = cluster.get_node(leader).unwrap().applied_commands();
    assert_eq!(expected.len(), 6);
    for node in cluster.nodes.values() {
        assert_eq!(node.applied_commands(), expected, "member {}", node.id);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_at_most_one_leader_per_term_under_random_partitions() {
    let cluster = TestCluster::new(5).await;
    let observer = cluster.observe();
    let mut rng = StdRng::seed_from_u64(7);
    let ids = cluster.node_ids();

    cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");

    for _ in 0..12 {
        let mut shuffled = ids.clone();
        shuffled.shuffle(&mut rng);
        let split = rng.gen_range(1..ids.len());
        let (a, b) = shuffled.split_at(split);
        cluster.create_partition(a, b);

        // Proposals race the partition; some are expected to fail
        let _ = cluster.propose(b"chaos").await;
        tokio::time::sleep(Duration::from_millis(rng.gen_range(100..400))).await;

        cluster.heal_all();
        tokio::time::sleep(Duration::from_millis(rng.gen_range(50..200))).await;
    }

    assert!(
        cluster.wait_for_leader(Duration::from_secs(5)).await.is_some(),
        "Cluster should recover a leader after healing"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    let observations = observer.stop();
    assert!(
        observations.contested_terms().is_empty(),
        "Terms with more than one leader: {:?}",
        observations.leaders
    );
    assert!(
        observations.commit_regressions.is_empty(),
        "Commit index went backwards on {:?}",
        observations.commit_regressions
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_isolated_follower_rejoins_and_catches_up() {
    let cluster = TestCluster::new(3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Initial leader should be elected");
    let follower = cluster
        .node_ids()
        .into_iter()
        .find(|&id| id != leader)
        .unwrap();

    cluster.isolate_node(follower);
    let index = cluster.propose(b"while-away").await.expect("propose");
    assert!(
        cluster
            .wait_for_applied_in_group(&[leader], index, Duration::from_secs(3))
            .await
    );

    cluster.heal_node(follower);
    assert_eventually(
        || async {
            cluster
                .get_node(follower)
                .unwrap()
                .applied_commands()
                .contains(&b"while-away".to_vec())
        },
        Duration::from_secs(5),
        "Rejoined follower should apply the missed entry",
    )
    .await;

    cluster.shutdown().await;
}
