//! Property tests for the KV coordination layer (spec.md §8's universal
//! properties), run against the deterministic in-memory simulator.

use std::sync::Arc;

use governor_ha::kv::{KvClient, MemoryBackend};
use proptest::prelude::*;

fn cluster(n: usize) -> Vec<KvClient> {
    let backend = Arc::new(MemoryBackend::new());
    (0..n)
        .map(|_| KvClient::new(backend.clone(), "cluster", 30))
        .collect()
}

proptest! {
    /// However many nodes attempt `attempt_to_acquire_leader` in any
    /// order, at most one ever succeeds in a freshly-initialised lock.
    #[test]
    fn at_most_one_leader_acquisition_succeeds(order in proptest::collection::vec(0usize..6, 1..6)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let nodes = cluster(6);
            let mut wins = 0;
            for i in order {
                let name = format!("node-{i}");
                if nodes[i].attempt_to_acquire_leader(&name).await.unwrap() {
                    wins += 1;
                }
            }
            assert!(wins <= 1);
        });
    }

    /// Membership reads always reflect exactly the set of names most
    /// recently touched, regardless of the order members were added in.
    #[test]
    fn members_reflect_last_touch_regardless_of_order(
        names in proptest::collection::hash_set("[a-z]{1,4}", 1..5)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let nodes = cluster(1);
            for name in &names {
                nodes[0].touch_member(name, &format!("postgres://{name}")).await.unwrap();
            }

            let mut observed: Vec<String> = nodes[0]
                .members()
                .await
                .unwrap()
                .into_iter()
                .map(|m| m.hostname)
                .collect();
            observed.sort();

            let mut expected: Vec<String> = names.into_iter().collect();
            expected.sort();

            assert_eq!(observed, expected);
        });
    }

    /// `abdicate` only ever releases the lock when called with the name
    /// that currently holds it; any other caller's abdicate is a no-op.
    #[test]
    fn abdicate_never_releases_a_lock_it_does_not_hold(
        holder in "[a-z]{1,4}", impostor in "[a-z]{1,4}"
    ) {
        prop_assume!(holder != impostor);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let nodes = cluster(1);
            nodes[0].take_leader(&holder).await.unwrap();

            nodes[0].abdicate(&impostor).await.unwrap();
            assert!(nodes[0].am_i_leader(&holder).await.unwrap());

            nodes[0].abdicate(&holder).await.unwrap();
            assert!(nodes[0].leader_unlocked().await.unwrap());
        });
    }
}
