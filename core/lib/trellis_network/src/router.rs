use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use trellis_config::RoutingConfig;
use trellis_types::{PeerId, PeerInfo};

use crate::{
    blacklist::Blacklist,
    cache::CoordinatorCache,
    guard::SelfCoordinationGuard,
    key::Key,
    traits::{KeyNetwork, PeerDirectory, RoutingError, RoutingResult},
};

/// Chooses coordinators and assembles cohorts over a peer directory. The
/// cache, blacklist, and guard are plain fields here, constructed at peer
/// start and dropped at peer stop.
pub struct KeyRouter {
    directory: Arc<dyn PeerDirectory>,
    cache: CoordinatorCache,
    blacklist: Blacklist,
    guard: SelfCoordinationGuard,
    config: RoutingConfig,
}

impl KeyRouter {
    pub fn new(directory: Arc<dyn PeerDirectory>, config: RoutingConfig) -> Self {
        Self {
            cache: CoordinatorCache::new(
                config.coordinator_cache_capacity,
                config.coordinator_cache_ttl(),
            ),
            blacklist: Blacklist::new(
                config.blacklist_penalty,
                config.blacklist_threshold,
                config.blacklist_halflife(),
            ),
            guard: SelfCoordinationGuard::new(config.guard.clone()),
            directory,
            config,
        }
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn cache(&self) -> &CoordinatorCache {
        &self.cache
    }

    /// Candidates for `key`: directory neighbours plus self, nearest first,
    /// with blacklisted and excluded peers dropped.
    async fn candidates(
        &self,
        key: &Key,
        excluded: &[PeerId],
    ) -> RoutingResult<Vec<(PeerId, PeerInfo)>> {
        let self_id = self.directory.self_id();
        let mut peers = self.directory.peers_near(key).await?;
        peers.push((self_id, self.directory.self_info()));
        peers.retain(|(peer, _)| !excluded.contains(peer) && !self.blacklist.is_blocked(peer));
        peers.sort_by(|(a, _), (b, _)| {
            key.distance(&Key::for_peer(a))
                .cmp(&key.distance(&Key::for_peer(b)))
                .then_with(|| a.cmp(b))
        });
        peers.dedup_by(|(a, _), (b, _)| a == b);
        Ok(peers)
    }

    fn self_coordination_allowed(&self) -> bool {
        let decision = self.guard.evaluate(
            self.directory.network_size_estimate(),
            self.directory.connection_count(),
            self.directory.partition_suspected(),
        );
        if !decision.allow {
            tracing::debug!(reason = ?decision.reason, "self-coordination blocked");
        }
        decision.allow
    }
}

#[async_trait]
impl KeyNetwork for KeyRouter {
    async fn find_coordinator(&self, key: &Key, excluded: &[PeerId]) -> RoutingResult<PeerId> {
        if let Some(cached) = self.cache.get(key) {
            if !excluded.contains(&cached) && !self.blacklist.is_blocked(&cached) {
                return Ok(cached);
            }
        }

        let self_id = self.directory.self_id();
        for (peer, _) in self.candidates(key, excluded).await? {
            if peer == self_id {
                if self.self_coordination_allowed() {
                    return Ok(peer);
                }
                continue;
            }
            return Ok(peer);
        }
        Err(RoutingError::NoCoordinator {
            key: *key,
            details: format!(
                "all candidates excluded or blacklisted ({} exclusions)",
                excluded.len()
            ),
        })
    }

    async fn find_cluster(&self, key: &Key) -> RoutingResult<BTreeMap<PeerId, PeerInfo>> {
        let cohort: BTreeMap<PeerId, PeerInfo> = self
            .candidates(key, &[])
            .await?
            .into_iter()
            .take(self.config.cluster_size)
            .collect();
        if cohort.is_empty() {
            return Err(RoutingError::NoCoordinator {
                key: *key,
                details: "empty peer view".to_string(),
            });
        }
        Ok(cohort)
    }

    fn record_coordinator(&self, key: &Key, peer: &PeerId, ttl: Option<Duration>) {
        self.cache.record(key, peer, ttl);
    }
}

impl std::fmt::Debug for KeyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRouter")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use trellis_config::GuardConfig;
    use trellis_types::BlockId;

    use super::*;

    #[derive(Debug)]
    struct StaticDirectory {
        self_id: PeerId,
        peers: Vec<(PeerId, PeerInfo)>,
        connections: usize,
        partition: bool,
    }

    #[async_trait]
    impl PeerDirectory for StaticDirectory {
        fn self_id(&self) -> PeerId {
            self.self_id.clone()
        }

        fn self_info(&self) -> PeerInfo {
            PeerInfo::default()
        }

        async fn peers_near(&self, _key: &Key) -> RoutingResult<Vec<(PeerId, PeerInfo)>> {
            Ok(self.peers.clone())
        }

        fn connection_count(&self) -> usize {
            self.connections
        }

        fn network_size_estimate(&self) -> usize {
            self.peers.len() + 1
        }

        fn partition_suspected(&self) -> bool {
            self.partition
        }
    }

    fn peers(ids: &[&str]) -> Vec<(PeerId, PeerInfo)> {
        ids.iter()
            .map(|id| (PeerId::new(*id), PeerInfo::default()))
            .collect()
    }

    fn router(directory: StaticDirectory) -> KeyRouter {
        KeyRouter::new(Arc::new(directory), RoutingConfig::for_tests())
    }

    #[tokio::test]
    async fn coordinator_is_nearest_non_excluded_peer() {
        let router = router(StaticDirectory {
            self_id: PeerId::new("self"),
            peers: peers(&["p1", "p2", "p3"]),
            connections: 3,
            partition: false,
        });
        let key = Key::for_block(&BlockId::new("b1"));

        let first = router.find_coordinator(&key, &[]).await.unwrap();
        let second = router.find_coordinator(&key, &[first.clone()]).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn excluding_everyone_fails_when_guard_blocks_self() {
        let router = KeyRouter::new(
            Arc::new(StaticDirectory {
                self_id: PeerId::new("self"),
                peers: peers(&["p1"]),
                connections: 0,
                partition: true,
            }),
            RoutingConfig::for_tests(),
        );
        let key = Key::for_block(&BlockId::new("b1"));
        let err = router
            .find_coordinator(&key, &[PeerId::new("p1")])
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NoCoordinator { .. }));
    }

    #[tokio::test]
    async fn disabled_guard_never_picks_self() {
        let mut config = RoutingConfig::for_tests();
        config.guard = GuardConfig {
            enabled: false,
            ..GuardConfig::default()
        };
        let router = KeyRouter::new(
            Arc::new(StaticDirectory {
                self_id: PeerId::new("self"),
                peers: vec![],
                connections: 0,
                partition: false,
            }),
            config,
        );
        let key = Key::for_block(&BlockId::new("b1"));
        assert!(router.find_coordinator(&key, &[]).await.is_err());
    }

    #[tokio::test]
    async fn cache_short_circuits_lookup_until_excluded() {
        let router = router(StaticDirectory {
            self_id: PeerId::new("self"),
            peers: peers(&["p1", "p2"]),
            connections: 2,
            partition: false,
        });
        let key = Key::for_block(&BlockId::new("b1"));

        router.record_coordinator(&key, &PeerId::new("p2"), None);
        assert_eq!(
            router.find_coordinator(&key, &[]).await.unwrap(),
            PeerId::new("p2")
        );
        // Excluding the cached peer falls through to distance order.
        let other = router
            .find_coordinator(&key, &[PeerId::new("p2")])
            .await
            .unwrap();
        assert_ne!(other, PeerId::new("p2"));
    }

    #[tokio::test]
    async fn cluster_membership_is_stable() {
        let router = router(StaticDirectory {
            self_id: PeerId::new("self"),
            peers: peers(&["p1", "p2", "p3", "p4"]),
            connections: 4,
            partition: false,
        });
        let key = Key::for_block(&BlockId::new("b1"));
        let one = router.find_cluster(&key).await.unwrap();
        let two = router.find_cluster(&key).await.unwrap();
        assert_eq!(one.len(), 3);
        assert_eq!(
            one.keys().collect::<Vec<_>>(),
            two.keys().collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn blacklisted_peers_are_skipped() {
        let router = router(StaticDirectory {
            self_id: PeerId::new("self"),
            peers: peers(&["p1", "p2"]),
            connections: 2,
            partition: false,
        });
        let key = Key::for_block(&BlockId::new("b1"));
        let first = router.find_coordinator(&key, &[]).await.unwrap();
        for _ in 0..4 {
            router.blacklist().report(&first);
        }
        let next = router.find_coordinator(&key, &[]).await.unwrap();
        assert_ne!(first, next);
    }
}
