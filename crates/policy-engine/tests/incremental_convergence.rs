//! Random sequences of selector updates, filter changes and consumption
//! must converge to the same map state as a full rebuild.

use std::sync::Arc;

use policy_engine::{
    CachedSelector, EndpointPolicy, L4Filter, L4Policy, L7ParserType, L7Rules, MapState,
    PerSelectorPolicy, PortRuleDns, PortRuleHttp, SelectorCache, StaticPolicyOwner, SyncError,
};
use policy_types::{NumericIdentity, PortRange, Protocol, TrafficDirection};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const IDENTITY_POOL: u32 = 24;

struct Fixture {
    cache: Arc<SelectorCache>,
    policy: Arc<L4Policy>,
    selectors: Vec<CachedSelector>,
    wildcard: CachedSelector,
}

fn http_policy() -> PerSelectorPolicy {
    PerSelectorPolicy {
        l7_parser: L7ParserType::Http,
        l7_rules: L7Rules {
            http: vec![PortRuleHttp {
                path: "/".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn dns_policy() -> PerSelectorPolicy {
    PerSelectorPolicy {
        l7_parser: L7ParserType::Dns,
        l7_rules: L7Rules {
            dns: vec![PortRuleDns::pattern("*.example.com")],
            ..Default::default()
        },
        ..Default::default()
    }
}

fn owner(id: u64) -> Arc<StaticPolicyOwner> {
    let mut owner = StaticPolicyOwner::new(id);
    owner.set_redirect(true, Protocol::Tcp, 9002, "", 15001);
    owner.set_redirect(false, Protocol::Udp, 53, "", 15053);
    Arc::new(owner)
}

impl Fixture {
    fn new() -> Self {
        let cache = Arc::new(SelectorCache::new());
        let policy = L4Policy::new(Arc::clone(&cache));
        let selectors: Vec<_> = ["test-selector-a", "test-selector-b", "test-selector-c"]
            .into_iter()
            .map(CachedSelector::new)
            .collect();
        let wildcard = CachedSelector::wildcard("wildcard");

        let [a, b, c] = [&selectors[0], &selectors[1], &selectors[2]];
        policy.upsert_filter(
            L4Filter::new(PortRange::single(9000), Protocol::Tcp, true).with_policy(wildcard.clone(), None),
        );
        policy.upsert_filter(
            L4Filter::new(PortRange::single(9001), Protocol::Tcp, true)
                .with_policy(a.clone(), None)
                .with_policy(b.clone(), None)
                .with_policy(c.clone(), None),
        );
        policy.upsert_filter(
            L4Filter::new(PortRange::single(9002), Protocol::Tcp, true)
                .with_policy(wildcard.clone(), None)
                .with_policy(a.clone(), Some(http_policy()))
                .with_policy(b.clone(), None)
                .with_policy(c.clone(), None),
        );
        policy.upsert_filter(
            L4Filter::new(PortRange::single(53), Protocol::Udp, false).with_policy(a.clone(), Some(dns_policy())),
        );
        policy.upsert_filter(
            L4Filter::new(PortRange::new(1, 1023).unwrap(), Protocol::Tcp, false)
                .with_policy(b.clone(), None)
                .with_policy(c.clone(), None),
        );

        Self {
            cache,
            policy,
            selectors,
            wildcard,
        }
    }

    fn random_ids(&self, rng: &mut StdRng) -> Vec<NumericIdentity> {
        let n = rng.gen_range(0..4);
        (0..n)
            .map(|_| NumericIdentity::new(rng.gen_range(100..100 + IDENTITY_POOL)))
            .collect()
    }

    fn random_selector(&self, rng: &mut StdRng) -> CachedSelector {
        self.selectors[rng.gen_range(0..self.selectors.len())].clone()
    }

    /// Runs one selector update through the three-step protocol by hand.
    fn manual_update(&self, rng: &mut StdRng) {
        let selector = self.random_selector(rng);
        let added = self.random_ids(rng);
        let deleted = self.random_ids(rng);
        let update = self.cache.update(&selector, &added, &deleted);
        for filter in self.policy.filters() {
            self.policy
                .accumulate_map_changes(&filter, &selector, &update.added, &update.deleted);
            self.policy.sync_map_changes(&filter, update.version);
        }
    }

    fn stream_update(&self, rng: &mut StdRng) {
        let selector = self.random_selector(rng);
        let added = self.random_ids(rng);
        let deleted = self.random_ids(rng);
        let update = self.cache.update(&selector, &added, &deleted);
        self.policy.on_selections_changed(&update);
    }

    fn toggle_filter(&self, rng: &mut StdRng) {
        let key = L4Filter::new(PortRange::single(7000), Protocol::Tcp, true).key();
        if self.policy.filter(&key).is_some() && rng.gen_bool(0.5) {
            self.policy.remove_filter(&key);
            return;
        }
        let mut filter = L4Filter::new(PortRange::single(7000), Protocol::Tcp, true);
        for selector in &self.selectors {
            if rng.gen_bool(0.5) {
                filter = filter.with_policy(selector.clone(), None);
            }
        }
        if rng.gen_bool(0.3) {
            filter = filter.with_policy(self.wildcard.clone(), None);
        }
        self.policy.upsert_filter(filter);
    }

    fn full_rebuild(&self, endpoint: &EndpointPolicy) -> MapState {
        self.policy
            .compute_map_state(endpoint.owner(), &self.cache.snapshot())
    }
}

fn drain(endpoint: &EndpointPolicy) {
    endpoint.consume_map_changes().unwrap().release();
}

#[test]
fn test_incremental_matches_full_rebuild() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let fx = Fixture::new();
        let first = fx.policy.register(owner(1));
        let mut second: Option<Arc<EndpointPolicy>> = None;

        for step in 0..400 {
            match rng.gen_range(0..10) {
                0..=2 => fx.stream_update(&mut rng),
                3..=4 => fx.manual_update(&mut rng),
                5 => fx.toggle_filter(&mut rng),
                _ => {
                    drain(&first);
                    if let Some(second) = &second {
                        drain(second);
                    }
                }
            }
            if step == 150 {
                second = Some(fx.policy.register(owner(2)));
            }
        }

        drain(&first);
        assert_eq!(first.map_state(), fx.full_rebuild(&first), "seed {seed}");

        let second = second.unwrap();
        drain(&second);
        assert_eq!(second.map_state(), fx.full_rebuild(&second), "seed {seed}");
    }
}

#[test]
fn test_redirect_and_wildcard_entries() {
    let fx = Fixture::new();
    let endpoint = fx.policy.register(owner(1));
    let a = fx.selectors[0].clone();
    let update = fx.cache.update(&a, &[NumericIdentity::new(101)], &[]);
    fx.policy.on_selections_changed(&update);
    drain(&endpoint);

    let state = endpoint.map_state();
    let value = |port: u16, proto: Protocol, dir: TrafficDirection, id: u32| {
        let key = policy_engine::Key {
            identity: NumericIdentity::new(id),
            direction: dir,
            protocol: proto,
            ports: PortRange::single(port),
        };
        state.get(&key)
    };

    assert_eq!(value(9000, Protocol::Tcp, TrafficDirection::Ingress, 0).map(|v| v.proxy_port), Some(0));
    assert_eq!(value(9002, Protocol::Tcp, TrafficDirection::Ingress, 101).map(|v| v.proxy_port), Some(15001));
    assert_eq!(value(53, Protocol::Udp, TrafficDirection::Egress, 101).map(|v| v.proxy_port), Some(15053));
    assert_eq!(value(9001, Protocol::Tcp, TrafficDirection::Ingress, 102), None);
}

#[test]
fn test_removal_keeps_entries_granted_by_other_selectors() {
    let fx = Fixture::new();
    let endpoint = fx.policy.register(owner(1));
    let (b, c) = (fx.selectors[1].clone(), fx.selectors[2].clone());
    let id = NumericIdentity::new(200);

    fx.policy.on_selections_changed(&fx.cache.update(&b, &[id], &[]));
    fx.policy.on_selections_changed(&fx.cache.update(&c, &[id], &[]));
    drain(&endpoint);
    let key = policy_engine::Key {
        identity: id,
        direction: TrafficDirection::Ingress,
        protocol: Protocol::Tcp,
        ports: PortRange::single(9001),
    };
    assert!(endpoint.map_state().get(&key).is_some());

    fx.policy.on_selections_changed(&fx.cache.update(&b, &[], &[id]));
    drain(&endpoint);
    assert!(endpoint.map_state().get(&key).is_some());

    fx.policy.on_selections_changed(&fx.cache.update(&c, &[], &[id]));
    drain(&endpoint);
    assert!(endpoint.map_state().get(&key).is_none());
}

#[test]
fn test_consume_while_held_is_contention() {
    let fx = Fixture::new();
    let endpoint = fx.policy.register(owner(5));

    let handle = endpoint.consume_map_changes().unwrap();
    assert_eq!(
        endpoint.consume_map_changes().unwrap_err(),
        SyncError::ConsumptionContention(5)
    );
    handle.release();
    assert!(endpoint.consume_map_changes().is_ok());
}

#[test]
fn test_stale_delta_after_registration_is_discarded() {
    let fx = Fixture::new();
    let a = fx.selectors[0].clone();
    let update = fx.cache.update(&a, &[NumericIdentity::new(150)], &[]);

    // Registered after the update: the snapshot already contains it.
    let endpoint = fx.policy.register(owner(1));
    let before = endpoint.map_state();
    let summary = fx.policy.on_selections_changed(&update);
    assert_eq!(summary.published, 0);
    assert!(summary.discarded > 0);

    drain(&endpoint);
    assert_eq!(endpoint.map_state(), before);
}
