use ces_manager::{CepKey, CesManager, CesManagerConfig, CoreEndpoint};
use policy_types::NumericIdentity;
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

const NAMESPACES: &[&str] = &["default", "kube-system", "prod"];

#[test]
fn test_random_churn_keeps_slices_packed() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let max = rng.gen_range(1..5usize);
        let mut manager = CesManager::new(CesManagerConfig::new().with_max_ceps_per_ces(max)).unwrap();
        let mut live: BTreeSet<(String, String)> = BTreeSet::new();

        for step in 0..500 {
            let ns = NAMESPACES[rng.gen_range(0..NAMESPACES.len())];
            let name = format!("ep-{}", rng.gen_range(0..40));
            let cep = CoreEndpoint::new(name.as_str(), NumericIdentity::new(step));
            if live.contains(&(ns.to_string(), name.clone())) && rng.gen_bool(0.5) {
                manager.remove_cep_mapping(&cep, ns).unwrap();
                live.remove(&(ns.to_string(), name));
            } else {
                let before = manager.ces_of(&CepKey::new(ns, name.as_str()));
                let id = manager.update_cep_mapping(&cep, ns);
                if let Some(before) = before {
                    assert_eq!(before, id, "seed {seed}: endpoint moved");
                }
                live.insert((ns.to_string(), name));
            }

            assert_eq!(manager.cep_count(), live.len());
            for slice in manager.slices() {
                assert!(!slice.is_empty(), "seed {seed}: empty slice kept");
                assert!(slice.len() <= max, "seed {seed}: slice over capacity");
            }
        }

        let total: usize = manager.slices().map(|s| s.len()).sum();
        assert_eq!(total, live.len());
    }
}
