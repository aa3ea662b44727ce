use proptest::prelude::*;
use unread_sim::{SimulationConfig, Simulator};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn any_seed_keeps_compaction_transparent(
        seed in any::<u64>(),
        readers in 1_usize..6,
        items in 1_usize..30,
        gap in 1_i64..3_000,
    ) {
        let config = SimulationConfig {
            seed,
            readers,
            items,
            steps: 120,
            baseline_gap_us: gap,
            ..SimulationConfig::default()
        };
        let result = Simulator::new(config).expect("simulator").run().expect("run");
        prop_assert!(result.passed(), "seed {seed}: {:?}", result.violations);
    }

    #[test]
    fn compaction_heavy_mix_still_passes(seed in any::<u64>()) {
        let config = SimulationConfig {
            seed,
            steps: 100,
            compact_percent: 40,
            touch_percent: 20,
            mark_all_percent: 2,
            reset_percent: 2,
            ..SimulationConfig::default()
        };
        let result = Simulator::new(config).expect("simulator").run().expect("run");
        prop_assert!(result.passed(), "seed {seed}: {:?}", result.violations);
        prop_assert!(result.compactions > 0 || result.steps < 10);
    }
}
