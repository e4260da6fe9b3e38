use dla_tiling::config::{ArchConfig, LevelConfig, LevelKind};
use dla_tiling::policy::capacity::operand_volume;
use dla_tiling::policy::{Cursor, ElementState, FlatScores, Rollout, StepScores, TilingActor};
use dla_tiling::tiling::{Dim, DimBudgets, ProblemInstance};
use dla_tiling::Operand;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Two sampled levels (64 and 256 elements) under an unbounded terminal level.
fn small_hierarchy() -> ArchConfig {
    ArchConfig {
        name: "small".to_string(),
        primes: vec![2, 3],
        categories: 16,
        steps_per_level: 4,
        levels: vec![
            LevelConfig::new("l1", LevelKind::Generic, 64.0, 1.0),
            LevelConfig::new("l2", LevelKind::Generic, 256.0, 1.0),
            LevelConfig::new("dram", LevelKind::Generic, f64::INFINITY, 1.0),
        ],
    }
}

/// Resident footprint of `level` for the decisions recorded so far.
fn footprint(arch: &ArchConfig, state: &ElementState, level: usize) -> f64 {
    let sizes = state.program.cumulative_sizes(level, &arch.primes);
    Operand::ALL
        .iter()
        .filter(|&&op| arch.levels[level].residency.holds(op))
        .map(|&op| operand_volume(op, sizes))
        .sum()
}

// ── stepping by hand ──

#[test]
fn test_two_levels_stepped_by_hand() {
    let arch = small_hierarchy();
    let actor = TilingActor::new(arch.clone()).unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let mut state = ElementState::new(&arch, DimBudgets::uniform(2, 40));
    let mut episode = actor.episode();
    let mut orders = Vec::new();

    for level in 0..2 {
        state = state.enter_level();
        for sub_step in 0..4 {
            let cursor = Cursor::new(level, sub_step);
            let scores = StepScores::zeros(1, 2, 16);
            let (out, next) = actor
                .step(&episode, cursor, std::slice::from_ref(&state), &scores, &mut rng)
                .unwrap();
            episode = next;
            orders.push(out.order.index());

            let step = &out.elements.unwrap()[0];
            let bound = if level == 0 { 6 } else { 8 };
            for &e in &step.tiles {
                assert!(e <= bound, "level {} exponent {} above {}", level, e, bound);
            }
            state = state.apply(level, out.order, step.to_dim_tile()).unwrap();
            assert!(footprint(&arch, &state, level) <= arch.levels[level].buffer_size);
        }
    }

    assert_eq!(orders, vec![0, 1, 3, 2, 0, 1, 3, 2]);
    assert!(episode.is_finished(0) && episode.is_finished(1));
}

// ── full rollouts ──

#[test]
fn test_rollout_respects_every_buffer() {
    let arch = ArchConfig::tensor_core();
    let actor = TilingActor::new(arch.clone()).unwrap();
    let budgets = ProblemInstance::new(4, 2048, 3456, 1400)
        .factorize(&arch.primes)
        .unwrap();
    let states: Vec<ElementState> = (0..32)
        .map(|_| ElementState::new(&arch, budgets.clone()))
        .collect();
    let model = FlatScores {
        num_primes: 4,
        categories: 12,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();

    for state in &result.states {
        assert!(state.budgets.is_exhausted());
        for level in 0..arch.terminal_level() {
            let used = footprint(&arch, state, level);
            assert!(
                used <= arch.levels[level].buffer_size,
                "level {} holds {} > {}",
                arch.levels[level].name,
                used,
                arch.levels[level].buffer_size
            );
            let lanes: f64 = state
                .program
                .level(level)
                .iter()
                .map(|t| t.spatial_lanes())
                .product();
            assert!(lanes <= arch.levels[level].spmap_capacity);
        }
        // the full workload is covered exactly
        let total = state.program.cumulative_sizes(arch.terminal_level(), &arch.primes);
        assert_eq!(total, [4.0, 2048.0, 3456.0, 1400.0]);
    }
}

#[test]
fn test_same_seed_same_trajectory() {
    let arch = ArchConfig::tensor_core();
    let actor = TilingActor::new(arch.clone()).unwrap();
    let budgets = ProblemInstance::new(1, 1024, 1024, 1024)
        .factorize(&arch.primes)
        .unwrap();
    let model = FlatScores {
        num_primes: 4,
        categories: 12,
    };
    let run = |seed: u64| {
        let states = vec![ElementState::new(&arch, budgets.clone()); 4];
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Rollout::new(&actor, &model).run(states, &mut rng).unwrap()
    };
    let a = run(11);
    let b = run(11);
    assert_eq!(a.trajectory, b.trajectory);
    assert_eq!(
        serde_json::to_value(&a.trajectory).unwrap(),
        serde_json::to_value(&b.trajectory).unwrap()
    );
    let programs_a: Vec<_> = a.states.iter().map(|s| s.program.clone()).collect();
    let programs_b: Vec<_> = b.states.iter().map(|s| s.program.clone()).collect();
    assert_eq!(programs_a, programs_b);
}

#[test]
fn test_program_serializes_per_level() {
    let arch = small_hierarchy();
    let actor = TilingActor::new(arch.clone()).unwrap();
    let model = FlatScores {
        num_primes: 2,
        categories: 16,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let states = vec![ElementState::new(&arch, DimBudgets::uniform(2, 3))];
    let result = Rollout::new(&actor, &model).run(states, &mut rng).unwrap();
    let json = serde_json::to_value(&result.states[0].program).unwrap();
    let levels = json["levels"].as_array().unwrap();
    assert_eq!(levels.len(), 3);
    for cells in levels {
        assert_eq!(cells.as_array().unwrap().len(), 4);
    }
    assert_eq!(result.states[0].program.tile(2, Dim::K).exponents.len(), 2);
}

// ── config-driven ──

#[test]
fn test_rollout_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("arch.toml");
    std::fs::write(
        &path,
        r#"
[arch]
name = "file_arch"
primes = [2, 3, 5]
categories = 10

[level.rf]
kind = "register_file"
buffer_size = 256
spmap_capacity = 4

[level.smem]
kind = "shared_memory"
buffer_size = 16_384
spmap_capacity = 16

[level.dram]
buffer_size = 1e30
"#,
    )
    .unwrap();
    let arch = ArchConfig::load(&path).unwrap();
    assert_eq!(arch.num_levels(), 3);
    let actor = TilingActor::new(arch.clone()).unwrap();
    let budgets = ProblemInstance::new(2, 600, 720, 960)
        .factorize(&arch.primes)
        .unwrap();
    let model = FlatScores {
        num_primes: 3,
        categories: 10,
    };
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let result = Rollout::new(&actor, &model)
        .run(vec![ElementState::new(&arch, budgets); 8], &mut rng)
        .unwrap();
    assert_eq!(result.trajectory.len(), 12);
    for state in &result.states {
        for level in 0..2 {
            assert!(footprint(&arch, state, level) <= arch.levels[level].buffer_size);
        }
    }
}
