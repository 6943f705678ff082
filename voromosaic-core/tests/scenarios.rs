//! End-to-end engine scenarios: sampling, growth, physics, and history
//! replay against synthetic images.

use rand::{Rng, SeedableRng};
use voromosaic_core::{Engine, Position, SplitStrategy, StepParams};

fn rgba_from_fn(
    width: u32,
    height: u32,
    mut f: impl FnMut(u32, u32) -> [u8; 4],
) -> Vec<u8> {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            data.extend_from_slice(&f(x, y));
        }
    }
    data
}

fn random_rgba(width: u32, height: u32, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    rgba_from_fn(width, height, |_, _| {
        [rng.gen(), rng.gen(), rng.gen(), 255]
    })
}

fn default_params() -> StepParams {
    StepParams {
        speed: 15.0,
        dt: 0.01,
        pull: 0.0,
        theta: 3.0,
        sigma: 3.0,
    }
}

#[test]
fn uniform_gray_single_site() {
    let rgba = rgba_from_fn(4, 4, |_, _| [128, 128, 128, 255]);
    let mut engine = Engine::new(0);
    engine.set_image(&rgba, 4, 4).unwrap();
    engine.set_sites_from_sampler(1, false, 0).unwrap();

    let result = engine.compute().unwrap();
    assert_eq!(result.cell_areas, vec![16]);
    assert_eq!(result.cell_colors, vec![[128, 128, 128]]);
    assert!(result.cell_of.iter().all(|&c| c == 0));
}

#[test]
fn black_and_white_pixel_pair() {
    let rgba = vec![0, 0, 0, 255, 255, 255, 255, 255];
    let mut engine = Engine::new(0);
    engine.set_image(&rgba, 2, 1).unwrap();
    engine.set_sites(&[Position::new(0.5, 0.5), Position::new(1.5, 0.5)], 0);

    let result = engine.compute().unwrap();
    assert_eq!(result.cell_of, vec![0, 1]);
    assert_eq!(result.cell_colors, vec![[0, 0, 0], [255, 255, 255]]);
    assert_eq!(result.cell_areas, vec![1, 1]);
}

#[test]
fn grow_to_double_count() {
    let rgba = random_rgba(100, 100, 42);
    let mut engine = Engine::new(42);
    engine.set_image(&rgba, 100, 100).unwrap();
    engine.set_sites_from_sampler(50, false, 42).unwrap();

    engine.compute().unwrap();
    engine.set_count_target(100, 1.0, SplitStrategy::Max);

    let params = default_params();
    for _ in 0..150 {
        engine.step(params).unwrap();
        let result = engine.compute().unwrap();
        assert_eq!(result.cell_areas.iter().sum::<u32>(), 10_000);
        if engine.site_count() == 100 {
            break;
        }
    }
    assert_eq!(engine.site_count(), 100);

    let result = engine.compute().unwrap();
    assert_eq!(result.cell_areas.len(), 100);
    assert_eq!(result.cell_areas.iter().sum::<u32>(), 10_000);
}

#[test]
fn long_run_keeps_unit_velocities_and_moves_sites() {
    let rgba = random_rgba(100, 100, 42);
    let mut engine = Engine::new(7);
    engine.set_image(&rgba, 100, 100).unwrap();
    engine.set_sites_from_sampler(50, false, 7).unwrap();

    let start: Vec<Position> = (0..engine.site_count())
        .map(|i| engine.sites().position(i))
        .collect();

    let params = StepParams {
        speed: 15.0,
        dt: 1.0 / 30.0,
        pull: 0.0,
        theta: 3.0,
        sigma: 3.0,
    };
    for _ in 0..300 {
        engine.step(params).unwrap();
    }

    let mut moved = 0;
    for i in 0..engine.site_count() {
        let v = engine.sites().velocity(i);
        let norm = (v.x * v.x + v.y * v.y).sqrt();
        assert!((norm - 1.0).abs() < 1e-6, "velocity norm {norm}");

        if engine.sites().position(i).dist(&start[i]) > 0.0 {
            moved += 1;
        }
    }
    assert!(
        moved * 100 >= engine.site_count() * 95,
        "only {moved} of {} sites moved",
        engine.site_count()
    );
}

#[test]
fn inverse_bias_flips_gradient_preference() {
    // Brightness rises left to right.
    let rgba = rgba_from_fn(10, 10, |x, _| {
        let v = (x * 255 / 9) as u8;
        [v, v, v, 255]
    });
    let mut engine = Engine::new(0);
    engine.set_image(&rgba, 10, 10).unwrap();

    engine.set_sites_from_sampler(10, false, 3).unwrap();
    let bright_mean: f64 = (0..10)
        .map(|i| engine.sites().position(i).x)
        .sum::<f64>()
        / 10.0;

    engine.set_sites_from_sampler(10, true, 3).unwrap();
    let dark_mean: f64 = (0..10)
        .map(|i| engine.sites().position(i).x)
        .sum::<f64>()
        / 10.0;

    assert!(
        bright_mean > dark_mean,
        "bright-biased mean x {bright_mean} should exceed dark-biased {dark_mean}"
    );
}

#[test]
fn scrub_back_and_forward_replays_identically() {
    let rgba = random_rgba(64, 64, 5);
    let mut engine = Engine::new(11);
    engine.set_image(&rgba, 64, 64).unwrap();
    engine.set_sites_from_sampler(30, false, 11).unwrap();

    let params = default_params();
    for _ in 0..60 {
        engine.step(params).unwrap();
    }
    let reference = engine.compute().unwrap();

    for _ in 0..20 {
        assert!(engine.step_back());
    }
    // Render while scrubbed: positions differ from the head.
    let mid = engine.compute().unwrap();
    assert_ne!(mid.cell_of, reference.cell_of);

    for _ in 0..20 {
        assert!(engine.step_forward().unwrap());
    }
    let replayed = engine.compute().unwrap();
    assert_eq!(replayed.cell_of, reference.cell_of);
    assert_eq!(replayed.cell_colors, reference.cell_colors);
    assert_eq!(replayed.cell_areas, reference.cell_areas);
}

#[test]
fn identical_runs_are_byte_identical() {
    let rgba = random_rgba(48, 48, 21);
    let run = || {
        let mut engine = Engine::new(99);
        engine.set_image(&rgba, 48, 48).unwrap();
        engine.set_sites_from_sampler(25, false, 99).unwrap();
        engine.compute().unwrap();
        engine.set_count_target(40, 0.8, SplitStrategy::Max);

        let params = StepParams {
            speed: 12.0,
            dt: 1.0 / 30.0,
            pull: 2.0,
            theta: 3.0,
            sigma: 2.0,
        };
        let mut last = None;
        for _ in 0..80 {
            engine.step(params).unwrap();
            last = Some(engine.compute().unwrap());
        }
        let result = last.unwrap();
        let positions: Vec<(u64, u64)> = (0..engine.site_count())
            .map(|i| {
                let p = engine.sites().position(i);
                (p.x.to_bits(), p.y.to_bits())
            })
            .collect();
        (positions, result.cell_of, result.cell_colors)
    };

    let (pos_a, cells_a, colors_a) = run();
    let (pos_b, cells_b, colors_b) = run();
    assert_eq!(pos_a, pos_b);
    assert_eq!(cells_a, cells_b);
    assert_eq!(colors_a, colors_b);
}

#[test]
fn shrink_by_merging_preserves_partition() {
    let rgba = random_rgba(80, 80, 3);
    let mut engine = Engine::new(1);
    engine.set_image(&rgba, 80, 80).unwrap();
    engine.set_sites_from_sampler(60, false, 1).unwrap();

    engine.compute().unwrap();
    engine.set_count_target(20, 0.5, SplitStrategy::Max);

    let params = default_params();
    for _ in 0..400 {
        engine.step(params).unwrap();
        engine.compute().unwrap();
        if engine.site_count() == 20 {
            break;
        }
    }
    assert_eq!(engine.site_count(), 20);

    let result = engine.compute().unwrap();
    assert_eq!(result.cell_areas.len(), 20);
    assert_eq!(result.cell_areas.iter().sum::<u32>(), 6400);
}
