//! Voronoi mosaic animation CLI
//!
//! Renders deterministic, frame-rate-independent Voronoi animations driven
//! through grow / hold / fade phases, encoding GIF directly or MP4 through
//! an external ffmpeg process.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Deserialize;
use tracing::info;

use voromosaic_core::{BackendKind, Engine, SplitStrategy, StepParams};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Mp4,
    Gif,
}

#[derive(Parser, Debug)]
#[command(name = "voromosaic")]
#[command(about = "Render Voronoi mosaic animations", long_about = None)]
#[command(arg_required_else_help = true)]
struct Args {
    /// Input image path
    #[arg(short, long)]
    input: PathBuf,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "mp4")]
    format: OutputFormat,

    /// Starting number of sites
    #[arg(long, default_value = "25")]
    sites_start: usize,

    /// Ending number of sites (default animation grows toward this)
    #[arg(long, default_value = "1000")]
    sites_end: usize,

    /// Animation speed (pixels per second)
    #[arg(long, default_value = "15.0")]
    speed: f64,

    /// Duration of the default grow phase in seconds
    #[arg(long, default_value = "10.0")]
    duration: f64,

    /// Frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Random seed for reproducibility
    #[arg(long, default_value = "0")]
    seed: u32,

    /// O-U drift rate toward the pull target
    #[arg(long, default_value = "3.0")]
    theta: f64,

    /// O-U wander magnitude
    #[arg(long, default_value = "3.0")]
    sigma: f64,

    /// Centroid pull strength (0 disables Lloyd-style relaxation)
    #[arg(long, default_value = "0.0")]
    pull: f64,

    /// Favor dark pixels instead of bright ones when sampling sites
    #[arg(long)]
    inverse_bias: bool,

    /// Split strategy while growing: max, far, or random
    #[arg(long, default_value = "max")]
    split_strategy: String,

    /// JSON phase spec file; overrides the default grow phase.
    /// Entries look like {"n": 500, "dt": 8.0}, {"t": 3.0}, {"fade": 2.0}.
    #[arg(long)]
    phases: Option<PathBuf>,

    /// Use GPU acceleration (if available)
    #[arg(long)]
    gpu: bool,

    /// Run benchmark comparing CPU vs GPU performance
    #[arg(long)]
    benchmark: bool,

    /// Number of frames to render in benchmark mode
    #[arg(long, default_value = "10")]
    bench_frames: usize,

    /// Number of sites to use in benchmark mode
    #[arg(long, default_value = "500")]
    bench_sites: usize,

    /// Render a single frame (PNG) instead of animation
    #[arg(long)]
    single_frame: bool,
}

/// One entry of the JSON phase file. Exactly one phase kind may be
/// populated: grow (`n` + `dt`), hold (`t`), or fade (`fade`).
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
struct PhaseSpec {
    n: Option<usize>,
    dt: Option<f64>,
    t: Option<f64>,
    fade: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Grow { target: usize, seconds: f64 },
    Hold { seconds: f64 },
    Fade { seconds: f64 },
}

impl PhaseSpec {
    fn into_phase(self) -> anyhow::Result<Phase> {
        match (self.n, self.dt, self.t, self.fade) {
            (Some(target), Some(seconds), None, None) => {
                Ok(Phase::Grow { target, seconds })
            }
            (None, None, Some(seconds), None) => Ok(Phase::Hold { seconds }),
            (None, None, None, Some(seconds)) => Ok(Phase::Fade { seconds }),
            _ => anyhow::bail!(
                "phase must be exactly one of {{n, dt}}, {{t}}, or {{fade}}: {self:?}"
            ),
        }
    }
}

impl Phase {
    fn seconds(&self) -> f64 {
        match *self {
            Phase::Grow { seconds, .. }
            | Phase::Hold { seconds }
            | Phase::Fade { seconds } => seconds,
        }
    }
}

/// Doubling time that carries the site count from `current` to `target`
/// over `seconds` of exponential growth or shrink.
fn doubling_time_for(current: usize, target: usize, seconds: f64) -> f64 {
    let ratio = target as f64 / current as f64;
    let octaves = ratio.log2().abs();
    if octaves < f64::EPSILON {
        0.0
    } else {
        seconds / octaves
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    info!("loading image: {:?}", args.input);
    let source = image::open(&args.input)
        .with_context(|| format!("failed to open {:?}", args.input))?
        .to_rgba8();
    let (width, height) = source.dimensions();
    info!("image size: {width}x{height}");

    let strategy: SplitStrategy = args
        .split_strategy
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;

    let backend = if args.gpu {
        if cfg!(feature = "gpu") {
            info!("using GPU backend (wgpu)");
        } else {
            info!("GPU feature not enabled; the engine will use the CPU backend");
        }
        BackendKind::Gpu
    } else {
        info!("using CPU backend");
        BackendKind::Cpu
    };

    let mut engine = Engine::with_backend(args.seed, backend);
    engine.set_image(source.as_raw(), width, height)?;

    if args.benchmark {
        return run_benchmark(&mut engine, &args);
    }

    let output = args
        .output
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("output path required (use -o/--output)"))?;

    engine.set_sites_from_sampler(args.sites_start, args.inverse_bias, args.seed)?;
    info!(
        "sampled {} sites (seed: {}, inverse_bias: {})",
        args.sites_start, args.seed, args.inverse_bias
    );

    if args.single_frame {
        let result = engine.compute()?;
        result.to_image().save(output)?;
        info!("output saved to: {:?}", output);
        return Ok(());
    }

    let phases = load_phases(&args)?;
    let total_seconds: f64 = phases.iter().map(Phase::seconds).sum();
    let total_frames = (total_seconds * args.fps as f64).round() as u64;
    info!(
        "rendering {} frames at {} fps across {} phases",
        total_frames,
        args.fps,
        phases.len()
    );

    let progress = ProgressBar::new(total_frames);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("#>-"),
    );

    let source_rgb = image::DynamicImage::ImageRgba8(source.clone()).to_rgb8();
    let frames = render_phases(&mut engine, &args, strategy, &phases, &source_rgb, &progress)?;
    progress.finish_with_message("rendering complete");
    if frames.is_empty() {
        anyhow::bail!("no frames rendered; check phase durations and fps");
    }

    match args.format {
        OutputFormat::Gif => encode_gif(output, &frames, args.fps)?,
        OutputFormat::Mp4 => encode_mp4(output, &frames, args.fps)?,
    }

    info!("output saved to: {:?}", output);
    Ok(())
}

fn load_phases(args: &Args) -> anyhow::Result<Vec<Phase>> {
    let phases = match &args.phases {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {path:?}"))?;
            let specs: Vec<PhaseSpec> =
                serde_json::from_str(&text).context("invalid phase spec JSON")?;
            specs
                .into_iter()
                .map(PhaseSpec::into_phase)
                .collect::<anyhow::Result<Vec<_>>>()?
        }
        None => vec![Phase::Grow {
            target: args.sites_end,
            seconds: args.duration,
        }],
    };
    if phases.is_empty() {
        anyhow::bail!("phase list is empty");
    }
    Ok(phases)
}

fn render_phases(
    engine: &mut Engine,
    args: &Args,
    strategy: SplitStrategy,
    phases: &[Phase],
    source_rgb: &image::RgbImage,
    progress: &ProgressBar,
) -> anyhow::Result<Vec<image::RgbImage>> {
    let dt = 1.0 / args.fps as f64;
    let params = StepParams {
        speed: args.speed,
        dt,
        pull: args.pull,
        theta: args.theta,
        sigma: args.sigma,
    };

    let mut frames = Vec::new();
    for phase in phases {
        let phase_frames = (phase.seconds() * args.fps as f64).round() as usize;

        if let Phase::Grow { target, seconds } = *phase {
            let tau = doubling_time_for(engine.site_count(), target, seconds);
            info!(
                "grow phase: {} -> {} sites over {seconds}s (doubling time {tau:.2}s)",
                engine.site_count(),
                target
            );
            engine.set_count_target(target, tau, strategy);
        }

        for i in 0..phase_frames {
            engine.step(params)?;
            let result = engine.compute()?;
            let rendered = result.to_image();

            let frame = match *phase {
                Phase::Fade { .. } => {
                    let alpha = (i + 1) as f64 / phase_frames as f64;
                    blend_toward(&rendered, source_rgb, alpha)
                }
                _ => rendered,
            };
            frames.push(frame);
            progress.inc(1);
        }
    }
    Ok(frames)
}

/// Pixel-local blend of a rendered frame toward the source image.
fn blend_toward(
    frame: &image::RgbImage,
    source: &image::RgbImage,
    alpha: f64,
) -> image::RgbImage {
    let alpha = alpha.clamp(0.0, 1.0);
    let mut out = frame.clone();
    for (dst, src) in out.iter_mut().zip(source.as_raw()) {
        *dst = (*dst as f64 * (1.0 - alpha) + *src as f64 * alpha).round() as u8;
    }
    out
}

/// Benchmark CPU vs GPU performance
fn run_benchmark(engine: &mut Engine, args: &Args) -> anyhow::Result<()> {
    let num_frames = args.bench_frames;
    engine.set_sites_from_sampler(args.bench_sites, args.inverse_bias, args.seed)?;

    println!("\n=== Voronoi Benchmark ===");
    println!("Sites: {}", args.bench_sites);
    println!("Frames: {}", num_frames);
    println!();

    println!("Benchmarking CPU...");
    engine.set_backend(BackendKind::Cpu);
    let cpu_time = benchmark_engine(engine, num_frames)?;
    report_timing("CPU", cpu_time, num_frames);

    #[cfg(feature = "gpu")]
    {
        println!("Benchmarking GPU (wgpu)...");
        engine.set_backend(BackendKind::Gpu);
        let gpu_time = benchmark_engine(engine, num_frames)?;
        report_timing("GPU", gpu_time, num_frames);

        println!();
        println!("=== Summary ===");
        let speedup = cpu_time.as_secs_f64() / gpu_time.as_secs_f64();
        if speedup > 1.0 {
            println!("GPU is {:.2}x faster than CPU", speedup);
        } else {
            println!("CPU is {:.2}x faster than GPU", 1.0 / speedup);
        }
    }

    #[cfg(not(feature = "gpu"))]
    println!("GPU benchmark skipped (gpu feature not enabled)");

    Ok(())
}

fn benchmark_engine(engine: &mut Engine, num_frames: usize) -> anyhow::Result<Duration> {
    // Warmup frame (the GPU path compiles shaders on first use).
    let _ = engine.compute()?;

    let start = Instant::now();
    for _ in 0..num_frames {
        let _ = engine.compute()?;
    }
    Ok(start.elapsed())
}

fn report_timing(label: &str, elapsed: Duration, num_frames: usize) {
    println!(
        "  {}: {:?} total, {:.2} fps, {:.2} ms/frame",
        label,
        elapsed,
        num_frames as f64 / elapsed.as_secs_f64(),
        elapsed.as_secs_f64() * 1000.0 / num_frames as f64
    );
}

/// NeuQuant sampling factor for per-frame palettes: 1 is exhaustive, 30 is
/// fastest. Voronoi frames hold one flat color per cell, so a middling
/// factor loses nothing visible.
const GIF_QUANT_SPEED: i32 = 10;

fn encode_gif(path: &PathBuf, frames: &[image::RgbImage], fps: u32) -> anyhow::Result<()> {
    use gif::{Encoder, Frame, Repeat};
    use std::fs::File;

    let file = File::create(path)?;
    let (width, height) = frames[0].dimensions();

    let mut encoder = Encoder::new(file, width as u16, height as u16, &[])?;
    encoder.set_repeat(Repeat::Infinite)?;

    let frame_delay = (100 / fps).max(1) as u16; // GIF delay in centiseconds

    info!("encoding GIF ({} frames)...", frames.len());
    let progress = ProgressBar::new(frames.len() as u64);

    for frame_image in frames {
        // Cell counts above 256 exceed a GIF palette; let NeuQuant build a
        // local palette per frame rather than tracking exact colors.
        let mut frame = Frame::from_rgb_speed(
            width as u16,
            height as u16,
            frame_image.as_raw(),
            GIF_QUANT_SPEED,
        );
        frame.delay = frame_delay;

        encoder.write_frame(&frame)?;
        progress.inc(1);
    }

    progress.finish();
    Ok(())
}

fn encode_mp4(path: &PathBuf, frames: &[image::RgbImage], fps: u32) -> anyhow::Result<()> {
    // Write frames to a temp dir and shell out to ffmpeg; encoder process
    // management stays outside the core.
    use std::process::Command;
    use tempfile::tempdir;

    let temp_dir = tempdir()?;
    info!("writing frames to temp dir...");

    let progress = ProgressBar::new(frames.len() as u64);
    for (i, frame) in frames.iter().enumerate() {
        let path = temp_dir.path().join(format!("frame_{:05}.png", i));
        frame.save(&path)?;
        progress.inc(1);
    }
    progress.finish();

    info!("encoding MP4 with ffmpeg...");
    let status = Command::new("ffmpeg")
        .args([
            "-y",
            "-framerate",
            &fps.to_string(),
            "-i",
            &format!("{}/frame_%05d.png", temp_dir.path().display()),
            "-c:v",
            "libx264",
            "-pix_fmt",
            "yuv420p",
            "-crf",
            "18",
            path.to_str()
                .ok_or_else(|| anyhow::anyhow!("non-UTF8 output path"))?,
        ])
        .status()
        .context("failed to launch ffmpeg (is it installed?)")?;

    if !status.success() {
        anyhow::bail!("ffmpeg encoding failed");
    }

    Ok(())
}
