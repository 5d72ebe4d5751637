use std::{fs::File, io::BufReader, path::PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use warpcap::{
    CaptureOptions, CaptureSource, ClockHandle, RasterSurface, VectorSurface, VideoArtifact,
    VirtualClock, capture,
};

#[derive(Parser, Debug)]
#[command(name = "warpcap", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the built-in demo animation (requires `ffmpeg` on PATH for
    /// the webm format).
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Capture options JSON file; flags below override individual fields.
    #[arg(long)]
    options: Option<PathBuf>,

    /// Output path for the local webm backend.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Number of frames to record.
    #[arg(long)]
    frames: Option<u32>,

    /// Output frame rate.
    #[arg(long)]
    fps: Option<u32>,

    /// Frames held in memory per batch.
    #[arg(long)]
    batch_size: Option<u32>,

    /// Output width in pixels (even).
    #[arg(long)]
    width: Option<u32>,

    /// Output height in pixels (even).
    #[arg(long)]
    height: Option<u32>,

    /// Encoder backend: webm (local file) or ffmpeg (remote server).
    #[arg(long)]
    format: Option<String>,

    /// Remote encode server address for the ffmpeg format.
    #[arg(long)]
    remote_addr: Option<String>,

    /// Start frames fully transparent instead of opaque white.
    #[arg(long)]
    transparent: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Demo(args) => cmd_demo(args).await,
    }
}

fn read_options_json(path: &PathBuf) -> anyhow::Result<CaptureOptions> {
    let f = File::open(path).with_context(|| format!("open options '{}'", path.display()))?;
    let options: CaptureOptions =
        serde_json::from_reader(BufReader::new(f)).context("parse options JSON")?;
    Ok(options)
}

async fn cmd_demo(args: DemoArgs) -> anyhow::Result<()> {
    let mut options = match &args.options {
        Some(path) => read_options_json(path)?,
        None => CaptureOptions::default(),
    };
    if let Some(v) = args.frames {
        options.frames_to_capture = v;
    }
    if let Some(v) = args.fps {
        options.fps = v;
    }
    if let Some(v) = args.batch_size {
        options.batch_size = v;
    }
    if let Some(v) = args.out {
        options.out_path = v;
    }
    if let Some(v) = args.remote_addr {
        options.remote_addr = v;
    }
    if let Some(v) = &args.format {
        options.format = v.parse()?;
    }
    if args.transparent {
        options.allow_transparency = true;
    }
    let width = args.width.or(options.width).unwrap_or(480);
    let height = args.height.or(options.height).unwrap_or(360);
    options.width = Some(width);
    options.height = Some(height);

    let clock = VirtualClock::new();
    let handle = clock.handle();

    let plasma = RasterSurface::new(width, height);
    arm_plasma(&handle, plasma.clone());

    let overlay = VectorSurface::from_markup(orbit_markup(width, height, 0.0))?;
    {
        let overlay = overlay.clone();
        let time = handle.clone();
        handle.set_interval(
            move || overlay.set_markup(orbit_markup(width, height, time.now_ms())),
            50.0,
        );
    }

    let sources = vec![CaptureSource::from(plasma), CaptureSource::from(overlay)];
    let artifact = capture(&clock, sources, options).await?;

    match artifact {
        VideoArtifact::LocalFile(path) => eprintln!("wrote {}", path.display()),
        VideoArtifact::Remote { url } => eprintln!("encoded remotely: {url}"),
    }
    Ok(())
}

/// Re-arming animation-frame loop that repaints the raster background.
fn arm_plasma(handle: &ClockHandle, surface: RasterSurface) {
    let next = handle.clone();
    handle.request_animation_frame(move |t| {
        draw_plasma(&surface, t);
        arm_plasma(&next, surface);
    });
}

fn draw_plasma(surface: &RasterSurface, t_ms: f64) {
    let (w, h) = (surface.width() as usize, surface.height() as usize);
    let t = t_ms / 1000.0;
    surface.with_pixels_mut(|px| {
        for y in 0..h {
            for x in 0..w {
                let fx = x as f64 / w as f64;
                let fy = y as f64 / h as f64;
                let v = ((fx * 8.0 + t * 2.0).sin()
                    + (fy * 6.0 - t * 1.4).sin()
                    + ((fx + fy) * 5.0 + t).sin())
                    / 3.0;
                let i = (y * w + x) * 4;
                px[i] = ((v * 0.5 + 0.5) * 255.0) as u8;
                px[i + 1] = ((v * -0.5 + 0.5) * 200.0) as u8;
                px[i + 2] = 160;
                px[i + 3] = 255;
            }
        }
    });
}

/// SVG overlay: a dot orbiting the frame center.
fn orbit_markup(width: u32, height: u32, t_ms: f64) -> String {
    let cx = width as f64 / 2.0;
    let cy = height as f64 / 2.0;
    let radius = cx.min(cy) * 0.6;
    let angle = t_ms / 1000.0 * std::f64::consts::TAU * 0.5;
    let dot_x = cx + radius * angle.cos();
    let dot_y = cy + radius * angle.sin();
    format!(
        concat!(
            "<svg xmlns='http://www.w3.org/2000/svg' width='{w}' height='{h}'>",
            "<circle cx='{cx:.1}' cy='{cy:.1}' r='{r:.1}' fill='none' ",
            "stroke='#ffffff' stroke-opacity='0.4' stroke-width='2'/>",
            "<circle cx='{x:.1}' cy='{y:.1}' r='12' fill='#ffcc00'/>",
            "</svg>"
        ),
        w = width,
        h = height,
        cx = cx,
        cy = cy,
        r = radius,
        x = dot_x,
        y = dot_y,
    )
}
