use anyhow::{bail, Context, Result};
use batch::{FsImageLoader, OffscreenBatchRunner, PngWriter};
use chrono::{Local, NaiveDateTime};
use clap::{Args, Parser, Subcommand, ValueEnum};
use color::Rgb;
use image::RgbaImage;
use renderer::{
    read_texture, ContextOptions, DisplaySurface, EngineConfig, GpuContext, MaskPreviewSource,
    RetouchEngine, RetouchParameters, ViewMode, ViewportState, ViewportTransform,
};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "retouch-cli")]
#[command(about = "Frequency-separation skin retouching on the GPU")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Retouch one image and save it as PNG
    Export {
        /// Source image
        input: PathBuf,

        /// Output file (defaults to retouched-<timestamp>.png)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        retouch: RetouchArgs,
    },

    /// Retouch a list of images, writing <stem>_rt.png for each
    Batch {
        /// Source images, processed in order
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Write outputs here instead of next to each source
        #[arg(short = 'd', long)]
        output_dir: Option<PathBuf>,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        #[command(flatten)]
        retouch: RetouchArgs,
    },

    /// Print the colour of one pixel
    Sample {
        input: PathBuf,
        x: u32,
        y: u32,
    },

    /// Render the interactive display path into a PNG
    Preview {
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "1280")]
        width: u32,

        #[arg(long, default_value = "720")]
        height: u32,

        #[arg(long, default_value = "1.0")]
        zoom: f32,

        /// Pan in display pixels
        #[arg(long, value_name = "DX,DY", value_parser = parse_pan, allow_hyphen_values = true)]
        pan: Option<(f32, f32)>,

        #[arg(long, value_enum, default_value = "final")]
        view: ViewArg,

        /// Draw the skin mask into this display rectangle
        #[arg(long, value_name = "X,Y,W,H", value_parser = parse_rect, allow_hyphen_values = true)]
        mask_preview: Option<(i32, i32, u32, u32)>,

        /// Show the feathered mask instead of the hard one
        #[arg(long)]
        soft_mask: bool,

        #[command(flatten)]
        retouch: RetouchArgs,
    },

    /// Write the default parameter preset as JSON
    Preset {
        /// Output file (stdout if omitted)
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RetouchArgs {
    /// Parameter preset to start from
    #[arg(long)]
    preset: Option<PathBuf>,

    /// Sample a skin tone from the image at this pixel (repeatable)
    #[arg(long = "tone-at", value_name = "X,Y", value_parser = parse_point)]
    tone_at: Vec<(u32, u32)>,

    /// Add a skin tone given as 8-bit RGB (repeatable)
    #[arg(long = "tone-rgb", value_name = "R,G,B", value_parser = parse_rgb)]
    tone_rgb: Vec<[u8; 3]>,

    #[arg(long)]
    smoothness: Option<f32>,

    #[arg(long)]
    tolerance: Option<f32>,

    #[arg(long)]
    mask_blur: Option<f32>,

    #[arg(long)]
    detail: Option<f32>,

    #[arg(long)]
    expansion: Option<f32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ViewArg {
    Final,
    HighFrequency,
    LowFrequency,
}

impl From<ViewArg> for ViewMode {
    fn from(view: ViewArg) -> Self {
        match view {
            ViewArg::Final => ViewMode::Final,
            ViewArg::HighFrequency => ViewMode::HighFrequency,
            ViewArg::LowFrequency => ViewMode::LowFrequency,
        }
    }
}

impl RetouchArgs {
    /// Parameters from the preset and overrides. Tones given with `--tone-at`
    /// are sampled from the image currently loaded in `engine`.
    fn resolve(&self, engine: &mut RetouchEngine) -> Result<RetouchParameters> {
        let mut params = match &self.preset {
            Some(path) => RetouchParameters::load(path)?,
            None => RetouchParameters::default(),
        };
        if let Some(value) = self.smoothness {
            params.smoothness = value;
        }
        if let Some(value) = self.tolerance {
            params.color_tolerance = value;
        }
        if let Some(value) = self.mask_blur {
            params.mask_blur_radius = value;
        }
        if let Some(value) = self.detail {
            params.detail_amount = value;
        }
        if let Some(value) = self.expansion {
            params.mask_expansion = value;
        }

        for [r, g, b] in &self.tone_rgb {
            params.skin_tones.push_rgb(Rgb::from_rgb8(*r, *g, *b));
        }
        if !self.tone_at.is_empty() {
            let (width, height) = engine.size().context("no image loaded to sample from")?;
            for &(x, y) in &self.tone_at {
                if x >= width || y >= height {
                    bail!("tone sample ({x}, {y}) is outside the {width}x{height} image");
                }
                let tone = engine.sample_tone(x, y)?;
                info!(x, y, h = tone.h, s = tone.s, v = tone.v, "sampled skin tone");
                params.skin_tones.push(tone);
            }
        }

        Ok(params.sanitized())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Export {
            input,
            output,
            retouch,
        } => export_command(&input, output, &retouch),
        Commands::Batch {
            files,
            output_dir,
            report,
            retouch,
        } => batch_command(files, output_dir, report, &retouch),
        Commands::Sample { input, x, y } => sample_command(&input, x, y),
        Commands::Preview {
            input,
            output,
            width,
            height,
            zoom,
            pan,
            view,
            mask_preview,
            soft_mask,
            retouch,
        } => {
            let mut state = ViewportState::default();
            state.set_zoom(zoom);
            if let Some((dx, dy)) = pan {
                state.pan_by(dx, dy);
            }
            let options = PreviewOptions {
                size: (width, height),
                state,
                view: view.into(),
                mask_preview,
                mask_source: if soft_mask {
                    MaskPreviewSource::Soft
                } else {
                    MaskPreviewSource::Hard
                },
            };
            preview_command(&input, &output, &options, &retouch)
        }
        Commands::Preset { output } => preset_command(output),
    }
}

fn open_engine(config: EngineConfig) -> Result<(GpuContext, RetouchEngine)> {
    let context = GpuContext::headless(&ContextOptions::default())?;
    if let Some(adapter) = context.adapter_info() {
        info!("Using {} ({:?})", adapter.name, adapter.backend);
    }
    let engine = RetouchEngine::new(&context, config)?;
    Ok((context, engine))
}

fn load_image(path: &Path) -> Result<RgbaImage> {
    let image = image::open(path).with_context(|| format!("decode {}", path.display()))?;
    Ok(image.to_rgba8())
}

fn export_file_name(at: NaiveDateTime) -> String {
    format!("retouched-{}.png", at.format("%Y%m%d-%H%M%S"))
}

fn export_command(input: &Path, output: Option<PathBuf>, retouch: &RetouchArgs) -> Result<()> {
    let (_context, mut engine) = open_engine(EngineConfig::default())?;
    let image = load_image(input)?;
    engine.set_image(&image)?;

    let params = retouch.resolve(&mut engine)?.for_export();
    if params.skin_tones.is_empty() {
        warn!("No skin tones selected; the export will match the source");
    }
    engine.render_to_buffer(&params)?;
    let frame = engine
        .read_pixels()?
        .into_rgba_image()
        .context("frame buffer does not match its dimensions")?;

    let output =
        output.unwrap_or_else(|| PathBuf::from(export_file_name(Local::now().naive_local())));
    frame
        .save_with_format(&output, image::ImageFormat::Png)
        .with_context(|| format!("save {}", output.display()))?;
    info!("Exported {}x{} to {:?}", frame.width(), frame.height(), output);
    Ok(())
}

fn batch_command(
    files: Vec<PathBuf>,
    output_dir: Option<PathBuf>,
    report_path: Option<PathBuf>,
    retouch: &RetouchArgs,
) -> Result<()> {
    let (_context, mut engine) = open_engine(EngineConfig::default())?;
    if !retouch.tone_at.is_empty() {
        // Sample positions refer to the first image of the queue.
        let first = files.first().context("batch queue is empty")?;
        engine.set_image(&load_image(first)?)?;
    }
    let params = retouch.resolve(&mut engine)?;

    if let Some(dir) = &output_dir {
        std::fs::create_dir_all(dir)?;
    }
    let mut runner = OffscreenBatchRunner::new(engine);
    let mut writer = PngWriter { output_dir };
    let report = runner.run(&files, &params, &mut FsImageLoader, &mut writer)?;

    for failure in &report.failures {
        warn!("Failed {}: {}", failure.source.display(), failure.error);
    }
    info!(
        "Batch {} finished: {} written, {} failed",
        report.run_id,
        report.succeeded(),
        report.failed()
    );

    if let Some(path) = report_path {
        std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to: {:?}", path);
    }
    Ok(())
}

fn sample_command(input: &Path, x: u32, y: u32) -> Result<()> {
    let (_context, mut engine) = open_engine(EngineConfig::default())?;
    let image = load_image(input)?;
    if x >= image.width() || y >= image.height() {
        bail!(
            "({x}, {y}) is outside the {}x{} image",
            image.width(),
            image.height()
        );
    }
    engine.set_image(&image)?;

    let rgb = engine.sample_pixel(x, y)?;
    let hsv = rgb.to_hsv();
    let [r, g, b] = rgb.to_rgb8();
    println!("rgb {r},{g},{b}  ({:.4}, {:.4}, {:.4})", rgb.r, rgb.g, rgb.b);
    println!("hsv ({:.4}, {:.4}, {:.4})", hsv.h, hsv.s, hsv.v);
    println!("--tone-rgb {r},{g},{b}");
    Ok(())
}

struct PreviewOptions {
    size: (u32, u32),
    state: ViewportState,
    view: ViewMode,
    mask_preview: Option<(i32, i32, u32, u32)>,
    mask_source: MaskPreviewSource,
}

fn preview_command(
    input: &Path,
    output: &Path,
    options: &PreviewOptions,
    retouch: &RetouchArgs,
) -> Result<()> {
    let (width, height) = options.size;
    if width == 0 || height == 0 {
        bail!("preview size must be non-zero");
    }
    let config = EngineConfig {
        mask_preview: options.mask_source,
        ..Default::default()
    };
    let display_format = config.display_format;
    let (context, mut engine) = open_engine(config)?;
    let image = load_image(input)?;
    engine.set_image(&image)?;

    let mut params = retouch.resolve(&mut engine)?;
    let transform = ViewportTransform::new(options.size, image.dimensions(), &options.state);
    params.transform = transform.matrix();
    params.view_mode = options.view;

    let texture = context.device().create_texture(&wgpu::TextureDescriptor {
        label: Some("retouch-cli.preview"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: display_format,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let surface = DisplaySurface {
        view: &view,
        width,
        height,
    };

    engine.render_to_display(&params, &surface)?;
    if let Some((x, y, w, h)) = options.mask_preview {
        engine.draw_mask_preview(&surface, x, y, w, h)?;
    }

    let frame = read_texture(context.device(), context.queue(), &texture)?
        .into_rgba_image()
        .context("preview buffer does not match its dimensions")?;
    frame
        .save_with_format(output, image::ImageFormat::Png)
        .with_context(|| format!("save {}", output.display()))?;
    info!("Preview written to: {:?}", output);
    Ok(())
}

fn preset_command(output: Option<PathBuf>) -> Result<()> {
    let params = RetouchParameters::default();
    match output {
        Some(path) => {
            params.save(&path)?;
            info!("Preset written to: {:?}", path);
        }
        None => println!("{}", params.to_json_pretty()?),
    }
    Ok(())
}

fn parse_list<T: FromStr>(value: &str, count: usize, what: &str) -> Result<Vec<T>, String> {
    let parts: Vec<T> = value
        .split(',')
        .map(|part| part.trim().parse::<T>())
        .collect::<Result<_, _>>()
        .map_err(|_| format!("expected {what}, got '{value}'"))?;
    if parts.len() != count {
        return Err(format!("expected {what}, got '{value}'"));
    }
    Ok(parts)
}

fn parse_point(value: &str) -> Result<(u32, u32), String> {
    let parts = parse_list::<u32>(value, 2, "X,Y")?;
    Ok((parts[0], parts[1]))
}

fn parse_pan(value: &str) -> Result<(f32, f32), String> {
    let parts = parse_list::<f32>(value, 2, "DX,DY")?;
    Ok((parts[0], parts[1]))
}

fn parse_rgb(value: &str) -> Result<[u8; 3], String> {
    let parts = parse_list::<u8>(value, 3, "R,G,B with components 0-255")?;
    Ok([parts[0], parts[1], parts[2]])
}

fn parse_rect(value: &str) -> Result<(i32, i32, u32, u32), String> {
    let origin = value.splitn(3, ',').take(2).collect::<Vec<_>>().join(",");
    let size = value.splitn(3, ',').nth(2).unwrap_or_default();
    let origin = parse_list::<i32>(&origin, 2, "X,Y,W,H")?;
    let size = parse_list::<u32>(size, 2, "X,Y,W,H")?;
    Ok((origin[0], origin[1], size[0], size[1]))
}
