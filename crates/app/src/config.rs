use std::{fs, path::PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use video_ingest::{CameraCalibration, HsvThreshold};
use vision::{PipelineSettings, PipelineType};

/// Arguments for `sightline run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Still image served as every frame
    #[arg(long, conflicts_with = "camera")]
    pub image: Option<PathBuf>,

    /// Camera device index or stream URI (requires the `with-opencv` feature)
    #[arg(long)]
    pub camera: Option<String>,

    /// Capture width for camera sources
    #[arg(long, default_value_t = 640)]
    pub width: u32,

    /// Capture height for camera sources
    #[arg(long, default_value_t = 480)]
    pub height: u32,

    /// Diagonal field of view in degrees
    #[arg(long, default_value_t = 70.0)]
    pub fov: f64,

    /// Camera calibration JSON
    #[arg(long)]
    pub calibration: Option<PathBuf>,

    /// JSON array of pipeline settings; overrides --pipeline
    #[arg(long, conflicts_with = "pipeline")]
    pub settings: Option<PathBuf>,

    /// Pipeline kinds to create, in order (label or base index)
    #[arg(short, long = "pipeline", value_name = "KIND")]
    pub pipeline: Vec<String>,

    /// Index of the pipeline to start with
    #[arg(long, default_value_t = 0)]
    pub index: i32,

    /// Start in driver mode
    #[arg(long)]
    pub driver_mode: bool,

    /// Enable 3D pose solving on every created pipeline
    #[arg(long)]
    pub solve_pnp: bool,

    /// HSV window as h_lo,h_hi,s_lo,s_hi,v_lo,v_hi
    #[arg(long, value_name = "WINDOW")]
    pub hsv: Option<String>,

    /// Stop after this many frames
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Outputs buffered for the consumer before new ones are dropped
    #[arg(long, default_value_t = 4)]
    pub output_queue: usize,

    /// Restarts allowed after capture failures
    #[arg(long, default_value_t = 3)]
    pub max_restarts: u32,

    /// Read pipeline control commands from stdin
    #[arg(long)]
    pub stdin_control: bool,

    /// Write the last annotated frame to this path on exit
    #[arg(long)]
    pub save_output: Option<PathBuf>,

    /// Write the Prometheus exposition text to this path on exit
    #[arg(long)]
    pub metrics_dump: Option<PathBuf>,

    /// Write a Chrome trace of pipeline spans to this path
    #[arg(long)]
    pub chrome_trace: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SourceConfig {
    Image(PathBuf),
    Camera { uri: String, width: u32, height: u32 },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryOptions {
    pub chrome_trace_path: Option<PathBuf>,
    pub metrics_dump_path: Option<PathBuf>,
}

/// Validated `run` configuration.
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub source: SourceConfig,
    pub fov: f64,
    pub calibration: Option<CameraCalibration>,
    pub pipelines: Vec<PipelineSettings>,
    pub default_index: i32,
    pub driver_mode: bool,
    pub max_frames: Option<u64>,
    pub output_queue: usize,
    pub max_restarts: u32,
    pub stdin_control: bool,
    pub save_output: Option<PathBuf>,
    pub telemetry: TelemetryOptions,
}

impl TryFrom<RunArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: RunArgs) -> Result<Self> {
        let source = match (args.image, args.camera) {
            (Some(path), None) => SourceConfig::Image(path),
            (None, Some(uri)) => {
                if !cfg!(feature = "with-opencv") {
                    bail!("--camera requires a build with the with-opencv feature");
                }
                if args.width == 0 || args.height == 0 {
                    bail!("--width and --height must be positive");
                }
                SourceConfig::Camera {
                    uri,
                    width: args.width,
                    height: args.height,
                }
            }
            (None, None) => bail!("provide a frame source with --image <path> or --camera <uri>"),
            (Some(_), Some(_)) => bail!("--image and --camera are mutually exclusive"),
        };

        if !(args.fov > 0.0 && args.fov < 180.0) {
            bail!("--fov must be between 0 and 180 degrees, got {}", args.fov);
        }
        if args.output_queue == 0 {
            bail!("--output-queue must be at least 1");
        }
        if args.max_frames == Some(0) {
            bail!("--max-frames must be at least 1");
        }

        let calibration = args
            .calibration
            .as_ref()
            .map(|path| {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read calibration {}", path.display()))?;
                CameraCalibration::from_json_str(&text)
                    .with_context(|| format!("invalid calibration {}", path.display()))
            })
            .transpose()?;

        let mut pipelines = match args.settings.as_ref() {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("failed to read settings {}", path.display()))?;
                serde_json::from_str::<Vec<PipelineSettings>>(&text)
                    .with_context(|| format!("invalid settings {}", path.display()))?
            }
            None => pipelines_from_kinds(&args.pipeline)?,
        };
        if pipelines.is_empty() {
            bail!("at least one pipeline is required");
        }

        let hsv = args.hsv.as_deref().map(parse_hsv).transpose()?;
        for (index, settings) in pipelines.iter_mut().enumerate() {
            settings.base.pipeline_index = index as i32;
            if args.solve_pnp {
                settings.base.solve_pnp_enabled = true;
            }
            if let Some(hsv) = hsv {
                settings.base.hsv = hsv;
            }
        }

        if args.index < 0 || args.index as usize >= pipelines.len() {
            bail!(
                "--index {} is out of range for {} pipeline(s)",
                args.index,
                pipelines.len()
            );
        }

        Ok(Self {
            source,
            fov: args.fov,
            calibration,
            pipelines,
            default_index: args.index,
            driver_mode: args.driver_mode,
            max_frames: args.max_frames,
            output_queue: args.output_queue,
            max_restarts: args.max_restarts,
            stdin_control: args.stdin_control,
            save_output: args.save_output,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_dump_path: args.metrics_dump,
            },
        })
    }
}

fn pipelines_from_kinds(kinds: &[String]) -> Result<Vec<PipelineSettings>> {
    if kinds.is_empty() {
        return Ok(vec![PipelineSettings::new(PipelineType::Reflective, "Reflective")]);
    }
    kinds
        .iter()
        .map(|text| {
            let kind = PipelineType::parse(text)
                .ok_or_else(|| anyhow!("unknown pipeline kind {text:?}"))?;
            if !kind.is_user_type() {
                bail!("{} is built in and cannot be listed with --pipeline", kind.label());
            }
            Ok(PipelineSettings::new(kind, kind.label()))
        })
        .collect()
}

pub(crate) fn parse_hsv(text: &str) -> Result<HsvThreshold> {
    let values = text
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u8>()
                .with_context(|| format!("invalid HSV component {part:?}"))
        })
        .collect::<Result<Vec<u8>>>()?;
    let [h0, h1, s0, s1, v0, v1] = values[..] else {
        bail!("HSV window needs six comma-separated values, got {}", values.len());
    };
    if h0 > 180 || h1 > 180 {
        bail!("hue bounds must be at most 180");
    }
    Ok(HsvThreshold {
        hue: (h0, h1),
        saturation: (s0, s1),
        value: (v0, v1),
        hue_inverted: false,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        args: RunArgs,
    }

    fn parse(args: &[&str]) -> Result<RunConfig> {
        let argv = std::iter::once("run").chain(args.iter().copied());
        RunConfig::try_from(Harness::try_parse_from(argv)?.args)
    }

    #[test]
    fn image_source_defaults_to_one_reflective_pipeline() {
        let config = parse(&["--image", "frame.png"]).unwrap();
        assert_eq!(config.source, SourceConfig::Image("frame.png".into()));
        assert_eq!(config.pipelines.len(), 1);
        assert_eq!(config.pipelines[0].pipeline_type(), PipelineType::Reflective);
        assert_eq!(config.default_index, 0);
        assert_eq!(config.output_queue, 4);
    }

    #[test]
    fn pipeline_kinds_get_dense_indices() {
        let config = parse(&[
            "--image", "frame.png", "-p", "apriltag", "-p", "3", "--index", "1", "--solve-pnp",
        ])
        .unwrap();
        let kinds: Vec<_> = config.pipelines.iter().map(|p| p.pipeline_type()).collect();
        assert_eq!(kinds, vec![PipelineType::AprilTag, PipelineType::Aruco]);
        assert_eq!(config.pipelines[1].index(), 1);
        assert!(config.pipelines.iter().all(|p| p.base.solve_pnp_enabled));
        assert_eq!(config.default_index, 1);
    }

    #[test]
    fn rejects_missing_source_and_bad_ranges() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--image", "a.png", "--fov", "180"]).is_err());
        assert!(parse(&["--image", "a.png", "--output-queue", "0"]).is_err());
        assert!(parse(&["--image", "a.png", "--max-frames", "0"]).is_err());
        assert!(parse(&["--image", "a.png", "--index", "1"]).is_err());
        assert!(parse(&["--image", "a.png", "-p", "driver_mode"]).is_err());
        assert!(parse(&["--image", "a.png", "-p", "lidar"]).is_err());
    }

    #[test]
    fn hsv_window_applies_to_every_pipeline() {
        let config = parse(&["--image", "a.png", "--hsv", "10,40,100,255,90,255"]).unwrap();
        let hsv = config.pipelines[0].base.hsv;
        assert_eq!(hsv.hue, (10, 40));
        assert_eq!(hsv.saturation, (100, 255));
        assert_eq!(hsv.value, (90, 255));
        assert!(parse_hsv("1,2,3").is_err());
        assert!(parse_hsv("0,200,0,255,0,255").is_err());
    }

    #[test]
    fn settings_file_replaces_pipeline_kinds() {
        let mut tags = PipelineSettings::new(PipelineType::AprilTag, "tags");
        tags.base.pipeline_index = 7;
        let shapes = PipelineSettings::new(PipelineType::ColoredShape, "balls");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&vec![tags, shapes]).unwrap()).unwrap();

        let path = file.path().to_str().unwrap();
        let config = parse(&["--image", "a.png", "--settings", path]).unwrap();
        assert_eq!(config.pipelines.len(), 2);
        assert_eq!(config.pipelines[0].nickname(), "tags");
        assert_eq!(config.pipelines[0].index(), 0);
        assert_eq!(config.pipelines[1].pipeline_type(), PipelineType::ColoredShape);
    }

    #[test]
    fn calibration_file_is_loaded() {
        let calibration = CameraCalibration {
            resolution: (640, 480),
            camera_intrinsics: [500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0],
            dist_coeffs: vec![0.1, -0.05, 0.0, 0.0, 0.0],
            reprojection_error: Some(0.3),
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&calibration).unwrap()).unwrap();

        let path = file.path().to_str().unwrap();
        let config = parse(&["--image", "a.png", "--calibration", path]).unwrap();
        assert_eq!(config.calibration, Some(calibration));
    }
}
