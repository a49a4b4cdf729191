//! Session supervisor: wires a frame provider to the vision runner, drains its outputs, applies
//! control commands and restarts the session when capture fails.

use std::{
    io,
    path::Path,
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, select};
use tracing::{debug, error, info, warn};
use video_ingest::{FileFrameProvider, FrameImage, FrameProvider, FrameStaticProperties};
use vision::{
    ConfigEvent, ConfigSnapshot, PipelineManager, PipelineOutput, PipelineSettings,
    VisionBackend, VisionError, VisionRunner,
};

use crate::{
    config::{RunConfig, SourceConfig},
    control::{self, ControlCommand},
    telemetry,
};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Run the vision session, restarting after capture failures until `max_restarts` is spent.
pub fn run(config: RunConfig) -> Result<()> {
    static CTRL_HANDLER: Once = Once::new();

    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry);
    let backend = backend()?;
    info!(backend = backend.name(), "vision backend ready");
    if let Err(err) = telemetry::init_metrics_recorder() {
        warn!("metrics disabled: {err:#}");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            handler_shutdown.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });

    let commands = if config.stdin_control {
        let (tx, rx) = crossbeam_channel::unbounded();
        telemetry::spawn_thread("stdin-control", move || {
            control::read_commands(io::stdin().lock(), tx)
        })
        .context("failed to spawn stdin control thread")?;
        info!("{}", control::HELP);
        Some(rx)
    } else {
        None
    };

    let mut session = SessionState {
        pipelines: config.pipelines.clone(),
        index: config.default_index,
        driver_mode: config.driver_mode,
    };
    let mut attempt: u32 = 0;
    let mut outcome = Ok(());
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        match run_session(
            &config,
            &backend,
            &mut session,
            commands.as_ref(),
            &shutdown,
            attempt,
        ) {
            Ok(SessionOutcome::Graceful) => break,
            Ok(SessionOutcome::Restart(reason)) => {
                attempt = attempt.saturating_add(1);
                if attempt > config.max_restarts {
                    outcome = Err(anyhow!("giving up after {} restarts ({reason})", config.max_restarts));
                    break;
                }
                warn!("Vision session restarting (reason: {reason}), attempt #{attempt}");
                thread::sleep(Duration::from_secs(1));
            }
            Err(err) => {
                error!("Vision session error: {err:?}");
                outcome = Err(err);
                break;
            }
        }
    }

    if let Some(path) = config.telemetry.metrics_dump_path.as_ref() {
        match telemetry::write_metrics_dump(path) {
            Ok(()) => info!(path = %path.display(), "metrics written"),
            Err(err) => warn!("{err:#}"),
        }
    }
    outcome
}

/// Settings carried from one session attempt into the next.
#[derive(Clone, Debug)]
struct SessionState {
    pipelines: Vec<PipelineSettings>,
    index: i32,
    driver_mode: bool,
}

impl SessionState {
    fn update(&mut self, snapshot: ConfigSnapshot) {
        self.pipelines = snapshot.pipelines;
        if snapshot.current_index >= 0 {
            self.index = snapshot.current_index;
        }
        self.driver_mode = snapshot.driver_mode;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SessionOutcome {
    Graceful,
    Restart(&'static str),
}

fn run_session(
    config: &RunConfig,
    backend: &Arc<dyn VisionBackend>,
    session: &mut SessionState,
    commands: Option<&Receiver<ControlCommand>>,
    shutdown: &Arc<AtomicBool>,
    attempt: u32,
) -> Result<SessionOutcome> {
    let (provider, props) = match open_provider(config) {
        Ok(opened) => opened,
        Err(err) if matches!(config.source, SourceConfig::Camera { .. }) => {
            warn!("failed to open camera: {err:#}");
            return Ok(SessionOutcome::Restart("open"));
        }
        Err(err) => return Err(err),
    };

    let mut manager = PipelineManager::new(
        session.pipelines.clone(),
        session.index,
        Arc::clone(backend),
    );
    if session.driver_mode {
        manager.set_driver_mode(true);
    }
    let control = manager.control(Arc::clone(&props));
    let events = control.subscribe();
    let mut latest = manager.snapshot();

    let session_span = tracing::info_span!(
        "vision.session",
        provider = provider.name(),
        width = props.image_width,
        height = props.image_height,
        calibrated = props.calibration.is_some(),
        pipelines = latest.pipelines.len(),
        attempt
    );
    let _session_guard = session_span.enter();

    let (results_tx, results) = crossbeam_channel::bounded(config.output_queue);
    let runner_shutdown = Arc::clone(shutdown);
    let max_frames = config.max_frames;
    let runner = telemetry::spawn_thread("vision-runner", move || {
        let mut runner = VisionRunner::new(provider, manager, results_tx, runner_shutdown);
        let result = runner.run(max_frames);
        (result, runner.manager().snapshot())
    })
    .context("failed to spawn vision runner thread")?;

    let mut stdin_open = commands.is_some();
    let mut report = OutputReport::new(config.save_output.is_some());
    loop {
        let commands = match commands {
            Some(rx) if stdin_open => rx.clone(),
            _ => crossbeam_channel::never(),
        };
        select! {
            recv(results) -> output => match output {
                Ok(output) => report.record(output),
                Err(_) => break,
            },
            recv(events) -> event => match event {
                Ok(ConfigEvent::FullSettings(snapshot)) => latest = *snapshot,
                Ok(ConfigEvent::CalibrationComplete(calibration)) => {
                    info!(
                        fx = calibration.fx(),
                        fy = calibration.fy(),
                        reprojection_error = ?calibration.reprojection_error,
                        "calibration complete"
                    );
                    match serde_json::to_string(&calibration) {
                        Ok(json) => info!("{json}"),
                        Err(err) => warn!(%err, "failed to serialise calibration"),
                    }
                }
                Err(_) => {}
            },
            recv(commands) -> command => match command {
                Ok(ControlCommand::Quit) => {
                    info!("quit requested");
                    shutdown.store(true, Ordering::SeqCst);
                }
                Ok(command) => {
                    if let Err(err) = command.apply(&control, &latest) {
                        warn!("{err:#}");
                    }
                }
                Err(_) => stdin_open = false,
            },
        }
    }

    let (result, snapshot) = runner
        .join()
        .map_err(|_| anyhow!("vision runner thread panicked"))?;
    session.update(snapshot);

    if let Some(path) = config.save_output.as_ref() {
        match report.last_image.as_ref() {
            Some(image) => save_image(image, path)?,
            None => warn!(path = %path.display(), "no output frame to save"),
        }
    }

    match result {
        Ok(frames) => {
            info!(frames, published = report.frames, "vision session finished");
            Ok(SessionOutcome::Graceful)
        }
        Err(VisionError::Capture(err)) if !shutdown.load(Ordering::SeqCst) => {
            warn!("capture failed: {err}");
            Ok(SessionOutcome::Restart("capture"))
        }
        Err(VisionError::Capture(_)) => Ok(SessionOutcome::Graceful),
        Err(err) => Err(err).context("vision pipeline failed"),
    }
}

fn open_provider(
    config: &RunConfig,
) -> Result<(Box<dyn FrameProvider>, Arc<FrameStaticProperties>)> {
    match &config.source {
        SourceConfig::Image(path) => {
            let provider = FileFrameProvider::open(path, config.fov, config.calibration.clone())
                .with_context(|| format!("failed to open image {}", path.display()))?;
            let props = Arc::clone(provider.static_properties());
            Ok((Box::new(provider), props))
        }
        #[cfg(feature = "with-opencv")]
        SourceConfig::Camera { uri, width, height } => {
            let provider = video_ingest::CameraFrameProvider::open(
                uri,
                (*width, *height),
                config.fov,
                config.calibration.clone(),
            )
            .with_context(|| format!("failed to open camera {uri}"))?;
            let props = Arc::new(FrameStaticProperties::new(
                *width,
                *height,
                config.fov,
                config.calibration.clone(),
            ));
            Ok((Box::new(provider), props))
        }
        #[cfg(not(feature = "with-opencv"))]
        SourceConfig::Camera { .. } => bail!("camera sources require the with-opencv feature"),
    }
}

fn backend() -> Result<Arc<dyn VisionBackend>> {
    #[cfg(feature = "with-opencv")]
    {
        Ok(Arc::new(vision::OpenCvBackend))
    }
    #[cfg(not(feature = "with-opencv"))]
    {
        bail!("this build has no vision backend; rebuild with `--features with-opencv`")
    }
}

/// Per-session output accounting with a once-a-second summary line.
struct OutputReport {
    frames: u64,
    keep_image: bool,
    last_image: Option<FrameImage>,
    last_report: Instant,
}

impl OutputReport {
    fn new(keep_image: bool) -> Self {
        Self {
            frames: 0,
            keep_image,
            last_image: None,
            last_report: Instant::now(),
        }
    }

    fn record(&mut self, output: PipelineOutput) {
        self.frames += 1;
        debug!(
            sequence_id = output.sequence_id,
            pipeline = output.pipeline_type.label(),
            targets = output.targets.len(),
            latency_ms = output.processing_nanos as f64 / 1e6,
            "frame processed"
        );
        if self.last_report.elapsed() >= REPORT_INTERVAL {
            self.last_report = Instant::now();
            match output.targets.first() {
                Some(best) => info!(
                    index = output.pipeline_index,
                    pipeline = output.pipeline_type.label(),
                    fps = output.fps,
                    targets = output.targets.len(),
                    yaw = best.yaw,
                    pitch = best.pitch,
                    area = best.area,
                    "tracking"
                ),
                None => info!(
                    index = output.pipeline_index,
                    pipeline = output.pipeline_type.label(),
                    fps = output.fps,
                    "no targets"
                ),
            }
        }
        if self.keep_image {
            self.last_image = Some(output.output);
        }
    }
}

fn save_image(image: &FrameImage, path: &Path) -> Result<()> {
    let saved = match image {
        FrameImage::Gray(gray) => gray.save(path),
        FrameImage::Rgb(rgb) => rgb.save(path),
        FrameImage::Empty => bail!("output frame is empty"),
    };
    saved.with_context(|| format!("failed to save output frame {}", path.display()))?;
    info!(path = %path.display(), "output frame saved");
    Ok(())
}
