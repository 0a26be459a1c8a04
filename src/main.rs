use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array2, Array3};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use map_nav_rs::pipeline::{
    log_skip, CycleInputs, CycleSkip, EstimatorConfig, PoseEstimator, PositionFix, PreparedCycle,
};
use map_nav_rs::solver::PoseSolverClient;
use map_nav_rs::types::{
    CameraGeoPose, CameraIntrinsics, GeoTransform, GroundTrackElevation, QueryImage, Quat,
    RasterStack, RawPoseEstimate,
};

#[derive(Parser, Debug)]
#[command(name = "map_nav")]
#[command(about = "Visual geolocation - match camera frames against a reference raster", long_about = None)]
struct Args {
    /// Number of camera frames to process (0 = continuous)
    #[arg(value_name = "FRAMES", default_value = "60")]
    frames: u64,

    /// Frame interval in milliseconds
    #[arg(long, default_value = "200")]
    interval_ms: u64,

    /// Pose solver endpoint URL
    #[arg(long, default_value = "http://localhost:8090/predictions/loftr")]
    endpoint: String,

    /// Pose solver timeout in seconds
    #[arg(long, default_value = "10")]
    solver_timeout: u64,

    /// Max camera pitch from nadir in degrees
    #[arg(long, default_value = "30.0")]
    max_pitch: f64,

    /// Min altitude AGL in meters for matching
    #[arg(long, default_value = "80.0")]
    min_altitude: f64,

    /// Smoother priming window length
    #[arg(long, default_value = "20")]
    window: usize,

    /// Use a built-in solver stub instead of the HTTP endpoint
    #[arg(long)]
    mock_solver: bool,

    /// Write published fixes to this JSON file on exit
    #[arg(long)]
    output: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[{}] map_nav starting", ts_now());
    println!("  Frames: {} (0=continuous)", args.frames);
    println!("  Solver: {}", if args.mock_solver { "mock" } else { &args.endpoint });
    println!("  Window: {}", args.window);

    let config = EstimatorConfig {
        max_pitch_deg: args.max_pitch,
        min_match_altitude_m: args.min_altitude,
        smoother_window: args.window,
        solver_endpoint: args.endpoint.clone(),
        solver_timeout_secs: args.solver_timeout,
        ..EstimatorConfig::default()
    };
    let mut estimator = PoseEstimator::new(config.clone());
    let client = PoseSolverClient::new(&config.solver_endpoint, config.solver_timeout_secs);

    // Latest-frame channel: a newer frame replaces a pending one instead of
    // queueing behind an in-flight solver call.
    let (frame_tx, mut frame_rx) = watch::channel::<Option<(u64, CycleInputs)>>(None);

    let frames = args.frames;
    let interval = Duration::from_millis(args.interval_ms.max(1));
    let producer = tokio::spawn(async move {
        let raster = Arc::new(demo_raster());
        let mut generation: u64 = 0;
        while frames == 0 || generation < frames {
            generation += 1;
            let inputs = demo_frame(&raster, generation);
            if frame_tx.send(Some((generation, inputs))).is_err() {
                break;
            }
            sleep(interval).await;
        }
    });

    let mut fixes: Vec<PositionFix> = Vec::new();
    let mut cycles = 0u64;
    let mut skips = 0u64;
    let mut discarded = 0u64;

    while frame_rx.changed().await.is_ok() {
        let (generation, inputs) = match frame_rx.borrow_and_update().clone() {
            Some(frame) => frame,
            None => continue,
        };
        cycles += 1;

        let prepared = match estimator.prepare(&inputs) {
            Ok(p) => p,
            Err(skip) => {
                skips += 1;
                log_skip(&skip);
                continue;
            }
        };

        let solved: Result<RawPoseEstimate, CycleSkip> = if args.mock_solver {
            Ok(mock_solve(&prepared, generation))
        } else {
            client
                .solve(&prepared.query, &prepared.aligned)
                .await
                .map_err(CycleSkip::from)
        };

        // The solver round trip may have been overtaken by a newer frame;
        // its result must not flow into post-processing.
        if frame_rx.has_changed().unwrap_or(false) {
            discarded += 1;
            log::debug!("discarding solver result for superseded frame {}", generation);
            continue;
        }

        let raw = match solved {
            Ok(raw) => raw,
            Err(skip) => {
                skips += 1;
                log_skip(&skip);
                continue;
            }
        };

        match estimator.complete(&prepared.context, &prepared.transform, &raw) {
            Ok(Some(fix)) => {
                println!(
                    "[{}] fix lat={:.6} lon={:.6} amsl={:.1}m agl={:.1}m sd=({:.1},{:.1},{:.1})m",
                    ts_now(),
                    fix.latitude,
                    fix.longitude,
                    fix.altitude_amsl,
                    fix.altitude_agl,
                    fix.sd_east_m,
                    fix.sd_north_m,
                    fix.sd_up_m
                );
                fixes.push(fix);
            }
            Ok(None) => log::debug!("smoother priming, frame {} buffered", generation),
            Err(skip) => {
                skips += 1;
                log_skip(&skip);
            }
        }
    }

    producer.await?;

    println!(
        "[{}] done: {} cycles, {} fixes, {} skips, {} superseded",
        ts_now(),
        cycles,
        fixes.len(),
        skips,
        discarded
    );

    if let Some(path) = args.output {
        std::fs::write(&path, serde_json::to_string_pretty(&fixes)?)?;
        println!("  Fixes written to {}", path);
    }

    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S%.3f").to_string()
}

// ─── Demo world ──────────────────────────────────────────────────────────────
//
// A synthetic reference raster and descent trajectory so the pipeline can be
// exercised end-to-end without upstream raster and telemetry services.

const DEMO_SIZE: usize = 512;
const DEMO_GROUND_AMSL: f64 = 20.0;

fn demo_raster() -> RasterStack {
    let data = Array3::from_shape_fn((DEMO_SIZE, DEMO_SIZE, 3), |(r, c, ch)| match ch {
        0 => (((r / 16) + (c / 16)) % 2 * 180 + 40) as u8,
        1 => DEMO_GROUND_AMSL as u8,
        _ => 0,
    });
    RasterStack::new(
        data,
        GeoTransform::new(60.0, 24.0, -1e-5, 1e-5),
        "EPSG:4326".to_string(),
    )
}

fn demo_frame(raster: &Arc<RasterStack>, generation: u64) -> CycleInputs {
    let t = generation as f64;
    // Slow descent over the raster center with a gentle drift east
    let altitude_agl = (250.0 - t).max(120.0);
    let (lat, lon) = raster.geotransform.pixel_to_geo(256.0, 256.0 + t * 0.1);

    // Nadir-pointing camera
    let half = std::f64::consts::FRAC_1_SQRT_2;
    let orientation = Quat {
        w: half,
        x: 0.0,
        y: half,
        z: 0.0,
    };

    CycleInputs {
        timestamp: t,
        raster: Some(Arc::clone(raster)),
        query: Some(QueryImage {
            data: Array2::zeros((256, 256)),
            timestamp: t,
        }),
        intrinsics: Some(CameraIntrinsics {
            width: 256,
            height: 256,
            fx: 400.0,
            fy: 400.0,
            cx: 128.0,
            cy: 128.0,
        }),
        camera_geopose: Some(CameraGeoPose {
            timestamp: t,
            latitude: lat,
            longitude: lon,
            altitude_amsl: altitude_agl + DEMO_GROUND_AMSL,
            orientation,
        }),
        altitude_agl,
        ground_track: Some(GroundTrackElevation {
            timestamp: t,
            amsl: DEMO_GROUND_AMSL,
        }),
    }
}

/// Solver stub: the camera hovers over the aligned crop center at the
/// telemetry altitude, with a deterministic wobble so the smoother has
/// something to do.
fn mock_solve(prepared: &PreparedCycle, generation: u64) -> RawPoseEstimate {
    let h = prepared.aligned.shape()[0] as f64;
    let w = prepared.aligned.shape()[1] as f64;
    let wobble = ((generation * 37) % 11) as f64 / 2.0 - 2.5;
    RawPoseEstimate {
        rotation: Matrix3::identity(),
        translation: Vector3::new(
            -(w / 2.0 + wobble),
            -(h / 2.0 - wobble),
            prepared.context.camera_geopose.altitude_amsl - prepared.context.ground_track.amsl,
        ),
    }
}
