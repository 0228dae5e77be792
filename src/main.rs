use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use vigil::analytics::detector::MotionAnalyzer;
use vigil::analytics::{FrameDiffMotion, HttpObjectDetector, PostProcessorDispatch, Supervisor};
use vigil::broker::Publisher;
use vigil::camera::FfmpegSource;
use vigil::cleanup::{RetentionSweeper, SegmentCleanup};
use vigil::config::Config;
use vigil::frame::Point;
use vigil::recorder::{FfmpegMuxer, Recorder};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;
    init_tracing(&config)?;
    tracing::info!(camera = %config.camera.name, "configuration loaded");

    let config = Arc::new(config);

    // A dead transport is fatal at startup
    let source = Arc::new(FfmpegSource::connect(&config.camera)?);

    let detection_lock = Arc::new(tokio::sync::Mutex::new(()));
    let detector = Arc::new(HttpObjectDetector::new(
        &config.object_detection,
        Arc::clone(&detection_lock),
    )?);

    let motion_analyzer: Option<Arc<dyn MotionAnalyzer>> = if config.motion_detection.enabled() {
        Some(Arc::new(FrameDiffMotion::new(motion_mask(&config))))
    } else {
        None
    };

    let (publisher, mut publish_rx) = Publisher::channel();
    // The broker client drains this queue; until one is attached the
    // items are only traced.
    tokio::spawn(async move {
        while let Some(item) = publish_rx.recv().await {
            tracing::trace!(topic = %item.topic, bytes = item.payload.len(), "broker publish");
        }
    });

    let (post_processors, mut post_rx) = PostProcessorDispatch::channel();
    tokio::spawn(async move {
        while let Some(item) = post_rx.recv().await {
            tracing::trace!(
                post_processor = %item.name,
                label = %item.object.label,
                "post processor dispatch"
            );
        }
    });

    let shutdown = Arc::new(AtomicBool::new(false));

    tokio::spawn(RetentionSweeper::new(&config.recorder).run(Arc::clone(&shutdown)));

    let (segment_cleanup, cleanup_handle) =
        SegmentCleanup::new(&config.recorder, &config.camera.name);
    tokio::spawn(segment_cleanup.run(Arc::clone(&shutdown)));

    let recorder = Recorder::new(
        &config.recorder,
        &config.camera.name,
        &config.camera.name_slug(),
        Arc::new(FfmpegMuxer::new()),
        Arc::clone(&detection_lock),
        cleanup_handle,
    );

    let (supervisor, handle) = Supervisor::new(
        Arc::clone(&config),
        source,
        detector,
        motion_analyzer,
        recorder,
        publisher,
        post_processors,
        Arc::clone(&shutdown),
    );
    let supervisor_task = tokio::spawn(supervisor.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    handle.stop();
    let _ = supervisor_task.await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Motion mask polygons scaled from camera to motion-analysis coordinates.
fn motion_mask(config: &Config) -> Vec<Vec<Point>> {
    let sx = config.motion_detection.width as f32 / config.camera.width.max(1) as f32;
    let sy = config.motion_detection.height as f32 / config.camera.height.max(1) as f32;

    config
        .motion_detection
        .mask
        .iter()
        .map(|polygon| {
            polygon
                .iter()
                .map(|p| Point::new((p.x as f32 * sx) as i32, (p.y as f32 * sy) as i32))
                .collect()
        })
        .collect()
}

fn init_tracing(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let mut filter = EnvFilter::from_default_env().add_directive("vigil=info".parse()?);

    if let Some(logging) = &config.camera.logging {
        filter = filter.add_directive(format!("vigil={}", logging.level).parse()?);
    }
    if let Some(logging) = &config.object_detection.logging {
        filter = filter.add_directive(format!("vigil::analytics::object={}", logging.level).parse()?);
    }
    if let Some(logging) = &config.motion_detection.logging {
        filter = filter.add_directive(format!("vigil::analytics::motion={}", logging.level).parse()?);
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}
