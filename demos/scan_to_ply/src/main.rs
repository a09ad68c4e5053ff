use argh::FromArgs;
use std::path::PathBuf;

use facescan::k3d::{
    camera::Calibration,
    frame::{ChannelOrder, ColorFrame, DepthFrame, ImageSize},
};
use facescan::{
    CaptureAccumulator, HeadPose, Landmark, MultiViewRegistrar, PoseMetadata, ScanConfig,
};

#[derive(FromArgs)]
/// Reconstruct a face from raw depth and color captures and export the merged point cloud
struct Args {
    /// path to the calibration JSON document
    #[argh(option)]
    calibration: PathBuf,

    /// raw little-endian f32 depth map in millimeters, once per view
    #[argh(option)]
    depth: Vec<PathBuf>,

    /// raw BGRA8 color frame, once per view
    #[argh(option)]
    color: Vec<PathBuf>,

    /// head yaw in degrees, once per view
    #[argh(option)]
    yaw: Vec<f64>,

    /// width of the depth maps
    #[argh(option)]
    width: usize,

    /// height of the depth maps
    #[argh(option)]
    height: usize,

    /// width of the color frames, defaults to the depth width
    #[argh(option)]
    color_width: Option<usize>,

    /// height of the color frames, defaults to the depth height
    #[argh(option)]
    color_height: Option<usize>,

    /// JSON array with the landmark list of every view
    #[argh(option)]
    landmarks: Option<PathBuf>,

    /// scan configuration JSON
    #[argh(option)]
    config: Option<PathBuf>,

    /// correct lens distortion with the calibration lookup table
    #[argh(switch)]
    undistort: bool,

    /// path of the merged PLY file
    #[argh(option, default = "PathBuf::from(\"merged.ply\")")]
    output: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    let num_views = args.depth.len();
    if args.color.len() != num_views || args.yaw.len() != num_views {
        return Err(format!(
            "got {} depth maps, {} color frames and {} yaws",
            num_views,
            args.color.len(),
            args.yaw.len()
        )
        .into());
    }

    let config = match &args.config {
        Some(path) => ScanConfig::from_json_file(path)?,
        None => ScanConfig::default(),
    };

    let depth_size = ImageSize {
        width: args.width,
        height: args.height,
    };
    let color_size = ImageSize {
        width: args.color_width.unwrap_or(args.width),
        height: args.color_height.unwrap_or(args.height),
    };

    let calibration = Calibration::from_json_file(&args.calibration)?;
    let intrinsics = calibration.intrinsics_for_width(depth_size.width)?;
    let undistortion = if args.undistort {
        calibration.undistortion_map(depth_size)?
    } else {
        None
    };
    if args.undistort && undistortion.is_none() {
        log::warn!("the calibration has no inverse distortion lookup, frames are used as is");
    }

    let mut landmarks: Vec<Vec<Landmark>> = match &args.landmarks {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => Vec::new(),
    };
    landmarks.resize(num_views, Vec::new());

    let accumulator = CaptureAccumulator::new();
    for (i, view_landmarks) in landmarks.into_iter().enumerate() {
        let depth = DepthFrame::from_le_bytes(depth_size, &std::fs::read(&args.depth[i])?)?;
        let color = ColorFrame::from_bytes(
            color_size,
            &std::fs::read(&args.color[i])?,
            ChannelOrder::Bgra,
        )?;

        let (depth, color) = match &undistortion {
            Some(map) => (
                map.remap_depth(&depth)?,
                map.remap_color(&color.resize_nearest(depth_size)?)?,
            ),
            None => (depth, color),
        };

        let metadata =
            PoseMetadata::new(HeadPose::from_yaw(args.yaw[i])).with_landmarks(view_landmarks);
        let capture =
            accumulator.add_frame(&depth, &color, &intrinsics, &config.depth_range, metadata)?;
        println!("View #{}: {} points", capture.index(), capture.points().len());
    }

    let session = accumulator.freeze();
    let registrar = MultiViewRegistrar::new(config.registrar.clone());
    let outcome = registrar.register_all(&session)?;

    for edge in outcome.edges.iter() {
        println!(
            "Edge {} -> {} ({:?}): {:?}",
            edge.source, edge.target, edge.kind, edge.status
        );
    }
    if let Some(warning) = &outcome.warning {
        println!("Warning: {warning}");
    }

    outcome.merged.write_ply(&args.output)?;
    println!(
        "Merged cloud: #{} points written to {}",
        outcome.merged.len(),
        args.output.display()
    );

    Ok(())
}
