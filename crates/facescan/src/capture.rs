use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glam::DMat3;
use serde::{Deserialize, Serialize};

use facescan_3d::{
    camera::CameraIntrinsics,
    frame::{ColorFrame, DepthFrame, FrameError},
    pointcloud::PointCloud,
    unproject::{lift_landmarks, unproject_frame, DepthRange},
};

use crate::error::CaptureError;

/// Identity of an anchor landmark, shared across views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkId {
    /// Center of the left eye.
    LeftEye,
    /// Center of the right eye.
    RightEye,
    /// Tip of the nose.
    NoseTip,
    /// Bottom of the chin.
    Chin,
    /// Left corner of the mouth.
    MouthLeft,
    /// Right corner of the mouth.
    MouthRight,
    /// Any other landmark, numbered by the detector.
    Custom(u32),
}

/// A detected landmark in one view.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    /// Which landmark this is.
    pub id: LandmarkId,
    /// Position in depth pixel coordinates.
    pub image: [f64; 2],
    /// Position in camera space in millimeters, `None` until lifted or when the depth under
    /// the landmark is invalid.
    #[serde(default)]
    pub position: Option<[f64; 3]>,
}

/// Head orientation at capture time, in degrees.
///
/// Yaw is the rotation of the head about the camera's vertical (Y) axis, right handed.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadPose {
    /// Rotation about the camera Y axis.
    pub yaw: f64,
    /// Rotation about the camera X axis.
    pub pitch: f64,
    /// Rotation about the camera Z axis.
    pub roll: f64,
}

impl HeadPose {
    /// A head pose with only a yaw.
    pub fn from_yaw(yaw: f64) -> Self {
        Self {
            yaw,
            ..Default::default()
        }
    }

    /// The head rotation in camera space, yaw applied last.
    pub fn rotation(&self) -> DMat3 {
        DMat3::from_rotation_y(self.yaw.to_radians())
            * DMat3::from_rotation_x(self.pitch.to_radians())
            * DMat3::from_rotation_z(self.roll.to_radians())
    }
}

/// Capture time metadata of a view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseMetadata {
    /// Head orientation.
    pub head_pose: HeadPose,
    /// Detected anchor landmarks.
    pub landmarks: Vec<Landmark>,
}

impl PoseMetadata {
    /// Metadata with a head pose and no landmarks.
    pub fn new(head_pose: HeadPose) -> Self {
        Self {
            head_pose,
            landmarks: Vec::new(),
        }
    }

    /// Attach landmarks.
    pub fn with_landmarks(mut self, landmarks: Vec<Landmark>) -> Self {
        self.landmarks = landmarks;
        self
    }

    /// Fill the camera space position of every landmark from the depth under it.
    ///
    /// Landmarks over invalid depth get `None`.
    pub fn lift_landmarks(
        &mut self,
        depth: &DepthFrame,
        intrinsics: &CameraIntrinsics,
        range: &DepthRange,
    ) {
        let image_points = self.landmarks.iter().map(|l| l.image).collect::<Vec<_>>();
        let lifted = lift_landmarks(&image_points, depth, intrinsics, range);
        for (landmark, position) in self.landmarks.iter_mut().zip(lifted) {
            landmark.position = position;
        }
    }

    /// The camera space position of a landmark, if detected and lifted.
    pub fn landmark_position(&self, id: LandmarkId) -> Option<[f64; 3]> {
        self.landmarks
            .iter()
            .find(|l| l.id == id)
            .and_then(|l| l.position)
    }
}

/// One accepted frame of a scanning session. Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewCapture {
    index: usize,
    points: PointCloud,
    metadata: PoseMetadata,
}

impl ViewCapture {
    /// Position of the view in the session, in capture order.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The view's points in its own camera frame.
    pub fn points(&self) -> &PointCloud {
        &self.points
    }

    /// The capture time metadata.
    pub fn metadata(&self) -> &PoseMetadata {
        &self.metadata
    }

    /// The head yaw in degrees.
    pub fn yaw(&self) -> f64 {
        self.metadata.head_pose.yaw
    }
}

/// A read-only snapshot of the captures of a session, in capture order.
///
/// Cloning is cheap: the captures themselves are shared.
#[derive(Debug, Clone, Default)]
pub struct CaptureSession {
    views: Vec<Arc<ViewCapture>>,
}

impl CaptureSession {
    /// Build a session directly from point clouds and metadata, indexed in order.
    pub fn from_views(views: impl IntoIterator<Item = (PointCloud, PoseMetadata)>) -> Self {
        let views = views
            .into_iter()
            .enumerate()
            .map(|(index, (points, metadata))| {
                Arc::new(ViewCapture {
                    index,
                    points,
                    metadata,
                })
            })
            .collect();
        Self { views }
    }

    /// Number of views.
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Whether the session holds no view.
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// The view with capture index `index`.
    pub fn get(&self, index: usize) -> Option<&ViewCapture> {
        self.views.get(index).map(|v| v.as_ref())
    }

    /// The views in capture order.
    pub fn views(&self) -> &[Arc<ViewCapture>] {
        &self.views
    }

    /// Total number of points over all views.
    pub fn num_points(&self) -> usize {
        self.views.iter().map(|v| v.points.len()).sum()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    views: Vec<Arc<ViewCapture>>,
    frozen: bool,
}

/// The single owner of a scanning session's captures.
///
/// Captures may be added from any thread; appends are serialized by an internal lock so
/// two appends never interleave. Once [`CaptureAccumulator::freeze`] is called the session
/// is read only until [`CaptureAccumulator::reset`].
#[derive(Debug, Default)]
pub struct CaptureAccumulator {
    state: Mutex<SessionState>,
}

impl CaptureAccumulator {
    /// Create an empty, open session.
    pub fn new() -> Self {
        Self::default()
    }

    // a panicking producer must not take the session down with it; the state is only
    // ever mutated by whole appends so it is consistent even when poisoned
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a capture to the session.
    ///
    /// Returns the stored capture, or [`CaptureError::Frozen`] when the session is frozen.
    pub fn add_capture(
        &self,
        points: PointCloud,
        metadata: PoseMetadata,
    ) -> Result<Arc<ViewCapture>, CaptureError> {
        let mut state = self.lock();
        if state.frozen {
            return Err(CaptureError::Frozen);
        }
        let capture = Arc::new(ViewCapture {
            index: state.views.len(),
            points,
            metadata,
        });
        state.views.push(Arc::clone(&capture));
        drop(state);

        log::info!(
            "committed capture {} with {} points at yaw {:.1}",
            capture.index,
            capture.points.len(),
            capture.yaw()
        );
        Ok(capture)
    }

    /// Unproject a frame, lift its landmarks and append it to the session.
    ///
    /// The unprojection runs before the lock is taken, so producers only contend for the
    /// append itself.
    pub fn add_frame(
        &self,
        depth: &DepthFrame,
        color: &ColorFrame,
        intrinsics: &CameraIntrinsics,
        range: &DepthRange,
        mut metadata: PoseMetadata,
    ) -> Result<Arc<ViewCapture>, FrameCaptureError> {
        let points = unproject_frame(depth, color, intrinsics, range)?;
        metadata.lift_landmarks(depth, intrinsics, range);
        Ok(self.add_capture(points, metadata)?)
    }

    /// Number of captures in the session.
    pub fn len(&self) -> usize {
        self.lock().views.len()
    }

    /// Whether the session holds no capture.
    pub fn is_empty(&self) -> bool {
        self.lock().views.is_empty()
    }

    /// Whether the session is frozen.
    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// A snapshot of the current captures. The session stays open.
    pub fn snapshot(&self) -> CaptureSession {
        CaptureSession {
            views: self.lock().views.clone(),
        }
    }

    /// Close the session to new captures and return its final snapshot.
    pub fn freeze(&self) -> CaptureSession {
        let mut state = self.lock();
        state.frozen = true;
        log::info!("froze capture session with {} views", state.views.len());
        CaptureSession {
            views: state.views.clone(),
        }
    }

    /// Drop every capture and reopen the session.
    ///
    /// Snapshots taken earlier keep their captures alive.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.views.clear();
        state.frozen = false;
        log::info!("reset capture session");
    }
}

/// Error types for [`CaptureAccumulator::add_frame`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameCaptureError {
    /// The frames could not be unprojected
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The session refused the capture
    #[error(transparent)]
    Capture(#[from] CaptureError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use facescan_3d::frame::{ChannelOrder, ImageSize};
    use std::thread;

    fn cloud(n: usize) -> PointCloud {
        PointCloud::from_points((0..n).map(|i| [i as f64, 0.0, 400.0]).collect())
    }

    #[test]
    fn test_add_capture_assigns_indices() -> Result<(), CaptureError> {
        let accumulator = CaptureAccumulator::new();
        assert!(accumulator.is_empty());

        let first = accumulator.add_capture(cloud(3), PoseMetadata::new(HeadPose::from_yaw(0.0)))?;
        let second =
            accumulator.add_capture(cloud(5), PoseMetadata::new(HeadPose::from_yaw(20.0)))?;
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(second.yaw(), 20.0);
        assert_eq!(accumulator.len(), 2);

        let session = accumulator.snapshot();
        assert_eq!(session.len(), 2);
        assert_eq!(session.num_points(), 8);
        assert!(!accumulator.is_frozen());
        Ok(())
    }

    #[test]
    fn test_freeze_and_reset() -> Result<(), CaptureError> {
        let accumulator = CaptureAccumulator::new();
        accumulator.add_capture(cloud(3), PoseMetadata::default())?;

        let frozen = accumulator.freeze();
        assert!(accumulator.is_frozen());
        assert_eq!(
            accumulator.add_capture(cloud(1), PoseMetadata::default()),
            Err(CaptureError::Frozen)
        );

        accumulator.reset();
        assert!(accumulator.is_empty());
        assert!(!accumulator.is_frozen());
        // the frozen snapshot outlives the reset
        assert_eq!(frozen.len(), 1);
        assert_eq!(frozen.num_points(), 3);

        let capture = accumulator.add_capture(cloud(2), PoseMetadata::default())?;
        assert_eq!(capture.index(), 0);
        Ok(())
    }

    #[test]
    fn test_concurrent_appends() {
        let accumulator = Arc::new(CaptureAccumulator::new());
        let handles = (0..8)
            .map(|t| {
                let accumulator = Arc::clone(&accumulator);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let _ = accumulator
                            .add_capture(cloud(t + 1), PoseMetadata::new(HeadPose::from_yaw(t as f64)));
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert!(handle.join().is_ok());
        }

        let session = accumulator.snapshot();
        assert_eq!(session.len(), 200);
        // one entry per append, indices dense and matching positions
        for (i, view) in session.views().iter().enumerate() {
            assert_eq!(view.index(), i);
            assert_eq!(view.points().len(), view.yaw() as usize + 1);
        }
    }

    #[test]
    fn test_poisoned_lock_is_recovered() {
        let accumulator = Arc::new(CaptureAccumulator::new());
        let poisoner = Arc::clone(&accumulator);
        let result = thread::spawn(move || {
            let _guard = poisoner.lock();
            panic!("producer crashed");
        })
        .join();
        assert!(result.is_err());

        assert!(accumulator
            .add_capture(cloud(1), PoseMetadata::default())
            .is_ok());
        assert_eq!(accumulator.len(), 1);
    }

    #[test]
    fn test_add_frame_lifts_landmarks() -> Result<(), Box<dyn std::error::Error>> {
        let size = ImageSize {
            width: 4,
            height: 3,
        };
        let mut depth_values = vec![500.0f32; size.num_pixels()];
        depth_values[0] = 0.0;
        let depth = DepthFrame::new(size, depth_values)?;
        let color = ColorFrame::from_pixel(size, [10, 20, 30, 255], ChannelOrder::Bgra)?;
        let intrinsics = CameraIntrinsics::new(100.0, 100.0, 2.0, 1.0);

        let metadata = PoseMetadata::new(HeadPose::from_yaw(-20.0)).with_landmarks(vec![
            Landmark {
                id: LandmarkId::NoseTip,
                image: [2.2, 0.9],
                position: None,
            },
            Landmark {
                id: LandmarkId::Chin,
                image: [0.0, 0.0],
                position: None,
            },
        ]);

        let accumulator = CaptureAccumulator::new();
        let capture = accumulator.add_frame(
            &depth,
            &color,
            &intrinsics,
            &DepthRange::default(),
            metadata,
        )?;

        assert_eq!(capture.points().len(), 11);
        assert_eq!(
            capture.metadata().landmark_position(LandmarkId::NoseTip),
            Some([0.0, 0.0, 500.0])
        );
        // the chin sits on the invalid sample
        assert_eq!(capture.metadata().landmark_position(LandmarkId::Chin), None);
        assert_eq!(capture.metadata().landmark_position(LandmarkId::LeftEye), None);
        Ok(())
    }

    #[test]
    fn test_metadata_json() -> Result<(), serde_json::Error> {
        let metadata: PoseMetadata = serde_json::from_str(
            r#"{
                "head_pose": { "yaw": 20.0 },
                "landmarks": [
                    { "id": "left_eye", "image": [10.0, 12.0] },
                    { "id": { "custom": 7 }, "image": [1.0, 2.0], "position": [1.0, 2.0, 300.0] }
                ]
            }"#,
        )?;
        assert_eq!(metadata.head_pose.yaw, 20.0);
        assert_eq!(metadata.head_pose.pitch, 0.0);
        assert_eq!(metadata.landmarks[0].id, LandmarkId::LeftEye);
        assert_eq!(metadata.landmarks[0].position, None);
        assert_eq!(
            metadata.landmark_position(LandmarkId::Custom(7)),
            Some([1.0, 2.0, 300.0])
        );
        Ok(())
    }
}
