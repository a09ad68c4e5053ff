use std::collections::BTreeMap;

use glam::DVec3;
use rayon::prelude::*;

use facescan_3d::transforms::RigidTransform;
use facescan_icp::{
    evaluate_registration, information_matrix, PairRegistration, PointToPlaneIcp,
    RegistrationError as PairRegistrationError,
};
use facescan_linalg::rigid::{kabsch, RigidError};

use crate::cancel::CancellationToken;
use crate::capture::{CaptureSession, LandmarkId, ViewCapture};
use crate::config::{RegistrarConfig, RegistrationMethod};
use crate::error::{PartialRegistrationWarning, RegistrationError};
use crate::merged::MergedPointCloud;
use crate::pose_graph::{Information, PoseGraph, PoseGraphEdge};

/// The role of an edge in the pose graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Between views adjacent in yaw order.
    Odometry,
    /// Between non-adjacent views with a close enough yaw.
    LoopClosure,
}

/// Why a candidate edge did not make it into the pose graph.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EdgeFailure {
    /// Fewer than three landmarks are known in both views
    #[error("Only {0} landmarks shared by both views, at least 3 are needed")]
    NotEnoughLandmarks(usize),

    /// The landmark fit failed
    #[error(transparent)]
    Rigid(#[from] RigidError),

    /// Pairwise point cloud registration failed
    #[error(transparent)]
    Pair(#[from] PairRegistrationError),

    /// The registration is not trustworthy enough
    #[error("Confidence {confidence:.3} is below the minimum {min_confidence:.3}")]
    LowConfidence {
        /// Confidence of the estimate.
        confidence: f64,
        /// Configured minimum.
        min_confidence: f64,
    },
}

/// What became of a candidate edge.
#[derive(Debug, PartialEq)]
pub enum EdgeStatus {
    /// Used to resolve the poses.
    Accepted,
    /// Not added to the pose graph.
    Dropped(EdgeFailure),
    /// Added, then removed by the optimizer as inconsistent.
    Pruned,
    /// Not estimated because the registration was cancelled.
    Abandoned,
}

/// Report of one candidate edge.
#[derive(Debug, PartialEq)]
pub struct EdgeSummary {
    /// View whose points the edge maps.
    pub source: usize,
    /// View the points are mapped into.
    pub target: usize,
    /// Odometry or loop closure.
    pub kind: EdgeKind,
    /// Confidence of the estimate, when one was made.
    pub confidence: Option<f64>,
    /// Outcome.
    pub status: EdgeStatus,
}

/// Result of a multi-view registration.
#[derive(Debug)]
pub struct RegistrationOutcome {
    /// Every registered view in the reference view's frame.
    pub merged: MergedPointCloud,
    /// Per capture index, the transform from the view's camera frame into the reference
    /// frame. `None` for excluded views.
    pub transforms: Vec<Option<RigidTransform>>,
    /// Every candidate edge, in planning order.
    pub edges: Vec<EdgeSummary>,
    /// Views that could not be related to the reference view.
    pub warning: Option<PartialRegistrationWarning>,
    /// Whether the registration was cancelled before every edge was estimated.
    pub cancelled: bool,
}

impl RegistrationOutcome {
    /// Whether every view was merged without cancellation.
    pub fn is_complete(&self) -> bool {
        self.warning.is_none() && !self.cancelled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlannedEdge {
    source: usize,
    target: usize,
    kind: EdgeKind,
}

struct EdgeEstimate {
    transform: RigidTransform,
    information: Information,
    confidence: f64,
}

// odometry between neighbours in yaw order, loop closures between the other pairs whose yaw
// difference is small enough; the later captured view is the source
fn plan_edges(views: &[std::sync::Arc<ViewCapture>], max_loop_closure_yaw: f64) -> Vec<PlannedEdge> {
    let mut order = (0..views.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| views[a].yaw().total_cmp(&views[b].yaw()).then(a.cmp(&b)));

    let edge = |a: usize, b: usize, kind| PlannedEdge {
        source: a.max(b),
        target: a.min(b),
        kind,
    };

    let mut planned = order
        .windows(2)
        .map(|pair| edge(pair[0], pair[1], EdgeKind::Odometry))
        .collect::<Vec<_>>();

    for i in 0..order.len() {
        for j in (i + 2)..order.len() {
            let (a, b) = (order[i], order[j]);
            if (views[a].yaw() - views[b].yaw()).abs() <= max_loop_closure_yaw {
                planned.push(edge(a, b, EdgeKind::LoopClosure));
            }
        }
    }
    planned
}

// first occurrence of every lifted landmark
fn lifted_landmarks(view: &ViewCapture) -> BTreeMap<LandmarkId, [f64; 3]> {
    let mut landmarks = BTreeMap::new();
    for landmark in view.metadata().landmarks.iter() {
        if let Some(position) = landmark.position {
            landmarks.entry(landmark.id).or_insert(position);
        }
    }
    landmarks
}

/// Registers every view of a session into the frame of its first view.
///
/// Candidate edges are planned from the head yaw of each view, estimated in parallel with
/// landmark fits and/or the pairwise registration `R`, and resolved with a pose graph.
#[derive(Debug, Clone)]
pub struct MultiViewRegistrar<R: PairRegistration = PointToPlaneIcp> {
    config: RegistrarConfig,
    pair_registration: R,
}

impl MultiViewRegistrar<PointToPlaneIcp> {
    /// Create a registrar using point-to-plane ICP for pairwise registration.
    pub fn new(config: RegistrarConfig) -> Self {
        let icp = PointToPlaneIcp::new(config.icp.clone());
        Self::with_pair_registration(config, icp)
    }
}

impl<R: PairRegistration> MultiViewRegistrar<R> {
    /// Create a registrar with a custom pairwise registration.
    pub fn with_pair_registration(config: RegistrarConfig, pair_registration: R) -> Self {
        Self {
            config,
            pair_registration,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &RegistrarConfig {
        &self.config
    }

    /// Fit the landmarks both views share.
    ///
    /// The confidence is the fraction of shared landmarks the fit maps within
    /// `landmark_inlier_distance`.
    fn landmark_edge(&self, source: &ViewCapture, target: &ViewCapture) -> Result<EdgeEstimate, EdgeFailure> {
        let target_landmarks = lifted_landmarks(target);
        let (source_points, target_points): (Vec<_>, Vec<_>) = lifted_landmarks(source)
            .into_iter()
            .filter_map(|(id, position)| Some((position, *target_landmarks.get(&id)?)))
            .unzip();
        if source_points.len() < 3 {
            return Err(EdgeFailure::NotEnoughLandmarks(source_points.len()));
        }

        let fit = kabsch(&source_points, &target_points)?;
        let inliers = source_points
            .iter()
            .zip(target_points.iter())
            .filter(|(a, b)| {
                fit.transform_point(DVec3::from_array(**a))
                    .distance(DVec3::from_array(**b))
                    <= self.config.landmark_inlier_distance
            })
            .count();

        Ok(EdgeEstimate {
            transform: RigidTransform::new(fit.rotation, fit.translation),
            information: information_matrix(target_points.iter()),
            confidence: inliers as f64 / source_points.len() as f64,
        })
    }

    /// Initial guess from the head poses: the head turns about a pivot behind the face.
    fn head_pose_guess(&self, source: &ViewCapture, target: &ViewCapture) -> RigidTransform {
        let rotation = target.metadata().head_pose.rotation()
            * source.metadata().head_pose.rotation().transpose();
        let centroid = source
            .points()
            .centroid()
            .map(DVec3::from_array)
            .unwrap_or(DVec3::ZERO);
        let pivot = centroid + DVec3::Z * self.config.head_pivot_depth;
        RigidTransform::new(rotation, pivot - rotation * pivot)
    }

    fn pair_edge(
        &self,
        source: &ViewCapture,
        target: &ViewCapture,
        initial: &RigidTransform,
    ) -> Result<EdgeEstimate, EdgeFailure> {
        let result = self
            .pair_registration
            .register_pair(source.points(), target.points(), initial)?;
        Ok(EdgeEstimate {
            transform: result.transform,
            information: result.information,
            confidence: result.confidence(),
        })
    }

    fn estimate_edge(&self, source: &ViewCapture, target: &ViewCapture) -> Result<EdgeEstimate, EdgeFailure> {
        match self.config.method {
            RegistrationMethod::Landmarks => self.landmark_edge(source, target),
            RegistrationMethod::Icp => {
                let initial = self.head_pose_guess(source, target);
                self.pair_edge(source, target, &initial)
            }
            RegistrationMethod::LandmarksThenIcp => match self.landmark_edge(source, target) {
                Ok(landmarks) => self.refine_landmark_edge(source, target, landmarks),
                Err(failure) => {
                    log::debug!(
                        "landmark fit {} -> {} failed ({failure}), seeding from head pose",
                        source.index(),
                        target.index()
                    );
                    let initial = self.head_pose_guess(source, target);
                    self.pair_edge(source, target, &initial)
                }
            },
        }
    }

    /// Refine a landmark fit with the pairwise registration.
    ///
    /// Both estimates are scored with the registration fitness at the fine correspondence
    /// distance; the landmark fit is kept when the refinement fails or scores lower.
    fn refine_landmark_edge(
        &self,
        source: &ViewCapture,
        target: &ViewCapture,
        landmarks: EdgeEstimate,
    ) -> Result<EdgeEstimate, EdgeFailure> {
        let (landmark_fitness, _) = evaluate_registration(
            source.points().points(),
            target.points().points(),
            &landmarks.transform,
            self.config.icp.fine_distance,
        );
        let landmarks = EdgeEstimate {
            confidence: landmark_fitness,
            ..landmarks
        };

        match self.pair_edge(source, target, &landmarks.transform) {
            Ok(refined) if refined.confidence >= landmarks.confidence => Ok(refined),
            Ok(refined) => {
                log::debug!(
                    "refinement {} -> {} scored {:.3} below the landmark fit {:.3}, keeping the landmark fit",
                    source.index(),
                    target.index(),
                    refined.confidence,
                    landmarks.confidence
                );
                Ok(landmarks)
            }
            Err(failure) => {
                log::debug!(
                    "refinement {} -> {} failed ({failure}), keeping the landmark fit",
                    source.index(),
                    target.index()
                );
                Ok(landmarks)
            }
        }
    }

    /// Register every view of the session. See [`MultiViewRegistrar::register_all_with_cancel`].
    pub fn register_all(&self, session: &CaptureSession) -> Result<RegistrationOutcome, RegistrationError> {
        self.register_all_with_cancel(session, &CancellationToken::new())
    }

    /// Register every view of the session into the frame of its first view.
    ///
    /// Edges below `min_confidence` or whose estimation failed are dropped. Views left
    /// without a path to the reference are excluded from the merge and listed in the
    /// outcome's warning. Cancelling abandons the edges not yet estimated and skips the
    /// global optimization; the poses reachable through the finished edges are still used.
    pub fn register_all_with_cancel(
        &self,
        session: &CaptureSession,
        cancel: &CancellationToken,
    ) -> Result<RegistrationOutcome, RegistrationError> {
        let views = session.views();
        if views.is_empty() {
            return Ok(RegistrationOutcome {
                merged: MergedPointCloud::default(),
                transforms: Vec::new(),
                edges: Vec::new(),
                warning: None,
                cancelled: cancel.is_cancelled(),
            });
        }

        let reference = 0;
        let planned = plan_edges(views, self.config.max_loop_closure_yaw);
        log::info!(
            "registering {} views over {} candidate edges",
            views.len(),
            planned.len()
        );

        let estimates = planned
            .par_iter()
            .map(|edge| {
                if cancel.is_cancelled() {
                    return None;
                }
                Some(self.estimate_edge(&views[edge.source], &views[edge.target]))
            })
            .collect::<Vec<_>>();
        let cancelled = cancel.is_cancelled();

        let mut graph = PoseGraph::new(views.len(), reference)?;
        let mut edges = Vec::with_capacity(planned.len());
        for (plan, estimate) in planned.iter().zip(estimates) {
            let (confidence, status) = match estimate {
                None => (None, EdgeStatus::Abandoned),
                Some(Err(failure)) => {
                    log::warn!(
                        "dropped edge {} -> {}: {failure}",
                        plan.source,
                        plan.target
                    );
                    (None, EdgeStatus::Dropped(failure))
                }
                Some(Ok(estimate)) if estimate.confidence < self.config.min_confidence => {
                    let failure = EdgeFailure::LowConfidence {
                        confidence: estimate.confidence,
                        min_confidence: self.config.min_confidence,
                    };
                    log::warn!(
                        "dropped edge {} -> {}: {failure}",
                        plan.source,
                        plan.target
                    );
                    (Some(estimate.confidence), EdgeStatus::Dropped(failure))
                }
                Some(Ok(estimate)) => {
                    graph.add_edge(PoseGraphEdge {
                        source: plan.source,
                        target: plan.target,
                        transform: estimate.transform,
                        information: estimate.information,
                        confidence: estimate.confidence,
                        uncertain: plan.kind == EdgeKind::LoopClosure,
                    })?;
                    (Some(estimate.confidence), EdgeStatus::Accepted)
                }
            };
            edges.push(EdgeSummary {
                source: plan.source,
                target: plan.target,
                kind: plan.kind,
                confidence,
                status,
            });
        }

        graph.initialize_poses();
        if cancelled {
            log::warn!("registration cancelled, skipping pose graph optimization");
        } else if !graph.edges().is_empty() {
            let summary = graph.optimize(&self.config.pose_graph)?;
            for pruned in summary.pruned_edges.iter() {
                if let Some(edge) = edges
                    .iter_mut()
                    .find(|e| e.source == pruned.source && e.target == pruned.target)
                {
                    edge.status = EdgeStatus::Pruned;
                }
            }
        }

        let connected = graph.connected_nodes();
        let num_points = views
            .iter()
            .zip(connected.iter())
            .filter(|(_, &c)| c)
            .map(|(v, _)| v.points().len())
            .sum();
        let mut merged =
            MergedPointCloud::with_capacity(num_points, views[reference].points().channel_order());
        let mut transforms = vec![None; views.len()];
        let mut excluded_views = Vec::new();
        for (i, (view, pose)) in views.iter().zip(graph.nodes()).enumerate() {
            if !connected[i] {
                excluded_views.push(i);
                continue;
            }
            if i == reference {
                merged.append_view(i, view.points());
            } else {
                merged.append_view(i, &view.points().transformed(pose)?);
            }
            transforms[i] = Some(*pose);
        }

        let warning = if excluded_views.is_empty() {
            None
        } else {
            let warning = PartialRegistrationWarning { excluded_views };
            log::warn!("{warning}");
            Some(warning)
        };

        log::info!(
            "merged {} points from {} of {} views",
            merged.len(),
            merged.segments().len(),
            views.len()
        );

        Ok(RegistrationOutcome {
            merged,
            transforms,
            edges,
            warning,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{HeadPose, Landmark, PoseMetadata};
    use approx::assert_relative_eq;
    use facescan_3d::pointcloud::PointCloud;
    use glam::DMat3;

    fn landmarks(positions: &[(LandmarkId, [f64; 3])]) -> Vec<Landmark> {
        positions
            .iter()
            .map(|&(id, position)| Landmark {
                id,
                image: [0.0, 0.0],
                position: Some(position),
            })
            .collect()
    }

    fn face_landmarks() -> Vec<(LandmarkId, [f64; 3])> {
        vec![
            (LandmarkId::LeftEye, [-32.0, -25.0, 425.0]),
            (LandmarkId::RightEye, [32.0, -25.0, 425.0]),
            (LandmarkId::NoseTip, [0.0, 5.0, 390.0]),
            (LandmarkId::MouthLeft, [-22.0, 35.0, 412.0]),
            (LandmarkId::Chin, [0.0, 65.0, 418.0]),
        ]
    }

    fn view(yaw: f64, landmark_positions: &[(LandmarkId, [f64; 3])]) -> (PointCloud, PoseMetadata) {
        (
            PointCloud::from_points(vec![[0.0, 0.0, 400.0]; 4]),
            PoseMetadata::new(HeadPose::from_yaw(yaw)).with_landmarks(landmarks(landmark_positions)),
        )
    }

    #[test]
    fn test_plan_edges_by_yaw() {
        let session = CaptureSession::from_views([
            view(0.0, &[]),
            view(20.0, &[]),
            view(-20.0, &[]),
            view(60.0, &[]),
        ]);
        let planned = plan_edges(session.views(), 45.0);

        let odometry = planned
            .iter()
            .filter(|e| e.kind == EdgeKind::Odometry)
            .map(|e| (e.source, e.target))
            .collect::<Vec<_>>();
        // yaw order is 2, 0, 1, 3
        assert_eq!(odometry, vec![(2, 0), (1, 0), (3, 1)]);

        let loop_closures = planned
            .iter()
            .filter(|e| e.kind == EdgeKind::LoopClosure)
            .map(|e| (e.source, e.target))
            .collect::<Vec<_>>();
        // -20 and 20 are 40 apart, 0 and 60 are 60 apart
        assert_eq!(loop_closures, vec![(2, 1)]);
    }

    #[test]
    fn test_landmark_edge() -> Result<(), EdgeFailure> {
        let motion = RigidTransform::new(
            DMat3::from_rotation_y(20f64.to_radians()),
            DVec3::new(150.0, 0.0, 40.0),
        );
        let front = face_landmarks();
        let mut moved = front
            .iter()
            .map(|&(id, p)| (id, motion.apply(&p)))
            .collect::<Vec<_>>();
        // a detector glitch on the chin
        moved[4].1[1] += 30.0;

        let session = CaptureSession::from_views([view(0.0, &front), view(20.0, &moved)]);
        let registrar = MultiViewRegistrar::new(RegistrarConfig {
            landmark_inlier_distance: 10.0,
            ..Default::default()
        });
        let estimate = registrar.landmark_edge(&session.views()[1], &session.views()[0])?;

        assert!(estimate.transform.is_proper(1e-9));
        assert_eq!(estimate.information[3][3], 5.0);
        // the glitch drags the fit about 6 mm, only the chin is left out
        assert_eq!(estimate.confidence, 0.8);

        let glitch_free = CaptureSession::from_views([
            view(0.0, &front),
            view(
                20.0,
                &front
                    .iter()
                    .map(|&(id, p)| (id, motion.apply(&p)))
                    .collect::<Vec<_>>(),
            ),
        ]);
        let estimate = registrar.landmark_edge(&glitch_free.views()[1], &glitch_free.views()[0])?;
        assert_eq!(estimate.confidence, 1.0);
        let error = estimate.transform.compose(&motion);
        assert!(error.rotation_angle() < 1e-9);
        assert!(error.translation.length() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_landmark_edge_needs_three_shared() {
        let front = face_landmarks();
        let session = CaptureSession::from_views([view(0.0, &front), view(20.0, &front[..2])]);
        let registrar = MultiViewRegistrar::new(RegistrarConfig::default());
        assert_eq!(
            registrar
                .landmark_edge(&session.views()[1], &session.views()[0])
                .err(),
            Some(EdgeFailure::NotEnoughLandmarks(2))
        );
    }

    #[test]
    fn test_head_pose_guess() {
        let config = RegistrarConfig::default();
        let registrar = MultiViewRegistrar::new(config.clone());
        let session = CaptureSession::from_views([view(0.0, &[]), view(20.0, &[])]);

        let guess = registrar.head_pose_guess(&session.views()[1], &session.views()[0]);
        assert_relative_eq!(guess.rotation_angle(), 20f64.to_radians(), epsilon = 1e-12);
        // the pivot is a fixed point
        let pivot = [0.0, 0.0, 400.0 + config.head_pivot_depth];
        let mapped = guess.apply(&pivot);
        assert_relative_eq!(mapped.as_slice(), pivot.as_slice(), epsilon = 1e-9);
    }
}
