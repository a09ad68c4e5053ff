use std::collections::VecDeque;

use faer::Mat;

use facescan_3d::{linalg::solve_linear_system, transforms::RigidTransform};

use crate::config::PoseGraphConfig;
use crate::error::PoseGraphError;

/// 6x6 information matrix in the `[ω; v]` tangent order.
pub type Information = [[f64; 6]; 6];

// step of the central differences of the numeric Jacobians
const JACOBIAN_STEP: f64 = 1e-6;

// damping beyond which a step is considered hopeless
const MAX_LAMBDA: f64 = 1e10;

const MIN_LAMBDA: f64 = 1e-10;

/// A relative pose constraint between two views.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseGraphEdge {
    /// The view whose points are mapped.
    pub source: usize,
    /// The view the points are mapped into.
    pub target: usize,
    /// Measured transform from the source camera frame to the target camera frame.
    pub transform: RigidTransform,
    /// Information matrix of the measurement.
    pub information: Information,
    /// Scalar confidence of the measurement, in `[0, 1]`.
    pub confidence: f64,
    /// Loop closures are uncertain: they are down-weighted when inconsistent and may be
    /// pruned.
    pub uncertain: bool,
}

impl PoseGraphEdge {
    /// The tangent space residual `log(Z⁻¹ · T_target⁻¹ · T_source)`.
    pub fn residual(&self, source_pose: &RigidTransform, target_pose: &RigidTransform) -> [f64; 6] {
        self.transform
            .inverse()
            .compose(&target_pose.inverse().compose(source_pose))
            .log()
    }

    /// The Mahalanobis norm `eᵀ Λ e` of a residual.
    pub fn chi_squared(&self, residual: &[f64; 6]) -> f64 {
        let mut chi2 = 0.0;
        for i in 0..6 {
            for j in 0..6 {
                chi2 += residual[i] * self.information[i][j] * residual[j];
            }
        }
        chi2
    }
}

/// Summary of a pose graph optimization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationSummary {
    /// Accepted Levenberg-Marquardt steps over all runs.
    pub iterations: usize,
    /// Weighted cost of the initial poses.
    pub initial_cost: f64,
    /// Weighted cost of the final poses.
    pub final_cost: f64,
    /// Loop closures removed for being inconsistent with the rest of the graph.
    pub pruned_edges: Vec<PoseGraphEdge>,
}

/// A graph of absolute view poses linked by relative pose measurements.
///
/// Node `i` holds the transform from view `i`'s camera frame into the reference view's
/// frame. The reference node is fixed to the identity.
#[derive(Debug, Clone)]
pub struct PoseGraph {
    nodes: Vec<RigidTransform>,
    edges: Vec<PoseGraphEdge>,
    reference: usize,
}

impl PoseGraph {
    /// Create a graph of `num_nodes` identity poses.
    pub fn new(num_nodes: usize, reference: usize) -> Result<Self, PoseGraphError> {
        if reference >= num_nodes {
            return Err(PoseGraphError::InvalidReference(reference));
        }
        Ok(Self {
            nodes: vec![RigidTransform::IDENTITY; num_nodes],
            edges: Vec::new(),
            reference,
        })
    }

    /// Add an edge and return its index.
    pub fn add_edge(&mut self, edge: PoseGraphEdge) -> Result<usize, PoseGraphError> {
        if edge.source >= self.nodes.len() || edge.target >= self.nodes.len() {
            return Err(PoseGraphError::InvalidNode {
                source_node: edge.source,
                target_node: edge.target,
                num_nodes: self.nodes.len(),
            });
        }
        if edge.source == edge.target {
            return Err(PoseGraphError::SelfLoop(edge.source));
        }
        self.edges.push(edge);
        Ok(self.edges.len() - 1)
    }

    /// The absolute node poses.
    pub fn nodes(&self) -> &[RigidTransform] {
        &self.nodes
    }

    /// The edges.
    pub fn edges(&self) -> &[PoseGraphEdge] {
        &self.edges
    }

    /// The reference node.
    pub fn reference(&self) -> usize {
        self.reference
    }

    /// Which nodes are linked to the reference by a path of edges.
    pub fn connected_nodes(&self) -> Vec<bool> {
        let mut connected = vec![false; self.nodes.len()];
        connected[self.reference] = true;
        let mut queue = VecDeque::from([self.reference]);
        while let Some(node) = queue.pop_front() {
            for edge in self.edges.iter() {
                let other = if edge.source == node {
                    edge.target
                } else if edge.target == node {
                    edge.source
                } else {
                    continue;
                };
                if !connected[other] {
                    connected[other] = true;
                    queue.push_back(other);
                }
            }
        }
        connected
    }

    /// Set every node pose by composing edges outward from the reference.
    ///
    /// The traversal is breadth first over odometry edges; loop closures are only followed
    /// to reach nodes no odometry path reaches. Unreachable nodes are reset to the identity.
    /// Returns which nodes were reached.
    pub fn initialize_poses(&mut self) -> Vec<bool> {
        let num_nodes = self.nodes.len();
        let mut known = vec![false; num_nodes];
        self.nodes = vec![RigidTransform::IDENTITY; num_nodes];
        known[self.reference] = true;

        for follow_uncertain in [false, true] {
            let mut queue = (0..num_nodes).filter(|&i| known[i]).collect::<VecDeque<_>>();
            while let Some(node) = queue.pop_front() {
                for edge in self.edges.iter() {
                    if edge.uncertain && !follow_uncertain {
                        continue;
                    }
                    // T_source = T_target · Z
                    let (other, pose) = if edge.target == node && !known[edge.source] {
                        (edge.source, self.nodes[node].compose(&edge.transform))
                    } else if edge.source == node && !known[edge.target] {
                        (edge.target, self.nodes[node].compose(&edge.transform.inverse()))
                    } else {
                        continue;
                    };
                    known[other] = true;
                    self.nodes[other] = pose;
                    queue.push_back(other);
                }
            }
        }

        known
    }

    /// The `μ` of the line process, scaled by the mean correspondence count of the certain
    /// edges.
    fn line_process_scale(&self, config: &PoseGraphConfig) -> f64 {
        let counts = |uncertain: bool| {
            self.edges
                .iter()
                .filter(|e| e.uncertain == uncertain)
                .map(|e| e.information[5][5])
                .collect::<Vec<_>>()
        };
        let mut counts_per_edge = counts(false);
        if counts_per_edge.is_empty() {
            counts_per_edge = counts(true);
        }
        let mean_count = if counts_per_edge.is_empty() {
            1.0
        } else {
            counts_per_edge.iter().sum::<f64>() / counts_per_edge.len() as f64
        };
        config.loop_closure_scale * mean_count.max(1.0)
    }

    fn weights_at(&self, poses: &[RigidTransform], mu: f64) -> Vec<f64> {
        self.edges
            .iter()
            .map(|edge| {
                if !edge.uncertain {
                    return 1.0;
                }
                let residual = edge.residual(&poses[edge.source], &poses[edge.target]);
                let ratio = mu / (mu + edge.chi_squared(&residual));
                ratio * ratio
            })
            .collect()
    }

    /// The line process weight of every edge at the current poses.
    ///
    /// Certain edges always weigh `1`.
    pub fn edge_weights(&self, config: &PoseGraphConfig) -> Vec<f64> {
        self.weights_at(&self.nodes, self.line_process_scale(config))
    }

    fn cost_at(&self, poses: &[RigidTransform], weights: &[f64], active: &[bool]) -> f64 {
        self.edges
            .iter()
            .zip(weights)
            .filter(|(edge, _)| active[edge.source] && active[edge.target])
            .map(|(edge, w)| {
                let residual = edge.residual(&poses[edge.source], &poses[edge.target]);
                w * edge.chi_squared(&residual)
            })
            .sum()
    }

    /// Weighted cost `Σ w · eᵀ Λ e` of the current poses.
    pub fn cost(&self, config: &PoseGraphConfig) -> f64 {
        let weights = self.edge_weights(config);
        self.cost_at(&self.nodes, &weights, &self.connected_nodes())
    }

    // d residual / d left perturbation of one endpoint, by central differences
    fn numeric_jacobian(
        edge: &PoseGraphEdge,
        source_pose: &RigidTransform,
        target_pose: &RigidTransform,
        perturb_source: bool,
    ) -> [[f64; 6]; 6] {
        let mut jacobian = [[0.0; 6]; 6];
        for col in 0..6 {
            let mut xi = [0.0; 6];
            xi[col] = JACOBIAN_STEP;
            let plus = RigidTransform::exp(&xi);
            xi[col] = -JACOBIAN_STEP;
            let minus = RigidTransform::exp(&xi);

            let (e_plus, e_minus) = if perturb_source {
                (
                    edge.residual(&plus.compose(source_pose), target_pose),
                    edge.residual(&minus.compose(source_pose), target_pose),
                )
            } else {
                (
                    edge.residual(source_pose, &plus.compose(target_pose)),
                    edge.residual(source_pose, &minus.compose(target_pose)),
                )
            };
            for row in 0..6 {
                jacobian[row][col] = (e_plus[row] - e_minus[row]) / (2.0 * JACOBIAN_STEP);
            }
        }
        jacobian
    }

    fn run_levenberg_marquardt(
        &mut self,
        config: &PoseGraphConfig,
    ) -> Result<OptimizationSummary, PoseGraphError> {
        let active = self.connected_nodes();
        let mut variables = vec![None; self.nodes.len()];
        let mut num_variables = 0;
        for (i, variable) in variables.iter_mut().enumerate() {
            if i != self.reference && active[i] {
                *variable = Some(num_variables);
                num_variables += 1;
            }
        }

        let mu = self.line_process_scale(config);
        let initial_weights = self.weights_at(&self.nodes, mu);
        let initial_cost = self.cost_at(&self.nodes, &initial_weights, &active);
        let mut summary = OptimizationSummary {
            initial_cost,
            final_cost: initial_cost,
            ..Default::default()
        };
        if num_variables == 0 {
            return Ok(summary);
        }

        let dim = 6 * num_variables;
        let mut lambda = config.initial_lambda;

        for iteration in 0..config.max_iterations {
            // the line process is held fixed while a step is searched
            let weights = self.weights_at(&self.nodes, mu);
            let cost = self.cost_at(&self.nodes, &weights, &active);

            let mut hessian = Mat::<f64>::zeros(dim, dim);
            let mut gradient = vec![0.0; dim];
            for (edge, &weight) in self.edges.iter().zip(weights.iter()) {
                if !(active[edge.source] && active[edge.target]) {
                    continue;
                }
                let source_pose = &self.nodes[edge.source];
                let target_pose = &self.nodes[edge.target];
                let residual = edge.residual(source_pose, target_pose);

                let blocks = [
                    (variables[edge.source], true),
                    (variables[edge.target], false),
                ]
                .map(|(variable, is_source)| {
                    variable.map(|v| {
                        (
                            v,
                            Self::numeric_jacobian(edge, source_pose, target_pose, is_source),
                        )
                    })
                });

                for (a, jac_a) in blocks.iter().flatten() {
                    // Jaᵀ Λ
                    let mut jt_info = [[0.0; 6]; 6];
                    for r in 0..6 {
                        for c in 0..6 {
                            jt_info[r][c] = (0..6)
                                .map(|k| jac_a[k][r] * edge.information[k][c])
                                .sum::<f64>();
                        }
                    }
                    for r in 0..6 {
                        gradient[6 * a + r] += weight
                            * (0..6).map(|k| jt_info[r][k] * residual[k]).sum::<f64>();
                    }
                    for (b, jac_b) in blocks.iter().flatten() {
                        for r in 0..6 {
                            for c in 0..6 {
                                let value = (0..6)
                                    .map(|k| jt_info[r][k] * jac_b[k][c])
                                    .sum::<f64>();
                                let (row, col) = (6 * a + r, 6 * b + c);
                                hessian.write(row, col, hessian.read(row, col) + weight * value);
                            }
                        }
                    }
                }
            }

            let rhs = gradient.iter().map(|g| -g).collect::<Vec<_>>();
            let mut accepted = None;
            while lambda <= MAX_LAMBDA {
                let mut damped = hessian.clone();
                for i in 0..dim {
                    let diagonal = hessian.read(i, i);
                    damped.write(i, i, diagonal + lambda * diagonal.max(f64::EPSILON));
                }
                let delta = solve_linear_system(&damped, &rhs)?;

                let mut candidate = self.nodes.clone();
                for (node, variable) in variables.iter().enumerate() {
                    if let Some(v) = variable {
                        let xi = [
                            delta[6 * v],
                            delta[6 * v + 1],
                            delta[6 * v + 2],
                            delta[6 * v + 3],
                            delta[6 * v + 4],
                            delta[6 * v + 5],
                        ];
                        candidate[node] = RigidTransform::exp(&xi)
                            .compose(&self.nodes[node])
                            .orthonormalized();
                    }
                }

                let new_cost = self.cost_at(&candidate, &weights, &active);
                if new_cost <= cost {
                    let step_norm = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
                    accepted = Some((candidate, new_cost, step_norm));
                    lambda = (lambda / 10.0).max(MIN_LAMBDA);
                    break;
                }
                lambda *= 10.0;
            }

            let Some((candidate, new_cost, step_norm)) = accepted else {
                log::debug!("pose graph iteration {iteration}: no descent step, stopping");
                break;
            };
            self.nodes = candidate;
            summary.iterations += 1;
            log::debug!(
                "pose graph iteration {iteration}: cost {cost:.6e} -> {new_cost:.6e}, lambda {lambda:.1e}"
            );

            let decrease = (cost - new_cost) / cost.max(f64::MIN_POSITIVE);
            if decrease < config.convergence_threshold || step_norm < config.convergence_threshold {
                break;
            }
        }

        let final_weights = self.weights_at(&self.nodes, mu);
        summary.final_cost = self.cost_at(&self.nodes, &final_weights, &active);
        Ok(summary)
    }

    /// Minimize the weighted residual of every edge over the non-reference poses.
    ///
    /// Nodes not connected to the reference keep their pose. After convergence loop
    /// closures whose line process weight is below the prune threshold are removed, and the
    /// remaining graph is optimized once more.
    pub fn optimize(&mut self, config: &PoseGraphConfig) -> Result<OptimizationSummary, PoseGraphError> {
        let mut summary = self.run_levenberg_marquardt(config)?;

        let weights = self.edge_weights(config);
        let (kept, pruned): (Vec<_>, Vec<_>) = std::mem::take(&mut self.edges)
            .into_iter()
            .zip(weights)
            .partition(|(edge, weight)| !edge.uncertain || *weight >= config.edge_prune_threshold);
        self.edges = kept.into_iter().map(|(edge, _)| edge).collect();

        for (edge, weight) in pruned.iter() {
            log::warn!(
                "pruned loop closure {} -> {} with line process weight {weight:.3}",
                edge.source,
                edge.target
            );
        }

        if !pruned.is_empty() {
            let rerun = self.run_levenberg_marquardt(config)?;
            summary.iterations += rerun.iterations;
            summary.final_cost = rerun.final_cost;
        }
        summary.pruned_edges = pruned.into_iter().map(|(edge, _)| edge).collect();

        log::info!(
            "pose graph resolved in {} iterations: cost {:.6e} -> {:.6e}, {} loop closures pruned",
            summary.iterations,
            summary.initial_cost,
            summary.final_cost,
            summary.pruned_edges.len()
        );
        Ok(summary)
    }
}
