use kiddo::immutable::float::kdtree::ImmutableKdTree;
use kiddo::SquaredEuclidean;

/// A neighbour returned by [`NeighborIndex`] queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index of the point in the indexed slice.
    pub index: usize,
    /// Squared euclidean distance to the query.
    pub distance_squared: f64,
}

/// Static k-d tree over a slice of points.
///
/// Built once and queried from many threads, e.g. per-point normal estimation or the
/// correspondence search of ICP.
pub struct NeighborIndex {
    tree: Option<ImmutableKdTree<f64, u32, 3, 32>>,
    len: usize,
    center: [f64; 3],
    diagonal: f64,
}

impl std::fmt::Debug for NeighborIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborIndex")
            .field("len", &self.len)
            .field("center", &self.center)
            .field("diagonal", &self.diagonal)
            .finish()
    }
}

impl NeighborIndex {
    /// Build the index. An empty slice yields an index that never returns neighbours.
    pub fn new(points: &[[f64; 3]]) -> Self {
        let Some(first) = points.first() else {
            return Self {
                tree: None,
                len: 0,
                center: [0.0; 3],
                diagonal: 0.0,
            };
        };

        let (lo, hi) = points.iter().fold((*first, *first), |(lo, hi), p| {
            (
                [lo[0].min(p[0]), lo[1].min(p[1]), lo[2].min(p[2])],
                [hi[0].max(p[0]), hi[1].max(p[1]), hi[2].max(p[2])],
            )
        });
        let center = [
            0.5 * (lo[0] + hi[0]),
            0.5 * (lo[1] + hi[1]),
            0.5 * (lo[2] + hi[2]),
        ];
        let diagonal = distance(&lo, &hi);

        Self {
            tree: Some(ImmutableKdTree::new_from_slice(points)),
            len: points.len(),
            center,
            diagonal,
        }
    }

    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the index holds no points.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The closest indexed point to `query`.
    pub fn nearest(&self, query: &[f64; 3]) -> Option<Neighbor> {
        let tree = self.tree.as_ref()?;
        let nn = tree.nearest_one::<SquaredEuclidean>(query);
        Some(Neighbor {
            index: nn.item as usize,
            distance_squared: nn.distance,
        })
    }

    /// All points within `radius` of `query`, sorted by increasing distance.
    pub fn within(&self, query: &[f64; 3], radius: f64) -> Vec<Neighbor> {
        let Some(tree) = self.tree.as_ref() else {
            return Vec::new();
        };
        let mut found = tree
            .within_unsorted::<SquaredEuclidean>(query, radius * radius)
            .into_iter()
            .map(|nn| Neighbor {
                index: nn.item as usize,
                distance_squared: nn.distance,
            })
            .collect::<Vec<_>>();
        found.sort_by(|lhs, rhs| {
            lhs.distance_squared
                .total_cmp(&rhs.distance_squared)
                .then(lhs.index.cmp(&rhs.index))
        });
        found
    }

    /// The closest `max_nn` points within `radius` of `query`.
    pub fn within_knn(&self, query: &[f64; 3], radius: f64, max_nn: usize) -> Vec<Neighbor> {
        let mut found = self.within(query, radius);
        found.truncate(max_nn);
        found
    }

    /// The `k` closest points to `query`, sorted by increasing distance.
    ///
    /// The search radius starts from the average point spacing and doubles until `k`
    /// points are found or the radius covers the whole cloud.
    pub fn knn(&self, query: &[f64; 3], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.is_empty() {
            return Vec::new();
        }
        let k = k.min(self.len);

        // any indexed point lies within this distance of the query
        let cover = distance(query, &self.center) + 0.5 * self.diagonal;
        let fraction = k as f64 / self.len as f64;
        let mut radius = (self.diagonal * fraction.cbrt()).max(1e-9);

        loop {
            let mut found = self.within(query, radius);
            if found.len() >= k || radius > cover {
                found.truncate(k);
                return found;
            }
            radius *= 2.0;
        }
    }
}

fn distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2) + (a[2] - b[2]).powi(2)).sqrt()
}
