use rstar::{primitives::GeomWithData, Point, RTree};
use tracing::{debug, trace};

use crate::{
    concurrency::par_iter_mut1,
    error::EvalError,
    evaluator_parameters::{EvaluatorParams, NeighborhoodSearchAlgorithm},
    floating_type_mod::FT,
    particle_array::ParticleArray,
    vec3f, V, V3, VI,
};

/// Spatial query structure the evaluator walks neighbor lists from.
///
/// `get_neighbors` is called concurrently from all workers for distinct
/// destination indices between two calls of `set_context`. It must not spawn
/// rayon work.
pub trait NeighborSource: Send + Sync {
    /// Selects the (source, destination) array pair subsequent queries refer to.
    fn set_context(&mut self, src_index: usize, dst_index: usize);

    /// Indices of all source particles interacting with destination particle
    /// `d_idx`, in unspecified order. Implementations either return a slice of
    /// their own cache or fill `scratch` and return it.
    fn get_neighbors<'a>(&'a self, d_idx: usize, scratch: &'a mut Vec<u32>) -> &'a [u32];

    /// Marks the spatial extent as outdated; the next `update` recomputes it.
    fn update_domain(&mut self) {}

    /// Rebuilds the structure from the current particle positions.
    fn update(&mut self, arrays: &[ParticleArray]) -> Result<(), EvalError>;

    fn use_cache(&self) -> bool {
        false
    }
}

/// Worker-private buffer for neighbor queries that do not hit a cache.
#[derive(Debug, Default)]
pub struct NeighborScratch {
    pub(crate) indices: Vec<u32>,
    max_observed: usize,
}

impl NeighborScratch {
    #[inline(always)]
    pub(crate) fn observe(&mut self, num_neighbors: usize) {
        self.max_observed = self.max_observed.max(num_neighbors);
    }

    pub fn max_observed(&self) -> usize {
        self.max_observed
    }

    /// Grows the buffer so that `num_neighbors` indices fit without reallocating.
    pub fn reserve(&mut self, num_neighbors: usize) {
        if self.indices.capacity() < num_neighbors {
            self.indices.reserve(num_neighbors - self.indices.len());
        }
    }
}

pub struct NeighborhoodCache {
    neighs: Vec<Vec<u32>>,
}

impl NeighborhoodCache {
    pub fn new(num_particles: usize) -> Self {
        NeighborhoodCache {
            neighs: (0..num_particles).map(|_| Vec::new()).collect(),
        }
    }

    pub fn neighbors(&self, i: usize) -> &[u32] {
        &self.neighs[i]
    }

    pub fn neighbor_count(&self, i: usize) -> usize {
        self.neighs[i].len()
    }

    pub fn len(&self) -> usize {
        self.neighs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighs.is_empty()
    }

    fn resize(&mut self, num_particles: usize) {
        self.neighs.truncate(num_particles);
        let missing = num_particles - self.neighs.len();
        self.neighs.extend((0..missing).map(|_| Vec::new()));
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
struct RTreePoint {
    p: V3,
}

impl Point for RTreePoint {
    type Scalar = FT;

    const DIMENSIONS: usize = 3;

    fn generate(mut generator: impl FnMut(usize) -> Self::Scalar) -> Self {
        RTreePoint {
            p: V3::from_iterator((0..3).map(|d| generator(d))),
        }
    }

    fn nth(&self, index: usize) -> Self::Scalar {
        self.p[index]
    }

    fn nth_mut(&mut self, index: usize) -> &mut Self::Scalar {
        &mut self.p[index]
    }
}

type RTreeElem = GeomWithData<RTreePoint, u32>;

/// Upper bound on the number of cells of one array's grid.
const MAX_GRID_CELLS: i64 = 1 << 18;

/// Cell coordinates are clamped to `±CELL_COORD_LIMIT` before the integer cast.
const CELL_COORD_LIMIT: FT = (1u32 << 30) as FT;

#[inline(always)]
fn cell_coord(x: FT, cell_size: FT) -> i32 {
    (x / cell_size).floor().max(-CELL_COORD_LIMIT).min(CELL_COORD_LIMIT) as i32
}

/// Narrows the largest axes so that the grid holds at most `max_cells` cells.
/// Every axis keeps at least three cells.
fn cap_grid_size(size: [i64; 3], max_cells: i64) -> [i64; 3] {
    let mut order = [0, 1, 2];
    order.sort_by_key(|&d| size[d]);

    let mut capped = size;
    let mut budget = max_cells;
    for (i, &d) in order.iter().enumerate() {
        let axes_left = (3 - i) as u32;
        let mut fair = (budget as f64).powf(1. / axes_left as f64).floor() as i64;
        while fair > 1 && fair.saturating_pow(axes_left) > budget {
            fair -= 1;
        }
        while (fair + 1).saturating_pow(axes_left) <= budget {
            fair += 1;
        }
        capped[d] = size[d].min(fair.max(3));
        budget /= capped[d];
    }
    capped
}

struct Cell {
    particle_ids: Vec<u32>,
}

struct CellGrid {
    grid_min: VI<3>,
    size: V<usize, 3>,
    cells: Vec<Cell>,
}

impl CellGrid {
    fn new(grid_min: VI<3>, grid_size: V<usize, 3>) -> CellGrid {
        let num_elements = grid_size.fold(1, |acc, x| acc * x);
        CellGrid {
            grid_min,
            size: grid_size,
            cells: (0..num_elements)
                .map(|_| Cell {
                    particle_ids: Vec::new(),
                })
                .collect(),
        }
    }

    fn pos_to_idx(&self, mut cell_pos: VI<3>) -> usize {
        cell_pos -= self.grid_min;

        let mut multiplier = 1;
        let mut idx: usize = 0;
        for d in 0..3 {
            debug_assert!(0 <= cell_pos[d]);
            debug_assert!((cell_pos[d] as usize) < self.size[d]);
            idx += multiplier * cell_pos[d] as usize;
            multiplier *= self.size[d];
        }
        idx
    }

    fn get(&self, cell_pos: VI<3>) -> &Cell {
        &self.cells[self.pos_to_idx(cell_pos)]
    }

    fn get_mut(&mut self, cell_pos: VI<3>) -> &mut Cell {
        let idx = self.pos_to_idx(cell_pos);
        &mut self.cells[idx]
    }
}

/// Cell layout shared by all arrays. Particles outside of it are clamped into
/// the border cells, which keeps every interacting pair in adjacent cells.
#[derive(Debug, Clone, Copy)]
struct Domain {
    cells_min: VI<3>,
    cells_max: VI<3>,
    cell_size: FT,
}

impl Domain {
    fn cell_of(&self, position: &V3) -> VI<3> {
        let mut cell: VI<3> = position.map(|x| cell_coord(x, self.cell_size));
        for d in 0..3 {
            cell[d] = cell[d].max(self.cells_min[d]).min(self.cells_max[d] - 1);
        }
        cell
    }

    fn grid_size(&self) -> V<usize, 3> {
        (self.cells_max - self.cells_min).map(|x| x as usize)
    }
}

enum SpatialIndex {
    Grid(CellGrid),
    RStar(RTree<RTreeElem>),
}

struct ArrayPoints {
    positions: Vec<V3>,
    h: Vec<FT>,
    h_max: FT,
}

/// Finds all `j` with `|x_i - x_j| < radius_scale * (h_i + h_j) / 2`.
///
/// Positions and smoothing lengths are snapshotted by `update`; moving
/// particles afterwards has no effect until the next `update`.
pub struct NeighborhoodSearch {
    algorithm: NeighborhoodSearchAlgorithm,
    radius_scale: FT,
    use_cache: bool,

    points: Vec<ArrayPoints>,
    indices: Vec<SpatialIndex>,
    domain: Option<Domain>,
    domain_dirty: bool,

    context: (usize, usize),
    cache: NeighborhoodCache,
    cache_context: Option<(usize, usize)>,
}

impl NeighborhoodSearch {
    pub fn new(algorithm: NeighborhoodSearchAlgorithm, radius_scale: FT, use_cache: bool) -> Self {
        NeighborhoodSearch {
            algorithm,
            radius_scale,
            use_cache,
            points: Vec::new(),
            indices: Vec::new(),
            domain: None,
            domain_dirty: true,
            context: (0, 0),
            cache: NeighborhoodCache::new(0),
            cache_context: None,
        }
    }

    pub fn from_params(params: &EvaluatorParams, radius_scale: FT) -> Self {
        Self::new(
            params.neighborhood_search_algorithm,
            radius_scale,
            params.use_neighbor_cache,
        )
    }

    pub fn algorithm(&self) -> NeighborhoodSearchAlgorithm {
        self.algorithm
    }

    /// Cache of the current context, if it was built.
    pub fn cache(&self) -> Option<&NeighborhoodCache> {
        if self.use_cache && self.cache_context == Some(self.context) {
            Some(&self.cache)
        } else {
            None
        }
    }

    /// Bounding box of all finite positions, padded by one cell. Axes whose
    /// extent would exceed `MAX_GRID_CELLS` are narrowed to a window around the
    /// median particle; particles outside of it land in the border cells.
    fn compute_domain(&self) -> Domain {
        let h_max = self.points.iter().fold(0., |acc: FT, p| acc.max(p.h_max));
        let cell_size = if h_max > 0. && h_max.is_finite() {
            self.radius_scale * h_max
        } else {
            1.
        };

        let mut coords: [Vec<i32>; 3] = Default::default();
        for position in self.points.iter().flat_map(|p| p.positions.iter()) {
            for d in 0..3 {
                if position[d].is_finite() {
                    coords[d].push(cell_coord(position[d], cell_size));
                }
            }
        }

        let mut lo = [-1i64; 3];
        let mut hi = [2i64; 3];
        for d in 0..3 {
            if let (Some(min), Some(max)) = (coords[d].iter().min(), coords[d].iter().max()) {
                lo[d] = *min as i64 - 1;
                hi[d] = *max as i64 + 2;
            }
        }

        let wanted = [hi[0] - lo[0], hi[1] - lo[1], hi[2] - lo[2]];
        let size = cap_grid_size(wanted, MAX_GRID_CELLS);
        for d in 0..3 {
            if size[d] < wanted[d] {
                let mid = coords[d].len() / 2;
                let median = *coords[d].select_nth_unstable(mid).1 as i64;
                lo[d] = median - size[d] / 2;
                hi[d] = lo[d] + size[d];
                debug!(axis = d, cells = size[d], wanted = wanted[d], "capped neighbor grid extent");
            }
        }

        Domain {
            cells_min: VI::<3>::from_iterator(lo.iter().map(|&c| c as i32)),
            cells_max: VI::<3>::from_iterator(hi.iter().map(|&c| c as i32)),
            cell_size,
        }
    }

    fn build_index(&self, points: &ArrayPoints, domain: &Domain) -> SpatialIndex {
        match self.algorithm {
            NeighborhoodSearchAlgorithm::Grid => {
                let mut grid = CellGrid::new(domain.cells_min, domain.grid_size());
                for (particle_id, position) in points.positions.iter().enumerate() {
                    grid.get_mut(domain.cell_of(position))
                        .particle_ids
                        .push(particle_id as u32);
                }
                SpatialIndex::Grid(grid)
            }
            NeighborhoodSearchAlgorithm::RStar => {
                let elems: Vec<RTreeElem> = points
                    .positions
                    .iter()
                    .enumerate()
                    .map(|(idx, p)| RTreeElem::new(RTreePoint { p: *p }, idx as u32))
                    .collect();
                SpatialIndex::RStar(RTree::bulk_load(elems))
            }
        }
    }

    fn query(&self, (src, dst): (usize, usize), d_idx: usize, out: &mut Vec<u32>) {
        out.clear();

        let dst_points = &self.points[dst];
        let src_points = &self.points[src];
        let xi = dst_points.positions[d_idx];
        let hi = dst_points.h[d_idx];

        let mut visit = |j: u32| {
            let xj = src_points.positions[j as usize];
            let hj = src_points.h[j as usize];
            let s_ij = self.radius_scale * 0.5 * (hi + hj);
            if (xi - xj).norm_squared() < s_ij * s_ij {
                out.push(j);
            }
        };

        match &self.indices[src] {
            SpatialIndex::Grid(grid) => {
                if let Some(domain) = &self.domain {
                    let center = domain.cell_of(&xi);
                    for dz in -1..=1 {
                        for dy in -1..=1 {
                            for dx in -1..=1 {
                                let cell_pos = center + VI::<3>::new(dx, dy, dz);
                                if (0..3).any(|d| cell_pos[d] < domain.cells_min[d] || cell_pos[d] >= domain.cells_max[d]) {
                                    continue;
                                }
                                for &j in &grid.get(cell_pos).particle_ids {
                                    visit(j);
                                }
                            }
                        }
                    }
                }
            }
            SpatialIndex::RStar(rtree) => {
                let max_dist = self.radius_scale * 0.5 * (hi + src_points.h_max);
                for neigh in rtree.locate_within_distance(RTreePoint { p: xi }, max_dist * max_dist) {
                    visit(neigh.data);
                }
            }
        }
    }

    fn build_cache(&mut self) {
        let context = self.context;
        let num_dst = self.points[context.1].positions.len();

        let mut cache = std::mem::replace(&mut self.cache, NeighborhoodCache::new(0));
        cache.resize(num_dst);
        {
            let this = &*self;
            par_iter_mut1(&mut cache.neighs, |d_idx, neighs| {
                this.query(context, d_idx, neighs);
            });
        }
        trace!(src = context.0, dst = context.1, "rebuilt neighbor cache");

        self.cache = cache;
        self.cache_context = Some(context);
    }
}

impl NeighborSource for NeighborhoodSearch {
    fn set_context(&mut self, src_index: usize, dst_index: usize) {
        self.context = (src_index, dst_index);
        if self.use_cache && self.cache_context != Some(self.context) {
            self.build_cache();
        }
    }

    fn get_neighbors<'a>(&'a self, d_idx: usize, scratch: &'a mut Vec<u32>) -> &'a [u32] {
        if self.use_cache && self.cache_context == Some(self.context) {
            return self.cache.neighbors(d_idx);
        }
        self.query(self.context, d_idx, scratch);
        scratch
    }

    fn update_domain(&mut self) {
        self.domain_dirty = true;
    }

    fn update(&mut self, arrays: &[ParticleArray]) -> Result<(), EvalError> {
        let mut points = Vec::with_capacity(arrays.len());
        for array in arrays {
            let missing = |property: &str| EvalError::MissingProperty {
                array: array.name().to_string(),
                property: property.to_string(),
            };
            let x = array.property("x").ok_or_else(|| missing("x"))?;
            let y = array.property("y").ok_or_else(|| missing("y"))?;
            let z = array.property("z").ok_or_else(|| missing("z"))?;
            let h = array.property("h").ok_or_else(|| missing("h"))?;

            points.push(ArrayPoints {
                positions: (0..array.num_particles()).map(|i| vec3f(x[i], y[i], z[i])).collect(),
                h: h.to_vec(),
                h_max: h.iter().fold(0., |acc: FT, &v| acc.max(v)),
            });
        }
        self.points = points;

        // cells must stay at least as large as the largest support radius
        let h_max = self.points.iter().fold(0., |acc: FT, p| acc.max(p.h_max));
        let outgrown = self
            .domain
            .map_or(true, |domain| self.radius_scale * h_max > domain.cell_size);
        if self.domain_dirty || outgrown {
            let domain = self.compute_domain();
            debug!(
                cell_size = domain.cell_size,
                cells_min = ?domain.cells_min.as_slice(),
                cells_max = ?domain.cells_max.as_slice(),
                "recomputed neighbor search domain"
            );
            self.domain = Some(domain);
            self.domain_dirty = false;
        }

        let domain = self.domain.unwrap_or_else(|| self.compute_domain());
        self.indices = self.points.iter().map(|p| self.build_index(p, &domain)).collect();
        self.cache_context = None;
        Ok(())
    }

    fn use_cache(&self) -> bool {
        self.use_cache
    }
}

#[cfg(test)]
fn random_arrays(seed: u64) -> Vec<ParticleArray> {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    [("fluid", 300), ("solid", 120)]
        .iter()
        .map(|&(name, n)| {
            let mut sample = |lo: FT, hi: FT| (0..n).map(|_| rng.gen_range(lo..hi)).collect::<Vec<FT>>();
            let x = sample(-1., 1.);
            let y = sample(-1., 1.);
            let z = sample(-0.2, 0.2);
            let h = sample(0.05, 0.15);
            ParticleArray::new(name, n)
                .with_property("x", x)
                .with_property("y", y)
                .with_property("z", z)
                .with_property("h", h)
        })
        .collect()
}

#[cfg(test)]
fn brute_force_neighbors(arrays: &[ParticleArray], src: usize, dst: usize, d_idx: usize) -> Vec<u32> {
    let xi = arrays[dst].position(d_idx).unwrap();
    let hi = arrays[dst].property("h").unwrap()[d_idx];
    let h = arrays[src].property("h").unwrap();
    (0..arrays[src].num_particles())
        .filter(|&j| {
            let s_ij = 2. * 0.5 * (hi + h[j]);
            (xi - arrays[src].position(j).unwrap()).norm_squared() < s_ij * s_ij
        })
        .map(|j| j as u32)
        .collect()
}

#[test]
fn grid_and_rstar_match_brute_force() {
    let arrays = random_arrays(42);

    for algorithm in [NeighborhoodSearchAlgorithm::Grid, NeighborhoodSearchAlgorithm::RStar] {
        for use_cache in [false, true] {
            let mut search = NeighborhoodSearch::new(algorithm, 2., use_cache);
            search.update(&arrays).unwrap();

            let mut scratch = Vec::new();
            for src in 0..arrays.len() {
                for dst in 0..arrays.len() {
                    search.set_context(src, dst);
                    assert_eq!(search.cache().is_some(), use_cache);
                    for d_idx in 0..arrays[dst].num_particles() {
                        let mut found = search.get_neighbors(d_idx, &mut scratch).to_vec();
                        found.sort_unstable();
                        assert_eq!(
                            found,
                            brute_force_neighbors(&arrays, src, dst, d_idx),
                            "{:?} cache={} src={} dst={} d_idx={}",
                            algorithm,
                            use_cache,
                            src,
                            dst,
                            d_idx
                        );
                    }
                }
            }
        }
    }
}

#[test]
fn particles_leaving_the_domain_are_still_found() {
    let mut arrays = random_arrays(7);
    let mut search = NeighborhoodSearch::new(NeighborhoodSearchAlgorithm::Grid, 2., false);
    search.update(&arrays).unwrap();

    // move everything far away without marking the domain dirty
    for coord in ["x", "y"] {
        for v in arrays[0].property_mut(coord).unwrap() {
            *v += 5.;
        }
    }
    search.update(&arrays).unwrap();

    let mut scratch = Vec::new();
    search.set_context(0, 0);
    for d_idx in 0..arrays[0].num_particles() {
        let mut found = search.get_neighbors(d_idx, &mut scratch).to_vec();
        found.sort_unstable();
        assert_eq!(found, brute_force_neighbors(&arrays, 0, 0, d_idx));
    }
}

#[test]
fn far_outlier_keeps_the_grid_bounded() {
    for outlier in [1e5, 1e12, -1e30] {
        let mut arrays = random_arrays(11);
        arrays[0].property_mut("x").unwrap()[0] = outlier;

        let mut search = NeighborhoodSearch::new(NeighborhoodSearchAlgorithm::Grid, 2., false);
        search.update(&arrays).unwrap();

        for index in &search.indices {
            match index {
                SpatialIndex::Grid(grid) => assert!(grid.cells.len() as i64 <= MAX_GRID_CELLS),
                SpatialIndex::RStar(_) => unreachable!(),
            }
        }

        let mut scratch = Vec::new();
        for src in 0..arrays.len() {
            for dst in 0..arrays.len() {
                search.set_context(src, dst);
                for d_idx in 0..arrays[dst].num_particles() {
                    let mut found = search.get_neighbors(d_idx, &mut scratch).to_vec();
                    found.sort_unstable();
                    assert_eq!(found, brute_force_neighbors(&arrays, src, dst, d_idx), "outlier={}", outlier);
                }
            }
        }
    }
}

#[test]
fn grid_cap_shrinks_the_largest_axis() {
    assert_eq!(cap_grid_size([10, 10, 4], 1000), [10, 10, 4]);
    assert_eq!(cap_grid_size([333_600, 10, 4], 4000), [100, 10, 4]);
    assert_eq!(cap_grid_size([1 << 31, 1 << 31, 4], 1 << 18), [256, 256, 4]);
}

#[test]
fn particle_is_its_own_neighbor() {
    let arrays = random_arrays(3);
    let mut search = NeighborhoodSearch::new(NeighborhoodSearchAlgorithm::RStar, 2., true);
    search.update(&arrays).unwrap();
    search.set_context(1, 1);

    let mut scratch = Vec::new();
    for d_idx in 0..arrays[1].num_particles() {
        assert!(search.get_neighbors(d_idx, &mut scratch).contains(&(d_idx as u32)));
    }
}
