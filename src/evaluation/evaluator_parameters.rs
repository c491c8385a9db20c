use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborhoodSearchAlgorithm {
    // uniform cells sized by the largest support radius
    Grid,
    RStar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorParams {
    /// Size of the worker pool, `0` picks the number of logical cores.
    pub num_threads: usize,

    pub use_neighbor_cache: bool,
    pub neighborhood_search_algorithm: NeighborhoodSearchAlgorithm,

    // time the groups and the neighbor refreshes
    pub collect_statistics: bool,
}

impl Default for EvaluatorParams {
    fn default() -> Self {
        EvaluatorParams {
            num_threads: 0,
            use_neighbor_cache: true,
            neighborhood_search_algorithm: NeighborhoodSearchAlgorithm::Grid,
            collect_statistics: false,
        }
    }
}

impl EvaluatorParams {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    pub fn with_neighbor_cache(mut self, use_neighbor_cache: bool) -> Self {
        self.use_neighbor_cache = use_neighbor_cache;
        self
    }

    pub fn with_search_algorithm(mut self, algorithm: NeighborhoodSearchAlgorithm) -> Self {
        self.neighborhood_search_algorithm = algorithm;
        self
    }

    /// Worker count after resolving `0` to the number of logical cores.
    pub fn resolved_num_threads(&self) -> usize {
        if self.num_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            self.num_threads
        }
    }
}

#[test]
fn evaluator_params_fill_missing_fields_with_defaults() {
    let params = EvaluatorParams::from_yaml_str("num_threads: 4\nneighborhood_search_algorithm: RStar\n").unwrap();
    assert_eq!(params.num_threads, 4);
    assert_eq!(params.neighborhood_search_algorithm, NeighborhoodSearchAlgorithm::RStar);
    assert!(params.use_neighbor_cache);
    assert!(!params.collect_statistics);
    assert_eq!(params.resolved_num_threads(), 4);
}

#[test]
fn evaluator_params_reject_unknown_algorithm() {
    assert!(EvaluatorParams::from_yaml_str("neighborhood_search_algorithm: Octree\n").is_err());
}
