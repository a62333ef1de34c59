/// wxqc_service: hourly weather-station QA/QC service.
///
/// # Module structure
///
/// ```text
/// wxqc_service
/// ├── model       - shared data types (HourlySeries, YearWindow, FlagVector, QcError, …)
/// ├── config      - station profiles and settings loader (stations.toml)
/// ├── variables   - static variable registry: stage lists, flag codes, dominance
/// ├── segment     - hourly reindexing and water-year boundary lookup
/// ├── filters
/// │   ├── range       - static step range test and iterative shave
/// │   ├── thresholds  - clamp and negative-to-zero
/// │   ├── duplicates  - consecutive and windowed duplicate removal
/// │   ├── outliers    - monthly sigma, sliding window, false zero
/// │   ├── seasonal    - summer zeroing after melt-out
/// │   ├── precip      - reset, cumulative, drainage, evaporation
/// │   └── manual      - per-station manual corrections
/// ├── interpolate - gap-limited linear and vapour-pressure RH interpolation
/// ├── flags       - per-stage flag merge with dominance rules
/// ├── repository  - series repository trait, in-memory store, CSV sinks
/// ├── db          - PostgreSQL connection validation and repository
/// └── pipeline    - per-unit orchestration and the batch runner
/// ```

/// Public modules
pub mod config;
pub mod db;
pub mod filters;
pub mod flags;
pub mod interpolate;
pub mod model;
pub mod pipeline;
pub mod repository;
pub mod segment;
pub mod variables;
