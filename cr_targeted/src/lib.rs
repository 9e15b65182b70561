//! Targeting performance metrics for runs using a curated gene panel.
//!
//! The computation proceeds through four pure stages:
//! 1. [`feature_summary`]: aggregate per-gene read/UMI counts over all
//!    barcodes and over cell-associated barcodes, and flag targeted genes.
//! 2. [`rpu_stats`]: summarize the reads-per-UMI distribution within each
//!    {targeted, off-target} x {cells, all-barcodes} stratum.
//! 3. [`enrichment`]: classify genes as enriched relative to background
//!    using a threshold fit by an external mixture model, with a fallback
//!    that withholds the call on shallow data, and count genes at each step
//!    of the data-loss hierarchy.
//! 4. [`summary`]: assemble the flat metrics summary and the per-feature
//!    table, and write both artifacts.
//!
//! Statistically degenerate quantities (empty strata, zero denominators,
//! failed fits) are carried as `Option<f64>` and reported as `"NaN"`; they
//! never abort the computation. Only collaborator failures (unreadable
//! inputs, a fit routine rejecting its input) surface as errors.

pub mod enrichment;
pub mod feature_summary;
pub mod report;
pub mod rpu_stats;
pub mod summary;

pub use crate::enrichment::{
    ClassCounts, ClassifiedFeature, EnrichmentCall, EnrichmentFit, EnrichmentModel, FitMode,
};
pub use crate::feature_summary::{FeatureCounts, FeatureSummary, FeatureType,
    MoleculeSummarySource};
pub use crate::report::JsonReporter;
pub use crate::summary::{
    compute_targeted_metrics, write_per_feature_csv, write_summary_json, CountMatrixSummary,
    CounterMetrics, TargetPanelSummary, TargetedMetrics, TargetedMetricsArgs,
};

/// Minimum cell-associated UMI count for a gene to be considered
/// quantifiable. Genes below this floor are excluded from RPU statistics and
/// from the enrichment fit population.
pub const MIN_UMIS_QUANTIFIABLE: u64 = 10;

/// Floor on the mean reads-per-UMI of targeted genes in cells. Below it the
/// run is considered too shallow for the enrichment fit to be trusted.
pub const MIN_RPU_THRESHOLD: f64 = 2.5;

/// Fraction cutoff used by the fallback policy when deciding whether to
/// discard a fitted enrichment threshold.
pub const ENRICHMENT_FRAC_THRESHOLD: f64 = 0.5;
