//! Distribution statistics of reads-per-UMI, stratified by targeting status
//! and by barcode population.

use crate::feature_summary::FeatureSummary;
use crate::report::JsonReporter;
use stats_utils::{mean, median, quantile, robust_divide, sample_std_dev};

/// Which barcode population a reads-per-UMI value is computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarcodePopulation {
    /// Barcodes classified as cells.
    Cells,
    /// All observed barcodes.
    All,
}

/// Summary statistics of the reads-per-UMI distribution in one stratum.
///
/// An empty quantifiable stratum reports every statistic as the literal zero
/// ("confidently zero"), which is deliberately distinct from the "no value"
/// produced by a degenerate computation over a nonempty stratum (e.g. a CV
/// whose mean is zero).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpuStats {
    pub mean: Option<f64>,
    /// Coefficient of variation: sample standard deviation over mean.
    pub cv: Option<f64>,
    pub median: Option<f64>,
    /// Interquartile spread normalized by the median: (q75 - q25) / median.
    pub iqr_norm: Option<f64>,
    /// 80th percentile.
    pub perc80: Option<f64>,
}

impl RpuStats {
    fn zero() -> Self {
        RpuStats {
            mean: Some(0.0),
            cv: Some(0.0),
            median: Some(0.0),
            iqr_norm: Some(0.0),
            perc80: Some(0.0),
        }
    }

    fn from_values(values: &[f64]) -> Self {
        let mean_rpu = mean(values);
        let cv = match (sample_std_dev(values), mean_rpu) {
            (Some(sd), Some(m)) => robust_divide(sd, m),
            _ => None,
        };
        let median_rpu = median(values);
        let iqr_norm = match (quantile(values, 0.75), quantile(values, 0.25), median_rpu) {
            (Some(q75), Some(q25), Some(m)) => robust_divide(q75 - q25, m),
            _ => None,
        };
        RpuStats {
            mean: mean_rpu,
            cv,
            median: median_rpu,
            iqr_norm,
            perc80: quantile(values, 0.80),
        }
    }

    /// Compute the statistics for one stratum. The restriction to
    /// quantifiable genes is always on the cell-stratum UMI count, even when
    /// summarizing all-barcode RPU values; individual "no value" RPU entries
    /// within the restricted set are skipped.
    pub fn compute(
        features: &[FeatureSummary],
        targeted: bool,
        population: BarcodePopulation,
    ) -> Self {
        let quantifiable: Vec<&FeatureSummary> = features
            .iter()
            .filter(|f| f.is_targeted == targeted && f.is_quantifiable())
            .collect();
        if quantifiable.is_empty() {
            return RpuStats::zero();
        }
        let values: Vec<f64> = quantifiable
            .iter()
            .filter_map(|f| match population {
                BarcodePopulation::Cells => f.mean_reads_per_umi_cells,
                BarcodePopulation::All => f.mean_reads_per_umi,
            })
            .collect();
        RpuStats::from_values(&values)
    }
}

/// Reads-per-UMI statistics for all four strata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpuMetrics {
    pub targeted_cells: RpuStats,
    pub targeted_all: RpuStats,
    pub offtarget_cells: RpuStats,
    pub offtarget_all: RpuStats,
}

impl RpuMetrics {
    /// Compute all four strata over the gene table.
    pub fn compute(features: &[FeatureSummary]) -> Self {
        RpuMetrics {
            targeted_cells: RpuStats::compute(features, true, BarcodePopulation::Cells),
            targeted_all: RpuStats::compute(features, true, BarcodePopulation::All),
            offtarget_cells: RpuStats::compute(features, false, BarcodePopulation::Cells),
            offtarget_all: RpuStats::compute(features, false, BarcodePopulation::All),
        }
    }

    /// Flatten to metric keys. Each statistic appears once per stratum; in
    /// spatial mode the mean family is additionally duplicated under a
    /// `spatial_` prefix for the websummary consumer.
    pub fn to_json_reporter(&self, is_spatial: bool) -> JsonReporter {
        let mut reporter = JsonReporter::default();
        let strata = [
            (&self.targeted_cells, "_cells", "on_target"),
            (&self.targeted_all, "", "on_target"),
            (&self.offtarget_cells, "_cells", "off_target"),
            (&self.offtarget_all, "", "off_target"),
        ];
        for (stats, cells_suffix, target_suffix) in strata {
            if is_spatial {
                reporter.insert_optional(
                    format!("spatial_mean_reads_per_umi_per_gene{cells_suffix}_{target_suffix}"),
                    stats.mean,
                );
            }
            for (stat_name, value) in [
                ("mean", stats.mean),
                ("cv", stats.cv),
                ("median", stats.median),
                ("iqrnorm", stats.iqr_norm),
                ("perc80", stats.perc80),
            ] {
                reporter.insert_optional(
                    format!("{stat_name}_reads_per_umi_per_gene{cells_suffix}_{target_suffix}"),
                    value,
                );
            }
        }
        reporter
    }
}
