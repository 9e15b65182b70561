//! Per-gene aggregation of read and UMI counts from the molecule-level
//! source, split by whether the originating barcode was called a cell.

use crate::MIN_UMIS_QUANTIFIABLE;
use anyhow::Result;
use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use stats_utils::robust_divide;

/// Feature classes that can appear in the molecule source. Only
/// [`FeatureType::Gene`] features participate in targeting metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeatureType {
    /// Gene expression features
    #[serde(rename = "Gene Expression")]
    Gene,
    /// Antibody capture features
    #[serde(rename = "Antibody Capture")]
    AntibodyCapture,
    /// CRISPR guide capture features
    #[serde(rename = "CRISPR Guide Capture")]
    CrisprGuideCapture,
    /// Multiplexing capture features
    #[serde(rename = "Multiplexing Capture")]
    MultiplexingCapture,
    /// Custom features
    #[serde(rename = "Custom")]
    Custom,
}

impl FeatureType {
    /// Return the string representation of this feature type.
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureType::Gene => "Gene Expression",
            FeatureType::AntibodyCapture => "Antibody Capture",
            FeatureType::CrisprGuideCapture => "CRISPR Guide Capture",
            FeatureType::MultiplexingCapture => "Multiplexing Capture",
            FeatureType::Custom => "Custom",
        }
    }
}

/// Raw per-feature counts summed over the molecule records of one run.
/// The `_cells` counts are restricted to barcodes called as cells; that
/// classification is made upstream and supplied with the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureCounts {
    pub feature_id: String,
    pub feature_name: String,
    pub feature_type: FeatureType,
    pub num_reads: u64,
    pub num_umis: u64,
    pub num_reads_cells: u64,
    pub num_umis_cells: u64,
}

/// Abstract source of molecule-level aggregates, e.g. a molecule info file.
/// Failures reading the source abort the metrics computation.
pub trait MoleculeSummarySource {
    /// Per-feature read/UMI totals for gene-expression libraries.
    fn feature_counts(&self) -> Result<Vec<FeatureCounts>>;

    /// Ids of the features included in the loaded target panel.
    fn target_feature_ids(&self) -> Result<FxHashSet<String>>;

    /// Total raw read pairs across gene-expression libraries.
    fn raw_read_pairs(&self) -> Result<u64>;
}

/// One row of the per-feature metrics table: raw counts plus the derived
/// reads-per-UMI columns. Ratio columns are `None` when their denominator is
/// zero; log columns are `None` when the ratio is zero or undefined.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureSummary {
    pub feature_id: String,
    pub feature_name: String,
    pub feature_type: FeatureType,
    pub is_targeted: bool,
    pub num_reads: u64,
    pub num_umis: u64,
    pub num_reads_cells: u64,
    pub num_umis_cells: u64,
    pub mean_reads_per_umi: Option<f64>,
    pub mean_reads_per_umi_log10: Option<f64>,
    pub mean_reads_per_umi_cells: Option<f64>,
    pub mean_reads_per_umi_cells_log10: Option<f64>,
}

/// log10 of a derived ratio; zero and "no value" both map to "no value".
fn safe_log10(x: Option<f64>) -> Option<f64> {
    match x {
        Some(v) if v > 0.0 => Some(v.log10()),
        _ => None,
    }
}

impl FeatureSummary {
    fn new(counts: FeatureCounts, is_targeted: bool) -> Self {
        let FeatureCounts {
            feature_id,
            feature_name,
            feature_type,
            num_reads,
            num_umis,
            num_reads_cells,
            num_umis_cells,
        } = counts;
        let mean_reads_per_umi = robust_divide(num_reads as f64, num_umis as f64);
        let mean_reads_per_umi_cells =
            robust_divide(num_reads_cells as f64, num_umis_cells as f64);
        FeatureSummary {
            feature_id,
            feature_name,
            feature_type,
            is_targeted,
            num_reads,
            num_umis,
            num_reads_cells,
            num_umis_cells,
            mean_reads_per_umi,
            mean_reads_per_umi_log10: safe_log10(mean_reads_per_umi),
            mean_reads_per_umi_cells,
            mean_reads_per_umi_cells_log10: safe_log10(mean_reads_per_umi_cells),
        }
    }

    /// True if this gene meets the quantifiability floor in the cell stratum.
    /// Quantifiability is always judged on cell-associated UMIs, whichever
    /// stratum a downstream statistic is computed over.
    pub fn is_quantifiable(&self) -> bool {
        self.num_umis_cells >= MIN_UMIS_QUANTIFIABLE
    }

    /// True if at least one cell-associated UMI was observed.
    pub fn is_detected(&self) -> bool {
        self.num_umis_cells > 0
    }
}

/// Build one summary row per gene-expression feature. Features of any other
/// class are dropped from the table entirely. The returned row set is the
/// gene universe for the whole downstream computation: later stages append
/// derived values but never add or remove rows.
pub fn build_feature_summary(
    counts: Vec<FeatureCounts>,
    target_ids: &FxHashSet<String>,
) -> Vec<FeatureSummary> {
    counts
        .into_iter()
        .filter(|c| c.feature_type == FeatureType::Gene)
        .map(|c| {
            let is_targeted = target_ids.contains(&c.feature_id);
            FeatureSummary::new(c, is_targeted)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn gene_counts(
        id: &str,
        num_reads: u64,
        num_umis: u64,
        num_reads_cells: u64,
        num_umis_cells: u64,
    ) -> FeatureCounts {
        FeatureCounts {
            feature_id: id.to_string(),
            feature_name: format!("{id}-name"),
            feature_type: FeatureType::Gene,
            num_reads,
            num_umis,
            num_reads_cells,
            num_umis_cells,
        }
    }

    #[test]
    fn test_ratio_and_log_columns() {
        let target_ids: FxHashSet<String> = ["G1".to_string()].into_iter().collect();
        let rows = build_feature_summary(vec![gene_counts("G1", 200, 20, 100, 10)], &target_ids);
        let row = &rows[0];
        assert!(row.is_targeted);
        assert_eq!(row.mean_reads_per_umi, Some(10.0));
        assert_eq!(row.mean_reads_per_umi_log10, Some(1.0));
        assert_eq!(row.mean_reads_per_umi_cells, Some(10.0));
        assert_eq!(row.mean_reads_per_umi_cells_log10, Some(1.0));
    }

    #[test]
    fn test_zero_umis_yield_no_value() {
        let rows = build_feature_summary(
            vec![gene_counts("G1", 5, 0, 0, 0)],
            &FxHashSet::default(),
        );
        let row = &rows[0];
        assert!(!row.is_targeted);
        assert_eq!(row.mean_reads_per_umi, None);
        assert_eq!(row.mean_reads_per_umi_log10, None);
        assert_eq!(row.mean_reads_per_umi_cells, None);
        assert_eq!(row.mean_reads_per_umi_cells_log10, None);
        assert!(!row.is_detected());
        assert!(!row.is_quantifiable());
    }

    #[test]
    fn test_non_gene_features_are_dropped() {
        let mut counts = vec![gene_counts("G1", 10, 5, 10, 5)];
        counts.push(FeatureCounts {
            feature_type: FeatureType::AntibodyCapture,
            ..gene_counts("AB1", 50, 25, 50, 25)
        });
        let rows = build_feature_summary(counts, &FxHashSet::default());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].feature_id, "G1");
    }

    #[test]
    fn test_quantifiability_floor_is_on_cell_umis() {
        // plenty of UMIs overall but below the floor in cells
        let rows = build_feature_summary(
            vec![gene_counts("G1", 1000, 500, 18, 9)],
            &FxHashSet::default(),
        );
        assert!(rows[0].is_detected());
        assert!(!rows[0].is_quantifiable());
    }

    #[test]
    fn test_feature_type_serde_names() {
        let json = serde_json::to_string(&FeatureType::Gene).unwrap();
        assert_eq!(json, r#""Gene Expression""#);
        let parsed: FeatureType = serde_json::from_str(r#""CRISPR Guide Capture""#).unwrap();
        assert_eq!(parsed, FeatureType::CrisprGuideCapture);
    }
}
