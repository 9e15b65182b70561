//! Assembly of the flat targeted metrics summary and the per-feature table,
//! and the writers for both artifacts.

use crate::enrichment::{
    compute_enrichment, ClassifiedFeature, EnrichmentCall, EnrichmentModel, FitMode,
};
use crate::feature_summary::{build_feature_summary, MoleculeSummarySource};
use crate::report::JsonReporter;
use crate::rpu_stats::RpuMetrics;
use crate::MIN_RPU_THRESHOLD;
use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use stats_utils::{median, robust_divide};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Panel types that are not supported for spatial runs. Processing one sets
/// the `targeted_unsupported_panel` warning metric.
pub const SPATIAL_DISALLOWED_PANEL_TYPES: &[&str] = &["hybrid_capture"];

/// Per-cell aggregates of the filtered count matrix, restricted to targeted
/// features. Computed by an external collaborator that owns the matrix
/// format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountMatrixSummary {
    /// Sum of targeted-feature UMIs in each cell.
    pub targeted_umis_per_cell: Vec<u64>,
    /// Number of targeted features with at least one UMI in each cell.
    pub targeted_genes_per_cell: Vec<u64>,
    /// Total number of cells called.
    pub num_cells: u64,
}

/// Confidence-mapping fractions computed by the upstream counter stage.
/// The upstream summary reports an undefined fraction as the string
/// `"NaN"`, same as our own summary output; both fields accept that
/// representation as "no value".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CounterMetrics {
    /// Fraction of reads confidently mapped to the targeted transcriptome.
    #[serde(
        rename = "multi_transcriptome_targeted_conf_mapped_reads_frac",
        with = "crate::report::nan_string",
        default
    )]
    pub targeted_conf_mapped_reads_frac: Option<f64>,
    /// Fraction of reads confidently mapped to untargeted genes.
    #[serde(
        rename = "multi_transcriptome_untargeted_conf_mapped_reads_frac",
        with = "crate::report::nan_string",
        default
    )]
    pub untargeted_conf_mapped_reads_frac: Option<f64>,
}

/// Descriptor of the loaded target panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPanelSummary {
    pub target_panel_name: String,
    pub target_panel_type: String,
}

/// Inputs consumed by the metrics computation, beyond the molecule source
/// and the fitting collaborator.
pub struct TargetedMetricsArgs<'a> {
    pub molecule_source: &'a dyn MoleculeSummarySource,
    pub matrix_summary: CountMatrixSummary,
    pub counter_metrics: CounterMetrics,
    /// Required when `is_spatial` is set; ignored otherwise.
    pub target_panel_summary: Option<TargetPanelSummary>,
    pub is_spatial: bool,
    pub fit_mode: FitMode,
}

/// Output of the pipeline: the flat metrics summary plus the per-feature
/// table, both held in memory until written.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetedMetrics {
    pub summary: JsonReporter,
    pub per_feature: Vec<ClassifiedFeature>,
}

fn median_of_counts(counts: &[u64]) -> Option<f64> {
    let values: Vec<f64> = counts.iter().map(|&x| x as f64).collect();
    median(&values)
}

/// Compute the full targeted metrics summary and per-feature table.
///
/// Deterministic and idempotent: identical inputs yield identical outputs,
/// down to the serialized bytes of both artifacts. Statistically degenerate
/// quantities are reported as "no value"; only collaborator failures return
/// an error, aborting the run with no partial output.
pub fn compute_targeted_metrics(
    args: TargetedMetricsArgs<'_>,
    model: &dyn EnrichmentModel,
) -> Result<TargetedMetrics> {
    let mut summary = JsonReporter::default();

    summary.insert_optional(
        "median_umis_per_cell_on_target",
        median_of_counts(&args.matrix_summary.targeted_umis_per_cell),
    );
    summary.insert_optional(
        "median_genes_per_cell_on_target",
        median_of_counts(&args.matrix_summary.targeted_genes_per_cell),
    );

    let total_read_pairs = args.molecule_source.raw_read_pairs()?;
    let frac_on_target = args.counter_metrics.targeted_conf_mapped_reads_frac;
    summary.insert_optional(
        "total_targeted_reads_per_filtered_bc",
        frac_on_target.and_then(|frac| {
            robust_divide(
                frac * total_read_pairs as f64,
                args.matrix_summary.num_cells as f64,
            )
        }),
    );
    // upstream fractions re-keyed with the on/off-target suffix convention
    summary.insert_optional("multi_frac_conf_transcriptomic_reads_on_target", frac_on_target);
    summary.insert_optional(
        "multi_frac_conf_transcriptomic_reads_off_target",
        args.counter_metrics.untargeted_conf_mapped_reads_frac,
    );

    if args.is_spatial {
        let panel = args
            .target_panel_summary
            .as_ref()
            .context("target panel summary is required for spatial runs")?;
        summary.insert(
            "targeted_unsupported_panel",
            SPATIAL_DISALLOWED_PANEL_TYPES.contains(&panel.target_panel_type.as_str()),
        );
    }

    let feature_counts = args.molecule_source.feature_counts()?;
    let target_ids = args.molecule_source.target_feature_ids()?;
    let features = build_feature_summary(feature_counts, &target_ids);

    // targeted sequencing saturation over the full, unfiltered gene set
    let (total_targeted_reads, total_targeted_umis) = features
        .iter()
        .filter(|f| f.is_targeted)
        .fold((0u64, 0u64), |(reads, umis), f| {
            (reads + f.num_reads, umis + f.num_umis)
        });
    summary.insert_optional(
        "multi_cdna_pcr_dupe_reads_frac_on_target",
        robust_divide(
            total_targeted_reads as f64 - total_targeted_umis as f64,
            total_targeted_reads as f64,
        ),
    );

    let rpu_metrics = RpuMetrics::compute(&features);
    // when the targeted mean RPU in cells is undefined or too low, the run
    // is too shallow for the enrichment fit to be trusted
    let disable_rpu_enrichments = rpu_metrics
        .targeted_cells
        .mean
        .map_or(true, |rpu| rpu < MIN_RPU_THRESHOLD);
    debug!("disable_rpu_enrichments={disable_rpu_enrichments}");
    summary.merge(rpu_metrics.to_json_reporter(args.is_spatial));

    let (per_feature, enrichment_reporter) = compute_enrichment(
        features,
        model,
        args.fit_mode,
        disable_rpu_enrichments,
        args.is_spatial,
    )?;
    summary.merge(enrichment_reporter);

    Ok(TargetedMetrics {
        summary,
        per_feature,
    })
}

/// Write the flat metrics summary as pretty-printed JSON. Keys serialize in
/// sorted order and "no value" entries render as `"NaN"`.
pub fn write_summary_json(summary: &JsonReporter, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(BufWriter::new(file), summary)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

fn format_optional(x: Option<f64>) -> String {
    x.map_or_else(|| "NaN".to_string(), |v| v.to_string())
}

fn format_call(call: EnrichmentCall) -> &'static str {
    match call {
        EnrichmentCall::Enriched => "TRUE",
        EnrichmentCall::NotEnriched => "FALSE",
        EnrichmentCall::Undetermined => "NaN",
    }
}

/// Write the per-feature metrics table as CSV, one row per gene-expression
/// feature, in the aggregation order of the input.
pub fn write_per_feature_csv(per_feature: &[ClassifiedFeature], path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record([
        "feature_id",
        "feature_name",
        "feature_type",
        "is_targeted",
        "num_reads",
        "num_umis",
        "num_reads_cells",
        "num_umis_cells",
        "mean_reads_per_umi",
        "mean_reads_per_umi_log10",
        "mean_reads_per_umi_cells",
        "mean_reads_per_umi_cells_log10",
        "enrichment",
    ])?;
    for row in per_feature {
        let summary = &row.summary;
        writer.write_record([
            summary.feature_id.clone(),
            summary.feature_name.clone(),
            summary.feature_type.as_str().to_string(),
            summary.is_targeted.to_string(),
            summary.num_reads.to_string(),
            summary.num_umis.to_string(),
            summary.num_reads_cells.to_string(),
            summary.num_umis_cells.to_string(),
            format_optional(summary.mean_reads_per_umi),
            format_optional(summary.mean_reads_per_umi_log10),
            format_optional(summary.mean_reads_per_umi_cells),
            format_optional(summary.mean_reads_per_umi_cells_log10),
            format_call(row.enrichment).to_string(),
        ])?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
