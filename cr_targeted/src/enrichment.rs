//! Enrichment classification of genes from the bimodal distribution of
//! log10 reads-per-UMI in cells, plus the data-loss hierarchy counts.

use crate::feature_summary::FeatureSummary;
use crate::report::{optional_value, JsonReporter};
use crate::ENRICHMENT_FRAC_THRESHOLD;
use anyhow::Result;
use log::warn;
use serde_json::Value;
use stats_utils::robust_divide;

/// Which gene population the two-component mixture is fit over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitMode {
    /// Fit the components to off-target genes only. The fitted threshold
    /// separates targeted genes from background and is not interpreted as a
    /// call for off-target genes.
    OfftargetsOnly,
    /// Fit both components over all genes with tied component variances.
    BothTied,
    /// Fit both components over all genes with free component variances.
    BothSpherical,
}

/// Per-class gene counts relative to the fitted threshold, as returned by
/// the fitting collaborator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassCounts {
    pub targeted_enriched: i64,
    pub targeted_not_enriched: i64,
    pub offtarget_enriched: i64,
    pub offtarget_not_enriched: i64,
}

/// Result of the external two-component mixture fit over log10 RPU values.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentFit {
    /// log10 RPU cutoff above which a gene is considered enriched, or `None`
    /// if the fit found no reliable separation.
    pub log_rpu_threshold: Option<f64>,
    /// Mean of the high (enriched) component.
    pub mu_high: Option<f64>,
    /// Mean of the low (background) component.
    pub mu_low: Option<f64>,
    /// Standard deviation of the high component.
    pub sd_high: Option<f64>,
    /// Standard deviation of the low component.
    pub sd_low: Option<f64>,
    /// Mixture weight of the high component.
    pub alpha_high: Option<f64>,
    /// Mixture weight of the low component.
    pub alpha_low: Option<f64>,
    /// Gene counts per class relative to the threshold.
    pub class_counts: ClassCounts,
}

/// External mixture-model collaborator. Treated as a black box returning
/// deterministic output for deterministic input; an error from the fit
/// routine (e.g. on malformed input) aborts the metrics computation.
pub trait EnrichmentModel {
    /// Fit a two-component mixture to `values` (log10 RPU in cells), with
    /// `labels` marking which observations belong to targeted genes.
    fn fit(&self, labels: &[bool], values: &[f64], mode: FitMode) -> Result<EnrichmentFit>;
}

/// Tri-state per-gene enrichment call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrichmentCall {
    Enriched,
    NotEnriched,
    /// No surviving threshold, an undefined log RPU for this gene, or an
    /// off-target gene under [`FitMode::OfftargetsOnly`].
    Undetermined,
}

/// A gene table row together with its enrichment call.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedFeature {
    pub summary: FeatureSummary,
    pub enrichment: EnrichmentCall,
}

/// Decision table for discarding an otherwise-valid fit when the caller has
/// flagged the run as too shallow (`disable_rpu_enrichments`). Any row
/// matching means the fit is discarded:
///
/// | condition                                                        |
/// |------------------------------------------------------------------|
/// | frac_on_target_genes_enriched has no value                        |
/// | frac_on_target_genes_enriched < 0.5                               |
/// | mode is BothTied/BothSpherical and frac_off_target... > 0.5       |
fn should_discard_fit(mode: FitMode, frac_on: Option<f64>, frac_off: Option<f64>) -> bool {
    let frac_on_unreliable = match frac_on {
        None => true,
        Some(f) => f < ENRICHMENT_FRAC_THRESHOLD,
    };
    let frac_off_unreliable = matches!(mode, FitMode::BothTied | FitMode::BothSpherical)
        && frac_off.is_some_and(|f| f > ENRICHMENT_FRAC_THRESHOLD);
    frac_on_unreliable || frac_off_unreliable
}

fn classify_gene(
    summary: &FeatureSummary,
    threshold: Option<f64>,
    mode: FitMode,
) -> EnrichmentCall {
    let Some(threshold) = threshold else {
        return EnrichmentCall::Undetermined;
    };
    // the threshold separates targeted genes from background; under the
    // off-target-restricted fit it is not a call for off-target genes
    if mode == FitMode::OfftargetsOnly && !summary.is_targeted {
        return EnrichmentCall::Undetermined;
    }
    match summary.mean_reads_per_umi_cells_log10 {
        None => EnrichmentCall::Undetermined,
        Some(log_rpu) if log_rpu > threshold => EnrichmentCall::Enriched,
        Some(_) => EnrichmentCall::NotEnriched,
    }
}

/// Count genes at each stage of the data-loss hierarchy, per target class:
/// detected means at least one cell UMI, quantifiable means at least the
/// UMI floor. Computed whether or not a threshold was found.
fn loss_hierarchy_counts(features: &[FeatureSummary], is_spatial: bool) -> JsonReporter {
    let mut reporter = JsonReporter::default();
    for targeted in [true, false] {
        let suffix = if targeted { "on_target" } else { "off_target" };
        let class: Vec<&FeatureSummary> =
            features.iter().filter(|f| f.is_targeted == targeted).collect();
        let total = class.len() as i64;
        let not_detected = class.iter().filter(|f| !f.is_detected()).count() as i64;
        let not_quantifiable = class.iter().filter(|f| !f.is_quantifiable()).count() as i64;

        reporter.insert(format!("num_genes_not_detected_{suffix}"), not_detected);
        reporter.insert(format!("num_genes_detected_{suffix}"), total - not_detected);
        reporter.insert(
            format!("num_genes_not_quantifiable_{suffix}"),
            not_quantifiable,
        );
        if is_spatial {
            reporter.insert(format!("spatial_num_genes_{suffix}"), total);
            reporter.insert(
                format!("spatial_num_genes_quantifiable_{suffix}"),
                total - not_quantifiable,
            );
        }
        reporter.insert(format!("num_genes_{suffix}"), total);
        reporter.insert(
            format!("num_genes_quantifiable_{suffix}"),
            total - not_quantifiable,
        );
    }
    reporter
}

/// Fit an enrichment threshold over the quantifiable genes, apply the
/// shallow-data fallback policy, label every gene, and compute the data-loss
/// hierarchy counts.
///
/// The fit population is the quantifiable genes with a defined log RPU in
/// cells: a quantifiable row whose log RPU is undefined (zero cell reads
/// against a nonzero cell UMI count) is dropped from the label/value arrays,
/// so the collaborator only ever sees finite values. Such a row stays in the
/// output table and is labeled `Undetermined`.
///
/// `disable_rpu_enrichments` is derived upstream from the targeted mean RPU;
/// when set and the fit looks unreliable, every enrichment-derived metric is
/// reported as "no value" and all genes are left undetermined. That
/// degradation is deliberate and silent: it is visible only in the metric
/// values, never as an error.
pub fn compute_enrichment(
    features: Vec<FeatureSummary>,
    model: &dyn EnrichmentModel,
    mode: FitMode,
    disable_rpu_enrichments: bool,
    is_spatial: bool,
) -> Result<(Vec<ClassifiedFeature>, JsonReporter)> {
    let (labels, values): (Vec<bool>, Vec<f64>) = features
        .iter()
        .filter(|f| f.is_quantifiable())
        .filter_map(|f| f.mean_reads_per_umi_cells_log10.map(|v| (f.is_targeted, v)))
        .unzip();

    let fit = model.fit(&labels, &values, mode)?;
    let counts = fit.class_counts;

    let frac_on_target_genes_enriched = robust_divide(
        counts.targeted_enriched as f64,
        (counts.targeted_enriched + counts.targeted_not_enriched) as f64,
    );
    // conservative by construction: the smaller of two normalizations of the
    // off-target enrichment rate
    let frac_off_target_genes_enriched = [
        robust_divide(
            counts.offtarget_enriched as f64,
            (counts.offtarget_enriched + counts.targeted_enriched) as f64,
        ),
        robust_divide(
            counts.offtarget_enriched as f64,
            (counts.offtarget_enriched + counts.offtarget_not_enriched) as f64,
        ),
    ]
    .into_iter()
    .flatten()
    .reduce(f64::min);

    let discard = fit.log_rpu_threshold.is_some()
        && disable_rpu_enrichments
        && should_discard_fit(
            mode,
            frac_on_target_genes_enriched,
            frac_off_target_genes_enriched,
        );
    let log_rpu_threshold = if discard { None } else { fit.log_rpu_threshold };
    if discard {
        warn!("discarding RPU enrichment fit: sequencing depth too shallow to trust the threshold");
    }

    let mut enrichment_metrics: Vec<(String, Value)> = [
        ("log_rpu_threshold", fit.log_rpu_threshold),
        ("lrpu_fitted_mean_1", fit.mu_high),
        ("lrpu_fitted_mean_2", fit.mu_low),
        ("lrpu_fitted_sd_1", fit.sd_high),
        ("lrpu_fitted_sd_2", fit.sd_low),
        ("lrpu_fitted_weight_1", fit.alpha_high),
        ("lrpu_fitted_weight_2", fit.alpha_low),
        ("frac_on_target_genes_enriched", frac_on_target_genes_enriched),
        (
            "frac_off_target_genes_enriched",
            frac_off_target_genes_enriched,
        ),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), optional_value(value)))
    .collect();
    for (key, count) in [
        ("num_rpu_enriched_genes_on_target", counts.targeted_enriched),
        (
            "num_rpu_non_enriched_genes_on_target",
            counts.targeted_not_enriched,
        ),
        (
            "num_rpu_enriched_genes_off_target",
            counts.offtarget_enriched,
        ),
        (
            "num_rpu_non_enriched_genes_off_target",
            counts.offtarget_not_enriched,
        ),
    ] {
        if is_spatial {
            enrichment_metrics.push((format!("spatial_{key}"), Value::from(count)));
        }
        enrichment_metrics.push((key.to_string(), Value::from(count)));
    }

    let mut reporter = JsonReporter::default();
    for (key, value) in enrichment_metrics {
        if discard {
            reporter.insert(key, optional_value(None));
        } else {
            reporter.insert(key, value);
        }
    }
    reporter.merge(loss_hierarchy_counts(&features, is_spatial));

    let classified = features
        .into_iter()
        .map(|summary| {
            let enrichment = classify_gene(&summary, log_rpu_threshold, mode);
            ClassifiedFeature {
                summary,
                enrichment,
            }
        })
        .collect();

    Ok((classified, reporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature_summary::{build_feature_summary, FeatureCounts, FeatureType};
    use fxhash::FxHashSet;
    use proptest::collection::vec as prop_vec;
    use proptest::prelude::*;

    /// Stub collaborator returning a canned fit.
    pub(crate) struct FixedModel(pub EnrichmentFit);

    impl EnrichmentModel for FixedModel {
        fn fit(&self, _labels: &[bool], _values: &[f64], _mode: FitMode) -> Result<EnrichmentFit> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn fit_with_threshold(threshold: Option<f64>, counts: ClassCounts) -> EnrichmentFit {
        EnrichmentFit {
            log_rpu_threshold: threshold,
            mu_high: Some(1.1),
            mu_low: Some(0.2),
            sd_high: Some(0.3),
            sd_low: Some(0.25),
            alpha_high: Some(0.6),
            alpha_low: Some(0.4),
            class_counts: counts,
        }
    }

    fn features(rows: &[(&str, bool, u64, u64)]) -> Vec<FeatureSummary> {
        // (id, targeted, reads_cells, umis_cells)
        let target_ids: FxHashSet<String> = rows
            .iter()
            .filter(|r| r.1)
            .map(|r| r.0.to_string())
            .collect();
        let counts = rows
            .iter()
            .map(|&(id, _, num_reads_cells, num_umis_cells)| FeatureCounts {
                feature_id: id.to_string(),
                feature_name: id.to_string(),
                feature_type: FeatureType::Gene,
                num_reads: num_reads_cells,
                num_umis: num_umis_cells,
                num_reads_cells,
                num_umis_cells,
            })
            .collect();
        build_feature_summary(counts, &target_ids)
    }

    #[test]
    fn test_discard_decision_table() {
        // frac_on missing
        assert!(should_discard_fit(FitMode::BothTied, None, None));
        // frac_on below the cutoff
        assert!(should_discard_fit(FitMode::BothTied, Some(0.49), None));
        // exactly at the cutoff is kept
        assert!(!should_discard_fit(FitMode::BothTied, Some(0.5), None));
        // tied/spherical modes also discard on a high off-target fraction
        assert!(should_discard_fit(
            FitMode::BothTied,
            Some(0.9),
            Some(0.51)
        ));
        assert!(should_discard_fit(
            FitMode::BothSpherical,
            Some(0.9),
            Some(0.51)
        ));
        // exactly at the cutoff is kept
        assert!(!should_discard_fit(FitMode::BothTied, Some(0.9), Some(0.5)));
        // the off-target condition does not apply to the off-target-only fit
        assert!(!should_discard_fit(
            FitMode::OfftargetsOnly,
            Some(0.9),
            Some(0.99)
        ));
    }

    #[test]
    fn test_labels_and_enrichment_calls() {
        let features = features(&[
            ("G1", true, 400, 20),  // log10(20) > 0.5 => enriched
            ("G2", true, 30, 15),   // log10(2) < 0.5 => not enriched
            ("G3", false, 120, 12), // log10(10) > 0.5 => enriched
            ("G4", false, 0, 0),    // not detected => undetermined
        ]);
        let model = FixedModel(fit_with_threshold(
            Some(0.5),
            ClassCounts {
                targeted_enriched: 1,
                targeted_not_enriched: 1,
                offtarget_enriched: 1,
                offtarget_not_enriched: 0,
            },
        ));
        let (classified, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, false, false).unwrap();
        let calls: Vec<EnrichmentCall> = classified.iter().map(|c| c.enrichment).collect();
        assert_eq!(
            calls,
            vec![
                EnrichmentCall::Enriched,
                EnrichmentCall::NotEnriched,
                EnrichmentCall::Enriched,
                EnrichmentCall::Undetermined,
            ]
        );
        assert_eq!(
            reporter.get("frac_on_target_genes_enriched").unwrap(),
            &Value::from(0.5)
        );
        // min(1/(1+1), 1/(1+0)) = 0.5
        assert_eq!(
            reporter.get("frac_off_target_genes_enriched").unwrap(),
            &Value::from(0.5)
        );
        assert_eq!(
            reporter.get("num_rpu_enriched_genes_on_target").unwrap(),
            &Value::from(1)
        );
    }

    #[test]
    fn test_undefined_log_rpu_excluded_from_fit_population() {
        struct RecordingModel;

        impl EnrichmentModel for RecordingModel {
            fn fit(
                &self,
                labels: &[bool],
                values: &[f64],
                _mode: FitMode,
            ) -> Result<EnrichmentFit> {
                // G2 is quantifiable but has no defined log RPU; only finite
                // values reach the collaborator
                assert_eq!(labels, [true, false]);
                assert_eq!(values, [20.0f64.log10(), 1.0]);
                Ok(fit_with_threshold(Some(0.5), ClassCounts::default()))
            }
        }

        let features = features(&[
            ("G1", true, 400, 20), // log10(20)
            ("G2", true, 0, 12),   // zero cell reads: quantifiable, log undefined
            ("G3", false, 120, 12), // log10(10) = 1
        ]);
        let (classified, _) =
            compute_enrichment(features, &RecordingModel, FitMode::BothTied, false, false)
                .unwrap();
        assert_eq!(classified[1].enrichment, EnrichmentCall::Undetermined);
    }

    #[test]
    fn test_offtargets_only_mode_forces_undetermined() {
        let features = features(&[
            ("G1", true, 400, 20),
            ("G2", false, 120, 12), // well above the threshold, still undetermined
        ]);
        let model = FixedModel(fit_with_threshold(Some(0.5), ClassCounts::default()));
        let (classified, _) =
            compute_enrichment(features, &model, FitMode::OfftargetsOnly, false, false).unwrap();
        assert_eq!(classified[0].enrichment, EnrichmentCall::Enriched);
        assert_eq!(classified[1].enrichment, EnrichmentCall::Undetermined);
    }

    #[test]
    fn test_no_threshold_leaves_all_undetermined() {
        let features = features(&[("G1", true, 400, 20), ("G2", false, 120, 12)]);
        let model = FixedModel(fit_with_threshold(None, ClassCounts::default()));
        let (classified, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, false, false).unwrap();
        assert!(classified
            .iter()
            .all(|c| c.enrichment == EnrichmentCall::Undetermined));
        assert_eq!(
            reporter.get("log_rpu_threshold").unwrap(),
            &Value::from("NaN")
        );
    }

    #[test]
    fn test_fallback_wipes_every_enrichment_metric() {
        let features = features(&[
            ("G1", true, 40, 20), // rpu 2, shallow
            ("G2", true, 33, 15), // rpu 2.2
        ]);
        let model = FixedModel(fit_with_threshold(
            Some(0.5),
            ClassCounts {
                targeted_enriched: 0,
                targeted_not_enriched: 2,
                offtarget_enriched: 0,
                offtarget_not_enriched: 0,
            },
        ));
        // frac_on = 0 < 0.5 and depth flagged as insufficient => discard
        let (classified, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, true, false).unwrap();
        for key in [
            "log_rpu_threshold",
            "lrpu_fitted_mean_1",
            "lrpu_fitted_mean_2",
            "lrpu_fitted_sd_1",
            "lrpu_fitted_sd_2",
            "lrpu_fitted_weight_1",
            "lrpu_fitted_weight_2",
            "frac_on_target_genes_enriched",
            "frac_off_target_genes_enriched",
            "num_rpu_enriched_genes_on_target",
            "num_rpu_non_enriched_genes_on_target",
            "num_rpu_enriched_genes_off_target",
            "num_rpu_non_enriched_genes_off_target",
        ] {
            assert_eq!(reporter.get(key).unwrap(), &Value::from("NaN"), "{key}");
        }
        assert!(classified
            .iter()
            .all(|c| c.enrichment == EnrichmentCall::Undetermined));
        // the loss hierarchy is reported regardless of the discarded fit
        assert_eq!(reporter.get("num_genes_on_target").unwrap(), &Value::from(2));
        assert_eq!(
            reporter.get("num_genes_quantifiable_on_target").unwrap(),
            &Value::from(2)
        );
    }

    #[test]
    fn test_fallback_ignored_at_good_depth() {
        let features = features(&[("G1", true, 400, 20), ("G2", true, 30, 15)]);
        let model = FixedModel(fit_with_threshold(
            Some(0.5),
            ClassCounts {
                targeted_enriched: 0,
                targeted_not_enriched: 2,
                offtarget_enriched: 0,
                offtarget_not_enriched: 0,
            },
        ));
        // frac_on = 0 but disable_rpu_enrichments = false => fit is kept
        let (_, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, false, false).unwrap();
        assert_eq!(
            reporter.get("log_rpu_threshold").unwrap(),
            &Value::from(0.5)
        );
    }

    #[test]
    fn test_loss_hierarchy_counts() {
        let features = features(&[
            ("G1", true, 400, 20), // quantifiable
            ("G2", true, 9, 9),    // detected, not quantifiable
            ("G3", true, 0, 0),    // not detected
            ("G4", false, 0, 0),   // not detected
        ]);
        let model = FixedModel(fit_with_threshold(None, ClassCounts::default()));
        let (_, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, false, false).unwrap();
        assert_eq!(reporter.get("num_genes_on_target").unwrap(), &Value::from(3));
        assert_eq!(
            reporter.get("num_genes_off_target").unwrap(),
            &Value::from(1)
        );
        assert_eq!(
            reporter.get("num_genes_not_detected_on_target").unwrap(),
            &Value::from(1)
        );
        assert_eq!(
            reporter.get("num_genes_detected_on_target").unwrap(),
            &Value::from(2)
        );
        assert_eq!(
            reporter
                .get("num_genes_not_quantifiable_on_target")
                .unwrap(),
            &Value::from(2)
        );
        assert_eq!(
            reporter.get("num_genes_quantifiable_on_target").unwrap(),
            &Value::from(1)
        );
        assert_eq!(
            reporter.get("num_genes_not_detected_off_target").unwrap(),
            &Value::from(1)
        );
        assert_eq!(
            reporter.get("num_genes_quantifiable_off_target").unwrap(),
            &Value::from(0)
        );
    }

    #[test]
    fn test_spatial_duplicate_keys() {
        let features = features(&[("G1", true, 400, 20)]);
        let model = FixedModel(fit_with_threshold(
            Some(0.5),
            ClassCounts {
                targeted_enriched: 1,
                targeted_not_enriched: 0,
                offtarget_enriched: 0,
                offtarget_not_enriched: 0,
            },
        ));
        let (_, reporter) =
            compute_enrichment(features, &model, FitMode::BothTied, false, true).unwrap();
        for key in [
            "spatial_num_rpu_enriched_genes_on_target",
            "spatial_num_genes_on_target",
            "spatial_num_genes_quantifiable_on_target",
        ] {
            assert_eq!(
                reporter.get(key),
                reporter.get(key.strip_prefix("spatial_").unwrap()),
                "{key}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_loss_hierarchy_ordering(umis in prop_vec(0u64..30, 0..40), flags in prop_vec(any::<bool>(), 40)) {
            let rows: Vec<(String, bool, u64)> = umis
                .iter()
                .zip(&flags)
                .enumerate()
                .map(|(i, (&u, &t))| (format!("G{i}"), t, u))
                .collect();
            let features = features(
                &rows
                    .iter()
                    .map(|(id, t, u)| (id.as_str(), *t, 2 * u, *u))
                    .collect::<Vec<_>>(),
            );
            let model = FixedModel(fit_with_threshold(None, ClassCounts::default()));
            let (_, reporter) =
                compute_enrichment(features, &model, FitMode::BothTied, false, false).unwrap();

            let get = |key: &str| reporter.get(key).unwrap().as_i64().unwrap();
            let total_genes = umis.len() as i64;
            prop_assert_eq!(
                get("num_genes_on_target") + get("num_genes_off_target"),
                total_genes
            );
            for suffix in ["on_target", "off_target"] {
                let total = get(&format!("num_genes_{suffix}"));
                let not_detected = get(&format!("num_genes_not_detected_{suffix}"));
                let not_quantifiable = get(&format!("num_genes_not_quantifiable_{suffix}"));
                prop_assert!(not_detected <= not_quantifiable);
                prop_assert!(not_quantifiable <= total);
                prop_assert_eq!(get(&format!("num_genes_detected_{suffix}")), total - not_detected);
                prop_assert_eq!(
                    get(&format!("num_genes_quantifiable_{suffix}")),
                    total - not_quantifiable
                );
            }
        }
    }
}
