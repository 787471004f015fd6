use crate::domain::regime::Regime;
use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

/// Indicator thresholds applied at one stage of the cascade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterPreset {
    pub name: String,
    pub min_signal_count: u32,
    /// Required multiple of today's volume over the 20-day average.
    pub volume_multiple: f64,
    /// Largest tolerated absolute opening gap, percent.
    pub max_gap_pct: f64,
    /// Largest tolerated extension of the close above the slow average, percent.
    pub max_extension_pct: f64,
    pub rsi_floor: f64,
    pub rsi_ceiling: f64,
    /// Minimum 5-day return, percent.
    pub momentum_floor_pct: f64,
    /// Only accept a fast/slow cross that happened on the as-of bar.
    #[serde(default)]
    pub fresh_cross_only: bool,
}

/// One cascade stage: a preset and the score cutoff a candidate must reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub preset: FilterPreset,
    pub cutoff: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeAdjustment {
    #[serde(default)]
    pub extra_signal_count: u32,
    #[serde(default = "one")]
    pub volume_multiple_scale: f64,
    #[serde(default)]
    pub rsi_floor_delta: f64,
    #[serde(default)]
    pub cutoff_delta: f64,
}

fn one() -> f64 {
    1.0
}

impl Default for RegimeAdjustment {
    fn default() -> Self {
        Self {
            extra_signal_count: 0,
            volume_multiple_scale: 1.0,
            rsi_floor_delta: 0.0,
            cutoff_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRange {
    pub min: usize,
    pub max: usize,
}

/// A value per regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerRegime<T> {
    pub bull: T,
    pub neutral: T,
    pub bear: T,
    pub crash: T,
}

impl<T> PerRegime<T> {
    pub fn get(&self, regime: Regime) -> &T {
        match regime {
            Regime::Bull => &self.bull,
            Regime::Neutral => &self.neutral,
            Regime::Bear => &self.bear,
            Regime::Crash => &self.crash,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConditionWeights {
    pub trend_cross: f64,
    pub momentum: f64,
    pub relative_volume: f64,
    pub oscillator: f64,
    pub gap: f64,
    pub extension: f64,
}

impl Default for ConditionWeights {
    fn default() -> Self {
        Self {
            trend_cross: 3.0,
            momentum: 3.0,
            relative_volume: 2.0,
            oscillator: 2.0,
            gap: 1.0,
            extension: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBand {
    pub min_score: f64,
    pub label: String,
}

/// Liquidity and instrument-type floors. Identical at every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardFilter {
    pub min_close: f64,
    pub min_trading_value: f64,
    #[serde(default)]
    pub excluded_name_markers: Vec<String>,
}

impl Default for HardFilter {
    fn default() -> Self {
        Self {
            min_close: 1_000.0,
            min_trading_value: 1.0e9,
            excluded_name_markers: ["ETF", "ETN", "KODEX", "TIGER", "KOSEF", "KBSTAR", "ARIRANG", "HANARO"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl HardFilter {
    pub fn excludes_name(&self, name: &str) -> bool {
        let s = name.trim();
        if s.is_empty() {
            return false;
        }
        let upper = s.to_ascii_uppercase();
        self.excluded_name_markers
            .iter()
            .any(|m| !m.is_empty() && upper.contains(&m.to_ascii_uppercase()))
    }

    pub fn passes(&self, name: &str, close: Option<f64>, volume: Option<f64>, trading_value: Option<f64>) -> bool {
        let close_ok = close.is_some_and(|c| c.is_finite() && c > 0.0 && c >= self.min_close);
        let volume_ok = volume.is_some_and(|v| v.is_finite() && v > 0.0);
        let value_ok = trading_value.is_some_and(|v| v.is_finite() && v >= self.min_trading_value);
        close_ok && volume_ok && value_ok && !self.excludes_name(name)
    }
}

/// Everything the scanner needs, loaded once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub strategy: String,
    pub stages: Vec<StageSpec>,
    #[serde(default)]
    pub weights: ConditionWeights,
    /// Ordered from the highest `min_score` down.
    pub score_bands: Vec<ScoreBand>,
    pub adjustments: PerRegime<RegimeAdjustment>,
    /// `None` disables scanning for that regime.
    pub targets: PerRegime<Option<TargetRange>>,
    #[serde(default)]
    pub hard_filter: HardFilter,
}

impl Default for ScanConfig {
    fn default() -> Self {
        let preset = |name: &str,
                      min_signal_count: u32,
                      volume_multiple: f64,
                      max_gap_pct: f64,
                      max_extension_pct: f64,
                      rsi: (f64, f64),
                      momentum_floor_pct: f64,
                      fresh_cross_only: bool| FilterPreset {
            name: name.to_string(),
            min_signal_count,
            volume_multiple,
            max_gap_pct,
            max_extension_pct,
            rsi_floor: rsi.0,
            rsi_ceiling: rsi.1,
            momentum_floor_pct,
            fresh_cross_only,
        };

        Self {
            strategy: "trend_momentum".to_string(),
            stages: vec![
                StageSpec {
                    preset: preset("strict", 5, 2.0, 5.0, 10.0, (50.0, 70.0), 2.0, true),
                    cutoff: 10.0,
                },
                StageSpec {
                    preset: preset("standard", 5, 1.5, 6.0, 12.0, (45.0, 75.0), 1.0, false),
                    cutoff: 10.0,
                },
                StageSpec {
                    preset: preset("relaxed", 4, 1.2, 8.0, 15.0, (40.0, 78.0), 0.0, false),
                    cutoff: 8.0,
                },
                StageSpec {
                    preset: preset("wide", 4, 1.0, 10.0, 20.0, (35.0, 80.0), -1.0, false),
                    cutoff: 8.0,
                },
            ],
            weights: ConditionWeights::default(),
            score_bands: vec![
                ScoreBand {
                    min_score: 11.0,
                    label: "strong".to_string(),
                },
                ScoreBand {
                    min_score: 9.0,
                    label: "moderate".to_string(),
                },
                ScoreBand {
                    min_score: 0.0,
                    label: "weak".to_string(),
                },
            ],
            adjustments: PerRegime {
                bull: RegimeAdjustment::default(),
                neutral: RegimeAdjustment::default(),
                bear: RegimeAdjustment {
                    extra_signal_count: 1,
                    volume_multiple_scale: 1.2,
                    rsi_floor_delta: 5.0,
                    cutoff_delta: 0.0,
                },
                crash: RegimeAdjustment {
                    extra_signal_count: 2,
                    volume_multiple_scale: 1.5,
                    rsi_floor_delta: 10.0,
                    cutoff_delta: 1.0,
                },
            },
            targets: PerRegime {
                bull: Some(TargetRange { min: 5, max: 20 }),
                neutral: Some(TargetRange { min: 5, max: 15 }),
                bear: Some(TargetRange { min: 3, max: 10 }),
                crash: None,
            },
            hard_filter: HardFilter::default(),
        }
    }
}

impl ScanConfig {
    /// Load from a JSON file, or fall back to the built-in configuration when `path` is `None`.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let cfg = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p)
                    .with_context(|| format!("failed to read scan config {p}"))?;
                serde_json::from_str::<ScanConfig>(&text)
                    .with_context(|| format!("scan config {p} is not valid JSON for ScanConfig"))?
            }
            None => ScanConfig::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.strategy.trim().is_empty(), "strategy must be non-empty");
        ensure!(!self.stages.is_empty(), "at least one stage is required");

        for (idx, stage) in self.stages.iter().enumerate() {
            let p = &stage.preset;
            ensure!(
                [
                    stage.cutoff,
                    p.volume_multiple,
                    p.max_gap_pct,
                    p.max_extension_pct,
                    p.rsi_floor,
                    p.rsi_ceiling,
                    p.momentum_floor_pct,
                ]
                .iter()
                .all(|v| v.is_finite()),
                "stage {idx} ({}) has a non-finite threshold",
                p.name
            );
            ensure!(
                p.rsi_floor <= p.rsi_ceiling,
                "stage {idx} ({}): rsi_floor must be <= rsi_ceiling",
                p.name
            );
        }

        for (idx, pair) in self.stages.windows(2).enumerate() {
            let (prev, next) = (&pair[0], &pair[1]);
            let (a, b) = (&prev.preset, &next.preset);
            let looser = b.min_signal_count <= a.min_signal_count
                && b.volume_multiple <= a.volume_multiple
                && b.max_gap_pct >= a.max_gap_pct
                && b.max_extension_pct >= a.max_extension_pct
                && b.rsi_floor <= a.rsi_floor
                && b.rsi_ceiling >= a.rsi_ceiling
                && b.momentum_floor_pct <= a.momentum_floor_pct
                && (a.fresh_cross_only || !b.fresh_cross_only)
                && next.cutoff <= prev.cutoff;
            ensure!(
                looser,
                "stage {} ({}) must be at least as permissive as stage {idx} ({})",
                idx + 1,
                b.name,
                a.name
            );
        }

        ensure!(!self.score_bands.is_empty(), "score_bands must be non-empty");
        for pair in self.score_bands.windows(2) {
            ensure!(
                pair[0].min_score > pair[1].min_score,
                "score_bands must be ordered by descending min_score"
            );
        }

        for regime in Regime::ALL {
            if let Some(t) = self.targets.get(regime) {
                ensure!(
                    t.min >= 1 && t.min <= t.max,
                    "target range for {regime} must satisfy 1 <= min <= max"
                );
            }
            let adj = self.adjustments.get(regime);
            ensure!(
                adj.volume_multiple_scale.is_finite() && adj.volume_multiple_scale > 0.0,
                "volume_multiple_scale for {regime} must be positive"
            );
        }

        Ok(())
    }
}

/// First band (descending order) whose floor the score reaches.
pub fn label_for(bands: &[ScoreBand], score: f64) -> String {
    bands
        .iter()
        .find(|b| score >= b.min_score)
        .map(|b| b.label.clone())
        .unwrap_or_else(|| "unrated".to_string())
}

/// Stage preset merged with the regime adjustment; what the evaluator actually compares against.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSet {
    pub stage: usize,
    pub strategy: String,
    pub min_signal_count: u32,
    pub volume_multiple: f64,
    pub max_gap_pct: f64,
    pub max_extension_pct: f64,
    pub rsi_floor: f64,
    pub rsi_ceiling: f64,
    pub momentum_floor_pct: f64,
    pub fresh_cross_only: bool,
    pub cutoff: f64,
    pub weights: ConditionWeights,
}

impl ThresholdSet {
    pub fn resolve(cfg: &ScanConfig, stage: usize, regime: Regime) -> anyhow::Result<Self> {
        let spec = cfg
            .stages
            .get(stage)
            .with_context(|| format!("stage {stage} is not configured"))?;
        let adj = cfg.adjustments.get(regime);
        let p = &spec.preset;

        let out = Self {
            stage,
            strategy: cfg.strategy.clone(),
            min_signal_count: p.min_signal_count + adj.extra_signal_count,
            volume_multiple: p.volume_multiple * adj.volume_multiple_scale,
            max_gap_pct: p.max_gap_pct,
            max_extension_pct: p.max_extension_pct,
            rsi_floor: p.rsi_floor + adj.rsi_floor_delta,
            rsi_ceiling: p.rsi_ceiling,
            momentum_floor_pct: p.momentum_floor_pct,
            fresh_cross_only: p.fresh_cross_only,
            cutoff: spec.cutoff + adj.cutoff_delta,
            weights: cfg.weights,
        };

        ensure!(
            out.volume_multiple.is_finite() && out.cutoff.is_finite() && out.rsi_floor.is_finite(),
            "resolved thresholds for stage {stage} under {regime} are not finite"
        );
        Ok(out)
    }
}
