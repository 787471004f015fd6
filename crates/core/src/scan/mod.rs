//! Universe screening: a rule-based evaluator driven through an ordered cascade of presets.

pub mod evaluator;
pub mod stager;

pub use evaluator::{RuleEvaluator, SignalEvaluator};
pub use stager::{FallbackStager, StageOutcome, StagerOptions};
