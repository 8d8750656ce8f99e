//! Attribution of classifier scores to input tokens and embedding dimensions.
//!
//! Integrated gradients walk a straight path from a fixed baseline to the
//! input; expected gradients average single-point estimates over sampled
//! baselines. Per-example attributions are aggregated into batch reports and
//! rendered for inspection.

pub mod aggregate;
pub mod baseline;
pub mod expected;
pub mod integrated;
pub mod interpreter;
pub mod render;

pub use aggregate::{
    AttributionReport, AttributionSummary, ReportKind, TokenAttribution, TokenIdentityAggregator,
    TokenStat, group_by_label, token_scores,
};
pub use baseline::{Baseline, BaselineProvider, SampledBaseline};
pub use expected::ExpectedGradients;
pub use integrated::{Attribution, IntegratedGradients};
pub use interpreter::Interpreter;
pub use render::{RenderInput, RenderedExample, RenderedToken, Rendering};
