//! Presentation of attribution scores next to their tokens.
//!
//! Rendering copies scores verbatim; it only adds a colour intensity in
//! `[-1, 1]` (score divided by the row's largest absolute score).

use odyssey_core::error::{OdysseyError, Result};
use serde::{Deserialize, Serialize};
use unicode_width::UnicodeWidthStr;

/// One example handed to the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderInput {
    pub patient_id: String,
    pub tokens: Vec<String>,
    pub scores: Vec<f64>,
    pub predicted_score: f64,
    pub true_label: Option<i64>,
    pub convergence_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedToken {
    pub token: String,
    pub score: f64,
    pub intensity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedExample {
    pub patient_id: String,
    pub predicted_score: f64,
    pub true_label: Option<i64>,
    pub attribution_total: f64,
    pub convergence_delta: f64,
    pub tokens: Vec<RenderedToken>,
}

/// A rendered batch of examples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendering {
    pub task_name: String,
    pub method: String,
    /// Token scores were L2-normalised per example; totals are not on the
    /// scale of `convergence_delta`.
    #[serde(default)]
    pub normalized: bool,
    pub rows: Vec<RenderedExample>,
}

impl Rendering {
    /// Render at most `max_rows` examples, in input order.
    pub fn build(
        task_name: &str,
        method: &str,
        inputs: Vec<RenderInput>,
        max_rows: usize,
    ) -> Result<Self> {
        let mut rows = Vec::with_capacity(inputs.len().min(max_rows));
        for input in inputs.into_iter().take(max_rows) {
            if input.tokens.len() != input.scores.len() {
                return Err(OdysseyError::shape_mismatch(
                    format!("rendered tokens of '{}'", input.patient_id),
                    input.tokens.len(),
                    input.scores.len(),
                ));
            }
            let max_abs = input.scores.iter().fold(0.0_f64, |m, s| m.max(s.abs()));
            let tokens = input
                .tokens
                .into_iter()
                .zip(&input.scores)
                .map(|(token, &score)| RenderedToken {
                    token,
                    score,
                    intensity: if max_abs > 0.0 { score / max_abs } else { 0.0 },
                })
                .collect();
            rows.push(RenderedExample {
                patient_id: input.patient_id,
                predicted_score: input.predicted_score,
                true_label: input.true_label,
                attribution_total: input.scores.iter().sum(),
                convergence_delta: input.convergence_delta,
                tokens,
            });
        }
        Ok(Self {
            task_name: task_name.to_string(),
            method: method.to_string(),
            normalized: false,
            rows,
        })
    }

    /// Mark the token scores as L2-normalised.
    pub fn with_normalized_scores(mut self, normalized: bool) -> Self {
        self.normalized = normalized;
        self
    }

    fn total_label(&self) -> &'static str {
        if self.normalized {
            "normalized total"
        } else {
            "total"
        }
    }

    /// Plain-text table, one block per example.
    pub fn to_table(&self) -> String {
        let mut out = format!("{} ({})\n", self.task_name, self.method);
        for row in &self.rows {
            out.push_str(&format!(
                "\npatient {} | label {} | predicted {:.4} | {} {:.4} | delta {:.2e}\n",
                row.patient_id,
                row.true_label
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                row.predicted_score,
                self.total_label(),
                row.attribution_total,
                row.convergence_delta,
            ));
            let width = row
                .tokens
                .iter()
                .map(|t| t.token.width())
                .max()
                .unwrap_or(0)
                .max(5);
            for t in &row.tokens {
                let pad = width - t.token.width();
                out.push_str(&format!(
                    "  {}{} {:>+10.4}  {}\n",
                    t.token,
                    " ".repeat(pad),
                    t.score,
                    intensity_bar(t.intensity)
                ));
            }
        }
        out
    }

    /// Standalone HTML page with one coloured span per token.
    pub fn to_html(&self) -> String {
        let title = format!("{} ({})", self.task_name, self.method);
        let mut html = String::new();
        html.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
        html.push_str("<meta charset=\"UTF-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", escape_html(&title)));
        html.push_str("<style>\n");
        html.push_str(CSS_STYLES);
        html.push_str("</style>\n</head>\n<body>\n");
        html.push_str(&format!("<h1>{}</h1>\n", escape_html(&title)));

        html.push_str(&format!(
            "<table>\n<thead><tr>{}<th>{}</th><th>Token Importance</th></tr></thead>\n<tbody>\n",
            TABLE_HEAD,
            if self.normalized {
                "Attribution Score (normalized)"
            } else {
                "Attribution Score"
            }
        ));
        for row in &self.rows {
            let label = row
                .true_label
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string());
            html.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{:.4}</td><td>{:.4}</td><td>",
                escape_html(&row.patient_id),
                label,
                row.predicted_score,
                row.attribution_total
            ));
            for t in &row.tokens {
                html.push_str(&format!(
                    "<mark style=\"background-color: {}\" title=\"{:.4}\">{}</mark> ",
                    token_color(t.intensity),
                    t.score,
                    escape_html(&t.token)
                ));
            }
            html.push_str("</td></tr>\n");
        }
        html.push_str("</tbody>\n</table>\n</body>\n</html>\n");
        html
    }
}

/// Green for positive, red for negative, lighter as |intensity| shrinks.
fn token_color(intensity: f64) -> String {
    let intensity = intensity.clamp(-1.0, 1.0);
    if intensity > 0.0 {
        format!("hsl(120, 75%, {}%)", 100 - (50.0 * intensity) as i32)
    } else {
        format!("hsl(0, 75%, {}%)", 100 - (-40.0 * intensity) as i32)
    }
}

fn intensity_bar(intensity: f64) -> String {
    let cells = (intensity.abs() * 20.0).round() as usize;
    let glyph = if intensity >= 0.0 { '+' } else { '-' };
    std::iter::repeat_n(glyph, cells).collect()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

const TABLE_HEAD: &str = "<th>Patient</th><th>True Label</th><th>Predicted Score</th>";

const CSS_STYLES: &str = "body { font-family: sans-serif; margin: 2em; }\n\
table { border-collapse: collapse; }\n\
th, td { border: 1px solid #ccc; padding: 4px 8px; vertical-align: top; }\n\
mark { padding: 0 2px; border-radius: 2px; line-height: 1.8; }\n";
