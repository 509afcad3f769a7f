//! # Compensation Terms
//!
//! A compensation term turns the difference between a measured quantity and
//! its reference into a Z correction (mm). Two shapes are supported:
//!
//! - **Linear**: `coeff * (measured - reference)`
//! - **Polynomial** `[c1..cn]`: `Σ ci * (measured - reference)^i`, `i` from 1
//!
//! There is deliberately no constant term: when the machine is at its
//! reference conditions every term contributes exactly zero. Static offsets
//! are carried separately by [`CompensationSet::offset`].
//!
//! ## Reference Resolution
//!
//! A term may carry its own reference. When it does not, the caller supplies
//! fallback [`References`] in priority order (profile terms: global config
//! then calibration-time snapshot; global terms: calibration-time snapshot).
//! The first non-empty reference wins. Missing measurement or missing
//! reference means "no term": zero contribution and no breakdown line.

use crate::EnvironmentSnapshot;
use serde::Serialize;
use std::fmt;

/// Physical quantity a term compensates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    BedTemp,
    HotendTemp,
    ChamberTemp,
    FirstLayer,
}

impl Quantity {
    /// Evaluation order of terms within one set.
    pub const ALL: [Quantity; 4] = [
        Quantity::BedTemp,
        Quantity::HotendTemp,
        Quantity::ChamberTemp,
        Quantity::FirstLayer,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Quantity::BedTemp => "bed_temp",
            Quantity::HotendTemp => "hotend_temp",
            Quantity::ChamberTemp => "chamber_temp",
            Quantity::FirstLayer => "first_layer",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Quantity::BedTemp => "bed",
            Quantity::HotendTemp => "hotend",
            Quantity::ChamberTemp => "chamber",
            Quantity::FirstLayer => "layer",
        }
    }

    /// Measured value of this quantity in the current environment.
    pub fn measure(self, env: &EnvironmentSnapshot) -> Option<f64> {
        match self {
            Quantity::BedTemp => env.bed_temp,
            Quantity::HotendTemp => env.hotend_temp,
            Quantity::ChamberTemp => env.chamber_temp,
            Quantity::FirstLayer => env.first_layer_height,
        }
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Shape of a compensation term.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TermKind {
    Linear(f64),
    Polynomial(Vec<f64>),
}

impl TermKind {
    /// Pick the term shape from config values. A non-empty polynomial wins;
    /// a zero linear coefficient means no term at all.
    pub fn from_config(coeff: f64, poly: &[f64]) -> Option<Self> {
        if !poly.is_empty() {
            Some(TermKind::Polynomial(poly.to_vec()))
        } else if coeff != 0.0 {
            Some(TermKind::Linear(coeff))
        } else {
            None
        }
    }

    /// Correction for a signed delta from the reference.
    pub fn apply(&self, delta: f64) -> f64 {
        match self {
            TermKind::Linear(coeff) => coeff * delta,
            TermKind::Polynomial(coeffs) => coeffs
                .iter()
                .zip(1..)
                .map(|(c, power)| c * delta.powi(power))
                .sum(),
        }
    }
}

/// Reference values for each quantity, from one source.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct References {
    pub bed_temp: Option<f64>,
    pub hotend_temp: Option<f64>,
    pub chamber_temp: Option<f64>,
    pub first_layer: Option<f64>,
}

impl References {
    pub fn get(&self, quantity: Quantity) -> Option<f64> {
        match quantity {
            Quantity::BedTemp => self.bed_temp,
            Quantity::HotendTemp => self.hotend_temp,
            Quantity::ChamberTemp => self.chamber_temp,
            Quantity::FirstLayer => self.first_layer,
        }
    }
}

/// One line of an operator-facing breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakdownEntry {
    pub label: String,
    pub value: f64,
    pub note: String,
}

impl BreakdownEntry {
    pub fn new(label: impl Into<String>, value: f64, note: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value,
            note: note.into(),
        }
    }
}

/// A single term bound to its quantity and optional local reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompensationModel {
    pub quantity: Quantity,
    pub kind: TermKind,
    pub reference: Option<f64>,
}

impl CompensationModel {
    /// Evaluate against a measurement and an already resolved reference.
    /// Either side missing yields `None`.
    pub fn evaluate(&self, measured: Option<f64>, reference: Option<f64>) -> Option<f64> {
        let (measured, reference) = (measured?, reference?);
        Some(self.kind.apply(measured - reference))
    }

    /// Local reference first, then each fallback source in order.
    pub fn resolve_reference(&self, fallbacks: &[&References]) -> Option<f64> {
        self.reference
            .or_else(|| fallbacks.iter().find_map(|refs| refs.get(self.quantity)))
    }

    fn entry(&self, prefix: &str, measured: f64, reference: f64, value: f64) -> BreakdownEntry {
        match &self.kind {
            TermKind::Linear(coeff) => {
                let note = if self.quantity == Quantity::FirstLayer {
                    format!(
                        "(layer {:.3} - ref {:.3}) * {:.6}",
                        measured, reference, coeff
                    )
                } else {
                    format!(
                        "({} {:.2} - ref {:.2}) * {:.6}",
                        self.quantity.short_name(),
                        measured,
                        reference,
                        coeff
                    )
                };
                BreakdownEntry::new(format!("{}{}", prefix, self.quantity), value, note)
            }
            TermKind::Polynomial(coeffs) => {
                let listed: Vec<String> = coeffs.iter().map(|c| format!("{:.8}", c)).collect();
                BreakdownEntry::new(
                    format!("{}{}_poly", prefix, self.quantity),
                    value,
                    format!(
                        "poly({}) T={:.2} ref={:.2}",
                        listed.join(","),
                        measured,
                        reference
                    ),
                )
            }
        }
    }
}

/// A static offset plus the terms that apply at one level (global config or
/// a single profile).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CompensationSet {
    pub offset: f64,
    pub terms: Vec<CompensationModel>,
}

impl CompensationSet {
    /// Sum the static offset and every evaluable term. Breakdown labels are
    /// `prefix + quantity`; `offset_label` names the static offset line.
    pub fn calculate(
        &self,
        env: &EnvironmentSnapshot,
        fallbacks: &[&References],
        prefix: &str,
        offset_label: &str,
        offset_note: &str,
    ) -> (f64, Vec<BreakdownEntry>) {
        let mut total = self.offset;
        let mut details = Vec::new();
        if self.offset != 0.0 {
            details.push(BreakdownEntry::new(offset_label, self.offset, offset_note));
        }

        for term in &self.terms {
            let measured = term.quantity.measure(env);
            let reference = term.resolve_reference(fallbacks);
            if let (Some(value), Some(m), Some(r)) =
                (term.evaluate(measured, reference), measured, reference)
            {
                total += value;
                details.push(term.entry(prefix, m, r, value));
            }
        }

        (total, details)
    }
}
