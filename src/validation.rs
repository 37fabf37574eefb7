//! Validation System - Rule/Policy Separation
//!
//! Rules inspect operator parameters and produce structured violations.
//! Policy: any Error blocks the request; Warning and Info are reported only.
//! Nothing here touches storage, so every rule runs before any I/O.

use serde::{Deserialize, Serialize};

use crate::transform::Operation;

/// Factors above this still work but clip most pixels.
const SATURATING_FACTOR: f64 = 8.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationViolation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub remediation: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub violations: Vec<ValidationViolation>,
    pub operation: String,
}

impl ValidationResult {
    /// Valid until an Error-severity violation says otherwise.
    pub fn new(op: &Operation, violations: Vec<ValidationViolation>) -> Self {
        Self {
            valid: true,
            violations,
            operation: op.name().to_string(),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == ViolationSeverity::Error)
    }

    /// `rule: message` for every blocking violation, joined.
    pub fn error_summary(&self) -> String {
        self.violations
            .iter()
            .filter(|v| v.severity == ViolationSeverity::Error)
            .map(|v| match &v.actual {
                Some(actual) => format!("{}: {} (got {})", v.rule, v.message, actual),
                None => format!("{}: {}", v.rule, v.message),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Validation rule trait - produces violations
pub trait ValidationRule: Send + Sync {
    fn name(&self) -> &'static str;
    fn validate(&self, op: &Operation) -> Vec<ValidationViolation>;
}

// --- Concrete Rules ---

pub struct FactorRule;

impl ValidationRule for FactorRule {
    fn name(&self) -> &'static str { "factor" }

    fn validate(&self, op: &Operation) -> Vec<ValidationViolation> {
        let factor = match op {
            Operation::Brightness { factor } | Operation::Contrast { factor } => *factor,
            _ => return vec![],
        };

        if !factor.is_finite() || factor <= 0.0 {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Factor must be a finite number greater than 0".to_string(),
                expected: Some("> 0".to_string()),
                actual: Some(format!("{}", factor)),
                remediation: vec![
                    "Use 1.0 for no change, <1.0 to reduce, >1.0 to increase".to_string(),
                ],
            }]
        } else if factor > SATURATING_FACTOR {
            vec![ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Warning,
                message: "Factor will clip most pixels".to_string(),
                expected: Some(format!("<= {}", SATURATING_FACTOR)),
                actual: Some(format!("{}", factor)),
                remediation: vec![],
            }]
        } else {
            vec![]
        }
    }
}

pub struct QualityRule;

impl ValidationRule for QualityRule {
    fn name(&self) -> &'static str { "quality" }

    fn validate(&self, op: &Operation) -> Vec<ValidationViolation> {
        match op {
            Operation::Compress { quality } if !(1..=100).contains(quality) => {
                vec![ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Error,
                    message: "Quality out of range".to_string(),
                    expected: Some("1..=100".to_string()),
                    actual: Some(quality.to_string()),
                    remediation: vec!["Pick a JPEG quality between 1 and 100".to_string()],
                }]
            }
            _ => vec![],
        }
    }
}

pub struct CropRectRule;

impl ValidationRule for CropRectRule {
    fn name(&self) -> &'static str { "crop_rect" }

    fn validate(&self, op: &Operation) -> Vec<ValidationViolation> {
        let Operation::Crop { x, y, width, height } = *op else {
            return vec![];
        };

        let mut violations = vec![];
        if x < 0 || y < 0 {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Origin must not be negative".to_string(),
                expected: Some("x >= 0, y >= 0".to_string()),
                actual: Some(format!("x={}, y={}", x, y)),
                remediation: vec![],
            });
        }
        if width <= 0 || height <= 0 {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Region must have positive width and height".to_string(),
                expected: Some("width > 0, height > 0".to_string()),
                actual: Some(format!("{}x{}", width, height)),
                remediation: vec![],
            });
        }
        let max = i64::from(u32::MAX);
        if x.saturating_add(width) > max || y.saturating_add(height) > max {
            violations.push(ValidationViolation {
                rule: self.name().to_string(),
                severity: ViolationSeverity::Error,
                message: "Region extends past the largest representable image".to_string(),
                expected: Some(format!("x + width <= {0}, y + height <= {0}", max)),
                actual: Some(format!("x={}, y={}, {}x{}", x, y, width, height)),
                remediation: vec![],
            });
        }
        violations
    }
}

pub struct RotationRule;

impl ValidationRule for RotationRule {
    fn name(&self) -> &'static str { "rotation" }

    fn validate(&self, op: &Operation) -> Vec<ValidationViolation> {
        match op {
            Operation::Rotate { angle } if angle.rem_euclid(90) != 0 => {
                vec![ValidationViolation {
                    rule: self.name().to_string(),
                    severity: ViolationSeverity::Info,
                    message: "Canvas expands; exposed corners are transparent".to_string(),
                    expected: None,
                    actual: Some(format!("{} degrees", angle)),
                    remediation: vec![],
                }]
            }
            _ => vec![],
        }
    }
}

/// Validator orchestrates rules and applies policy
pub struct Validator {
    rules: Vec<Box<dyn ValidationRule>>,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            rules: vec![
                Box::new(FactorRule),
                Box::new(QualityRule),
                Box::new(CropRectRule),
                Box::new(RotationRule),
            ],
        }
    }

    pub fn validate(&self, op: &Operation) -> ValidationResult {
        let all_violations: Vec<_> = self
            .rules
            .iter()
            .flat_map(|rule| rule.validate(op))
            .collect();

        let mut result = ValidationResult::new(op, all_violations);
        result.valid = !result.has_errors();
        result
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}
