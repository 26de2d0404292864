use std::fmt;

/// A quantile with both its raw value and the percentile-style label used in exported names.
///
/// Timers are configured with quantiles (`0.9`), but exported with percentile labels (`p90`). The
/// label drops the decimal point, so `0.999` becomes `p999`. `0.0` and `1.0` are labelled `min`
/// and `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantile {
    value: f64,
    label: String,
}

impl Quantile {
    /// Creates a new [`Quantile`] from a floating-point value.
    ///
    /// All values are clamped between 0.0 and 1.0.
    pub fn new(quantile: f64) -> Quantile {
        let value = quantile.clamp(0.0, 1.0);

        let label = if value == 0.0 {
            "min".to_string()
        } else if value == 1.0 {
            "max".to_string()
        } else {
            format!("p{}", value * 100.0).replace('.', "")
        };

        Quantile { value, label }
    }

    /// Gets the percentile-style label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Gets the raw quantile value.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns `true` if the quantile lies strictly between the minimum and the maximum.
    pub fn is_interior(&self) -> bool {
        self.value > 0.0 && self.value < 1.0
    }
}

impl fmt::Display for Quantile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Parses a slice of floating-point values into a vector of [`Quantile`]s.
pub fn parse_quantiles(quantiles: &[f64]) -> Vec<Quantile> {
    quantiles.iter().map(|f| Quantile::new(*f)).collect()
}
