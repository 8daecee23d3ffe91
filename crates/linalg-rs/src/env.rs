use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub const STRICT_SYMBOLIC_SHAPES_VAR: &str = "LINALG_RS_ASSUME_STRICT_SYMBOLIC_SHAPES";

static STRICT_SYMBOLIC_SHAPES: OnceLock<bool> = OnceLock::new();

pub(crate) fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn strict_symbolic_shapes_enabled() -> bool {
    *STRICT_SYMBOLIC_SHAPES.get_or_init(|| match env::var(STRICT_SYMBOLIC_SHAPES_VAR) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}

/// Knobs shared by every lowering pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoweringConfig {
    /// Symbolic extents that must agree are assumed to agree, so equality
    /// assertions are not emitted.
    pub assume_strict_symbolic_shapes: bool,
}

impl LoweringConfig {
    /// Reads the configuration from the process environment (cached after the first call).
    pub fn from_env() -> Self {
        Self {
            assume_strict_symbolic_shapes: strict_symbolic_shapes_enabled(),
        }
    }

    pub fn with_strict_symbolic_shapes(mut self, enabled: bool) -> Self {
        self.assume_strict_symbolic_shapes = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bool;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }
}
