//! Secret-generation policy.

use crate::constants;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A character class a generated secret may be required to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Upper,
    Lower,
    Digit,
    Symbol,
}

impl CharClass {
    pub fn name(&self) -> &'static str {
        match self {
            CharClass::Upper => "upper",
            CharClass::Lower => "lower",
            CharClass::Digit => "digit",
            CharClass::Symbol => "symbol",
        }
    }

    pub fn contains(&self, c: char, symbols: &str) -> bool {
        match self {
            CharClass::Upper => c.is_ascii_uppercase(),
            CharClass::Lower => c.is_ascii_lowercase(),
            CharClass::Digit => c.is_ascii_digit(),
            CharClass::Symbol => symbols.contains(c),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySection {
    /// Length used when the caller does not pass one.
    #[serde(default = "default_length")]
    pub default_length: usize,

    /// Optional floor above the class minimum.
    #[serde(default)]
    pub min_length: Option<usize>,

    #[serde(default = "default_true")]
    pub require_upper: bool,

    #[serde(default = "default_true")]
    pub require_lower: bool,

    #[serde(default = "default_true")]
    pub require_digit: bool,

    #[serde(default = "default_true")]
    pub require_symbol: bool,

    /// Symbol alphabet.
    #[serde(default = "default_symbols")]
    pub symbols: String,

    /// Forward audit entries to journald.
    #[serde(default)]
    pub journald_audit: bool,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            default_length: default_length(),
            min_length: None,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_symbol: true,
            symbols: default_symbols(),
            journald_audit: false,
        }
    }
}

impl PolicySection {
    pub fn required_classes(&self) -> Vec<CharClass> {
        let mut classes = Vec::with_capacity(4);
        if self.require_upper {
            classes.push(CharClass::Upper);
        }
        if self.require_lower {
            classes.push(CharClass::Lower);
        }
        if self.require_digit {
            classes.push(CharClass::Digit);
        }
        if self.require_symbol {
            classes.push(CharClass::Symbol);
        }
        classes
    }

    /// Shortest length that can satisfy every required class and the configured floor.
    pub fn minimum_length(&self) -> usize {
        let class_min = self.required_classes().len().max(1);
        class_min.max(self.min_length.unwrap_or(0))
    }

    /// Check a requested length against the policy.
    pub fn check_length(&self, length: usize) -> Result<()> {
        let min = self.minimum_length();
        if length < min {
            return Err(Error::Policy(format!(
                "length {} is below the minimum {} required by the policy ({})",
                length,
                min,
                self.describe_classes()
            )));
        }
        if length > constants::MAX_SECRET_LENGTH {
            return Err(Error::Policy(format!(
                "length {} exceeds the maximum {}",
                length,
                constants::MAX_SECRET_LENGTH
            )));
        }
        if self.require_symbol && self.symbols.is_empty() {
            return Err(Error::Policy(
                "symbol class required but the symbol alphabet is empty".into(),
            ));
        }
        Ok(())
    }

    /// Whether `secret` contains every required class.
    pub fn is_satisfied_by(&self, secret: &str) -> bool {
        self.required_classes()
            .iter()
            .all(|class| secret.chars().any(|c| class.contains(c, &self.symbols)))
    }

    fn describe_classes(&self) -> String {
        let names: Vec<&str> = self.required_classes().iter().map(|c| c.name()).collect();
        if names.is_empty() {
            "no required classes".to_string()
        } else {
            names.join(", ")
        }
    }
}

fn default_length() -> usize {
    16
}

fn default_true() -> bool {
    true
}

fn default_symbols() -> String {
    constants::DEFAULT_SYMBOLS.to_string()
}
