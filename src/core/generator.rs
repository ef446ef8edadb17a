//! Policy-driven random secret generation.

use crate::error::{Error, Result};
use crate::models::policy::{CharClass, PolicySection};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use zeroize::Zeroizing;

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";

fn alphabet(class: CharClass, symbols: &str) -> Vec<char> {
    match class {
        CharClass::Upper => UPPER.chars().collect(),
        CharClass::Lower => LOWER.chars().collect(),
        CharClass::Digit => DIGITS.chars().collect(),
        CharClass::Symbol => symbols.chars().collect(),
    }
}

/// Generate a secret of exactly `length` characters satisfying `policy`.
///
/// One character is drawn from each required class, the remainder from the
/// union of those classes, and the result is shuffled. With no required
/// classes the union falls back to letters and digits.
pub fn generate_secret(length: usize, policy: &PolicySection) -> Result<Zeroizing<String>> {
    policy.check_length(length)?;

    let required = policy.required_classes();
    let pool_classes = if required.is_empty() {
        vec![CharClass::Upper, CharClass::Lower, CharClass::Digit]
    } else {
        required.clone()
    };

    let mut union: Vec<char> = Vec::new();
    for class in &pool_classes {
        for c in alphabet(*class, &policy.symbols) {
            if !union.contains(&c) {
                union.push(c);
            }
        }
    }
    if union.is_empty() {
        return Err(Error::Policy("policy leaves an empty alphabet".into()));
    }

    let mut rng = OsRng;
    let mut chars: Zeroizing<Vec<char>> = Zeroizing::new(Vec::with_capacity(length));
    for class in &required {
        let set = alphabet(*class, &policy.symbols);
        let c = set.choose(&mut rng).ok_or_else(|| {
            Error::Policy(format!("{} class has an empty alphabet", class.name()))
        })?;
        chars.push(*c);
    }
    while chars.len() < length {
        if let Some(c) = union.choose(&mut rng) {
            chars.push(*c);
        }
    }
    chars.shuffle(&mut rng);

    Ok(Zeroizing::new(chars.iter().collect()))
}
