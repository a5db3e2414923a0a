//! Password strength scoring.

use serde::Serialize;

pub const MIN_LENGTH: usize = 8;
pub const PASSING_SCORE: u8 = 50;

const COMMON_FRAGMENTS: &[&str] = &[
    "password",
    "contrasena",
    "contraseña",
    "123456",
    "qwerty",
    "abc123",
    "admin",
    "letmein",
    "inventario",
    "111111",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StrengthReport {
    pub valid: bool,
    pub message: String,
    /// 0..=100
    pub score: u8,
}

pub fn validate_strength(password: &str) -> StrengthReport {
    let length = password.chars().count();
    let has_upper = password.chars().any(char::is_uppercase);
    let has_lower = password.chars().any(char::is_lowercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    let mut missing = Vec::new();
    if length < MIN_LENGTH {
        missing.push("at least 8 characters");
    }
    if !has_upper {
        missing.push("an uppercase letter");
    }
    if !has_lower {
        missing.push("a lowercase letter");
    }
    if !has_digit {
        missing.push("a digit");
    }
    if !has_special {
        missing.push("a special character");
    }

    let mut score: i32 = 0;
    if length >= MIN_LENGTH {
        score += 20;
    }
    if length >= 12 {
        score += 10;
    }
    if length >= 16 {
        score += 10;
    }
    score += 15 * [has_upper, has_lower, has_digit, has_special]
        .iter()
        .filter(|b| **b)
        .count() as i32;

    let lowered = password.to_lowercase();
    if COMMON_FRAGMENTS.iter().any(|f| lowered.contains(f)) {
        score -= 40;
    }
    if has_repeated_run(password, 3) {
        score -= 15;
    }
    let score = score.clamp(0, 100) as u8;

    let valid = missing.is_empty() && score >= PASSING_SCORE;
    let message = if !missing.is_empty() {
        format!("password needs {}", missing.join(", "))
    } else if !valid {
        "password is too predictable".to_string()
    } else if score >= 80 {
        "strong password".to_string()
    } else {
        "acceptable password".to_string()
    };

    StrengthReport {
        valid,
        message,
        score,
    }
}

fn has_repeated_run(s: &str, run: usize) -> bool {
    let mut prev = None;
    let mut count = 0;
    for c in s.chars() {
        if Some(c) == prev {
            count += 1;
            if count >= run {
                return true;
            }
        } else {
            prev = Some(c);
            count = 1;
        }
    }
    false
}
