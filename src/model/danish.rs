//! Parsing and formatting of Danish-style numbers, which use `.` as the thousands separator and
//! `,` as the decimal separator, e.g. `1.234,56`.
//!
//! Values are held as `Decimal` so that the number of fraction digits survives a round trip:
//!
//! ```
//! # use budget_sync::model::{format_danish_number, parse_danish_number};
//! let value = parse_danish_number("1.234,56").unwrap();
//! assert_eq!(format_danish_number(value), "1.234,56");
//! ```

use crate::error::Res;
use anyhow::{ensure, Context};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Parses a Danish-formatted number. Whitespace is trimmed and an empty string is zero.
pub fn parse_danish_number(s: &str) -> Res<Decimal> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let (int_part, frac_part) = match unsigned.split_once(',') {
        Some((i, f)) => (i, Some(f)),
        None => (unsigned, None),
    };

    let digits = int_part.replace('.', "");
    ensure!(
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        "'{s}' is not a valid number"
    );
    if let Some(frac) = frac_part {
        ensure!(
            !frac.is_empty() && frac.chars().all(|c| c.is_ascii_digit()),
            "'{s}' has an invalid decimal part"
        );
    }

    let sign = if negative { "-" } else { "" };
    let normalized = match frac_part {
        Some(frac) => format!("{sign}{digits}.{frac}"),
        None => format!("{sign}{digits}"),
    };
    Decimal::from_str(&normalized).with_context(|| format!("Unable to parse number '{s}'"))
}

/// Formats `value` with `.` thousands separators and a `,` decimal separator. The fraction digits
/// of `value` are kept as they are.
pub fn format_danish_number(value: Decimal) -> String {
    let sign = if value.is_sign_negative() && !value.is_zero() {
        "-"
    } else {
        ""
    };
    let plain = value.abs().to_string();
    let (int_part, frac_part) = match plain.split_once('.') {
        Some((i, f)) => (i.to_string(), Some(f.to_string())),
        None => (plain, None),
    };

    let grouped = group_thousands(&int_part);
    match frac_part {
        Some(frac) => format!("{sign}{grouped},{frac}"),
        None => format!("{sign}{grouped}"),
    }
}

/// Formats a whole number of kroner for display, e.g. `12.000 kr.`.
pub fn format_kroner(amount: i64) -> String {
    format!("{} kr.", format_danish_number(Decimal::from(amount)))
}

fn group_thousands(digits: &str) -> String {
    let len = digits.len();
    let mut out = String::with_capacity(len + len / 3);
    for (ix, c) in digits.chars().enumerate() {
        if ix > 0 && (len - ix) % 3 == 0 {
            out.push('.');
        }
        out.push(c);
    }
    out
}
