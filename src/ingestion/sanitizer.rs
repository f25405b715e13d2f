//! Identifier Sanitizer - turns arbitrary header/file names into SQL identifiers

use regex::Regex;
use std::sync::OnceLock;
use unicode_normalization::UnicodeNormalization;

fn extension_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Extension must start with a letter so "3.14" or a pandas-style "amount.1" survive
    RE.get_or_init(|| Regex::new(r"\.[A-Za-z][A-Za-z0-9]{0,4}$").expect("valid regex"))
}

fn camel_boundary_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-z0-9])([A-Z])").expect("valid regex"))
}

fn separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\s\-]+").expect("valid regex"))
}

fn underscores_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_+").expect("valid regex"))
}

/// Convert `raw` into an identifier matching `^[A-Za-z_][A-Za-z0-9_]*$`.
///
/// `fallback` replaces an input that sanitizes to nothing (pure CJK, pure
/// symbols, empty). `prefix` is prepended (joined with `_`) when the result
/// would start with a digit. Total: never fails, for any input.
pub fn to_identifier(raw: &str, fallback: &str, prefix: &str) -> String {
    let stem = extension_re().replace(raw.trim(), "");

    let replaced: String = stem
        .nfd()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c.is_whitespace() {
                c
            } else {
                '_'
            }
        })
        .collect();

    let snake = camel_boundary_re().replace_all(&replaced, "${1}_${2}");
    let joined = separator_re().replace_all(&snake, "_");
    let collapsed = underscores_re().replace_all(&joined, "_");
    let mut ident = collapsed.trim_matches('_').to_lowercase();

    if ident.is_empty() {
        ident = fallback.to_string();
    }
    if !starts_legally(&ident) {
        ident = format!("{}_{}", prefix, ident);
    }

    let mut ident: String = ident
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();

    // Only reachable with a degenerate fallback/prefix
    if !starts_legally(&ident) {
        ident.insert(0, '_');
    }
    ident
}

/// Append `_2`, `_3`, ... to `base` until `exists` reports the name free.
pub fn dedupe<F>(base: &str, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    if !exists(base) {
        return base.to_string();
    }
    let mut suffix = 2usize;
    loop {
        let candidate = format!("{}_{}", base, suffix);
        if !exists(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// True when `name` is a legal unquoted identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    starts_legally(name) && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Double-quote an identifier for use in SQL text.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn starts_legally(s: &str) -> bool {
    s.chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ident(raw: &str) -> String {
        to_identifier(raw, "fallback", "col")
    }

    #[test]
    fn test_basic_cleanup() {
        assert_eq!(ident("Order ID"), "order_id");
        assert_eq!(ident("  unit-price  "), "unit_price");
        assert_eq!(ident("a -- b"), "a_b");
        assert_eq!(ident("__x__y__"), "x_y");
        assert_eq!(ident("total($)"), "total");
    }

    #[test]
    fn test_strips_file_extension() {
        assert_eq!(to_identifier("Sales Report.csv", "uploaded_table", "uploaded"), "sales_report");
        assert_eq!(to_identifier("q3.xlsx", "uploaded_table", "uploaded"), "q3");
        // Not an extension: digits after the dot
        assert_eq!(ident("3.14"), "col_3_14");
    }

    #[test]
    fn test_camel_case_boundary() {
        assert_eq!(ident("customerName"), "customer_name");
        assert_eq!(ident("orderID2Date"), "order_id2_date");
        assert_eq!(ident("item2Price"), "item2_price");
    }

    #[test]
    fn test_accents_decompose() {
        assert_eq!(ident("Café"), "cafe");
        // The combining tilde is not ASCII, so it becomes a separator
        assert_eq!(ident("Año Fiscal"), "an_o_fiscal");
    }

    #[test]
    fn test_fallback_and_prefix() {
        assert_eq!(to_identifier("订单编号", "column_1", "col"), "column_1");
        assert_eq!(to_identifier("", "uploaded_table", "uploaded"), "uploaded_table");
        assert_eq!(to_identifier("%%%", "column_3", "col"), "column_3");
        assert_eq!(to_identifier("2024 sales", "t", "uploaded"), "uploaded_2024_sales");
        assert_eq!(to_identifier("订单.csv", "uploaded_table", "uploaded"), "uploaded_table");
    }

    #[test]
    fn test_degenerate_fallback_still_legal() {
        assert_eq!(to_identifier("", "", ""), "_");
        assert!(is_valid_identifier(&to_identifier("", "9", "9")));
    }

    #[test]
    fn test_total_legality() {
        let inputs = [
            "",
            " ",
            "!!!",
            "订单编号",
            "客户 姓名",
            "123",
            "1st place",
            "_",
            "___",
            "Ünïcödé",
            "tab\tseparated",
            "emoji 🚀 rocket",
            "a.b.c",
            "mixed中文Name",
            "-leading-dash",
            "Ω",
        ];
        for input in inputs {
            let out = to_identifier(input, "fallback", "col");
            assert!(is_valid_identifier(&out), "{:?} -> {:?}", input, out);
        }
    }

    #[test]
    fn test_idempotent_on_legal_input() {
        for input in ["order_id", "OrderId", "_private", "a1", "x__y", "col_2024", "Total"] {
            let once = ident(input);
            let twice = ident(&once);
            assert_eq!(once, twice, "input {:?}", input);
        }
    }

    #[test]
    fn test_dedupe_skips_taken_names() {
        let taken: HashSet<&str> = ["t", "t_2", "t_3"].into_iter().collect();
        assert_eq!(dedupe("t", |name| taken.contains(name)), "t_4");
        assert_eq!(dedupe("free", |name| taken.contains(name)), "free");
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("orders"), "\"orders\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
