//! Translation of DNS rules into anchored regular expressions.

use policy_engine::PortRuleDns;

/// Pattern matching every name.
pub const MATCH_ALL: &str = "(?s)^.*$";

/// Characters a single `*` may stand for: one DNS label, no dots.
const LABEL_CHARS: &str = "[-a-zA-Z0-9_]*";

/// Returns `name` in fully qualified form, with a trailing dot.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// Returns the lowercase fully qualified form of a queried name.
pub fn normalize_name(name: &str) -> String {
    fqdn(&name.to_lowercase())
}

fn name_to_regex(name: &str) -> String {
    regex::escape(&normalize_name(name))
}

/// Only `*` and `.` are translated. Anything else is passed through, so a
/// pattern with unbalanced regex syntax fails to compile.
fn pattern_to_regex(pattern: &str) -> String {
    let mut out = String::new();
    for ch in normalize_name(pattern).chars() {
        match ch {
            '.' => out.push_str("[.]"),
            '*' => out.push_str(LABEL_CHARS),
            c => out.push(c),
        }
    }
    out
}

/// Builds one anchored pattern for a selector's DNS rules.
///
/// Rules are alternatives. No rules, or a bare `*` pattern, yields
/// [`MATCH_ALL`].
pub fn generate_pattern(rules: &[PortRuleDns]) -> String {
    if rules.iter().any(|r| r.match_pattern == "*") {
        return MATCH_ALL.to_string();
    }

    let mut alternatives = Vec::new();
    for rule in rules {
        if !rule.match_name.is_empty() {
            alternatives.push(name_to_regex(&rule.match_name));
        }
        if !rule.match_pattern.is_empty() {
            alternatives.push(pattern_to_regex(&rule.match_pattern));
        }
    }
    if alternatives.is_empty() {
        return MATCH_ALL.to_string();
    }
    format!("^(?:{})$", alternatives.join("|"))
}
