//! Parsing of `iptables -S` rule listings.
//!
//! Listing lines look like
//!
//! ```text
//! -P FORWARD DROP
//! -A FORWARD -m comment --comment "SSLVPN" -j ACCEPT
//! ```
//!
//! Everything here is pure: text in, tokens out.

/// Comment attached to every rule this gateway creates.
pub const RULE_TAG: &str = "SSLVPN";

/// Returns true for chain policy (`-P`) and chain creation (`-N`) lines.
pub fn is_chain_rule(line: &str) -> bool {
    line.starts_with("-P") || line.starts_with("-N")
}

/// Split a listing line into tokens.
///
/// Tokens are separated by unquoted spaces. A double quote toggles the
/// quoted span and is not part of the token, so `--comment "a b"` yields
/// `--comment` and `a b`. Lines not starting with `-` yield no tokens.
pub fn parse_rule_spec(line: &str) -> Vec<String> {
    if !line.starts_with('-') {
        return Vec::new();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;

    for c in line.chars() {
        match c {
            '"' => in_quote = !in_quote,
            ' ' if !in_quote => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Returns true if the tokens carry `--comment <tag>`.
pub fn has_comment_tag(tokens: &[String], tag: &str) -> bool {
    tokens
        .windows(2)
        .any(|pair| pair[0] == "--comment" && pair[1] == tag)
}

/// Match specification of an `-A <chain> ...` line, for `iptables -D`.
///
/// Returns `None` if the tokens do not append to `chain`.
pub fn delete_spec(tokens: &[String], chain: &str) -> Option<Vec<String>> {
    match tokens {
        [flag, name, rest @ ..] if flag == "-A" && name == chain && !rest.is_empty() => {
            Some(rest.to_vec())
        }
        _ => None,
    }
}

/// Tokens of a tagged append rule in `chain`, ready for deletion.
///
/// Policy lines, foreign chains and rules without the tag yield `None`.
pub fn tagged_rule(line: &str, chain: &str, tag: &str) -> Option<Vec<String>> {
    let line = line.trim();
    if line.is_empty() || is_chain_rule(line) {
        return None;
    }
    let tokens = parse_rule_spec(line);
    if !has_comment_tag(&tokens, tag) {
        return None;
    }
    delete_spec(&tokens, chain)
}

/// Render a specification the way `iptables -S` prints it.
///
/// Tokens containing spaces are quoted.
pub fn render_rule(chain: &str, spec: &[String]) -> String {
    let mut line = format!("-A {}", chain);
    for token in spec {
        line.push(' ');
        if token.contains(' ') || token.is_empty() {
            line.push('"');
            line.push_str(token);
            line.push('"');
        } else {
            line.push_str(token);
        }
    }
    line
}
