//! Static cost scoring for GraphQL documents.
//!
//! Every selected field costs its nesting depth, so wide shallow queries
//! stay cheap and deep fan-outs grow quickly. Arguments, aliases, fragment
//! names, directives, strings and comments are not fields.

use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CostEstimate {
    /// Number of selected fields.
    pub fields: u32,
    /// Deepest selection-set nesting.
    pub depth: u32,
    /// Sum of field depths.
    pub score: u32,
}

pub fn estimate_cost(query: &str) -> CostEstimate {
    let chars: Vec<char> = query.chars().collect();
    let mut estimate = CostEstimate::default();
    let mut depth: u32 = 0;
    let mut parens: u32 = 0;
    // Identifiers to ignore: the name after `...`, `on`, `@`, or a type condition.
    let mut skip_next: u32 = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
                continue;
            }
            '"' => {
                i = skip_string(&chars, i);
                continue;
            }
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '(' => parens += 1,
            ')' => parens = parens.saturating_sub(1),
            '@' => skip_next = 1,
            '.' if chars.get(i + 1) == Some(&'.') && chars.get(i + 2) == Some(&'.') => {
                skip_next = 1;
                i += 3;
                continue;
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && (chars[i] == '_' || chars[i].is_ascii_alphanumeric()) {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();

                if skip_next > 0 {
                    // `... on Type` skips both `on` and `Type`.
                    skip_next = if ident == "on" { 1 } else { skip_next - 1 };
                    continue;
                }
                if depth == 0 || parens > 0 || is_alias(&chars, i) {
                    continue;
                }

                estimate.fields = estimate.fields.saturating_add(1);
                estimate.score = estimate.score.saturating_add(depth);
                estimate.depth = estimate.depth.max(depth);
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    estimate
}

/// Index just past the string literal starting at `start`.
fn skip_string(chars: &[char], start: usize) -> usize {
    if chars[start..].starts_with(&['"', '"', '"']) {
        let mut i = start + 3;
        while i < chars.len() {
            if chars[i..].starts_with(&['"', '"', '"']) {
                return i + 3;
            }
            i += 1;
        }
        return chars.len();
    }

    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 2,
            '"' => return i + 1,
            _ => i += 1,
        }
    }
    chars.len()
}

/// Whether the identifier ending at `end` is followed by `:`.
fn is_alias(chars: &[char], end: usize) -> bool {
    chars[end..]
        .iter()
        .find(|c| !c.is_whitespace() && **c != ',')
        .is_some_and(|c| *c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_query() {
        let cost = estimate_cost("{ users { id name } }");
        assert_eq!(cost, CostEstimate { fields: 3, depth: 2, score: 5 });
    }

    #[test]
    fn nested_fields_cost_their_depth() {
        let cost = estimate_cost("{ users { id posts { title comments { body } } } }");
        assert_eq!(cost.fields, 6);
        assert_eq!(cost.depth, 4);
        assert_eq!(cost.score, 1 + 2 + 2 + 3 + 3 + 4);
    }

    #[test]
    fn operation_header_is_free() {
        let named = estimate_cost("query GetUsers($first: Int) { users(first: $first) { id } }");
        let anonymous = estimate_cost("{ users { id } }");
        assert_eq!(named, anonymous);
    }

    #[test]
    fn arguments_and_strings_are_ignored() {
        let cost = estimate_cost(r#"{ user(where: { name: "a { b c }" }) { id } }"#);
        assert_eq!(cost, CostEstimate { fields: 2, depth: 2, score: 3 });
    }

    #[test]
    fn aliases_count_once() {
        let cost = estimate_cost("{ admins: users(role: ADMIN) { id } }");
        assert_eq!(cost.fields, 2);
    }

    #[test]
    fn fragments_and_directives() {
        let cost = estimate_cost(
            "{ node { ...UserFields ... on Post { title } id @include(if: $full) } }",
        );
        // node, title, id
        assert_eq!(cost.fields, 3);
        assert_eq!(cost.score, 1 + 3 + 2);
    }

    #[test]
    fn comments_are_ignored() {
        let cost = estimate_cost("{\n  # expensive { a b c }\n  users { id }\n}");
        assert_eq!(cost.fields, 2);
    }

    #[test]
    fn block_strings_are_ignored() {
        let cost = estimate_cost("{ search(text: \"\"\"x { y }\"\"\") { id } }");
        assert_eq!(cost.fields, 2);
    }

    #[test]
    fn empty_document() {
        assert_eq!(estimate_cost(""), CostEstimate::default());
    }
}
