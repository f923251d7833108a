//! Translation of YARA rulesets into backend prefilter queries.
//!
//! The backend cannot evaluate rules; it can only answer which indexed files
//! contain given byte sequences. This module extracts the fixed byte
//! sequences a rule needs and combines them into one query whose result set
//! over-approximates the files the ruleset could match; the scan phase then
//! refines per rule. Combination is OR over rules: a file passes the
//! prefilter if any individual rule could match it.
//!
//! The one rule the translation must never break: a file the ruleset could
//! match must never be excluded. Terms are therefore combined with AND only
//! when the condition provably requires every declared string, with OR only
//! when it provably requires at least one of them, and anything the
//! classifier cannot prove falls back to scanning everything.
//!
//! Query grammar understood by the backend: `"literal"` (with `\xNN`
//! escapes for non-printable bytes), `(a & b)`, `(a | b)`, and `*` for
//! match-everything.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TaskError;

/// Literals shorter than this index poorly and are not worth sending.
const MIN_TERM_BYTES: usize = 4;

static RULE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:private\s+|global\s+)*rule\s+([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex")
});

static STRING_DECL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\$[A-Za-z0-9_]*\s*=").expect("static regex"));

static TEXT_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*\$[A-Za-z0-9_]*\s*=\s*"((?:\\.|[^"\\])*)"([^\r\n]*)"#)
        .expect("static regex")
});

static HEX_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*\$[A-Za-z0-9_]*\s*=\s*\{([^}]*)\}").expect("static regex")
});

/// `all/any/N of them` (or the bare `($*)` set, which also covers every
/// declared string).
static OF_EVERY_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(all|any|[0-9]+)\s+of\s+(?:them|\(\s*\$\*\s*\))$").expect("static regex")
});

static STRING_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$[a-z0-9_]+$").expect("static regex"));

/// What a rule's condition provably says about its declared strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConditionKind {
    /// Every declared string must be present; terms combine with AND.
    AllStrings,
    /// At least one declared string must be present; terms combine with OR.
    SomeString,
    /// No string requirement can be proven (negation, counts, offsets,
    /// file properties, module calls, subsets of the strings). The rule
    /// widens to match-all.
    Opaque,
}

/// One rule reduced to what the prefilter can use.
#[derive(Debug, Clone)]
pub(crate) struct ParsedRule {
    pub name: String,
    /// One entry per usable string; inner vec holds encoding alternatives
    /// (e.g. ascii and wide), any of which satisfies the string.
    pub terms: Vec<Vec<Vec<u8>>>,
    /// Whether some declared string produced no usable term (regex strings,
    /// `nocase`/`xor`/`base64` modifiers, too-short literals). Such a
    /// string could satisfy the condition without any indexed byte
    /// sequence, so it poisons OR-combination.
    pub dropped_strings: bool,
    /// What the condition proves about the strings.
    pub condition: ConditionKind,
}

/// A prefilter expression tree, rendered with [`QueryExpr::to_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum QueryExpr {
    /// Matches every file.
    All,
    /// A byte sequence the file must contain.
    Literal(Vec<u8>),
    /// Every sub-expression must hold.
    And(Vec<QueryExpr>),
    /// At least one sub-expression must hold.
    Or(Vec<QueryExpr>),
}

impl QueryExpr {
    fn and(mut terms: Vec<QueryExpr>) -> QueryExpr {
        // `All` is the identity of AND
        terms.retain(|term| !matches!(term, QueryExpr::All));
        match terms.len() {
            0 => QueryExpr::All,
            1 => terms.remove(0),
            _ => QueryExpr::And(terms),
        }
    }

    fn or(mut terms: Vec<QueryExpr>) -> QueryExpr {
        // `All` absorbs OR
        if terms.is_empty() || terms.iter().any(|term| matches!(term, QueryExpr::All)) {
            return QueryExpr::All;
        }
        match terms.len() {
            1 => terms.remove(0),
            _ => QueryExpr::Or(terms),
        }
    }

    /// Render the expression in the backend's query grammar.
    pub fn to_query(&self) -> String {
        let mut out = String::new();
        self.render(&mut out);
        out
    }

    fn render(&self, out: &mut String) {
        match self {
            QueryExpr::All => out.push('*'),
            QueryExpr::Literal(bytes) => render_literal(bytes, out),
            QueryExpr::And(terms) => render_group(terms, " & ", out),
            QueryExpr::Or(terms) => render_group(terms, " | ", out),
        }
    }
}

fn render_group(terms: &[QueryExpr], separator: &str, out: &mut String) {
    out.push('(');
    for (i, term) in terms.iter().enumerate() {
        if i > 0 {
            out.push_str(separator);
        }
        term.render(out);
    }
    out.push(')');
}

fn render_literal(bytes: &[u8], out: &mut String) {
    out.push('"');
    for &b in bytes {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            0x20..=0x7e => out.push(b as char),
            _ => {
                out.push_str(&format!("\\x{b:02x}"));
            }
        }
    }
    out.push('"');
}

/// Reduce a ruleset's source text to per-rule prefilter terms.
///
/// This is deliberately more lenient than the rule compiler: anything it
/// cannot understand widens the query rather than failing the job. Actual
/// syntax errors still surface when the scan phase compiles the ruleset.
pub(crate) fn parse_rules(source: &str) -> Result<Vec<ParsedRule>, TaskError> {
    let headers: Vec<_> = RULE_HEADER.captures_iter(source).collect();
    if headers.is_empty() {
        return Err(TaskError::RuleParse("no rules found in ruleset".into()));
    }

    let mut rules = Vec::with_capacity(headers.len());
    for (i, header) in headers.iter().enumerate() {
        let body_start = header.get(0).map(|m| m.end()).unwrap_or_default();
        let body_end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(source.len());
        let body = &source[body_start..body_end];

        let strings_start = body.find("strings:");
        let condition_start = body.find("condition:");

        let strings_section = match (strings_start, condition_start) {
            (Some(s), Some(c)) if s < c => &body[s..c],
            (Some(s), None) => &body[s..],
            _ => "",
        };
        let condition = condition_start
            .map(|c| &body[c + "condition:".len()..])
            .unwrap_or_default();

        let (terms, dropped_strings) = parse_strings(strings_section);
        rules.push(ParsedRule {
            name: header
                .get(1)
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default(),
            terms,
            dropped_strings,
            condition: classify_condition(condition),
        });
    }
    Ok(rules)
}

/// Combine rules into one query: OR over rules, so the downstream scan can
/// still refine per rule.
pub(crate) fn combine_rules(rules: &[ParsedRule]) -> QueryExpr {
    QueryExpr::or(rules.iter().map(rule_expr).collect())
}

fn rule_expr(rule: &ParsedRule) -> QueryExpr {
    if rule.terms.is_empty() {
        return QueryExpr::All;
    }
    let terms: Vec<QueryExpr> = rule
        .terms
        .iter()
        .map(|alternatives| {
            QueryExpr::or(
                alternatives
                    .iter()
                    .map(|bytes| QueryExpr::Literal(bytes.clone()))
                    .collect(),
            )
        })
        .collect();
    match rule.condition {
        // Every declared string is required; the usable subset is a safe
        // weakening of that.
        ConditionKind::AllStrings => QueryExpr::and(terms),
        // At least one declared string is required. That is only a usable
        // bound if every declared string yielded a term; a dropped string
        // could be the one that fires.
        ConditionKind::SomeString if !rule.dropped_strings => QueryExpr::or(terms),
        _ => QueryExpr::All,
    }
}

/// Classify what a condition provably requires of the declared strings.
///
/// Recognized shapes, everything else is [`ConditionKind::Opaque`]:
/// - `all of them` (or `all of ($*)`), which covers every declared string;
/// - `any of them` / `N of them` with `N >= 1`;
/// - a parenthesized formula built purely from plain string references,
///   `and` and `or`. Such a formula is monotone, so it cannot hold with
///   zero strings present; but because it may reference only a subset of
///   the declared strings, it never proves that *all* of them are needed.
fn classify_condition(condition: &str) -> ConditionKind {
    let body = condition
        .trim()
        .trim_end_matches('}')
        .trim()
        .to_lowercase();

    if let Some(captures) = OF_EVERY_STRING.captures(&body) {
        return match &captures[1] {
            "all" => ConditionKind::AllStrings,
            "any" => ConditionKind::SomeString,
            count => match count.parse::<u64>() {
                Ok(n) if n >= 1 => ConditionKind::SomeString,
                _ => ConditionKind::Opaque,
            },
        };
    }

    let normalized = body.replace(['(', ')'], " ");
    let mut tokens = normalized.split_whitespace().peekable();
    if tokens.peek().is_none() {
        return ConditionKind::Opaque;
    }
    for token in tokens {
        match token {
            "and" | "or" => {}
            _ if STRING_REF.is_match(token) => {}
            _ => return ConditionKind::Opaque,
        }
    }
    ConditionKind::SomeString
}

fn parse_strings(section: &str) -> (Vec<Vec<Vec<u8>>>, bool) {
    let mut terms = Vec::new();
    let declared = STRING_DECL.find_iter(section).count();

    for captures in TEXT_STRING.captures_iter(section) {
        let Some(body) = captures.get(1) else {
            continue;
        };
        let modifiers = captures.get(2).map(|m| m.as_str()).unwrap_or_default();
        let modifiers: Vec<&str> = modifiers.split_whitespace().collect();

        // Modifiers that change the on-disk representation make the literal
        // unusable for exact indexing.
        if modifiers
            .iter()
            .any(|m| matches!(*m, "nocase" | "xor" | "base64" | "base64wide"))
        {
            continue;
        }

        let Some(plain) = unescape(body.as_str()) else {
            continue;
        };
        if plain.len() < MIN_TERM_BYTES {
            continue;
        }

        let wide = modifiers.contains(&"wide");
        let ascii = modifiers.contains(&"ascii");
        let mut alternatives = Vec::new();
        if !wide || ascii {
            alternatives.push(plain.clone());
        }
        if wide {
            alternatives.push(widen(&plain));
        }
        terms.push(alternatives);
    }

    for captures in HEX_STRING.captures_iter(section) {
        let Some(body) = captures.get(1) else {
            continue;
        };
        if let Some(run) = longest_fixed_run(body.as_str()) {
            terms.push(vec![run]);
        }
    }

    // Declarations that produced no term (regex strings, skipped modifiers,
    // short literals, wildcard-only hex) still count against the rule.
    let dropped = declared > terms.len();
    (terms, dropped)
}

fn unescape(body: &str) -> Option<Vec<u8>> {
    let mut bytes = Vec::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next()? {
            '"' => bytes.push(b'"'),
            '\\' => bytes.push(b'\\'),
            't' => bytes.push(b'\t'),
            'n' => bytes.push(b'\n'),
            'r' => bytes.push(b'\r'),
            '0' => bytes.push(0),
            'x' => {
                let hi = chars.next()?;
                let lo = chars.next()?;
                let mut hex = String::with_capacity(2);
                hex.push(hi);
                hex.push(lo);
                bytes.push(u8::from_str_radix(&hex, 16).ok()?);
            }
            _ => return None,
        }
    }
    Some(bytes)
}

/// UTF-16LE form of an ascii literal, as produced by the `wide` modifier.
fn widen(bytes: &[u8]) -> Vec<u8> {
    let mut wide = Vec::with_capacity(bytes.len() * 2);
    for &b in bytes {
        wide.push(b);
        wide.push(0);
    }
    wide
}

/// The longest contiguous run of fixed bytes in a hex string body, ignoring
/// wildcards, jumps and alternations. Runs shorter than the indexing
/// minimum are discarded.
fn longest_fixed_run(body: &str) -> Option<Vec<u8>> {
    let mut best: Option<Vec<u8>> = None;
    let mut current = Vec::new();
    for token in body.split_whitespace() {
        let fixed = token.len() == 2 && token.chars().all(|c| c.is_ascii_hexdigit());
        if fixed {
            if let Ok(byte) = u8::from_str_radix(token, 16) {
                current.push(byte);
                continue;
            }
        }
        if best.as_ref().map(|b| b.len()).unwrap_or(0) < current.len() {
            best = Some(std::mem::take(&mut current));
        }
        current.clear();
    }
    if best.as_ref().map(|b| b.len()).unwrap_or(0) < current.len() {
        best = Some(current);
    }
    best.filter(|run| run.len() >= MIN_TERM_BYTES)
}
