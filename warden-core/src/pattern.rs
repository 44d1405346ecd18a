//! Substrate pattern dialect.
//!
//! Context filters and backprop edge types are patterns in the substrate's
//! scripting pattern language. This module is the single implementation of
//! that dialect: the atomic script kernels match with it server-side, and
//! the permission grammar reuses it for host-side filtering, so the two
//! sides can never disagree on what a pattern means.
//!
//! The dialect is the classic scripting one: `.` matches any character,
//! `%d %a %l %u %s %w %x %p %c` are character classes (uppercase letters
//! complement them), `%` escapes magic characters, `[...]` is a set with
//! ranges and `^` negation, and `* + - ?` quantify the preceding element
//! (`-` is the shortest-match star, so a literal dash must be written
//! `%-`). Patterns match the WHOLE token: there is no substring search, and
//! `^`/`$` at the edges are accepted as no-op anchors. `.*` is therefore
//! the universal pattern.

use crate::SubstrateError;
use thiserror::Error;

/// A pattern that could not be compiled. Surfaced by the scripts as a
/// script evaluation error: a malformed filter or edge type means the
/// topology is corrupted, not that the lookup missed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

impl From<PatternError> for SubstrateError {
    fn from(err: PatternError) -> Self {
        SubstrateError::Script {
            reason: err.to_string(),
        }
    }
}

/// One entry of a `[...]` set.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SetEntry {
    Char(char),
    Range(char, char),
    Class(char),
}

/// A single-character matcher.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Single {
    Literal(char),
    Any,
    Class(char),
    Set {
        negated: bool,
        entries: Vec<SetEntry>,
    },
}

/// Quantifier applied to a [`Single`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quant {
    One,
    ZeroOrMore,
    OneOrMore,
    ZeroOrOne,
    /// `-`: shortest-match zero-or-more.
    Lazy,
}

/// A compiled pattern. Compile once, match many - the dominance and
/// propagate kernels test one pattern against whole permission sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    elems: Vec<(Single, Quant)>,
}

impl Pattern {
    /// Compile `pattern`, rejecting malformed input.
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let chars: Vec<char> = pattern.chars().collect();
        let mut elems = Vec::new();
        let mut i = 0;

        // Leading ^ is redundant (matching is anchored) but accepted.
        if chars.first() == Some(&'^') {
            i = 1;
        }

        while i < chars.len() {
            // Trailing $ is likewise a no-op anchor.
            if chars[i] == '$' && i + 1 == chars.len() {
                break;
            }
            let single = match chars[i] {
                '%' => {
                    i += 1;
                    let c = *chars
                        .get(i)
                        .ok_or_else(|| malformed(pattern, "dangling % escape"))?;
                    i += 1;
                    if c.is_ascii_alphabetic() {
                        if !is_known_class(c) {
                            return Err(malformed(pattern, &format!("unknown class %{c}")));
                        }
                        Single::Class(c)
                    } else {
                        Single::Literal(c)
                    }
                }
                '.' => {
                    i += 1;
                    Single::Any
                }
                '[' => {
                    let (set, next) = parse_set(&chars, i, pattern)?;
                    i = next;
                    set
                }
                '*' | '+' | '?' | '-' => {
                    return Err(malformed(pattern, "quantifier with nothing to repeat"));
                }
                c => {
                    i += 1;
                    Single::Literal(c)
                }
            };
            let quant = match chars.get(i) {
                Some('*') => {
                    i += 1;
                    Quant::ZeroOrMore
                }
                Some('+') => {
                    i += 1;
                    Quant::OneOrMore
                }
                Some('-') => {
                    i += 1;
                    Quant::Lazy
                }
                Some('?') => {
                    i += 1;
                    Quant::ZeroOrOne
                }
                _ => Quant::One,
            };
            elems.push((single, quant));
        }

        Ok(Self {
            source: pattern.to_string(),
            elems,
        })
    }

    /// Whether `token` matches this pattern in full.
    pub fn matches(&self, token: &str) -> bool {
        let text: Vec<char> = token.chars().collect();
        match_here(&self.elems, &text, 0, 0)
    }

    /// The pattern text this was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// One-shot convenience for callers matching a single token.
pub fn matches(pattern: &str, token: &str) -> Result<bool, PatternError> {
    Ok(Pattern::compile(pattern)?.matches(token))
}

/// Escape `literal` so it matches only itself.
pub fn escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if is_magic(c) {
            out.push('%');
        }
        out.push(c);
    }
    out
}

fn is_magic(c: char) -> bool {
    matches!(
        c,
        '^' | '$' | '*' | '+' | '?' | '.' | '(' | ')' | '[' | ']' | '%' | '-'
    )
}

fn is_known_class(c: char) -> bool {
    matches!(
        c.to_ascii_lowercase(),
        'a' | 'c' | 'd' | 'l' | 'p' | 's' | 'u' | 'w' | 'x'
    )
}

fn malformed(pattern: &str, reason: &str) -> PatternError {
    PatternError {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a `[...]` set starting at `chars[start] == '['`. Returns the set
/// and the index just past the closing `]`.
fn parse_set(
    chars: &[char],
    start: usize,
    pattern: &str,
) -> Result<(Single, usize), PatternError> {
    let mut i = start + 1;
    let negated = chars.get(i) == Some(&'^');
    if negated {
        i += 1;
    }

    let mut entries = Vec::new();
    let mut first = true;
    loop {
        let c = *chars
            .get(i)
            .ok_or_else(|| malformed(pattern, "unclosed character set"))?;
        if c == ']' && !first {
            i += 1;
            break;
        }
        first = false;
        if c == '%' {
            i += 1;
            let e = *chars
                .get(i)
                .ok_or_else(|| malformed(pattern, "dangling % escape in set"))?;
            i += 1;
            if e.is_ascii_alphabetic() {
                if !is_known_class(e) {
                    return Err(malformed(pattern, &format!("unknown class %{e} in set")));
                }
                entries.push(SetEntry::Class(e));
            } else {
                entries.push(SetEntry::Char(e));
            }
        } else if chars.get(i + 1) == Some(&'-') && chars.get(i + 2).is_some_and(|&n| n != ']') {
            let hi = chars[i + 2];
            if c > hi {
                return Err(malformed(pattern, &format!("inverted range {c}-{hi}")));
            }
            entries.push(SetEntry::Range(c, hi));
            i += 3;
        } else {
            entries.push(SetEntry::Char(c));
            i += 1;
        }
    }

    Ok((Single::Set { negated, entries }, i))
}

fn class_matches(class: char, ch: char) -> bool {
    let hit = match class.to_ascii_lowercase() {
        'a' => ch.is_ascii_alphabetic(),
        'c' => ch.is_ascii_control(),
        'd' => ch.is_ascii_digit(),
        'l' => ch.is_ascii_lowercase(),
        'p' => ch.is_ascii_punctuation(),
        's' => ch.is_ascii_whitespace(),
        'u' => ch.is_ascii_uppercase(),
        'w' => ch.is_ascii_alphanumeric(),
        'x' => ch.is_ascii_hexdigit(),
        _ => false,
    };
    if class.is_ascii_uppercase() {
        !hit
    } else {
        hit
    }
}

fn single_matches(single: &Single, ch: char) -> bool {
    match single {
        Single::Literal(c) => *c == ch,
        Single::Any => true,
        Single::Class(c) => class_matches(*c, ch),
        Single::Set { negated, entries } => {
            let mut found = false;
            for entry in entries {
                let hit = match entry {
                    SetEntry::Char(c) => *c == ch,
                    SetEntry::Range(lo, hi) => (*lo..=*hi).contains(&ch),
                    SetEntry::Class(c) => class_matches(*c, ch),
                };
                if hit {
                    found = true;
                    break;
                }
            }
            found != *negated
        }
    }
}

fn match_here(elems: &[(Single, Quant)], text: &[char], ei: usize, ti: usize) -> bool {
    if ei == elems.len() {
        return ti == text.len();
    }
    let (single, quant) = &elems[ei];
    match quant {
        Quant::One => {
            ti < text.len()
                && single_matches(single, text[ti])
                && match_here(elems, text, ei + 1, ti + 1)
        }
        Quant::ZeroOrOne => {
            if ti < text.len()
                && single_matches(single, text[ti])
                && match_here(elems, text, ei + 1, ti + 1)
            {
                return true;
            }
            match_here(elems, text, ei + 1, ti)
        }
        Quant::ZeroOrMore => {
            let run = run_length(single, text, ti);
            (0..=run).rev().any(|k| match_here(elems, text, ei + 1, ti + k))
        }
        Quant::OneOrMore => {
            let run = run_length(single, text, ti);
            (1..=run).rev().any(|k| match_here(elems, text, ei + 1, ti + k))
        }
        Quant::Lazy => {
            let run = run_length(single, text, ti);
            (0..=run).any(|k| match_here(elems, text, ei + 1, ti + k))
        }
    }
}

/// Longest run of characters from `ti` matched by `single`.
fn run_length(single: &Single, text: &[char], ti: usize) -> usize {
    let mut n = 0;
    while ti + n < text.len() && single_matches(single, text[ti + n]) {
        n += 1;
    }
    n
}
