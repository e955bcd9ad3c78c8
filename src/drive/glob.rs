//! Shell-style glob matching over tree paths.
//!
//! Matching is structural: the pattern and the path are both split on `/`
//! and compared segment by segment.
//!
//! - `*` matches any run of characters inside one segment
//! - `?` matches exactly one character inside one segment
//! - `[abc]`, `[a-z]`, `[!a-z]` match one character from (or not from) a class
//! - `**` as a whole segment matches zero or more segments
//! - `\` escapes the next character

use crate::drive::tree::clean_path;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(char),
    AnyChar,
    AnyRun,
    Class { negated: bool, ranges: Vec<(char, char)> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    AnyPath,
    Tokens(Vec<Token>),
}

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    segments: Vec<Segment>,
}

impl GlobPattern {
    /// Compile a pattern. A leading `/` is optional.
    pub fn new(pattern: &str) -> Self {
        let segments = clean_path(pattern)
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::AnyPath
                } else {
                    Segment::Tokens(parse_segment(s))
                }
            })
            .collect();
        Self { segments }
    }

    /// Match a cleaned path (no leading slash, `""` for the root).
    pub fn matches(&self, path: &str) -> bool {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match_segments(&self.segments, &parts)
    }
}

fn parse_segment(segment: &str) -> Vec<Token> {
    let chars: Vec<char> = segment.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '*' => {
                // consecutive stars inside a segment behave like one
                if tokens.last() != Some(&Token::AnyRun) {
                    tokens.push(Token::AnyRun);
                }
                i += 1;
            }
            '?' => {
                tokens.push(Token::AnyChar);
                i += 1;
            }
            '\\' if i + 1 < chars.len() => {
                tokens.push(Token::Literal(chars[i + 1]));
                i += 2;
            }
            '[' => match parse_class(&chars[i + 1..]) {
                Some((token, consumed)) => {
                    tokens.push(token);
                    i += 1 + consumed;
                }
                // unterminated class: treat '[' literally
                None => {
                    tokens.push(Token::Literal('['));
                    i += 1;
                }
            },
            c => {
                tokens.push(Token::Literal(c));
                i += 1;
            }
        }
    }
    tokens
}

/// parse the body of a class after `[`; returns the token and chars consumed
/// including the closing `]`
fn parse_class(chars: &[char]) -> Option<(Token, usize)> {
    let mut i = 0;
    let negated = matches!(chars.first(), Some('!') | Some('^'));
    if negated {
        i += 1;
    }

    let mut ranges = Vec::new();
    let mut first = true;
    while i < chars.len() {
        let c = chars[i];
        // a ']' right after the opening bracket is a literal member
        if c == ']' && !first {
            return Some((Token::Class { negated, ranges }, i + 1));
        }
        first = false;

        if i + 2 < chars.len() && chars[i + 1] == '-' && chars[i + 2] != ']' {
            ranges.push((c, chars[i + 2]));
            i += 3;
        } else {
            ranges.push((c, c));
            i += 1;
        }
    }
    None
}

fn match_segments(pattern: &[Segment], parts: &[&str]) -> bool {
    wildcard_match(
        pattern,
        parts,
        |segment| matches!(segment, Segment::AnyPath),
        |segment, part| match segment {
            Segment::Tokens(tokens) => {
                let chars: Vec<char> = part.chars().collect();
                match_tokens(tokens, &chars)
            }
            Segment::AnyPath => true,
        },
    )
}

fn match_tokens(tokens: &[Token], chars: &[char]) -> bool {
    wildcard_match(
        tokens,
        chars,
        |token| matches!(token, Token::AnyRun),
        |token, c| match_char(token, *c),
    )
}

/// Linear-backtracking wildcard match: `star` items match any run of
/// `items`, everything else matches exactly one item via `one`.
///
/// Only the most recent star is ever resumed, so the cost is bounded by
/// `pattern.len() * items.len()` calls to `one`.
fn wildcard_match<P, T>(
    pattern: &[P],
    items: &[T],
    star: impl Fn(&P) -> bool,
    one: impl Fn(&P, &T) -> bool,
) -> bool {
    let (mut p, mut i) = (0, 0);
    // (pattern index after the last star, item index that star resumes from)
    let mut resume: Option<(usize, usize)> = None;

    while i < items.len() {
        match pattern.get(p) {
            Some(item) if star(item) => {
                p += 1;
                resume = Some((p, i));
            }
            Some(item) if one(item, &items[i]) => {
                p += 1;
                i += 1;
            }
            _ => match resume {
                // let the last star swallow one more item and retry
                Some((after_star, from)) => {
                    p = after_star;
                    i = from + 1;
                    resume = Some((after_star, i));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(star)
}

fn match_char(token: &Token, c: char) -> bool {
    match token {
        Token::Literal(l) => *l == c,
        Token::AnyChar => true,
        Token::AnyRun => true,
        Token::Class { negated, ranges } => {
            let hit = ranges.iter().any(|(lo, hi)| *lo <= c && c <= *hi);
            hit != *negated
        }
    }
}
