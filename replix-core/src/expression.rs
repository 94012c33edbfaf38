//! RSE expression language
//!
//! Expressions address sets of storage endpoints by name or attribute and
//! combine them with set operators:
//!
//! ```text
//! (tier=2&type=DATADISK)\SITE_A     every writable tier-2 disk except SITE_A
//! ((CERN_DISK)|(tier=1))\SITE_B     union, then difference
//! freespace>1000000                 numeric comparison
//! *                                 every endpoint
//! ```
//!
//! Operators `|` (union), `&` (intersection) and `\` (difference) share one
//! precedence level and associate to the left, so `A\B\C` excludes both `B`
//! and `C` from `A`.

use crate::endpoint::StorageEndpoint;
use crate::error::{ReplixError, Result};
use std::collections::BTreeSet;
use std::fmt;

/// Attribute comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Lt,
    Gt,
}

/// Parsed RSE expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    /// `*`
    All,
    /// Endpoint name, or an attribute that must be true
    Name(String),
    /// `key=value`, `key<value`, `key>value`
    Attribute {
        key: String,
        op: Comparison,
        value: String,
    },
    Union(Box<Expr>, Box<Expr>),
    Intersection(Box<Expr>, Box<Expr>),
    Difference(Box<Expr>, Box<Expr>),
}

/// Restrictions applied to the resolved endpoint set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpressionFilter {
    /// Keep only endpoints whose write availability matches
    pub availability_write: Option<bool>,
}

impl ExpressionFilter {
    /// Only endpoints that currently accept writes
    pub fn writable() -> Self {
        Self {
            availability_write: Some(true),
        }
    }

    fn accepts(&self, endpoint: &StorageEndpoint) -> bool {
        self.availability_write
            .map_or(true, |wanted| endpoint.availability_write == wanted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Union,
    Intersection,
    Difference,
    Star,
    Cmp(Comparison),
    Ident(String),
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '|' => Token::Union,
            '&' => Token::Intersection,
            '\\' => Token::Difference,
            '*' => Token::Star,
            '=' => Token::Cmp(Comparison::Eq),
            '<' => Token::Cmp(Comparison::Lt),
            '>' => Token::Cmp(Comparison::Gt),
            c if is_ident_char(c) => {
                let mut ident = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if !is_ident_char(next) {
                        break;
                    }
                    ident.push(next);
                    chars.next();
                }
                Token::Ident(ident)
            }
            other => {
                return Err(ReplixError::expression(
                    input,
                    format!("unexpected character '{}' at {}", other, pos),
                ))
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: impl Into<String>) -> ReplixError {
        ReplixError::expression(self.input, reason)
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut left = self.primary()?;

        loop {
            let combine: fn(Box<Expr>, Box<Expr>) -> Expr = match self.peek() {
                Some(Token::Union) => Expr::Union,
                Some(Token::Intersection) => Expr::Intersection,
                Some(Token::Difference) => Expr::Difference,
                _ => break,
            };
            self.pos += 1;
            let right = self.primary()?;
            left = combine(Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.error("unbalanced parenthesis")),
                }
            }
            Some(Token::Star) => Ok(Expr::All),
            Some(Token::Ident(key)) => match self.peek() {
                Some(Token::Cmp(op)) => {
                    let op = *op;
                    self.pos += 1;
                    match self.next() {
                        Some(Token::Ident(value)) => Ok(Expr::Attribute { key, op, value }),
                        _ => Err(self.error(format!("missing value for attribute '{}'", key))),
                    }
                }
                _ => Ok(Expr::Name(key)),
            },
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

fn values_equal(actual: &str, expected: &str) -> bool {
    if is_truthy(actual) || is_truthy(expected) {
        return is_truthy(actual) && is_truthy(expected);
    }
    actual == expected
}

impl Expr {
    /// Parse an expression
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(ReplixError::expression(input, "empty expression"));
        }

        let mut parser = Parser {
            input,
            tokens,
            pos: 0,
        };
        let expr = parser.expr()?;

        if let Some(token) = parser.peek() {
            if *token == Token::RParen {
                return Err(parser.error("unbalanced parenthesis"));
            }
            return Err(parser.error(format!("unexpected token {:?}", token)));
        }

        Ok(expr)
    }

    /// Does a single endpoint satisfy this expression?
    pub fn matches(&self, endpoint: &StorageEndpoint) -> bool {
        match self {
            Self::All => true,
            Self::Name(name) => {
                endpoint.name == *name
                    || endpoint.attribute(name).map_or(false, |v| is_truthy(&v))
            }
            Self::Attribute { key, op, value } => {
                let Some(actual) = endpoint.attribute(key) else {
                    return false;
                };
                match op {
                    Comparison::Eq => values_equal(&actual, value),
                    Comparison::Lt | Comparison::Gt => {
                        match (actual.parse::<f64>(), value.parse::<f64>()) {
                            (Ok(a), Ok(b)) if *op == Comparison::Lt => a < b,
                            (Ok(a), Ok(b)) => a > b,
                            _ => false,
                        }
                    }
                }
            }
            Self::Union(l, r) => l.matches(endpoint) || r.matches(endpoint),
            Self::Intersection(l, r) => l.matches(endpoint) && r.matches(endpoint),
            Self::Difference(l, r) => l.matches(endpoint) && !r.matches(endpoint),
        }
    }

    /// Resolve the expression against a set of endpoints, returning the names
    /// of the matching endpoints that pass `filter`.
    pub fn resolve(&self, endpoints: &[StorageEndpoint], filter: &ExpressionFilter) -> BTreeSet<String> {
        endpoints
            .iter()
            .filter(|ep| filter.accepts(ep) && self.matches(ep))
            .map(|ep| ep.name.clone())
            .collect()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "*"),
            Self::Name(name) => write!(f, "{}", name),
            Self::Attribute { key, op, value } => {
                let op = match op {
                    Comparison::Eq => '=',
                    Comparison::Lt => '<',
                    Comparison::Gt => '>',
                };
                write!(f, "{}{}{}", key, op, value)
            }
            Self::Union(l, r) => write!(f, "({})|({})", l, r),
            Self::Intersection(l, r) => write!(f, "({})&({})", l, r),
            Self::Difference(l, r) => write!(f, "({})\\({})", l, r),
        }
    }
}

/// Render `(base)\excluded`.
///
/// `excluded` is appended without parentheses, so an exclusion that is itself
/// a difference chain removes every endpoint it names.
pub fn difference(base: &str, excluded: &str) -> String {
    format!("({})\\{}", base, excluded)
}

/// Render `((left)|(right))\excluded`.
pub fn union_difference(left: &str, right: &str, excluded: &str) -> String {
    format!("(({})|({}))\\{}", left, right, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointType;
    use proptest::prelude::*;

    fn endpoints() -> Vec<StorageEndpoint> {
        vec![
            StorageEndpoint::new("T1_DISK_A", EndpointType::Disk, 1).with_attribute("cloud", "EU"),
            StorageEndpoint::new("T1_DISK_B", EndpointType::Disk, 1),
            StorageEndpoint::new("T1_TAPE", EndpointType::Archival, 1),
            StorageEndpoint::new("T2_DISK_A", EndpointType::Disk, 2).with_free_space(500),
            StorageEndpoint::new("T2_DISK_B", EndpointType::Disk, 2)
                .with_free_space(5000)
                .read_only(),
            StorageEndpoint::new("T3_DISK", EndpointType::Disk, 3).with_attribute("spacetoken", "True"),
        ]
    }

    fn resolve(expr: &str) -> Vec<String> {
        Expr::parse(expr)
            .unwrap()
            .resolve(&endpoints(), &ExpressionFilter::default())
            .into_iter()
            .collect()
    }

    #[test]
    fn test_parse_name_and_attribute() {
        assert_eq!(Expr::parse("SITE_A").unwrap(), Expr::Name("SITE_A".to_string()));
        assert_eq!(
            Expr::parse("tier = 2").unwrap(),
            Expr::Attribute {
                key: "tier".to_string(),
                op: Comparison::Eq,
                value: "2".to_string()
            }
        );
    }

    #[test]
    fn test_tier_policy_expression() {
        assert_eq!(
            resolve("(tier=1&type=DATADISK)\\T1_DISK_A"),
            vec!["T1_DISK_B".to_string()]
        );
    }

    #[test]
    fn test_difference_chain_excludes_every_operand() {
        assert_eq!(
            resolve("(type=DATADISK)\\(T1_DISK_A|T2_DISK_A)\\T3_DISK"),
            vec!["T1_DISK_B".to_string(), "T2_DISK_B".to_string()]
        );
    }

    #[test]
    fn test_union_and_star() {
        assert_eq!(resolve("T1_TAPE|T3_DISK").len(), 2);
        assert_eq!(resolve("*").len(), 6);
        assert_eq!(resolve("*\\type=TAPE").len(), 5);
    }

    #[test]
    fn test_numeric_comparison() {
        assert_eq!(resolve("freespace>1000"), vec!["T2_DISK_B".to_string()]);
        assert_eq!(resolve("freespace<1000"), vec!["T2_DISK_A".to_string()]);
        assert!(resolve("cloud>1").is_empty());
    }

    #[test]
    fn test_boolean_attribute_by_name() {
        assert_eq!(resolve("spacetoken"), vec!["T3_DISK".to_string()]);
        assert_eq!(resolve("spacetoken=true"), vec!["T3_DISK".to_string()]);
    }

    #[test]
    fn test_writable_filter() {
        let names = Expr::parse("tier=2")
            .unwrap()
            .resolve(&endpoints(), &ExpressionFilter::writable());
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["T2_DISK_A".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("   ").is_err());
        assert!(Expr::parse("(tier=1").is_err());
        assert!(Expr::parse("tier=1)").is_err());
        assert!(Expr::parse("tier=").is_err());
        assert!(Expr::parse("A|").is_err());
        assert!(Expr::parse("A B").is_err());
        assert!(Expr::parse("A#B").is_err());
    }

    #[test]
    fn test_render_helpers() {
        assert_eq!(difference("tier=1&type=DATADISK", "SITE"), "(tier=1&type=DATADISK)\\SITE");
        assert_eq!(
            difference("tier=2", &difference("cloud=US", "SITE")),
            "(tier=2)\\(cloud=US)\\SITE"
        );
        assert_eq!(union_difference("A", "B", "C"), "((A)|(B))\\C");
    }

    #[test]
    fn test_display_reparses() {
        let expr = Expr::parse("(A|tier=2)\\B&C").unwrap();
        let rendered = expr.to_string();
        assert_eq!(Expr::parse(&rendered).unwrap(), expr);
    }

    proptest! {
        #[test]
        fn prop_difference_removes_excluded(
            names in proptest::collection::btree_set("[A-Z][A-Z0-9_]{0,8}", 1..12),
            pick in any::<prop::sample::Index>(),
        ) {
            let names: Vec<String> = names.into_iter().collect();
            let excluded = pick.get(&names).clone();
            let eps: Vec<StorageEndpoint> = names
                .iter()
                .map(|n| StorageEndpoint::new(n.clone(), EndpointType::Disk, 2))
                .collect();

            let resolved = Expr::parse(&difference("*", &excluded))
                .unwrap()
                .resolve(&eps, &ExpressionFilter::default());

            prop_assert!(!resolved.contains(&excluded));
            prop_assert_eq!(resolved.len(), names.len() - 1);
        }
    }
}
