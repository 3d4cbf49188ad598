//! Query language parser
//!
//! A small expression language over the build graph:
//!
//! ```text
//! //...                 every target
//! //app/...             every target under a package prefix
//! //app:main            one target
//! //lib:*               every target in one package
//! deps(e[, depth])      transitive dependencies
//! rdeps(e)              transitive dependents
//! allpaths(from, to)    every node on any path between two sets
//! kind(type, e)         filter by target type
//! attr(name, value, e)  filter by attribute
//! ```
//!
//! Hand-rolled tokenizer and recursive descent; the grammar is small
//! enough that a parser library would be more code than this.

use crate::error::BuildError;
use crate::graph::TargetId;
use thiserror::Error;

/// Query parse and evaluation failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The input is not a valid expression
    #[error("query syntax error: {0}")]
    Syntax(String),

    /// A function received the wrong arguments
    #[error("bad arguments to {function}: {detail}")]
    BadArguments {
        /// The function name
        function: String,
        /// What was wrong
        detail: String,
    },

    /// A pattern is not one of the supported forms
    #[error("unsupported target pattern '{0}'")]
    BadPattern(String),
}

impl From<QueryError> for BuildError {
    fn from(err: QueryError) -> Self {
        BuildError::Query(err.to_string())
    }
}

/// A target-set pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPattern {
    /// `//...`
    All,
    /// `//path/...`
    Recursive {
        /// Package prefix
        path: String,
    },
    /// `//path:*`
    Package {
        /// Exact package
        path: String,
    },
    /// `//path:name`
    Exact(TargetId),
}

/// A parsed query expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpr {
    /// A pattern leaf
    Pattern(TargetPattern),
    /// `deps(e)` or `deps(e, depth)`
    Deps(Box<QueryExpr>, Option<u32>),
    /// `rdeps(e)`
    Rdeps(Box<QueryExpr>),
    /// `allpaths(from, to)`
    AllPaths(Box<QueryExpr>, Box<QueryExpr>),
    /// `kind(type, e)`
    Kind(String, Box<QueryExpr>),
    /// `attr(name, value, e)`
    Attr(String, String, Box<QueryExpr>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Comma,
    Word(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for c in input.chars() {
        match c {
            '(' | ')' | ',' => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                });
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

/// Parse one query expression
pub fn parse(input: &str) -> Result<QueryExpr, QueryError> {
    let tokens = tokenize(input);
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(QueryError::Syntax(format!(
            "trailing input after expression in '{input}'"
        )));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token, context: &str) -> Result<(), QueryError> {
        match self.next() {
            Some(found) if found == token => Ok(()),
            other => Err(QueryError::Syntax(format!(
                "expected {token:?} {context}, found {other:?}"
            ))),
        }
    }

    fn expr(&mut self) -> Result<QueryExpr, QueryError> {
        let word = match self.next() {
            Some(Token::Word(word)) => word,
            other => {
                return Err(QueryError::Syntax(format!(
                    "expected a pattern or function, found {other:?}"
                )))
            }
        };

        if self.peek() == Some(&Token::LParen) {
            self.function(&word)
        } else {
            Ok(QueryExpr::Pattern(parse_pattern(&word)?))
        }
    }

    fn function(&mut self, name: &str) -> Result<QueryExpr, QueryError> {
        self.expect(Token::LParen, "after function name")?;
        let expr = match name {
            "deps" => {
                let inner = self.expr()?;
                let depth = if self.peek() == Some(&Token::Comma) {
                    self.next();
                    Some(self.number("deps")?)
                } else {
                    None
                };
                QueryExpr::Deps(Box::new(inner), depth)
            }
            "rdeps" => QueryExpr::Rdeps(Box::new(self.expr()?)),
            "allpaths" => {
                let from = self.expr()?;
                self.expect(Token::Comma, "between allpaths arguments")?;
                let to = self.expr()?;
                QueryExpr::AllPaths(Box::new(from), Box::new(to))
            }
            "kind" => {
                let kind = self.word("kind")?;
                self.expect(Token::Comma, "between kind arguments")?;
                QueryExpr::Kind(kind, Box::new(self.expr()?))
            }
            "attr" => {
                let attr_name = self.word("attr")?;
                self.expect(Token::Comma, "between attr arguments")?;
                let value = self.word("attr")?;
                self.expect(Token::Comma, "between attr arguments")?;
                QueryExpr::Attr(attr_name, value, Box::new(self.expr()?))
            }
            other => {
                return Err(QueryError::Syntax(format!("unknown function '{other}'")));
            }
        };
        self.expect(Token::RParen, "to close function call")?;
        Ok(expr)
    }

    fn word(&mut self, function: &str) -> Result<String, QueryError> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word),
            other => Err(QueryError::BadArguments {
                function: function.to_string(),
                detail: format!("expected a word, found {other:?}"),
            }),
        }
    }

    fn number(&mut self, function: &str) -> Result<u32, QueryError> {
        let word = self.word(function)?;
        word.parse().map_err(|_| QueryError::BadArguments {
            function: function.to_string(),
            detail: format!("expected a number, found '{word}'"),
        })
    }
}

fn parse_pattern(word: &str) -> Result<TargetPattern, QueryError> {
    let body = word
        .strip_prefix("//")
        .ok_or_else(|| QueryError::BadPattern(word.to_string()))?;

    if body == "..." {
        return Ok(TargetPattern::All);
    }
    if let Some(path) = body.strip_suffix("/...") {
        if path.is_empty() || path.contains(':') {
            return Err(QueryError::BadPattern(word.to_string()));
        }
        return Ok(TargetPattern::Recursive {
            path: path.to_string(),
        });
    }
    if let Some(path) = body.strip_suffix(":*") {
        if path.is_empty() {
            return Err(QueryError::BadPattern(word.to_string()));
        }
        return Ok(TargetPattern::Package {
            path: path.to_string(),
        });
    }
    match body.split_once(':') {
        Some((path, name)) if !path.is_empty() && !name.is_empty() => {
            Ok(TargetPattern::Exact(word.to_string()))
        }
        _ => Err(QueryError::BadPattern(word.to_string())),
    }
}
