use serde_json::Value;

use super::Label;

/// Boolean expression language over label sets, shared by rule selection,
/// incident-variable filtering, and dependency label filtering.
///
/// Grammar: `expr := or`, `or := and ('||' and)*`,
/// `and := unary ('&&' unary)*`, `unary := '!' unary | '(' expr ')' | term`,
/// `term := key | key '=' value`. `!` binds tightest, then `&&`, then `||`.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelSelector {
    expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Key(String),
    KeyValue(String, String),
    Not(Box<Expr>),
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SelectorError {
    #[error("empty selector expression")]
    Empty,

    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("unexpected token {0:?}")]
    UnexpectedToken(String),

    #[error("unbalanced parentheses")]
    Unbalanced,

    #[error("trailing input after expression: {0:?}")]
    TrailingInput(String),
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Eq,
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '*' | '+')
}

fn tokenize(input: &str) -> Result<Vec<Token>, SelectorError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '&' => {
                chars.next();
                match chars.next() {
                    Some((_, '&')) => tokens.push(Token::And),
                    _ => return Err(SelectorError::UnexpectedChar('&', offset)),
                }
            }
            '|' => {
                chars.next();
                match chars.next() {
                    Some((_, '|')) => tokens.push(Token::Or),
                    _ => return Err(SelectorError::UnexpectedChar('|', offset)),
                }
            }
            c if is_ident_char(c) => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if !is_ident_char(c) {
                        break;
                    }
                    ident.push(c);
                    chars.next();
                }
                tokens.push(Token::Ident(ident));
            }
            c => return Err(SelectorError::UnexpectedChar(c, offset)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expr(&mut self) -> Result<Expr, SelectorError> {
        let mut operands = vec![self.and_expr()?];
        while self.peek() == Some(&Token::Or) {
            self.next();
            operands.push(self.and_expr()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::Or(operands)
        })
    }

    fn and_expr(&mut self) -> Result<Expr, SelectorError> {
        let mut operands = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.next();
            operands.push(self.unary()?);
        }
        Ok(if operands.len() == 1 {
            operands.remove(0)
        } else {
            Expr::And(operands)
        })
    }

    fn unary(&mut self) -> Result<Expr, SelectorError> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(SelectorError::Unbalanced),
                }
            }
            Some(Token::Ident(key)) => {
                if self.peek() == Some(&Token::Eq) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(value)) => Ok(Expr::KeyValue(key, value)),
                        token => Err(SelectorError::UnexpectedToken(format!("{token:?}"))),
                    }
                } else {
                    Ok(Expr::Key(key))
                }
            }
            token => Err(SelectorError::UnexpectedToken(format!("{token:?}"))),
        }
    }
}

impl LabelSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(SelectorError::Empty);
        }
        let mut parser = Parser {
            tokens,
            position: 0,
        };
        let expr = parser.expr()?;
        if parser.position != parser.tokens.len() {
            return Err(SelectorError::TrailingInput(format!(
                "{:?}",
                &parser.tokens[parser.position..]
            )));
        }
        Ok(Self { expr })
    }

    pub fn matches(&self, labels: &[Label]) -> bool {
        eval(&self.expr, labels)
    }

    /// Incident variables are matched as if each entry were a
    /// `key=stringified-value` label.
    pub fn matches_variables(&self, variables: &serde_json::Map<String, Value>) -> bool {
        let labels: Vec<Label> = variables
            .iter()
            .map(|(key, value)| Label {
                key: key.clone(),
                value: Some(stringify(value)),
            })
            .collect();
        self.matches(&labels)
    }

    /// Dependency labels arrive as raw `key=value` strings.
    pub fn matches_raw(&self, raw_labels: &[String]) -> bool {
        let labels: Vec<Label> = raw_labels.iter().map(|raw| Label::parse(raw)).collect();
        self.matches(&labels)
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn eval(expr: &Expr, labels: &[Label]) -> bool {
    match expr {
        Expr::Key(key) => labels.iter().any(|label| &label.key == key),
        Expr::KeyValue(key, value) => labels
            .iter()
            .any(|label| &label.key == key && label.value.as_deref() == Some(value)),
        Expr::Not(inner) => !eval(inner, labels),
        Expr::And(operands) => operands.iter().all(|operand| eval(operand, labels)),
        Expr::Or(operands) => operands.iter().any(|operand| eval(operand, labels)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(raw: &[&str]) -> Vec<Label> {
        raw.iter().map(|r| Label::parse(r)).collect()
    }

    #[test]
    fn bare_key_matches_any_value() {
        let selector = LabelSelector::parse("konveyor.io/source").unwrap();
        assert!(selector.matches(&labels(&["konveyor.io/source=java"])));
        assert!(selector.matches(&labels(&["konveyor.io/source"])));
        assert!(!selector.matches(&labels(&["konveyor.io/target=java"])));
    }

    #[test]
    fn equality_compares_values() {
        let selector = LabelSelector::parse("lang=go").unwrap();
        assert!(selector.matches(&labels(&["lang=go"])));
        assert!(!selector.matches(&labels(&["lang=java"])));
        assert!(!selector.matches(&labels(&["lang"])));
    }

    #[test]
    fn not_binds_tighter_than_and_which_binds_tighter_than_or() {
        // parsed as (!a && b) || c
        let selector = LabelSelector::parse("!a && b || c").unwrap();
        assert!(selector.matches(&labels(&["b"])));
        assert!(selector.matches(&labels(&["a", "c"])));
        assert!(!selector.matches(&labels(&["a", "b"])));
    }

    #[test]
    fn parentheses_override_precedence() {
        let selector = LabelSelector::parse("!(a || b)").unwrap();
        assert!(selector.matches(&labels(&["c"])));
        assert!(!selector.matches(&labels(&["a"])));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(LabelSelector::parse("").is_err());
        assert!(LabelSelector::parse("a &&").is_err());
        assert!(LabelSelector::parse("(a").is_err());
        assert!(LabelSelector::parse("a | b").is_err());
        assert!(LabelSelector::parse("a b").is_err());
    }

    #[test]
    fn matches_incident_variables_as_labels() {
        let selector = LabelSelector::parse("package=fs").unwrap();
        let mut variables = serde_json::Map::new();
        variables.insert("package".to_owned(), Value::String("fs".to_owned()));
        assert!(selector.matches_variables(&variables));
    }
}
