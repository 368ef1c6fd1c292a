//! Deterministic quick-answer evaluator.
//!
//! Intercepts queries that can be answered without the model: a constrained
//! arithmetic grammar (digits, `+ - * / ( )`, optional leading "what is").
//! On a match the answer comes back instantly and no subprocess is spawned.
//! Anything outside the grammar falls through to the broker untouched.

/// Try to answer the query deterministically. Returns `None` if the text is
/// not pure arithmetic or the result is not finite.
pub fn evaluate(text: &str) -> Option<String> {
    let expr = strip_question_framing(text);
    if !is_arithmetic_candidate(expr) {
        return None;
    }

    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(&tokens);
    let value = parser.parse_expr()?;
    if !parser.at_end() {
        return None;
    }
    if !value.is_finite() {
        // Division by zero and overflow are not quick answers.
        return None;
    }

    Some(format_value(value))
}

/// Drop an optional "what is"/"what's" prefix and trailing `?`/`=` framing.
fn strip_question_framing(text: &str) -> &str {
    let mut s = text.trim();
    let lower = s.to_lowercase();
    for prefix in ["what is", "what's", "whats"] {
        if lower.starts_with(prefix) {
            s = s[prefix.len()..].trim_start();
            break;
        }
    }
    s.trim_end_matches(['?', '=']).trim()
}

/// Charset gate: digits, operators, parens, decimal point, whitespace only,
/// and at least one digit. Anything else is not our grammar.
fn is_arithmetic_candidate(expr: &str) -> bool {
    !expr.is_empty()
        && expr.chars().any(|c| c.is_ascii_digit())
        && expr
            .chars()
            .all(|c| c.is_ascii_digit() || "+-*/(). \t".contains(c))
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                let mut seen_dot = false;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    if chars[i] == '.' {
                        if seen_dot {
                            return None;
                        }
                        seen_dot = true;
                    }
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(literal.parse().ok()?));
            }
            _ => return None,
        }
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens)
    }
}

/// Recursive-descent parser with standard precedence over f64.
struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).copied()
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.peek()?;
        self.pos += 1;
        Some(t)
    }

    fn at_end(&self) -> bool {
        self.pos == self.tokens.len()
    }

    fn parse_expr(&mut self) -> Option<f64> {
        let mut value = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.advance();
                    value += self.parse_term()?;
                }
                Token::Minus => {
                    self.advance();
                    value -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn parse_term(&mut self) -> Option<f64> {
        let mut value = self.parse_factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.advance();
                    value *= self.parse_factor()?;
                }
                Token::Slash => {
                    self.advance();
                    value /= self.parse_factor()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn parse_factor(&mut self) -> Option<f64> {
        match self.advance()? {
            Token::Number(n) => Some(n),
            Token::Minus => Some(-self.parse_factor()?),
            Token::Plus => self.parse_factor(),
            Token::Open => {
                let value = self.parse_expr()?;
                match self.advance()? {
                    Token::Close => Some(value),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

/// Format without float noise: integers as integers, otherwise up to six
/// decimal places with trailing zeros trimmed.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let s = format!("{:.6}", value);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers_plain_arithmetic() {
        assert_eq!(evaluate("2+2"), Some("4".to_string()));
        assert_eq!(evaluate(" 7 * 6 "), Some("42".to_string()));
        assert_eq!(evaluate("10 - 3 - 2"), Some("5".to_string()));
    }

    #[test]
    fn answers_what_is_framing() {
        assert_eq!(evaluate("What is 2+2?"), Some("4".to_string()));
        assert_eq!(evaluate("what's 100 / 4"), Some("25".to_string()));
        assert_eq!(evaluate("What is (3 + 5) * 2 ="), Some("16".to_string()));
    }

    #[test]
    fn respects_operator_precedence() {
        assert_eq!(evaluate("2 + 3 * 4"), Some("14".to_string()));
        assert_eq!(evaluate("(2 + 3) * 4"), Some("20".to_string()));
        assert_eq!(evaluate("8 / 2 / 2"), Some("2".to_string()));
    }

    #[test]
    fn handles_decimals_and_negation() {
        assert_eq!(evaluate("1.5 + 1.5"), Some("3".to_string()));
        assert_eq!(evaluate("1 / 4"), Some("0.25".to_string()));
        assert_eq!(evaluate("-3 + 5"), Some("2".to_string()));
    }

    #[test]
    fn rejects_non_arithmetic_text() {
        assert_eq!(evaluate("What is the capital of France?"), None);
        assert_eq!(evaluate("2 + two"), None);
        assert_eq!(evaluate("ls; rm -rf /"), None);
        assert_eq!(evaluate(""), None);
        assert_eq!(evaluate("what is"), None);
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert_eq!(evaluate("2 +"), None);
        assert_eq!(evaluate("(2 + 3"), None);
        assert_eq!(evaluate("2 2"), None);
        assert_eq!(evaluate("1.2.3"), None);
        assert_eq!(evaluate("()"), None);
    }

    #[test]
    fn rejects_non_finite_results() {
        // IEEE-754 division by zero is infinite, not an answer.
        assert_eq!(evaluate("1 / 0"), None);
        assert_eq!(evaluate("0 / 0"), None);
    }
}
