//! Literal syntax understood by the mock runtime.
//!
//! `None`, `True`, `False`, integers, floats, single- or double-quoted
//! strings with backslash escapes, and `[...]` lists of those.

use manyrpc::Value;

pub fn parse(source: &str) -> Result<Value, String> {
    let mut parser = Parser { src: source, pos: 0 };
    let value = parser.value()?;
    parser.skip_ws();
    match parser.peek() {
        None => Ok(value),
        Some(c) => Err(format!("unexpected {:?} at offset {}", c, parser.pos)),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(&f) {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn value(&mut self) -> Result<Value, String> {
        self.skip_ws();
        match self.peek() {
            Some('[') => self.list(),
            Some(q @ ('"' | '\'')) => self.string(q),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_alphabetic() => {
                let word = self.take_while(char::is_alphanumeric);
                match word {
                    "None" => Ok(Value::None),
                    "True" => Ok(Value::Bool(true)),
                    "False" => Ok(Value::Bool(false)),
                    other => Err(format!("name {:?} is not defined", other)),
                }
            }
            Some(c) => Err(format!("unexpected {:?} at offset {}", c, self.pos)),
            None => Err("unexpected end of input".into()),
        }
    }

    fn number(&mut self) -> Result<Value, String> {
        let text = self.take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '.'));
        if text.contains(['.', 'e', 'E']) {
            text.parse::<f64>().map(Value::Float).map_err(|e| format!("{:?}: {}", text, e))
        } else {
            text.parse::<i64>().map(Value::Int).map_err(|e| format!("{:?}: {}", text, e))
        }
    }

    fn string(&mut self, quote: char) -> Result<Value, String> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(Value::Str(out)),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err("unterminated string".into())
    }

    fn list(&mut self) -> Result<Value, String> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => {}
                Some(']') => return Ok(Value::List(items)),
                Some(c) => return Err(format!("expected ',' or ']', found {:?}", c)),
                None => return Err("unterminated list".into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(parse("None"), Ok(Value::None));
        assert_eq!(parse(" True "), Ok(Value::Bool(true)));
        assert_eq!(parse("-42"), Ok(Value::Int(-42)));
        assert_eq!(parse("2.5"), Ok(Value::Float(2.5)));
        assert_eq!(parse(r#""a\"b""#), Ok(Value::Str("a\"b".into())));
        assert_eq!(parse("'single'"), Ok(Value::Str("single".into())));
    }

    #[test]
    fn test_nested_lists() {
        let value = parse("[1, [\"x\", None], [],]").expect("parse");
        assert_eq!(
            value,
            Value::List(vec![
                Value::Int(1),
                Value::List(vec![Value::Str("x".into()), Value::None]),
                Value::List(vec![]),
            ])
        );
    }

    #[test]
    fn test_rejects_junk() {
        assert!(parse("[1, 2").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("undefined_name").is_err());
        assert!(parse("\"open").is_err());
    }
}
