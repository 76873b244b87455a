use super::functions::FUNCTIONS;
use super::lexer::{tokenize, Spanned, Token};
use super::{BinaryOp, Expr, ExprError, UnaryOp};
use crate::Value;

const TERNARY_BP: u8 = 1;
const PREFIX_BP: u8 = 8;

/// Deepest expression tree (and parser recursion) accepted.
pub(crate) const MAX_DEPTH: usize = 64;

pub(crate) fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        nesting: 0,
    };

    parser.eat(&Token::Return);
    let (expr, _) = parser.expression(0)?;
    parser.eat(&Token::Semicolon);
    parser.expect(&Token::Eof, "end of expression")?;
    Ok(expr)
}

/// A subtree and its depth.
type Parsed = (Expr, usize);

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    nesting: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos].pos
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].token.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn error(&self, message: String) -> ExprError {
        ExprError::Parse {
            pos: self.position(),
            message,
        }
    }

    /// Depth of a node over children of the given depths, rejected above
    /// [`MAX_DEPTH`] before the node is built.
    fn node_depth(&self, children: impl IntoIterator<Item = usize>) -> Result<usize, ExprError> {
        let depth = children.into_iter().max().unwrap_or(0) + 1;
        if depth > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".to_string()));
        }
        Ok(depth)
    }

    fn expression(&mut self, min_bp: u8) -> Result<Parsed, ExprError> {
        self.nesting += 1;
        if self.nesting > MAX_DEPTH {
            return Err(self.error("expression nested too deeply".to_string()));
        }
        let parsed = self.binding(min_bp);
        self.nesting -= 1;
        parsed
    }

    fn binding(&mut self, min_bp: u8) -> Result<Parsed, ExprError> {
        let (mut lhs, mut depth) = self.prefix()?;

        loop {
            let next = self.peek().clone();
            (lhs, depth) = match next {
                Token::Dot => {
                    self.advance();
                    let depth = self.node_depth([depth])?;
                    match self.advance() {
                        Token::Ident(name) => (Expr::Member(Box::new(lhs), name), depth),
                        Token::Number(n) if n.fract() == 0.0 && n >= 0.0 => {
                            let index = Expr::Literal(Value::Number(n));
                            (Expr::Index(Box::new(lhs), Box::new(index)), depth)
                        }
                        other => {
                            return Err(self.error(format!("expected field name, found {:?}", other)))
                        }
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let (index, index_depth) = self.expression(0)?;
                    self.expect(&Token::RBracket, "']'")?;
                    let depth = self.node_depth([depth, index_depth])?;
                    (Expr::Index(Box::new(lhs), Box::new(index)), depth)
                }
                Token::Question if min_bp <= TERNARY_BP => {
                    self.advance();
                    let (then, then_depth) = self.expression(0)?;
                    self.expect(&Token::Colon, "':' in conditional")?;
                    let (otherwise, else_depth) = self.expression(TERNARY_BP)?;
                    let depth = self.node_depth([depth, then_depth, else_depth])?;
                    (
                        Expr::Conditional(Box::new(lhs), Box::new(then), Box::new(otherwise)),
                        depth,
                    )
                }
                token => {
                    let Some((op, left_bp, right_bp)) = infix(&token) else {
                        break;
                    };
                    if left_bp < min_bp {
                        break;
                    }
                    self.advance();
                    let (rhs, rhs_depth) = self.expression(right_bp)?;
                    let depth = self.node_depth([depth, rhs_depth])?;
                    (Expr::Binary(op, Box::new(lhs), Box::new(rhs)), depth)
                }
            };
        }

        Ok((lhs, depth))
    }

    fn prefix(&mut self) -> Result<Parsed, ExprError> {
        let pos = self.position();
        match self.advance() {
            Token::Number(n) => Ok((Expr::Literal(Value::Number(n)), 1)),
            Token::Str(s) => Ok((Expr::Literal(Value::String(s)), 1)),
            Token::True => Ok((Expr::Literal(Value::Bool(true)), 1)),
            Token::False => Ok((Expr::Literal(Value::Bool(false)), 1)),
            Token::Null => Ok((Expr::Literal(Value::Null), 1)),
            Token::Minus => self.unary(UnaryOp::Neg),
            Token::Bang => self.unary(UnaryOp::Not),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let items = self.list(&Token::RBracket, |p| p.expression(0))?;
                let depth = self.node_depth(items.iter().map(|(_, d)| *d))?;
                Ok((Expr::Array(items.into_iter().map(|(e, _)| e).collect()), depth))
            }
            Token::LBrace => {
                let fields = self.list(&Token::RBrace, |p| p.object_field())?;
                let depth = self.node_depth(fields.iter().map(|(_, (_, d))| *d))?;
                let fields = fields.into_iter().map(|(k, (e, _))| (k, e)).collect();
                Ok((Expr::Object(fields), depth))
            }
            Token::Ident(name) => {
                if self.eat(&Token::LParen) {
                    if !FUNCTIONS.contains(&name.as_str()) {
                        return Err(ExprError::UnknownFunction(name));
                    }
                    let args = self.list(&Token::RParen, |p| p.expression(0))?;
                    let depth = self.node_depth(args.iter().map(|(_, d)| *d))?;
                    Ok((Expr::Call(name, args.into_iter().map(|(e, _)| e).collect()), depth))
                } else {
                    Ok((Expr::Variable(name), 1))
                }
            }
            other => Err(ExprError::Parse {
                pos,
                message: format!("unexpected {:?}", other),
            }),
        }
    }

    fn unary(&mut self, op: UnaryOp) -> Result<Parsed, ExprError> {
        let (operand, operand_depth) = self.expression(PREFIX_BP)?;
        let depth = self.node_depth([operand_depth])?;
        Ok((Expr::Unary(op, Box::new(operand)), depth))
    }

    fn object_field(&mut self) -> Result<(String, Parsed), ExprError> {
        let key = match self.advance() {
            Token::Ident(name) => name,
            Token::Str(s) => s,
            Token::Number(n) => Value::Number(n).to_display_string(),
            other => return Err(self.error(format!("expected object key, found {:?}", other))),
        };
        if self.eat(&Token::Colon) {
            Ok((key, self.expression(0)?))
        } else {
            // `{total}` is shorthand for `{total: total}`.
            Ok((key.clone(), (Expr::Variable(key), 1)))
        }
    }

    /// Comma-separated items up to `close`, allowing a trailing comma.
    fn list<T>(
        &mut self,
        close: &Token,
        mut item: impl FnMut(&mut Self) -> Result<T, ExprError>,
    ) -> Result<Vec<T>, ExprError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(item(self)?);
            if !self.eat(&Token::Comma) {
                self.expect(close, &format!("{:?}", close))?;
                break;
            }
        }
        Ok(items)
    }
}

fn infix(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let (op, bp) = match token {
        Token::OrOr => (BinaryOp::Or, 2),
        Token::AndAnd => (BinaryOp::And, 3),
        Token::EqEq => (BinaryOp::Eq, 4),
        Token::NotEq => (BinaryOp::NotEq, 4),
        Token::Lt => (BinaryOp::Lt, 5),
        Token::Le => (BinaryOp::Le, 5),
        Token::Gt => (BinaryOp::Gt, 5),
        Token::Ge => (BinaryOp::Ge, 5),
        Token::Plus => (BinaryOp::Add, 6),
        Token::Minus => (BinaryOp::Sub, 6),
        Token::Star => (BinaryOp::Mul, 7),
        Token::Slash => (BinaryOp::Div, 7),
        Token::Percent => (BinaryOp::Rem, 7),
        _ => return None,
    };
    Some((op, bp, bp + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Box<Expr> {
        Box::new(Expr::Literal(Value::Number(n)))
    }

    #[test]
    fn precedence_binds_multiplication_tighter() {
        assert_eq!(
            parse("1 + 2 * 3").unwrap(),
            Expr::Binary(
                BinaryOp::Add,
                num(1.0),
                Box::new(Expr::Binary(BinaryOp::Mul, num(2.0), num(3.0)))
            )
        );
    }

    #[test]
    fn parses_return_object() {
        assert_eq!(
            parse("return {v: 2+2};").unwrap(),
            Expr::Object(vec![(
                "v".to_string(),
                Expr::Binary(BinaryOp::Add, num(2.0), num(2.0))
            )])
        );
    }

    #[test]
    fn parses_member_index_and_calls() {
        let expr = parse("sum(pluck(items, 'views')) > stats.items[0].min ? 'up' : 'down'").unwrap();
        assert!(matches!(expr, Expr::Conditional(..)));
    }

    #[test]
    fn object_shorthand_reads_variable() {
        assert_eq!(
            parse("{total}").unwrap(),
            Expr::Object(vec![("total".to_string(), Expr::Variable("total".to_string()))])
        );
    }

    #[test]
    fn rejects_deep_nesting_without_recursing() {
        let parens = format!("{}1{}", "(".repeat(100_000), ")".repeat(100_000));
        assert!(matches!(parse(&parens), Err(ExprError::Parse { .. })));

        let chain = vec!["1"; 100_000].join(" + ");
        assert!(matches!(parse(&chain), Err(ExprError::Parse { .. })));

        let negations = format!("{}1", "-".repeat(100_000));
        assert!(parse(&negations).is_err());

        let members = format!("a{}", ".b".repeat(100_000));
        assert!(parse(&members).is_err());

        let nested = "(".repeat(MAX_DEPTH - 1) + "1" + &")".repeat(MAX_DEPTH - 1);
        assert!(parse(&nested).is_ok());
    }

    #[test]
    fn unknown_functions_fail_to_parse() {
        assert_eq!(
            parse("system('ls')"),
            Err(ExprError::UnknownFunction("system".to_string()))
        );
        assert!(parse("round(avg(xs), 2)").is_ok());
    }

    #[test]
    fn reports_trailing_garbage() {
        assert!(matches!(parse("1 2"), Err(ExprError::Parse { .. })));
        assert!(matches!(parse("(1 + 2"), Err(ExprError::Parse { .. })));
    }
}
