//! Token stream -> AST.
//!
//! A straightforward recursive-descent parser: statement-level dispatch in
//! `parse_body`/`parse_tag`, expression-level precedence climbing in
//! `parse_assignment_expr`/`parse_ternary`/`parse_binary`/`parse_unary`/
//! `parse_postfix`/`parse_primary`. Call-signature resolution against the
//! entity registry is deferred entirely to serialize time (see
//! `DESIGN.md`): this entry point's signature is fixed by the resolver,
//! which parses freshly fetched dependencies without a registry in hand,
//! so every `Parameter::Function`/`Syntax::Block` built here carries
//! `CallResolution::Dynamic` and an unvalidated call shape.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ParseError;
use crate::expr::{CallOperand, CallResolution, Expression, FunctionCall, Parameter, Tuple};
use crate::lexer;
use crate::operator::Operator;
use crate::syntax::{Ast, AstKey, BlockInstance, Info, ScopeRef, Syntax};
use crate::token::{Literal, ParamToken, Token, TokenKind};
use crate::value::{Dict, Value};
use crate::variable::{Keyword, Variable};

/// Parses `bytes` (the raw template source, named by `key.name` for
/// diagnostics) into a compiled `Ast`.
pub fn parse(bytes: &[u8], key: &AstKey) -> Result<Ast, ParseError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| ParseError::new(format!("template is not valid UTF-8: {e}"), None))?;
    let tokens = lexer::lex(text, &key.name, '#')?;
    let mut parser = Parser { tokens: &tokens, pos: 0, tables: vec![Vec::new()] };
    let root = parser.parse_body(&[])?;
    parser.tables[0] = root;

    let mut info = Info::default();
    for table in &parser.tables {
        for node in table {
            collect_node_info(node, &mut info);
        }
    }

    Ok(Ast {
        key: key.clone(),
        tables: parser.tables,
        inlined_raw: ahash::AHashMap::new(),
        info,
    })
}

fn collect_node_info(node: &Syntax, info: &mut Info) {
    match node {
        Syntax::Raw(_) => {}
        Syntax::Passthrough(p) => p.collect_required_variables(&mut info.required_variables),
        Syntax::Expr(e) => e.collect_required_variables(&mut info.required_variables),
        Syntax::Block(b) => {
            if let Some(params) = &b.params {
                for el in &params.elements {
                    el.collect_required_variables(&mut info.required_variables);
                }
            }
        }
        Syntax::InlineTemplate { name, .. } => {
            info.required_asts.insert(name.clone());
        }
        Syntax::InlineRaw { name, .. } => {
            info.required_raw.insert(name.clone());
        }
        Syntax::ForLoop { iterable, .. } => {
            iterable.collect_required_variables(&mut info.required_variables);
        }
        Syntax::Define { expr, .. } => {
            if let Some(e) = expr {
                e.collect_required_variables(&mut info.required_variables);
            }
        }
        Syntax::Evaluate { default, .. } => {
            if let Some(d) = default {
                d.collect_required_variables(&mut info.required_variables);
            }
        }
        Syntax::RawBlock { .. } => {}
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    tables: Vec<Vec<Syntax>>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<&TokenKind> {
        self.peek().map(|t| &t.kind)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.peek().map(|t| t.loc.clone()))
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        match self.advance() {
            Some(t) if t.kind == kind => Ok(()),
            Some(t) => Err(ParseError::at(format!("expected {kind:?}, found {:?}", t.kind), t.loc)),
            None => Err(self.err(format!("expected {kind:?}, found end of template"))),
        }
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.peek_kind() == Some(&kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn eat_operator(&mut self, op: Operator) -> bool {
        let matched = matches!(self.peek_kind(), Some(TokenKind::Parameter(ParamToken::Operator(o))) if *o == op);
        if matched {
            self.advance();
        }
        matched
    }

    fn expect_operator(&mut self, op: Operator) -> Result<(), ParseError> {
        if self.eat_operator(op) {
            Ok(())
        } else {
            Err(self.err(format!("expected `{op}`")))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> Result<(), ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Parameter(ParamToken::Keyword(k)), .. }) if k == kw => Ok(()),
            Some(t) => Err(ParseError::at(format!("expected keyword `{kw}`"), t.loc)),
            None => Err(self.err(format!("expected keyword `{kw}`, found end of template"))),
        }
    }

    fn expect_plain_identifier(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Parameter(ParamToken::VariablePart(s)), .. }) => Ok(s),
            Some(t) => Err(ParseError::at("expected an identifier", t.loc)),
            None => Err(self.err("expected an identifier, found end of template")),
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek_kind() == Some(&TokenKind::Whitespace) {
            self.advance();
        }
    }

    fn peek_is_tag_named(&self, name: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token { kind: TokenKind::TagStart, .. }))
            && matches!(
                self.tokens.get(self.pos + 1),
                Some(Token { kind: TokenKind::TagName(Some(n)), .. }) if n == name
            )
    }

    fn expect_closer(&mut self, name: &str) -> Result<(), ParseError> {
        self.expect(TokenKind::TagStart)?;
        match self.advance() {
            Some(Token { kind: TokenKind::TagName(Some(n)), .. }) if n == name => Ok(()),
            Some(t) => Err(ParseError::at(format!("expected closing `#{name}`, found `#{}`", describe_tag_name(&t)), t.loc)),
            None => Err(self.err(format!("expected closing `#{name}`, found end of template"))),
        }
    }

    fn push_table(&mut self, table: Vec<Syntax>) -> usize {
        self.tables.push(table);
        self.tables.len() - 1
    }

    fn take_tag_name(&mut self) -> Result<Option<String>, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::TagName(n), .. }) => Ok(n),
            Some(t) => Err(ParseError::at("expected tag name", t.loc)),
            None => Err(self.err("expected tag name, found end of template")),
        }
    }

    /// Parses a sequence of statements until EOF (`stop_names` empty) or a
    /// tag whose name is in `stop_names` is seen; that tag's `TagStart` is
    /// left unconsumed so the caller can decide how to handle it (consume
    /// it as a true closer, or re-enter the loop to parse it as a sibling
    /// chain continuation).
    fn parse_body(&mut self, stop_names: &[String]) -> Result<Vec<Syntax>, ParseError> {
        let mut nodes = Vec::new();
        loop {
            match self.peek_kind() {
                None => {
                    if stop_names.is_empty() {
                        break;
                    }
                    return Err(self.err(format!(
                        "unexpected end of template, expected one of: {}",
                        stop_names.join(", ")
                    )));
                }
                Some(TokenKind::Raw(_)) => {
                    let Some(Token { kind: TokenKind::Raw(s), .. }) = self.advance() else { unreachable!() };
                    nodes.push(Syntax::Raw(s));
                }
                Some(TokenKind::Whitespace) => {
                    self.advance();
                }
                Some(TokenKind::TagStart) => {
                    let save = self.pos;
                    self.advance();
                    let name_opt = self.take_tag_name()?;
                    if let Some(name) = &name_opt {
                        if stop_names.iter().any(|s| s == name) {
                            self.pos = save;
                            return Ok(nodes);
                        }
                    }
                    let prev = nodes.last();
                    if let Some(node) = self.parse_tag(name_opt, prev)? {
                        nodes.push(node);
                    }
                }
                other => return Err(self.err(format!("unexpected token at statement position: {other:?}"))),
            }
        }
        Ok(nodes)
    }

    fn parse_tag(&mut self, name: Option<String>, prev: Option<&Syntax>) -> Result<Option<Syntax>, ParseError> {
        let Some(name) = name else {
            // anonymous expression tag: #(expr)
            self.expect(TokenKind::ParamsStart)?;
            let expr = self.parse_assignment_expr()?;
            self.expect(TokenKind::ParamsEnd)?;
            return Ok(Some(Syntax::Passthrough(expr)));
        };

        match name.as_str() {
            "define" => self.parse_define(),
            "evaluate" => self.parse_evaluate(),
            "inline" => self.parse_inline(),
            "var" => self.parse_declaration(Keyword::Var),
            "let" => self.parse_declaration(Keyword::Let),
            "raw" => self.parse_raw_block(),
            "for" => self.parse_for_loop(),
            n if n.starts_with("end") => Err(self.err(format!("unmatched closing tag `#{n}`"))),
            _ => self.parse_generic_tag(name, prev),
        }
    }

    fn parse_declaration(&mut self, keyword: Keyword) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let target = Variable::new(vec![self.expect_plain_identifier()?]);
        let value = if self.eat_operator(Operator::Assign) {
            Some(self.parse_assignment_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::ParamsEnd)?;
        Ok(Some(Syntax::Expr(Expression::Declaration { keyword, target, value })))
    }

    fn parse_define(&mut self) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let id = self.expect_plain_identifier()?;
        let expr = if self.eat_operator(Operator::Assign) {
            Some(self.parse_assignment_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::ParamsEnd)?;
        let scope = if self.eat(TokenKind::BlockStart) {
            let body = self.parse_body(&["enddefine".to_string()])?;
            self.expect_closer("enddefine")?;
            ScopeRef::Table(self.push_table(body))
        } else {
            ScopeRef::Nil
        };
        Ok(Some(Syntax::Define { id, scope, expr }))
    }

    fn parse_evaluate(&mut self) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let id = self.expect_plain_identifier()?;
        let default = if self.eat_operator(Operator::NilCoalesce) {
            Some(self.parse_assignment_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::ParamsEnd)?;
        Ok(Some(Syntax::Evaluate { id, default }))
    }

    fn parse_inline(&mut self) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let name_param = self.parse_assignment_expr()?;
        let name = match &name_param {
            Parameter::Value(Value::String(s)) => s.to_string(),
            _ => return Err(self.err("#inline's target must be a string literal")),
        };
        self.expect(TokenKind::ParamDelim)?;
        self.skip_whitespace();
        let label = self.expect_plain_identifier()?;
        if label != "as" {
            return Err(self.err("expected an `as:` label in #inline"));
        }
        self.expect(TokenKind::LabelMark)?;
        self.skip_whitespace();
        let as_param = self.parse_assignment_expr()?;
        self.expect(TokenKind::ParamsEnd)?;

        match as_param {
            Parameter::Keyword(Keyword::Template) => Ok(Some(Syntax::InlineTemplate { name, scope: ScopeRef::Nil })),
            Parameter::Variable(v) if v.is_atomic() => Ok(Some(Syntax::InlineRaw {
                name,
                handler: v.ancestor().to_owned(),
                embedded: false,
            })),
            _ => Err(self.err("#inline's `as:` value must be `template` or a handler name")),
        }
    }

    fn parse_raw_block(&mut self) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let handler = self.expect_plain_identifier()?;
        self.expect(TokenKind::ParamsEnd)?;
        self.expect(TokenKind::BlockStart)?;
        let body = self.parse_body(&["endraw".to_string()])?;
        self.expect_closer("endraw")?;
        let idx = self.push_table(body);
        Ok(Some(Syntax::RawBlock { handler, scope: ScopeRef::Table(idx) }))
    }

    fn parse_for_loop(&mut self) -> Result<Option<Syntax>, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let binding = self.expect_plain_identifier()?;
        self.expect_keyword(Keyword::In)?;
        let iterable = self.parse_assignment_expr()?;
        self.expect(TokenKind::ParamsEnd)?;
        self.expect(TokenKind::BlockStart)?;
        let body = self.parse_body(&["endfor".to_string()])?;
        self.expect_closer("endfor")?;
        let idx = self.push_table(body);
        Ok(Some(Syntax::ForLoop { binding, iterable, scope: ScopeRef::Table(idx) }))
    }

    fn parse_generic_tag(&mut self, name: String, prev: Option<&Syntax>) -> Result<Option<Syntax>, ParseError> {
        let params = if self.peek_kind() == Some(&TokenKind::ParamsStart) {
            Some(self.parse_tuple()?)
        } else {
            None
        };

        if self.eat(TokenKind::BlockStart) {
            let is_chain = matches!(name.as_str(), "elseif" | "else");
            if is_chain {
                let ok = matches!(
                    prev,
                    Some(Syntax::Block(b)) if matches!(b.name.as_str(), "if" | "elseif")
                );
                if !ok {
                    return Err(self.err(format!("`{name}` must directly follow an `if` or `elseif` block")));
                }
            }
            let closer = closer_for(&name);
            let mut stop = vec![closer.clone()];
            if matches!(name.as_str(), "if" | "elseif" | "else") {
                stop.push("elseif".to_string());
                stop.push("else".to_string());
            }
            let body = self.parse_body(&stop)?;
            if self.peek_is_tag_named(&closer) {
                self.expect_closer(&closer)?;
            }
            let idx = self.push_table(body);
            Ok(Some(Syntax::Block(BlockInstance {
                name,
                target: None,
                params,
                scope: ScopeRef::Table(idx),
                atomic_body: None,
            })))
        } else {
            let call = FunctionCall {
                name: Arc::from(name.as_str()),
                args: params.unwrap_or_default(),
                operand: CallOperand::Free,
                resolved: CallResolution::Dynamic,
            };
            Ok(Some(Syntax::Passthrough(Parameter::Function(Box::new(call)))))
        }
    }

    // -- expression grammar ----------------------------------------------

    fn parse_tuple(&mut self) -> Result<Tuple, ParseError> {
        self.expect(TokenKind::ParamsStart)?;
        let mut tuple = Tuple::new();
        self.skip_whitespace();
        if self.peek_kind() == Some(&TokenKind::ParamsEnd) {
            self.advance();
            return Ok(tuple);
        }
        loop {
            self.skip_whitespace();
            if let Some(label) = self.try_take_label() {
                let value = self.parse_assignment_expr()?;
                tuple.push_labeled(label, value);
            } else {
                let value = self.parse_assignment_expr()?;
                tuple.push_positional(value);
            }
            self.skip_whitespace();
            match self.peek_kind() {
                Some(TokenKind::ParamDelim) => {
                    self.advance();
                }
                Some(TokenKind::ParamsEnd) => {
                    self.advance();
                    break;
                }
                other => return Err(self.err(format!("expected `,` or `)`, found {other:?}"))),
            }
        }
        Ok(tuple)
    }

    fn try_take_label(&mut self) -> Option<String> {
        if let (
            Some(Token { kind: TokenKind::Parameter(ParamToken::VariablePart(name)), .. }),
            Some(Token { kind: TokenKind::LabelMark, .. }),
        ) = (self.tokens.get(self.pos), self.tokens.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            Some(name)
        } else {
            None
        }
    }

    fn parse_assignment_expr(&mut self) -> Result<Parameter, ParseError> {
        self.skip_whitespace();
        let left = self.parse_ternary()?;
        self.skip_whitespace();
        if let Some(op) = self.peek_assignment_operator() {
            let Parameter::Variable(target) = left else {
                return Err(self.err("assignment target must be a variable"));
            };
            self.advance();
            let value = self.parse_assignment_expr()?;
            return Ok(Parameter::Expression(Box::new(Expression::Assignment { target, op, value })));
        }
        Ok(left)
    }

    fn peek_assignment_operator(&self) -> Option<Operator> {
        match self.peek_kind() {
            Some(TokenKind::Parameter(ParamToken::Operator(op))) if op.is_assignment() => Some(*op),
            _ => None,
        }
    }

    fn parse_ternary(&mut self) -> Result<Parameter, ParseError> {
        let condition = self.parse_binary(0)?;
        self.skip_whitespace();
        if self.eat_operator(Operator::Question) {
            self.skip_whitespace();
            let then = self.parse_ternary()?;
            self.skip_whitespace();
            self.expect_operator(Operator::Colon)?;
            self.skip_whitespace();
            let otherwise = self.parse_ternary()?;
            return Ok(Parameter::Expression(Box::new(Expression::Ternary { condition, then, otherwise })));
        }
        Ok(condition)
    }

    fn parse_binary(&mut self, min_prec: u8) -> Result<Parameter, ParseError> {
        let mut left = self.parse_unary()?;
        loop {
            self.skip_whitespace();
            let Some(op) = self.peek_infix_operator() else { break };
            let prec = op.precedence();
            if prec == 0 || prec < min_prec {
                break;
            }
            self.advance();
            if op == Operator::NilCoalesce {
                left = match left {
                    Parameter::Variable(v) => Parameter::Variable(v.coalesced()),
                    other => other,
                };
            }
            self.skip_whitespace();
            let right = self.parse_binary(prec + 1)?;
            left = Parameter::Expression(Box::new(Expression::Infix { left, op, right }));
        }
        Ok(left)
    }

    fn peek_infix_operator(&self) -> Option<Operator> {
        match self.peek_kind() {
            Some(TokenKind::Parameter(ParamToken::Operator(op)))
                if matches!(
                    op,
                    Operator::Add
                        | Operator::Sub
                        | Operator::Mul
                        | Operator::Div
                        | Operator::Mod
                        | Operator::Lt
                        | Operator::Lte
                        | Operator::Gt
                        | Operator::Gte
                        | Operator::Eq
                        | Operator::NotEq
                        | Operator::And
                        | Operator::Or
                        | Operator::Xor
                        | Operator::NilCoalesce
                ) =>
            {
                Some(*op)
            }
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<Parameter, ParseError> {
        self.skip_whitespace();
        if self.eat_operator(Operator::Not) {
            let operand = self.parse_unary()?;
            return Ok(Parameter::Expression(Box::new(Expression::Prefix { op: Operator::Not, operand })));
        }
        if self.eat_operator(Operator::Sub) {
            let operand = self.parse_unary()?;
            // `-x` rewrites to `x * -1` rather than carrying a distinct
            // negation node.
            return Ok(Parameter::Expression(Box::new(Expression::Infix {
                left: operand,
                op: Operator::Mul,
                right: Parameter::Value(Value::Int(-1)),
            })));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Parameter, ParseError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek_kind() {
                Some(TokenKind::Parameter(ParamToken::Operator(Operator::Dot))) => {
                    self.advance();
                    expr = self.parse_dot_access(expr)?;
                }
                Some(TokenKind::Parameter(ParamToken::Operator(Operator::LBracket))) => {
                    self.advance();
                    let index = self.parse_assignment_expr()?;
                    self.expect_operator(Operator::RBracket)?;
                    expr = Parameter::Expression(Box::new(Expression::Infix {
                        left: expr,
                        op: Operator::Subscript,
                        right: index,
                    }));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_dot_access(&mut self, receiver: Parameter) -> Result<Parameter, ParseError> {
        match self.advance() {
            Some(Token { kind: TokenKind::Parameter(ParamToken::VariablePart(part)), .. }) => match receiver {
                Parameter::Variable(v) => {
                    let mut parts = v.parts().to_vec();
                    parts.push(part);
                    Ok(Parameter::Variable(Variable::new(parts)))
                }
                _ => Err(self.err(format!("cannot access field `{part}` on a non-variable expression"))),
            },
            Some(Token { kind: TokenKind::Parameter(ParamToken::FunctionIdent(name)), .. }) => {
                let args = self.parse_tuple()?;
                let operand = match &receiver {
                    Parameter::Variable(v) => CallOperand::MutatingMethod(v.clone()),
                    _ => CallOperand::Method(Box::new(receiver)),
                };
                Ok(Parameter::Function(Box::new(FunctionCall {
                    name: Arc::from(name.as_str()),
                    args,
                    operand,
                    resolved: CallResolution::Dynamic,
                })))
            }
            Some(t) => Err(ParseError::at("expected a field name or method call after `.`", t.loc)),
            None => Err(self.err("expected a field name or method call after `.`, found end of template")),
        }
    }

    fn parse_primary(&mut self) -> Result<Parameter, ParseError> {
        self.skip_whitespace();
        match self.peek_kind() {
            Some(TokenKind::Parameter(ParamToken::Operator(Operator::Dollar))) => {
                self.advance();
                let scope = self.expect_plain_identifier()?;
                // Further `.path` segments and method calls are picked up by
                // `parse_postfix`'s `parse_dot_access`, same as a bare variable.
                Ok(Parameter::Variable(Variable::new(vec![scope]).contextualized()))
            }
            Some(TokenKind::Parameter(ParamToken::Literal(_))) => {
                let Some(Token { kind: TokenKind::Parameter(ParamToken::Literal(lit)), .. }) = self.advance() else {
                    unreachable!()
                };
                Ok(Parameter::Value(literal_to_value(lit)))
            }
            Some(TokenKind::Parameter(ParamToken::Keyword(kw))) => {
                let kw = *kw;
                if kw.is_variable_declaration() {
                    return Err(self.err(format!("`{kw}` is not valid at expression position")));
                }
                self.advance();
                Ok(Parameter::Keyword(kw))
            }
            Some(TokenKind::Parameter(ParamToken::VariablePart(_))) => {
                let name = self.expect_plain_identifier()?;
                Ok(Parameter::Variable(Variable::new(vec![name])))
            }
            Some(TokenKind::Parameter(ParamToken::FunctionIdent(_))) => {
                let Some(Token { kind: TokenKind::Parameter(ParamToken::FunctionIdent(name)), .. }) = self.advance()
                else {
                    unreachable!()
                };
                let args = self.parse_tuple()?;
                Ok(Parameter::Function(Box::new(FunctionCall {
                    name: Arc::from(name.as_str()),
                    args,
                    operand: CallOperand::Free,
                    resolved: CallResolution::Dynamic,
                })))
            }
            Some(TokenKind::ParamsStart) => {
                self.advance();
                let inner = self.parse_assignment_expr()?;
                self.skip_whitespace();
                self.expect(TokenKind::ParamsEnd)?;
                Ok(inner)
            }
            Some(TokenKind::Parameter(ParamToken::Operator(Operator::LBracket))) => self.parse_collection_literal(),
            other => Err(self.err(format!("unexpected token in expression: {other:?}"))),
        }
    }

    fn parse_collection_literal(&mut self) -> Result<Parameter, ParseError> {
        self.expect_operator(Operator::LBracket)?;
        let mut tuple = Tuple::new();
        tuple.collection = true;
        self.skip_whitespace();
        loop {
            self.skip_whitespace();
            if let Some(label) = self.try_take_label() {
                let value = self.parse_assignment_expr()?;
                tuple.push_labeled(label, value);
            } else {
                let value = self.parse_assignment_expr()?;
                tuple.push_positional(value);
            }
            self.skip_whitespace();
            match self.peek_kind() {
                Some(TokenKind::ParamDelim) => {
                    self.advance();
                }
                Some(TokenKind::Parameter(ParamToken::Operator(Operator::RBracket))) => {
                    self.advance();
                    break;
                }
                other => return Err(self.err(format!("expected `,` or `]` in collection literal, found {other:?}"))),
            }
        }
        match tuple.to_literal_value() {
            Some(v) => Ok(Parameter::Value(v)),
            None => Ok(Parameter::Tuple(Box::new(tuple))),
        }
    }
}

fn closer_for(name: &str) -> String {
    match name {
        "elseif" | "else" => "endif".to_string(),
        other => format!("end{other}"),
    }
}

fn literal_to_value(lit: Literal) -> Value {
    match lit {
        Literal::Int(i) => Value::Int(i),
        Literal::Double(d) => Value::Double(d),
        Literal::Str(s) => Value::string(s),
        Literal::EmptyArray => Value::array(Vec::new()),
        Literal::EmptyDict => Value::dictionary(Dict::default()),
    }
}

fn describe_tag_name(t: &Token) -> String {
    match &t.kind {
        TokenKind::TagName(Some(n)) => n.clone(),
        TokenKind::TagName(None) => "(anonymous)".to_string(),
        other => format!("{other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(src: &str) -> Ast {
        parse(src.as_bytes(), &AstKey::new("mem", "t")).unwrap()
    }

    #[test]
    fn raw_text_round_trips() {
        let ast = parse_str("hello world");
        assert!(matches!(&ast.root()[0], Syntax::Raw(s) if s == "hello world"));
    }

    #[test]
    fn anonymous_expression_tag_builds_variable_path() {
        let ast = parse_str("#(todo.title)");
        let Syntax::Passthrough(Parameter::Variable(v)) = &ast.root()[0] else { panic!("{:?}", ast.root()) };
        assert_eq!(v.parts(), &["todo".to_string(), "title".to_string()]);
    }

    #[test]
    fn if_else_chain_parses_as_sibling_blocks() {
        let ast = parse_str("#if(a): yes #else: no #endif");
        assert_eq!(ast.root().len(), 2);
        assert!(matches!(&ast.root()[0], Syntax::Block(b) if b.name == "if"));
        assert!(matches!(&ast.root()[1], Syntax::Block(b) if b.name == "else"));
    }

    #[test]
    fn else_without_antecedent_if_is_rejected() {
        assert!(parse("#else: no #endif".as_bytes(), &AstKey::new("mem", "t")).is_err());
    }

    #[test]
    fn for_loop_captures_binding_and_iterable() {
        let ast = parse_str("#for(item in items): #(item) #endfor");
        let Syntax::ForLoop { binding, iterable, .. } = &ast.root()[0] else { panic!("{:?}", ast.root()) };
        assert_eq!(binding, "item");
        assert!(matches!(iterable, Parameter::Variable(v) if v.ancestor() == "items"));
    }

    #[test]
    fn inline_template_directive_is_recognized() {
        let ast = parse_str(r#"#inline("header", as: template)"#);
        assert!(matches!(&ast.root()[0], Syntax::InlineTemplate { name, .. } if name == "header"));
        assert!(ast.info.required_asts.contains("header"));
    }

    #[test]
    fn inline_raw_directive_captures_handler_name() {
        let ast = parse_str(r#"#inline("logo.png", as: bytes)"#);
        assert!(matches!(&ast.root()[0], Syntax::InlineRaw { name, handler, .. } if name == "logo.png" && handler == "bytes"));
    }

    #[test]
    fn var_and_let_decay_to_declaration_expressions() {
        let ast = parse_str("#var(x = 1)#let(y)");
        assert!(matches!(
            &ast.root()[0],
            Syntax::Expr(Expression::Declaration { keyword: Keyword::Var, value: Some(_), .. })
        ));
        assert!(matches!(
            &ast.root()[1],
            Syntax::Expr(Expression::Declaration { keyword: Keyword::Let, value: None, .. })
        ));
    }

    #[test]
    fn define_and_evaluate_round_trip() {
        let ast = parse_str("#define(greeting = \"hi\")#evaluate(greeting ?? \"default\")");
        assert!(matches!(&ast.root()[0], Syntax::Define { id, expr: Some(_), .. } if id == "greeting"));
        assert!(matches!(&ast.root()[1], Syntax::Evaluate { id, default: Some(_), .. } if id == "greeting"));
    }

    #[test]
    fn binary_precedence_groups_multiplication_before_addition() {
        let ast = parse_str("#(1 + 2 * 3)");
        let Syntax::Passthrough(Parameter::Expression(e)) = &ast.root()[0] else { panic!() };
        let Expression::Infix { left, op: Operator::Add, right } = e.as_ref() else { panic!() };
        assert!(matches!(left, Parameter::Value(Value::Int(1))));
        assert!(matches!(right, Parameter::Expression(_)));
    }

    #[test]
    fn ternary_parses_nested_branches() {
        let ast = parse_str("#(a ? 1 : 2)");
        assert!(matches!(
            &ast.root()[0],
            Syntax::Passthrough(Parameter::Expression(e)) if matches!(e.as_ref(), Expression::Ternary { .. })
        ));
    }

    #[test]
    fn subscript_without_whitespace_builds_subscript_expression() {
        let ast = parse_str("#(a[0])");
        let Syntax::Passthrough(Parameter::Expression(e)) = &ast.root()[0] else { panic!() };
        assert!(matches!(e.as_ref(), Expression::Infix { op: Operator::Subscript, .. }));
    }

    #[test]
    fn mutating_method_call_captures_receiver_variable() {
        let ast = parse_str("#(list.append(1))");
        let Syntax::Passthrough(Parameter::Function(call)) = &ast.root()[0] else { panic!() };
        assert!(matches!(&call.operand, CallOperand::MutatingMethod(v) if v.ancestor() == "list"));
    }

    #[test]
    fn prefix_minus_rewrites_to_multiplication_by_negative_one() {
        let ast = parse_str("#(-x)");
        let Syntax::Passthrough(Parameter::Expression(e)) = &ast.root()[0] else { panic!() };
        assert!(matches!(e.as_ref(), Expression::Infix { op: Operator::Mul, right: Parameter::Value(Value::Int(-1)), .. }));
    }

    #[test]
    fn required_variables_surfaced_from_passthrough() {
        let ast = parse_str("#(a + b)");
        assert!(ast.info.required_variables.contains("a"));
        assert!(ast.info.required_variables.contains("b"));
    }

    #[test]
    fn nested_block_body_lives_in_its_own_table() {
        let ast = parse_str("#if(a): #if(b): x #endif #endif");
        assert_eq!(ast.tables.len(), 3);
    }

    #[test]
    fn dollar_prefixed_variable_is_contextualized() {
        let ast = parse_str("#($api.status)");
        let Syntax::Passthrough(Parameter::Variable(v)) = &ast.root()[0] else { panic!("{:?}", ast.root()) };
        assert!(v.contextualized);
        assert_eq!(v.parts(), &["api".to_string(), "status".to_string()]);
    }
}
