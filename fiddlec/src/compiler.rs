use std::rc::Rc;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use strum::EnumCount;

use crate::{
    chunk::Chunk,
    error::{FiddleError, Result},
    locals::Locals,
    op_code::{Constant, OpCode},
    parser::Parser,
    scanner::{Token, TokenType},
    value::Value,
};

/// Translate source text to a chunk in a single forward pass. On a compile
/// error the rest of the program is still parsed (synchronizing at statement
/// boundaries) so every diagnostic is reported, but the chunk is discarded.
pub fn compile(source: &str) -> Result<Chunk> {
    let mut compiler = Compiler::new(source);

    compiler.parser.advance();
    while !compiler.parser.advance_matching(TokenType::Eof) {
        compiler.declaration();
    }
    compiler.end();

    if compiler.parser.had_error {
        Err(FiddleError::Compile)
    } else {
        Ok(compiler.chunk)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        Precedence::try_from(u8::from(self) + 1).unwrap_or(Precedence::Primary)
    }
}

/// Parse handlers are plain tags dispatched by `Compiler::parse_fn`, which
/// keeps the rule table a compile-time constant.
#[derive(Clone, Copy)]
enum ParseFn {
    Grouping,
    Unary,
    Binary,
    Number,
    String,
    Variable,
    Literal,
}

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

const fn rule(
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
) -> ParseRule {
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

/// One row per token type, in TokenType declaration order
const RULES: [ParseRule; TokenType::COUNT] = [
    rule(Some(ParseFn::Grouping), None, Precedence::None), // LeftParen
    rule(None, None, Precedence::None),                    // RightParen
    rule(None, None, Precedence::None),                    // LeftBrace
    rule(None, None, Precedence::None),                    // RightBrace
    rule(None, None, Precedence::None),                    // Comma
    rule(None, None, Precedence::None),                    // Dot
    rule(Some(ParseFn::Unary), Some(ParseFn::Binary), Precedence::Term), // Minus
    rule(None, Some(ParseFn::Binary), Precedence::Term),   // Plus
    rule(None, None, Precedence::None),                    // Semicolon
    rule(None, Some(ParseFn::Binary), Precedence::Factor), // Slash
    rule(None, Some(ParseFn::Binary), Precedence::Factor), // Star
    rule(Some(ParseFn::Unary), None, Precedence::None),    // Bang
    rule(None, Some(ParseFn::Binary), Precedence::Equality), // BangEqual
    rule(None, None, Precedence::None),                    // Equal
    rule(None, Some(ParseFn::Binary), Precedence::Equality), // EqualEqual
    rule(None, Some(ParseFn::Binary), Precedence::Comparison), // Greater
    rule(None, Some(ParseFn::Binary), Precedence::Comparison), // GreaterEqual
    rule(None, Some(ParseFn::Binary), Precedence::Comparison), // Less
    rule(None, Some(ParseFn::Binary), Precedence::Comparison), // LessEqual
    rule(Some(ParseFn::Variable), None, Precedence::None), // Identifier
    rule(Some(ParseFn::String), None, Precedence::None),   // String
    rule(Some(ParseFn::Number), None, Precedence::None),   // Number
    rule(None, None, Precedence::None),                    // And
    rule(None, None, Precedence::None),                    // Class
    rule(None, None, Precedence::None),                    // Else
    rule(Some(ParseFn::Literal), None, Precedence::None),  // False
    rule(None, None, Precedence::None),                    // For
    rule(None, None, Precedence::None),                    // Fun
    rule(None, None, Precedence::None),                    // If
    rule(Some(ParseFn::Literal), None, Precedence::None),  // Nil
    rule(None, None, Precedence::None),                    // Or
    rule(None, None, Precedence::None),                    // Print
    rule(None, None, Precedence::None),                    // Return
    rule(None, None, Precedence::None),                    // Super
    rule(None, None, Precedence::None),                    // This
    rule(Some(ParseFn::Literal), None, Precedence::None),  // True
    rule(None, None, Precedence::None),                    // Var
    rule(None, None, Precedence::None),                    // While
    rule(None, None, Precedence::None),                    // Error
    rule(None, None, Precedence::None),                    // Eof
];

fn get_rule(token_type: TokenType) -> ParseRule {
    RULES[u8::from(token_type) as usize]
}

struct Compiler<'source> {
    parser: Parser<'source>,
    locals: Locals<'source>,
    chunk: Chunk,
}

impl<'source> Compiler<'source> {
    fn new(source: &'source str) -> Compiler<'source> {
        Self {
            parser: Parser::new(source),
            locals: Locals::new(),
            chunk: Chunk::new(),
        }
    }

    fn end(&mut self) {
        self.emit(OpCode::Return);

        #[cfg(feature = "debug_print_code")]
        if !self.parser.had_error {
            crate::disassembler::disassemble(&self.chunk, "code");
        }
    }

    // Declarations and statements

    fn declaration(&mut self) {
        if self.parser.advance_matching(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.parser.advance_matching(TokenType::Equal) {
            self.expression();
        } else {
            // Uninitialized declarations implicitly init to nil
            self.emit(OpCode::Nil);
        }

        self.parser
            .consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.parser.advance_matching(TokenType::Print) {
            self.print_statement();
        } else if self.parser.advance_matching(TokenType::LeftBrace) {
            self.locals.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::Semicolon, "Expected ';' after value.");
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    fn block(&mut self) {
        while !self.parser.check(TokenType::RightBrace) && !self.parser.check(TokenType::Eof) {
            self.declaration();
        }

        self.parser
            .consume(TokenType::RightBrace, "Expect '}': no matching token found.");
    }

    fn end_scope(&mut self) {
        // Discard the closing block's locals, newest first
        while self.locals.has_local_in_scope() {
            self.emit(OpCode::Pop);
            self.locals.pop();
        }
        self.locals.end_scope();
    }

    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.parser.advance();

        let Some(prefix) = get_rule(self.parser.previous.token_type).prefix else {
            self.parser.error("Expected expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        self.parse_fn(prefix, can_assign);

        while precedence <= get_rule(self.parser.current.token_type).precedence {
            self.parser.advance();
            if let Some(infix) = get_rule(self.parser.previous.token_type).infix {
                self.parse_fn(infix, can_assign);
            }
        }

        // A leftover '=' here means the target to its left wasn't assignable
        if can_assign && self.parser.advance_matching(TokenType::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn parse_fn(&mut self, function: ParseFn, can_assign: bool) {
        match function {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Number => self.number(),
            ParseFn::String => self.string(),
            ParseFn::Variable => self.variable(can_assign),
            ParseFn::Literal => self.literal(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.parser
            .consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap();
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        // Strip the surrounding quotes; the chunk must own its copy
        let lexeme = self.parser.previous.lexeme;
        let string = &lexeme[1..lexeme.len() - 1];
        self.emit_constant(Value::String(Rc::from(string)));
    }

    fn literal(&mut self) {
        match self.parser.previous.token_type {
            TokenType::False => self.emit(OpCode::False),
            TokenType::Nil => self.emit(OpCode::Nil),
            TokenType::True => self.emit(OpCode::True),
            _ => unreachable!(),
        }
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.token_type;

        // Compile the operand
        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenType::Minus => self.emit(OpCode::Negate),
            TokenType::Bang => self.emit(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let operator = self.parser.previous.token_type;

        // One level above our own precedence makes the operator
        // left-associative
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next());

        match operator {
            TokenType::Plus => self.emit(OpCode::Add),
            TokenType::Minus => self.emit(OpCode::Subtract),
            TokenType::Star => self.emit(OpCode::Multiply),
            TokenType::Slash => self.emit(OpCode::Divide),
            TokenType::EqualEqual => self.emit(OpCode::Equal),
            TokenType::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenType::Greater => self.emit(OpCode::Greater),
            TokenType::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenType::Less => self.emit(OpCode::Less),
            TokenType::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(can_assign);
    }

    fn named_variable(&mut self, can_assign: bool) {
        let name = self.parser.previous;

        let (get_op, set_op, slot) = match self.locals.resolve(name) {
            Ok(Some(slot)) => (OpCode::GetLocal, OpCode::SetLocal, slot),
            Ok(None) => {
                let constant = self.identifier_constant(name);
                (OpCode::GetGlobal, OpCode::SetGlobal, constant.slot)
            }
            Err(message) => {
                self.parser.error(message);
                return;
            }
        };

        if can_assign && self.parser.advance_matching(TokenType::Equal) {
            self.expression();
            self.emit(set_op);
            self.emit(slot);
        } else {
            self.emit(get_op);
            self.emit(slot);
        }
    }

    // Variable plumbing

    fn parse_variable(&mut self, message: &str) -> Option<Constant> {
        self.parser.consume(TokenType::Identifier, message);

        self.declare_variable();

        // At runtime, locals aren't looked up by name; there's no need to
        // put the name into the constant pool
        if self.locals.is_local_scope() {
            None
        } else {
            Some(self.identifier_constant(self.parser.previous))
        }
    }

    fn declare_variable(&mut self) {
        // Globals may be redefined freely
        if !self.locals.is_local_scope() {
            return;
        }

        let name = self.parser.previous;
        if self.locals.is_already_in_scope(name) {
            self.parser
                .error("Re-definition of an existing variable in this scope.");
        }

        if let Err(message) = self.locals.add(name) {
            self.parser.error(message);
        }
    }

    fn define_variable(&mut self, global: Option<Constant>) {
        if let Some(constant) = global {
            self.emit(OpCode::DefineGlobal);
            self.emit(constant.slot);
        } else {
            // A local's definition is simply its initializer value staying
            // on the stack; no instruction needed
            self.locals.mark_initialized();
        }
    }

    fn identifier_constant(&mut self, name: Token<'source>) -> Constant {
        self.make_constant(Value::String(Rc::from(name.lexeme)))
    }

    // Emit helpers

    fn emit(&mut self, byte: impl Into<u8>) {
        self.chunk.write(byte.into(), self.parser.previous.line);
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit(OpCode::Constant);
        self.emit(constant.slot);
    }

    fn make_constant(&mut self, value: Value) -> Constant {
        let index = self.chunk.add_constant(value);
        match u8::try_from(index) {
            Ok(slot) => Constant { slot },
            Err(_) => {
                self.parser.error("Too many constants in one chunk");
                Constant { slot: 0 }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    fn compile_ok(source: &str) -> Chunk {
        compile(source).expect("expected a clean compile")
    }

    fn code(chunk: &Chunk) -> &[u8] {
        &chunk.code
    }

    #[test]
    fn rule_table_covers_every_token() {
        for token_type in TokenType::iter() {
            let rule = get_rule(token_type);
            // Rows without an infix handler must not bind
            if rule.infix.is_none() {
                assert_eq!(rule.precedence, Precedence::None, "{:?}", token_type);
            }
        }
    }

    #[test]
    fn line_map_covers_every_byte() {
        for source in [
            "",
            "print 1 + 2 * 3;",
            "var a = 1;\nvar b = a;\n{ var c = b; print c; }",
            "print \"multi\nline\";",
        ] {
            let chunk = compile_ok(source);
            assert_eq!(chunk.code.len(), chunk.lines.len());
        }
    }

    #[test]
    fn expression_statement_bytecode() {
        let chunk = compile_ok("1 + 2;");
        assert_eq!(
            code(&chunk),
            [
                OpCode::Constant.into(),
                0,
                OpCode::Constant.into(),
                1,
                OpCode::Add.into(),
                OpCode::Pop.into(),
                OpCode::Return.into(),
            ]
        );
        assert_eq!(chunk.constants, [Value::Number(1.0), Value::Number(2.0)]);
    }

    #[test]
    fn local_slots_match_declaration_order() {
        let chunk = compile_ok("{ var a = 1; var b = 2; print a + b; }");
        assert_eq!(
            code(&chunk),
            [
                OpCode::Constant.into(),
                0,
                OpCode::Constant.into(),
                1,
                OpCode::GetLocal.into(),
                0,
                OpCode::GetLocal.into(),
                1,
                OpCode::Add.into(),
                OpCode::Print.into(),
                OpCode::Pop.into(),
                OpCode::Pop.into(),
                OpCode::Return.into(),
            ]
        );
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let chunk = compile_ok("print 1 + 2 * 3;");
        assert_eq!(
            code(&chunk),
            [
                OpCode::Constant.into(),
                0,
                OpCode::Constant.into(),
                1,
                OpCode::Constant.into(),
                2,
                OpCode::Multiply.into(),
                OpCode::Add.into(),
                OpCode::Print.into(),
                OpCode::Return.into(),
            ]
        );
    }

    #[test]
    fn derived_comparisons_append_not() {
        let chunk = compile_ok("1 <= 2;");
        assert_eq!(
            code(&chunk),
            [
                OpCode::Constant.into(),
                0,
                OpCode::Constant.into(),
                1,
                OpCode::Greater.into(),
                OpCode::Not.into(),
                OpCode::Pop.into(),
                OpCode::Return.into(),
            ]
        );
    }

    #[test]
    fn too_many_constants_in_one_chunk() {
        let source: String = (0..=256).map(|i| format!("print {};", i)).collect();
        assert_eq!(compile(&source), Err(FiddleError::Compile));

        let source: String = (0..256).map(|i| format!("print {};", i)).collect();
        assert!(compile(&source).is_ok());
    }

    #[test]
    fn too_many_locals_in_one_block() {
        let declarations: String = (0..=256).map(|i| format!("var v{};", i)).collect();
        let source = format!("{{ {} }}", declarations);
        assert_eq!(compile(&source), Err(FiddleError::Compile));

        let declarations: String = (0..256).map(|i| format!("var v{};", i)).collect();
        let source = format!("{{ {} }}", declarations);
        assert!(compile(&source).is_ok());
    }

    #[test]
    fn local_cannot_read_itself_in_initializer() {
        assert_eq!(compile("{ var a = a; }"), Err(FiddleError::Compile));
        // Even with an outer binding of the same name: the fresh local wins
        // the backward walk while still uninitialized
        assert_eq!(
            compile("var a = 10; { var a = a + 1; }"),
            Err(FiddleError::Compile)
        );
    }

    #[test]
    fn shadowing_is_legal_across_scopes_only() {
        assert!(compile("var a = 1; { var a = 2; }").is_ok());
        assert!(compile("{ var a = 1; { var a = 2; } }").is_ok());
        assert_eq!(
            compile("{ var a = 1; var a = 2; }"),
            Err(FiddleError::Compile)
        );
    }

    #[test]
    fn global_redefinition_is_legal() {
        assert!(compile("var a = 1; var a = 2;").is_ok());
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(compile("1 + 2 = 3;"), Err(FiddleError::Compile));
        assert_eq!(compile("a * b = 1;"), Err(FiddleError::Compile));
    }

    #[test]
    fn statements_require_semicolons() {
        assert_eq!(compile("1 + 2"), Err(FiddleError::Compile));
        assert_eq!(compile("var a = ;"), Err(FiddleError::Compile));
    }

    #[test]
    fn error_recovery_reaches_later_statements() {
        // The second statement is still parsed after synchronization; its
        // own error must surface, not get swallowed by panic mode
        assert_eq!(compile("var a = ;\nvar b = ;"), Err(FiddleError::Compile));
        // A valid program after an invalid statement still fails overall
        assert_eq!(compile("var a = ;\nprint 1;"), Err(FiddleError::Compile));
    }

    #[test]
    fn an_empty_program_compiles_to_a_bare_return() {
        let chunk = compile_ok("");
        assert_eq!(code(&chunk), [OpCode::Return.into()]);
    }
}
