use crate::scanner::{Scanner, Token, TokenType};

/// Sliding two-token window over the scanner, plus the error state shared by
/// everything the compiler reports.
pub struct Parser<'source> {
    scanner: Scanner<'source>,
    pub current: Token<'source>,
    pub previous: Token<'source>,
    pub had_error: bool,
    pub panic_mode: bool,
}

impl<'source> Parser<'source> {
    pub fn new(source: &'source str) -> Self {
        Self {
            scanner: Scanner::new(source),
            current: Token::none(),
            previous: Token::none(),
            had_error: false,
            panic_mode: false,
        }
    }

    pub fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }

            // Error tokens carry their message as the lexeme
            self.error_at_current(self.current.lexeme);
        }
    }

    pub fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    pub fn advance_matching(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }
        self.advance();
        true
    }

    pub fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    /// Skip tokens until something that looks like a statement boundary,
    /// leaving panic mode
    pub fn synchronize(&mut self) {
        self.panic_mode = false;

        while !matches!(self.current.token_type, TokenType::Eof) {
            if matches!(self.previous.token_type, TokenType::Semicolon) {
                return;
            }
            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => {
                    // Do nothing
                }
            }

            self.advance();
        }
    }

    pub fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message)
    }

    pub fn error(&mut self, message: &str) {
        self.error_at(self.previous, message)
    }

    fn error_at(&mut self, token: Token, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        eprint!("[line {}] Error", token.line);

        match token.token_type {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => {
                // Nothing
            }
            _ => eprint!(" at '{}'", token.lexeme),
        }

        eprintln!(": {}", message);
        self.had_error = true;
    }
}
