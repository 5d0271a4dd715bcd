use crate::{op_code::LocalIndex, scanner::Token};

const MAX_LOCAL_COUNT: usize = u8::MAX as usize + 1;

/// Keeps track of which stack slots are associated with which local
/// variables. A local's index in this table is exactly its slot on the VM's
/// operand stack, so entries are appended in declaration order and only ever
/// removed from the end.
pub struct Locals<'source> {
    locals: Vec<Local<'source>>,
    /// The number of blocks surrounding the current bit of code
    scope_depth: u32,
}

struct Local<'source> {
    name: Token<'source>,
    /// The scope depth of the block where the local variable was declared.
    /// None means declared but not defined, i.e. its initializer is still
    /// being compiled.
    depth: Option<u32>,
}

impl<'source> Locals<'source> {
    pub fn new() -> Self {
        Self {
            locals: Vec::with_capacity(MAX_LOCAL_COUNT),
            scope_depth: 0,
        }
    }

    pub fn begin_scope(&mut self) {
        self.scope_depth += 1;
    }

    pub fn end_scope(&mut self) {
        self.scope_depth -= 1;
    }

    /// Is the current scope a non-global scope?
    pub fn is_local_scope(&self) -> bool {
        self.scope_depth > 0
    }

    pub fn add(&mut self, name: Token<'source>) -> Result<(), &'static str> {
        if self.locals.len() == MAX_LOCAL_COUNT {
            return Err("Too many local variables declared in function.");
        }

        // Only "declare" for now; the depth is filled in once the
        // initializer has been compiled
        self.locals.push(Local { name, depth: None });

        Ok(())
    }

    pub fn mark_initialized(&mut self) {
        debug_assert!(self.is_local_scope());

        // Now "define"
        if let Some(local) = self.locals.last_mut() {
            local.depth = Some(self.scope_depth);
        }
    }

    /// Walk the table from the newest entry backward; the first name match
    /// wins. `None` means the identifier must be a global.
    pub fn resolve(&self, name: Token) -> Result<Option<LocalIndex>, &'static str> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if name.lexeme == local.name.lexeme {
                return if local.depth.is_some() {
                    Ok(Some(i as LocalIndex))
                } else {
                    Err("Can't read local variable in its own initializer.")
                };
            }
        }
        Ok(None)
    }

    /// Search for a variable with the same name in the current scope
    pub fn is_already_in_scope(&self, name: Token) -> bool {
        for local in self.locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < self.scope_depth {
                    break;
                }
            }

            if name.lexeme == local.name.lexeme {
                return true;
            }
        }
        false
    }

    /// Does the newest local belong to the scope that is about to close?
    pub fn has_local_in_scope(&self) -> bool {
        if let Some(depth) = self.locals.last().and_then(|local| local.depth) {
            depth >= self.scope_depth
        } else {
            false
        }
    }

    pub fn pop(&mut self) {
        self.locals.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::TokenType;

    fn ident(lexeme: &str) -> Token {
        Token {
            token_type: TokenType::Identifier,
            lexeme,
            line: 1,
        }
    }

    #[test]
    fn resolves_newest_shadowing_entry() {
        let mut locals = Locals::new();
        locals.begin_scope();
        locals.add(ident("a")).unwrap();
        locals.mark_initialized();
        locals.begin_scope();
        locals.add(ident("a")).unwrap();
        locals.mark_initialized();

        assert_eq!(locals.resolve(ident("a")), Ok(Some(1)));
        assert_eq!(locals.resolve(ident("b")), Ok(None));
    }

    #[test]
    fn uninitialized_local_is_unreadable() {
        let mut locals = Locals::new();
        locals.begin_scope();
        locals.add(ident("a")).unwrap();

        assert!(locals.resolve(ident("a")).is_err());

        locals.mark_initialized();
        assert_eq!(locals.resolve(ident("a")), Ok(Some(0)));
    }

    #[test]
    fn same_scope_redeclaration_is_detected() {
        let mut locals = Locals::new();
        locals.begin_scope();
        locals.add(ident("a")).unwrap();
        locals.mark_initialized();

        assert!(locals.is_already_in_scope(ident("a")));

        locals.begin_scope();
        assert!(!locals.is_already_in_scope(ident("a")));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut locals = Locals::new();
        locals.begin_scope();
        for _ in 0..256 {
            locals.add(ident("x")).unwrap();
            locals.mark_initialized();
        }
        assert!(locals.add(ident("x")).is_err());
    }
}
