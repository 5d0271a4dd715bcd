use std::{
    collections::HashMap,
    io::{self, Stdout, Write},
    rc::Rc,
};

use crate::{
    chunk::Chunk,
    compiler,
    error::{FiddleError, Result},
    op_code::OpCode,
    stack::Stack,
    value::Value,
};

const STACK_MAX: usize = 256;

pub type ValueStack = Stack<Value, STACK_MAX>;

/// The virtual machine. Globals and the operand stack survive across
/// `interpret` calls, which is what lets a REPL accumulate state. `Out` is
/// where `print` writes; tests swap in a buffer.
pub struct Vm<Out: Write = Stdout> {
    stack: ValueStack,
    globals: HashMap<Rc<str>, Value>,
    /// Index of the next byte to execute in the current chunk
    ip: usize,
    out: Out,
}

impl Vm {
    pub fn new() -> Vm {
        Vm::with_output(io::stdout())
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl<Out: Write> Vm<Out> {
    pub fn with_output(out: Out) -> Vm<Out> {
        Vm {
            stack: Stack::new(),
            globals: HashMap::new(),
            ip: 0,
            out,
        }
    }

    pub fn output(&self) -> &Out {
        &self.out
    }

    pub fn interpret(&mut self, source: &str) -> Result<()> {
        let chunk = compiler::compile(source)?;
        self.ip = 0;
        self.run(&chunk)
    }

    // Returning an error from this function (including ?) halts execution
    fn run(&mut self, chunk: &Chunk) -> Result<()> {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            {
                print!("        ");
                println!("{:?}", self.stack);
                crate::disassembler::disassemble_instruction(chunk, self.ip);
            }

            let byte = self.read_byte(chunk);
            let instruction = match OpCode::try_from(byte) {
                Ok(instruction) => instruction,
                // The compiler never emits anything else
                Err(_) => unreachable!("unknown opcode {}", byte),
            };

            match instruction {
                OpCode::Constant => {
                    let constant = self.read_constant(chunk);
                    self.stack.push(constant);
                }
                OpCode::Nil => self.stack.push(Value::Nil),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string(chunk);
                    let value = self.stack.peek(0).clone();
                    // Redefinition silently overwrites
                    self.globals.insert(name, value);
                    self.stack.pop();
                }
                OpCode::GetGlobal => {
                    let name = self.read_string(chunk);
                    match self.globals.get(&name).cloned() {
                        Some(value) => self.stack.push(value),
                        None => {
                            self.runtime_error(
                                chunk,
                                &format!("Undefined variable '{}'.", name),
                            )?;
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let name = self.read_string(chunk);
                    // Assignment is an expression, so the value stays on the
                    // stack; it also never creates a new global
                    let value = self.stack.peek(0).clone();
                    if let Some(slot) = self.globals.get_mut(&name) {
                        *slot = value;
                    } else {
                        self.runtime_error(
                            chunk,
                            &format!("Undefined variable '{}'.", name),
                        )?;
                    }
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte(chunk) as usize;
                    let value = self.stack.read(slot).clone();
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte(chunk) as usize;
                    let value = self.stack.peek(0).clone();
                    self.stack.set(slot, value);
                }
                OpCode::Equal => {
                    let b = self.stack.pop();
                    let a = self.stack.pop();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_op(chunk, |a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_op(chunk, |a, b| Value::Bool(a < b))?,
                OpCode::Add => match (self.stack.peek(1), self.stack.peek(0)) {
                    (Value::Number(a), Value::Number(b)) => {
                        let result = Value::Number(a + b);
                        self.stack.pop();
                        self.stack.pop();
                        self.stack.push(result);
                    }
                    (Value::String(a), Value::String(b)) => {
                        let result = Value::String(format!("{}{}", a, b).into());
                        self.stack.pop();
                        self.stack.pop();
                        self.stack.push(result);
                    }
                    _ => {
                        self.runtime_error(chunk, "Operands must be two numbers or two strings.")?;
                    }
                },
                OpCode::Subtract => self.binary_op(chunk, |a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_op(chunk, |a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_op(chunk, |a, b| Value::Number(a / b))?,
                OpCode::Negate => {
                    if let Value::Number(value) = self.stack.peek(0) {
                        let value = -value;
                        self.stack.pop();
                        self.stack.push(Value::Number(value));
                    } else {
                        self.runtime_error(chunk, "Operand must be a number.")?;
                    }
                }
                OpCode::Not => {
                    let value = self.stack.pop();
                    self.stack.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Print => {
                    let value = self.stack.pop();
                    writeln!(self.out, "{}", value).ok();
                }
                OpCode::Return => {
                    // Exit interpreter
                    return Ok(());
                }
            }
        }
    }

    /// Both operands must be numbers; they are only popped once that holds.
    /// Top of stack is the right-hand operand.
    fn binary_op(&mut self, chunk: &Chunk, op: impl Fn(f64, f64) -> Value) -> Result<()> {
        match (self.stack.peek(1), self.stack.peek(0)) {
            (Value::Number(a), Value::Number(b)) => {
                let (a, b) = (*a, *b);
                self.stack.pop();
                self.stack.pop();
                self.stack.push(op(a, b));
                Ok(())
            }
            _ => self.runtime_error(chunk, "Operands must be numbers."),
        }
    }

    fn read_byte(&mut self, chunk: &Chunk) -> u8 {
        let byte = chunk.code[self.ip];
        self.ip += 1;
        byte
    }

    fn read_constant(&mut self, chunk: &Chunk) -> Value {
        let index = self.read_byte(chunk) as usize;
        chunk.constants[index].clone()
    }

    fn read_string(&mut self, chunk: &Chunk) -> Rc<str> {
        match self.read_constant(chunk) {
            Value::String(name) => name,
            _ => unreachable!(),
        }
    }

    fn runtime_error(&mut self, chunk: &Chunk, message: &str) -> Result<()> {
        eprintln!("{}", message);
        eprintln!("[line {}] in script", chunk.lines[self.ip - 1]);
        self.stack.truncate(0);
        Err(FiddleError::Runtime)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Result<()>, String) {
        let mut vm = Vm::with_output(Vec::new());
        let result = vm.interpret(source);
        let output = String::from_utf8(vm.out.clone()).unwrap();
        (result, output)
    }

    fn run_ok(source: &str) -> String {
        let (result, output) = run(source);
        assert_eq!(result, Ok(()));
        output
    }

    #[test]
    fn arithmetic_respects_precedence() {
        assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
        assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
        assert_eq!(run_ok("print 10 - 4 - 3;"), "3\n");
        assert_eq!(run_ok("print -(1 + 2);"), "-3\n");
        assert_eq!(run_ok("print 7 / 2;"), "3.5\n");
    }

    #[test]
    fn strings_concatenate_left_to_right() {
        assert_eq!(run_ok("print \"hi\" + \" \" + \"there\";"), "hi there\n");
        assert_eq!(run_ok("print \"\" + \"x\";"), "x\n");
    }

    #[test]
    fn comparisons_and_derived_operators() {
        assert_eq!(run_ok("print 1 < 2;"), "true\n");
        assert_eq!(run_ok("print 1 > 2;"), "false\n");
        assert_eq!(run_ok("print 2 <= 2;"), "true\n");
        assert_eq!(run_ok("print 3 >= 4;"), "false\n");
        assert_eq!(run_ok("print 1 != 2;"), "true\n");
    }

    #[test]
    fn equality_spans_kinds_without_error() {
        assert_eq!(run_ok("print 1 == \"1\";"), "false\n");
        assert_eq!(run_ok("print nil == false;"), "false\n");
        assert_eq!(run_ok("print nil == nil;"), "true\n");
        assert_eq!(run_ok("print \"a\" == \"a\";"), "true\n");
    }

    #[test]
    fn not_follows_truthiness() {
        assert_eq!(
            run_ok("print !nil; print !false; print !0; print !\"\"; print !true;"),
            "true\ntrue\nfalse\nfalse\nfalse\n"
        );
    }

    #[test]
    fn uninitialized_global_defaults_to_nil() {
        assert_eq!(run_ok("var x; print x;"), "nil\n");
    }

    #[test]
    fn global_redefinition_overwrites() {
        assert_eq!(run_ok("var a = 1; var a = 2; print a;"), "2\n");
    }

    #[test]
    fn assignment_is_an_expression() {
        assert_eq!(run_ok("var a = 1; print a = 3; print a;"), "3\n3\n");
        assert_eq!(run_ok("var a; var b; a = b = 2; print a + b;"), "4\n");
    }

    #[test]
    fn locals_shadow_by_scope() {
        assert_eq!(
            run_ok("var a = 10; { var a = 11; print a; } print a;"),
            "11\n10\n"
        );
        // A different name may read the outer binding from the initializer
        assert_eq!(
            run_ok("var a = 10; { var b = a + 1; print b; } print a;"),
            "11\n10\n"
        );
    }

    #[test]
    fn block_locals_share_the_stack() {
        assert_eq!(run_ok("{ var a = 1; var b = 2; print a + b; }"), "3\n");
        assert_eq!(
            run_ok("{ var a = 1; { var b = a + 1; print b; } print a; }"),
            "2\n1\n"
        );
    }

    #[test]
    fn local_assignment_writes_through_its_slot() {
        assert_eq!(
            run_ok("{ var a = 1; a = a + 5; print a; print a = 0; }"),
            "6\n0\n"
        );
    }

    #[test]
    fn negating_a_non_number_fails() {
        let (result, output) = run("print -\"a\";");
        assert_eq!(result, Err(FiddleError::Runtime));
        assert_eq!(output, "");
    }

    #[test]
    fn mixed_addition_fails() {
        let (result, _) = run("print \"a\" + 1;");
        assert_eq!(result, Err(FiddleError::Runtime));
        let (result, _) = run("print 1 + \"a\";");
        assert_eq!(result, Err(FiddleError::Runtime));
    }

    #[test]
    fn mixed_comparison_fails() {
        let (result, _) = run("print 1 < \"2\";");
        assert_eq!(result, Err(FiddleError::Runtime));
    }

    #[test]
    fn undefined_variable_get_and_set_fail() {
        let (result, _) = run("print unknown;");
        assert_eq!(result, Err(FiddleError::Runtime));

        // Assignment does not create a global
        let (result, _) = run("unknown = 1;");
        assert_eq!(result, Err(FiddleError::Runtime));
    }

    #[test]
    fn state_persists_across_interpret_calls() {
        let mut vm = Vm::with_output(Vec::new());
        assert_eq!(vm.interpret("var a = 1;"), Ok(()));
        assert_eq!(vm.interpret("a = a + 1;"), Ok(()));
        assert_eq!(vm.interpret("print a;"), Ok(()));
        assert_eq!(String::from_utf8(vm.out.clone()).unwrap(), "2\n");
    }

    #[test]
    fn stack_resets_after_a_runtime_error() {
        let mut vm = Vm::with_output(Vec::new());
        assert_eq!(vm.interpret("1 + \"a\";"), Err(FiddleError::Runtime));
        assert_eq!(vm.stack.len(), 0);
        assert_eq!(vm.interpret("print 1;"), Ok(()));
        assert_eq!(String::from_utf8(vm.out.clone()).unwrap(), "1\n");
    }

    #[test]
    fn compile_errors_reach_the_caller() {
        let (result, output) = run("var a = ;");
        assert_eq!(result, Err(FiddleError::Compile));
        assert_eq!(output, "");
    }
}
