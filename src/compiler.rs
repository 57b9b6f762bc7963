//! Single-pass compiler: source text to function objects.
//!
//! The parser pulls tokens and emits instructions as it goes; there is no
//! separate AST. Expressions compile by precedence climbing, and every
//! operator becomes a signature call on its receiver, so `a + b` is exactly
//! `a.+(b)`. Locals live in stack slots tracked by the compiler; module
//! variables resolve to dense indexes in the owning module, with forward
//! references declared as placeholders and checked when the module body ends.
//!
//! Nested functions form a compiler stack. Upvalue resolution walks outward,
//! flagging captured locals so scope exit closes them instead of popping.

use itertools::Itertools;

use crate::heap::Handle;
use crate::lexer::{Lexer, SpannedToken, Token};
use crate::opcodes::Op;
use crate::value::{FnObj, StrObj, UpvalueSpec, Value};
use crate::vm::{ErrorKind, Vm};

const MAX_LOCALS: usize = 255;
const MAX_UPVALUES: usize = 255;
const MAX_PARAMETERS: usize = 16;
const MAX_FIELDS: usize = 255;
const MAX_MODULE_VARS: usize = u16::MAX as usize;

/// Operator precedence, lowest binds loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    Lowest,
    Assignment,  // =
    Conditional, // ?:
    LogicalOr,   // ||
    LogicalAnd,  // &&
    Equality,    // == !=
    Is,          // is
    Comparison,  // < > <= >=
    BitwiseOr,   // |
    BitwiseXor,  // ^
    BitwiseAnd,  // &
    Shift,       // << >>
    Range,       // .. ...
    Term,        // + -
    Factor,      // * / %
    Unary,       // ! ~ -
    Call,        // . [] ()
}

impl Prec {
    fn one_higher(self) -> Prec {
        match self {
            Prec::Lowest => Prec::Assignment,
            Prec::Assignment => Prec::Conditional,
            Prec::Conditional => Prec::LogicalOr,
            Prec::LogicalOr => Prec::LogicalAnd,
            Prec::LogicalAnd => Prec::Equality,
            Prec::Equality => Prec::Is,
            Prec::Is => Prec::Comparison,
            Prec::Comparison => Prec::BitwiseOr,
            Prec::BitwiseOr => Prec::BitwiseXor,
            Prec::BitwiseXor => Prec::BitwiseAnd,
            Prec::BitwiseAnd => Prec::Shift,
            Prec::Shift => Prec::Range,
            Prec::Range => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary => Prec::Call,
            Prec::Call => Prec::Call,
        }
    }
}

/// Where a resolved name lives.
#[derive(Debug, Clone, Copy)]
enum Variable {
    Local(u8),
    Upvalue(u8),
    Module(u16),
}

#[derive(Debug)]
struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
}

#[derive(Debug)]
struct LoopCtx {
    start: usize,
    scope_depth: i32,
    breaks: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Module,
    Function,
    Method,
    StaticMethod,
    Constructor,
}

/// State for the class body currently being compiled.
#[derive(Debug)]
struct ClassInfo {
    fields: Vec<String>,
    is_foreign: bool,
    in_static: bool,
    /// Base name of the method being compiled; `super` without an explicit
    /// name dispatches through it.
    method_name: Option<String>,
}

/// Per-function compilation state. Nested functions push a new one; the
/// parser owns the stack and links them by index.
struct Compiler {
    locals: Vec<Local>,
    upvalues: Vec<UpvalueSpec>,
    scope_depth: i32,
    code: Vec<Op>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    loops: Vec<LoopCtx>,
    arity: u8,
    kind: FnKind,
    name: String,
}

impl Compiler {
    fn new(kind: FnKind, name: String) -> Self {
        let receiver = Local {
            // Methods and constructors see the receiver as `this`; plain
            // functions keep the closure itself in slot zero, unnamed.
            name: if matches!(kind, FnKind::Function | FnKind::Module) {
                String::new()
            } else {
                "this".to_string()
            },
            depth: if kind == FnKind::Module { -1 } else { 0 },
            is_captured: false,
        };
        Compiler {
            locals: vec![receiver],
            upvalues: Vec::new(),
            scope_depth: if kind == FnKind::Module { -1 } else { 0 },
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            loops: Vec::new(),
            arity: 0,
            kind,
            name,
        }
    }
}

pub struct Parser<'vm> {
    vm: &'vm mut Vm,
    lexer: Lexer,
    module: Handle,
    module_name: String,
    previous: SpannedToken,
    current: SpannedToken,
    compilers: Vec<Compiler>,
    class_info: Option<ClassInfo>,
    /// Module variables declared implicitly by a forward reference:
    /// variable index -> line of first use.
    forward_uses: Vec<(u16, u32)>,
    had_error: bool,
}

/// Compile `source` as the body of `module`, returning the module function.
/// Errors are reported through the host error callback; `None` means at least
/// one was raised.
pub fn compile(vm: &mut Vm, module: Handle, source: &str) -> Option<Handle> {
    // Values held by in-flight compilers are invisible to the collector, so
    // collection is deferred until the compiled function is reachable.
    vm.heap.pause_collector();
    let result = Parser::run(vm, module, source);
    vm.heap.resume_collector();
    result
}

impl<'vm> Parser<'vm> {
    fn run(vm: &'vm mut Vm, module: Handle, source: &str) -> Option<Handle> {
        let module_name = vm
            .heap
            .module(module)
            .name
            .clone()
            .unwrap_or_else(|| "core".to_string());
        let start = SpannedToken {
            token: Token::Line,
            line: 1,
        };
        let mut parser = Parser {
            vm,
            lexer: Lexer::new(source),
            module,
            module_name,
            previous: start.clone(),
            current: start,
            compilers: vec![Compiler::new(FnKind::Module, "(script)".to_string())],
            class_info: None,
            forward_uses: Vec::new(),
            had_error: false,
        };
        parser.advance();

        loop {
            parser.match_lines();
            if parser.check(&Token::Eof) {
                break;
            }
            parser.definition();
            if !parser.check(&Token::Eof) {
                parser.consume_line("Expect newline after statement.");
            }
            if parser.had_error {
                break;
            }
        }

        parser.emit(Op::EndModule);
        parser.emit(Op::Return);

        // Forward references must have been defined somewhere in the module.
        for (index, line) in std::mem::take(&mut parser.forward_uses) {
            let value = parser.vm.heap.module(parser.module).variables[index as usize];
            if value.is_undefined() {
                let name = parser.vm.heap.module(parser.module).variable_names[index as usize]
                    .clone();
                parser.error_at(line, &format!("Variable '{}' is used but not defined.", name));
            }
        }

        let fun = parser.end_compiler();
        if parser.had_error {
            None
        } else {
            Some(fun)
        }
    }

    // ------------------------------------------------------------------
    // Token plumbing

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            match self.lexer.next_token() {
                Ok(token) => {
                    self.current = token;
                    return;
                }
                Err((line, message)) => {
                    self.error_at(line, &message);
                    // Skip the offending character and keep scanning.
                }
            }
        }
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(&self.current.token) == std::mem::discriminant(token)
    }

    fn match_token(&mut self, token: &Token) -> bool {
        if self.check(token) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, token: &Token, message: &str) {
        if !self.match_token(token) {
            self.error(message);
        }
    }

    /// Skip any run of newline tokens.
    fn match_lines(&mut self) -> bool {
        let mut any = false;
        while self.match_token(&Token::Line) {
            any = true;
        }
        any
    }

    fn consume_line(&mut self, message: &str) {
        if self.check(&Token::RightBrace) || self.check(&Token::Eof) {
            return;
        }
        if !self.match_lines() {
            self.error(message);
        }
    }

    fn expect_name(&mut self, message: &str) -> String {
        if let Token::Name(name) = &self.current.token {
            let name = name.clone();
            self.advance();
            name
        } else {
            self.error(message);
            String::new()
        }
    }

    fn error(&mut self, message: &str) {
        let line = self.current.line;
        self.error_at(line, message);
    }

    fn error_at(&mut self, line: u32, message: &str) {
        // Only the first error is reported; the parser does not resynchronize.
        if self.had_error {
            return;
        }
        self.had_error = true;
        let module = self.module_name.clone();
        self.vm
            .report_error(ErrorKind::Compile, Some(&module), line as i32, message);
    }

    // ------------------------------------------------------------------
    // Emission

    fn compiler(&mut self) -> &mut Compiler {
        self.compilers.last_mut().expect("compiler stack empty")
    }

    fn emit(&mut self, op: Op) {
        let line = self.previous.line;
        let compiler = self.compiler();
        compiler.code.push(op);
        compiler.lines.push(line);
    }

    /// Emit a forward jump with a dummy target; returns the index to patch.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit(op);
        self.compiler().code.len() - 1
    }

    fn patch_jump(&mut self, index: usize) {
        let target = self.compiler().code.len();
        let code = &mut self.compiler().code;
        code[index] = match code[index] {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
            Op::And(_) => Op::And(target),
            Op::Or(_) => Op::Or(target),
            other => unreachable!("patching non-jump {:?}", other),
        };
    }

    fn add_constant(&mut self, value: Value) -> u16 {
        let compiler = self.compiler();
        if compiler.constants.len() >= u16::MAX as usize {
            self.error("Too many constants in one function.");
            return 0;
        }
        compiler.constants.push(value);
        (compiler.constants.len() - 1) as u16
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.add_constant(value);
        self.emit(Op::Constant(index));
    }

    fn string_value(&mut self, text: &str) -> Value {
        Value::Obj(self.vm.alloc_string(StrObj::from_str(text)))
    }

    fn emit_string_constant(&mut self, text: &str) {
        let value = self.string_value(text);
        self.emit_constant(value);
    }

    fn signature_symbol(&mut self, signature: &str) -> u16 {
        self.vm.method_names.ensure(signature)
    }

    // ------------------------------------------------------------------
    // Scopes and variables

    fn push_scope(&mut self) {
        self.compiler().scope_depth += 1;
    }

    /// Leave a scope, popping (or closing) its locals.
    fn pop_scope(&mut self) {
        let depth = self.compiler().scope_depth;
        let popped = self.discard_locals(depth);
        let compiler = self.compiler();
        compiler
            .locals
            .truncate(compiler.locals.len() - popped);
        compiler.scope_depth -= 1;
    }

    /// Emit pops for locals at or above `depth` without forgetting them.
    /// Returns how many were discarded.
    fn discard_locals(&mut self, depth: i32) -> usize {
        let compiler = self.compiler();
        let mut count = 0;
        for local in compiler.locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            count += 1;
        }
        let captured: Vec<bool> = compiler
            .locals
            .iter()
            .rev()
            .take(count)
            .map(|l| l.is_captured)
            .collect();
        for is_captured in captured {
            if is_captured {
                self.emit(Op::CloseUpvalue);
            } else {
                self.emit(Op::Pop);
            }
        }
        count
    }

    fn add_local(&mut self, name: String) -> u8 {
        let compiler = self.compiler();
        if compiler.locals.len() >= MAX_LOCALS {
            self.error("Function has too many local variables.");
            return 0;
        }
        let depth = compiler.scope_depth;
        compiler.locals.push(Local {
            name,
            depth,
            is_captured: false,
        });
        (self.compiler().locals.len() - 1) as u8
    }

    /// Declare `name` in the current scope: a local inside a function or
    /// block, a module variable at the top level.
    fn declare_variable(&mut self, name: String) -> Variable {
        if self.compiler().scope_depth == -1 {
            let index = self.declare_module_variable(&name);
            return Variable::Module(index);
        }
        let depth = self.compiler().scope_depth;
        let duplicate = self
            .compiler()
            .locals
            .iter()
            .any(|l| l.depth == depth && l.name == name);
        if duplicate {
            self.error(&format!(
                "Variable '{}' is already declared in this scope.",
                name
            ));
        }
        Variable::Local(self.add_local(name))
    }

    fn declare_module_variable(&mut self, name: &str) -> u16 {
        let existing = self.vm.heap.module(self.module).find_variable(name);
        if let Some(index) = existing {
            let value = self.vm.heap.module(self.module).variables[index];
            if value.is_undefined() && self.forward_uses.iter().any(|(i, _)| *i as usize == index)
            {
                // A forward reference is being given its definition.
                self.forward_uses.retain(|(i, _)| *i as usize != index);
                return index as u16;
            }
            self.error(&format!("Module variable '{}' is already defined.", name));
            return index as u16;
        }
        self.new_module_variable(name)
    }

    fn new_module_variable(&mut self, name: &str) -> u16 {
        let module = self.vm.heap.module_mut(self.module);
        if module.variables.len() >= MAX_MODULE_VARS {
            self.error("Too many module variables.");
            return 0;
        }
        module.variables.push(Value::Undefined);
        module.variable_names.push(name.to_string());
        (module.variables.len() - 1) as u16
    }

    fn resolve_local(&self, compiler_index: usize, name: &str) -> Option<u8> {
        let compiler = &self.compilers[compiler_index];
        compiler
            .locals
            .iter()
            .rposition(|l| l.name == name)
            .map(|i| i as u8)
    }

    fn add_upvalue(&mut self, compiler_index: usize, spec: UpvalueSpec) -> u8 {
        let compiler = &mut self.compilers[compiler_index];
        for (i, existing) in compiler.upvalues.iter().enumerate() {
            if existing.is_local == spec.is_local && existing.index == spec.index {
                return i as u8;
            }
        }
        if compiler.upvalues.len() >= MAX_UPVALUES {
            self.error("Function captures too many variables.");
            return 0;
        }
        compiler.upvalues.push(spec);
        (self.compilers[compiler_index].upvalues.len() - 1) as u8
    }

    /// Find `name` in an enclosing function, threading an upvalue chain down
    /// to `compiler_index`.
    fn resolve_upvalue(&mut self, compiler_index: usize, name: &str) -> Option<u8> {
        if compiler_index == 0 {
            return None;
        }
        let parent = compiler_index - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.compilers[parent].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(
                compiler_index,
                UpvalueSpec {
                    is_local: true,
                    index: local,
                },
            ));
        }
        let outer = self.resolve_upvalue(parent, name)?;
        Some(self.add_upvalue(
            compiler_index,
            UpvalueSpec {
                is_local: false,
                index: outer,
            },
        ))
    }

    /// Resolve a name as a local or upvalue of the current function.
    fn resolve_non_module(&mut self, name: &str) -> Option<Variable> {
        let top = self.compilers.len() - 1;
        if let Some(local) = self.resolve_local(top, name) {
            return Some(Variable::Local(local));
        }
        self.resolve_upvalue(top, name).map(Variable::Upvalue)
    }

    fn load_variable(&mut self, variable: Variable) {
        match variable {
            Variable::Local(index) => self.emit(Op::LoadLocal(index)),
            Variable::Upvalue(index) => self.emit(Op::LoadUpvalue(index)),
            Variable::Module(index) => self.emit(Op::LoadModuleVar(index)),
        }
    }

    /// Load a variable the core module is guaranteed to define (new modules
    /// copy the core variables, so the name resolves everywhere).
    fn load_core_variable(&mut self, name: &str) {
        let index = match self.vm.heap.module(self.module).find_variable(name) {
            Some(index) => index as u16,
            None => {
                let index = self.new_module_variable(name);
                self.forward_uses.push((index, self.previous.line));
                index
            }
        };
        self.emit(Op::LoadModuleVar(index));
    }

    // ------------------------------------------------------------------
    // Expressions

    fn expression(&mut self) {
        self.parse_precedence(Prec::Lowest);
    }

    fn infix_precedence(token: &Token) -> Option<Prec> {
        Some(match token {
            Token::Question => Prec::Conditional,
            Token::PipePipe => Prec::LogicalOr,
            Token::AmpAmp => Prec::LogicalAnd,
            Token::EqEq | Token::BangEq => Prec::Equality,
            Token::KwIs => Prec::Is,
            Token::Lt | Token::Gt | Token::LtEq | Token::GtEq => Prec::Comparison,
            Token::Pipe => Prec::BitwiseOr,
            Token::Caret => Prec::BitwiseXor,
            Token::Amp => Prec::BitwiseAnd,
            Token::LtLt | Token::GtGt => Prec::Shift,
            Token::DotDot | Token::DotDotDot => Prec::Range,
            Token::Plus | Token::Minus | Token::Dollar => Prec::Term,
            Token::Star | Token::Slash | Token::Percent => Prec::Factor,
            Token::Dot | Token::LeftBracket => Prec::Call,
            _ => return None,
        })
    }

    fn parse_precedence(&mut self, precedence: Prec) {
        self.advance();
        let can_assign = precedence <= Prec::Conditional;
        self.prefix(can_assign);
        loop {
            let next = match Self::infix_precedence(&self.current.token) {
                Some(p) if precedence <= p => p,
                _ => break,
            };
            self.advance();
            self.infix(next, can_assign);
            if self.had_error {
                return;
            }
        }
    }

    fn prefix(&mut self, can_assign: bool) {
        match self.previous.token.clone() {
            Token::Number(n) => self.emit_constant(Value::Num(n)),
            Token::Str(bytes) => {
                let value = Value::Obj(self.vm.alloc_string(StrObj::new(bytes)));
                self.emit_constant(value);
            }
            Token::KwTrue => self.emit(Op::True),
            Token::KwFalse => self.emit(Op::False),
            Token::KwNull => self.emit(Op::Null),
            Token::Name(name) => self.bare_name(name, can_assign),
            Token::Field(name) => self.field(&name, can_assign),
            Token::KwThis => self.load_this(),
            Token::KwSuper => self.super_call(can_assign),
            Token::LeftParen => {
                self.match_lines();
                self.expression();
                self.match_lines();
                self.consume(&Token::RightParen, "Expect ')' after expression.");
            }
            Token::LeftBracket => self.list_literal(),
            Token::Bang => self.unary_op("!"),
            Token::Minus => self.unary_op("-"),
            Token::Tilde => self.unary_op("~"),
            other => {
                self.error(&format!("Expected expression, found '{}'.", other));
            }
        }
    }

    fn unary_op(&mut self, name: &str) {
        self.parse_precedence(Prec::Unary.one_higher());
        let symbol = self.signature_symbol(name);
        self.emit(Op::Call { arity: 0, symbol });
    }

    fn infix(&mut self, precedence: Prec, can_assign: bool) {
        let token = self.previous.token.clone();
        match token {
            Token::Question => self.conditional(),
            Token::AmpAmp => {
                self.match_lines();
                let jump = self.emit_jump(Op::And(0));
                self.parse_precedence(Prec::LogicalAnd.one_higher());
                self.patch_jump(jump);
            }
            Token::PipePipe => {
                self.match_lines();
                let jump = self.emit_jump(Op::Or(0));
                self.parse_precedence(Prec::LogicalOr.one_higher());
                self.patch_jump(jump);
            }
            Token::Dot => {
                let name = self.expect_name("Expect method name after '.'.");
                self.named_call(&name, can_assign);
            }
            Token::LeftBracket => self.subscript(can_assign),
            other => {
                let name = match other {
                    Token::EqEq => "==",
                    Token::BangEq => "!=",
                    Token::KwIs => "is",
                    Token::Lt => "<",
                    Token::Gt => ">",
                    Token::LtEq => "<=",
                    Token::GtEq => ">=",
                    Token::Pipe => "|",
                    Token::Caret => "^",
                    Token::Amp => "&",
                    Token::LtLt => "<<",
                    Token::GtGt => ">>",
                    Token::DotDot => "..",
                    Token::DotDotDot => "...",
                    Token::Plus => "+",
                    Token::Minus => "-",
                    Token::Dollar => "$",
                    Token::Star => "*",
                    Token::Slash => "/",
                    Token::Percent => "%",
                    unexpected => unreachable!("not an infix operator: {}", unexpected),
                };
                self.match_lines();
                self.parse_precedence(precedence.one_higher());
                let symbol = self.signature_symbol(&format!("{}(_)", name));
                self.emit(Op::Call { arity: 1, symbol });
            }
        }
    }

    fn conditional(&mut self) {
        self.match_lines();
        let if_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.parse_precedence(Prec::Conditional);
        self.match_lines();
        self.consume(&Token::Colon, "Expect ':' after then branch of conditional.");
        self.match_lines();
        let else_jump = self.emit_jump(Op::Jump(0));
        self.patch_jump(if_jump);
        self.parse_precedence(Prec::Assignment);
        self.patch_jump(else_jump);
    }

    fn list_literal(&mut self) {
        self.load_core_variable("List");
        let symbol = self.signature_symbol("new()");
        self.emit(Op::Call { arity: 0, symbol });
        let add = self.signature_symbol("addCore_(_)");
        loop {
            self.match_lines();
            if self.check(&Token::RightBracket) {
                break;
            }
            self.expression();
            self.emit(Op::Call {
                arity: 1,
                symbol: add,
            });
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.match_lines();
        self.consume(&Token::RightBracket, "Expect ']' after list elements.");
    }

    /// Compile the argument list of a call, returning the arity.
    fn argument_list(&mut self) -> u8 {
        let mut arity: u8 = 0;
        loop {
            self.match_lines();
            if self.check(&Token::RightParen) {
                break;
            }
            if arity as usize >= MAX_PARAMETERS {
                self.error("Methods cannot take more than 16 arguments.");
            }
            self.expression();
            arity += 1;
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.match_lines();
        self.consume(&Token::RightParen, "Expect ')' after arguments.");
        arity
    }

    fn signature_text(name: &str, arity: u8, parens: bool) -> String {
        if !parens {
            return name.to_string();
        }
        format!("{}({})", name, (0..arity).map(|_| "_").join(","))
    }

    fn subscript_signature(arity: u8) -> String {
        format!("[{}]", (0..arity).map(|_| "_").join(","))
    }

    /// A method call on the value already on the stack: getter, setter,
    /// argument list, optional block argument.
    fn named_call(&mut self, name: &str, can_assign: bool) {
        if can_assign && self.match_token(&Token::Eq) {
            self.match_lines();
            self.expression();
            let symbol = self.signature_symbol(&format!("{}=(_)", name));
            self.emit(Op::Call { arity: 1, symbol });
            return;
        }
        let mut arity: u8 = 0;
        let mut parens = false;
        if self.match_token(&Token::LeftParen) {
            arity = self.argument_list();
            parens = true;
        }
        if self.check(&Token::LeftBrace) {
            self.advance();
            self.fn_literal();
            arity += 1;
            parens = true;
        }
        let signature = Self::signature_text(name, arity, parens);
        let symbol = self.signature_symbol(&signature);
        self.emit(Op::Call { arity, symbol });
    }

    fn subscript(&mut self, can_assign: bool) {
        let mut arity: u8 = 0;
        loop {
            self.match_lines();
            if arity as usize >= MAX_PARAMETERS {
                self.error("Subscripts cannot take more than 16 arguments.");
            }
            self.expression();
            arity += 1;
            if !self.match_token(&Token::Comma) {
                break;
            }
        }
        self.match_lines();
        self.consume(&Token::RightBracket, "Expect ']' after subscript arguments.");
        let mut signature = Self::subscript_signature(arity);
        if can_assign && self.match_token(&Token::Eq) {
            signature.push_str("=(_)");
            self.match_lines();
            self.expression();
            arity += 1;
        }
        let symbol = self.signature_symbol(&signature);
        self.emit(Op::Call { arity, symbol });
    }

    fn bare_name(&mut self, name: String, can_assign: bool) {
        if let Some(variable) = self.resolve_non_module(&name) {
            self.bare_variable(variable, can_assign);
            return;
        }
        // Inside a class body a lowercase name is a call on the receiver.
        if self.class_info.is_some() && starts_lowercase(&name) {
            self.load_this();
            self.named_call(&name, can_assign);
            return;
        }
        let index = match self.vm.heap.module(self.module).find_variable(&name) {
            Some(index) => index as u16,
            None => {
                let index = self.new_module_variable(&name);
                self.forward_uses.push((index, self.previous.line));
                index
            }
        };
        self.bare_variable(Variable::Module(index), can_assign);
    }

    fn bare_variable(&mut self, variable: Variable, can_assign: bool) {
        if can_assign && self.match_token(&Token::Eq) {
            self.match_lines();
            self.expression();
            match variable {
                Variable::Local(index) => self.emit(Op::StoreLocal(index)),
                Variable::Upvalue(index) => self.emit(Op::StoreUpvalue(index)),
                Variable::Module(index) => self.emit(Op::StoreModuleVar(index)),
            }
            return;
        }
        self.load_variable(variable);
    }

    fn field(&mut self, name: &str, can_assign: bool) {
        let (is_foreign, in_static) = match &self.class_info {
            Some(info) => (info.is_foreign, info.in_static),
            None => {
                self.error("Cannot reference a field outside of a class definition.");
                return;
            }
        };
        if is_foreign {
            self.error("Cannot define fields in a foreign class.");
            return;
        }
        if in_static {
            self.error("Cannot use an instance field in a static method.");
            return;
        }
        let info = match &mut self.class_info {
            Some(info) => info,
            None => return,
        };
        let position = info.fields.iter().position(|f| f == name);
        let too_many = position.is_none() && info.fields.len() >= MAX_FIELDS;
        let field = match position {
            Some(index) => index,
            None => {
                info.fields.push(name.to_string());
                info.fields.len() - 1
            }
        } as u8;
        if too_many {
            self.error("A class can only have 255 fields.");
            return;
        }

        let is_load = !(can_assign && self.match_token(&Token::Eq));
        if !is_load {
            self.match_lines();
            self.expression();
        }
        let direct = matches!(
            self.compiler().kind,
            FnKind::Method | FnKind::Constructor
        );
        if direct {
            self.emit(if is_load {
                Op::LoadFieldThis(field)
            } else {
                Op::StoreFieldThis(field)
            });
        } else {
            self.load_this();
            self.emit(if is_load {
                Op::LoadField(field)
            } else {
                Op::StoreField(field)
            });
        }
    }

    fn load_this(&mut self) {
        match self.resolve_non_module("this") {
            Some(variable) => self.load_variable(variable),
            None => self.error("Cannot use 'this' outside of a method."),
        }
    }

    fn super_call(&mut self, can_assign: bool) {
        let method_name = match &self.class_info {
            Some(info) => info.method_name.clone(),
            None => {
                self.error("Cannot use 'super' outside of a method.");
                return;
            }
        };
        let _ = can_assign;
        self.load_this();
        let (name, is_bare) = if self.match_token(&Token::Dot) {
            (self.expect_name("Expect method name after 'super.'."), false)
        } else {
            match method_name {
                Some(name) => (name, true),
                None => {
                    self.error("Cannot use 'super' outside of a method.");
                    return;
                }
            }
        };
        let mut arity: u8 = 0;
        let mut parens = false;
        if self.match_token(&Token::LeftParen) {
            arity = self.argument_list();
            parens = true;
        }
        if self.check(&Token::LeftBrace) {
            self.advance();
            self.fn_literal();
            arity += 1;
            parens = true;
        }
        let mut signature = Self::signature_text(&name, arity, parens);
        // A bare `super` in a constructor chains to the superclass
        // initializer, not the class-side constructor.
        if is_bare && self.compiler().kind == FnKind::Constructor {
            signature = format!("init {}", signature);
        }
        let symbol = self.signature_symbol(&signature);
        // The superclass is filled into this constant slot when the enclosing
        // method is bound to its class.
        let constant = self.add_constant(Value::Null);
        self.emit(Op::Super {
            arity,
            symbol,
            constant,
        });
    }

    /// A function literal: `{ |a, b| body }`. The opening brace is consumed.
    fn fn_literal(&mut self) {
        self.compilers
            .push(Compiler::new(FnKind::Function, "(fn)".to_string()));
        if self.match_token(&Token::Pipe) {
            loop {
                let name = self.expect_name("Expect parameter name.");
                if self.compiler().arity as usize >= MAX_PARAMETERS {
                    self.error("Functions cannot take more than 16 parameters.");
                }
                self.compiler().arity += 1;
                self.declare_variable(name);
                if !self.match_token(&Token::Comma) {
                    break;
                }
            }
            self.consume(&Token::Pipe, "Expect '|' after function parameters.");
        }
        self.finish_body(false);
        let fun = self.end_compiler();
        let constant = self.add_constant(Value::Obj(fun));
        self.emit(Op::Closure(constant));
    }

    /// Compile a `{ ... }` body: a single same-line expression is an implicit
    /// return, otherwise a statement sequence returning null (or the receiver
    /// for constructors).
    fn finish_body(&mut self, is_constructor: bool) {
        let is_expression_body = self.finish_block();
        if is_constructor {
            if is_expression_body {
                self.emit(Op::Pop);
            }
            // Constructors return the instance under construction.
            self.emit(Op::LoadLocal(0));
        } else if !is_expression_body {
            self.emit(Op::Null);
        }
        self.emit(Op::Return);
    }

    /// Returns true when the block was a single expression body.
    fn finish_block(&mut self) -> bool {
        if self.match_token(&Token::RightBrace) {
            return false;
        }
        if !self.match_lines() {
            self.expression();
            self.consume(&Token::RightBrace, "Expect '}' at end of block.");
            return true;
        }
        loop {
            self.match_lines();
            if self.match_token(&Token::RightBrace) {
                return false;
            }
            if self.check(&Token::Eof) {
                self.error("Expect '}' at end of block.");
                return false;
            }
            self.definition();
            self.consume_line("Expect newline after statement.");
            if self.had_error {
                return false;
            }
        }
    }

    /// Turn the finished innermost compiler into a function object.
    fn end_compiler(&mut self) -> Handle {
        let compiler = self.compilers.pop().expect("compiler stack empty");
        let fun = FnObj {
            code: compiler.code,
            constants: compiler.constants,
            lines: compiler.lines,
            module: self.module,
            arity: compiler.arity,
            upvalues: compiler.upvalues,
            name: compiler.name,
        };
        self.vm.alloc_fn(fun)
    }

    // ------------------------------------------------------------------
    // Statements

    fn definition(&mut self) {
        if self.match_token(&Token::KwClass) {
            self.class_definition(false);
            return;
        }
        if self.check(&Token::KwForeign) {
            // `foreign class`; foreign methods are handled inside class
            // bodies.
            self.advance();
            self.consume(&Token::KwClass, "Expect 'class' after 'foreign'.");
            self.class_definition(true);
            return;
        }
        if self.match_token(&Token::KwImport) {
            self.import();
            return;
        }
        if self.match_token(&Token::KwVar) {
            self.var_definition();
            return;
        }
        self.statement();
    }

    fn var_definition(&mut self) {
        let name = self.expect_name("Expect variable name.");
        if self.match_token(&Token::Eq) {
            self.match_lines();
            self.expression();
        } else {
            self.emit(Op::Null);
        }
        self.define_variable_named(name);
    }

    fn define_variable_named(&mut self, name: String) {
        let variable = self.declare_variable(name);
        self.define_variable(variable);
    }

    /// Anchor the value on top of the stack as `variable`. Locals simply keep
    /// their slot; module variables store and pop.
    fn define_variable(&mut self, variable: Variable) {
        if let Variable::Module(index) = variable {
            self.emit(Op::StoreModuleVar(index));
            self.emit(Op::Pop);
        }
    }

    fn statement(&mut self) {
        if self.match_token(&Token::KwBreak) {
            let Some(depth) = self.compiler().loops.last().map(|l| l.scope_depth) else {
                self.error("Cannot use 'break' outside of a loop.");
                return;
            };
            self.discard_locals(depth + 1);
            let jump = self.emit_jump(Op::Jump(0));
            self.compiler()
                .loops
                .last_mut()
                .expect("loop stack")
                .breaks
                .push(jump);
            return;
        }
        if self.match_token(&Token::KwContinue) {
            let Some((depth, start)) = self
                .compiler()
                .loops
                .last()
                .map(|l| (l.scope_depth, l.start))
            else {
                self.error("Cannot use 'continue' outside of a loop.");
                return;
            };
            self.discard_locals(depth + 1);
            self.emit(Op::Loop(start));
            return;
        }
        if self.match_token(&Token::KwFor) {
            self.for_statement();
            return;
        }
        if self.match_token(&Token::KwIf) {
            self.if_statement();
            return;
        }
        if self.match_token(&Token::KwReturn) {
            let is_constructor = self.compiler().kind == FnKind::Constructor;
            if self.check(&Token::Line) || self.check(&Token::RightBrace) || self.check(&Token::Eof)
            {
                if is_constructor {
                    self.emit(Op::LoadLocal(0));
                } else {
                    self.emit(Op::Null);
                }
            } else {
                if is_constructor {
                    self.error("A constructor cannot return a value.");
                }
                self.expression();
            }
            self.emit(Op::Return);
            return;
        }
        if self.match_token(&Token::KwWhile) {
            self.while_statement();
            return;
        }
        if self.match_token(&Token::LeftBrace) {
            self.push_scope();
            if self.finish_block() {
                // A single-expression block leaves a value; discard it.
                self.emit(Op::Pop);
            }
            self.pop_scope();
            return;
        }
        self.expression();
        self.emit(Op::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(&Token::LeftParen, "Expect '(' after 'if'.");
        self.match_lines();
        self.expression();
        self.match_lines();
        self.consume(&Token::RightParen, "Expect ')' after if condition.");
        let if_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.statement();
        if self.match_token(&Token::KwElse) {
            let else_jump = self.emit_jump(Op::Jump(0));
            self.patch_jump(if_jump);
            self.match_lines();
            self.statement();
            self.patch_jump(else_jump);
        } else {
            self.patch_jump(if_jump);
        }
    }

    fn start_loop(&mut self) {
        let start = self.compiler().code.len();
        let scope_depth = self.compiler().scope_depth;
        self.compiler().loops.push(LoopCtx {
            start,
            scope_depth,
            breaks: Vec::new(),
        });
    }

    fn end_loop(&mut self, exit_jump: usize) {
        let start = self.compiler().loops.last().expect("loop stack").start;
        self.emit(Op::Loop(start));
        self.patch_jump(exit_jump);
        let ctx = self.compiler().loops.pop().expect("loop stack");
        for jump in ctx.breaks {
            self.patch_jump(jump);
        }
    }

    fn while_statement(&mut self) {
        self.start_loop();
        self.consume(&Token::LeftParen, "Expect '(' after 'while'.");
        self.match_lines();
        self.expression();
        self.match_lines();
        self.consume(&Token::RightParen, "Expect ')' after while condition.");
        let exit_jump = self.emit_jump(Op::JumpIfFalse(0));
        self.statement();
        self.end_loop(exit_jump);
    }

    /// `for (x in seq) body` desugars to the iterate/iteratorValue protocol
    /// with two hidden locals for the sequence and the iterator.
    fn for_statement(&mut self) {
        self.push_scope();
        self.consume(&Token::LeftParen, "Expect '(' after 'for'.");
        let name = self.expect_name("Expect for loop variable name.");
        self.consume(&Token::KwIn, "Expect 'in' after loop variable.");
        self.match_lines();
        self.expression();
        // Hidden names contain a space so user code cannot collide with them.
        let seq_slot = self.add_local("seq ".to_string());
        self.emit(Op::Null);
        let iter_slot = self.add_local("iter ".to_string());
        self.consume(&Token::RightParen, "Expect ')' after loop expression.");

        self.start_loop();
        self.emit(Op::LoadLocal(seq_slot));
        self.emit(Op::LoadLocal(iter_slot));
        let iterate = self.signature_symbol("iterate(_)");
        self.emit(Op::Call {
            arity: 1,
            symbol: iterate,
        });
        self.emit(Op::StoreLocal(iter_slot));
        let exit_jump = self.emit_jump(Op::JumpIfFalse(0));

        self.emit(Op::LoadLocal(seq_slot));
        self.emit(Op::LoadLocal(iter_slot));
        let iterator_value = self.signature_symbol("iteratorValue(_)");
        self.emit(Op::Call {
            arity: 1,
            symbol: iterator_value,
        });

        self.push_scope();
        self.add_local(name);
        self.statement();
        self.pop_scope();

        self.end_loop(exit_jump);
        self.pop_scope();
    }

    fn import(&mut self) {
        let path = match &self.current.token {
            Token::Str(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            _ => {
                self.error("Expect a string after 'import'.");
                return;
            }
        };
        self.advance();
        let path_value = self.string_value(&path);
        let constant = self.add_constant(path_value);
        self.emit(Op::ImportModule(constant));
        // The module body result (or the already-loaded placeholder) is not
        // interesting.
        self.emit(Op::Pop);
        if !self.match_token(&Token::KwFor) {
            return;
        }
        loop {
            let name = self.expect_name("Expect variable name after 'for'.");
            let name_value = self.string_value(&name);
            let name_constant = self.add_constant(name_value);
            let variable = self.declare_variable(name);
            self.emit(Op::ImportVariable(name_constant));
            self.define_variable(variable);
            if !self.match_token(&Token::Comma) {
                break;
            }
            self.match_lines();
        }
    }

    // ------------------------------------------------------------------
    // Classes

    fn class_definition(&mut self, is_foreign: bool) {
        let name = self.expect_name("Expect class name.");
        let class_variable = self.declare_variable(name.clone());
        self.emit_string_constant(&name);
        if self.match_token(&Token::KwIs) {
            self.parse_precedence(Prec::Call);
        } else {
            self.load_core_variable("Object");
        }
        let num_fields_instruction = if is_foreign {
            self.emit(Op::ForeignClass);
            None
        } else {
            self.emit(Op::Class { num_fields: 255 });
            Some(self.compiler().code.len() - 1)
        };
        self.define_variable(class_variable);

        self.push_scope();
        let enclosing = self.class_info.take();
        self.class_info = Some(ClassInfo {
            fields: Vec::new(),
            is_foreign,
            in_static: false,
            method_name: None,
        });

        self.consume(&Token::LeftBrace, "Expect '{' after class name.");
        loop {
            self.match_lines();
            if self.match_token(&Token::RightBrace) {
                break;
            }
            if self.check(&Token::Eof) {
                self.error("Expect '}' at end of class body.");
                break;
            }
            self.method(class_variable);
            if self.had_error {
                break;
            }
        }

        if let Some(index) = num_fields_instruction {
            let count = self
                .class_info
                .as_ref()
                .map(|info| info.fields.len())
                .unwrap_or(0);
            self.compiler().code[index] = Op::Class {
                num_fields: count as u8,
            };
        }
        self.class_info = enclosing;
        self.pop_scope();
    }

    /// Parse the signature of the method being defined and declare its
    /// parameters in the already-pushed method compiler. Returns
    /// `(base name, signature, is_constructor)`.
    fn method_signature(&mut self) -> (String, String, bool) {
        let token = self.current.token.clone();
        match token {
            Token::Name(name) => {
                self.advance();
                if self.match_token(&Token::Eq) {
                    // Setter: name=(value)
                    self.consume(&Token::LeftParen, "Expect '(' after setter name.");
                    let count = self.parameter_list();
                    if count != 1 {
                        self.error("A setter takes exactly one parameter.");
                    }
                    return (name.clone(), format!("{}=(_)", name), false);
                }
                if self.match_token(&Token::LeftParen) {
                    let count = self.parameter_list();
                    return (
                        name.clone(),
                        Self::signature_text(&name, count, true),
                        false,
                    );
                }
                (name.clone(), name, false)
            }
            Token::LeftBracket => {
                self.advance();
                let mut count: u8 = 0;
                loop {
                    let name = self.expect_name("Expect parameter name.");
                    self.compiler().arity += 1;
                    self.declare_variable(name);
                    count += 1;
                    if !self.match_token(&Token::Comma) {
                        break;
                    }
                }
                self.consume(&Token::RightBracket, "Expect ']' after parameters.");
                let mut sig = Self::subscript_signature(count);
                if self.match_token(&Token::Eq) {
                    self.consume(&Token::LeftParen, "Expect '(' after subscript setter.");
                    let value_count = self.parameter_list();
                    if value_count != 1 {
                        self.error("A subscript setter takes exactly one value parameter.");
                    }
                    sig.push_str("=(_)");
                }
                ("[]".to_string(), sig, false)
            }
            Token::KwConstruct => {
                self.advance();
                let name = self.expect_name("Expect constructor name.");
                self.consume(&Token::LeftParen, "Expect '(' after constructor name.");
                let count = self.parameter_list();
                let sig = Self::signature_text(&name, count, true);
                (name, sig, true)
            }
            // Operator methods.
            Token::Bang => {
                self.advance();
                ("!".to_string(), "!".to_string(), false)
            }
            Token::Tilde => {
                self.advance();
                ("~".to_string(), "~".to_string(), false)
            }
            Token::Minus => {
                self.advance();
                if self.match_token(&Token::LeftParen) {
                    let count = self.parameter_list();
                    if count != 1 {
                        self.error("An infix operator takes exactly one parameter.");
                    }
                    ("-".to_string(), "-(_)".to_string(), false)
                } else {
                    ("-".to_string(), "-".to_string(), false)
                }
            }
            other => {
                let name = match other {
                    Token::Plus => "+",
                    Token::Star => "*",
                    Token::Slash => "/",
                    Token::Percent => "%",
                    Token::EqEq => "==",
                    Token::BangEq => "!=",
                    Token::Lt => "<",
                    Token::Gt => ">",
                    Token::LtEq => "<=",
                    Token::GtEq => ">=",
                    Token::LtLt => "<<",
                    Token::GtGt => ">>",
                    Token::Amp => "&",
                    Token::Pipe => "|",
                    Token::Caret => "^",
                    Token::DotDot => "..",
                    Token::DotDotDot => "...",
                    Token::Dollar => "$",
                    _ => {
                        self.error("Expect method definition.");
                        return (String::new(), String::new(), false);
                    }
                };
                self.advance();
                self.consume(&Token::LeftParen, "Expect '(' after operator name.");
                let count = self.parameter_list();
                if count != 1 {
                    self.error("An infix operator takes exactly one parameter.");
                }
                (name.to_string(), format!("{}(_)", name), false)
            }
        }
    }

    fn parameter_list(&mut self) -> u8 {
        let mut count: u8 = 0;
        if self.match_token(&Token::RightParen) {
            return 0;
        }
        loop {
            let name = self.expect_name("Expect parameter name.");
            if self.compiler().arity as usize >= MAX_PARAMETERS {
                self.error("Methods cannot have more than 16 parameters.");
            }
            self.compiler().arity += 1;
            self.declare_variable(name);
            count += 1;
            if !self.match_token(&Token::Comma) {
                break;
            }
            self.match_lines();
        }
        self.consume(&Token::RightParen, "Expect ')' after parameters.");
        count
    }

    fn method(&mut self, class_variable: Variable) {
        let is_foreign_method = self.match_token(&Token::KwForeign);
        let is_static = self.match_token(&Token::KwStatic);
        if let Some(info) = &mut self.class_info {
            info.in_static = is_static;
        }

        let kind = if is_static {
            FnKind::StaticMethod
        } else if self.check(&Token::KwConstruct) {
            FnKind::Constructor
        } else {
            FnKind::Method
        };
        self.compilers.push(Compiler::new(kind, String::new()));
        let (base_name, signature, is_constructor) = self.method_signature();
        self.compiler().name = signature.clone();
        if is_constructor && is_static {
            self.error("A constructor cannot be static.");
        }
        if let Some(info) = &mut self.class_info {
            info.method_name = Some(base_name);
        }

        let arity = self.compiler().arity;
        if is_foreign_method {
            // No body: the method table slot carries the signature string and
            // the host binds the implementation when the class is built.
            self.compilers.pop();
            self.emit_string_constant(&signature);
        } else {
            self.consume(&Token::LeftBrace, "Expect '{' to begin method body.");
            let method_signature = if is_constructor {
                format!("init {}", signature)
            } else {
                signature.clone()
            };
            self.compiler().name = method_signature;
            self.finish_body(is_constructor);
            let fun = self.end_compiler();
            let constant = self.add_constant(Value::Obj(fun));
            self.emit(Op::Closure(constant));
        }

        // Bind: [method, class] on the stack, popped by the bind op.
        let symbol = if is_constructor {
            self.signature_symbol(&format!("init {}", signature))
        } else {
            self.signature_symbol(&signature)
        };
        self.load_variable(class_variable);
        if is_static {
            self.emit(Op::MethodStatic(symbol));
        } else {
            self.emit(Op::MethodInstance(symbol));
        }

        if is_constructor {
            // The class-side constructor is a stub that allocates the
            // instance and tail-dispatches into the initializer.
            let init_symbol = symbol;
            let stub = self.constructor_stub(arity, init_symbol);
            let constant = self.add_constant(Value::Obj(stub));
            self.emit(Op::Closure(constant));
            let public_symbol = self.signature_symbol(&signature);
            self.load_variable(class_variable);
            self.emit(Op::MethodStatic(public_symbol));
        }

        if let Some(info) = &mut self.class_info {
            info.in_static = false;
            info.method_name = None;
        }
        self.consume_line("Expect newline after method definition.");
    }

    fn constructor_stub(&mut self, arity: u8, init_symbol: u16) -> Handle {
        let is_foreign = self
            .class_info
            .as_ref()
            .map(|info| info.is_foreign)
            .unwrap_or(false);
        let line = self.previous.line;
        let construct = if is_foreign {
            Op::ForeignConstruct
        } else {
            Op::Construct
        };
        let fun = FnObj {
            code: vec![
                construct,
                Op::Call {
                    arity,
                    symbol: init_symbol,
                },
                Op::Return,
            ],
            constants: Vec::new(),
            lines: vec![line; 3],
            module: self.module,
            arity,
            upvalues: Vec::new(),
            name: "(constructor)".to_string(),
        };
        self.vm.alloc_fn(fun)
    }
}

fn starts_lowercase(name: &str) -> bool {
    name.chars().next().map_or(false, |c| c.is_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Config;

    fn compile_source(source: &str) -> (Vm, Option<Handle>) {
        let mut vm = Vm::new(Config::default());
        let module = vm.core_module();
        let fun = compile(&mut vm, module, source);
        (vm, fun)
    }

    #[test]
    fn test_compiles_expression_statement() {
        let (_vm, fun) = compile_source("1 + 2\n");
        assert!(fun.is_some());
    }

    #[test]
    fn test_operators_become_signature_calls() {
        let (vm, fun) = compile_source("1 + 2\n");
        let fun = fun.expect("compiles");
        let code = &vm.heap.fun(fun).code;
        let plus = vm.method_names.find("+(_)").expect("interned");
        assert!(code
            .iter()
            .any(|op| matches!(op, Op::Call { arity: 1, symbol } if *symbol == plus)));
    }

    #[test]
    fn test_undefined_forward_reference_errors() {
        let (_vm, fun) = compile_source("var x = missing\n");
        assert!(fun.is_none());
    }

    #[test]
    fn test_forward_reference_defined_later_is_fine() {
        let (_vm, fun) = compile_source("var f = Fn.new { later }\nvar later = 3\n");
        assert!(fun.is_some());
    }

    #[test]
    fn test_class_with_fields_counts_them() {
        let (vm, fun) = compile_source(
            "class Point {\n  construct new(x, y) {\n    _x = x\n    _y = y\n  }\n  x { _x }\n}\n",
        );
        let fun = fun.expect("compiles");
        let code = &vm.heap.fun(fun).code;
        assert!(code
            .iter()
            .any(|op| matches!(op, Op::Class { num_fields: 2 })));
    }

    #[test]
    fn test_break_outside_loop_errors() {
        let (_vm, fun) = compile_source("break\n");
        assert!(fun.is_none());
    }

    #[test]
    fn test_duplicate_module_variable_errors() {
        let (_vm, fun) = compile_source("var a = 1\nvar a = 2\n");
        assert!(fun.is_none());
    }
}
