//! Textual IR parser implementation.
//!
//! Parsing runs in two passes. The first pass turns the token stream into a
//! syntax tree, recording every local name with the type its defining
//! instruction produces. The second pass declares all globals and function
//! headers, then rebuilds each body through [`Builder`] in textual order. Since
//! instruction handles are allocated in creation order, the handle of every
//! result is known before its body is built, which resolves forward references
//! without a fixup list.

use crate::core::builder::Builder;
use crate::core::error::ParseError;
use crate::core::module::{
    Attribute, BinaryOp, CallConv, FuncId, InstId, IntPredicate, Linkage, Module, Value,
    ValueKind,
};
use crate::core::types::{Type, TypeRegistry};
use hashbrown::HashMap;

/// Parse textual IR into a module. The module name comes from a leading
/// `; ModuleID = '...'` comment when present.
pub fn parse_module(text: &str) -> Result<Module, ParseError> {
    let tokens = Lexer::new(text).tokenize()?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        types: TypeRegistry::new(),
    };
    let ast = parser.parse_module()?;
    let name = module_id(text).unwrap_or_else(|| "module".to_string());
    build_module(name, ast)
}

fn module_id(text: &str) -> Option<String> {
    let rest = text.lines().next()?.trim().strip_prefix("; ModuleID = '")?;
    Some(rest.strip_suffix('\'')?.to_string())
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Local(String),
    Global(String),
    Word(String),
    Int(i128),
    Str(String),
    Punct(char),
    Eof,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    line: usize,
    column: usize,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '$' | '.' | '_' | '-')
}

impl<'a> Lexer<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError {
            line: self.line,
            column: self.column,
            message: message.into(),
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn ident(&mut self) -> String {
        let mut s = String::new();
        while let Some(&c) = self.chars.peek() {
            if !is_ident_char(c) {
                break;
            }
            s.push(c);
            self.bump();
        }
        s
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        // opening quote already consumed
        let mut s = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some('"') => return Ok(s),
                Some('\\') => {
                    let hi = self.bump().and_then(|c| c.to_digit(16));
                    let lo = self.bump().and_then(|c| c.to_digit(16));
                    match (hi, lo) {
                        (Some(hi), Some(lo)) => match char::from_u32(hi * 16 + lo) {
                            Some(c) => s.push(c),
                            None => return Err(self.error("invalid escape")),
                        },
                        _ => return Err(self.error("invalid escape")),
                    }
                }
                Some(c) => s.push(c),
            }
        }
    }

    fn sigil_name(&mut self) -> Result<String, ParseError> {
        if self.chars.peek() == Some(&'"') {
            self.bump();
            return self.quoted();
        }
        let name = self.ident();
        if name.is_empty() {
            return Err(self.error("expected a name after sigil"));
        }
        Ok(name)
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            while let Some(&c) = self.chars.peek() {
                if c == ';' {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                } else if c.is_whitespace() {
                    self.bump();
                } else {
                    break;
                }
            }
            let (line, column) = (self.line, self.column);
            let Some(&c) = self.chars.peek() else {
                tokens.push(Token {
                    tok: Tok::Eof,
                    line,
                    column,
                });
                return Ok(tokens);
            };
            let tok = match c {
                '%' => {
                    self.bump();
                    Tok::Local(self.sigil_name()?)
                }
                '@' => {
                    self.bump();
                    Tok::Global(self.sigil_name()?)
                }
                '"' => {
                    self.bump();
                    Tok::Str(self.quoted()?)
                }
                '-' | '0'..='9' => {
                    let text = self.ident();
                    let digits = text.strip_prefix('-').unwrap_or(&text);
                    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                        match text.parse::<i128>() {
                            Ok(v) => Tok::Int(v),
                            Err(_) => {
                                return Err(ParseError {
                                    line,
                                    column,
                                    message: format!("integer literal {text} out of range"),
                                })
                            }
                        }
                    } else {
                        Tok::Word(text)
                    }
                }
                c if c.is_ascii_alphabetic() || matches!(c, '$' | '.' | '_') => {
                    Tok::Word(self.ident())
                }
                '=' | ',' | '(' | ')' | '{' | '}' | '<' | '>' | '*' | ':' | '[' | ']' => {
                    self.bump();
                    Tok::Punct(c)
                }
                other => {
                    return Err(ParseError {
                        line,
                        column,
                        message: format!("unexpected character '{other}'"),
                    })
                }
            };
            tokens.push(Token { tok, line, column });
        }
    }
}

// ---------------------------------------------------------------------------
// Syntax tree
// ---------------------------------------------------------------------------

type Pos = (usize, usize);

#[derive(Debug)]
enum ConstAst {
    Int(i128),
    Bool(bool),
    Undef,
    Zero,
    Aggregate(Vec<Operand>),
}

#[derive(Debug)]
enum OperandValue {
    Local(String),
    Global(String),
    Const(ConstAst),
}

#[derive(Debug)]
struct Operand {
    ty: Type,
    value: OperandValue,
    pos: Pos,
}

#[derive(Debug)]
enum OpAst {
    Alloca(Type),
    Load(Type, Operand),
    Store(Operand, Operand),
    Binary(BinaryOp, Operand, Operand),
    ICmp(IntPredicate, Operand, Operand),
    Call {
        call_conv: Option<CallConv>,
        ret: Type,
        callee: String,
        args: Vec<Operand>,
    },
    InsertValue(Operand, Operand, u32),
    ExtractValue(Operand, u32),
    InsertElement(Operand, Operand, Operand),
    ExtractElement(Operand, Operand),
    Ret(Option<Operand>),
    Br(String),
    CondBr(Operand, String, String),
    Unreachable,
}

#[derive(Debug)]
struct InstAst {
    result: Option<String>,
    /// Type of the produced value, if any.
    result_ty: Option<Type>,
    op: OpAst,
    pos: Pos,
}

#[derive(Debug)]
struct BlockAst {
    label: String,
    insts: Vec<InstAst>,
    pos: Pos,
}

#[derive(Debug)]
struct FunctionAst {
    name: String,
    linkage: Linkage,
    call_conv: CallConv,
    ty: Type,
    param_names: Vec<Option<String>>,
    attributes: Vec<Attribute>,
    body: Option<Vec<BlockAst>>,
    pos: Pos,
}

#[derive(Debug)]
struct GlobalAst {
    name: String,
    linkage: Linkage,
    init: Operand,
    pos: Pos,
}

#[derive(Debug, Default)]
struct ModuleAst {
    globals: Vec<GlobalAst>,
    functions: Vec<FunctionAst>,
}

// ---------------------------------------------------------------------------
// Parser (pass 1)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    types: TypeRegistry,
}

fn error_at(pos: Pos, message: impl Into<String>) -> ParseError {
    ParseError {
        line: pos.0,
        column: pos.1,
        message: message.into(),
    }
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map(|t| &t.tok).unwrap_or(&Tok::Eof)
    }

    fn here(&self) -> Pos {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        self.tokens
            .get(idx)
            .map(|t| (t.line, t.column))
            .unwrap_or((1, 1))
    }

    fn next(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        error_at(self.here(), message)
    }

    fn try_punct(&mut self, c: char) -> bool {
        if *self.peek() == Tok::Punct(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<(), ParseError> {
        if self.try_punct(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{c}', found {:?}", self.peek())))
        }
    }

    fn try_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Tok::Word(w) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<(), ParseError> {
        if self.try_word(word) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{word}', found {:?}", self.peek())))
        }
    }

    fn expect_int(&mut self) -> Result<i128, ParseError> {
        match self.next() {
            Tok::Int(v) => Ok(v),
            other => Err(self.error(format!("expected integer, found {other:?}"))),
        }
    }

    fn expect_index(&mut self) -> Result<u32, ParseError> {
        let v = self.expect_int()?;
        u32::try_from(v).map_err(|_| self.error(format!("index {v} out of range")))
    }

    fn expect_global(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Tok::Global(name) => Ok(name),
            other => Err(self.error(format!("expected @name, found {other:?}"))),
        }
    }

    fn expect_local(&mut self) -> Result<String, ParseError> {
        match self.next() {
            Tok::Local(name) => Ok(name),
            other => Err(self.error(format!("expected %name, found {other:?}"))),
        }
    }

    fn parse_module(&mut self) -> Result<ModuleAst, ParseError> {
        let mut ast = ModuleAst::default();
        loop {
            match self.peek().clone() {
                Tok::Eof => return Ok(ast),
                Tok::Global(_) => ast.globals.push(self.parse_global()?),
                Tok::Word(w) if w == "define" || w == "declare" => {
                    ast.functions.push(self.parse_function()?)
                }
                other => return Err(self.error(format!("unexpected {other:?} at top level"))),
            }
        }
    }

    fn parse_linkage(&mut self) -> Linkage {
        if let Tok::Word(w) = self.peek() {
            if let Some(linkage) = Linkage::from_keyword(w) {
                self.pos += 1;
                return linkage;
            }
        }
        Linkage::External
    }

    fn parse_call_conv(&mut self) -> Result<Option<CallConv>, ParseError> {
        let cc = match self.peek().clone() {
            Tok::Word(w) if w == "ccc" => CallConv::C,
            Tok::Word(w) if w == "fastcc" => CallConv::Fast,
            Tok::Word(w) if w == "coldcc" => CallConv::Cold,
            Tok::Word(w) if w == "cc" => {
                self.pos += 1;
                let id = self.expect_int()?;
                let id = u32::try_from(id).map_err(|_| self.error("calling convention id out of range"))?;
                return Ok(Some(CallConv::from_llvm_id(id)));
            }
            _ => return Ok(None),
        };
        self.pos += 1;
        Ok(Some(cc))
    }

    fn parse_global(&mut self) -> Result<GlobalAst, ParseError> {
        let pos = self.here();
        let name = self.expect_global()?;
        self.expect_punct('=')?;
        let linkage = self.parse_linkage();
        self.expect_word("global")?;
        let init = self.parse_typed_operand()?;
        Ok(GlobalAst {
            name,
            linkage,
            init,
            pos,
        })
    }

    fn type_result(&self, result: crate::core::error::ConstructionResult<Type>) -> Result<Type, ParseError> {
        result.map_err(|e| self.error(e.to_string()))
    }

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let mut ty = match self.next() {
            Tok::Word(w) if w == "void" => self.types.void_type(),
            Tok::Word(w) if w.starts_with('i') && w.len() > 1 && w[1..].chars().all(|c| c.is_ascii_digit()) => {
                let width = w[1..]
                    .parse::<u32>()
                    .map_err(|_| self.error(format!("bad integer type {w}")))?;
                let r = self.types.integer_type(width);
                self.type_result(r)?
            }
            Tok::Punct('{') => self.parse_struct_body(false)?,
            Tok::Punct('<') => {
                if self.try_punct('{') {
                    let ty = self.parse_struct_body(true)?;
                    self.expect_punct('>')?;
                    ty
                } else {
                    let count = self.expect_int()?;
                    let count = u32::try_from(count).map_err(|_| self.error("vector width out of range"))?;
                    self.expect_word("x")?;
                    let elem = self.parse_type()?;
                    self.expect_punct('>')?;
                    let r = self.types.vector_type(&elem, count);
                    self.type_result(r)?
                }
            }
            other => return Err(self.error(format!("expected type, found {other:?}"))),
        };
        loop {
            if self.try_punct('*') {
                let r = self.types.pointer_type(&ty);
                ty = self.type_result(r)?;
            } else if *self.peek() == Tok::Punct('(') {
                self.pos += 1;
                let mut params = Vec::new();
                let mut variadic = false;
                if !self.try_punct(')') {
                    loop {
                        if self.try_word("...") {
                            variadic = true;
                            self.expect_punct(')')?;
                            break;
                        }
                        params.push(self.parse_type()?);
                        if self.try_punct(')') {
                            break;
                        }
                        self.expect_punct(',')?;
                    }
                }
                let r = self.types.function_type(&ty, &params, variadic);
                ty = self.type_result(r)?;
            } else {
                return Ok(ty);
            }
        }
    }

    /// Fields after an opening `{`, through the closing `}`.
    fn parse_struct_body(&mut self, packed: bool) -> Result<Type, ParseError> {
        let mut fields = Vec::new();
        if !self.try_punct('}') {
            loop {
                fields.push(self.parse_type()?);
                if self.try_punct('}') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        let r = self.types.struct_type(&fields, packed);
        self.type_result(r)
    }

    fn parse_function(&mut self) -> Result<FunctionAst, ParseError> {
        let pos = self.here();
        let is_define = self.try_word("define");
        if !is_define {
            self.expect_word("declare")?;
        }
        let linkage = self.parse_linkage();
        let call_conv = self.parse_call_conv()?.unwrap_or_default();
        let ret = self.parse_type()?;
        let name = self.expect_global()?;
        self.expect_punct('(')?;
        let mut params = Vec::new();
        let mut param_names = Vec::new();
        let mut variadic = false;
        if !self.try_punct(')') {
            loop {
                if self.try_word("...") {
                    variadic = true;
                    self.expect_punct(')')?;
                    break;
                }
                params.push(self.parse_type()?);
                param_names.push(if matches!(self.peek(), Tok::Local(_)) {
                    Some(self.expect_local()?)
                } else {
                    None
                });
                if self.try_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        let r = self.types.function_type(&ret, &params, variadic);
        let ty = self.type_result(r)?;

        let mut attributes = Vec::new();
        while let Tok::Word(w) = self.peek() {
            match Attribute::from_name(w) {
                Some(attribute) => {
                    attributes.push(attribute);
                    self.pos += 1;
                }
                None => break,
            }
        }

        let body = if is_define {
            self.expect_punct('{')?;
            let mut blocks = Vec::new();
            while !self.try_punct('}') {
                blocks.push(self.parse_block()?);
            }
            if blocks.is_empty() {
                return Err(error_at(pos, format!("function @{name} has an empty body")));
            }
            Some(blocks)
        } else {
            None
        };

        Ok(FunctionAst {
            name,
            linkage,
            call_conv,
            ty,
            param_names,
            attributes,
            body,
            pos,
        })
    }

    fn at_label(&self) -> bool {
        matches!(self.peek(), Tok::Word(_) | Tok::Int(_) | Tok::Str(_))
            && *self.peek_at(1) == Tok::Punct(':')
    }

    fn parse_block(&mut self) -> Result<BlockAst, ParseError> {
        let pos = self.here();
        if !self.at_label() {
            return Err(self.error("expected block label"));
        }
        let label = match self.next() {
            Tok::Word(w) | Tok::Str(w) => w,
            Tok::Int(v) => v.to_string(),
            other => return Err(error_at(pos, format!("expected block label, found {other:?}"))),
        };
        self.expect_punct(':')?;
        let mut insts = Vec::new();
        while !self.at_label() && *self.peek() != Tok::Punct('}') {
            if *self.peek() == Tok::Eof {
                return Err(self.error("unexpected end of input in function body"));
            }
            insts.push(self.parse_inst()?);
        }
        Ok(BlockAst { label, insts, pos })
    }

    fn parse_operand(&mut self, ty: &Type) -> Result<Operand, ParseError> {
        let pos = self.here();
        let value = match self.peek().clone() {
            Tok::Local(name) => {
                self.pos += 1;
                OperandValue::Local(name)
            }
            Tok::Global(name) => {
                self.pos += 1;
                OperandValue::Global(name)
            }
            _ => OperandValue::Const(self.parse_const(ty)?),
        };
        Ok(Operand {
            ty: ty.clone(),
            value,
            pos,
        })
    }

    fn parse_typed_operand(&mut self) -> Result<Operand, ParseError> {
        let ty = self.parse_type()?;
        self.parse_operand(&ty)
    }

    fn parse_const(&mut self, ty: &Type) -> Result<ConstAst, ParseError> {
        match self.next() {
            Tok::Int(v) => Ok(ConstAst::Int(v)),
            Tok::Word(w) if w == "true" => Ok(ConstAst::Bool(true)),
            Tok::Word(w) if w == "false" => Ok(ConstAst::Bool(false)),
            Tok::Word(w) if w == "undef" => Ok(ConstAst::Undef),
            Tok::Word(w) if w == "zeroinitializer" => Ok(ConstAst::Zero),
            Tok::Punct('{') => {
                let elements = self.parse_const_elements('}')?;
                Ok(ConstAst::Aggregate(elements))
            }
            Tok::Punct('<') => {
                if self.try_punct('{') {
                    let elements = self.parse_const_elements('}')?;
                    self.expect_punct('>')?;
                    Ok(ConstAst::Aggregate(elements))
                } else {
                    Ok(ConstAst::Aggregate(self.parse_const_elements('>')?))
                }
            }
            other => Err(self.error(format!("expected constant of type {ty}, found {other:?}"))),
        }
    }

    fn parse_const_elements(&mut self, close: char) -> Result<Vec<Operand>, ParseError> {
        let mut elements = Vec::new();
        if self.try_punct(close) {
            return Ok(elements);
        }
        loop {
            elements.push(self.parse_typed_operand()?);
            if self.try_punct(close) {
                return Ok(elements);
            }
            self.expect_punct(',')?;
        }
    }

    fn parse_label_ref(&mut self) -> Result<String, ParseError> {
        self.expect_word("label")?;
        self.expect_local()
    }

    fn parse_inst(&mut self) -> Result<InstAst, ParseError> {
        let pos = self.here();
        let result = if matches!(self.peek(), Tok::Local(_)) && *self.peek_at(1) == Tok::Punct('=') {
            let name = self.expect_local()?;
            self.expect_punct('=')?;
            Some(name)
        } else {
            None
        };
        let opcode = match self.next() {
            Tok::Word(w) => w,
            other => return Err(error_at(pos, format!("expected instruction, found {other:?}"))),
        };
        let (op, result_ty) = match opcode.as_str() {
            "alloca" => {
                let ty = self.parse_type()?;
                let r = self.types.pointer_type(&ty);
                let ptr = self.type_result(r)?;
                (OpAst::Alloca(ty), Some(ptr))
            }
            "load" => {
                let ty = self.parse_type()?;
                self.expect_punct(',')?;
                let ptr = self.parse_typed_operand()?;
                (OpAst::Load(ty.clone(), ptr), Some(ty))
            }
            "store" => {
                let value = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let ptr = self.parse_typed_operand()?;
                (OpAst::Store(value, ptr), None)
            }
            "icmp" => {
                let pred = match self.next() {
                    Tok::Word(w) => IntPredicate::from_keyword(&w)
                        .ok_or_else(|| self.error(format!("unknown predicate {w}")))?,
                    other => return Err(self.error(format!("expected predicate, found {other:?}"))),
                };
                let lhs = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let rhs = self.parse_operand(&lhs.ty.clone())?;
                let i1 = self.types.i1();
                (OpAst::ICmp(pred, lhs, rhs), Some(i1))
            }
            "call" => {
                let call_conv = self.parse_call_conv()?;
                let ret = self.parse_type()?;
                let callee = self.expect_global()?;
                self.expect_punct('(')?;
                let mut args = Vec::new();
                if !self.try_punct(')') {
                    loop {
                        args.push(self.parse_typed_operand()?);
                        if self.try_punct(')') {
                            break;
                        }
                        self.expect_punct(',')?;
                    }
                }
                let result_ty = (!ret.is_void()).then(|| ret.clone());
                (
                    OpAst::Call {
                        call_conv,
                        ret,
                        callee,
                        args,
                    },
                    result_ty,
                )
            }
            "insertvalue" => {
                let aggregate = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let element = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let index = self.expect_index()?;
                let ty = aggregate.ty.clone();
                (OpAst::InsertValue(aggregate, element, index), Some(ty))
            }
            "extractvalue" => {
                let aggregate = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let index = self.expect_index()?;
                let field = aggregate
                    .ty
                    .struct_fields()
                    .and_then(|fields| fields.get(index as usize))
                    .cloned()
                    .ok_or_else(|| error_at(pos, format!("no field {index} in {}", aggregate.ty)))?;
                (OpAst::ExtractValue(aggregate, index), Some(field))
            }
            "insertelement" => {
                let vector = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let element = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let lane = self.parse_typed_operand()?;
                let ty = vector.ty.clone();
                (OpAst::InsertElement(vector, element, lane), Some(ty))
            }
            "extractelement" => {
                let vector = self.parse_typed_operand()?;
                self.expect_punct(',')?;
                let lane = self.parse_typed_operand()?;
                let elem = vector
                    .ty
                    .vector_parts()
                    .map(|(elem, _)| elem.clone())
                    .ok_or_else(|| error_at(pos, format!("extractelement from {}", vector.ty)))?;
                (OpAst::ExtractElement(vector, lane), Some(elem))
            }
            "ret" => {
                let ty = self.parse_type()?;
                if ty.is_void() {
                    (OpAst::Ret(None), None)
                } else {
                    (OpAst::Ret(Some(self.parse_operand(&ty)?)), None)
                }
            }
            "br" => {
                if matches!(self.peek(), Tok::Word(w) if w == "label") {
                    (OpAst::Br(self.parse_label_ref()?), None)
                } else {
                    let cond = self.parse_typed_operand()?;
                    self.expect_punct(',')?;
                    let then_dest = self.parse_label_ref()?;
                    self.expect_punct(',')?;
                    let else_dest = self.parse_label_ref()?;
                    (OpAst::CondBr(cond, then_dest, else_dest), None)
                }
            }
            "unreachable" => (OpAst::Unreachable, None),
            word => match BinaryOp::from_keyword(word) {
                Some(op) => {
                    let lhs = self.parse_typed_operand()?;
                    self.expect_punct(',')?;
                    let rhs = self.parse_operand(&lhs.ty.clone())?;
                    let ty = lhs.ty.clone();
                    (OpAst::Binary(op, lhs, rhs), Some(ty))
                }
                None => return Err(error_at(pos, format!("unknown instruction '{word}'"))),
            },
        };
        if result.is_some() && result_ty.is_none() {
            return Err(error_at(pos, format!("'{opcode}' does not produce a value")));
        }
        Ok(InstAst {
            result,
            result_ty,
            op,
            pos,
        })
    }
}

// ---------------------------------------------------------------------------
// Module construction (pass 2)
// ---------------------------------------------------------------------------

/// Whether `v` fits a `width`-bit integer read as either signed or unsigned.
fn literal_fits(v: i128, width: u32) -> bool {
    if width == 0 || width >= 128 {
        return true;
    }
    if v >= 0 {
        v as u128 <= u128::MAX >> (128 - width)
    } else {
        v >= -(1i128 << (width - 1))
    }
}

fn const_value(operand_ty: &Type, c: &ConstAst, pos: Pos) -> Result<Value, ParseError> {
    let built = match c {
        ConstAst::Int(v) => {
            if let Some(width) = operand_ty.int_width() {
                if !literal_fits(*v, width) {
                    return Err(error_at(pos, format!("constant {v} does not fit in {operand_ty}")));
                }
            }
            Value::const_int(operand_ty, *v)
        }
        ConstAst::Bool(b) => {
            if operand_ty.int_width() != Some(1) {
                return Err(error_at(pos, format!("boolean constant of type {operand_ty}")));
            }
            Value::const_int(operand_ty, i128::from(*b))
        }
        ConstAst::Undef => Value::undef(operand_ty),
        ConstAst::Zero => Value::zero(operand_ty),
        ConstAst::Aggregate(elements) => {
            let values = elements
                .iter()
                .map(|e| match &e.value {
                    OperandValue::Const(c) => const_value(&e.ty, c, e.pos),
                    _ => Err(error_at(e.pos, "aggregate constants may only contain constants")),
                })
                .collect::<Result<Vec<_>, _>>()?;
            Value::const_aggregate(operand_ty, &values)
        }
    };
    built.map_err(|e| error_at(pos, e.to_string()))
}

fn build_module(name: String, ast: ModuleAst) -> Result<Module, ParseError> {
    let mut module = Module::new(name);

    for global in &ast.globals {
        let id = match &global.init.value {
            OperandValue::Const(ConstAst::Zero) => module.add_global(&global.init.ty, &global.name),
            OperandValue::Const(c) => {
                let init = const_value(&global.init.ty, c, global.init.pos)?;
                module.add_global_with_initializer(&global.name, &init)
            }
            _ => {
                return Err(error_at(
                    global.init.pos,
                    "global initializer must be a constant",
                ))
            }
        }
        .map_err(|e| error_at(global.pos, e.to_string()))?;
        module
            .set_global_linkage(id, global.linkage)
            .map_err(|e| error_at(global.pos, e.to_string()))?;
    }

    let mut ids = Vec::with_capacity(ast.functions.len());
    for function in &ast.functions {
        let at = |e: crate::core::error::ConstructionError| error_at(function.pos, e.to_string());
        let id = module.add_function(&function.ty, &function.name).map_err(at)?;
        module.set_linkage(id, function.linkage).map_err(at)?;
        module.set_call_conv(id, function.call_conv).map_err(at)?;
        for attribute in &function.attributes {
            module.add_attribute(id, *attribute).map_err(at)?;
        }
        for (i, name) in function.param_names.iter().enumerate() {
            if let Some(name) = name {
                module.set_param_name(id, i, name).map_err(at)?;
            }
        }
        ids.push(id);
    }

    for (function, id) in ast.functions.iter().zip(ids) {
        if let Some(blocks) = &function.body {
            build_body(&mut module, id, function, blocks)?;
        }
    }
    Ok(module)
}

fn build_body(
    module: &mut Module,
    func: FuncId,
    function: &FunctionAst,
    blocks: &[BlockAst],
) -> Result<(), ParseError> {
    let mut labels = HashMap::new();
    let mut block_ids = Vec::with_capacity(blocks.len());
    for block in blocks {
        if labels.contains_key(block.label.as_str()) {
            return Err(error_at(block.pos, format!("redefinition of block %{}", block.label)));
        }
        let id = module
            .append_block(func, &block.label)
            .map_err(|e| error_at(block.pos, e.to_string()))?;
        labels.insert(block.label.as_str(), id);
        block_ids.push(id);
    }

    let mut locals: HashMap<String, Value> = HashMap::new();
    for (i, name) in function.param_names.iter().enumerate() {
        if let Some(name) = name {
            let value = module
                .param(func, i)
                .map_err(|e| error_at(function.pos, e.to_string()))?;
            if locals.insert(name.clone(), value).is_some() {
                return Err(error_at(function.pos, format!("redefinition of %{name}")));
            }
        }
    }
    let mut ordinal = 0u32;
    for block in blocks {
        if locals.contains_key(&block.label) {
            return Err(error_at(block.pos, format!("redefinition of %{}", block.label)));
        }
        for inst in &block.insts {
            if let (Some(name), Some(ty)) = (&inst.result, &inst.result_ty) {
                let value = Value::new(
                    ValueKind::Inst(InstId {
                        func,
                        index: ordinal,
                    }),
                    ty.clone(),
                );
                if locals.insert(name.clone(), value).is_some() {
                    return Err(error_at(inst.pos, format!("redefinition of %{name}")));
                }
            }
            ordinal += 1;
        }
    }

    let mut b = Builder::new(module);
    for (block, block_id) in blocks.iter().zip(block_ids) {
        b.position_at_end(block_id);
        for inst in &block.insts {
            emit_inst(&mut b, &locals, &labels, inst)?;
        }
    }
    Ok(())
}

fn resolve(b: &Builder<'_>, locals: &HashMap<String, Value>, operand: &Operand) -> Result<Value, ParseError> {
    let value = match &operand.value {
        OperandValue::Const(c) => return const_value(&operand.ty, c, operand.pos),
        OperandValue::Local(name) => locals
            .get(name)
            .cloned()
            .ok_or_else(|| error_at(operand.pos, format!("use of undefined value %{name}")))?,
        OperandValue::Global(name) => {
            let module = b.module();
            let found = match module.lookup_global(name) {
                Ok(id) => module.global_value(id),
                Err(_) => module
                    .lookup_function(name)
                    .and_then(|id| module.function_value(id)),
            };
            found.map_err(|_| error_at(operand.pos, format!("use of undefined symbol @{name}")))?
        }
    };
    if value.ty() != &operand.ty {
        return Err(error_at(
            operand.pos,
            format!("value has type {}, written as {}", value.ty(), operand.ty),
        ));
    }
    Ok(value)
}

fn emit_inst(
    b: &mut Builder<'_>,
    locals: &HashMap<String, Value>,
    labels: &HashMap<&str, crate::core::module::BlockId>,
    inst: &InstAst,
) -> Result<(), ParseError> {
    let pos = inst.pos;
    let name = inst.result.as_deref().unwrap_or("");
    let at = |e: crate::core::error::ConstructionError| error_at(pos, e.to_string());
    let block = |label: &str| {
        labels
            .get(label)
            .copied()
            .ok_or_else(|| error_at(pos, format!("use of undefined label %{label}")))
    };
    match &inst.op {
        OpAst::Alloca(ty) => {
            b.alloca(ty, name).map_err(at)?;
        }
        OpAst::Load(ty, ptr) => {
            let ptr = resolve(b, locals, ptr)?;
            if ptr.ty().pointee() != Some(ty) {
                return Err(error_at(pos, format!("load of {ty} through {}", ptr.ty())));
            }
            b.load(&ptr, name).map_err(at)?;
        }
        OpAst::Store(value, ptr) => {
            let value = resolve(b, locals, value)?;
            let ptr = resolve(b, locals, ptr)?;
            b.store(&value, &ptr).map_err(at)?;
        }
        OpAst::Binary(op, lhs, rhs) => {
            let lhs = resolve(b, locals, lhs)?;
            let rhs = resolve(b, locals, rhs)?;
            b.binary(*op, &lhs, &rhs, name).map_err(at)?;
        }
        OpAst::ICmp(pred, lhs, rhs) => {
            let lhs = resolve(b, locals, lhs)?;
            let rhs = resolve(b, locals, rhs)?;
            b.icmp(*pred, &lhs, &rhs, name).map_err(at)?;
        }
        OpAst::Call {
            call_conv,
            ret,
            callee,
            args,
        } => {
            let callee_id = b
                .module()
                .lookup_function(callee)
                .map_err(|_| error_at(pos, format!("call to undefined function @{callee}")))?;
            let declared = b
                .module()
                .function(callee_id)
                .map(|f| f.signature().ret.clone());
            if declared.as_ref() != Some(ret) {
                return Err(error_at(pos, format!("@{callee} does not return {ret}")));
            }
            let args = args
                .iter()
                .map(|arg| resolve(b, locals, arg))
                .collect::<Result<Vec<_>, _>>()?;
            b.call_with_conv(callee_id, &args, *call_conv, name).map_err(at)?;
        }
        OpAst::InsertValue(aggregate, element, index) => {
            let aggregate = resolve(b, locals, aggregate)?;
            let element = resolve(b, locals, element)?;
            b.insert_value(&aggregate, &element, *index, name).map_err(at)?;
        }
        OpAst::ExtractValue(aggregate, index) => {
            let aggregate = resolve(b, locals, aggregate)?;
            b.extract_value(&aggregate, *index, name).map_err(at)?;
        }
        OpAst::InsertElement(vector, element, lane) => {
            let vector = resolve(b, locals, vector)?;
            let element = resolve(b, locals, element)?;
            let lane = resolve(b, locals, lane)?;
            b.insert_element(&vector, &element, &lane, name).map_err(at)?;
        }
        OpAst::ExtractElement(vector, lane) => {
            let vector = resolve(b, locals, vector)?;
            let lane = resolve(b, locals, lane)?;
            b.extract_element(&vector, &lane, name).map_err(at)?;
        }
        OpAst::Ret(value) => match value {
            Some(value) => {
                let value = resolve(b, locals, value)?;
                b.ret(&value).map_err(at)?;
            }
            None => {
                b.ret_void().map_err(at)?;
            }
        },
        OpAst::Br(dest) => {
            b.br(block(dest)?).map_err(at)?;
        }
        OpAst::CondBr(cond, then_dest, else_dest) => {
            let cond = resolve(b, locals, cond)?;
            b.cond_br(&cond, block(then_dest)?, block(else_dest)?).map_err(at)?;
        }
        OpAst::Unreachable => {
            b.unreachable().map_err(at)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::print_module;

    const SAMPLE: &str = "\
; ModuleID = 'parsed'

@AAA = global i32 zeroinitializer
@V = internal global <4 x i32> <i32 1, i32 2, i32 3, i32 -4>

declare i32 @ext(i32, ...)

define cc 1023 i32 @foo2(i32 %a, i32* %b) noinline {
entry:
  %\"param 1\" = load i32, i32* %b
  %add = add i32 %a, %\"param 1\"
  store i32 %add, i32* @AAA
  %c = icmp slt i32 %add, 0
  br i1 %c, label %neg, label %done

neg:
  br label %done

done:
  %r = call i32 @ext(i32 %add, i64 7)
  ret i32 %r
}
";

    #[test]
    fn test_parse_sample() {
        let module = parse_module(SAMPLE).unwrap();
        assert_eq!(module.name(), "parsed");
        assert_eq!(module.globals().len(), 2);
        assert!(module.globals()[0].initializer().is_none());
        assert_eq!(module.globals()[1].linkage(), Linkage::Internal);

        let foo2 = module.named_function("foo2").unwrap();
        assert_eq!(foo2.call_conv(), CallConv::Stack);
        assert!(foo2.has_attribute(Attribute::NoInline));
        assert_eq!(foo2.blocks().len(), 3);
        assert_eq!(foo2.param_name(1), Some("b"));
        assert!(module.named_function("ext").unwrap().is_declaration());
    }

    #[test]
    fn test_print_parse_print_is_stable() {
        let module = parse_module(SAMPLE).unwrap();
        let printed = print_module(&module);
        let reparsed = parse_module(&printed).unwrap();
        assert_eq!(print_module(&reparsed), printed);
    }

    #[test]
    fn test_forward_reference_across_blocks() {
        let text = "\
define i32 @f() {
entry:
  br label %def

use:
  ret i32 %x

def:
  %x = add i32 1, 2
  br label %use
}
";
        let module = parse_module(text).unwrap();
        assert_eq!(module.named_function("f").unwrap().inst_count(), 4);
    }

    #[test]
    fn test_errors_carry_position() {
        let err = parse_module("define i32 @f() {\nentry:\n  ret i32 %nope\n}\n").unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("%nope"));

        let err = parse_module("define i32 @f() {\nentry:\n  frob i32 1\n}\n").unwrap_err();
        assert!(err.message.contains("frob"));

        let err = parse_module(
            "define <2 x i32> @f() {\nentry:\n  %v = insertelement <2 x i32> undef, i32 1, i32 2\n  ret <2 x i32> %v\n}\n",
        )
        .unwrap_err();
        assert_eq!(err.line, 3);

        assert!(parse_module("@g = global i0 0\n").is_err());
    }

    #[test]
    fn test_out_of_range_literals_are_rejected() {
        let lane = |index: &str| {
            format!(
                "define <4 x i32> @f() {{\nentry:\n  %v = insertelement <4 x i32> zeroinitializer, i32 1, {index}\n  ret <4 x i32> %v\n}}\n"
            )
        };
        let err = parse_module(&lane("i32 4294967296")).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("4294967296"));
        assert!(parse_module(&lane("i32 3")).is_ok());

        assert!(parse_module("@g = global i8 256\n").is_err());
        assert!(parse_module("@g = global i8 -129\n").is_err());
        assert!(parse_module("@g = global i8 255\n").is_ok());
        assert!(parse_module("@g = global i8 -128\n").is_ok());
        assert!(parse_module("@g = global <2 x i8> <i8 1, i8 300>\n").is_err());
    }

    #[test]
    fn test_literal_fits() {
        assert!(literal_fits(1, 1));
        assert!(literal_fits(-1, 1));
        assert!(!literal_fits(2, 1));
        assert!(literal_fits(u32::MAX as i128, 32));
        assert!(!literal_fits(1 << 32, 32));
        assert!(literal_fits(i128::MIN, 128));
        assert!(literal_fits(i128::MAX, 127));
        assert!(!literal_fits(-(1 << 126) - 1, 127));
    }
}
