// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A hand-written parser for the textual-IR subset that QIR modules use.
//!
//! The grammar covered here is deliberately the executor's supported set:
//! opaque type declarations, global byte-string constants, attribute groups,
//! `declare`/`define`, and the instruction opcodes listed in the module
//! loader contract. Metadata lines and call-site annotations are skipped.
//! Anything else is rejected with an unsupported-feature error rather than
//! silently ignored.

#[cfg(test)]
mod tests;

use crate::instruction::{BinaryOp, CastOp, Constant, Instruction, Operand, Terminator};
use crate::module::{Attribute, BasicBlock, Declaration, Function, Module, Parameter};
use crate::name::Name;
use crate::predicates::{FPPredicate, IntPredicate};
use crate::types::Ty;
use crate::Error;
use std::rc::Rc;

/// Parses a complete module from textual IR.
///
/// # Errors
/// Returns [`Error::Parse`] for syntax errors and [`Error::Unsupported`] for
/// constructs outside the supported subset.
pub fn module(name: &str, source: &str) -> Result<Module, Error> {
    let mut parser = Parser::new(source);
    let mut pending_groups: Vec<Vec<u32>> = Vec::new();

    loop {
        parser.skip_trivia();
        if parser.at_eof() {
            break;
        }
        match parser.peek_byte() {
            b'%' => parser.parse_type_decl()?,
            b'@' => parser.parse_global()?,
            b'!' => parser.skip_line(),
            _ => {
                let keyword = parser.parse_word()?;
                match keyword {
                    "declare" => parser.parse_declare()?,
                    "define" => {
                        let groups = parser.parse_define()?;
                        pending_groups.push(groups);
                    }
                    "attributes" => parser.parse_attribute_group()?,
                    "source_filename" | "target" => parser.skip_line(),
                    other => {
                        return Err(parser.unsupported(format!("top-level construct `{other}`")))
                    }
                }
            }
        }
    }

    // Attribute groups may be declared after the functions that reference
    // them, so resolution happens once the whole module is read.
    for (func, groups) in parser.module.functions.iter_mut().zip(&pending_groups) {
        for group in groups {
            if let Some(attrs) = parser.module.attribute_groups.get(group) {
                func.attributes.extend(attrs.iter().cloned());
            }
        }
    }

    parser.module.name = name.to_string();
    Ok(parser.module)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
    module: Module,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
            module: Module::default(),
        }
    }

    fn error(&self, msg: impl Into<String>) -> Error {
        Error::Parse(msg.into(), self.line)
    }

    fn unsupported(&self, what: impl Into<String>) -> Error {
        Error::Unsupported(what.into(), self.line)
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek_byte(&self) -> u8 {
        if self.at_eof() {
            0
        } else {
            self.src[self.pos]
        }
    }

    fn bump(&mut self) -> u8 {
        let b = self.peek_byte();
        if b == b'\n' {
            self.line += 1;
        }
        self.pos += 1;
        b
    }

    /// Skips spaces and tabs on the current line.
    fn skip_spaces(&mut self) {
        while matches!(self.peek_byte(), b' ' | b'\t' | b'\r') {
            self.pos += 1;
        }
    }

    /// Skips whitespace, newlines, and `;` comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek_byte() {
                b' ' | b'\t' | b'\r' | b'\n' => {
                    self.bump();
                }
                b';' => self.skip_line(),
                _ => break,
            }
        }
    }

    /// Skips to the start of the next line.
    fn skip_line(&mut self) {
        while !self.at_eof() && self.bump() != b'\n' {}
    }

    fn eat_char(&mut self, c: u8) -> bool {
        self.skip_spaces();
        if self.peek_byte() == c {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect_char(&mut self, c: u8) -> Result<(), Error> {
        if self.eat_char(c) {
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", char::from(c))))
        }
    }

    fn is_word_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'$' | b'-')
    }

    fn parse_word(&mut self) -> Result<&'a str, Error> {
        self.skip_spaces();
        let start = self.pos;
        while Self::is_word_byte(self.peek_byte()) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error(format!(
                "expected identifier, found `{}`",
                char::from(self.peek_byte())
            )));
        }
        std::str::from_utf8(&self.src[start..self.pos]).map_err(|_| self.error("invalid UTF-8"))
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        self.skip_spaces();
        let end = self.pos + kw.len();
        if end <= self.src.len()
            && &self.src[self.pos..end] == kw.as_bytes()
            && !Self::is_word_byte(*self.src.get(end).unwrap_or(&b' '))
        {
            self.pos = end;
            true
        } else {
            false
        }
    }

    /// Parses a `"..."` string (no escape handling; used for names and
    /// attribute strings, which QIR emits unescaped).
    fn parse_quoted(&mut self) -> Result<&'a str, Error> {
        self.expect_char(b'"')?;
        let start = self.pos;
        while !self.at_eof() && self.peek_byte() != b'"' {
            self.bump();
        }
        let s = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid UTF-8"))?;
        self.expect_char(b'"')?;
        Ok(s)
    }

    /// Parses the identifier after a `%` or `@` sigil (already consumed).
    fn parse_sigil_name(&mut self) -> Result<Name, Error> {
        if self.peek_byte() == b'"' {
            return Ok(Name::named(self.parse_quoted()?));
        }
        let word = self.parse_word()?;
        match word.parse::<u32>() {
            Ok(n) => Ok(Name::Numbered(n)),
            Err(_) => Ok(Name::named(word)),
        }
    }

    fn parse_local_name(&mut self) -> Result<Name, Error> {
        self.expect_char(b'%')?;
        self.parse_sigil_name()
    }

    fn parse_global_name(&mut self) -> Result<Rc<str>, Error> {
        self.expect_char(b'@')?;
        match self.parse_sigil_name()? {
            Name::Named(s) => Ok(s),
            Name::Numbered(n) => Ok(n.to_string().into()),
        }
    }

    fn parse_int(&mut self) -> Result<i64, Error> {
        self.skip_spaces();
        let negative = self.eat_char(b'-');
        let word = self.parse_word()?;
        let magnitude: u64 = word
            .parse()
            .map_err(|_| self.error(format!("invalid integer `{word}`")))?;
        #[allow(clippy::cast_possible_wrap)]
        let value = if negative {
            (magnitude as i64).wrapping_neg()
        } else {
            magnitude as i64
        };
        Ok(value)
    }

    // Types

    fn parse_type(&mut self) -> Result<Ty, Error> {
        self.skip_spaces();
        let mut ty = match self.peek_byte() {
            b'%' => {
                self.bump();
                match self.parse_sigil_name()? {
                    Name::Named(s) => Ty::Opaque(s),
                    Name::Numbered(n) => Ty::Opaque(n.to_string().into()),
                }
            }
            b'[' => {
                self.bump();
                let size = u64::try_from(self.parse_int()?)
                    .map_err(|_| self.error("negative array size"))?;
                if !self.eat_keyword("x") {
                    return Err(self.error("expected `x` in array type"));
                }
                let element = self.parse_type()?;
                self.expect_char(b']')?;
                Ty::Array {
                    size,
                    element: Rc::new(element),
                }
            }
            b'{' => {
                self.bump();
                let mut fields = Vec::new();
                if !self.eat_char(b'}') {
                    loop {
                        fields.push(self.parse_type()?);
                        if !self.eat_char(b',') {
                            break;
                        }
                    }
                    self.expect_char(b'}')?;
                }
                Ty::Struct(fields)
            }
            _ => {
                let word = self.parse_word()?;
                if word == "void" {
                    Ty::Void
                } else if word == "double" {
                    Ty::Double
                } else if word == "ptr" {
                    // Opaque-pointer IR; handle kinds are recovered from the
                    // intrinsic signatures at execution time.
                    Ty::Opaque("ptr".into())
                } else if let Some(width) = word.strip_prefix('i') {
                    let width: u32 = width
                        .parse()
                        .map_err(|_| self.error(format!("invalid type `{word}`")))?;
                    Ty::Int { width }
                } else {
                    return Err(self.unsupported(format!("type `{word}`")));
                }
            }
        };
        while self.eat_char(b'*') {
            ty = Ty::pointer_to(ty);
        }
        Ok(ty)
    }

    // Operands

    fn parse_operand(&mut self, ty: &Ty) -> Result<Operand, Error> {
        self.skip_spaces();
        match self.peek_byte() {
            b'%' => {
                let name = self.parse_local_name()?;
                Ok(Operand::Local {
                    name,
                    ty: ty.clone(),
                })
            }
            b'@' => {
                let name = self.parse_global_name()?;
                Ok(Operand::Constant(Constant::Global {
                    name,
                    ty: ty.clone(),
                }))
            }
            _ => Ok(Operand::Constant(self.parse_constant(ty)?)),
        }
    }

    fn parse_constant(&mut self, ty: &Ty) -> Result<Constant, Error> {
        self.skip_spaces();
        if self.eat_keyword("null") {
            return Ok(Constant::Null(ty.clone()));
        }
        if self.eat_keyword("undef") {
            return Ok(Constant::Undef(ty.clone()));
        }
        if self.eat_keyword("true") {
            return Ok(Constant::Int { width: 1, value: 1 });
        }
        if self.eat_keyword("false") {
            return Ok(Constant::Int { width: 1, value: 0 });
        }
        if self.eat_keyword("inttoptr") {
            self.expect_char(b'(')?;
            let int_ty = self.parse_type()?;
            let Ty::Int { .. } = int_ty else {
                return Err(self.error("expected integer type in inttoptr"));
            };
            let value = self.parse_int()?;
            if !self.eat_keyword("to") {
                return Err(self.error("expected `to` in inttoptr"));
            }
            let target = self.parse_type()?;
            self.expect_char(b')')?;
            return Ok(Constant::IntToPtr { value, ty: target });
        }
        if self.eat_keyword("getelementptr") {
            // Constant geps only appear for global byte-string references;
            // fold them down to the base global.
            let _ = self.eat_keyword("inbounds");
            self.expect_char(b'(')?;
            let _ = self.parse_type()?;
            self.expect_char(b',')?;
            let _ = self.parse_type()?;
            let name = self.parse_global_name()?;
            while self.eat_char(b',') {
                let idx_ty = self.parse_type()?;
                let _ = self.parse_operand(&idx_ty)?;
            }
            self.expect_char(b')')?;
            return Ok(Constant::Global {
                name,
                ty: ty.clone(),
            });
        }

        match ty {
            Ty::Int { width } => {
                let value = self.parse_int()?;
                Ok(Constant::Int {
                    width: *width,
                    value,
                })
            }
            Ty::Double => self.parse_double().map(Constant::Double),
            _ => Err(self.error(format!("expected constant of type {ty}"))),
        }
    }

    fn parse_double(&mut self) -> Result<f64, Error> {
        self.skip_spaces();
        let negative = self.eat_char(b'-');
        let start = self.pos;
        while matches!(self.peek_byte(), b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' | b'.' | b'x' | b'e' | b'E' | b'+' | b'-')
        {
            // A `-` only continues the literal directly after an exponent.
            if self.peek_byte() == b'-'
                && !matches!(self.src.get(self.pos.wrapping_sub(1)), Some(b'e' | b'E'))
            {
                break;
            }
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| self.error("invalid UTF-8"))?;
        let value = if let Some(hex) = text.strip_prefix("0x") {
            // LLVM prints doubles as their IEEE-754 bit pattern.
            let bits = u64::from_str_radix(hex, 16)
                .map_err(|_| self.error(format!("invalid float literal `{text}`")))?;
            f64::from_bits(bits)
        } else {
            text.parse::<f64>()
                .map_err(|_| self.error(format!("invalid float literal `{text}`")))?
        };
        Ok(if negative { -value } else { value })
    }

    // Top-level constructs

    /// `%Name = type opaque` or `%Name = type { ... }`. The executor treats
    /// all named types as opaque handles, so the body is validated and
    /// discarded.
    fn parse_type_decl(&mut self) -> Result<(), Error> {
        let _ = self.parse_local_name()?;
        self.expect_char(b'=')?;
        if !self.eat_keyword("type") {
            return Err(self.error("expected `type`"));
        }
        if self.eat_keyword("opaque") {
            return Ok(());
        }
        let _ = self.parse_type()?;
        Ok(())
    }

    /// `@name = <qualifiers> constant [N x i8] c"..."` and friends. Only
    /// byte-string initializers are retained (output labels, messages).
    fn parse_global(&mut self) -> Result<(), Error> {
        let name = self.parse_global_name()?;
        self.expect_char(b'=')?;
        loop {
            self.skip_spaces();
            if !self.peek_byte().is_ascii_alphabetic() {
                break;
            }
            let save = self.pos;
            let word = self.parse_word()?;
            match word {
                "private" | "internal" | "external" | "linkonce" | "linkonce_odr" | "weak"
                | "weak_odr" | "common" | "appending" | "dso_local" | "dso_preemptable"
                | "unnamed_addr" | "local_unnamed_addr" | "global" | "constant" => {}
                _ => {
                    self.pos = save;
                    break;
                }
            }
        }
        let ty = self.parse_type()?;
        self.skip_spaces();
        if self.eat_char(b'c') {
            let bytes = self.parse_cstring()?;
            self.module.globals.insert(name, bytes);
        } else if self.eat_keyword("zeroinitializer") {
            let size = match ty {
                Ty::Array { size, .. } => size,
                _ => 0,
            };
            self.module
                .globals
                .insert(name, vec![0; usize::try_from(size).unwrap_or(0)]);
        }
        self.skip_line();
        Ok(())
    }

    fn parse_cstring(&mut self) -> Result<Vec<u8>, Error> {
        self.expect_char(b'"')?;
        let mut bytes = Vec::new();
        loop {
            match self.bump() {
                b'"' => break,
                0 => return Err(self.error("unterminated string constant")),
                b'\\' => {
                    let hi = self.bump();
                    if hi == b'\\' {
                        bytes.push(b'\\');
                    } else {
                        let lo = self.bump();
                        let hex = [hi, lo];
                        let hex = std::str::from_utf8(&hex)
                            .map_err(|_| self.error("invalid escape"))?;
                        let byte = u8::from_str_radix(hex, 16)
                            .map_err(|_| self.error("invalid escape"))?;
                        bytes.push(byte);
                    }
                }
                b => bytes.push(b),
            }
        }
        Ok(bytes)
    }

    fn parse_attribute_group(&mut self) -> Result<(), Error> {
        self.expect_char(b'#')?;
        let id = u32::try_from(self.parse_int()?).map_err(|_| self.error("invalid group id"))?;
        self.expect_char(b'=')?;
        self.expect_char(b'{')?;
        let mut attrs = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek_byte() {
                b'}' => {
                    self.bump();
                    break;
                }
                b'"' => {
                    let key: Rc<str> = self.parse_quoted()?.into();
                    if self.eat_char(b'=') {
                        let value: Rc<str> = self.parse_quoted()?.into();
                        attrs.push(Attribute::KeyValue(key, value));
                    } else {
                        attrs.push(Attribute::Flag(key));
                    }
                }
                _ => {
                    // Bare keyword attributes (nounwind, readnone, ...) and
                    // their value forms are irrelevant to execution.
                    let _ = self.parse_word()?;
                    if self.eat_char(b'=') {
                        let _ = self.parse_word()?;
                    } else if self.eat_char(b'(') {
                        // e.g. memory(none), uwtable(sync)
                        while !self.at_eof() && self.peek_byte() != b')' {
                            self.bump();
                        }
                        let _ = self.eat_char(b')');
                    }
                }
            }
        }
        self.module.attribute_groups.insert(id, attrs);
        Ok(())
    }

    fn parse_declare(&mut self) -> Result<(), Error> {
        self.skip_ext_keywords();
        let ret_ty = self.parse_type()?;
        let name = self.parse_global_name()?;
        self.expect_char(b'(')?;
        let mut param_tys = Vec::new();
        if !self.eat_char(b')') {
            loop {
                self.skip_spaces();
                if self.eat_char(b'.') {
                    return Err(self.unsupported(format!("variadic declaration of @{name}")));
                }
                param_tys.push(self.parse_type()?);
                self.skip_param_attrs();
                if !self.eat_char(b',') {
                    break;
                }
            }
            self.expect_char(b')')?;
        }
        self.skip_line();
        self.module.declarations.push(Declaration {
            name,
            ret_ty,
            param_tys,
        });
        Ok(())
    }

    fn skip_ext_keywords(&mut self) {
        loop {
            let save = self.pos;
            self.skip_spaces();
            if !self.peek_byte().is_ascii_alphabetic() {
                break;
            }
            let Ok(word) = self.parse_word() else {
                self.pos = save;
                break;
            };
            match word {
                "private" | "internal" | "external" | "linkonce" | "linkonce_odr" | "weak"
                | "weak_odr" | "dso_local" | "dso_preemptable" | "hidden" | "protected"
                | "default" | "fastcc" | "ccc" | "tail" | "musttail" | "notail"
                | "unnamed_addr" | "local_unnamed_addr" => {}
                _ => {
                    self.pos = save;
                    break;
                }
            }
        }
    }

    fn skip_param_attrs(&mut self) {
        loop {
            let save = self.pos;
            self.skip_spaces();
            if !self.peek_byte().is_ascii_alphabetic() {
                break;
            }
            let Ok(word) = self.parse_word() else {
                self.pos = save;
                break;
            };
            match word {
                "nocapture" | "readonly" | "writeonly" | "readnone" | "nonnull" | "noalias"
                | "nofree" | "noundef" | "signext" | "zeroext" | "immarg" | "returned"
                | "sret" | "align" => {
                    if word == "align" {
                        let _ = self.parse_int();
                    }
                }
                _ => {
                    self.pos = save;
                    break;
                }
            }
        }
    }

    /// Parses a `define` body; returns the attribute-group ids it references.
    fn parse_define(&mut self) -> Result<Vec<u32>, Error> {
        self.skip_ext_keywords();
        let ret_ty = self.parse_type()?;
        let name = self.parse_global_name()?;
        self.expect_char(b'(')?;
        let mut params = Vec::new();
        if !self.eat_char(b')') {
            loop {
                let ty = self.parse_type()?;
                self.skip_param_attrs();
                self.skip_spaces();
                let param_name = if self.peek_byte() == b'%' {
                    self.parse_local_name()?
                } else {
                    Name::Numbered(u32::try_from(params.len()).map_err(|_| {
                        self.error("too many parameters")
                    })?)
                };
                params.push(Parameter {
                    name: param_name,
                    ty,
                });
                if !self.eat_char(b',') {
                    break;
                }
            }
            self.expect_char(b')')?;
        }

        // Function-level attributes: group references and inline strings.
        let mut groups = Vec::new();
        let mut inline_attrs = Vec::new();
        loop {
            self.skip_spaces();
            match self.peek_byte() {
                b'#' => {
                    self.bump();
                    let id = u32::try_from(self.parse_int()?)
                        .map_err(|_| self.error("invalid group id"))?;
                    groups.push(id);
                }
                b'"' => {
                    let key: Rc<str> = self.parse_quoted()?.into();
                    if self.eat_char(b'=') {
                        let value: Rc<str> = self.parse_quoted()?.into();
                        inline_attrs.push(Attribute::KeyValue(key, value));
                    } else {
                        inline_attrs.push(Attribute::Flag(key));
                    }
                }
                b'{' => break,
                _ => {
                    // The header always ends with `{`; anything else here
                    // (keyword attributes, metadata attachments) is skipped.
                    if self.at_eof() {
                        break;
                    }
                    self.bump();
                }
            }
        }
        self.expect_char(b'{')?;

        let blocks = self.parse_blocks()?;
        self.expect_char(b'}')?;

        self.module.functions.push(Function {
            name,
            ret_ty,
            params,
            blocks,
            attributes: inline_attrs,
        });
        Ok(groups)
    }

    fn parse_blocks(&mut self) -> Result<Vec<BasicBlock>, Error> {
        let mut blocks = Vec::new();
        let mut current_name = None;
        let mut instructions = Vec::new();
        loop {
            self.skip_trivia();
            if self.peek_byte() == b'}' {
                if current_name.is_some() || !instructions.is_empty() {
                    return Err(self.error("block is missing a terminator"));
                }
                break;
            }
            if let Some(label) = self.try_parse_label() {
                if current_name.is_some() || !instructions.is_empty() {
                    return Err(self.error("block is missing a terminator"));
                }
                current_name = Some(label);
                continue;
            }
            match self.parse_instruction()? {
                Parsed::Instruction(inst) => instructions.push(inst),
                Parsed::Terminator(term) => {
                    let name = current_name
                        .take()
                        .unwrap_or_else(|| Name::named("entry"));
                    blocks.push(BasicBlock {
                        name,
                        instructions: std::mem::take(&mut instructions),
                        terminator: term,
                    });
                }
            }
        }
        if blocks.is_empty() {
            return Err(self.error("function has no blocks"));
        }
        Ok(blocks)
    }

    /// Consumes `label:` if the upcoming token is one.
    fn try_parse_label(&mut self) -> Option<Name> {
        let save = (self.pos, self.line);
        self.skip_spaces();
        let start = self.pos;
        while Self::is_word_byte(self.peek_byte()) {
            self.pos += 1;
        }
        if start != self.pos && self.peek_byte() == b':' {
            let word = std::str::from_utf8(&self.src[start..self.pos]).ok();
            self.pos += 1;
            if let Some(word) = word {
                return Some(match word.parse::<u32>() {
                    Ok(n) => Name::Numbered(n),
                    Err(_) => Name::named(word),
                });
            }
        }
        (self.pos, self.line) = save;
        None
    }

    fn parse_instruction(&mut self) -> Result<Parsed, Error> {
        self.skip_trivia();
        let dest = if self.peek_byte() == b'%' {
            let name = self.parse_local_name()?;
            self.expect_char(b'=')?;
            Some(name)
        } else {
            None
        };
        let opcode = self.parse_word()?;
        let parsed = self.parse_opcode(opcode, dest)?;
        // Instructions are line-oriented; trailing call-site attributes and
        // metadata are irrelevant to execution.
        self.skip_to_line_end();
        Ok(parsed)
    }

    fn skip_to_line_end(&mut self) {
        while !self.at_eof() && !matches!(self.peek_byte(), b'\n' | b'}') {
            if self.peek_byte() == b';' {
                self.skip_line();
                return;
            }
            self.bump();
        }
    }

    #[allow(clippy::too_many_lines)]
    fn parse_opcode(&mut self, opcode: &str, dest: Option<Name>) -> Result<Parsed, Error> {
        let binary = |op| Some(op);
        let bin_op = match opcode {
            "add" => binary(BinaryOp::Add),
            "sub" => binary(BinaryOp::Sub),
            "mul" => binary(BinaryOp::Mul),
            "sdiv" => binary(BinaryOp::SDiv),
            "udiv" => binary(BinaryOp::UDiv),
            "srem" => binary(BinaryOp::SRem),
            "urem" => binary(BinaryOp::URem),
            "and" => binary(BinaryOp::And),
            "or" => binary(BinaryOp::Or),
            "xor" => binary(BinaryOp::Xor),
            "shl" => binary(BinaryOp::Shl),
            "lshr" => binary(BinaryOp::LShr),
            "ashr" => binary(BinaryOp::AShr),
            "fadd" => binary(BinaryOp::FAdd),
            "fsub" => binary(BinaryOp::FSub),
            "fmul" => binary(BinaryOp::FMul),
            "fdiv" => binary(BinaryOp::FDiv),
            _ => None,
        };
        if let Some(op) = bin_op {
            while self.eat_keyword("nuw")
                || self.eat_keyword("nsw")
                || self.eat_keyword("exact")
                || self.eat_keyword("fast")
                || self.eat_keyword("nnan")
                || self.eat_keyword("ninf")
            {}
            let ty = self.parse_type()?;
            let lhs = self.parse_operand(&ty)?;
            self.expect_char(b',')?;
            let rhs = self.parse_operand(&ty)?;
            return Ok(Parsed::Instruction(Instruction::Binary {
                op,
                lhs,
                rhs,
                dest: self.required_dest(dest)?,
            }));
        }

        let cast_op = match opcode {
            "zext" => Some(CastOp::ZExt),
            "sext" => Some(CastOp::SExt),
            "trunc" => Some(CastOp::Trunc),
            "bitcast" => Some(CastOp::BitCast),
            "inttoptr" => Some(CastOp::IntToPtr),
            "ptrtoint" => Some(CastOp::PtrToInt),
            "fptosi" => Some(CastOp::FPToSI),
            "sitofp" => Some(CastOp::SIToFP),
            _ => None,
        };
        if let Some(op) = cast_op {
            let from = self.parse_type()?;
            let operand = self.parse_operand(&from)?;
            if !self.eat_keyword("to") {
                return Err(self.error("expected `to` in cast"));
            }
            let to = self.parse_type()?;
            return Ok(Parsed::Instruction(Instruction::Cast {
                op,
                operand,
                to,
                dest: self.required_dest(dest)?,
            }));
        }

        match opcode {
            "icmp" => {
                let pred = self.parse_int_predicate()?;
                let ty = self.parse_type()?;
                let lhs = self.parse_operand(&ty)?;
                self.expect_char(b',')?;
                let rhs = self.parse_operand(&ty)?;
                Ok(Parsed::Instruction(Instruction::ICmp {
                    pred,
                    lhs,
                    rhs,
                    dest: self.required_dest(dest)?,
                }))
            }
            "fcmp" => {
                let pred = self.parse_fp_predicate()?;
                let ty = self.parse_type()?;
                let lhs = self.parse_operand(&ty)?;
                self.expect_char(b',')?;
                let rhs = self.parse_operand(&ty)?;
                Ok(Parsed::Instruction(Instruction::FCmp {
                    pred,
                    lhs,
                    rhs,
                    dest: self.required_dest(dest)?,
                }))
            }
            "phi" => {
                let ty = self.parse_type()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect_char(b'[')?;
                    let value = self.parse_operand(&ty)?;
                    self.expect_char(b',')?;
                    let pred = self.parse_local_name()?;
                    self.expect_char(b']')?;
                    incoming.push((value, pred));
                    if !self.eat_char(b',') {
                        break;
                    }
                }
                Ok(Parsed::Instruction(Instruction::Phi {
                    ty,
                    incoming,
                    dest: self.required_dest(dest)?,
                }))
            }
            "select" => {
                let cond_ty = self.parse_type()?;
                let cond = self.parse_operand(&cond_ty)?;
                self.expect_char(b',')?;
                let ty = self.parse_type()?;
                let if_true = self.parse_operand(&ty)?;
                self.expect_char(b',')?;
                let ty = self.parse_type()?;
                let if_false = self.parse_operand(&ty)?;
                Ok(Parsed::Instruction(Instruction::Select {
                    cond,
                    if_true,
                    if_false,
                    dest: self.required_dest(dest)?,
                }))
            }
            "tail" | "musttail" | "notail" => {
                if !self.eat_keyword("call") {
                    return Err(self.error("expected `call`"));
                }
                self.parse_call(dest)
            }
            "call" => self.parse_call(dest),
            "getelementptr" => {
                let _ = self.eat_keyword("inbounds");
                let _pointee = self.parse_type()?;
                self.expect_char(b',')?;
                let base_ty = self.parse_type()?;
                let base = self.parse_operand(&base_ty)?;
                let mut indices = Vec::new();
                while self.eat_char(b',') {
                    let idx_ty = self.parse_type()?;
                    indices.push(self.parse_operand(&idx_ty)?);
                }
                Ok(Parsed::Instruction(Instruction::GetElementPtr {
                    base,
                    indices,
                    dest: self.required_dest(dest)?,
                }))
            }
            "alloca" => {
                let ty = self.parse_type()?;
                Ok(Parsed::Instruction(Instruction::Alloca {
                    ty,
                    dest: self.required_dest(dest)?,
                }))
            }
            "load" => {
                let ty = self.parse_type()?;
                self.expect_char(b',')?;
                let ptr_ty = self.parse_type()?;
                let ptr = self.parse_operand(&ptr_ty)?;
                Ok(Parsed::Instruction(Instruction::Load {
                    ty,
                    ptr,
                    dest: self.required_dest(dest)?,
                }))
            }
            "store" => {
                let value_ty = self.parse_type()?;
                let value = self.parse_operand(&value_ty)?;
                self.expect_char(b',')?;
                let ptr_ty = self.parse_type()?;
                let ptr = self.parse_operand(&ptr_ty)?;
                Ok(Parsed::Instruction(Instruction::Store { value, ptr }))
            }
            "ret" => {
                let ty = self.parse_type()?;
                if ty == Ty::Void {
                    Ok(Parsed::Terminator(Terminator::Ret(None)))
                } else {
                    let value = self.parse_operand(&ty)?;
                    Ok(Parsed::Terminator(Terminator::Ret(Some(value))))
                }
            }
            "br" => {
                if self.eat_keyword("label") {
                    let dest = self.parse_local_name()?;
                    Ok(Parsed::Terminator(Terminator::Br { dest }))
                } else {
                    let cond_ty = self.parse_type()?;
                    let cond = self.parse_operand(&cond_ty)?;
                    self.expect_char(b',')?;
                    if !self.eat_keyword("label") {
                        return Err(self.error("expected `label`"));
                    }
                    let if_true = self.parse_local_name()?;
                    self.expect_char(b',')?;
                    if !self.eat_keyword("label") {
                        return Err(self.error("expected `label`"));
                    }
                    let if_false = self.parse_local_name()?;
                    Ok(Parsed::Terminator(Terminator::CondBr {
                        cond,
                        if_true,
                        if_false,
                    }))
                }
            }
            "unreachable" => Ok(Parsed::Terminator(Terminator::Unreachable)),
            other => Err(self.unsupported(format!("opcode `{other}`"))),
        }
    }

    fn parse_call(&mut self, dest: Option<Name>) -> Result<Parsed, Error> {
        while self.eat_keyword("fastcc")
            || self.eat_keyword("ccc")
            || self.eat_keyword("fast")
            || self.eat_keyword("nnan")
            || self.eat_keyword("ninf")
        {}
        let ret_ty = self.parse_type()?;
        self.skip_spaces();
        if self.peek_byte() == b'(' {
            return Err(self.unsupported("indirect or variadic call"));
        }
        let callee = self.parse_global_name()?;
        self.expect_char(b'(')?;
        let mut args = Vec::new();
        if !self.eat_char(b')') {
            loop {
                let ty = self.parse_type()?;
                self.skip_param_attrs();
                args.push(self.parse_operand(&ty)?);
                if !self.eat_char(b',') {
                    break;
                }
            }
            self.expect_char(b')')?;
        }
        let dest = if ret_ty == Ty::Void { None } else { dest };
        Ok(Parsed::Instruction(Instruction::Call {
            callee,
            ret_ty,
            args,
            dest,
        }))
    }

    fn required_dest(&self, dest: Option<Name>) -> Result<Name, Error> {
        dest.ok_or_else(|| self.error("instruction requires a result name"))
    }

    fn parse_int_predicate(&mut self) -> Result<IntPredicate, Error> {
        let word = self.parse_word()?;
        Ok(match word {
            "eq" => IntPredicate::EQ,
            "ne" => IntPredicate::NE,
            "ugt" => IntPredicate::UGT,
            "uge" => IntPredicate::UGE,
            "ult" => IntPredicate::ULT,
            "ule" => IntPredicate::ULE,
            "sgt" => IntPredicate::SGT,
            "sge" => IntPredicate::SGE,
            "slt" => IntPredicate::SLT,
            "sle" => IntPredicate::SLE,
            other => return Err(self.error(format!("invalid icmp predicate `{other}`"))),
        })
    }

    fn parse_fp_predicate(&mut self) -> Result<FPPredicate, Error> {
        let word = self.parse_word()?;
        Ok(match word {
            "false" => FPPredicate::False,
            "oeq" => FPPredicate::OEQ,
            "ogt" => FPPredicate::OGT,
            "oge" => FPPredicate::OGE,
            "olt" => FPPredicate::OLT,
            "ole" => FPPredicate::OLE,
            "one" => FPPredicate::ONE,
            "ord" => FPPredicate::ORD,
            "uno" => FPPredicate::UNO,
            "ueq" => FPPredicate::UEQ,
            "ugt" => FPPredicate::UGT,
            "uge" => FPPredicate::UGE,
            "ult" => FPPredicate::ULT,
            "ule" => FPPredicate::ULE,
            "une" => FPPredicate::UNE,
            "true" => FPPredicate::True,
            other => return Err(self.error(format!("invalid fcmp predicate `{other}`"))),
        })
    }
}

enum Parsed {
    Instruction(Instruction),
    Terminator(Terminator),
}
