// This module provides x86-64 instruction encoding on top of iced-x86's CodeAssembler. X64Encoder
// converts AsmReg register references into concrete iced registers of the requested width and
// emits the small instruction vocabulary the frame-slot code generator needs: sized loads and
// stores relative to a base register (with zero or sign extension for narrow integers), ALU
// operations at 32 or 64 bits, comparisons with SETcc materialization, LEA for frame and
// RIP-relative addresses, SSE moves for 128-bit vectors, direct calls and jumps to labels, and
// the rbp-based prologue and epilogue. One encoder holds the code of a whole module: every
// function and basic block gets a label, internal calls and branches bind to those labels, and
// references to symbols outside the text section are emitted with a zero displacement and
// recorded as pending relocations. finalize() assembles the instruction stream with
// RETURN_NEW_INSTRUCTION_OFFSETS so that label addresses and relocation sites can be mapped
// back to byte offsets in the final code buffer.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::*;
use iced_x86::BlockEncoderOptions;
use hashbrown::{HashMap, HashSet};
use crate::core::error::LoweringError;

/// Error types for instruction encoding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// Invalid register for the requested operation.
    #[error("Invalid register for operation")]
    InvalidRegister,
    /// Operand size the instruction has no form for.
    #[error("Unsupported operand size {0}")]
    UnsupportedSize(u32),
    /// Assembly error from iced-x86.
    #[error("Assembly error: {0}")]
    AssemblyError(String),
    /// A label was referenced but never placed.
    #[error("Label for {0} was never placed")]
    UnplacedLabel(String),
}

impl From<EncodingError> for LoweringError {
    fn from(err: EncodingError) -> Self {
        LoweringError::Encoding {
            reason: err.to_string(),
        }
    }
}

/// Register bank index for general purpose registers.
pub const GP_BANK: u8 = 0;
/// Register bank index for SSE registers.
pub const XMM_BANK: u8 = 1;

/// A machine register: bank plus hardware number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsmReg {
    pub bank: u8,
    pub id: u8,
}

impl AsmReg {
    pub const RAX: AsmReg = AsmReg::gp(0);
    pub const RCX: AsmReg = AsmReg::gp(1);
    pub const RDX: AsmReg = AsmReg::gp(2);
    pub const RSP: AsmReg = AsmReg::gp(4);
    pub const RBP: AsmReg = AsmReg::gp(5);
    pub const RSI: AsmReg = AsmReg::gp(6);
    pub const RDI: AsmReg = AsmReg::gp(7);
    pub const R8: AsmReg = AsmReg::gp(8);
    pub const R9: AsmReg = AsmReg::gp(9);
    pub const R10: AsmReg = AsmReg::gp(10);
    pub const R11: AsmReg = AsmReg::gp(11);

    pub const fn new(bank: u8, id: u8) -> Self {
        Self { bank, id }
    }

    pub const fn gp(id: u8) -> Self {
        Self::new(GP_BANK, id)
    }

    pub const fn xmm(id: u8) -> Self {
        Self::new(XMM_BANK, id)
    }
}

/// How a narrow integer load fills the upper bits of its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extend {
    Zero,
    Sign,
}

/// Two-operand integer ALU operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Imul,
    And,
    Or,
    Xor,
}

/// Condition codes for SETcc and Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    Greater,
    LessEqual,
    GreaterEqual,
    Below,
    Above,
    BelowEqual,
    AboveEqual,
}

/// Relocation flavour of a pending symbol reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// rel32 of a direct call, resolved through the PLT.
    Call,
    /// rel32 RIP-relative data or function address.
    PcRel,
}

/// A symbol reference to patch once code offsets are known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingReloc {
    /// Index of the referencing instruction in the assembler stream.
    instruction: usize,
    symbol: usize,
    kind: RelocKind,
}

/// A relocation against the final code buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeReloc {
    /// Byte offset of the 32-bit displacement field.
    pub offset: u64,
    pub symbol: usize,
    pub kind: RelocKind,
}

/// Result of [`X64Encoder::finalize`].
#[derive(Debug, Clone, Default)]
pub struct Assembled {
    pub code: Vec<u8>,
    pub relocs: Vec<CodeReloc>,
    /// Start offset of each function, keyed by function index.
    pub functions: HashMap<u32, u64>,
    /// Start offset of each placed block, keyed by (function, block).
    pub blocks: HashMap<(u32, u32), u64>,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    /// Code assembler for generating instructions.
    assembler: CodeAssembler,
    /// Labels for basic blocks, keyed by (function, block).
    block_labels: HashMap<(u32, u32), CodeLabel>,
    /// Track which block labels have been placed.
    placed_blocks: HashSet<(u32, u32)>,
    /// Labels for function entry points.
    function_labels: HashMap<u32, CodeLabel>,
    placed_functions: HashSet<u32>,
    relocs: Vec<PendingReloc>,
}

impl X64Encoder {
    /// Create a new x86-64 encoder.
    pub fn new() -> Result<Self, EncodingError> {
        let assembler =
            CodeAssembler::new(64).map_err(|e| EncodingError::AssemblyError(e.to_string()))?;

        Ok(Self {
            assembler,
            block_labels: HashMap::new(),
            placed_blocks: HashSet::new(),
            function_labels: HashMap::new(),
            placed_functions: HashSet::new(),
            relocs: Vec::new(),
        })
    }

    /// Convert AsmReg to iced-x86 64-bit GP register.
    fn to_gp64_register(&self, reg: AsmReg) -> Result<AsmRegister64, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP64_REGS: [AsmRegister64; 16] = [
            rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi,
            r8, r9, r10, r11, r12, r13, r14, r15,
        ];

        GP64_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 32-bit GP register.
    fn to_gp32_register(&self, reg: AsmReg) -> Result<AsmRegister32, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP32_REGS: [AsmRegister32; 16] = [
            eax, ecx, edx, ebx, esp, ebp, esi, edi,
            r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
        ];

        GP32_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 16-bit GP register.
    fn to_gp16_register(&self, reg: AsmReg) -> Result<AsmRegister16, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const GP16_REGS: [AsmRegister16; 16] = [
            ax, cx, dx, bx, sp, bp, si, di,
            r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
        ];

        GP16_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 8-bit GP register.
    fn to_gp8_register(&self, reg: AsmReg) -> Result<AsmRegister8, EncodingError> {
        if reg.bank != GP_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        // REX encodings: spl/bpl/sil/dil rather than ah/ch/dh/bh.
        const GP8_REGS: [AsmRegister8; 16] = [
            al, cl, dl, bl, spl, bpl, sil, dil,
            r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
        ];

        GP8_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    /// Convert AsmReg to iced-x86 XMM register.
    fn to_xmm_register(&self, reg: AsmReg) -> Result<AsmRegisterXmm, EncodingError> {
        if reg.bank != XMM_BANK {
            return Err(EncodingError::InvalidRegister);
        }

        const XMM_REGS: [AsmRegisterXmm; 16] = [
            xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7,
            xmm8, xmm9, xmm10, xmm11, xmm12, xmm13, xmm14, xmm15,
        ];

        XMM_REGS
            .get(reg.id as usize)
            .copied()
            .ok_or(EncodingError::InvalidRegister)
    }

    // ==== MOVES ====

    /// Emit MOV instruction - register to register (64-bit).
    pub fn mov_reg_reg(&mut self, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let src_reg = self.to_gp64_register(src)?;

        self.assembler
            .mov(dst_reg, src_reg)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Materialize an immediate. Sizes up to 4 bytes use the 32-bit form.
    pub fn mov_reg_imm(&mut self, dst: AsmReg, size: u32, imm: i64) -> Result<(), EncodingError> {
        if size == 8 {
            let dst_reg = self.to_gp64_register(dst)?;
            self.assembler
                .mov(dst_reg, imm)
                .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        } else {
            let dst_reg = self.to_gp32_register(dst)?;
            self.assembler
                .mov(dst_reg, imm as i32)
                .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        }
        Ok(())
    }

    /// Load `size` bytes from `[base + offset]`. Narrow loads extend into the 32-bit register.
    pub fn load(
        &mut self,
        dst: AsmReg,
        size: u32,
        base: AsmReg,
        offset: i32,
        extend: Extend,
    ) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let result = match (size, extend) {
            (1, Extend::Zero) => {
                let dst_reg = self.to_gp32_register(dst)?;
                self.assembler.movzx(dst_reg, byte_ptr(base_reg + offset))
            }
            (1, Extend::Sign) => {
                let dst_reg = self.to_gp32_register(dst)?;
                self.assembler.movsx(dst_reg, byte_ptr(base_reg + offset))
            }
            (2, Extend::Zero) => {
                let dst_reg = self.to_gp32_register(dst)?;
                self.assembler.movzx(dst_reg, word_ptr(base_reg + offset))
            }
            (2, Extend::Sign) => {
                let dst_reg = self.to_gp32_register(dst)?;
                self.assembler.movsx(dst_reg, word_ptr(base_reg + offset))
            }
            (4, _) => {
                let dst_reg = self.to_gp32_register(dst)?;
                self.assembler.mov(dst_reg, dword_ptr(base_reg + offset))
            }
            (8, _) => {
                let dst_reg = self.to_gp64_register(dst)?;
                self.assembler.mov(dst_reg, qword_ptr(base_reg + offset))
            }
            (other, _) => return Err(EncodingError::UnsupportedSize(other)),
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Store the low `size` bytes of `src` to `[base + offset]`.
    pub fn store(
        &mut self,
        size: u32,
        base: AsmReg,
        offset: i32,
        src: AsmReg,
    ) -> Result<(), EncodingError> {
        let base_reg = self.to_gp64_register(base)?;
        let result = match size {
            1 => {
                let src_reg = self.to_gp8_register(src)?;
                self.assembler.mov(byte_ptr(base_reg + offset), src_reg)
            }
            2 => {
                let src_reg = self.to_gp16_register(src)?;
                self.assembler.mov(word_ptr(base_reg + offset), src_reg)
            }
            4 => {
                let src_reg = self.to_gp32_register(src)?;
                self.assembler.mov(dword_ptr(base_reg + offset), src_reg)
            }
            8 => {
                let src_reg = self.to_gp64_register(src)?;
                self.assembler.mov(qword_ptr(base_reg + offset), src_reg)
            }
            other => return Err(EncodingError::UnsupportedSize(other)),
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit MOVDQU - 128-bit memory to XMM register.
    pub fn movdqu_load(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_xmm_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler
            .movdqu(dst_reg, xmmword_ptr(base_reg + offset))
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit MOVDQU - XMM register to 128-bit memory.
    pub fn movdqu_store(&mut self, base: AsmReg, offset: i32, src: AsmReg) -> Result<(), EncodingError> {
        let src_reg = self.to_xmm_register(src)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler
            .movdqu(xmmword_ptr(base_reg + offset), src_reg)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit LEA instruction - `dst = base + offset`.
    pub fn lea(&mut self, dst: AsmReg, base: AsmReg, offset: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let base_reg = self.to_gp64_register(base)?;

        self.assembler
            .lea(dst_reg, base_reg + offset)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// RIP-relative LEA of a function defined in this module.
    pub fn lea_function(&mut self, dst: AsmReg, func: u32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;
        let label = self.get_or_create_label_for_function(func);

        self.assembler
            .lea(dst_reg, ptr(label))
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// RIP-relative LEA of an external or data symbol.
    ///
    /// `anchor` must be a placed function label; it only fixes the instruction
    /// form, the displacement is replaced by a PC32 relocation.
    pub fn lea_symbol(&mut self, dst: AsmReg, anchor: u32, symbol: usize) -> Result<(), EncodingError> {
        let instruction = self.assembler.instructions().len();
        self.lea_function(dst, anchor)?;
        self.relocs.push(PendingReloc {
            instruction,
            symbol,
            kind: RelocKind::PcRel,
        });
        Ok(())
    }

    // ==== ARITHMETIC ====

    /// `dst = dst <op> src`, at 64 bits when `wide`, else 32 bits.
    pub fn alu(&mut self, op: AluOp, wide: bool, dst: AsmReg, src: AsmReg) -> Result<(), EncodingError> {
        let result = if wide {
            let d = self.to_gp64_register(dst)?;
            let s = self.to_gp64_register(src)?;
            match op {
                AluOp::Add => self.assembler.add(d, s),
                AluOp::Sub => self.assembler.sub(d, s),
                AluOp::Imul => self.assembler.imul_2(d, s),
                AluOp::And => self.assembler.and(d, s),
                AluOp::Or => self.assembler.or(d, s),
                AluOp::Xor => self.assembler.xor(d, s),
            }
        } else {
            let d = self.to_gp32_register(dst)?;
            let s = self.to_gp32_register(src)?;
            match op {
                AluOp::Add => self.assembler.add(d, s),
                AluOp::Sub => self.assembler.sub(d, s),
                AluOp::Imul => self.assembler.imul_2(d, s),
                AluOp::And => self.assembler.and(d, s),
                AluOp::Or => self.assembler.or(d, s),
                AluOp::Xor => self.assembler.xor(d, s),
            }
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit AND instruction - immediate to register (32-bit).
    pub fn and32_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;

        self.assembler
            .and(dst_reg, imm)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit NEG instruction (32-bit).
    pub fn neg32(&mut self, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp32_register(dst)?;

        self.assembler
            .neg(dst_reg)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit CMP instruction - register to register.
    pub fn cmp_reg_reg(&mut self, wide: bool, left: AsmReg, right: AsmReg) -> Result<(), EncodingError> {
        let result = if wide {
            let l = self.to_gp64_register(left)?;
            let r = self.to_gp64_register(right)?;
            self.assembler.cmp(l, r)
        } else {
            let l = self.to_gp32_register(left)?;
            let r = self.to_gp32_register(right)?;
            self.assembler.cmp(l, r)
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit TEST instruction on the low byte of a register.
    pub fn test8_reg_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let reg8 = self.to_gp8_register(reg)?;

        self.assembler
            .test(reg8, reg8)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit SETcc into the low byte of `dst`.
    pub fn setcc(&mut self, condition: Condition, dst: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp8_register(dst)?;

        let result = match condition {
            Condition::Equal => self.assembler.sete(dst_reg),
            Condition::NotEqual => self.assembler.setne(dst_reg),
            Condition::Less => self.assembler.setl(dst_reg),
            Condition::Greater => self.assembler.setg(dst_reg),
            Condition::LessEqual => self.assembler.setle(dst_reg),
            Condition::GreaterEqual => self.assembler.setge(dst_reg),
            Condition::Below => self.assembler.setb(dst_reg),
            Condition::Above => self.assembler.seta(dst_reg),
            Condition::BelowEqual => self.assembler.setbe(dst_reg),
            Condition::AboveEqual => self.assembler.setae(dst_reg),
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    // ==== STACK ====

    /// Emit PUSH instruction.
    pub fn push_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let src_reg = self.to_gp64_register(reg)?;

        self.assembler
            .push(src_reg)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit POP instruction.
    pub fn pop_reg(&mut self, reg: AsmReg) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(reg)?;

        self.assembler
            .pop(dst_reg)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit SUB instruction - immediate from a 64-bit register.
    pub fn sub64_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        self.assembler
            .sub(dst_reg, imm)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit ADD instruction - immediate to a 64-bit register.
    pub fn add64_reg_imm(&mut self, dst: AsmReg, imm: i32) -> Result<(), EncodingError> {
        let dst_reg = self.to_gp64_register(dst)?;

        self.assembler
            .add(dst_reg, imm)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    // ==== CONTROL FLOW ====

    /// Emit RET instruction.
    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler
            .ret()
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit UD2 instruction.
    pub fn ud2(&mut self) -> Result<(), EncodingError> {
        self.assembler
            .ud2()
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Direct call to a function defined in this module.
    pub fn call_function(&mut self, func: u32) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_function(func);

        self.assembler
            .call(label)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Direct call to an external symbol through a PLT32 relocation.
    pub fn call_symbol(&mut self, symbol: usize) -> Result<(), EncodingError> {
        let instruction = self.assembler.instructions().len();
        // Target 0 at base 0 keeps the rel32 form; the displacement is relocated.
        self.assembler
            .call(0u64)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.relocs.push(PendingReloc {
            instruction,
            symbol,
            kind: RelocKind::Call,
        });
        Ok(())
    }

    // ==== LABEL MANAGEMENT FOR CONTROL FLOW ====

    /// Create or get a label for a basic block.
    pub fn get_or_create_label_for_block(&mut self, func: u32, block: u32) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&(func, block)) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert((func, block), label);
            label
        }
    }

    /// Place a label for a basic block at the current position.
    pub fn place_label_for_block(&mut self, func: u32, block: u32) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_block(func, block);
        self.assembler
            .set_label(&mut label)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.block_labels.insert((func, block), label);
        self.placed_blocks.insert((func, block));
        Ok(())
    }

    /// Create or get the entry label of a function.
    pub fn get_or_create_label_for_function(&mut self, func: u32) -> CodeLabel {
        if let Some(&label) = self.function_labels.get(&func) {
            label
        } else {
            let label = self.assembler.create_label();
            self.function_labels.insert(func, label);
            label
        }
    }

    /// Place the entry label of a function at the current position.
    pub fn place_label_for_function(&mut self, func: u32) -> Result<(), EncodingError> {
        let mut label = self.get_or_create_label_for_function(func);
        self.assembler
            .set_label(&mut label)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        self.function_labels.insert(func, label);
        self.placed_functions.insert(func);
        Ok(())
    }

    /// Emit conditional jump to a specific basic block.
    pub fn jmp_conditional_to_block(
        &mut self,
        condition: Condition,
        func: u32,
        block: u32,
    ) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(func, block);

        let result = match condition {
            Condition::Equal => self.assembler.je(label),
            Condition::NotEqual => self.assembler.jne(label),
            Condition::Less => self.assembler.jl(label),
            Condition::Greater => self.assembler.jg(label),
            Condition::LessEqual => self.assembler.jle(label),
            Condition::GreaterEqual => self.assembler.jge(label),
            Condition::Below => self.assembler.jb(label),
            Condition::Above => self.assembler.ja(label),
            Condition::BelowEqual => self.assembler.jbe(label),
            Condition::AboveEqual => self.assembler.jae(label),
        };
        result.map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    /// Emit unconditional jump to a specific basic block.
    pub fn jmp_unconditional_to_block(&mut self, func: u32, block: u32) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(func, block);

        self.assembler
            .jmp(label)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
        Ok(())
    }

    // ==== FRAME ====

    /// Generate prologue for a function.
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        // push rbp
        self.push_reg(AsmReg::RBP)?;

        // mov rbp, rsp
        self.mov_reg_reg(AsmReg::RBP, AsmReg::RSP)?;

        // sub rsp, frame_size (if needed)
        if frame_size > 0 {
            self.sub64_reg_imm(AsmReg::RSP, frame_size as i32)?;
        }

        Ok(())
    }

    /// Generate epilogue for a function.
    pub fn emit_epilogue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        // add rsp, frame_size (if needed)
        if frame_size > 0 {
            self.add64_reg_imm(AsmReg::RSP, frame_size as i32)?;
        }

        // pop rbp
        self.pop_reg(AsmReg::RBP)?;

        // ret
        self.ret()?;

        Ok(())
    }

    /// Number of instructions emitted so far.
    pub fn instruction_count(&self) -> usize {
        self.assembler.instructions().len()
    }

    /// Assemble at base address 0 and resolve label and relocation offsets.
    pub fn finalize(mut self) -> Result<Assembled, EncodingError> {
        if let Some(&(func, block)) = self
            .block_labels
            .keys()
            .find(|key| !self.placed_blocks.contains(*key))
        {
            return Err(EncodingError::UnplacedLabel(format!("block {block} of function {func}")));
        }
        if let Some(func) = self
            .function_labels
            .keys()
            .find(|func| !self.placed_functions.contains(*func))
        {
            return Err(EncodingError::UnplacedLabel(format!("function {func}")));
        }

        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)
            .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;

        let mut functions = HashMap::new();
        for (&func, label) in &self.function_labels {
            let ip = result
                .label_ip(label)
                .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
            functions.insert(func, ip);
        }
        let mut blocks = HashMap::new();
        for (&key, label) in &self.block_labels {
            let ip = result
                .label_ip(label)
                .map_err(|e| EncodingError::AssemblyError(e.to_string()))?;
            blocks.insert(key, ip);
        }

        let offsets = &result.inner.new_instruction_offsets;
        let code = result.inner.code_buffer.clone();
        let mut relocs = Vec::with_capacity(self.relocs.len());
        for pending in &self.relocs {
            // The displacement is the last field of both call rel32 and lea [rip+disp32].
            let end = offsets
                .get(pending.instruction + 1)
                .map(|&next| u64::from(next))
                .unwrap_or(code.len() as u64);
            relocs.push(CodeReloc {
                offset: end - 4,
                symbol: pending.symbol,
                kind: pending.kind,
            });
        }

        Ok(Assembled {
            code,
            relocs,
            functions,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_epilogue() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_function(0).unwrap();
        encoder.emit_prologue(16).unwrap();
        encoder.emit_epilogue(16).unwrap();
        let assembled = encoder.finalize().unwrap();

        // push rbp; mov rbp, rsp
        assert_eq!(&assembled.code[..4], &[0x55, 0x48, 0x89, 0xe5]);
        assert_eq!(assembled.code.last(), Some(&0xc3));
        assert_eq!(assembled.functions.get(&0), Some(&0));
    }

    #[test]
    fn test_sized_loads_and_stores() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_function(0).unwrap();
        for size in [1, 2, 4, 8] {
            encoder.load(AsmReg::RAX, size, AsmReg::RBP, -16, Extend::Zero).unwrap();
            encoder.store(size, AsmReg::R11, 0, AsmReg::RAX).unwrap();
        }
        encoder.load(AsmReg::RCX, 1, AsmReg::RBP, -8, Extend::Sign).unwrap();
        assert_eq!(
            encoder.load(AsmReg::RAX, 3, AsmReg::RBP, 0, Extend::Zero),
            Err(EncodingError::UnsupportedSize(3))
        );
        assert_eq!(
            encoder.store(4, AsmReg::RBP, 0, AsmReg::xmm(0)),
            Err(EncodingError::InvalidRegister)
        );
        encoder.ret().unwrap();
        assert!(!encoder.finalize().unwrap().code.is_empty());
    }

    #[test]
    fn test_block_label_management() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_function(0).unwrap();
        encoder.mov_reg_imm(AsmReg::RAX, 4, 1).unwrap();
        encoder.test8_reg_reg(AsmReg::RAX).unwrap();
        encoder.jmp_conditional_to_block(Condition::NotEqual, 0, 1).unwrap();
        encoder.jmp_unconditional_to_block(0, 2).unwrap();
        encoder.place_label_for_block(0, 1).unwrap();
        encoder.ret().unwrap();
        encoder.place_label_for_block(0, 2).unwrap();
        encoder.ud2().unwrap();
        let assembled = encoder.finalize().unwrap();

        let one = assembled.blocks[&(0, 1)];
        let two = assembled.blocks[&(0, 2)];
        assert_eq!(assembled.code[one as usize], 0xc3);
        assert_eq!(two, one + 1);
        assert_eq!(&assembled.code[two as usize..], &[0x0f, 0x0b]);
    }

    #[test]
    fn test_unplaced_block_label() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_function(0).unwrap();
        encoder.jmp_unconditional_to_block(0, 7).unwrap();
        assert!(matches!(
            encoder.finalize(),
            Err(EncodingError::UnplacedLabel(_))
        ));
    }

    #[test]
    fn test_relocation_sites() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_function(0).unwrap();
        encoder.emit_prologue(0).unwrap();
        encoder.lea_symbol(AsmReg::R11, 0, 3).unwrap();
        encoder.call_symbol(5).unwrap();
        encoder.emit_epilogue(0).unwrap();
        let assembled = encoder.finalize().unwrap();

        assert_eq!(assembled.relocs.len(), 2);
        let lea = assembled.relocs[0];
        let call = assembled.relocs[1];
        assert_eq!((lea.symbol, lea.kind), (3, RelocKind::PcRel));
        assert_eq!((call.symbol, call.kind), (5, RelocKind::Call));
        // push rbp (1) + mov rbp, rsp (3) + lea r11, [rip+disp32] (7)
        assert_eq!(lea.offset, 4 + 3);
        assert_eq!(assembled.code[call.offset as usize - 1], 0xe8);
    }
}
