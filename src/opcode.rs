//! RegCode opcode table and instruction encoding.
//!
//! RegCode's instruction stream is a flat `Vec<u8>`: one opcode byte followed
//! by a variable number of 16-bit register operands and an optional 16-bit
//! immediate or 32-bit extended operand. [`Instruction`] is the fixed-shape
//! decoded view the Evaluator and the disassembler actually work with,
//! mirroring the way a variable-width wire format gets unpacked into a single
//! struct shape regardless of which fields a given opcode actually uses.

use std::convert::TryFrom;
use std::fmt;

/// A register index into a Frame's register file.
pub type Reg = u16;

/// Declares the opcode table: one source of truth for the `Opcode` enum,
/// its `TryFrom<u8>`, its mnemonic, and its operand shape — used by both the
/// encoder (`compiler::emit`) and the decoder (`evaluator::dispatch`).
macro_rules! impl_opcodes {
    ($( $doc:literal, $byte:literal, $Name:ident, $mnemonic:literal, $shape:ident; )*) => {
        /// One RegCode operation.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $( #[doc = $doc] $Name = $byte, )*
        }

        impl Opcode {
            /// Stable mnemonic, used by the disassembler and error messages.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Self::$Name => $mnemonic, )*
                }
            }

            /// Operand shape, used by both the encoder and decoder to know
            /// how many bytes follow the opcode byte.
            pub const fn shape(self) -> OperandShape {
                match self {
                    $( Self::$Name => OperandShape::$shape, )*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = u8;

            fn try_from(byte: u8) -> Result<Self, u8> {
                match byte {
                    $( $byte => Ok(Self::$Name), )*
                    other => Err(other),
                }
            }
        }
    };
}

/// Shape of an opcode's operand list, used to compute how many bytes to
/// consume from the instruction stream after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandShape {
    /// No operands (`NOP`, `POP_BLOCK`).
    Nop,
    /// One register operand, stored in the `ra` field regardless of whether
    /// the opcode treats it as a source (`RETURN ra`, `RAISE ra`) or a
    /// destination (`LOAD_NONE ra`) — the meaning is opcode-specific.
    Reg1,
    /// Two register operands (`MOVE rd, ra`; also unary OPS ops taking a
    /// destination and one source).
    Reg2,
    /// Three register operands (`ADD rd, ra, rb`; the common binary-OPS
    /// shape).
    Reg3,
    /// One register operand (via the `rd` field, source or destination
    /// depending on the opcode — `LOAD_CONST rd, #imm` writes it,
    /// `STORE_FAST rd, #slot` reads it) plus a 16-bit immediate.
    Reg1Imm,
    /// Two register operands plus a 16-bit immediate (`LOAD_ATTR rd, ra,
    /// #name_idx`).
    Reg2Imm,
    /// A 32-bit signed jump offset, relative to the end of the instruction
    /// (`JUMP`, `JUMP_IF_FALSE`).
    Jump,
    /// One register operand plus a 32-bit signed jump offset
    /// (`JUMP_IF_FALSE rd, offset`; `rd` is the tested register).
    RegJump,
    /// Two register operands plus a 32-bit signed jump offset
    /// (`FOR_ITER rd, ra, offset`: `rd` is the value destination, `ra` the
    /// iterator, kept distinct since the iterator must survive the
    /// instruction that only conditionally writes `rd`).
    Reg2Jump,
    /// A 16-bit count operand, for variadic builders (`BUILD_SEQUENCE rd,
    /// #count` consumes `#count` registers below `rd`).
    Reg1Count,
}

impl OperandShape {
    /// Number of bytes this shape consumes after the opcode byte.
    pub const fn operand_len(self) -> usize {
        match self {
            Self::Nop => 0,
            Self::Reg1 => 2,
            Self::Reg2 => 4,
            Self::Reg3 => 6,
            Self::Reg1Imm => 4,
            Self::Reg2Imm => 6,
            Self::Jump => 4,
            Self::RegJump => 6,
            Self::Reg2Jump => 8,
            Self::Reg1Count => 4,
        }
    }
}

impl_opcodes! {
    "No operation.", 0x00, Nop, "NOP", Nop;

    // ---- data movement ----
    "rd <- ra.", 0x01, Move, "MOVE", Reg2;
    "rd <- const[#imm].", 0x02, LoadConst, "LOAD_CONST", Reg1Imm;
    "rd <- locals[#imm] (local variable slot).", 0x03, LoadFast, "LOAD_FAST", Reg1Imm;
    "locals[#imm] <- rd.", 0x04, StoreFast, "STORE_FAST", Reg1Imm;
    "rd <- globals[name[#imm]], falling back to builtins.", 0x05, LoadGlobal, "LOAD_GLOBAL", Reg1Imm;
    "globals[name[#imm]] <- rd.", 0x06, StoreGlobal, "STORE_GLOBAL", Reg1Imm;
    "rd <- cells[#imm] (closure cell read).", 0x07, LoadDeref, "LOAD_DEREF", Reg1Imm;
    "cells[#imm] <- rd.", 0x08, StoreDeref, "STORE_DEREF", Reg1Imm;
    "ra <- none.", 0x09, LoadNone, "LOAD_NONE", Reg1;
    "Exchange rd and ra's contents; no refcount effect, ownership merely repositioned.", 0x0a, Swap, "SWAP", Reg2;
    "ra <- shadow_stack.pop(), transferring its owning reference.", 0x0b, PopShadow, "POP_SHADOW", Reg1;

    // ---- arithmetic / comparison (binary OPS ops, rd <- ra OP rb) ----
    "rd <- ra + rb.", 0x10, Add, "ADD", Reg3;
    "rd <- ra - rb.", 0x11, Sub, "SUB", Reg3;
    "rd <- ra * rb.", 0x12, Mul, "MUL", Reg3;
    "rd <- ra / rb.", 0x13, Div, "DIV", Reg3;
    "rd <- ra // rb.", 0x14, FloorDiv, "FLOOR_DIV", Reg3;
    "rd <- ra % rb.", 0x15, Mod, "MOD", Reg3;
    "rd <- ra ** rb.", 0x16, Pow, "POW", Reg3;
    "rd <- -ra.", 0x17, Neg, "NEG", Reg2;
    "rd <- ra & rb.", 0x18, BitAnd, "BIT_AND", Reg3;
    "rd <- ra | rb.", 0x19, BitOr, "BIT_OR", Reg3;
    "rd <- ra ^ rb.", 0x1a, BitXor, "BIT_XOR", Reg3;
    "rd <- ra << rb.", 0x1b, LShift, "LSHIFT", Reg3;
    "rd <- ra >> rb.", 0x1c, RShift, "RSHIFT", Reg3;
    "rd <- rd OP= ra, in-place variant selected by #imm op tag.", 0x1d, InplaceOp, "INPLACE_OP", Reg2Imm;
    "rd <- ra == rb.", 0x1e, CmpEq, "CMP_EQ", Reg3;
    "rd <- ra != rb.", 0x1f, CmpNe, "CMP_NE", Reg3;
    "rd <- ra < rb.", 0x20, CmpLt, "CMP_LT", Reg3;
    "rd <- ra <= rb.", 0x21, CmpLe, "CMP_LE", Reg3;
    "rd <- ra > rb.", 0x22, CmpGt, "CMP_GT", Reg3;
    "rd <- ra >= rb.", 0x23, CmpGe, "CMP_GE", Reg3;
    "rd <- rb in ra.", 0x24, Contains, "CONTAINS", Reg3;
    "rd <- not ra (host truthiness, then logical negation).", 0x25, Not, "NOT", Reg2;
    "rd <- ra is rb (identity).", 0x26, CmpIs, "CMP_IS", Reg3;
    "rd <- ra is not rb (identity, negated).", 0x27, CmpIsNot, "CMP_IS_NOT", Reg3;
    "rd <- rb not in ra.", 0x28, NotIn, "NOT_IN", Reg3;
    "rd <- exception_matches(ra, name[#imm]).", 0x29, ExcMatch, "EXC_MATCH", Reg2Imm;

    // ---- attributes / items ----
    "rd <- getattr(ra, name[#imm]).", 0x30, GetAttr, "GET_ATTR", Reg2Imm;
    "setattr(rd, name[#imm], ra).", 0x31, SetAttr, "SET_ATTR", Reg2Imm;
    "rd <- ra[rb].", 0x32, GetItem, "GET_ITEM", Reg3;
    "rd[ra] <- rb.", 0x33, SetItem, "SET_ITEM", Reg3;
    "del rd[ra].", 0x34, DelItem, "DEL_ITEM", Reg2;
    "rd <- ra[start:stop:step], bounds taken from the shadow stack.", 0x35, GetSlice, "GET_SLICE", Reg2;

    // ---- iteration ----
    "rd <- iter(ra).", 0x40, GetIter, "GET_ITER", Reg2;
    "rd <- next(ra); on exhaustion, jump by the offset instead of writing rd.", 0x41, ForIter, "FOR_ITER", Reg2Jump;

    // ---- construction ----
    "rd <- sequence built from the #imm registers rd..rd+#imm, ascending.", 0x50, BuildSequence, "BUILD_SEQUENCE", Reg1Count;
    "rd <- mapping built from #imm key/value register pairs starting at rd, ascending.", 0x51, BuildMapping, "BUILD_MAPPING", Reg1Count;
    "registers ra..ra+#imm <- unpack_sequence(rd, #imm).", 0x52, UnpackSequence, "UNPACK_SEQUENCE", Reg2Imm;
    "rd <- closure over code[#imm]; the code's free_var_count registers starting at rd hold the captured cells.", 0x53, MakeClosure, "MAKE_CLOSURE", Reg1Imm;

    // ---- control flow ----
    "Unconditional relative jump.", 0x60, Jump, "JUMP", Jump;
    "Jump if rd is falsy.", 0x61, JumpIfFalse, "JUMP_IF_FALSE", RegJump;
    "Jump if rd is truthy.", 0x62, JumpIfTrue, "JUMP_IF_TRUE", RegJump;

    // ---- blocks / exceptions ----
    "Push a LOOP block entry at the given jump target.", 0x70, SetupLoop, "SETUP_LOOP", Jump;
    "Push an EXCEPT block entry at the given jump target.", 0x71, SetupExcept, "SETUP_EXCEPT", Jump;
    "Push a FINALLY block entry at the given jump target.", 0x72, SetupFinally, "SETUP_FINALLY", Jump;
    "Push a WITH block entry; rd is the context manager.", 0x73, SetupWith, "SETUP_WITH", RegJump;
    "Pop the innermost block-stack entry.", 0x74, PopBlock, "POP_BLOCK", Nop;
    "Break out of the innermost LOOP block.", 0x75, BreakLoop, "BREAK_LOOP", Nop;
    "Continue the innermost LOOP block at the given jump target.", 0x76, ContinueLoop, "CONTINUE_LOOP", Jump;
    "Raise ra as an exception (re-raise if ra is none and one is pending).", 0x77, Raise, "RAISE", Reg1;
    "End the active exception handler, clearing the pending-error slot.", 0x78, EndExcept, "END_EXCEPT", Nop;

    // ---- calls / return ----
    "rd <- call rd(args at rd+1..rd+1+#imm via the Call Bridge).", 0x80, Call, "CALL", Reg1Imm;
    "Suspend the Frame, yielding ra to the caller.", 0x81, YieldValue, "YIELD_VALUE", Reg1;
    "Return ra to the caller, popping this Frame.", 0x82, Return, "RETURN", Reg1;
    "rd <- call rd(positional args at rd+1..rd+1+ra, then one value per name in kwnames[#imm]).", 0x83, CallKw, "CALL_KW", Reg2Imm;
    "rd <- call rd(#imm positional args at rd+1.., then *args splatted from the register just past them).", 0x84, CallVar, "CALL_VAR", Reg1Imm;
    "rd <- call rd(ra positional args, kwnames[#imm] keyword values, then *args and **kwargs splatted from the two registers past them).", 0x85, CallVarKw, "CALL_VAR_KW", Reg2Imm;
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Fixed-shape decoded instruction, regardless of which operand fields the
/// opcode actually populates. Unused fields are left at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    op: Opcode,
    rd: Reg,
    ra: Reg,
    rb: Reg,
    imm: i32,
}

impl Instruction {
    /// Build a 3-register instruction (`rd <- ra OP rb`).
    pub const fn reg3(op: Opcode, rd: Reg, ra: Reg, rb: Reg) -> Self {
        Self { op, rd, ra, rb, imm: 0 }
    }

    /// Build a 2-register instruction (`rd <- OP ra`).
    pub const fn reg2(op: Opcode, rd: Reg, ra: Reg) -> Self {
        Self { op, rd, ra, rb: 0, imm: 0 }
    }

    /// Build a 1-register instruction (`OP ra`, `rd` unused).
    pub const fn reg1(op: Opcode, ra: Reg) -> Self {
        Self { op, rd: 0, ra, rb: 0, imm: 0 }
    }

    /// Build a register-plus-immediate instruction.
    pub const fn reg1_imm(op: Opcode, rd: Reg, imm: i32) -> Self {
        Self { op, rd, ra: 0, rb: 0, imm }
    }

    /// Build a two-register-plus-immediate instruction.
    pub const fn reg2_imm(op: Opcode, rd: Reg, ra: Reg, imm: i32) -> Self {
        Self { op, rd, ra, rb: 0, imm }
    }

    /// Build a bare jump instruction (`imm` is the relative offset).
    pub const fn jump(op: Opcode, imm: i32) -> Self {
        Self { op, rd: 0, ra: 0, rb: 0, imm }
    }

    /// Build a register-plus-jump instruction.
    pub const fn reg_jump(op: Opcode, rd: Reg, imm: i32) -> Self {
        Self { op, rd, ra: 0, rb: 0, imm }
    }

    /// Build a two-register-plus-jump instruction.
    pub const fn reg2_jump(op: Opcode, rd: Reg, ra: Reg, imm: i32) -> Self {
        Self { op, rd, ra, rb: 0, imm }
    }

    /// Build a no-operand instruction.
    pub const fn nop(op: Opcode) -> Self {
        Self { op, rd: 0, ra: 0, rb: 0, imm: 0 }
    }

    /// The opcode.
    pub const fn op(&self) -> Opcode {
        self.op
    }

    /// Destination register, for shapes that have one.
    pub const fn rd(&self) -> Reg {
        self.rd
    }

    /// First source register, for shapes that have one.
    pub const fn ra(&self) -> Reg {
        self.ra
    }

    /// Second source register, for shapes that have one.
    pub const fn rb(&self) -> Reg {
        self.rb
    }

    /// The immediate / jump offset / count, for shapes that have one.
    pub const fn imm(&self) -> i32 {
        self.imm
    }

    /// Decode one instruction starting at `bytes[offset]`, returning the
    /// instruction and the offset of the byte following it.
    pub fn decode(bytes: &[u8], offset: usize) -> Option<(Self, usize)> {
        let op = Opcode::try_from(*bytes.get(offset)?).ok()?;
        let shape = op.shape();
        let body = offset + 1;
        let end = body + shape.operand_len();
        if end > bytes.len() {
            return None;
        }
        let read_u16 = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let read_i32 = |at: usize| {
            i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let instr = match shape {
            OperandShape::Nop => Self::nop(op),
            OperandShape::Reg1 => Self::reg1(op, read_u16(body)),
            OperandShape::Reg2 => Self::reg2(op, read_u16(body), read_u16(body + 2)),
            OperandShape::Reg3 => Self::reg3(op, read_u16(body), read_u16(body + 2), read_u16(body + 4)),
            OperandShape::Reg1Imm => Self::reg1_imm(op, read_u16(body), read_u16(body + 2) as i32),
            OperandShape::Reg2Imm => {
                Self::reg2_imm(op, read_u16(body), read_u16(body + 2), read_u16(body + 4) as i32)
            }
            OperandShape::Jump => Self::jump(op, read_i32(body)),
            OperandShape::RegJump => Self::reg_jump(op, read_u16(body), read_i32(body + 2)),
            OperandShape::Reg2Jump => {
                Self::reg2_jump(op, read_u16(body), read_u16(body + 2), read_i32(body + 4))
            }
            OperandShape::Reg1Count => Self::reg1_imm(op, read_u16(body), read_u16(body + 2) as i32),
        };
        Some((instr, end))
    }

    /// Encode this instruction into `out`, appending its opcode byte and
    /// operand bytes according to its shape.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.op as u8);
        match self.op.shape() {
            OperandShape::Nop => {}
            OperandShape::Reg1 => out.extend_from_slice(&self.ra.to_le_bytes()),
            OperandShape::Reg2 => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&self.ra.to_le_bytes());
            }
            OperandShape::Reg3 => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&self.ra.to_le_bytes());
                out.extend_from_slice(&self.rb.to_le_bytes());
            }
            OperandShape::Reg1Imm | OperandShape::Reg1Count => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&(self.imm as u16).to_le_bytes());
            }
            OperandShape::Reg2Imm => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&self.ra.to_le_bytes());
                out.extend_from_slice(&(self.imm as u16).to_le_bytes());
            }
            OperandShape::Jump => out.extend_from_slice(&self.imm.to_le_bytes()),
            OperandShape::RegJump => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&self.imm.to_le_bytes());
            }
            OperandShape::Reg2Jump => {
                out.extend_from_slice(&self.rd.to_le_bytes());
                out.extend_from_slice(&self.ra.to_le_bytes());
                out.extend_from_slice(&self.imm.to_le_bytes());
            }
        }
    }

    /// Total encoded length in bytes, opcode byte included.
    pub const fn encoded_len(&self) -> usize {
        1 + self.op.shape().operand_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_reg3() {
        let instr = Instruction::reg3(Opcode::Add, 2, 0, 1);
        let mut buf = Vec::new();
        instr.encode(&mut buf);
        let (decoded, consumed) = Instruction::decode(&buf, 0).expect("decodes");
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, instr);
    }

    #[test]
    fn round_trips_jump_negative_offset() {
        let instr = Instruction::jump(Opcode::Jump, -12);
        let mut buf = Vec::new();
        instr.encode(&mut buf);
        let (decoded, _) = Instruction::decode(&buf, 0).expect("decodes");
        assert_eq!(decoded.imm(), -12);
    }

    #[test]
    fn unknown_opcode_fails_to_decode() {
        assert!(Instruction::decode(&[0xff], 0).is_none());
    }

    #[test]
    fn truncated_operand_fails_to_decode() {
        // ADD needs 6 operand bytes, only provide 2.
        assert!(Instruction::decode(&[Opcode::Add as u8, 0, 0], 0).is_none());
    }
}
