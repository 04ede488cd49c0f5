//! Static bytecode verifier (spec §4.4): runs once, before a `FuncDef` may
//! be closed over, and catches every structural violation that would
//! otherwise let the interpreter run off the rails or off the end of the
//! bytecode array.

use crate::bytecode::{decode, decode_l, decode_sc, decode_sd, decode_ses, decode_sl, decode_sss, decode_ssi, decode_ssu, Opcode, Shape};
use crate::error::{VerifierError, VmResult};
use crate::funcdef::FuncDef;

/// Runs all eight checks on `def`, then recurses into `def.nested_defs`
/// (spec §4.4: "Verification recursively traverses nested defs"). Every
/// def in the tree, not just the immediate children, ends up `verified`.
pub fn verify(def: &mut FuncDef) -> VmResult<()> {
    verify_one(def)?;
    for nested in &def.nested_defs {
        // Nested defs share the allocator's mutability rules through
        // interior mutation only at construction time; by verification
        // time they're simple immutable reads, hence the unsafe deref is
        // confined to walking an already-built tree.
        let nested_ptr = nested.as_ptr();
        let nested_ref = unsafe { &mut (*nested_ptr).value };
        verify(nested_ref)?;
    }
    def.verified = true;
    Ok(())
}

fn verify_one(def: &FuncDef) -> VmResult<()> {
    let bytecode = &def.bytecode;
    let len = bytecode.len();

    // (8) arity + vararg must fit in slot_count.
    let variadic_extra = if def.flags.variadic { 1 } else { 0 };
    if def.arity_min + variadic_extra > def.slot_count {
        return Err(VerifierError::ArityExceedsSlots {
            arity: def.arity_min + variadic_extra,
            slot_count: def.slot_count,
        }
        .into());
    }

    if len == 0 {
        return Err(VerifierError::EmptyBytecode.into());
    }

    for (pc, &word) in bytecode.iter().enumerate() {
        // (1) every opcode is known.
        let decoded = match decode(word) {
            Some(d) => d,
            None => {
                return Err(VerifierError::UnknownOpcode { pc, byte: word as u8 }.into());
            }
        };

        check_operands(def, pc, decoded.opcode, decoded.raw_operands, len)?;
    }

    // (7) final instruction must be a terminator.
    let last = decode(bytecode[len - 1]).expect("checked above");
    if !matches!(
        last.opcode,
        Opcode::Return | Opcode::ReturnNil | Opcode::Tailcall | Opcode::Jump | Opcode::Error
    ) {
        return Err(VerifierError::NonTerminalExit.into());
    }

    Ok(())
}

fn check_operands(def: &FuncDef, pc: usize, opcode: Opcode, operands: u32, bytecode_len: usize) -> VmResult<()> {
    let slot_count = def.slot_count;
    let check_slot = |slot: u32| -> VmResult<()> {
        if slot >= slot_count {
            return Err(VerifierError::SlotOutOfRange { pc, slot }.into());
        }
        Ok(())
    };
    let check_jump = |offset: i64| -> VmResult<()> {
        let target = pc as i64 + 1 + offset;
        if target < 0 || target as usize >= bytecode_len {
            return Err(VerifierError::JumpOutOfRange { pc, target }.into());
        }
        Ok(())
    };

    match opcode.shape() {
        Shape::Zero => {}
        Shape::S => check_slot(operands & 0x00ff_ffff)?,
        Shape::L => check_jump(decode_l(operands) as i64)?,
        Shape::SS => {
            let (a, b) = crate::bytecode::decode_ss(operands);
            check_slot(a as u32)?;
            check_slot(b as u32)?;
        }
        Shape::SI => {
            let (a, _imm) = crate::bytecode::decode_si(operands);
            check_slot(a as u32)?;
        }
        Shape::SU => {
            let (a, _imm) = crate::bytecode::decode_su(operands);
            check_slot(a as u32)?;
        }
        Shape::ST => {
            let (a, _mask) = crate::bytecode::decode_su(operands);
            check_slot(a as u32)?;
        }
        Shape::SL => {
            let (a, offset) = decode_sl(operands);
            check_slot(a as u32)?;
            check_jump(offset as i64)?;
        }
        Shape::SSS => {
            let (a, b, c) = decode_sss(operands);
            check_slot(a as u32)?;
            // Opcodes using SSS for load/index ops treat b/c as slots;
            // GET_INDEX-style immediates use SSU instead, so SSS operands
            // are always slots.
            check_slot(b as u32)?;
            check_slot(c as u32)?;
        }
        Shape::SSI => {
            let (a, b, _imm) = decode_ssi(operands);
            check_slot(a as u32)?;
            check_slot(b as u32)?;
        }
        Shape::SSU => {
            let (a, b, _imm) = decode_ssu(operands);
            check_slot(a as u32)?;
            check_slot(b as u32)?;
        }
        Shape::SES => {
            let (a, env, b) = decode_ses(operands);
            check_slot(a as u32)?;
            if env as usize >= def.env_captures.len() {
                return Err(VerifierError::EnvOutOfRange { pc, index: env as u32 }.into());
            }
            check_slot(b as u32)?;
        }
        Shape::SC => {
            let (a, idx) = decode_sc(operands);
            check_slot(a as u32)?;
            if idx as usize >= def.constants.len() {
                return Err(VerifierError::ConstantOutOfRange { pc, index: idx as u32 }.into());
            }
        }
        Shape::SD => {
            let (a, idx) = decode_sd(operands);
            check_slot(a as u32)?;
            if idx as usize >= def.nested_defs.len() {
                return Err(VerifierError::DefOutOfRange { pc, index: idx as u32 }.into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{encode_s, encode_sss};

    #[test]
    fn accepts_well_formed_def() {
        let mut def = FuncDef::new(
            vec![encode_sss(Opcode::Add, 0, 1, 2), encode_s(Opcode::Return, 2)],
            vec![],
            4,
        );
        assert!(verify(&mut def).is_ok());
        assert!(def.verified);
    }

    #[test]
    fn rejects_non_terminal_exit() {
        let mut def = FuncDef::new(vec![encode_sss(Opcode::Add, 0, 1, 2)], vec![], 4);
        let err = verify(&mut def).unwrap_err();
        assert!(matches!(err, crate::error::VmError::Verifier(VerifierError::NonTerminalExit)));
    }

    #[test]
    fn rejects_slot_out_of_range() {
        let mut def = FuncDef::new(vec![encode_s(Opcode::Return, 9)], vec![], 2);
        let err = verify(&mut def).unwrap_err();
        assert!(matches!(err, crate::error::VmError::Verifier(VerifierError::SlotOutOfRange { .. })));
    }

    #[test]
    fn rejects_arity_exceeding_slots() {
        let mut def = FuncDef::new(vec![crate::bytecode::encode_zero(Opcode::ReturnNil)], vec![], 1);
        def.arity_min = 5;
        let err = verify(&mut def).unwrap_err();
        assert!(matches!(err, crate::error::VmError::Verifier(VerifierError::ArityExceedsSlots { .. })));
    }
}
