//! JVM opcode constants and the instruction length table.

use crate::ir::CallKind;

pub(crate) const BIPUSH: u8 = 0x10;
pub(crate) const SIPUSH: u8 = 0x11;
pub(crate) const LDC: u8 = 0x12;
pub(crate) const LDC_W: u8 = 0x13;
pub(crate) const LDC2_W: u8 = 0x14;
pub(crate) const ILOAD: u8 = 0x15;
pub(crate) const ALOAD: u8 = 0x19;
pub(crate) const ISTORE: u8 = 0x36;
pub(crate) const ASTORE: u8 = 0x3a;
pub(crate) const IINC: u8 = 0x84;
pub(crate) const IFEQ: u8 = 0x99;
pub(crate) const JSR: u8 = 0xa8;
pub(crate) const RET: u8 = 0xa9;
pub(crate) const TABLESWITCH: u8 = 0xaa;
pub(crate) const LOOKUPSWITCH: u8 = 0xab;
#[cfg(test)]
pub(crate) const RETURN: u8 = 0xb1;
pub(crate) const GETSTATIC: u8 = 0xb2;
pub(crate) const INVOKEVIRTUAL: u8 = 0xb6;
pub(crate) const INVOKESPECIAL: u8 = 0xb7;
pub(crate) const INVOKESTATIC: u8 = 0xb8;
pub(crate) const INVOKEINTERFACE: u8 = 0xb9;
pub(crate) const INVOKEDYNAMIC: u8 = 0xba;
pub(crate) const NEW: u8 = 0xbb;
pub(crate) const NEWARRAY: u8 = 0xbc;
pub(crate) const ANEWARRAY: u8 = 0xbd;
pub(crate) const CHECKCAST: u8 = 0xc0;
pub(crate) const INSTANCEOF: u8 = 0xc1;
pub(crate) const WIDE: u8 = 0xc4;
pub(crate) const MULTIANEWARRAY: u8 = 0xc5;
pub(crate) const IFNULL: u8 = 0xc6;
pub(crate) const IFNONNULL: u8 = 0xc7;
pub(crate) const GOTO_W: u8 = 0xc8;
pub(crate) const JSR_W: u8 = 0xc9;

/// Whether the opcode is a call whose constant pool operand is a plain
/// method reference. `invokedynamic` points at a call site specifier
/// instead and is skipped like any other instruction.
pub(crate) fn is_method_call(opcode: u8) -> bool {
    matches!(
        opcode,
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE
    )
}

pub(crate) fn call_kind(opcode: u8) -> Option<CallKind> {
    match opcode {
        INVOKEVIRTUAL => Some(CallKind::Virtual),
        INVOKESPECIAL => Some(CallKind::Special),
        INVOKESTATIC => Some(CallKind::Static),
        INVOKEINTERFACE => Some(CallKind::Interface),
        _ => None,
    }
}

/// Size in bytes of the instruction starting at `offset`.
///
/// Never returns less than one, so a linear scan always makes progress.
/// Reserved opcodes are treated as one-byte instructions and truncated
/// switch payloads are sized to the end of the code array.
pub(crate) fn instruction_size(opcode: u8, code: &[u8], offset: usize) -> usize {
    match opcode {
        BIPUSH | LDC | NEWARRAY | RET => 2,
        ILOAD..=ALOAD | ISTORE..=ASTORE => 2,
        SIPUSH | LDC_W | LDC2_W | IINC => 3,
        IFEQ..=JSR | IFNULL | IFNONNULL => 3,
        GETSTATIC..=INVOKESTATIC => 3,
        NEW | ANEWARRAY | CHECKCAST | INSTANCEOF => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC | GOTO_W | JSR_W => 5,
        MULTIANEWARRAY => 4,
        TABLESWITCH => switch_size(code, offset, tableswitch_payload),
        LOOKUPSWITCH => switch_size(code, offset, lookupswitch_payload),
        WIDE => {
            if code.get(offset + 1) == Some(&IINC) {
                6
            } else {
                4
            }
        }
        _ => 1,
    }
}

/// Alignment bytes between a switch opcode and its four-byte aligned operands.
pub(crate) fn padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn switch_size(code: &[u8], offset: usize, payload: fn(&[u8], usize) -> Option<usize>) -> usize {
    let base = offset + 1 + padding(offset);
    match payload(code, base) {
        Some(len) => base - offset + len,
        None => code.len().saturating_sub(offset).max(1),
    }
}

fn tableswitch_payload(code: &[u8], base: usize) -> Option<usize> {
    let low = read_i32(code, base + 4)?;
    let high = read_i32(code, base + 8)?;
    let count = i64::from(high) - i64::from(low) + 1;
    if count < 0 {
        return None;
    }
    Some(12 + 4 * count as usize)
}

fn lookupswitch_payload(code: &[u8], base: usize) -> Option<usize> {
    let npairs = read_i32(code, base + 4)?;
    if npairs < 0 {
        return None;
    }
    Some(8 + 8 * npairs as usize)
}

fn read_i32(code: &[u8], offset: usize) -> Option<i32> {
    let bytes = code.get(offset..offset + 4)?;
    Some(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Big-endian constant pool index operand of a call instruction.
pub(crate) fn call_operand(code: &[u8], offset: usize) -> Option<u16> {
    let bytes = code.get(offset + 1..offset + 3)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
