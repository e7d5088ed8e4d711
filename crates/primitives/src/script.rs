//! Minimal script parsing needed by block validation.
//!
//! Full script execution lives behind the chain state's script verifier;
//! this module only walks opcodes for sigop accounting and builds the
//! number pushes used in coinbase height commitments.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

const MAX_PUBKEYS_PER_MULTISIG: u32 = 20;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Instruction<'a> {
    Push(&'a [u8]),
    Op(u8),
}

/// Iterates instructions; stops at the first truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self { script, cursor: 0 }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.cursor.checked_add(len)?;
        let slice = self.script.get(self.cursor..end)?;
        self.cursor = end;
        Some(slice)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = (u8, Instruction<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        let opcode = *self.script.get(self.cursor)?;
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let raw = self.take(2)?;
                u16::from_le_bytes([raw[0], raw[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let raw = self.take(4)?;
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize
            }
            OP_0 => return Some((opcode, Instruction::Push(&[]))),
            _ => return Some((opcode, Instruction::Op(opcode))),
        };
        match self.take(len) {
            Some(data) => Some((opcode, Instruction::Push(data))),
            None => {
                self.cursor = self.script.len();
                None
            }
        }
    }
}

/// Signature operations counted without executing the script.
pub fn legacy_sigop_count(script: &[u8]) -> u32 {
    Instructions::new(script)
        .map(|(opcode, _)| match opcode {
            OP_CHECKSIG | OP_CHECKSIGVERIFY => 1,
            OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => MAX_PUBKEYS_PER_MULTISIG,
            _ => 0,
        })
        .sum()
}

/// Minimal little-endian sign-magnitude encoding of a script number.
pub fn script_num_bytes(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut out = Vec::with_capacity(9);
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    let last = out.len() - 1;
    if out[last] & 0x80 != 0 {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        out[last] |= 0x80;
    }
    out
}

pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    match data.len() {
        len if len < OP_PUSHDATA1 as usize => script.push(len as u8),
        len if len <= u8::MAX as usize => {
            script.push(OP_PUSHDATA1);
            script.push(len as u8);
        }
        len if len <= u16::MAX as usize => {
            script.push(OP_PUSHDATA2);
            script.extend_from_slice(&(len as u16).to_le_bytes());
        }
        len => {
            script.push(OP_PUSHDATA4);
            script.extend_from_slice(&(len as u32).to_le_bytes());
        }
    }
    script.extend_from_slice(data);
}

/// Script fragment pushing `value` the way `CScript() << n` does.
pub fn push_int(value: i64) -> Vec<u8> {
    match value {
        0 => vec![OP_0],
        -1 => vec![OP_1NEGATE],
        1..=16 => vec![OP_1 + (value as u8 - 1)],
        _ => {
            let mut script = Vec::with_capacity(10);
            push_data(&mut script, &script_num_bytes(value));
            script
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sigops_skip_push_payloads() {
        // A push containing 0xac bytes must not count as a checksig.
        let mut script = Vec::new();
        push_data(&mut script, &[OP_CHECKSIG; 3]);
        script.push(OP_CHECKSIG);
        script.push(OP_CHECKMULTISIG);
        assert_eq!(legacy_sigop_count(&script), 21);
    }

    #[test]
    fn truncated_push_ends_iteration() {
        let script = [OP_CHECKSIG, 0x05, 0x01, OP_CHECKSIG];
        assert_eq!(legacy_sigop_count(&script), 1);
    }

    #[test]
    fn script_numbers_use_minimal_encoding() {
        assert_eq!(script_num_bytes(0), Vec::<u8>::new());
        assert_eq!(script_num_bytes(127), vec![0x7f]);
        assert_eq!(script_num_bytes(128), vec![0x80, 0x00]);
        assert_eq!(script_num_bytes(-1), vec![0x81]);
        assert_eq!(script_num_bytes(-128), vec![0x80, 0x80]);
        assert_eq!(script_num_bytes(227_931), vec![0x5b, 0x7a, 0x03]);
    }

    #[test]
    fn push_int_uses_small_opcodes() {
        assert_eq!(push_int(0), vec![OP_0]);
        assert_eq!(push_int(16), vec![OP_16]);
        assert_eq!(push_int(17), vec![0x01, 0x11]);
        assert_eq!(push_int(1_000), vec![0x02, 0xe8, 0x03]);
    }
}
