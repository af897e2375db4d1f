//! Opcode rewriting: every build gets its own opcode numbering.
//!
//! The interpreter is compiled against an enum and a computed-goto table produced here, and
//! the bytecode arrays emitted for native methods are renumbered the same way. Bytecode lifted
//! out of one build is meaningless to the interpreter of another.
use crate::dex::opcodes::{opcode, OP_NOP};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

pub trait RewriteStrategy {
    /// The value the interpreter uses for the standard opcode `op`.
    fn map(&self, op: u8) -> u8;

    /// Body of the interpreter's `enum Opcode`.
    fn opcode_enum(&self) -> String {
        let mut out = String::new();
        for value in 0..=255u8 {
            out.push_str(&format!("    {} = 0x{:02x},\n", opcode(value).c_name(), self.map(value)));
        }
        out
    }

    /// Body of the computed-goto label table, indexed by rewritten opcode value.
    fn goto_table(&self) -> String {
        let mut by_value = [0u8; 256];
        for value in 0..=255u8 {
            by_value[self.map(value) as usize] = value;
        }
        let mut out = String::new();
        for original in by_value {
            out.push_str(&format!("        H({}),{:>40}\n", opcode(original).c_name(), "\\"));
        }
        out
    }
}

/// The standard numbering. Only useful for debugging an interpreter build.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityOpcodes;

impl RewriteStrategy for IdentityOpcodes {
    fn map(&self, op: u8) -> u8 {
        op
    }
}

/// A random permutation of the 256 opcode values.
///
/// `nop` keeps 0x00: switch and array payloads are recognized by a zero low byte.
#[derive(Debug, Clone)]
pub struct ShuffledOpcodes {
    table: [u8; 256],
}

impl ShuffledOpcodes {
    pub fn new() -> Self {
        Self::with_rng(&mut StdRng::from_entropy())
    }

    /// A reproducible permutation, for tests.
    pub fn from_seed(seed: u64) -> Self {
        Self::with_rng(&mut StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: &mut StdRng) -> Self {
        let mut values: Vec<u8> = (1..=255u8).collect();
        values.shuffle(rng);
        let mut table = [OP_NOP; 256];
        for (slot, value) in table[1..].iter_mut().zip(values) {
            *slot = value;
        }
        ShuffledOpcodes { table }
    }
}

impl Default for ShuffledOpcodes {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteStrategy for ShuffledOpcodes {
    fn map(&self, op: u8) -> u8 {
        self.table[op as usize]
    }
}
