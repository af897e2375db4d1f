use crate::dex::error::DexError;
use once_cell::sync::Lazy;

pub const OP_NOP: u8 = 0x00;
pub const OP_RETURN_VOID: u8 = 0x0e;
pub const OP_CONST: u8 = 0x14;
pub const OP_CONST_STRING_JUMBO: u8 = 0x1b;
pub const OP_INVOKE_DIRECT: u8 = 0x70;
pub const OP_INVOKE_STATIC: u8 = 0x71;

pub const PACKED_SWITCH_PAYLOAD: u16 = 0x0100;
pub const SPARSE_SWITCH_PAYLOAD: u16 = 0x0200;
pub const FILL_ARRAY_DATA_PAYLOAD: u16 = 0x0300;

/// Instruction formats, named after their Dalvik format identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21h,
    F21c,
    F23x,
    F22b,
    F22t,
    F22s,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F31c,
    F35c,
    F3rc,
    F45cc,
    F4rcc,
    F51l,
}

impl Format {
    /// Width in 16-bit code units.
    pub fn units(self) -> usize {
        use Format::*;
        match self {
            F10x | F12x | F11n | F11x | F10t => 1,
            F20t | F22x | F21t | F21s | F21h | F21c | F23x | F22b | F22t | F22s | F22c => 2,
            F30t | F32x | F31i | F31t | F31c | F35c | F3rc => 3,
            F45cc | F4rcc => 4,
            F51l => 5,
        }
    }
}

/// The pool an instruction's index operand points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    None,
    String,
    Type,
    Field,
    Method,
    Proto,
    /// `invoke-polymorphic`: method in unit 1, proto in unit 3.
    MethodAndProto,
    CallSite,
    MethodHandle,
}

#[derive(Debug, Clone, Copy)]
pub struct Opcode {
    pub value: u8,
    pub name: &'static str,
    pub format: Format,
    pub refs: RefKind,
}

impl Opcode {
    pub fn is_unused(&self) -> bool {
        self.name.is_empty()
    }

    /// `move-wide/from16` -> `OP_MOVE_WIDE_FROM16`; unused slots become `OP_UNUSED_3E`.
    pub fn c_name(&self) -> String {
        if self.is_unused() {
            format!("OP_UNUSED_{:02X}", self.value)
        } else {
            format!("OP_{}", self.name.to_ascii_uppercase().replace(['-', '/'], "_"))
        }
    }
}

// (first opcode, names, format, reference kind); consecutive opcodes share a row.
const GROUPS: &[(u8, &[&str], Format, RefKind)] = {
    use Format::*;
    use RefKind as R;
    &[
        (0x00, &["nop"], F10x, R::None),
        (0x01, &["move"], F12x, R::None),
        (0x02, &["move/from16"], F22x, R::None),
        (0x03, &["move/16"], F32x, R::None),
        (0x04, &["move-wide"], F12x, R::None),
        (0x05, &["move-wide/from16"], F22x, R::None),
        (0x06, &["move-wide/16"], F32x, R::None),
        (0x07, &["move-object"], F12x, R::None),
        (0x08, &["move-object/from16"], F22x, R::None),
        (0x09, &["move-object/16"], F32x, R::None),
        (0x0a, &["move-result", "move-result-wide", "move-result-object", "move-exception"], F11x, R::None),
        (0x0e, &["return-void"], F10x, R::None),
        (0x0f, &["return", "return-wide", "return-object"], F11x, R::None),
        (0x12, &["const/4"], F11n, R::None),
        (0x13, &["const/16"], F21s, R::None),
        (0x14, &["const"], F31i, R::None),
        (0x15, &["const/high16"], F21h, R::None),
        (0x16, &["const-wide/16"], F21s, R::None),
        (0x17, &["const-wide/32"], F31i, R::None),
        (0x18, &["const-wide"], F51l, R::None),
        (0x19, &["const-wide/high16"], F21h, R::None),
        (0x1a, &["const-string"], F21c, R::String),
        (0x1b, &["const-string/jumbo"], F31c, R::String),
        (0x1c, &["const-class"], F21c, R::Type),
        (0x1d, &["monitor-enter", "monitor-exit"], F11x, R::None),
        (0x1f, &["check-cast"], F21c, R::Type),
        (0x20, &["instance-of"], F22c, R::Type),
        (0x21, &["array-length"], F12x, R::None),
        (0x22, &["new-instance"], F21c, R::Type),
        (0x23, &["new-array"], F22c, R::Type),
        (0x24, &["filled-new-array"], F35c, R::Type),
        (0x25, &["filled-new-array/range"], F3rc, R::Type),
        (0x26, &["fill-array-data"], F31t, R::None),
        (0x27, &["throw"], F11x, R::None),
        (0x28, &["goto"], F10t, R::None),
        (0x29, &["goto/16"], F20t, R::None),
        (0x2a, &["goto/32"], F30t, R::None),
        (0x2b, &["packed-switch", "sparse-switch"], F31t, R::None),
        (0x2d, &["cmpl-float", "cmpg-float", "cmpl-double", "cmpg-double", "cmp-long"], F23x, R::None),
        (0x32, &["if-eq", "if-ne", "if-lt", "if-ge", "if-gt", "if-le"], F22t, R::None),
        (0x38, &["if-eqz", "if-nez", "if-ltz", "if-gez", "if-gtz", "if-lez"], F21t, R::None),
        (
            0x44,
            &[
                "aget", "aget-wide", "aget-object", "aget-boolean", "aget-byte", "aget-char", "aget-short",
                "aput", "aput-wide", "aput-object", "aput-boolean", "aput-byte", "aput-char", "aput-short",
            ],
            F23x,
            R::None,
        ),
        (
            0x52,
            &[
                "iget", "iget-wide", "iget-object", "iget-boolean", "iget-byte", "iget-char", "iget-short",
                "iput", "iput-wide", "iput-object", "iput-boolean", "iput-byte", "iput-char", "iput-short",
            ],
            F22c,
            R::Field,
        ),
        (
            0x60,
            &[
                "sget", "sget-wide", "sget-object", "sget-boolean", "sget-byte", "sget-char", "sget-short",
                "sput", "sput-wide", "sput-object", "sput-boolean", "sput-byte", "sput-char", "sput-short",
            ],
            F21c,
            R::Field,
        ),
        (
            0x6e,
            &["invoke-virtual", "invoke-super", "invoke-direct", "invoke-static", "invoke-interface"],
            F35c,
            R::Method,
        ),
        (
            0x74,
            &[
                "invoke-virtual/range",
                "invoke-super/range",
                "invoke-direct/range",
                "invoke-static/range",
                "invoke-interface/range",
            ],
            F3rc,
            R::Method,
        ),
        (
            0x7b,
            &[
                "neg-int", "not-int", "neg-long", "not-long", "neg-float", "neg-double", "int-to-long",
                "int-to-float", "int-to-double", "long-to-int", "long-to-float", "long-to-double",
                "float-to-int", "float-to-long", "float-to-double", "double-to-int", "double-to-long",
                "double-to-float", "int-to-byte", "int-to-char", "int-to-short",
            ],
            F12x,
            R::None,
        ),
        (0x90, BINOPS, F23x, R::None),
        (0xb0, BINOPS_2ADDR, F12x, R::None),
        (
            0xd0,
            &[
                "add-int/lit16", "rsub-int", "mul-int/lit16", "div-int/lit16", "rem-int/lit16", "and-int/lit16",
                "or-int/lit16", "xor-int/lit16",
            ],
            F22s,
            R::None,
        ),
        (
            0xd8,
            &[
                "add-int/lit8", "rsub-int/lit8", "mul-int/lit8", "div-int/lit8", "rem-int/lit8", "and-int/lit8",
                "or-int/lit8", "xor-int/lit8", "shl-int/lit8", "shr-int/lit8", "ushr-int/lit8",
            ],
            F22b,
            R::None,
        ),
        (0xfa, &["invoke-polymorphic"], F45cc, R::MethodAndProto),
        (0xfb, &["invoke-polymorphic/range"], F4rcc, R::MethodAndProto),
        (0xfc, &["invoke-custom"], F35c, R::CallSite),
        (0xfd, &["invoke-custom/range"], F3rc, R::CallSite),
        (0xfe, &["const-method-handle"], F21c, R::MethodHandle),
        (0xff, &["const-method-type"], F21c, R::Proto),
    ]
};

const BINOPS: &[&str] = &[
    "add-int", "sub-int", "mul-int", "div-int", "rem-int", "and-int", "or-int", "xor-int", "shl-int",
    "shr-int", "ushr-int", "add-long", "sub-long", "mul-long", "div-long", "rem-long", "and-long",
    "or-long", "xor-long", "shl-long", "shr-long", "ushr-long", "add-float", "sub-float", "mul-float",
    "div-float", "rem-float", "add-double", "sub-double", "mul-double", "div-double", "rem-double",
];

const BINOPS_2ADDR: &[&str] = &[
    "add-int/2addr", "sub-int/2addr", "mul-int/2addr", "div-int/2addr", "rem-int/2addr",
    "and-int/2addr", "or-int/2addr", "xor-int/2addr", "shl-int/2addr", "shr-int/2addr",
    "ushr-int/2addr", "add-long/2addr", "sub-long/2addr", "mul-long/2addr", "div-long/2addr",
    "rem-long/2addr", "and-long/2addr", "or-long/2addr", "xor-long/2addr", "shl-long/2addr",
    "shr-long/2addr", "ushr-long/2addr", "add-float/2addr", "sub-float/2addr", "mul-float/2addr",
    "div-float/2addr", "rem-float/2addr", "add-double/2addr", "sub-double/2addr",
    "mul-double/2addr", "div-double/2addr", "rem-double/2addr",
];

pub static OPCODES: Lazy<Vec<Opcode>> = Lazy::new(|| {
    let mut table: Vec<Opcode> = (0..=255u8)
        .map(|value| Opcode {
            value,
            name: "",
            format: Format::F10x,
            refs: RefKind::None,
        })
        .collect();
    for &(first, names, format, refs) in GROUPS {
        for (i, &name) in names.iter().enumerate() {
            let value = first as usize + i;
            table[value] = Opcode {
                value: value as u8,
                name,
                format,
                refs,
            };
        }
    }
    table
});

pub fn opcode(value: u8) -> &'static Opcode {
    &OPCODES[value as usize]
}

/// Width of the instruction or payload starting at `pos`, in code units.
pub fn insn_units(insns: &[u16], pos: usize) -> Result<usize, DexError> {
    let Some(&unit) = insns.get(pos) else {
        fail!("instruction offset {} past end of code", pos);
    };
    let op = opcode((unit & 0xff) as u8);
    if op.value == OP_NOP && unit != 0 {
        return payload_units(insns, pos);
    }
    if op.is_unused() {
        fail!("unused opcode {:#04x} at {}", op.value, pos);
    }
    let units = op.format.units();
    if pos + units > insns.len() {
        fail!("{} at {} is truncated ({} of {} units)", op.name, pos, insns.len() - pos, units);
    }
    Ok(units)
}

fn payload_units(insns: &[u16], pos: usize) -> Result<usize, DexError> {
    let at = |i: usize| -> Result<u16, DexError> {
        insns
            .get(pos + i)
            .copied()
            .ok_or_else(|| dex_err!("truncated payload at {}", pos))
    };
    let size = match at(0)? {
        PACKED_SWITCH_PAYLOAD => at(1)? as usize * 2 + 4,
        SPARSE_SWITCH_PAYLOAD => at(1)? as usize * 4 + 2,
        FILL_ARRAY_DATA_PAYLOAD => {
            let width = at(1)? as usize;
            let count = at(2)? as usize | (at(3)? as usize) << 16;
            (width * count + 1) / 2 + 4
        }
        other => fail!("unknown payload ident {:#06x} at {}", other, pos),
    };
    if pos + size > insns.len() {
        fail!("payload at {} overruns code", pos);
    }
    Ok(size)
}
