//! Instruction set for the sandboxed interpreter
//!
//! A curated subset of the CIL instruction set. Byte values match the
//! standard encoding so exported method bodies can be executed as-is.
//! Two-byte instructions start with the [`EXTENDED_PREFIX`] byte.

/// Escape byte introducing a two-byte instruction
pub const EXTENDED_PREFIX: u8 = 0xFE;

/// Operand encoding that follows an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Unsigned 8-bit argument or local index
    ShortVar,
    /// Unsigned 16-bit argument or local index
    Var,
    /// Signed 8-bit immediate
    I8,
    /// Signed 32-bit immediate
    I32,
    /// Signed 64-bit immediate
    I64,
    /// 32-bit float immediate
    F32,
    /// 64-bit float immediate
    F64,
    /// 32-bit metadata token index
    Token,
    /// Signed 8-bit branch offset, relative to the next instruction
    ShortBranch,
    /// Signed 32-bit branch offset, relative to the next instruction
    Branch,
    /// `u32` count followed by that many `i32` offsets
    Switch,
}

impl OperandKind {
    /// Fixed operand width in bytes (`None` for the variable-width switch table)
    pub fn width(self) -> Option<usize> {
        match self {
            Self::None => Some(0),
            Self::ShortVar | Self::I8 | Self::ShortBranch => Some(1),
            Self::Var => Some(2),
            Self::I32 | Self::F32 | Self::Token | Self::Branch => Some(4),
            Self::I64 | Self::F64 => Some(8),
            Self::Switch => None,
        }
    }
}

/// Bytecode opcode enumeration
///
/// Single-byte opcodes use their byte as discriminant. Two-byte opcodes use
/// `0xFE00 | second_byte`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Base =====
    /// `nop`
    Nop = 0x00,
    // ===== Arguments and locals =====
    /// `ldarg.0`
    Ldarg0 = 0x02,
    /// `ldarg.1`
    Ldarg1 = 0x03,
    /// `ldarg.2`
    Ldarg2 = 0x04,
    /// `ldarg.3`
    Ldarg3 = 0x05,
    /// `ldloc.0`
    Ldloc0 = 0x06,
    /// `ldloc.1`
    Ldloc1 = 0x07,
    /// `ldloc.2`
    Ldloc2 = 0x08,
    /// `ldloc.3`
    Ldloc3 = 0x09,
    /// `stloc.0`
    Stloc0 = 0x0A,
    /// `stloc.1`
    Stloc1 = 0x0B,
    /// `stloc.2`
    Stloc2 = 0x0C,
    /// `stloc.3`
    Stloc3 = 0x0D,
    /// `ldarg.s`
    LdargS = 0x0E,
    /// `ldarga.s`
    LdargaS = 0x0F,
    /// `starg.s`
    StargS = 0x10,
    /// `ldloc.s`
    LdlocS = 0x11,
    /// `ldloca.s`
    LdlocaS = 0x12,
    /// `stloc.s`
    StlocS = 0x13,
    // ===== Constants =====
    /// `ldnull`
    Ldnull = 0x14,
    /// `ldc.i4.m1`
    LdcI4M1 = 0x15,
    /// `ldc.i4.0`
    LdcI40 = 0x16,
    /// `ldc.i4.1`
    LdcI41 = 0x17,
    /// `ldc.i4.2`
    LdcI42 = 0x18,
    /// `ldc.i4.3`
    LdcI43 = 0x19,
    /// `ldc.i4.4`
    LdcI44 = 0x1A,
    /// `ldc.i4.5`
    LdcI45 = 0x1B,
    /// `ldc.i4.6`
    LdcI46 = 0x1C,
    /// `ldc.i4.7`
    LdcI47 = 0x1D,
    /// `ldc.i4.8`
    LdcI48 = 0x1E,
    /// `ldc.i4.s`
    LdcI4S = 0x1F,
    /// `ldc.i4`
    LdcI4 = 0x20,
    /// `ldc.i8`
    LdcI8 = 0x21,
    /// `ldc.r4`
    LdcR4 = 0x22,
    /// `ldc.r8`
    LdcR8 = 0x23,
    // ===== Stack =====
    /// `dup`
    Dup = 0x25,
    /// `pop`
    Pop = 0x26,
    // ===== Calls and branches =====
    /// `call`
    Call = 0x28,
    /// `ret`
    Ret = 0x2A,
    /// `br.s`
    BrS = 0x2B,
    /// `brfalse.s`
    BrfalseS = 0x2C,
    /// `brtrue.s`
    BrtrueS = 0x2D,
    /// `beq.s`
    BeqS = 0x2E,
    /// `bge.s`
    BgeS = 0x2F,
    /// `bgt.s`
    BgtS = 0x30,
    /// `ble.s`
    BleS = 0x31,
    /// `blt.s`
    BltS = 0x32,
    /// `bne.un.s`
    BneUnS = 0x33,
    /// `bge.un.s`
    BgeUnS = 0x34,
    /// `bgt.un.s`
    BgtUnS = 0x35,
    /// `ble.un.s`
    BleUnS = 0x36,
    /// `blt.un.s`
    BltUnS = 0x37,
    /// `br`
    Br = 0x38,
    /// `brfalse`
    Brfalse = 0x39,
    /// `brtrue`
    Brtrue = 0x3A,
    /// `beq`
    Beq = 0x3B,
    /// `bge`
    Bge = 0x3C,
    /// `bgt`
    Bgt = 0x3D,
    /// `ble`
    Ble = 0x3E,
    /// `blt`
    Blt = 0x3F,
    /// `bne.un`
    BneUn = 0x40,
    /// `bge.un`
    BgeUn = 0x41,
    /// `bgt.un`
    BgtUn = 0x42,
    /// `ble.un`
    BleUn = 0x43,
    /// `blt.un`
    BltUn = 0x44,
    /// `switch`
    Switch = 0x45,
    // ===== Indirect access =====
    /// `ldind.i1`
    LdindI1 = 0x46,
    /// `ldind.u1`
    LdindU1 = 0x47,
    /// `ldind.i2`
    LdindI2 = 0x48,
    /// `ldind.u2`
    LdindU2 = 0x49,
    /// `ldind.i4`
    LdindI4 = 0x4A,
    /// `ldind.u4`
    LdindU4 = 0x4B,
    /// `ldind.i8`
    LdindI8 = 0x4C,
    /// `ldind.i`
    LdindI = 0x4D,
    /// `ldind.r4`
    LdindR4 = 0x4E,
    /// `ldind.r8`
    LdindR8 = 0x4F,
    /// `ldind.ref`
    LdindRef = 0x50,
    /// `stind.ref`
    StindRef = 0x51,
    /// `stind.i1`
    StindI1 = 0x52,
    /// `stind.i2`
    StindI2 = 0x53,
    /// `stind.i4`
    StindI4 = 0x54,
    /// `stind.i8`
    StindI8 = 0x55,
    /// `stind.r4`
    StindR4 = 0x56,
    /// `stind.r8`
    StindR8 = 0x57,
    // ===== Arithmetic and bitwise =====
    /// `add`
    Add = 0x58,
    /// `sub`
    Sub = 0x59,
    /// `mul`
    Mul = 0x5A,
    /// `div`
    Div = 0x5B,
    /// `div.un`
    DivUn = 0x5C,
    /// `rem`
    Rem = 0x5D,
    /// `rem.un`
    RemUn = 0x5E,
    /// `and`
    And = 0x5F,
    /// `or`
    Or = 0x60,
    /// `xor`
    Xor = 0x61,
    /// `shl`
    Shl = 0x62,
    /// `shr`
    Shr = 0x63,
    /// `shr.un`
    ShrUn = 0x64,
    /// `neg`
    Neg = 0x65,
    /// `not`
    Not = 0x66,
    // ===== Conversions =====
    /// `conv.i1`
    ConvI1 = 0x67,
    /// `conv.i2`
    ConvI2 = 0x68,
    /// `conv.i4`
    ConvI4 = 0x69,
    /// `conv.i8`
    ConvI8 = 0x6A,
    /// `conv.r4`
    ConvR4 = 0x6B,
    /// `conv.r8`
    ConvR8 = 0x6C,
    /// `conv.u4`
    ConvU4 = 0x6D,
    /// `conv.u8`
    ConvU8 = 0x6E,
    // ===== Objects =====
    /// `callvirt`
    Callvirt = 0x6F,
    /// `ldobj`
    Ldobj = 0x71,
    /// `ldstr`
    Ldstr = 0x72,
    /// `newobj`
    Newobj = 0x73,
    /// `castclass`
    Castclass = 0x74,
    /// `isinst`
    Isinst = 0x75,
    /// `conv.r.un`
    ConvRUn = 0x76,
    /// `unbox`
    Unbox = 0x79,
    /// `throw`
    Throw = 0x7A,
    /// `ldfld`
    Ldfld = 0x7B,
    /// `ldflda`
    Ldflda = 0x7C,
    /// `stfld`
    Stfld = 0x7D,
    /// `ldsfld`
    Ldsfld = 0x7E,
    /// `ldsflda`
    Ldsflda = 0x7F,
    /// `stsfld`
    Stsfld = 0x80,
    /// `stobj`
    Stobj = 0x81,
    // ===== Boxing and arrays =====
    /// `box`
    Box = 0x8C,
    /// `newarr`
    Newarr = 0x8D,
    /// `ldlen`
    Ldlen = 0x8E,
    /// `ldelema`
    Ldelema = 0x8F,
    /// `ldelem.i1`
    LdelemI1 = 0x90,
    /// `ldelem.u1`
    LdelemU1 = 0x91,
    /// `ldelem.i2`
    LdelemI2 = 0x92,
    /// `ldelem.u2`
    LdelemU2 = 0x93,
    /// `ldelem.i4`
    LdelemI4 = 0x94,
    /// `ldelem.u4`
    LdelemU4 = 0x95,
    /// `ldelem.i8`
    LdelemI8 = 0x96,
    /// `ldelem.i`
    LdelemI = 0x97,
    /// `ldelem.r4`
    LdelemR4 = 0x98,
    /// `ldelem.r8`
    LdelemR8 = 0x99,
    /// `ldelem.ref`
    LdelemRef = 0x9A,
    /// `stelem.i`
    StelemI = 0x9B,
    /// `stelem.i1`
    StelemI1 = 0x9C,
    /// `stelem.i2`
    StelemI2 = 0x9D,
    /// `stelem.i4`
    StelemI4 = 0x9E,
    /// `stelem.i8`
    StelemI8 = 0x9F,
    /// `stelem.r4`
    StelemR4 = 0xA0,
    /// `stelem.r8`
    StelemR8 = 0xA1,
    /// `stelem.ref`
    StelemRef = 0xA2,
    /// `ldelem`
    Ldelem = 0xA3,
    /// `stelem`
    Stelem = 0xA4,
    /// `unbox.any`
    UnboxAny = 0xA5,
    // ===== Tokens, conversions and protected regions =====
    /// `ldtoken`
    Ldtoken = 0xD0,
    /// `conv.u2`
    ConvU2 = 0xD1,
    /// `conv.u1`
    ConvU1 = 0xD2,
    /// `conv.i`
    ConvI = 0xD3,
    /// `endfinally`
    Endfinally = 0xDC,
    /// `leave`
    Leave = 0xDD,
    /// `leave.s`
    LeaveS = 0xDE,
    /// `stind.i`
    StindI = 0xDF,
    /// `conv.u`
    ConvU = 0xE0,
    // ===== Two-byte (0xFE prefix) =====
    /// `ceq`
    Ceq = 0xFE01,
    /// `cgt`
    Cgt = 0xFE02,
    /// `cgt.un`
    CgtUn = 0xFE03,
    /// `clt`
    Clt = 0xFE04,
    /// `clt.un`
    CltUn = 0xFE05,
    /// `ldarg`
    Ldarg = 0xFE09,
    /// `ldarga`
    Ldarga = 0xFE0A,
    /// `starg`
    Starg = 0xFE0B,
    /// `ldloc`
    Ldloc = 0xFE0C,
    /// `ldloca`
    Ldloca = 0xFE0D,
    /// `stloc`
    Stloc = 0xFE0E,
    /// `initobj`
    Initobj = 0xFE15,
    /// `constrained.`
    Constrained = 0xFE16,
    /// `rethrow`
    Rethrow = 0xFE1A,
    /// `sizeof`
    Sizeof = 0xFE1C,
}

impl Opcode {
    /// Decode a single-byte opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Nop),
            0x02 => Some(Self::Ldarg0),
            0x03 => Some(Self::Ldarg1),
            0x04 => Some(Self::Ldarg2),
            0x05 => Some(Self::Ldarg3),
            0x06 => Some(Self::Ldloc0),
            0x07 => Some(Self::Ldloc1),
            0x08 => Some(Self::Ldloc2),
            0x09 => Some(Self::Ldloc3),
            0x0A => Some(Self::Stloc0),
            0x0B => Some(Self::Stloc1),
            0x0C => Some(Self::Stloc2),
            0x0D => Some(Self::Stloc3),
            0x0E => Some(Self::LdargS),
            0x0F => Some(Self::LdargaS),
            0x10 => Some(Self::StargS),
            0x11 => Some(Self::LdlocS),
            0x12 => Some(Self::LdlocaS),
            0x13 => Some(Self::StlocS),
            0x14 => Some(Self::Ldnull),
            0x15 => Some(Self::LdcI4M1),
            0x16 => Some(Self::LdcI40),
            0x17 => Some(Self::LdcI41),
            0x18 => Some(Self::LdcI42),
            0x19 => Some(Self::LdcI43),
            0x1A => Some(Self::LdcI44),
            0x1B => Some(Self::LdcI45),
            0x1C => Some(Self::LdcI46),
            0x1D => Some(Self::LdcI47),
            0x1E => Some(Self::LdcI48),
            0x1F => Some(Self::LdcI4S),
            0x20 => Some(Self::LdcI4),
            0x21 => Some(Self::LdcI8),
            0x22 => Some(Self::LdcR4),
            0x23 => Some(Self::LdcR8),
            0x25 => Some(Self::Dup),
            0x26 => Some(Self::Pop),
            0x28 => Some(Self::Call),
            0x2A => Some(Self::Ret),
            0x2B => Some(Self::BrS),
            0x2C => Some(Self::BrfalseS),
            0x2D => Some(Self::BrtrueS),
            0x2E => Some(Self::BeqS),
            0x2F => Some(Self::BgeS),
            0x30 => Some(Self::BgtS),
            0x31 => Some(Self::BleS),
            0x32 => Some(Self::BltS),
            0x33 => Some(Self::BneUnS),
            0x34 => Some(Self::BgeUnS),
            0x35 => Some(Self::BgtUnS),
            0x36 => Some(Self::BleUnS),
            0x37 => Some(Self::BltUnS),
            0x38 => Some(Self::Br),
            0x39 => Some(Self::Brfalse),
            0x3A => Some(Self::Brtrue),
            0x3B => Some(Self::Beq),
            0x3C => Some(Self::Bge),
            0x3D => Some(Self::Bgt),
            0x3E => Some(Self::Ble),
            0x3F => Some(Self::Blt),
            0x40 => Some(Self::BneUn),
            0x41 => Some(Self::BgeUn),
            0x42 => Some(Self::BgtUn),
            0x43 => Some(Self::BleUn),
            0x44 => Some(Self::BltUn),
            0x45 => Some(Self::Switch),
            0x46 => Some(Self::LdindI1),
            0x47 => Some(Self::LdindU1),
            0x48 => Some(Self::LdindI2),
            0x49 => Some(Self::LdindU2),
            0x4A => Some(Self::LdindI4),
            0x4B => Some(Self::LdindU4),
            0x4C => Some(Self::LdindI8),
            0x4D => Some(Self::LdindI),
            0x4E => Some(Self::LdindR4),
            0x4F => Some(Self::LdindR8),
            0x50 => Some(Self::LdindRef),
            0x51 => Some(Self::StindRef),
            0x52 => Some(Self::StindI1),
            0x53 => Some(Self::StindI2),
            0x54 => Some(Self::StindI4),
            0x55 => Some(Self::StindI8),
            0x56 => Some(Self::StindR4),
            0x57 => Some(Self::StindR8),
            0x58 => Some(Self::Add),
            0x59 => Some(Self::Sub),
            0x5A => Some(Self::Mul),
            0x5B => Some(Self::Div),
            0x5C => Some(Self::DivUn),
            0x5D => Some(Self::Rem),
            0x5E => Some(Self::RemUn),
            0x5F => Some(Self::And),
            0x60 => Some(Self::Or),
            0x61 => Some(Self::Xor),
            0x62 => Some(Self::Shl),
            0x63 => Some(Self::Shr),
            0x64 => Some(Self::ShrUn),
            0x65 => Some(Self::Neg),
            0x66 => Some(Self::Not),
            0x67 => Some(Self::ConvI1),
            0x68 => Some(Self::ConvI2),
            0x69 => Some(Self::ConvI4),
            0x6A => Some(Self::ConvI8),
            0x6B => Some(Self::ConvR4),
            0x6C => Some(Self::ConvR8),
            0x6D => Some(Self::ConvU4),
            0x6E => Some(Self::ConvU8),
            0x6F => Some(Self::Callvirt),
            0x71 => Some(Self::Ldobj),
            0x72 => Some(Self::Ldstr),
            0x73 => Some(Self::Newobj),
            0x74 => Some(Self::Castclass),
            0x75 => Some(Self::Isinst),
            0x76 => Some(Self::ConvRUn),
            0x79 => Some(Self::Unbox),
            0x7A => Some(Self::Throw),
            0x7B => Some(Self::Ldfld),
            0x7C => Some(Self::Ldflda),
            0x7D => Some(Self::Stfld),
            0x7E => Some(Self::Ldsfld),
            0x7F => Some(Self::Ldsflda),
            0x80 => Some(Self::Stsfld),
            0x81 => Some(Self::Stobj),
            0x8C => Some(Self::Box),
            0x8D => Some(Self::Newarr),
            0x8E => Some(Self::Ldlen),
            0x8F => Some(Self::Ldelema),
            0x90 => Some(Self::LdelemI1),
            0x91 => Some(Self::LdelemU1),
            0x92 => Some(Self::LdelemI2),
            0x93 => Some(Self::LdelemU2),
            0x94 => Some(Self::LdelemI4),
            0x95 => Some(Self::LdelemU4),
            0x96 => Some(Self::LdelemI8),
            0x97 => Some(Self::LdelemI),
            0x98 => Some(Self::LdelemR4),
            0x99 => Some(Self::LdelemR8),
            0x9A => Some(Self::LdelemRef),
            0x9B => Some(Self::StelemI),
            0x9C => Some(Self::StelemI1),
            0x9D => Some(Self::StelemI2),
            0x9E => Some(Self::StelemI4),
            0x9F => Some(Self::StelemI8),
            0xA0 => Some(Self::StelemR4),
            0xA1 => Some(Self::StelemR8),
            0xA2 => Some(Self::StelemRef),
            0xA3 => Some(Self::Ldelem),
            0xA4 => Some(Self::Stelem),
            0xA5 => Some(Self::UnboxAny),
            0xD0 => Some(Self::Ldtoken),
            0xD1 => Some(Self::ConvU2),
            0xD2 => Some(Self::ConvU1),
            0xD3 => Some(Self::ConvI),
            0xDC => Some(Self::Endfinally),
            0xDD => Some(Self::Leave),
            0xDE => Some(Self::LeaveS),
            0xDF => Some(Self::StindI),
            0xE0 => Some(Self::ConvU),
            _ => None,
        }
    }

    /// Decode the second byte of a two-byte opcode
    pub fn from_extended(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ceq),
            0x02 => Some(Self::Cgt),
            0x03 => Some(Self::CgtUn),
            0x04 => Some(Self::Clt),
            0x05 => Some(Self::CltUn),
            0x09 => Some(Self::Ldarg),
            0x0A => Some(Self::Ldarga),
            0x0B => Some(Self::Starg),
            0x0C => Some(Self::Ldloc),
            0x0D => Some(Self::Ldloca),
            0x0E => Some(Self::Stloc),
            0x15 => Some(Self::Initobj),
            0x16 => Some(Self::Constrained),
            0x1A => Some(Self::Rethrow),
            0x1C => Some(Self::Sizeof),
            _ => None,
        }
    }

    /// Raw discriminant
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Whether this opcode needs the escape prefix
    pub fn is_extended(self) -> bool {
        self.to_u16() > 0xFF
    }

    /// Encoded length of the opcode itself (1 or 2 bytes)
    pub fn encoded_len(self) -> usize {
        if self.is_extended() {
            2
        } else {
            1
        }
    }

    /// Operand encoding for this opcode
    pub fn operand(self) -> OperandKind {
        use OperandKind as K;
        match self {
            Self::LdargS | Self::LdargaS | Self::StargS | Self::LdlocS | Self::LdlocaS
            | Self::StlocS => K::ShortVar,
            Self::Ldarg | Self::Ldarga | Self::Starg | Self::Ldloc | Self::Ldloca | Self::Stloc => K::Var,
            Self::LdcI4S => K::I8,
            Self::LdcI4 => K::I32,
            Self::LdcI8 => K::I64,
            Self::LdcR4 => K::F32,
            Self::LdcR8 => K::F64,
            Self::Call | Self::Callvirt | Self::Ldobj | Self::Ldstr | Self::Newobj
            | Self::Castclass | Self::Isinst | Self::Unbox | Self::Ldfld | Self::Ldflda
            | Self::Stfld | Self::Ldsfld | Self::Ldsflda | Self::Stsfld | Self::Stobj
            | Self::Box | Self::Newarr | Self::Ldelema | Self::Ldelem | Self::Stelem
            | Self::UnboxAny | Self::Ldtoken | Self::Initobj | Self::Constrained | Self::Sizeof => K::Token,
            Self::BrS | Self::BrfalseS | Self::BrtrueS | Self::BeqS | Self::BgeS | Self::BgtS
            | Self::BleS | Self::BltS | Self::BneUnS | Self::BgeUnS | Self::BgtUnS
            | Self::BleUnS | Self::BltUnS | Self::LeaveS => K::ShortBranch,
            Self::Br | Self::Brfalse | Self::Brtrue | Self::Beq | Self::Bge | Self::Bgt
            | Self::Ble | Self::Blt | Self::BneUn | Self::BgeUn | Self::BgtUn | Self::BleUn
            | Self::BltUn | Self::Leave => K::Branch,
            Self::Switch => K::Switch,
            _ => K::None,
        }
    }

    /// Human-readable mnemonic
    pub fn name(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Ldarg0 => "ldarg.0",
            Self::Ldarg1 => "ldarg.1",
            Self::Ldarg2 => "ldarg.2",
            Self::Ldarg3 => "ldarg.3",
            Self::Ldloc0 => "ldloc.0",
            Self::Ldloc1 => "ldloc.1",
            Self::Ldloc2 => "ldloc.2",
            Self::Ldloc3 => "ldloc.3",
            Self::Stloc0 => "stloc.0",
            Self::Stloc1 => "stloc.1",
            Self::Stloc2 => "stloc.2",
            Self::Stloc3 => "stloc.3",
            Self::LdargS => "ldarg.s",
            Self::LdargaS => "ldarga.s",
            Self::StargS => "starg.s",
            Self::LdlocS => "ldloc.s",
            Self::LdlocaS => "ldloca.s",
            Self::StlocS => "stloc.s",
            Self::Ldnull => "ldnull",
            Self::LdcI4M1 => "ldc.i4.m1",
            Self::LdcI40 => "ldc.i4.0",
            Self::LdcI41 => "ldc.i4.1",
            Self::LdcI42 => "ldc.i4.2",
            Self::LdcI43 => "ldc.i4.3",
            Self::LdcI44 => "ldc.i4.4",
            Self::LdcI45 => "ldc.i4.5",
            Self::LdcI46 => "ldc.i4.6",
            Self::LdcI47 => "ldc.i4.7",
            Self::LdcI48 => "ldc.i4.8",
            Self::LdcI4S => "ldc.i4.s",
            Self::LdcI4 => "ldc.i4",
            Self::LdcI8 => "ldc.i8",
            Self::LdcR4 => "ldc.r4",
            Self::LdcR8 => "ldc.r8",
            Self::Dup => "dup",
            Self::Pop => "pop",
            Self::Call => "call",
            Self::Ret => "ret",
            Self::BrS => "br.s",
            Self::BrfalseS => "brfalse.s",
            Self::BrtrueS => "brtrue.s",
            Self::BeqS => "beq.s",
            Self::BgeS => "bge.s",
            Self::BgtS => "bgt.s",
            Self::BleS => "ble.s",
            Self::BltS => "blt.s",
            Self::BneUnS => "bne.un.s",
            Self::BgeUnS => "bge.un.s",
            Self::BgtUnS => "bgt.un.s",
            Self::BleUnS => "ble.un.s",
            Self::BltUnS => "blt.un.s",
            Self::Br => "br",
            Self::Brfalse => "brfalse",
            Self::Brtrue => "brtrue",
            Self::Beq => "beq",
            Self::Bge => "bge",
            Self::Bgt => "bgt",
            Self::Ble => "ble",
            Self::Blt => "blt",
            Self::BneUn => "bne.un",
            Self::BgeUn => "bge.un",
            Self::BgtUn => "bgt.un",
            Self::BleUn => "ble.un",
            Self::BltUn => "blt.un",
            Self::Switch => "switch",
            Self::LdindI1 => "ldind.i1",
            Self::LdindU1 => "ldind.u1",
            Self::LdindI2 => "ldind.i2",
            Self::LdindU2 => "ldind.u2",
            Self::LdindI4 => "ldind.i4",
            Self::LdindU4 => "ldind.u4",
            Self::LdindI8 => "ldind.i8",
            Self::LdindI => "ldind.i",
            Self::LdindR4 => "ldind.r4",
            Self::LdindR8 => "ldind.r8",
            Self::LdindRef => "ldind.ref",
            Self::StindRef => "stind.ref",
            Self::StindI1 => "stind.i1",
            Self::StindI2 => "stind.i2",
            Self::StindI4 => "stind.i4",
            Self::StindI8 => "stind.i8",
            Self::StindR4 => "stind.r4",
            Self::StindR8 => "stind.r8",
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::DivUn => "div.un",
            Self::Rem => "rem",
            Self::RemUn => "rem.un",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
            Self::Shl => "shl",
            Self::Shr => "shr",
            Self::ShrUn => "shr.un",
            Self::Neg => "neg",
            Self::Not => "not",
            Self::ConvI1 => "conv.i1",
            Self::ConvI2 => "conv.i2",
            Self::ConvI4 => "conv.i4",
            Self::ConvI8 => "conv.i8",
            Self::ConvR4 => "conv.r4",
            Self::ConvR8 => "conv.r8",
            Self::ConvU4 => "conv.u4",
            Self::ConvU8 => "conv.u8",
            Self::Callvirt => "callvirt",
            Self::Ldobj => "ldobj",
            Self::Ldstr => "ldstr",
            Self::Newobj => "newobj",
            Self::Castclass => "castclass",
            Self::Isinst => "isinst",
            Self::ConvRUn => "conv.r.un",
            Self::Unbox => "unbox",
            Self::Throw => "throw",
            Self::Ldfld => "ldfld",
            Self::Ldflda => "ldflda",
            Self::Stfld => "stfld",
            Self::Ldsfld => "ldsfld",
            Self::Ldsflda => "ldsflda",
            Self::Stsfld => "stsfld",
            Self::Stobj => "stobj",
            Self::Box => "box",
            Self::Newarr => "newarr",
            Self::Ldlen => "ldlen",
            Self::Ldelema => "ldelema",
            Self::LdelemI1 => "ldelem.i1",
            Self::LdelemU1 => "ldelem.u1",
            Self::LdelemI2 => "ldelem.i2",
            Self::LdelemU2 => "ldelem.u2",
            Self::LdelemI4 => "ldelem.i4",
            Self::LdelemU4 => "ldelem.u4",
            Self::LdelemI8 => "ldelem.i8",
            Self::LdelemI => "ldelem.i",
            Self::LdelemR4 => "ldelem.r4",
            Self::LdelemR8 => "ldelem.r8",
            Self::LdelemRef => "ldelem.ref",
            Self::StelemI => "stelem.i",
            Self::StelemI1 => "stelem.i1",
            Self::StelemI2 => "stelem.i2",
            Self::StelemI4 => "stelem.i4",
            Self::StelemI8 => "stelem.i8",
            Self::StelemR4 => "stelem.r4",
            Self::StelemR8 => "stelem.r8",
            Self::StelemRef => "stelem.ref",
            Self::Ldelem => "ldelem",
            Self::Stelem => "stelem",
            Self::UnboxAny => "unbox.any",
            Self::Ldtoken => "ldtoken",
            Self::ConvU2 => "conv.u2",
            Self::ConvU1 => "conv.u1",
            Self::ConvI => "conv.i",
            Self::Endfinally => "endfinally",
            Self::Leave => "leave",
            Self::LeaveS => "leave.s",
            Self::StindI => "stind.i",
            Self::ConvU => "conv.u",
            Self::Ceq => "ceq",
            Self::Cgt => "cgt",
            Self::CgtUn => "cgt.un",
            Self::Clt => "clt",
            Self::CltUn => "clt.un",
            Self::Ldarg => "ldarg",
            Self::Ldarga => "ldarga",
            Self::Starg => "starg",
            Self::Ldloc => "ldloc",
            Self::Ldloca => "ldloca",
            Self::Stloc => "stloc",
            Self::Initobj => "initobj",
            Self::Constrained => "constrained.",
            Self::Rethrow => "rethrow",
            Self::Sizeof => "sizeof",
        }
    }

    /// Check if this opcode transfers control to a relative target
    pub fn is_branch(self) -> bool {
        matches!(
            self.operand(),
            OperandKind::ShortBranch | OperandKind::Branch | OperandKind::Switch
        )
    }

    /// Check if this opcode is a protected-region exit
    pub fn is_leave(self) -> bool {
        matches!(self, Self::Leave | Self::LeaveS)
    }

    /// Check if this opcode is a call instruction
    pub fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::Callvirt | Self::Newobj)
    }

    /// Check if execution never falls through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Self::Ret
                | Self::Br
                | Self::BrS
                | Self::Leave
                | Self::LeaveS
                | Self::Throw
                | Self::Rethrow
                | Self::Endfinally
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
