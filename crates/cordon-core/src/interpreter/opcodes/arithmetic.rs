use crate::error::{FaultKind, ScriptException};
use crate::interpreter::core::{misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::value::{Numeric, Value};
use cordon_bytecode::Opcode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

fn divide_by_zero() -> Trap {
    Trap::Throw(ScriptException::new(
        "System.DivideByZeroException",
        "Attempted to divide by zero.",
    ))
}

fn overflow() -> Trap {
    Trap::Throw(ScriptException::new(
        "System.OverflowException",
        "Arithmetic operation resulted in an overflow.",
    ))
}

fn float_operand() -> Trap {
    Trap::Fault(FaultKind::TypeMismatch {
        expected: "integer",
        found: "float",
    })
}

macro_rules! int_binary {
    ($ctor:path, $x:expr, $y:expr, $op:expr) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinaryOp::Add => Ok($ctor(x.wrapping_add(y))),
            BinaryOp::Sub => Ok($ctor(x.wrapping_sub(y))),
            BinaryOp::Mul => Ok($ctor(x.wrapping_mul(y))),
            BinaryOp::Div if y == 0 => Err(divide_by_zero()),
            BinaryOp::Div => x.checked_div(y).map($ctor).ok_or_else(overflow),
            BinaryOp::Rem if y == 0 => Err(divide_by_zero()),
            BinaryOp::Rem => x.checked_rem(y).map($ctor).ok_or_else(overflow),
            BinaryOp::And => Ok($ctor(x & y)),
            BinaryOp::Or => Ok($ctor(x | y)),
            BinaryOp::Xor => Ok($ctor(x ^ y)),
        }
    }};
}

macro_rules! float_binary {
    ($ctor:path, $x:expr, $y:expr, $op:expr) => {{
        let (x, y) = ($x, $y);
        match $op {
            BinaryOp::Add => Ok($ctor(x + y)),
            BinaryOp::Sub => Ok($ctor(x - y)),
            BinaryOp::Mul => Ok($ctor(x * y)),
            BinaryOp::Div => Ok($ctor(x / y)),
            BinaryOp::Rem => Ok($ctor(x % y)),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => Err(float_operand()),
        }
    }};
}

/// Apply a binary operator at the operands' common rank
fn binary(op: BinaryOp, a: Numeric, b: Numeric, unsigned: bool) -> Result<Numeric, Trap> {
    let (a, b) = a.promote(b);
    if unsigned {
        if a.is_float() {
            return Err(float_operand());
        }
        let signed = matches!(a, Numeric::Int(_) | Numeric::Long(_));
        let result = binary(op, a.as_unsigned(), b.as_unsigned(), false)?;
        return Ok(if signed { result.as_signed() } else { result });
    }
    match (a, b) {
        (Numeric::Int(x), Numeric::Int(y)) => int_binary!(Numeric::Int, x, y, op),
        (Numeric::Uint(x), Numeric::Uint(y)) => int_binary!(Numeric::Uint, x, y, op),
        (Numeric::Long(x), Numeric::Long(y)) => int_binary!(Numeric::Long, x, y, op),
        (Numeric::Ulong(x), Numeric::Ulong(y)) => int_binary!(Numeric::Ulong, x, y, op),
        (Numeric::Float(x), Numeric::Float(y)) => float_binary!(Numeric::Float, x, y, op),
        (Numeric::Double(x), Numeric::Double(y)) => float_binary!(Numeric::Double, x, y, op),
        _ => Err(float_operand()),
    }
}

/// Shift `value` keeping its own width; `shr` is arithmetic, `shr.un` logical
fn shift(opcode: Opcode, value: Numeric, amount: Numeric) -> Result<Numeric, Trap> {
    if amount.is_float() {
        return Err(float_operand());
    }
    let n = amount.to_i64() as u32;
    Ok(match (opcode, value) {
        (Opcode::Shl, Numeric::Int(v)) => Numeric::Int(v.wrapping_shl(n)),
        (Opcode::Shl, Numeric::Uint(v)) => Numeric::Uint(v.wrapping_shl(n)),
        (Opcode::Shl, Numeric::Long(v)) => Numeric::Long(v.wrapping_shl(n)),
        (Opcode::Shl, Numeric::Ulong(v)) => Numeric::Ulong(v.wrapping_shl(n)),
        (Opcode::Shr, Numeric::Int(v)) => Numeric::Int(v.wrapping_shr(n)),
        (Opcode::Shr, Numeric::Uint(v)) => Numeric::Uint((v as i32).wrapping_shr(n) as u32),
        (Opcode::Shr, Numeric::Long(v)) => Numeric::Long(v.wrapping_shr(n)),
        (Opcode::Shr, Numeric::Ulong(v)) => Numeric::Ulong((v as i64).wrapping_shr(n) as u64),
        (Opcode::ShrUn, Numeric::Int(v)) => Numeric::Int((v as u32).wrapping_shr(n) as i32),
        (Opcode::ShrUn, Numeric::Uint(v)) => Numeric::Uint(v.wrapping_shr(n)),
        (Opcode::ShrUn, Numeric::Long(v)) => Numeric::Long((v as u64).wrapping_shr(n) as i64),
        (Opcode::ShrUn, Numeric::Ulong(v)) => Numeric::Ulong(v.wrapping_shr(n)),
        _ => return Err(float_operand()),
    })
}

/// Numeric conversion (`conv.*`)
fn convert(opcode: Opcode, n: Numeric) -> Result<Value, Trap> {
    let int = n.to_i64();
    Ok(match opcode {
        Opcode::ConvI1 => Value::I8(int as i8),
        Opcode::ConvU1 => Value::U8(int as u8),
        Opcode::ConvI2 => Value::I16(int as i16),
        Opcode::ConvU2 => Value::U16(int as u16),
        Opcode::ConvI4 => Value::I32(int as i32),
        Opcode::ConvU4 => Value::U32(int as u32),
        Opcode::ConvI8 | Opcode::ConvI => Value::I64(int),
        Opcode::ConvU8 | Opcode::ConvU => Value::U64(match n {
            Numeric::Int(v) => v as u32 as u64,
            Numeric::Uint(v) => v as u64,
            Numeric::Long(v) => v as u64,
            Numeric::Ulong(v) => v,
            Numeric::Float(v) => v as u64,
            Numeric::Double(v) => v as u64,
        }),
        Opcode::ConvR4 => Value::F32(match n {
            Numeric::Int(v) => v as f32,
            Numeric::Uint(v) => v as f32,
            Numeric::Long(v) => v as f32,
            Numeric::Ulong(v) => v as f32,
            Numeric::Float(v) => v,
            Numeric::Double(v) => v as f32,
        }),
        Opcode::ConvR8 => Value::F64(n.to_f64()),
        Opcode::ConvRUn => Value::F64(n.as_unsigned().to_f64()),
        _ => return Err(misrouted(opcode)),
    })
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_arithmetic_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        let result = match opcode {
            // =========================================================
            // Binary Arithmetic and Bitwise
            // =========================================================
            Opcode::Add | Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::DivUn | Opcode::Rem
            | Opcode::RemUn | Opcode::And | Opcode::Or | Opcode::Xor => {
                let (op, unsigned) = match opcode {
                    Opcode::Add => (BinaryOp::Add, false),
                    Opcode::Sub => (BinaryOp::Sub, false),
                    Opcode::Mul => (BinaryOp::Mul, false),
                    Opcode::Div => (BinaryOp::Div, false),
                    Opcode::DivUn => (BinaryOp::Div, true),
                    Opcode::Rem => (BinaryOp::Rem, false),
                    Opcode::RemUn => (BinaryOp::Rem, true),
                    Opcode::And => (BinaryOp::And, false),
                    Opcode::Or => (BinaryOp::Or, false),
                    _ => (BinaryOp::Xor, false),
                };
                let b = self.pop_numeric(frame)?;
                let a = self.pop_numeric(frame)?;
                Value::from(binary(op, a, b, unsigned)?)
            }

            Opcode::Shl | Opcode::Shr | Opcode::ShrUn => {
                let amount = self.pop_numeric(frame)?;
                let value = self.pop_numeric(frame)?;
                Value::from(shift(opcode, value, amount)?)
            }

            // =========================================================
            // Unary
            // =========================================================
            Opcode::Neg => Value::from(match self.pop_numeric(frame)? {
                Numeric::Int(v) => Numeric::Int(v.wrapping_neg()),
                Numeric::Uint(v) => Numeric::Uint(v.wrapping_neg()),
                Numeric::Long(v) => Numeric::Long(v.wrapping_neg()),
                Numeric::Ulong(v) => Numeric::Ulong(v.wrapping_neg()),
                Numeric::Float(v) => Numeric::Float(-v),
                Numeric::Double(v) => Numeric::Double(-v),
            }),

            Opcode::Not => Value::from(match self.pop_numeric(frame)? {
                Numeric::Int(v) => Numeric::Int(!v),
                Numeric::Uint(v) => Numeric::Uint(!v),
                Numeric::Long(v) => Numeric::Long(!v),
                Numeric::Ulong(v) => Numeric::Ulong(!v),
                Numeric::Float(_) | Numeric::Double(_) => return Err(float_operand()),
            }),

            // =========================================================
            // Conversions
            // =========================================================
            Opcode::ConvI1 | Opcode::ConvI2 | Opcode::ConvI4 | Opcode::ConvI8 | Opcode::ConvR4
            | Opcode::ConvR8 | Opcode::ConvU4 | Opcode::ConvU8 | Opcode::ConvRUn | Opcode::ConvU2
            | Opcode::ConvU1 | Opcode::ConvI | Opcode::ConvU => {
                let n = self.pop_numeric(frame)?;
                convert(opcode, n)?
            }

            _ => return Err(misrouted(opcode)),
        };
        self.push(frame, result)?;
        Ok(OpcodeResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thrown(result: Result<Numeric, Trap>) -> String {
        match result {
            Err(Trap::Throw(e)) => e.type_name,
            other => panic!("expected throw, got {:?}", other),
        }
    }

    #[test]
    fn test_wrapping_integer_arithmetic() {
        let max = Numeric::Int(i32::MAX);
        assert_eq!(binary(BinaryOp::Add, max, Numeric::Int(1), false).unwrap(), Numeric::Int(i32::MIN));
        assert_eq!(
            binary(BinaryOp::Mul, Numeric::Long(i64::MAX), Numeric::Int(2), false).unwrap(),
            Numeric::Long(-2)
        );
    }

    #[test]
    fn test_division_exceptions() {
        assert_eq!(
            thrown(binary(BinaryOp::Div, Numeric::Int(1), Numeric::Int(0), false)),
            "System.DivideByZeroException"
        );
        assert_eq!(
            thrown(binary(BinaryOp::Rem, Numeric::Long(1), Numeric::Long(0), false)),
            "System.DivideByZeroException"
        );
        assert_eq!(
            thrown(binary(BinaryOp::Div, Numeric::Int(i32::MIN), Numeric::Int(-1), false)),
            "System.OverflowException"
        );
        // Floats follow IEEE semantics
        assert_eq!(
            binary(BinaryOp::Div, Numeric::Double(1.0), Numeric::Double(0.0), false).unwrap(),
            Numeric::Double(f64::INFINITY)
        );
    }

    #[test]
    fn test_unsigned_division_reinterprets() {
        // -2 as uint is 0xFFFFFFFE
        assert_eq!(
            binary(BinaryOp::Div, Numeric::Int(-2), Numeric::Int(2), true).unwrap(),
            Numeric::Int(0x7FFF_FFFF)
        );
        assert_eq!(
            binary(BinaryOp::Rem, Numeric::Uint(7), Numeric::Uint(4), true).unwrap(),
            Numeric::Uint(3)
        );
        assert!(matches!(
            binary(BinaryOp::Div, Numeric::Float(1.0), Numeric::Float(2.0), true),
            Err(Trap::Fault(_))
        ));
    }

    #[test]
    fn test_mixed_rank_promotion() {
        assert_eq!(
            binary(BinaryOp::Add, Numeric::Int(1), Numeric::Double(0.5), false).unwrap(),
            Numeric::Double(1.5)
        );
        assert_eq!(
            binary(BinaryOp::Sub, Numeric::Int(-1), Numeric::Long(1), false).unwrap(),
            Numeric::Long(-2)
        );
    }

    #[test]
    fn test_bitwise_on_float_faults() {
        assert!(matches!(
            binary(BinaryOp::And, Numeric::Float(1.0), Numeric::Int(1), false),
            Err(Trap::Fault(FaultKind::TypeMismatch { .. }))
        ));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(shift(Opcode::Shl, Numeric::Int(1), Numeric::Int(31)).unwrap(), Numeric::Int(i32::MIN));
        assert_eq!(shift(Opcode::Shr, Numeric::Int(-8), Numeric::Int(1)).unwrap(), Numeric::Int(-4));
        assert_eq!(
            shift(Opcode::ShrUn, Numeric::Int(-8), Numeric::Int(28)).unwrap(),
            Numeric::Int(0xF)
        );
        assert_eq!(shift(Opcode::Shl, Numeric::Long(1), Numeric::Int(40)).unwrap(), Numeric::Long(1 << 40));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(convert(Opcode::ConvU1, Numeric::Int(300)).unwrap(), Value::U8(44));
        assert!(matches!(convert(Opcode::ConvI1, Numeric::Int(200)).unwrap(), Value::I8(-56)));
        assert!(matches!(convert(Opcode::ConvI8, Numeric::Int(-1)).unwrap(), Value::I64(-1)));
        assert!(matches!(convert(Opcode::ConvU8, Numeric::Int(-1)).unwrap(), Value::U64(0xFFFF_FFFF)));
        assert!(matches!(convert(Opcode::ConvI4, Numeric::Double(-2.7)).unwrap(), Value::I32(-2)));
        assert!(matches!(
            convert(Opcode::ConvRUn, Numeric::Int(-1)).unwrap(),
            Value::F64(v) if v == u32::MAX as f64
        ));
    }
}
