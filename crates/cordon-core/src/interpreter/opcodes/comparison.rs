use crate::interpreter::core::{mismatch, misrouted, Frame, OpResult, OpcodeResult, Trap};
use crate::interpreter::Interpreter;
use crate::value::Value;
use cordon_bytecode::Opcode;
use std::cmp::Ordering;

/// Relation tested by a comparison or conditional branch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(in crate::interpreter) enum Condition {
    Eq,
    NeUn,
    Ge,
    Gt,
    Le,
    Lt,
    GeUn,
    GtUn,
    LeUn,
    LtUn,
}

impl Condition {
    fn is_unsigned(self) -> bool {
        matches!(
            self,
            Condition::NeUn | Condition::GeUn | Condition::GtUn | Condition::LeUn | Condition::LtUn
        )
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Condition::Eq => ordering == Ordering::Equal,
            Condition::NeUn => ordering != Ordering::Equal,
            Condition::Ge | Condition::GeUn => ordering != Ordering::Less,
            Condition::Gt | Condition::GtUn => ordering == Ordering::Greater,
            Condition::Le | Condition::LeUn => ordering != Ordering::Greater,
            Condition::Lt | Condition::LtUn => ordering == Ordering::Less,
        }
    }
}

/// Evaluate `a <cond> b`
///
/// Unsigned conditions reinterpret integers as unsigned and treat unordered
/// floats as satisfying the relation. Object references support equality
/// only; `cgt.un` against null is the usual inequality idiom.
pub(in crate::interpreter) fn compare_values(a: &Value, b: &Value, cond: Condition) -> Result<bool, Trap> {
    match (a, b) {
        (Value::Object(x), Value::Object(y)) => match cond {
            Condition::Eq => Ok(x.ref_eq(y)),
            Condition::NeUn | Condition::GtUn => Ok(!x.ref_eq(y)),
            _ => Err(mismatch("number", a)),
        },
        _ => {
            let x = a.numeric().ok_or_else(|| mismatch("number", a))?;
            let y = b.numeric().ok_or_else(|| mismatch("number", b))?;
            let (mut x, mut y) = x.promote(y);
            if cond.is_unsigned() && !x.is_float() {
                x = x.as_unsigned();
                y = y.as_unsigned();
            }
            Ok(match x.compare(y) {
                Some(ordering) => cond.holds(ordering),
                None => cond.is_unsigned(),
            })
        }
    }
}

impl<'a> Interpreter<'a> {
    pub(in crate::interpreter) fn exec_comparison_ops(&mut self, frame: &mut Frame<'a>, opcode: Opcode) -> OpResult {
        let cond = match opcode {
            Opcode::Ceq => Condition::Eq,
            Opcode::Cgt => Condition::Gt,
            Opcode::CgtUn => Condition::GtUn,
            Opcode::Clt => Condition::Lt,
            Opcode::CltUn => Condition::LtUn,
            _ => return Err(misrouted(opcode)),
        };
        let b = self.pop(frame)?;
        let a = self.pop(frame)?;
        let result = compare_values(&a, &b, cond)?;
        self.push(frame, Value::I32(result as i32))?;
        Ok(OpcodeResult::Continue)
    }
}
