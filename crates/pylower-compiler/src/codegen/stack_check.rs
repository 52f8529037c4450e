//! Abstract interpretation of a finished unit's stack depth.
//!
//! Every reachable instruction must be entered with one consistent depth,
//! no instruction may take the stack below zero, and control must never run
//! past the last instruction. Handler setups contribute an edge to their
//! handler with the depth the handler is entered at.

use pylower_common::ir::{CodeUnit, Label};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    #[error("stack underflow at instruction {index} ({op})")]
    Negative { index: usize, op: String },
    #[error("inconsistent stack depth at instruction {index}: {first} vs {second}")]
    Mismatch { index: usize, first: i32, second: i32 },
    #[error("label {0} is jumped to but never placed")]
    UnplacedLabel(Label),
    #[error("control falls off the end of {0}")]
    FallsOffEnd(String),
    #[error("jump target of instruction {index} is out of range")]
    InvalidTarget { index: usize },
}

/// Check the stack discipline of `unit` and return its maximum depth.
pub fn verify_unit(unit: &CodeUnit) -> Result<u32, StackError> {
    let count = unit.instructions.len();
    if count == 0 {
        return Err(StackError::FallsOffEnd(unit.qualname.clone()));
    }
    let mut depths: Vec<Option<i32>> = vec![None; count];
    let mut worklist = vec![0usize];
    depths[0] = Some(0);
    let mut max_depth = 0i32;

    while let Some(index) = worklist.pop() {
        let Some(depth) = depths[index] else {
            continue;
        };
        let instr = &unit.instructions[index];
        let oparg = instr.arg.raw();
        let negative = || StackError::Negative {
            index,
            op: instr.op.name(),
        };

        if instr.op.is_jump() {
            let label = instr.arg.label().ok_or(StackError::InvalidTarget { index })?;
            let target = unit
                .label_target(label)
                .ok_or(StackError::UnplacedLabel(label))?;
            if target > count {
                return Err(StackError::InvalidTarget { index });
            }
            if target == count {
                return Err(StackError::FallsOffEnd(unit.qualname.clone()));
            }
            let taken = depth + instr.op.stack_effect(oparg, true);
            if taken < 0 {
                return Err(negative());
            }
            max_depth = max_depth.max(taken);
            merge(&mut depths, &mut worklist, target, taken)?;
        }

        let next = depth + instr.op.stack_effect(oparg, false);
        if next < 0 {
            return Err(negative());
        }
        max_depth = max_depth.max(next);
        if instr.op.is_terminator() {
            continue;
        }
        if index + 1 == count {
            return Err(StackError::FallsOffEnd(unit.qualname.clone()));
        }
        merge(&mut depths, &mut worklist, index + 1, next)?;
    }
    Ok(max_depth as u32)
}

fn merge(
    depths: &mut [Option<i32>],
    worklist: &mut Vec<usize>,
    index: usize,
    depth: i32,
) -> Result<(), StackError> {
    match depths[index] {
        None => {
            depths[index] = Some(depth);
            worklist.push(index);
            Ok(())
        }
        Some(first) if first == depth => Ok(()),
        Some(first) => Err(StackError::Mismatch {
            index,
            first,
            second: depth,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_common::ir::{CodeFlags, Instruction, Operand, UnitKind};
    use pylower_common::Opcode;

    fn unit(instructions: Vec<(Opcode, Operand)>, labels: Vec<Option<usize>>) -> CodeUnit {
        CodeUnit {
            name: "u".into(),
            qualname: "u".into(),
            kind: UnitKind::Module,
            filename: String::new(),
            first_line: 1,
            argcount: 0,
            posonlyargcount: 0,
            kwonlyargcount: 0,
            flags: CodeFlags::default(),
            max_stack_depth: 0,
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            cellvars: Vec::new(),
            freevars: Vec::new(),
            instructions: instructions
                .into_iter()
                .map(|(op, arg)| Instruction { op, arg, span: None })
                .collect(),
            labels,
        }
    }

    #[test]
    fn straight_line_depth() {
        let u = unit(
            vec![
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::BinaryOp, Operand::Int(0)),
                (Opcode::ReturnValue, Operand::None),
            ],
            vec![],
        );
        assert_eq!(verify_unit(&u), Ok(2));
    }

    #[test]
    fn join_points_must_agree() {
        // one branch pushes an extra value before joining
        let u = unit(
            vec![
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::PopJumpIfFalse, Operand::Label(Label(0))),
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::Nop, Operand::None),
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::ReturnValue, Operand::None),
            ],
            vec![Some(3)],
        );
        assert!(matches!(verify_unit(&u), Err(StackError::Mismatch { index: 3, .. })));
    }

    #[test]
    fn underflow_is_reported() {
        let u = unit(vec![(Opcode::PopTop, Operand::None)], vec![]);
        assert!(matches!(verify_unit(&u), Err(StackError::Negative { index: 0, .. })));
    }

    #[test]
    fn falling_off_the_end_is_reported() {
        let u = unit(vec![(Opcode::Nop, Operand::None)], vec![]);
        assert_eq!(verify_unit(&u), Err(StackError::FallsOffEnd("u".into())));
    }

    #[test]
    fn unplaced_label_is_reported() {
        let u = unit(
            vec![
                (Opcode::Jump, Operand::Label(Label(0))),
            ],
            vec![None],
        );
        assert_eq!(verify_unit(&u), Err(StackError::UnplacedLabel(Label(0))));
    }

    #[test]
    fn handler_entered_with_exception_pushed() {
        let u = unit(
            vec![
                (Opcode::SetupCleanup, Operand::Label(Label(0))),
                (Opcode::LoadConst, Operand::Const(0)),
                (Opcode::ReturnValue, Operand::None),
                (Opcode::CallIntrinsic1, Operand::Int(3)),
                (Opcode::Reraise, Operand::Int(1)),
            ],
            vec![Some(3)],
        );
        assert_eq!(verify_unit(&u), Ok(2));
    }
}
