use pylower_common::ir::{Instruction, Label};

use crate::error::{CompileError, CompileErrorKind, CompileResult};

/// Growable instruction buffer of one unit, with the label table that
/// jump operands index into.
#[derive(Debug, Default)]
pub struct InstrSeq {
    instructions: Vec<Instruction>,
    labels: Vec<Option<usize>>,
}

impl InstrSeq {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a label that is not yet placed.
    pub fn new_label(&mut self) -> CompileResult<Label> {
        self.labels
            .try_reserve(1)
            .map_err(|_| CompileError::internal(CompileErrorKind::AllocationFailed("label table")))?;
        let id = u32::try_from(self.labels.len())
            .map_err(|_| CompileError::internal(CompileErrorKind::AllocationFailed("label table")))?;
        self.labels.push(None);
        Ok(Label(id))
    }

    /// Bind `label` to the position of the next instruction.
    pub fn place(&mut self, label: Label) -> CompileResult<()> {
        let at = self.instructions.len();
        match self.labels.get_mut(label.0 as usize) {
            None => Err(CompileError::internal(CompileErrorKind::UnknownLabel(label))),
            Some(Some(_)) => Err(CompileError::internal(CompileErrorKind::LabelPlacedTwice(label))),
            Some(slot) => {
                *slot = Some(at);
                Ok(())
            }
        }
    }

    pub fn push(&mut self, instr: Instruction) -> CompileResult<()> {
        self.instructions
            .try_reserve(1)
            .map_err(|_| CompileError::internal(CompileErrorKind::AllocationFailed("instruction buffer")))?;
        self.instructions.push(instr);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn last(&self) -> Option<&Instruction> {
        self.instructions.last()
    }

    /// Whether some label points just past the last instruction, so the
    /// stream cannot simply end there.
    pub fn has_label_at_end(&self) -> bool {
        let end = self.instructions.len();
        self.labels.iter().any(|l| *l == Some(end))
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Hand over the finished stream. Every label a jump refers to must be placed.
    pub fn finish(self) -> CompileResult<(Vec<Instruction>, Vec<Option<usize>>)> {
        for instr in &self.instructions {
            if let Some(label) = instr.arg.label() {
                match self.labels.get(label.0 as usize) {
                    Some(Some(_)) => {}
                    Some(None) => {
                        return Err(CompileError::internal(CompileErrorKind::UnplacedLabel(label)))
                    }
                    None => return Err(CompileError::internal(CompileErrorKind::UnknownLabel(label))),
                }
            }
        }
        Ok((self.instructions, self.labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pylower_common::ir::Operand;
    use pylower_common::Opcode;

    fn instr(op: Opcode, arg: Operand) -> Instruction {
        Instruction { op, arg, span: None }
    }

    #[test]
    fn labels_bind_to_next_instruction() {
        let mut seq = InstrSeq::new();
        let target = seq.new_label().unwrap();
        seq.push(instr(Opcode::Nop, Operand::None)).unwrap();
        seq.place(target).unwrap();
        seq.push(instr(Opcode::Jump, Operand::Label(target))).unwrap();
        let (instructions, labels) = seq.finish().unwrap();
        assert_eq!(instructions.len(), 2);
        assert_eq!(labels[target.0 as usize], Some(1));
    }

    #[test]
    fn placing_twice_fails() {
        let mut seq = InstrSeq::new();
        let l = seq.new_label().unwrap();
        seq.place(l).unwrap();
        let err = seq.place(l).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::LabelPlacedTwice(l));
    }

    #[test]
    fn unplaced_jump_target_is_reported() {
        let mut seq = InstrSeq::new();
        let l = seq.new_label().unwrap();
        seq.push(instr(Opcode::Jump, Operand::Label(l))).unwrap();
        let err = seq.finish().unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnplacedLabel(l));
    }

    #[test]
    fn label_at_end() {
        let mut seq = InstrSeq::new();
        seq.push(instr(Opcode::Nop, Operand::None)).unwrap();
        assert!(!seq.has_label_at_end());
        let l = seq.new_label().unwrap();
        seq.place(l).unwrap();
        assert!(seq.has_label_at_end());
    }
}
