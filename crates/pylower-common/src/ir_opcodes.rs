use serde::{Deserialize, Serialize};

/// Instruction set of the target stack machine.
///
/// Operands are carried separately on [`crate::ir::Instruction`]; the doc
/// line of each opcode names the operand it expects and its stack shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    // === Stack Operations ===
    /// Do nothing. Used as a line anchor.
    Nop,
    /// Pop top of stack.
    PopTop,
    /// Push a NULL marker (call protocol).
    PushNull,
    /// Push a copy of the i-th item (arg: i, 1 = top).
    Copy,
    /// Swap top with the i-th item (arg: i, 2 = second).
    Swap,

    // === Constants / Names ===
    /// Push constant (arg: const index).
    LoadConst,
    /// Name lookup through locals, globals, builtins (arg: name index).
    LoadName,
    StoreName,
    DeleteName,
    /// Global/builtin lookup (arg: name index).
    LoadGlobal,
    StoreGlobal,
    DeleteGlobal,
    /// Fast local slot (arg: varname index).
    LoadFast,
    /// Load a fast local and reset the slot to unbound (comprehension save).
    LoadFastAndClear,
    StoreFast,
    /// Store into a fast local that may receive NULL (comprehension restore).
    StoreFastMaybeNull,
    DeleteFast,
    /// Cell or free variable (arg: deref index).
    LoadDeref,
    StoreDeref,
    DeleteDeref,
    /// Push the cell object itself, for closure tuples (arg: deref index).
    LoadClosure,
    /// Turn a fast slot into a cell (arg: deref index).
    MakeCell,
    /// Push the class namespace mapping.
    LoadLocals,
    /// Pop mapping, look name up in it, fall back to the cell (arg: deref index).
    LoadFromDictOrDeref,
    /// Pop mapping, look name up in it, fall back to globals (arg: name index).
    LoadFromDictOrGlobals,

    // === Attributes / Subscripts ===
    /// Pop object, push attribute (arg: name index).
    LoadAttr,
    /// Pop object, push method and self (or NULL and attribute) (arg: name index).
    LoadMethod,
    /// Pop object and value, set attribute (arg: name index).
    StoreAttr,
    DeleteAttr,
    /// Pop container and key, push item.
    BinarySubscr,
    /// Pop value, container and key; set item.
    StoreSubscr,
    DeleteSubscr,
    /// Pop container, start, stop; push slice of container.
    BinarySlice,
    /// Pop value, container, start, stop; assign slice.
    StoreSlice,
    /// Pop n bounds, push slice object (arg: 2 or 3).
    BuildSlice,

    // === Operators ===
    /// Pop two, push result (arg: [`BinaryOperator`]).
    BinaryOp,
    UnaryNegative,
    UnaryNot,
    UnaryInvert,
    /// Pop two, push comparison result (arg: [`ComparisonOperator`]).
    CompareOp,
    /// Pop two, push identity test (arg: 1 inverts).
    IsOp,
    /// Pop two, push membership test (arg: 1 inverts).
    ContainsOp,
    /// Replace top with its truth value.
    ToBool,

    // === Builders ===
    BuildTuple,
    BuildList,
    BuildSet,
    /// Pop n key/value pairs, push dict (arg: n).
    BuildMap,
    /// Pop n values and a tuple of keys, push dict (arg: n).
    BuildConstKeyMap,
    /// Concatenate n strings (arg: n).
    BuildString,
    /// Pop value, append to the list at depth arg.
    ListAppend,
    ListExtend,
    SetAdd,
    SetUpdate,
    /// Pop key and value, insert into the dict at depth arg.
    MapAdd,
    DictUpdate,
    /// Like `DictUpdate`, failing on duplicate keyword names.
    DictMerge,
    /// Unpack top into n values (arg: n).
    UnpackSequence,
    /// Unpack with a starred target (arg: before | after << 8).
    UnpackEx,
    /// Format a value (arg: conversion | 0x04 if a spec is on the stack).
    FormatValue,

    // === Control Flow ===
    /// Unconditional jump (arg: label).
    Jump,
    /// Pop, jump if false (arg: label).
    PopJumpIfFalse,
    PopJumpIfTrue,
    PopJumpIfNone,
    PopJumpIfNotNone,
    /// Pop return value and leave the frame.
    ReturnValue,

    // === Iteration ===
    GetIter,
    /// Push next item, or jump to arg leaving the iterator in place when exhausted.
    ForIter,
    /// Pop the exhausted iterator.
    EndFor,
    GetAiter,
    /// Push an awaitable for the next item of the async iterator.
    GetAnext,
    /// Handle StopAsyncIteration at the end of an async for; pops exception and iterator.
    EndAsyncFor,
    GetAwaitable,
    /// Pop value to send, delegate to the receiver below it, replace it with the result.
    YieldFrom,
    YieldValue,

    // === Exception Handling ===
    /// Register a handler at arg; the exception is pushed on entry (pseudo).
    SetupFinally,
    /// Register a cleanup handler at arg; lasti and exception are pushed on entry (pseudo).
    SetupCleanup,
    /// Register the with-statement handler at arg (pseudo).
    SetupWith,
    /// Deregister the innermost handler (pseudo).
    PopBlock,
    /// Save the current exception below the new one.
    PushExcInfo,
    /// Pop and restore the saved exception.
    PopExcept,
    /// Re-raise the exception on top (arg: 1 sets lasti from the stack).
    Reraise,
    /// Raise (arg: number of operands, 0 for bare raise).
    RaiseVarargs,
    /// Pop type, push whether the exception below matches.
    CheckExcMatch,
    /// Split the exception group below by type; push the rest and the match.
    CheckEgMatch,
    /// Call the with-exit capability with the live exception.
    WithExceptStart,
    LoadAssertionError,

    // === Context Managers ===
    /// Pop context manager, push exit and the entered value.
    BeforeWith,
    BeforeAsyncWith,

    // === Functions / Classes ===
    /// Pop n args, self-or-null and callable; push result (arg: n).
    Call,
    /// Name the trailing keyword arguments of the next call (arg: const tuple).
    KwNames,
    /// Call with an args tuple and optional kwargs dict (arg: 1 if kwargs).
    CallFunctionEx,
    /// Apply a one-argument runtime helper (arg: [`Intrinsic1`]).
    CallIntrinsic1,
    /// Apply a two-argument runtime helper (arg: [`Intrinsic2`]).
    CallIntrinsic2,
    /// Build a function from a code object (arg: [`MakeFunctionFlags`]).
    MakeFunction,
    LoadBuildClass,
    SetupAnnotations,

    // === Imports ===
    /// Pop level and fromlist, push module (arg: name index).
    ImportName,
    /// Push attribute of the module on top (arg: name index).
    ImportFrom,

    // === Pattern Matching ===
    /// Push whether top is a mapping.
    MatchMapping,
    /// Push whether top is a sequence.
    MatchSequence,
    /// Push the values for the keys tuple on top, or None.
    MatchKeys,
    /// Pop subject, class, names; push attribute tuple or None (arg: positional count).
    MatchClass,
    /// Push len(top).
    GetLen,
}

impl Opcode {
    /// Net stack effect of the instruction. `jump` selects the branch-taken
    /// effect for instructions whose effect differs per edge.
    pub fn stack_effect(self, oparg: u32, jump: bool) -> i32 {
        let n = oparg as i32;
        match self {
            Opcode::Nop | Opcode::Swap | Opcode::PopBlock => 0,
            Opcode::PopTop => -1,
            Opcode::PushNull | Opcode::Copy => 1,

            Opcode::LoadConst
            | Opcode::LoadName
            | Opcode::LoadGlobal
            | Opcode::LoadFast
            | Opcode::LoadFastAndClear
            | Opcode::LoadDeref
            | Opcode::LoadClosure
            | Opcode::LoadLocals
            | Opcode::LoadBuildClass
            | Opcode::LoadAssertionError => 1,
            Opcode::LoadFromDictOrDeref | Opcode::LoadFromDictOrGlobals => 0,
            Opcode::StoreName
            | Opcode::StoreGlobal
            | Opcode::StoreFast
            | Opcode::StoreFastMaybeNull
            | Opcode::StoreDeref => -1,
            Opcode::DeleteName
            | Opcode::DeleteGlobal
            | Opcode::DeleteFast
            | Opcode::DeleteDeref
            | Opcode::MakeCell
            | Opcode::SetupAnnotations => 0,

            Opcode::LoadAttr => 0,
            Opcode::LoadMethod => 1,
            Opcode::StoreAttr => -2,
            Opcode::DeleteAttr => -1,
            Opcode::BinarySubscr => -1,
            Opcode::StoreSubscr => -3,
            Opcode::DeleteSubscr => -2,
            Opcode::BinarySlice => -2,
            Opcode::StoreSlice => -4,
            Opcode::BuildSlice => 1 - n,

            Opcode::BinaryOp | Opcode::CompareOp | Opcode::IsOp | Opcode::ContainsOp => -1,
            Opcode::UnaryNegative | Opcode::UnaryNot | Opcode::UnaryInvert | Opcode::ToBool => 0,

            Opcode::BuildTuple | Opcode::BuildList | Opcode::BuildSet | Opcode::BuildString => {
                1 - n
            }
            Opcode::BuildMap => 1 - 2 * n,
            Opcode::BuildConstKeyMap => -n,
            Opcode::ListAppend
            | Opcode::ListExtend
            | Opcode::SetAdd
            | Opcode::SetUpdate
            | Opcode::DictUpdate
            | Opcode::DictMerge => -1,
            Opcode::MapAdd => -2,
            Opcode::UnpackSequence => n - 1,
            Opcode::UnpackEx => (n & 0xff) + (n >> 8),
            Opcode::FormatValue => {
                if oparg & 0x04 != 0 {
                    -1
                } else {
                    0
                }
            }

            Opcode::Jump => 0,
            Opcode::PopJumpIfFalse
            | Opcode::PopJumpIfTrue
            | Opcode::PopJumpIfNone
            | Opcode::PopJumpIfNotNone => -1,
            Opcode::ReturnValue => -1,

            Opcode::GetIter | Opcode::GetAiter | Opcode::GetAwaitable | Opcode::YieldValue => 0,
            Opcode::ForIter => {
                if jump {
                    0
                } else {
                    1
                }
            }
            Opcode::EndFor => -1,
            Opcode::GetAnext => 1,
            Opcode::EndAsyncFor => -2,
            Opcode::YieldFrom => -1,

            Opcode::SetupFinally | Opcode::SetupWith => {
                if jump {
                    1
                } else {
                    0
                }
            }
            Opcode::SetupCleanup => {
                if jump {
                    2
                } else {
                    0
                }
            }
            Opcode::PushExcInfo => 1,
            Opcode::PopExcept => -1,
            Opcode::Reraise => -1,
            Opcode::RaiseVarargs => -n,
            Opcode::CheckExcMatch | Opcode::CheckEgMatch => 0,
            Opcode::WithExceptStart => 1,

            Opcode::BeforeWith | Opcode::BeforeAsyncWith => 1,

            Opcode::Call => -n - 1,
            Opcode::KwNames => 0,
            Opcode::CallFunctionEx => -2 - (n & 1),
            Opcode::CallIntrinsic1 => 0,
            Opcode::CallIntrinsic2 => -1,
            Opcode::MakeFunction => -((oparg & 0x0f).count_ones() as i32),

            Opcode::ImportName => -1,
            Opcode::ImportFrom => 1,

            Opcode::MatchMapping | Opcode::MatchSequence | Opcode::MatchKeys | Opcode::GetLen => 1,
            Opcode::MatchClass => -2,
        }
    }

    /// Whether the operand is a jump target label.
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jump
                | Opcode::PopJumpIfFalse
                | Opcode::PopJumpIfTrue
                | Opcode::PopJumpIfNone
                | Opcode::PopJumpIfNotNone
                | Opcode::ForIter
        ) || self.is_block_setup()
    }

    /// Handler-registering pseudo instructions. Their target is reached only
    /// when an exception is raised inside the protected region.
    pub fn is_block_setup(self) -> bool {
        matches!(
            self,
            Opcode::SetupFinally | Opcode::SetupCleanup | Opcode::SetupWith
        )
    }

    /// Control never falls through to the next instruction.
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Jump | Opcode::ReturnValue | Opcode::Reraise | Opcode::RaiseVarargs
        )
    }

    pub fn name(self) -> String {
        // serde's SCREAMING_SNAKE_CASE name, which is also what listings print
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self))
    }
}

/// Operator codes for `BINARY_OP`. In-place variants add [`BinaryOperator::INPLACE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOperator {
    Add = 0,
    And = 1,
    FloorDivide = 2,
    LShift = 3,
    MatrixMultiply = 4,
    Multiply = 5,
    Remainder = 6,
    Or = 7,
    Power = 8,
    RShift = 9,
    Subtract = 10,
    TrueDivide = 11,
    Xor = 12,
}

impl BinaryOperator {
    pub const INPLACE: u32 = 13;

    pub fn oparg(self, inplace: bool) -> u32 {
        self as u32 + if inplace { Self::INPLACE } else { 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    Less = 0,
    LessOrEqual = 1,
    Equal = 2,
    NotEqual = 3,
    Greater = 4,
    GreaterOrEqual = 5,
}

/// One-argument runtime helpers reached through `CALL_INTRINSIC_1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic1 {
    Print = 1,
    ImportStar = 2,
    StopIterationError = 3,
    AsyncGenWrap = 4,
    UnaryPositive = 5,
    ListToTuple = 6,
    TypeVar = 7,
    ParamSpec = 8,
    TypeVarTuple = 9,
    SubscriptGeneric = 10,
    TypeAlias = 11,
}

/// Two-argument runtime helpers reached through `CALL_INTRINSIC_2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic2 {
    /// Combine raised and unhandled parts of an exception group. Opaque to lowering.
    PrepReraiseStar = 1,
    TypeVarWithBound = 2,
    TypeVarWithConstraints = 3,
    SetFunctionTypeParams = 4,
    SetTypeparamDefault = 5,
}

/// Operand bits of `MAKE_FUNCTION`, naming which extra values sit below the code object.
pub struct MakeFunctionFlags;

impl MakeFunctionFlags {
    pub const DEFAULTS: u32 = 0x01;
    pub const KW_DEFAULTS: u32 = 0x02;
    pub const ANNOTATIONS: u32 = 0x04;
    pub const CLOSURE: u32 = 0x08;
}

/// Conversion bits of `FORMAT_VALUE`.
pub struct FormatFlags;

impl FormatFlags {
    pub const NONE: u32 = 0x00;
    pub const STR: u32 = 0x01;
    pub const REPR: u32 = 0x02;
    pub const ASCII: u32 = 0x03;
    pub const HAVE_SPEC: u32 = 0x04;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        assert_eq!(Opcode::PopJumpIfFalse.name(), "POP_JUMP_IF_FALSE");
        assert_eq!(Opcode::LoadFastAndClear.name(), "LOAD_FAST_AND_CLEAR");
    }

    #[test]
    fn setup_effects_differ_per_edge() {
        assert_eq!(Opcode::SetupFinally.stack_effect(0, false), 0);
        assert_eq!(Opcode::SetupFinally.stack_effect(0, true), 1);
        assert_eq!(Opcode::SetupCleanup.stack_effect(0, true), 2);
        assert_eq!(Opcode::ForIter.stack_effect(0, false), 1);
        assert_eq!(Opcode::ForIter.stack_effect(0, true), 0);
    }

    #[test]
    fn unpack_ex_counts_both_sides() {
        // a, *b, c = x -> three values
        assert_eq!(Opcode::UnpackEx.stack_effect(1 | (1 << 8), false), 2);
    }

    #[test]
    fn make_function_pops_flagged_values() {
        let flags = MakeFunctionFlags::DEFAULTS | MakeFunctionFlags::CLOSURE;
        assert_eq!(Opcode::MakeFunction.stack_effect(flags, false), -2);
    }

    #[test]
    fn inplace_operator_offset() {
        assert_eq!(BinaryOperator::Add.oparg(true), 13);
        assert_eq!(BinaryOperator::Xor.oparg(false), 12);
    }
}
