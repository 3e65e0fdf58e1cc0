use serde::Serialize;

/// Source location, offset plus 1-based line and column.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct Position {
    pub(crate) offset: usize,
    pub(crate) line: u32,
    pub(crate) column: u32,
}

/// A method call on a source line, tied to the call instruction that
/// performs it.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub(crate) struct Operation {
    pub(crate) start: Position,
    pub(crate) end: Position,
    pub(crate) method_start: Position,
    pub(crate) method_end: Position,
    pub(crate) method_name: String,
    /// Binary name of the receiver type, not the declaring class.
    pub(crate) method_class_type: String,
    pub(crate) bytecode_index: usize,
    pub(crate) is_native: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) method_descriptor: Option<String>,
    /// Bytecode indexes of the operations that may run next.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub(crate) next_operations: Vec<usize>,
}

impl Operation {
    pub(crate) fn add_next_operation(&mut self, bytecode_index: usize) {
        if !self.next_operations.contains(&bytecode_index) {
            self.next_operations.push(bytecode_index);
        }
    }
}

/// One argument of a call or parameter of a method declaration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct MethodArgument {
    pub(crate) name: String,
    pub(crate) type_name: String,
    pub(crate) start: Position,
    pub(crate) end: Position,
}
