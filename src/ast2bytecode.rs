//! Aligns the call expressions of a source line with the invoke
//! instructions compiled from it.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::ast::{CompilationUnit, Tree, TreeId, TreeKind};
use crate::constant_pool::ConstantPool;
use crate::error::ConstantPoolError;
use crate::opcodes::{call_operand, instruction_size, is_method_call};
use crate::operation::Operation;

/// Walks the bytecode windows `[from, to, from, to, ...]` instruction by
/// instruction.
struct Cursor<'b> {
    bytecode: &'b [u8],
    windows: &'b [usize],
    window: usize,
    offset: usize,
}

impl<'b> Cursor<'b> {
    fn new(bytecode: &'b [u8], windows: &'b [usize]) -> Option<Self> {
        let offset = *windows.first()?;
        Some(Cursor {
            bytecode,
            windows,
            window: 0,
            offset,
        })
    }

    /// Offset of the next call instruction at or after the cursor.
    fn next_call(&mut self) -> Option<usize> {
        loop {
            let to = (*self.windows.get(2 * self.window + 1)?).min(self.bytecode.len());
            while self.offset < to {
                let opcode = self.bytecode[self.offset];
                if is_method_call(opcode) {
                    return Some(self.offset);
                }
                self.offset += instruction_size(opcode, self.bytecode, self.offset);
            }
            self.window += 1;
            self.offset = *self.windows.get(2 * self.window)?;
        }
    }

    fn step(&mut self) {
        if let Some(&opcode) = self.bytecode.get(self.offset) {
            self.offset += instruction_size(opcode, self.bytecode, self.offset);
        }
    }
}

/// Statically resolved target of a call tree.
struct CallTarget<'t> {
    name: &'t str,
    owner: String,
    is_native: bool,
    /// Span of the method name token, or of the class name for constructors.
    name_start: Option<usize>,
    name_end: Option<usize>,
}

fn resolve_target(tree: &Tree) -> Option<CallTarget<'_>> {
    let name = tree.invoked_name()?;
    match &tree.kind {
        TreeKind::NewClass {
            identifier,
            constructor,
            ..
        } => {
            let owner = tree
                .ty
                .as_ref()
                .or(identifier.ty.as_ref())
                .map(|ty| ty.binary_name())
                .or_else(|| constructor.as_ref().map(|element| element.owner.clone()))
                .unwrap_or_default();
            Some(CallTarget {
                name,
                owner,
                is_native: false,
                name_start: identifier.start,
                name_end: identifier.end,
            })
        }
        TreeKind::MethodInvocation {
            method_select,
            method,
            ..
        } => {
            let declaring = method.as_ref().map(|element| element.owner.clone());
            let is_native = method.as_ref().is_some_and(|element| element.is_native);
            match &method_select.kind {
                TreeKind::MemberSelect { expression, .. } => {
                    // Member selects have no span of their own for the name.
                    let name_end = method_select.end;
                    let name_start = name_end.and_then(|end| end.checked_sub(name.len()));
                    let owner = expression
                        .ty
                        .as_ref()
                        .map(|ty| ty.binary_name())
                        .or(declaring)
                        .unwrap_or_default();
                    Some(CallTarget {
                        name,
                        owner,
                        is_native,
                        name_start,
                        name_end,
                    })
                }
                _ => Some(CallTarget {
                    name,
                    owner: declaring.unwrap_or_default(),
                    is_native,
                    name_start: method_select.start,
                    name_end: method_select.end,
                }),
            }
        }
        _ => None,
    }
}

/// Matches `trees`, the calls of one line in execution order, against the
/// invoke instructions inside `windows`.
///
/// Returns `Ok(None)` when source and bytecode cannot be aligned: a window
/// runs out of calls, a position is missing, or (without a constant pool)
/// an unmatched call remains. Matched operations are also recorded in
/// `node_operations` keyed by tree.
pub(crate) fn match_source_tree_to_bytecode(
    unit: &CompilationUnit,
    trees: &[&Tree],
    bytecode: &[u8],
    windows: &[usize],
    constant_pool: Option<&ConstantPool>,
    node_operations: &mut HashMap<TreeId, Operation>,
) -> Result<Option<Vec<Operation>>, ConstantPoolError> {
    let Some(mut cursor) = Cursor::new(bytecode, windows) else {
        return Ok(None);
    };
    let mut operations = Vec::with_capacity(trees.len());
    for tree in trees {
        let Some(target) = resolve_target(tree) else {
            debug!("not a call tree");
            return Ok(None);
        };
        let Some(mut index) = cursor.next_call() else {
            debug!(name = target.name, "bytecode exhausted before call");
            return Ok(None);
        };
        let mut pool_index = None;
        if let Some(pool) = constant_pool {
            loop {
                let Some(operand) = call_operand(bytecode, index) else {
                    return Ok(None);
                };
                if pool.method_name(operand as usize)? == target.name {
                    pool_index = Some(operand as usize);
                    break;
                }
                // A call without source counterpart, e.g. a synthetic accessor.
                cursor.step();
                index = match cursor.next_call() {
                    Some(index) => index,
                    None => {
                        debug!(name = target.name, "no call with matching name");
                        return Ok(None);
                    }
                };
            }
        }
        cursor.step();
        if tree.synthetic {
            continue;
        }
        let (Some(start), Some(end), Some(name_start), Some(name_end)) =
            (tree.start, tree.end, target.name_start, target.name_end)
        else {
            warn!(name = target.name, "call without source position");
            return Ok(None);
        };
        let method_descriptor = match (constant_pool, pool_index) {
            (Some(pool), Some(pool_index)) => Some(pool.method_descriptor(pool_index)?.to_string()),
            _ => None,
        };
        let operation = Operation {
            start: unit.position(start),
            end: unit.position(end),
            method_start: unit.position(name_start),
            method_end: unit.position(name_end),
            method_name: target.name.to_string(),
            method_class_type: target.owner,
            bytecode_index: index,
            is_native: target.is_native,
            method_descriptor,
            next_operations: Vec::new(),
        };
        node_operations.insert(tree.id, operation.clone());
        operations.push(operation);
    }
    if constant_pool.is_none() {
        if let Some(index) = cursor.next_call() {
            debug!(index, "call instruction left without source counterpart");
            return Ok(None);
        }
    }
    Ok(Some(operations))
}
