use std::sync::Arc;

use serde::Serialize;

/// Intermediate representation for a parsed JVM class.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) source_file: Option<String>,
    /// Constant pool entries without the leading count, as a debuggee reports them.
    pub(crate) constant_pool: Arc<Vec<u8>>,
    pub(crate) methods: Vec<Method>,
}

/// Intermediate representation for a method and its bytecode.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access: MethodAccess,
    pub(crate) bytecode: Vec<u8>,
    pub(crate) line_numbers: Vec<LineNumber>,
}

/// Method access flags.
#[derive(Clone, Copy, Debug)]
pub(crate) struct MethodAccess {
    pub(crate) is_static: bool,
    pub(crate) is_native: bool,
    pub(crate) is_abstract: bool,
}

/// One `LineNumberTable` entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) start_pc: usize,
    pub(crate) line: u32,
}

/// Call site extracted from bytecode.
#[derive(Clone, Debug, Serialize)]
pub(crate) struct CallSite {
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) kind: CallKind,
    pub(crate) offset: usize,
    pub(crate) line: Option<u32>,
}

/// Call opcode classification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum CallKind {
    Virtual,
    Interface,
    Special,
    Static,
}

/// Source of the bytecode a line is matched against.
pub(crate) trait BytecodeProvider: Send + Sync {
    /// Serialized constant pool entries, when the debuggee can provide them.
    fn constant_pool(&self) -> Option<&[u8]>;
    fn byte_codes(&self) -> &[u8];
    /// Flat `[from, to, from, to, ...]` windows of the instructions attributed
    /// to lines `start..=end`, in bytecode order.
    fn index_at_lines(&self, start: u32, end: u32) -> Option<Vec<usize>>;
}

impl Method {
    pub(crate) fn line_range(&self) -> Option<(u32, u32)> {
        let min = self.line_numbers.iter().map(|entry| entry.line).min()?;
        let max = self.line_numbers.iter().map(|entry| entry.line).max()?;
        Some((min, max))
    }

    pub(crate) fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_numbers
            .iter()
            .filter(|entry| entry.start_pc <= pc)
            .max_by_key(|entry| entry.start_pc)
            .map(|entry| entry.line)
    }

    pub(crate) fn windows_for_lines(&self, start: u32, end: u32) -> Vec<usize> {
        let mut entries = self.line_numbers.clone();
        entries.sort_by_key(|entry| entry.start_pc);
        let mut windows: Vec<usize> = Vec::new();
        for (index, entry) in entries.iter().enumerate() {
            if entry.line < start || entry.line > end {
                continue;
            }
            let to = entries
                .get(index + 1)
                .map_or(self.bytecode.len(), |next| next.start_pc)
                .min(self.bytecode.len());
            if entry.start_pc >= to {
                continue;
            }
            // Merge with the previous window when they touch.
            match windows.last_mut() {
                Some(last) if *last == entry.start_pc => *last = to,
                _ => {
                    windows.push(entry.start_pc);
                    windows.push(to);
                }
            }
        }
        windows
    }
}

/// A method's bytecode together with its class's constant pool.
#[derive(Clone, Debug)]
pub(crate) struct MethodBytecode {
    pub(crate) constant_pool: Option<Arc<Vec<u8>>>,
    pub(crate) method: Method,
}

impl BytecodeProvider for MethodBytecode {
    fn constant_pool(&self) -> Option<&[u8]> {
        self.constant_pool.as_deref().map(Vec::as_slice)
    }

    fn byte_codes(&self) -> &[u8] {
        &self.method.bytecode
    }

    fn index_at_lines(&self, start: u32, end: u32) -> Option<Vec<usize>> {
        let windows = self.method.windows_for_lines(start, end);
        if windows.is_empty() {
            None
        } else {
            Some(windows)
        }
    }
}
