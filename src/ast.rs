//! Attributed source tree of one compilation unit, as delivered by the host
//! parser. Offsets are byte offsets into the unit's UTF-8 text; a missing
//! offset means the host could not position the tree.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::operation::Position;

/// Identity of a tree node, unique within a process.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub(crate) struct TreeId(u32);

impl TreeId {
    pub(crate) fn fresh() -> TreeId {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        TreeId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Tree {
    #[serde(skip, default = "TreeId::fresh")]
    pub(crate) id: TreeId,
    #[serde(default)]
    pub(crate) start: Option<usize>,
    #[serde(default)]
    pub(crate) end: Option<usize>,
    /// Static type of an expression, if attributed.
    #[serde(default, rename = "type")]
    pub(crate) ty: Option<JType>,
    /// Generated by the compiler, e.g. an implicit `super()` call.
    #[serde(default)]
    pub(crate) synthetic: bool,
    #[serde(flatten)]
    pub(crate) kind: TreeKind,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum TreeKind {
    Class(ClassDecl),
    Method(MethodDecl),
    Variable(VariableDecl),
    Block {
        #[serde(default)]
        statements: Vec<Tree>,
    },
    ExpressionStatement {
        expression: Box<Tree>,
    },
    If {
        condition: Box<Tree>,
        then_statement: Box<Tree>,
        #[serde(default)]
        else_statement: Option<Box<Tree>>,
    },
    WhileLoop {
        condition: Box<Tree>,
        body: Box<Tree>,
    },
    DoWhileLoop {
        body: Box<Tree>,
        condition: Box<Tree>,
    },
    ForLoop {
        #[serde(default)]
        initializer: Vec<Tree>,
        #[serde(default)]
        condition: Option<Box<Tree>>,
        #[serde(default)]
        update: Vec<Tree>,
        body: Box<Tree>,
    },
    EnhancedForLoop {
        variable: Box<Tree>,
        expression: Box<Tree>,
        body: Box<Tree>,
    },
    Switch {
        selector: Box<Tree>,
        #[serde(default)]
        cases: Vec<Case>,
    },
    Return {
        #[serde(default)]
        expression: Option<Box<Tree>>,
    },
    Throw {
        expression: Box<Tree>,
    },
    Try {
        #[serde(default)]
        resources: Vec<Tree>,
        block: Box<Tree>,
        #[serde(default)]
        catches: Vec<Catch>,
        #[serde(default)]
        finally_block: Option<Box<Tree>>,
    },
    Synchronized {
        lock: Box<Tree>,
        body: Box<Tree>,
    },
    Labeled {
        label: String,
        body: Box<Tree>,
    },
    Break {
        #[serde(default)]
        label: Option<String>,
    },
    Continue {
        #[serde(default)]
        label: Option<String>,
    },
    Assert {
        condition: Box<Tree>,
        #[serde(default)]
        detail: Option<Box<Tree>>,
    },
    Empty,
    MethodInvocation {
        #[serde(default)]
        type_arguments: Vec<Tree>,
        method_select: Box<Tree>,
        #[serde(default)]
        arguments: Vec<Tree>,
        #[serde(default)]
        method: Option<MethodElement>,
    },
    NewClass {
        #[serde(default)]
        enclosing: Option<Box<Tree>>,
        identifier: Box<Tree>,
        #[serde(default)]
        arguments: Vec<Tree>,
        #[serde(default)]
        class_body: Option<Box<Tree>>,
        #[serde(default)]
        constructor: Option<MethodElement>,
    },
    NewArray {
        #[serde(default)]
        element_type: Option<Box<Tree>>,
        #[serde(default)]
        dimensions: Vec<Tree>,
        #[serde(default)]
        initializers: Vec<Tree>,
    },
    Conditional {
        condition: Box<Tree>,
        true_expression: Box<Tree>,
        false_expression: Box<Tree>,
    },
    Binary {
        operator: String,
        left: Box<Tree>,
        right: Box<Tree>,
    },
    Assignment {
        variable: Box<Tree>,
        expression: Box<Tree>,
    },
    CompoundAssignment {
        operator: String,
        variable: Box<Tree>,
        expression: Box<Tree>,
    },
    Unary {
        operator: String,
        expression: Box<Tree>,
    },
    Parenthesized {
        expression: Box<Tree>,
    },
    TypeCast {
        target: Box<Tree>,
        expression: Box<Tree>,
    },
    InstanceOf {
        expression: Box<Tree>,
        target: Box<Tree>,
    },
    ArrayAccess {
        expression: Box<Tree>,
        index: Box<Tree>,
    },
    MemberSelect {
        expression: Box<Tree>,
        identifier: String,
    },
    Identifier {
        name: String,
        #[serde(default)]
        symbol: Option<Symbol>,
    },
    Literal {
        #[serde(default)]
        value: serde_json::Value,
    },
    Lambda {
        #[serde(default)]
        parameters: Vec<Tree>,
        body: Box<Tree>,
    },
    MemberReference {
        expression: Box<Tree>,
        name: String,
    },
    Annotation {
        annotation_type: Box<Tree>,
        #[serde(default)]
        arguments: Vec<Tree>,
    },
    /// Primitive, array, qualified or parameterized type trees.
    TypeName {
        name: String,
    },
    Erroneous,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct ClassDecl {
    pub(crate) name: String,
    pub(crate) binary_name: String,
    #[serde(default)]
    pub(crate) modifiers: Vec<String>,
    #[serde(default)]
    pub(crate) annotations: Vec<Tree>,
    /// End of the header (modifiers, type parameters, extends, implements).
    #[serde(default)]
    pub(crate) header_end: Option<usize>,
    #[serde(default)]
    pub(crate) members: Vec<Tree>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct MethodDecl {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) modifiers: Vec<String>,
    #[serde(default)]
    pub(crate) annotations: Vec<Tree>,
    #[serde(default)]
    pub(crate) return_type: Option<Box<Tree>>,
    #[serde(default)]
    pub(crate) parameters: Vec<Tree>,
    #[serde(default)]
    pub(crate) throws: Vec<Tree>,
    #[serde(default)]
    pub(crate) body: Option<Box<Tree>>,
    #[serde(default)]
    pub(crate) element: Option<MethodElement>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct VariableDecl {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) modifiers: Vec<String>,
    #[serde(default)]
    pub(crate) var_type: Option<Box<Tree>>,
    #[serde(default)]
    pub(crate) initializer: Option<Box<Tree>>,
    #[serde(default)]
    pub(crate) symbol: Option<Symbol>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Case {
    #[serde(default)]
    pub(crate) labels: Vec<Tree>,
    #[serde(default)]
    pub(crate) body: Vec<Tree>,
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Catch {
    pub(crate) parameter: Box<Tree>,
    pub(crate) block: Box<Tree>,
}

/// Statically resolved method or constructor.
#[derive(Clone, Debug, Default, Deserialize)]
pub(crate) struct MethodElement {
    pub(crate) name: String,
    /// Binary name of the declaring type.
    pub(crate) owner: String,
    #[serde(default)]
    pub(crate) parameter_types: Vec<JType>,
    #[serde(default)]
    pub(crate) return_type: Option<JType>,
    #[serde(default)]
    pub(crate) thrown: Vec<JType>,
    #[serde(default)]
    pub(crate) is_native: bool,
    #[serde(default)]
    pub(crate) is_static: bool,
}

impl MethodElement {
    /// JNI-style signature of the erased parameter and return types.
    pub(crate) fn signature(&self) -> String {
        let mut signature = String::from("(");
        for parameter in &self.parameter_types {
            signature.push_str(&parameter.jni_signature());
        }
        signature.push(')');
        match &self.return_type {
            Some(ty) => signature.push_str(&ty.jni_signature()),
            None => signature.push('V'),
        }
        signature
    }
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct Symbol {
    pub(crate) kind: SymbolKind,
    #[serde(default)]
    pub(crate) is_static: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum SymbolKind {
    LocalVariable,
    Parameter,
    ExceptionParameter,
    ResourceVariable,
    Field,
    Method,
    Type,
    Package,
}

impl SymbolKind {
    pub(crate) fn is_local(self) -> bool {
        matches!(
            self,
            SymbolKind::LocalVariable
                | SymbolKind::Parameter
                | SymbolKind::ExceptionParameter
                | SymbolKind::ResourceVariable
        )
    }
}

/// Static type of an expression or declaration.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum JType {
    Primitive {
        name: String,
    },
    Void,
    Null,
    Declared {
        binary_name: String,
        /// Supertype chain, nearest first.
        #[serde(default)]
        ancestors: Vec<String>,
    },
    Array {
        component: Box<JType>,
    },
    TypeVar {
        name: String,
        #[serde(default)]
        bounds: Vec<JType>,
    },
    Union {
        alternatives: Vec<JType>,
    },
    Error {
        #[serde(default)]
        name: String,
    },
}

const OBJECT: &str = "java.lang.Object";

impl JType {
    pub(crate) fn declared(binary_name: &str) -> JType {
        JType::Declared {
            binary_name: binary_name.to_string(),
            ancestors: Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn primitive(name: &str) -> JType {
        JType::Primitive {
            name: name.to_string(),
        }
    }

    pub(crate) fn is_error(&self) -> bool {
        matches!(self, JType::Error { .. })
    }

    pub(crate) fn is_void(&self) -> bool {
        matches!(self, JType::Void)
    }

    /// Binary name used for the owner of a call on a receiver of this type.
    pub(crate) fn binary_name(&self) -> String {
        match self {
            JType::Primitive { name } => name.clone(),
            JType::Void => "void".to_string(),
            JType::Null => "null".to_string(),
            JType::Declared { binary_name, .. } => binary_name.clone(),
            JType::Array { component } => format!("{}[]", component.binary_name()),
            JType::TypeVar { bounds, .. } => bounds
                .first()
                .map_or_else(|| OBJECT.to_string(), JType::binary_name),
            JType::Union { alternatives } => {
                common_ancestor(alternatives).unwrap_or_else(|| OBJECT.to_string())
            }
            JType::Error { name } => name.clone(),
        }
    }

    /// Type as written in generated Java source.
    pub(crate) fn source_name(&self) -> String {
        match self {
            JType::Primitive { name } => name.clone(),
            JType::Void => "void".to_string(),
            JType::Declared { binary_name, .. } => binary_name.replace(['/', '$'], "."),
            JType::Array { component } => format!("{}[]", component.source_name()),
            JType::TypeVar { bounds, .. } => bounds
                .first()
                .map_or_else(|| OBJECT.to_string(), JType::source_name),
            JType::Union { alternatives } => common_ancestor(alternatives)
                .map_or_else(|| OBJECT.to_string(), |name| name.replace(['/', '$'], ".")),
            JType::Null | JType::Error { .. } => OBJECT.to_string(),
        }
    }

    pub(crate) fn jni_signature(&self) -> String {
        match self {
            JType::Primitive { name } => match name.as_str() {
                "boolean" => "Z",
                "byte" => "B",
                "char" => "C",
                "short" => "S",
                "int" => "I",
                "long" => "J",
                "float" => "F",
                "double" => "D",
                _ => "V",
            }
            .to_string(),
            JType::Void => "V".to_string(),
            JType::Array { component } => format!("[{}", component.jni_signature()),
            JType::Declared { binary_name, .. } => format!("L{};", binary_name.replace('.', "/")),
            JType::TypeVar { bounds, .. } => bounds
                .first()
                .map_or_else(|| "Ljava/lang/Object;".to_string(), JType::jni_signature),
            JType::Union { .. } | JType::Null | JType::Error { .. } => {
                format!("L{};", self.binary_name().replace('.', "/"))
            }
        }
    }

    pub(crate) fn is_subtype_of(&self, binary_name: &str) -> bool {
        self.lineage().iter().any(|name| name == binary_name)
    }

    /// Own binary name followed by the supertype chain.
    fn lineage(&self) -> Vec<String> {
        match self {
            JType::Declared {
                binary_name,
                ancestors,
            } => std::iter::once(binary_name.clone())
                .chain(ancestors.iter().cloned())
                .collect(),
            JType::TypeVar { bounds, .. } => bounds.first().map_or_else(Vec::new, JType::lineage),
            other => vec![other.binary_name()],
        }
    }
}

/// Nearest type shared by the supertype chains of all given types.
pub(crate) fn common_ancestor(types: &[JType]) -> Option<String> {
    let (first, rest) = types.split_first()?;
    let mut candidates = first.lineage();
    for ty in rest {
        let lineage = ty.lineage();
        candidates.retain(|name| lineage.contains(name));
    }
    candidates.into_iter().next()
}

impl fmt::Display for JType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JType::TypeVar { name, .. } => write!(f, "{name}"),
            JType::Union { alternatives } => {
                let names: Vec<String> = alternatives.iter().map(JType::to_string).collect();
                write!(f, "{}", names.join(" | "))
            }
            JType::Error { name } if name.is_empty() => write!(f, "<error>"),
            other => write!(f, "{}", other.binary_name()),
        }
    }
}

impl Tree {
    pub(crate) fn new(kind: TreeKind, start: Option<usize>, end: Option<usize>) -> Tree {
        Tree {
            id: TreeId::fresh(),
            start,
            end,
            ty: None,
            synthetic: false,
            kind,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_type(mut self, ty: JType) -> Tree {
        self.ty = Some(ty);
        self
    }

    pub(crate) fn contains(&self, offset: usize) -> bool {
        matches!(
            (self.start, self.end),
            (Some(start), Some(end)) if start <= offset && offset < end
        )
    }

    pub(crate) fn is_class(&self) -> bool {
        matches!(self.kind, TreeKind::Class(_))
    }

    /// Name of the method a call tree invokes, `<init>` for constructors.
    pub(crate) fn invoked_name(&self) -> Option<&str> {
        match &self.kind {
            TreeKind::NewClass { .. } => Some("<init>"),
            TreeKind::MethodInvocation { method_select, .. } => match &method_select.kind {
                TreeKind::Identifier { name, .. } if name == "this" || name == "super" => {
                    Some("<init>")
                }
                TreeKind::Identifier { name, .. } => Some(name),
                TreeKind::MemberSelect { identifier, .. } => Some(identifier),
                _ => None,
            },
            _ => None,
        }
    }

    /// Direct subtrees in source order.
    pub(crate) fn children(&self) -> Vec<&Tree> {
        let mut children: Vec<&Tree> = Vec::new();
        match &self.kind {
            TreeKind::Class(class) => {
                children.extend(&class.annotations);
                children.extend(&class.members);
            }
            TreeKind::Method(method) => {
                children.extend(&method.annotations);
                children.extend(method.return_type.as_deref());
                children.extend(&method.parameters);
                children.extend(&method.throws);
                children.extend(method.body.as_deref());
            }
            TreeKind::Variable(variable) => {
                children.extend(variable.var_type.as_deref());
                children.extend(variable.initializer.as_deref());
            }
            TreeKind::Block { statements } => children.extend(statements),
            TreeKind::ExpressionStatement { expression }
            | TreeKind::Return {
                expression: Some(expression),
            }
            | TreeKind::Throw { expression }
            | TreeKind::Unary { expression, .. }
            | TreeKind::Parenthesized { expression }
            | TreeKind::MemberSelect { expression, .. }
            | TreeKind::MemberReference { expression, .. } => children.push(expression),
            TreeKind::Return { expression: None } => {}
            TreeKind::If {
                condition,
                then_statement,
                else_statement,
            } => {
                children.push(condition);
                children.push(then_statement);
                children.extend(else_statement.as_deref());
            }
            TreeKind::WhileLoop { condition, body } => {
                children.push(condition);
                children.push(body);
            }
            TreeKind::DoWhileLoop { body, condition } => {
                children.push(body);
                children.push(condition);
            }
            TreeKind::ForLoop {
                initializer,
                condition,
                update,
                body,
            } => {
                children.extend(initializer);
                children.extend(condition.as_deref());
                children.extend(update);
                children.push(body);
            }
            TreeKind::EnhancedForLoop {
                variable,
                expression,
                body,
            } => {
                children.push(variable);
                children.push(expression);
                children.push(body);
            }
            TreeKind::Switch { selector, cases } => {
                children.push(selector);
                for case in cases {
                    children.extend(&case.labels);
                    children.extend(&case.body);
                }
            }
            TreeKind::Try {
                resources,
                block,
                catches,
                finally_block,
            } => {
                children.extend(resources);
                children.push(block);
                for catch in catches {
                    children.push(&catch.parameter);
                    children.push(&catch.block);
                }
                children.extend(finally_block.as_deref());
            }
            TreeKind::Synchronized { lock, body } => {
                children.push(lock);
                children.push(body);
            }
            TreeKind::Labeled { body, .. } => children.push(body),
            TreeKind::Assert { condition, detail } => {
                children.push(condition);
                children.extend(detail.as_deref());
            }
            TreeKind::MethodInvocation {
                type_arguments,
                method_select,
                arguments,
                ..
            } => {
                children.extend(type_arguments);
                children.push(method_select);
                children.extend(arguments);
            }
            TreeKind::NewClass {
                enclosing,
                identifier,
                arguments,
                class_body,
                ..
            } => {
                children.extend(enclosing.as_deref());
                children.push(identifier);
                children.extend(arguments);
                children.extend(class_body.as_deref());
            }
            TreeKind::NewArray {
                element_type,
                dimensions,
                initializers,
            } => {
                children.extend(element_type.as_deref());
                children.extend(dimensions);
                children.extend(initializers);
            }
            TreeKind::Conditional {
                condition,
                true_expression,
                false_expression,
            } => {
                children.push(condition);
                children.push(true_expression);
                children.push(false_expression);
            }
            TreeKind::Binary { left, right, .. } => {
                children.push(left);
                children.push(right);
            }
            TreeKind::Assignment {
                variable,
                expression,
            }
            | TreeKind::CompoundAssignment {
                variable,
                expression,
                ..
            } => {
                children.push(variable);
                children.push(expression);
            }
            TreeKind::TypeCast { target, expression } => {
                children.push(target);
                children.push(expression);
            }
            TreeKind::InstanceOf { expression, target } => {
                children.push(expression);
                children.push(target);
            }
            TreeKind::ArrayAccess { expression, index } => {
                children.push(expression);
                children.push(index);
            }
            TreeKind::Lambda { parameters, body } => {
                children.extend(parameters);
                children.push(body);
            }
            TreeKind::Annotation {
                annotation_type,
                arguments,
            } => {
                children.push(annotation_type);
                children.extend(arguments);
            }
            TreeKind::Break { .. }
            | TreeKind::Continue { .. }
            | TreeKind::Empty
            | TreeKind::Identifier { .. }
            | TreeKind::Literal { .. }
            | TreeKind::TypeName { .. }
            | TreeKind::Erroneous => {}
        }
        children
    }
}

/// Offset to line/column conversion for one source text.
#[derive(Clone, Debug, Default)]
pub(crate) struct LineMap {
    line_starts: Vec<usize>,
    len: usize,
}

impl LineMap {
    pub(crate) fn new(text: &str) -> LineMap {
        let mut line_starts = vec![0];
        for (index, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(index + 1);
            }
        }
        LineMap {
            line_starts,
            len: text.len(),
        }
    }

    /// 1-based line of `offset`.
    pub(crate) fn line_number(&self, offset: usize) -> u32 {
        self.line_starts.partition_point(|start| *start <= offset) as u32
    }

    /// 1-based column of `offset`.
    pub(crate) fn column_number(&self, offset: usize) -> u32 {
        let line = self.line_number(offset) as usize;
        (offset - self.line_starts[line - 1] + 1) as u32
    }

    pub(crate) fn line_start(&self, line: u32) -> Option<usize> {
        let index = (line as usize).checked_sub(1)?;
        self.line_starts.get(index).copied()
    }

    pub(crate) fn line_end(&self, line: u32) -> Option<usize> {
        self.line_start(line)?;
        Some(
            self.line_starts
                .get(line as usize)
                .map_or(self.len, |next| next - 1),
        )
    }
}

#[derive(Debug, Deserialize)]
struct UnitDocument {
    #[serde(default)]
    package: Option<String>,
    #[serde(default)]
    imports: Vec<String>,
    #[serde(default)]
    types: Vec<Tree>,
    text: String,
}

/// One parsed and attributed source file.
#[derive(Clone, Debug)]
pub(crate) struct CompilationUnit {
    pub(crate) package: Option<String>,
    pub(crate) imports: Vec<String>,
    pub(crate) types: Vec<Tree>,
    pub(crate) text: String,
    line_map: LineMap,
}

impl CompilationUnit {
    pub(crate) fn new(text: impl Into<String>, imports: Vec<String>, types: Vec<Tree>) -> Self {
        let text = text.into();
        let line_map = LineMap::new(&text);
        CompilationUnit {
            package: None,
            imports,
            types,
            text,
            line_map,
        }
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        let document: UnitDocument =
            serde_json::from_str(json).context("failed to parse compilation unit JSON")?;
        let mut unit = CompilationUnit::new(document.text, document.imports, document.types);
        unit.package = document.package;
        Ok(unit)
    }

    pub(crate) fn line_map(&self) -> &LineMap {
        &self.line_map
    }

    pub(crate) fn position(&self, offset: usize) -> Position {
        Position {
            offset,
            line: self.line_map.line_number(offset),
            column: self.line_map.column_number(offset),
        }
    }

    pub(crate) fn start_line(&self, tree: &Tree) -> Option<u32> {
        tree.start.map(|offset| self.line_map.line_number(offset))
    }

    pub(crate) fn end_line(&self, tree: &Tree) -> Option<u32> {
        tree.end.map(|offset| self.line_map.line_number(offset))
    }

    pub(crate) fn source(&self, tree: &Tree) -> Option<&str> {
        self.text.get(tree.start?..tree.end?)
    }

    /// Path from a top-level type to the innermost tree containing `offset`.
    pub(crate) fn path_for(&self, offset: usize) -> Vec<&Tree> {
        let mut path = Vec::new();
        let mut current = self.types.iter().find(|tree| tree.contains(offset));
        while let Some(tree) = current {
            path.push(tree);
            current = tree.children().into_iter().find(|child| child.contains(offset));
        }
        path
    }

    /// Offset of the first non-blank character of `line`.
    pub(crate) fn line_offset(&self, line: u32) -> Option<usize> {
        let start = self.line_map.line_start(line)?;
        let end = self.line_map.line_end(line)?;
        let text = self.text.get(start..end)?;
        let indent = text.len() - text.trim_start().len();
        Some(start + indent)
    }

    /// Class declaration with the given binary name, skipping excluded names.
    pub(crate) fn find_class(&self, binary_name: &str, excludes: &[String]) -> Option<&Tree> {
        let mut stack: Vec<&Tree> = self.types.iter().rev().collect();
        while let Some(tree) = stack.pop() {
            if let TreeKind::Class(class) = &tree.kind {
                if class.binary_name == binary_name && !excludes.contains(&class.binary_name) {
                    return Some(tree);
                }
            }
            stack.extend(tree.children().into_iter().rev());
        }
        None
    }
}

/// Innermost class on a tree path.
pub(crate) fn enclosing_class<'a>(path: &[&'a Tree]) -> Option<&'a Tree> {
    path.iter().rev().copied().find(|tree| tree.is_class())
}

/// Innermost method on a tree path.
pub(crate) fn enclosing_method<'a>(path: &[&'a Tree]) -> Option<&'a Tree> {
    path.iter()
        .rev()
        .copied()
        .find(|tree| matches!(tree.kind, TreeKind::Method(_)))
}

/// Strip parentheses around an expression.
pub(crate) fn skip_parens(tree: &Tree) -> &Tree {
    match &tree.kind {
        TreeKind::Parenthesized { expression } => skip_parens(expression),
        _ => tree,
    }
}
