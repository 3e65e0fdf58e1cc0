//! Compiles a code snippet into a synthetic class nested in the class it
//! is evaluated in.

use std::collections::{BTreeMap, HashSet};
use std::io;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::ast::{CompilationUnit, JType, Tree, TreeKind, common_ancestor, enclosing_class};
use crate::error::InvalidExpressionError;

const INVOKE_METHOD: &str = "invoke";
const OBJECT: &str = "java.lang.Object";

/// Snippet text with its attributed statements. Statement offsets are
/// relative to the text the snippet was parsed in, `code` starts at
/// `code_offset` there.
#[derive(Debug, Deserialize)]
pub(crate) struct Snippet {
    pub(crate) code: String,
    #[serde(default)]
    pub(crate) code_offset: usize,
    #[serde(default)]
    pub(crate) statements: Vec<Tree>,
}

impl Snippet {
    pub(crate) fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("failed to parse snippet JSON")
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Severity {
    Error,
    Warning,
    Note,
}

#[derive(Clone, Debug)]
pub(crate) struct Diagnostic {
    pub(crate) severity: Severity,
    /// Offset into the compiled text.
    pub(crate) offset: Option<usize>,
    pub(crate) message: String,
}

#[derive(Debug, Default)]
pub(crate) struct CompilerOutput {
    /// Class bytes keyed by binary name.
    pub(crate) classes: BTreeMap<String, Vec<u8>>,
    pub(crate) diagnostics: Vec<Diagnostic>,
}

/// The host's compiler, fed with a patched copy of a source file.
pub(crate) trait HostCompiler: Send + Sync {
    fn compile(&self, file_name: &str, text: &str) -> io::Result<CompilerOutput>;
}

#[derive(Debug)]
pub(crate) struct CompiledClass {
    pub(crate) binary_name: String,
    pub(crate) bytecode: Vec<u8>,
    /// Anonymous and local classes declared by the snippet.
    pub(crate) inner_classes: BTreeMap<String, Vec<u8>>,
    pub(crate) method_name: String,
    pub(crate) method_signature: String,
    /// Captured local variables, in parameter order.
    pub(crate) parameters: Vec<String>,
    pub(crate) is_static: bool,
}

/// Local references, returns and checked exceptions of a snippet.
#[derive(Debug, Default)]
struct SnippetScan {
    /// Nesting in class and lambda bodies.
    depth: usize,
    declared: HashSet<String>,
    free: Vec<(String, JType)>,
    returns: Vec<Option<JType>>,
    thrown: Vec<JType>,
    caught: Vec<Vec<JType>>,
}

impl SnippetScan {
    fn scan_all<'a>(&mut self, trees: impl IntoIterator<Item = &'a Tree>) {
        for tree in trees {
            self.scan(tree);
        }
    }

    fn scan(&mut self, tree: &Tree) {
        match &tree.kind {
            TreeKind::Variable(variable) => {
                self.declared.insert(variable.name.clone());
            }
            TreeKind::Identifier {
                name,
                symbol: Some(symbol),
            } if symbol.kind.is_local()
                && !self.declared.contains(name)
                && !self.free.iter().any(|(free, _)| free == name) =>
            {
                let ty = match &tree.ty {
                    Some(ty) if !ty.is_error() => ty.clone(),
                    _ => JType::declared(OBJECT),
                };
                self.free.push((name.clone(), ty));
            }
            TreeKind::Return { expression } if self.depth == 0 => {
                // An unattributed value still returns something.
                self.returns.push(expression.as_ref().map(|expression| {
                    expression.ty.clone().unwrap_or(JType::Error {
                        name: String::new(),
                    })
                }));
            }
            TreeKind::Throw { expression } if self.depth == 0 => {
                if let Some(ty) = &expression.ty {
                    self.throws(ty);
                }
            }
            TreeKind::MethodInvocation {
                method: Some(element),
                ..
            }
            | TreeKind::NewClass {
                constructor: Some(element),
                ..
            } if self.depth == 0 => {
                for ty in &element.thrown {
                    self.throws(ty);
                }
            }
            _ => {}
        }
        match &tree.kind {
            TreeKind::Try {
                resources,
                block,
                catches,
                finally_block,
            } => {
                let caught = catches
                    .iter()
                    .filter_map(|catch| catch.parameter.ty.clone())
                    .flat_map(|ty| match ty {
                        JType::Union { alternatives } => alternatives,
                        other => vec![other],
                    })
                    .collect();
                self.caught.push(caught);
                self.scan_all(resources);
                self.scan(block);
                self.caught.pop();
                for catch in catches {
                    self.scan(&catch.parameter);
                    self.scan(&catch.block);
                }
                self.scan_all(finally_block.as_deref());
            }
            TreeKind::NewClass {
                enclosing,
                identifier,
                arguments,
                class_body,
                ..
            } => {
                self.scan_all(enclosing.as_deref());
                self.scan(identifier);
                self.scan_all(arguments);
                self.nested(class_body.as_deref());
            }
            TreeKind::Class(_) | TreeKind::Lambda { .. } => self.nested(tree.children()),
            _ => self.scan_all(tree.children()),
        }
    }

    fn nested<'a>(&mut self, trees: impl IntoIterator<Item = &'a Tree>) {
        self.depth += 1;
        self.scan_all(trees);
        self.depth -= 1;
    }

    fn throws(&mut self, ty: &JType) {
        let unchecked =
            ty.is_subtype_of("java.lang.RuntimeException") || ty.is_subtype_of("java.lang.Error");
        let caught = self
            .caught
            .iter()
            .flatten()
            .any(|catch| ty.is_subtype_of(&catch.binary_name()));
        if !unchecked && !caught && !self.thrown.contains(ty) {
            self.thrown.push(ty.clone());
        }
    }
}

/// Unifies the types of explicit returns.
fn unify_returns(returns: &[Option<JType>]) -> JType {
    if returns.iter().all(|ty| ty.as_ref().is_none_or(JType::is_void)) {
        return JType::Void;
    }
    let values: Vec<JType> = returns
        .iter()
        .filter_map(|ty| ty.clone())
        .filter(|ty| !matches!(ty, JType::Void | JType::Null))
        .collect();
    let Some(first) = values.first() else {
        return JType::declared(OBJECT);
    };
    if values.iter().any(JType::is_error) {
        return JType::declared(OBJECT);
    }
    if values.iter().all(|ty| ty == first) {
        return first.clone();
    }
    if values.iter().all(|ty| matches!(ty, JType::Declared { .. })) {
        if let Some(ancestor) = common_ancestor(&values) {
            return JType::declared(&ancestor);
        }
    }
    JType::declared(OBJECT)
}

/// Type of the trailing expression statement and the code rewritten to
/// return its value.
fn implicit_return(snippet: &Snippet) -> Option<(JType, String)> {
    let last = snippet.statements.last()?;
    let TreeKind::ExpressionStatement { expression } = &last.kind else {
        return None;
    };
    let ty = match expression.ty.as_ref()? {
        JType::Void => return None,
        JType::Error { .. } | JType::Null => JType::declared(OBJECT),
        ty => ty.clone(),
    };
    let start = expression.start?.checked_sub(snippet.code_offset)?;
    let end = expression.end?.checked_sub(snippet.code_offset)?;
    let code = &snippet.code;
    let mut rewritten = String::with_capacity(code.len() + 8);
    rewritten.push_str(code.get(..start)?);
    rewritten.push_str("return ");
    rewritten.push_str(code.get(start..end)?);
    let rest = code.get(end..)?;
    if !rest.trim_start().starts_with(';') {
        rewritten.push(';');
    }
    rewritten.push_str(rest);
    Some((ty, rewritten))
}

fn synthetic_class_name(line: u32) -> String {
    format!("StepSnippet{line}")
}

/// Wraps `snippet` into a class nested in the class enclosing
/// `context_path`, compiles the patched file and extracts the class bytes.
pub(crate) fn compile_to_class(
    unit: &CompilationUnit,
    file_name: &str,
    snippet: &Snippet,
    line: u32,
    context_path: &[&Tree],
    static_context: bool,
    compiler: &dyn HostCompiler,
) -> Result<CompiledClass, InvalidExpressionError> {
    let class =
        enclosing_class(context_path).ok_or(InvalidExpressionError::NoEnclosingClass(line))?;
    let TreeKind::Class(declaration) = &class.kind else {
        return Err(InvalidExpressionError::NoEnclosingClass(line));
    };
    let closing_brace = class
        .start
        .zip(class.end)
        .and_then(|(start, end)| unit.text.get(start..end)?.rfind('}').map(|brace| start + brace))
        .ok_or(InvalidExpressionError::NoEnclosingClass(line))?;

    let mut scan = SnippetScan::default();
    scan.scan_all(&snippet.statements);
    let (return_type, code) = if !scan.returns.is_empty() {
        (unify_returns(&scan.returns), snippet.code.clone())
    } else {
        implicit_return(snippet).unwrap_or_else(|| (JType::Void, snippet.code.clone()))
    };

    let name = synthetic_class_name(line);
    let parameters: Vec<String> = scan
        .free
        .iter()
        .map(|(name, ty)| format!("{} {name}", ty.source_name()))
        .collect();
    let throws = if scan.thrown.is_empty() {
        String::new()
    } else {
        let names: Vec<String> = scan.thrown.iter().map(JType::source_name).collect();
        format!(" throws {}", names.join(", "))
    };
    let (class_modifiers, method_modifiers) = if static_context {
        ("static ", "public static ")
    } else {
        ("", "public ")
    };
    let class_text = format!(
        "\n    {class_modifiers}class {name} {{\n        {method_modifiers}{} {INVOKE_METHOD}({}){throws} {{\n{code}\n        }}\n    }}\n",
        return_type.source_name(),
        parameters.join(", "),
    );
    let mut patched = unit.text.clone();
    patched.insert_str(closing_brace, &class_text);
    let inserted = closing_brace..closing_brace + class_text.len();
    debug!(%name, file_name, "compiling snippet class");

    let output = compiler.compile(file_name, &patched)?;
    let error = output.diagnostics.iter().find(|diagnostic| {
        diagnostic.severity == Severity::Error
            && match diagnostic.offset {
                Some(offset) => inserted.contains(&offset),
                None => diagnostic.message.contains(&name),
            }
    });
    if let Some(error) = error {
        return Err(InvalidExpressionError::Compile(error.message.clone()));
    }

    let mut primary = None;
    let mut inner_classes = BTreeMap::new();
    for (binary_name, bytecode) in output.classes {
        if binary_name.ends_with(&name) {
            primary = Some((binary_name, bytecode));
        } else if binary_name.contains(&name) {
            inner_classes.insert(binary_name, bytecode);
        }
    }
    let (binary_name, bytecode) = primary.ok_or_else(|| {
        InvalidExpressionError::MissingClass(format!("{}${name}", declaration.binary_name))
    })?;

    let mut method_signature = String::from("(");
    for (_, ty) in &scan.free {
        method_signature.push_str(&ty.jni_signature());
    }
    method_signature.push(')');
    method_signature.push_str(&return_type.jni_signature());

    Ok(CompiledClass {
        binary_name,
        bytecode,
        inner_classes,
        method_name: INVOKE_METHOD.to_string(),
        method_signature,
        parameters: scan.free.into_iter().map(|(name, _)| name).collect(),
        is_static: static_context,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ast::tests::{Source, ident, local, plain_call, statement};
    use crate::ast::{Catch, ClassDecl, MethodElement, VariableDecl};

    const FILE: &str =
        "package com.example;\nclass App {\n  void run(int x) {\n    work(x);\n  }\n}\n";

    struct FakeCompiler {
        classes: Vec<&'static str>,
        diagnostics: Vec<Diagnostic>,
        compiled: Mutex<Option<String>>,
    }

    impl FakeCompiler {
        fn new(classes: Vec<&'static str>) -> Self {
            FakeCompiler {
                classes,
                diagnostics: Vec::new(),
                compiled: Mutex::new(None),
            }
        }

        fn compiled(&self) -> String {
            self.compiled.lock().expect("lock").clone().expect("compiled text")
        }
    }

    impl HostCompiler for FakeCompiler {
        fn compile(&self, _file_name: &str, text: &str) -> io::Result<CompilerOutput> {
            *self.compiled.lock().expect("lock") = Some(text.to_string());
            Ok(CompilerOutput {
                classes: self
                    .classes
                    .iter()
                    .map(|name| (name.to_string(), vec![0xca, 0xfe]))
                    .collect(),
                diagnostics: self.diagnostics.clone(),
            })
        }
    }

    fn unit() -> (CompilationUnit, Tree) {
        let start = FILE.find("class App").expect("class");
        let class = Tree::new(
            TreeKind::Class(ClassDecl {
                name: "App".to_string(),
                binary_name: "com.example.App".to_string(),
                modifiers: Vec::new(),
                annotations: Vec::new(),
                header_end: None,
                members: Vec::new(),
            }),
            Some(start),
            Some(FILE.len() - 1),
        );
        (CompilationUnit::new(FILE, Vec::new(), Vec::new()), class)
    }

    fn int() -> JType {
        JType::primitive("int")
    }

    fn x_plus_one() -> Snippet {
        let source = Source::new("x + 1");
        let sum = source
            .node(
                "x + 1",
                0,
                TreeKind::Binary {
                    operator: "+".to_string(),
                    left: Box::new(local(&source, "x", 0, int())),
                    right: Box::new(source.node(
                        "1",
                        0,
                        TreeKind::Literal {
                            value: serde_json::json!(1),
                        },
                    )),
                },
            )
            .with_type(int());
        let statement = Tree::new(
            TreeKind::ExpressionStatement {
                expression: Box::new(sum),
            },
            Some(0),
            Some(5),
        );
        Snippet {
            code: source.text.clone(),
            code_offset: 0,
            statements: vec![statement],
        }
    }

    #[test]
    fn trailing_expression_becomes_the_return_value() {
        let (unit, class) = unit();
        let compiler = FakeCompiler::new(vec![
            "com.example.App",
            "com.example.App$StepSnippet4",
            "com.example.App$StepSnippet4$1",
        ]);

        let compiled = compile_to_class(
            &unit,
            "App.java",
            &x_plus_one(),
            4,
            &[&class],
            false,
            &compiler,
        )
        .expect("compiled");

        let text = compiler.compiled();
        assert!(text.contains("public int invoke(int x) {\nreturn x + 1;\n"));
        assert!(text.contains("    class StepSnippet4 {"));
        assert!(text.ends_with("    }\n}\n"));
        assert_eq!("com.example.App$StepSnippet4", compiled.binary_name);
        assert_eq!("(I)I", compiled.method_signature);
        assert_eq!(vec!["x".to_string()], compiled.parameters);
        assert_eq!(
            vec!["com.example.App$StepSnippet4$1"],
            compiled.inner_classes.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn void_call_is_left_unmodified() {
        let (unit, class) = unit();
        let source = Source::new("foo();");
        let call = plain_call(&source, "foo()", 0, "foo", Vec::new()).with_type(JType::Void);
        let snippet = Snippet {
            code: source.text.clone(),
            code_offset: 0,
            statements: vec![statement(call)],
        };
        let compiler = FakeCompiler::new(vec!["com.example.App$StepSnippet4"]);

        let compiled = compile_to_class(&unit, "App.java", &snippet, 4, &[&class], true, &compiler)
            .expect("compiled");

        let text = compiler.compiled();
        assert!(text.contains("static class StepSnippet4 {"));
        assert!(text.contains("public static void invoke() {\nfoo();\n"));
        assert!(!text.contains("return"));
        assert_eq!("()V", compiled.method_signature);
        assert!(compiled.is_static);
    }

    #[test]
    fn code_offset_shifts_the_rewrite() {
        let mut snippet = x_plus_one();
        snippet.code_offset = 100;
        for tree in &mut snippet.statements {
            if let TreeKind::ExpressionStatement { expression } = &mut tree.kind {
                expression.start = Some(100);
                expression.end = Some(105);
            }
        }

        let (ty, code) = implicit_return(&snippet).expect("implicit return");

        assert_eq!(int(), ty);
        assert_eq!("return x + 1;", code);
    }

    #[test]
    fn errors_inside_the_synthetic_class_are_reported() {
        let (unit, class) = unit();
        let mut compiler = FakeCompiler::new(vec!["com.example.App$StepSnippet4"]);
        compiler.diagnostics = vec![
            Diagnostic {
                severity: Severity::Error,
                offset: Some(0),
                message: "unrelated error".to_string(),
            },
            Diagnostic {
                severity: Severity::Warning,
                offset: Some(FILE.len()),
                message: "unchecked".to_string(),
            },
            Diagnostic {
                severity: Severity::Error,
                offset: Some(FILE.len()),
                message: "cannot find symbol: y".to_string(),
            },
        ];

        let error = compile_to_class(
            &unit,
            "App.java",
            &x_plus_one(),
            4,
            &[&class],
            false,
            &compiler,
        )
        .expect_err("compile error");

        assert_eq!("cannot find symbol: y", error.to_string());
    }

    #[test]
    fn missing_class_and_context_are_errors() {
        let (unit, class) = unit();
        let compiler = FakeCompiler::new(vec!["com.example.App"]);

        let missing = compile_to_class(
            &unit,
            "App.java",
            &x_plus_one(),
            4,
            &[&class],
            false,
            &compiler,
        );
        let no_class = compile_to_class(&unit, "App.java", &x_plus_one(), 4, &[], false, &compiler);

        assert!(matches!(missing, Err(InvalidExpressionError::MissingClass(_))));
        assert!(matches!(no_class, Err(InvalidExpressionError::NoEnclosingClass(4))));
    }

    #[test]
    fn explicit_returns_are_unified() {
        let integer = JType::Declared {
            binary_name: "java.lang.Integer".to_string(),
            ancestors: vec!["java.lang.Number".to_string(), OBJECT.to_string()],
        };
        let long = JType::Declared {
            binary_name: "java.lang.Long".to_string(),
            ancestors: vec!["java.lang.Number".to_string(), OBJECT.to_string()],
        };

        assert_eq!(
            JType::declared("java.lang.Number"),
            unify_returns(&[Some(integer.clone()), Some(long)])
        );
        assert_eq!(int(), unify_returns(&[Some(int()), Some(int())]));
        assert_eq!(JType::Void, unify_returns(&[None]));
        assert_eq!(
            JType::declared(OBJECT),
            unify_returns(&[Some(integer), Some(JType::Error { name: String::new() })])
        );
    }

    #[test]
    fn unattributed_return_value_falls_back_to_object() {
        let (unit, class) = unit();
        let source = Source::new("return y;");
        let value = Tree::new(
            TreeKind::Return {
                expression: Some(Box::new(ident(&source, "y", 0))),
            },
            Some(0),
            Some(source.text.len()),
        );
        let snippet = Snippet {
            code: source.text.clone(),
            code_offset: 0,
            statements: vec![value],
        };
        let compiler = FakeCompiler::new(vec!["com.example.App$StepSnippet4"]);

        let compiled = compile_to_class(&unit, "App.java", &snippet, 4, &[&class], false, &compiler)
            .expect("compiled");

        assert!(!compiler.compiled().contains("void invoke()"));
        assert_eq!("()Ljava/lang/Object;", compiled.method_signature);
        assert_eq!(
            JType::declared(OBJECT),
            unify_returns(&[None, Some(JType::Error { name: String::new() })])
        );
    }

    #[test]
    fn checked_exceptions_outside_try_are_declared() {
        let io = JType::Declared {
            binary_name: "java.io.IOException".to_string(),
            ancestors: vec!["java.lang.Exception".to_string()],
        };
        let source = Source::new("read(); try { read(); } catch (IOException e) {}");
        let reading = |nth| {
            let mut call = plain_call(&source, "read()", nth, "read", Vec::new());
            if let TreeKind::MethodInvocation { method, .. } = &mut call.kind {
                *method = Some(MethodElement {
                    name: "read".to_string(),
                    owner: "com.example.App".to_string(),
                    thrown: vec![io.clone()],
                    ..MethodElement::default()
                });
            }
            statement(call)
        };
        let parameter = Tree::new(
            TreeKind::Variable(VariableDecl {
                name: "e".to_string(),
                modifiers: Vec::new(),
                var_type: None,
                initializer: None,
                symbol: None,
            }),
            None,
            None,
        )
        .with_type(io.clone());
        let guarded = Tree::new(
            TreeKind::Try {
                resources: Vec::new(),
                block: Box::new(Tree::new(
                    TreeKind::Block {
                        statements: vec![reading(1)],
                    },
                    None,
                    None,
                )),
                catches: vec![Catch {
                    parameter: Box::new(parameter),
                    block: Box::new(Tree::new(
                        TreeKind::Block {
                            statements: Vec::new(),
                        },
                        None,
                        None,
                    )),
                }],
                finally_block: None,
            },
            None,
            None,
        );

        let mut only_guarded = SnippetScan::default();
        only_guarded.scan(&guarded);
        let mut unguarded = SnippetScan::default();
        unguarded.scan_all([&reading(0), &guarded]);

        assert!(only_guarded.thrown.is_empty());
        assert_eq!(vec![io], unguarded.thrown);
    }
}
