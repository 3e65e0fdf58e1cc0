//! Arguments at a call site and formal parameters of a declared method.

use tracing::debug;

use crate::ast::{CompilationUnit, JType, Tree, TreeKind};
use crate::operation::MethodArgument;

/// Arguments of the call whose method name ends at `method_end`, searched
/// within `method`. Empty when the call is not found or any argument lacks
/// a position.
pub(crate) fn call_arguments(
    unit: &CompilationUnit,
    method: &Tree,
    method_end: usize,
) -> Vec<MethodArgument> {
    let Some(call) = find_call(method, method_end) else {
        debug!(method_end, "no call ends at offset");
        return Vec::new();
    };
    let arguments = match &call.kind {
        TreeKind::MethodInvocation { arguments, .. } | TreeKind::NewClass { arguments, .. } => {
            arguments
        }
        _ => return Vec::new(),
    };
    collect(
        unit,
        arguments.iter().map(|argument| {
            let name = match &argument.kind {
                TreeKind::Identifier { name, .. } => name.clone(),
                _ => unit.source(argument).unwrap_or_default().to_string(),
            };
            (name, type_name(argument.ty.as_ref()), argument)
        }),
    )
}

/// Formal parameters of the method in `class` whose header covers
/// `method_line`.
pub(crate) fn declared_parameters(
    unit: &CompilationUnit,
    class: &Tree,
    method_line: u32,
) -> Vec<MethodArgument> {
    let Some(parameters) = find_method(unit, class, method_line) else {
        debug!(method_line, "no method declared at line");
        return Vec::new();
    };
    collect(
        unit,
        parameters.iter().filter_map(|parameter| match &parameter.kind {
            TreeKind::Variable(variable) => {
                let declared = parameter.ty.as_ref().map(JType::to_string).or_else(|| {
                    variable.var_type.as_ref().and_then(|ty| match &ty.kind {
                        TreeKind::TypeName { name } => Some(name.clone()),
                        _ => None,
                    })
                });
                Some((variable.name.clone(), declared.unwrap_or_default(), parameter))
            }
            _ => None,
        }),
    )
}

fn collect<'a>(
    unit: &CompilationUnit,
    items: impl Iterator<Item = (String, String, &'a Tree)>,
) -> Vec<MethodArgument> {
    let mut arguments = Vec::new();
    for (name, type_name, tree) in items {
        let (Some(start), Some(end)) = (tree.start, tree.end) else {
            debug!(%name, "argument without position");
            return Vec::new();
        };
        arguments.push(MethodArgument {
            name,
            type_name,
            start: unit.position(start),
            end: unit.position(end),
        });
    }
    arguments
}

fn type_name(ty: Option<&JType>) -> String {
    ty.map(JType::to_string).unwrap_or_default()
}

fn find_call(tree: &Tree, method_end: usize) -> Option<&Tree> {
    let name_end = match &tree.kind {
        TreeKind::MethodInvocation { method_select, .. } => method_select.end,
        TreeKind::NewClass { identifier, .. } => identifier.end,
        _ => None,
    };
    if name_end == Some(method_end) {
        return Some(tree);
    }
    tree.children()
        .into_iter()
        .find_map(|child| find_call(child, method_end))
}

fn find_method<'a>(unit: &CompilationUnit, tree: &'a Tree, line: u32) -> Option<&'a [Tree]> {
    if let TreeKind::Method(method) = &tree.kind {
        let start = unit.start_line(tree)?;
        let header_end = match method.body.as_deref() {
            Some(body) => unit.start_line(body)?,
            None => unit.end_line(tree)?,
        };
        if start <= line && line <= header_end {
            return Some(&method.parameters);
        }
    }
    tree.children()
        .into_iter()
        .find_map(|child| find_method(unit, child, line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::tests::{Source, block, ident, local, select_call, statement};
    use crate::ast::{MethodDecl, VariableDecl};

    fn parameter(source: &Source, text: &str, name: &str, ty: JType) -> Tree {
        source
            .node(
                text,
                0,
                TreeKind::Variable(VariableDecl {
                    name: name.to_string(),
                    modifiers: Vec::new(),
                    var_type: None,
                    initializer: None,
                    symbol: None,
                }),
            )
            .with_type(ty)
    }

    fn method(source: &Source, parameters: Vec<Tree>, body: Tree) -> Tree {
        Tree::new(
            TreeKind::Method(MethodDecl {
                name: "save".to_string(),
                modifiers: Vec::new(),
                annotations: Vec::new(),
                return_type: None,
                parameters,
                throws: Vec::new(),
                body: Some(Box::new(body)),
                element: None,
            }),
            Some(source.span("void", 0).0),
            Some(source.text.len()),
        )
    }

    fn fixture() -> (Source, Tree) {
        let source = Source::new(
            "void save(String key,\n          int count) {\n  store.put(key, count + 1);\n}",
        );
        let key = local(&source, "key", 1, JType::declared("java.lang.String"));
        let sum = source
            .node(
                "count + 1",
                0,
                TreeKind::Binary {
                    operator: "+".to_string(),
                    left: Box::new(ident(&source, "count", 1)),
                    right: Box::new(ident(&source, "1", 0)),
                },
            )
            .with_type(JType::primitive("int"));
        let store = local(&source, "store", 0, JType::declared("com.example.Store"));
        let call = select_call(
            &source,
            "store.put(key, count + 1)",
            0,
            store,
            "put",
            vec![key, sum],
        );
        let body = block(vec![statement(call)], source.span("{", 0).0, source.text.len());
        let parameters = vec![
            parameter(&source, "String key", "key", JType::declared("java.lang.String")),
            parameter(&source, "int count", "count", JType::primitive("int")),
        ];
        let method = method(&source, parameters, body);
        (source, method)
    }

    #[test]
    fn call_site_arguments_are_found_by_method_name_end() {
        let (source, method) = fixture();
        let unit = CompilationUnit::new(source.text.clone(), Vec::new(), Vec::new());
        let method_end = source.span("store.put", 0).1;

        let arguments = call_arguments(&unit, &method, method_end);

        assert_eq!(2, arguments.len());
        assert_eq!("key", arguments[0].name);
        assert_eq!("java.lang.String", arguments[0].type_name);
        assert_eq!("count + 1", arguments[1].name);
        assert_eq!("int", arguments[1].type_name);
        assert_eq!(3, arguments[1].start.line);
        assert!(call_arguments(&unit, &method, method_end + 1).is_empty());
    }

    #[test]
    fn declared_parameters_cover_a_multi_line_header() {
        let (source, method) = fixture();
        let unit = CompilationUnit::new(source.text.clone(), Vec::new(), Vec::new());

        let on_first = declared_parameters(&unit, &method, 1);
        let on_second = declared_parameters(&unit, &method, 2);

        assert_eq!(on_first, on_second);
        assert_eq!(
            vec!["key", "count"],
            on_first.iter().map(|arg| arg.name.as_str()).collect::<Vec<_>>()
        );
        assert_eq!("int", on_first[1].type_name);
        assert_eq!(2, on_first[1].start.line);
        assert!(declared_parameters(&unit, &method, 3).is_empty());
    }

    #[test]
    fn missing_position_yields_no_arguments() {
        let (source, mut method) = fixture();
        let unit = CompilationUnit::new(source.text.clone(), Vec::new(), Vec::new());
        if let TreeKind::Method(decl) = &mut method.kind {
            decl.parameters[1].end = None;
        }

        assert!(declared_parameters(&unit, &method, 1).is_empty());
    }
}
