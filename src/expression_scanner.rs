//! Collects the call expressions executed on one source line, in the order
//! the compiler emits their invoke instructions.

use std::collections::HashMap;

use tracing::trace;

use crate::ast::{LineMap, Tree, TreeId, TreeKind, skip_parens};

/// Successor edges between call expressions across control constructs.
#[derive(Debug, Default)]
pub(crate) struct ExpressionsInfo<'a> {
    next: HashMap<TreeId, Vec<&'a Tree>>,
}

impl<'a> ExpressionsInfo<'a> {
    pub(crate) fn add_next_expression(&mut self, from: &Tree, to: &'a Tree) {
        let next = self.next.entry(from.id).or_default();
        if !next.iter().any(|tree| tree.id == to.id) {
            next.push(to);
        }
    }

    pub(crate) fn next_expressions(&self, tree: &Tree) -> &[&'a Tree] {
        self.next.get(&tree.id).map_or(&[], Vec::as_slice)
    }
}

pub(crate) struct ExpressionScanner<'m> {
    line_map: &'m LineMap,
    line: u32,
    statement_start: u32,
    statement_end: u32,
    /// When unset every tree is accepted; used to find successors that lie
    /// on other lines.
    check_bounds: bool,
}

impl<'m> ExpressionScanner<'m> {
    pub(crate) fn new(
        line_map: &'m LineMap,
        line: u32,
        statement_start: u32,
        statement_end: u32,
    ) -> Self {
        ExpressionScanner {
            line_map,
            line,
            statement_start,
            statement_end,
            check_bounds: true,
        }
    }

    /// Calls under `tree` on the target line, arguments before the call
    /// that consumes them.
    pub(crate) fn scan<'a>(
        &mut self,
        tree: &'a Tree,
        info: &mut ExpressionsInfo<'a>,
    ) -> Vec<&'a Tree> {
        if !self.accepts(tree) {
            return Vec::new();
        }
        self.visit(tree, info)
    }

    fn scan_all<'a>(
        &mut self,
        trees: impl IntoIterator<Item = &'a Tree>,
        info: &mut ExpressionsInfo<'a>,
    ) -> Vec<&'a Tree> {
        let mut result = Vec::new();
        for tree in trees {
            result.extend(self.scan(tree, info));
        }
        result
    }

    fn accepts(&self, tree: &Tree) -> bool {
        if !self.check_bounds {
            return true;
        }
        let start = tree
            .start
            .map_or(self.statement_start, |offset| self.line_map.line_number(offset));
        let end = tree
            .end
            .map_or(self.statement_end, |offset| self.line_map.line_number(offset));
        start <= self.line && self.line <= end
    }

    fn visit<'a>(&mut self, tree: &'a Tree, info: &mut ExpressionsInfo<'a>) -> Vec<&'a Tree> {
        match &tree.kind {
            TreeKind::MethodInvocation {
                method_select,
                arguments,
                ..
            } => {
                let mut result = self.scan(method_select, info);
                result.extend(self.scan_all(arguments, info));
                result.push(tree);
                result
            }
            TreeKind::NewClass {
                enclosing,
                arguments,
                ..
            } => {
                let mut result = self.scan_all(enclosing.as_deref(), info);
                result.extend(self.scan_all(arguments, info));
                result.push(tree);
                result
            }
            TreeKind::Conditional {
                condition,
                true_expression,
                false_expression,
            } => {
                if let Some(value) = literal_condition(condition) {
                    trace!(value, "pruning constant conditional branch");
                    let taken = if value { true_expression } else { false_expression };
                    return self.scan(taken, info);
                }
                let cond = self.scan(condition, info);
                let when_true = self.scan(true_expression, info);
                let when_false = self.scan(false_expression, info);
                self.link(info, &cond, &when_true, &[&**true_expression]);
                self.link(info, &cond, &when_false, &[&**false_expression]);
                concat([cond, when_true, when_false])
            }
            TreeKind::If {
                condition,
                then_statement,
                else_statement,
            } => {
                let cond = self.scan(condition, info);
                let then_part = self.scan(then_statement, info);
                self.link(info, &cond, &then_part, &[&**then_statement]);
                let mut else_part = Vec::new();
                if let Some(else_statement) = else_statement {
                    else_part = self.scan(else_statement, info);
                    self.link(info, &cond, &else_part, &[&**else_statement]);
                }
                concat([cond, then_part, else_part])
            }
            TreeKind::WhileLoop { condition, body } => {
                let cond = self.scan(condition, info);
                let body_part = self.scan(body, info);
                self.link(info, &cond, &body_part, &[&**body]);
                self.link(info, &body_part, &cond, &[&**condition]);
                concat([cond, body_part])
            }
            TreeKind::DoWhileLoop { body, condition } => {
                let body_part = self.scan(body, info);
                let cond = self.scan(condition, info);
                self.link(info, &body_part, &cond, &[&**condition]);
                self.link(info, &cond, &body_part, &[&**body]);
                concat([body_part, cond])
            }
            TreeKind::ForLoop {
                initializer,
                condition,
                update,
                body,
            } => {
                let init = self.scan_all(initializer, info);
                let cond = self.scan_all(condition.as_deref(), info);
                let body_part = self.scan(body, info);
                let updates = self.scan_all(update, info);

                let cond_trees: Vec<&Tree> = condition.as_deref().into_iter().collect();
                let update_trees: Vec<&Tree> = update.iter().collect();
                let body_trees = [&**body];
                // Where control goes after the initializer and after the update.
                let (head, head_trees) = if cond_trees.is_empty() {
                    (&body_part, &body_trees[..])
                } else {
                    (&cond, &cond_trees[..])
                };
                self.link(info, &init, head, head_trees);
                self.link(info, &cond, &body_part, &body_trees);
                if update_trees.is_empty() {
                    self.link(info, &body_part, head, head_trees);
                } else {
                    self.link(info, &body_part, &updates, &update_trees);
                }
                self.link(info, &updates, head, head_trees);
                concat([init, cond, body_part, updates])
            }
            TreeKind::EnhancedForLoop {
                expression, body, ..
            } => {
                let iterable = self.scan(expression, info);
                let body_part = self.scan(body, info);
                self.link(info, &iterable, &body_part, &[&**body]);
                self.link(info, &body_part, &body_part, &[&**body]);
                concat([iterable, body_part])
            }
            TreeKind::Switch { selector, cases } => {
                let mut result = self.scan(selector, info);
                let selected = result.clone();
                for case in cases {
                    let labels = self.scan_all(&case.labels, info);
                    let body_part = self.scan_all(&case.body, info);
                    let case_trees: Vec<&Tree> = case.body.iter().collect();
                    self.link(info, &selected, &body_part, &case_trees);
                    result.extend(labels);
                    result.extend(body_part);
                }
                result
            }
            // Lambda and class bodies are compiled into other methods.
            TreeKind::Lambda { .. }
            | TreeKind::Class(_)
            | TreeKind::Annotation { .. }
            | TreeKind::TypeName { .. } => Vec::new(),
            _ => self.scan_all(tree.children(), info),
        }
    }

    /// Records an edge from the last call of `from` to the first call that
    /// runs next. When none of the successor's calls are on the target line
    /// the successor trees are rescanned without line bounds.
    fn link<'a>(
        &mut self,
        info: &mut ExpressionsInfo<'a>,
        from: &[&'a Tree],
        on_line: &[&'a Tree],
        successors: &[&'a Tree],
    ) {
        let Some(last) = from.last() else {
            return;
        };
        let first = match on_line.first() {
            Some(first) => Some(*first),
            None => {
                let check_bounds = std::mem::replace(&mut self.check_bounds, false);
                let all = self.scan_all(successors.iter().copied(), info);
                self.check_bounds = check_bounds;
                all.first().copied()
            }
        };
        if let Some(first) = first {
            info.add_next_expression(last, first);
        }
    }
}

fn literal_condition(condition: &Tree) -> Option<bool> {
    match &skip_parens(condition).kind {
        TreeKind::Literal { value } => value.as_bool(),
        _ => None,
    }
}

fn concat<'a, const N: usize>(parts: [Vec<&'a Tree>; N]) -> Vec<&'a Tree> {
    parts.into_iter().flatten().collect()
}
