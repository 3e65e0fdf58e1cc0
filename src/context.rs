//! Editor-side services over cached compilation units. Every request runs
//! on one scanning thread, because a unit and its trees must not be used
//! from two places at once.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use tracing::{debug, warn};

use crate::ast::{
    CompilationUnit, MethodDecl, Tree, TreeId, TreeKind, enclosing_class, enclosing_method,
};
use crate::ast2bytecode::match_source_tree_to_bytecode;
use crate::constant_pool::ConstantPool;
use crate::error::{ContextError, InvalidExpressionError};
use crate::expression_scanner::{ExpressionScanner, ExpressionsInfo};
use crate::ir::BytecodeProvider;
use crate::method_arguments::{call_arguments, declared_parameters};
use crate::operation::{MethodArgument, Operation};
use crate::snippet::{CompiledClass, HostCompiler, Snippet, compile_to_class};

/// How long a request waits for its scan before handing back a pending
/// result.
const LAZY_SCAN_TIMEOUT: Duration = Duration::from_millis(200);

/// Thread a request is made from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum CallerContext {
    /// May block until the scan finishes.
    Worker,
    /// Must never block past the lazy timeout.
    EventDispatch,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Queued,
    Running,
    Done,
    Cancelled,
}

impl Status {
    fn is_finished(self) -> bool {
        matches!(self, Status::Done | Status::Cancelled)
    }
}

struct TaskState<T> {
    status: Status,
    result: Option<Result<T>>,
}

struct TaskShared<T> {
    state: Mutex<TaskState<T>>,
    finished: Condvar,
}

impl<T> TaskShared<T> {
    fn lock(&self) -> MutexGuard<'_, TaskState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn finish(&self, status: Status, result: Option<Result<T>>) {
        let mut state = self.lock();
        state.status = status;
        state.result = result;
        self.finished.notify_all();
    }
}

/// Handle to a job posted to the [`ScanningProcessor`].
pub(crate) struct ScanTask<T> {
    shared: Arc<TaskShared<T>>,
}

impl<T> ScanTask<T> {
    fn new() -> Self {
        ScanTask {
            shared: Arc::new(TaskShared {
                state: Mutex::new(TaskState {
                    status: Status::Queued,
                    result: None,
                }),
                finished: Condvar::new(),
            }),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.shared.lock().status.is_finished()
    }

    /// Waits at most `timeout`; true when the task has finished.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .finished
            .wait_timeout_while(state, timeout, |state| !state.status.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        state.status.is_finished()
    }

    pub(crate) fn wait(self) -> Result<T> {
        let state = self.shared.lock();
        let mut state = self
            .shared
            .finished
            .wait_while(state, |state| !state.status.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        state
            .result
            .take()
            .unwrap_or_else(|| Err(anyhow!("scan task was cancelled")))
    }

    /// Prevents a queued task from running. A running task completes; the
    /// caller merely stops waiting for it.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.shared.lock();
        if state.status != Status::Queued {
            return false;
        }
        state.status = Status::Cancelled;
        self.shared.finished.notify_all();
        true
    }
}

/// A request whose scan outlived the lazy timeout on an event thread.
pub(crate) struct PendingScan<T>(ScanTask<T>);

impl<T> PendingScan<T> {
    pub(crate) fn is_done(&self) -> bool {
        self.0.is_done()
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        self.0.wait_timeout(timeout)
    }

    pub(crate) fn wait(self) -> Result<T> {
        self.0.wait()
    }

    pub(crate) fn cancel(&self) -> bool {
        self.0.cancel()
    }
}

impl<T> fmt::Debug for PendingScan<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingScan")
            .field("done", &self.is_done())
            .finish()
    }
}

type Job = Box<dyn FnOnce() + Send>;

/// Single worker thread executing posted jobs in submission order.
pub(crate) struct ScanningProcessor {
    sender: Option<mpsc::Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl ScanningProcessor {
    pub(crate) fn new() -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name("scanning-processor".to_string())
            .spawn(move || {
                for job in receiver {
                    job();
                }
            })
            .context("failed to start scanning thread")?;
        Ok(ScanningProcessor {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub(crate) fn post<T, F>(&self, job: F) -> ScanTask<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let task = ScanTask::new();
        let shared = Arc::clone(&task.shared);
        let run: Job = Box::new(move || {
            {
                let mut state = shared.lock();
                if state.status == Status::Cancelled {
                    return;
                }
                state.status = Status::Running;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(job))
                .unwrap_or_else(|_| Err(anyhow!("scan task panicked")));
            shared.finish(Status::Done, Some(result));
        });
        let posted = self.sender.as_ref().map(|sender| sender.send(run));
        if !matches!(posted, Some(Ok(()))) {
            task.shared.finish(
                Status::Done,
                Some(Err(anyhow!("scanning processor has stopped"))),
            );
        }
        task
    }
}

impl Drop for ScanningProcessor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("scanning thread panicked");
            }
        }
    }
}

/// Waits briefly for `task`. Worker callers then block; event callers get
/// the task back inside [`ContextError::Pending`].
pub(crate) fn scan_really_lazy<T: fmt::Debug>(
    caller: CallerContext,
    task: ScanTask<T>,
) -> Result<T, ContextError<T>> {
    if task.wait_timeout(LAZY_SCAN_TIMEOUT) || caller == CallerContext::Worker {
        return task.wait().map_err(ContextError::Failed);
    }
    debug!("scan still running, deferring result");
    Err(ContextError::Pending(PendingScan(task)))
}

/// Source of attributed compilation units.
pub(crate) trait UnitLoader: Send + Sync {
    fn modified(&self, path: &Path) -> Result<SystemTime>;
    fn load(&self, path: &Path) -> Result<CompilationUnit>;
}

/// Loads units from the JSON documents written by the host parser.
#[derive(Debug, Default)]
pub(crate) struct JsonUnitLoader;

impl UnitLoader for JsonUnitLoader {
    fn modified(&self, path: &Path) -> Result<SystemTime> {
        fs::metadata(path)
            .and_then(|metadata| metadata.modified())
            .with_context(|| format!("failed to stat {}", path.display()))
    }

    fn load(&self, path: &Path) -> Result<CompilationUnit> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        CompilationUnit::from_json(&json)
            .with_context(|| format!("invalid unit {}", path.display()))
    }
}

struct CachedUnit {
    modified: SystemTime,
    unit: Arc<Mutex<CompilationUnit>>,
}

/// Parsed units keyed by path, reloaded once the file is newer than the
/// snapshot.
pub(crate) struct ControllerCache {
    loader: Arc<dyn UnitLoader>,
    units: Mutex<HashMap<PathBuf, CachedUnit>>,
}

impl ControllerCache {
    pub(crate) fn new(loader: Arc<dyn UnitLoader>) -> Self {
        ControllerCache {
            loader,
            units: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn unit(&self, path: &Path) -> Result<Arc<Mutex<CompilationUnit>>> {
        let modified = self.loader.modified(path)?;
        let mut units = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = units.get(path) {
            if modified <= cached.modified {
                return Ok(Arc::clone(&cached.unit));
            }
            debug!(path = %path.display(), "unit changed, reloading");
        }
        let unit = Arc::new(Mutex::new(self.loader.load(path)?));
        units.insert(
            path.to_path_buf(),
            CachedUnit {
                modified,
                unit: Arc::clone(&unit),
            },
        );
        Ok(unit)
    }

    pub(crate) fn invalidate(&self, path: &Path) {
        self.units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path);
    }
}

type FieldKey = (String, Option<String>);

/// Memoized field declaration lines per source file.
#[derive(Debug, Default)]
pub(crate) struct FieldLineCache {
    lines: Mutex<HashMap<PathBuf, HashMap<FieldKey, u32>>>,
}

impl FieldLineCache {
    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, HashMap<FieldKey, u32>>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, path: &Path, class: &str, field: Option<&str>) -> Option<u32> {
        let key = (class.to_string(), field.map(str::to_string));
        self.lock().get(path)?.get(&key).copied()
    }

    pub(crate) fn insert(&self, path: &Path, class: &str, field: Option<&str>, line: u32) {
        let key = (class.to_string(), field.map(str::to_string));
        self.lock()
            .entry(path.to_path_buf())
            .or_default()
            .insert(key, line);
    }

    pub(crate) fn purge(&self, path: &Path) {
        self.lock().remove(path);
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum FileEvent {
    Changed(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

/// Subscriber to file system changes, implemented by holders of per-file
/// caches.
pub(crate) trait FileChangeListener {
    fn file_event(&self, event: &FileEvent);
}

/// Tree context handed to an expression interpreter.
pub(crate) trait TreeContext {
    fn set_trees(&mut self, unit: &CompilationUnit);
    fn set_tree_path(&mut self, path: &[&Tree]);
}

pub(crate) trait ExpressionInterpreter<C: TreeContext> {
    type Output;
    fn can_interpret(&mut self, statements: &[Tree], context: &mut C) -> bool;
    fn interpret(&mut self, statements: &[Tree], context: &mut C) -> Result<Self::Output>;
}

/// A snippet to evaluate at a line, interpreted when possible.
pub(crate) struct EvaluationRequest<C, I> {
    pub(crate) snippet: Snippet,
    pub(crate) line: u32,
    pub(crate) static_context: bool,
    pub(crate) interpreter: I,
    pub(crate) context: C,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub(crate) struct MethodDeclaration {
    pub(crate) class_name: String,
    pub(crate) name: String,
    pub(crate) signature: String,
}

/// One editor session: the scanning thread plus the caches it owns.
pub(crate) struct EditorContext {
    processor: ScanningProcessor,
    units: Arc<ControllerCache>,
    field_lines: Arc<FieldLineCache>,
}

impl EditorContext {
    pub(crate) fn new(loader: Arc<dyn UnitLoader>) -> Result<Self> {
        Ok(EditorContext {
            processor: ScanningProcessor::new()?,
            units: Arc::new(ControllerCache::new(loader)),
            field_lines: Arc::new(FieldLineCache::default()),
        })
    }

    fn with_unit<T, F>(
        &self,
        path: &Path,
        caller: CallerContext,
        f: F,
    ) -> Result<T, ContextError<T>>
    where
        T: Send + fmt::Debug + 'static,
        F: FnOnce(&CompilationUnit) -> Result<T> + Send + 'static,
    {
        let units = Arc::clone(&self.units);
        let path = path.to_path_buf();
        let task = self.processor.post(move || {
            let unit = units.unit(&path)?;
            let unit = unit.lock().unwrap_or_else(PoisonError::into_inner);
            f(&unit)
        });
        scan_really_lazy(caller, task)
    }

    /// Operations on `line`; `None` when source and bytecode disagree.
    pub(crate) fn operations(
        &self,
        path: &Path,
        line: u32,
        bytecode: Arc<dyn BytecodeProvider>,
        caller: CallerContext,
    ) -> Result<Option<Vec<Operation>>, ContextError<Option<Vec<Operation>>>> {
        let description = path.display().to_string();
        self.with_unit(path, caller, move |unit| {
            compute_operations(unit, line, bytecode.as_ref(), &description)
        })
    }

    pub(crate) fn arguments_at_operation(
        &self,
        path: &Path,
        operation: &Operation,
        caller: CallerContext,
    ) -> Result<Vec<MethodArgument>, ContextError<Vec<MethodArgument>>> {
        let method_end = operation.method_end.offset;
        self.with_unit(path, caller, move |unit| {
            let tree_path = unit.path_for(method_end.saturating_sub(1));
            Ok(enclosing_method(&tree_path)
                .map(|method| call_arguments(unit, method, method_end))
                .unwrap_or_default())
        })
    }

    pub(crate) fn arguments_at_line(
        &self,
        path: &Path,
        method_line: u32,
        caller: CallerContext,
    ) -> Result<Vec<MethodArgument>, ContextError<Vec<MethodArgument>>> {
        self.with_unit(path, caller, move |unit| {
            let Some(offset) = unit.line_offset(method_line) else {
                return Ok(Vec::new());
            };
            Ok(enclosing_class(&unit.path_for(offset))
                .map(|class| declared_parameters(unit, class, method_line))
                .unwrap_or_default())
        })
    }

    pub(crate) fn imports(
        &self,
        path: &Path,
        caller: CallerContext,
    ) -> Result<Vec<String>, ContextError<Vec<String>>> {
        self.with_unit(path, caller, |unit| Ok(unit.imports.clone()))
    }

    /// Line of `field` in `class`, or the first line of the class body
    /// when no field is given.
    pub(crate) fn field_line_number(
        &self,
        path: &Path,
        class_name: &str,
        field: Option<&str>,
        caller: CallerContext,
    ) -> Result<Option<u32>, ContextError<Option<u32>>> {
        if let Some(line) = self.field_lines.get(path, class_name, field) {
            return Ok(Some(line));
        }
        let cache = Arc::clone(&self.field_lines);
        let key_path = path.to_path_buf();
        let class_name = class_name.to_string();
        let field = field.map(str::to_string);
        self.with_unit(path, caller, move |unit| {
            let line = field_line(unit, &class_name, field.as_deref());
            if let Some(line) = line {
                cache.insert(&key_path, &class_name, field.as_deref(), line);
            }
            Ok(line)
        })
    }

    /// Lines of the names of methods called `method_name` in `class_name`,
    /// restricted to `signature` when given.
    pub(crate) fn method_line_numbers(
        &self,
        path: &Path,
        class_name: &str,
        excludes: Vec<String>,
        method_name: &str,
        signature: Option<&str>,
        caller: CallerContext,
    ) -> Result<Vec<u32>, ContextError<Vec<u32>>> {
        let class_name = class_name.to_string();
        let method_name = method_name.to_string();
        let signature = signature.map(str::to_string);
        self.with_unit(path, caller, move |unit| {
            Ok(method_lines(
                unit,
                &class_name,
                &excludes,
                &method_name,
                signature.as_deref(),
            ))
        })
    }

    /// Binary name of the class declared around `offset`.
    pub(crate) fn class_declared_at(
        &self,
        path: &Path,
        offset: usize,
        caller: CallerContext,
    ) -> Result<Option<String>, ContextError<Option<String>>> {
        self.with_unit(path, caller, move |unit| {
            Ok(enclosing_class(&unit.path_for(offset)).and_then(|class| match &class.kind {
                TreeKind::Class(declaration) => Some(declaration.binary_name.clone()),
                _ => None,
            }))
        })
    }

    pub(crate) fn method_declared_at(
        &self,
        path: &Path,
        offset: usize,
        caller: CallerContext,
    ) -> Result<Option<MethodDeclaration>, ContextError<Option<MethodDeclaration>>> {
        self.with_unit(path, caller, move |unit| {
            let tree_path = unit.path_for(offset);
            let (Some(method), Some(class)) =
                (enclosing_method(&tree_path), enclosing_class(&tree_path))
            else {
                return Ok(None);
            };
            let (TreeKind::Method(method), TreeKind::Class(class)) = (&method.kind, &class.kind)
            else {
                return Ok(None);
            };
            Ok(Some(MethodDeclaration {
                class_name: class.binary_name.clone(),
                name: method.name.clone(),
                signature: method_signature(method),
            }))
        })
    }

    /// Interprets the snippet when `request.interpreter` accepts it,
    /// otherwise compiles it and hands the class to `handler`.
    pub(crate) fn interpret_or_compile_code<C, I, H, R>(
        &self,
        path: &Path,
        request: EvaluationRequest<C, I>,
        compiler: Arc<dyn HostCompiler>,
        handler: H,
        caller: CallerContext,
    ) -> Result<R, ContextError<R>>
    where
        C: TreeContext + Send + 'static,
        I: ExpressionInterpreter<C, Output = R> + Send + 'static,
        H: FnOnce(CompiledClass) -> Result<R> + Send + 'static,
        R: Send + fmt::Debug + 'static,
    {
        self.with_unit(path, caller, move |unit| {
            let EvaluationRequest {
                snippet,
                line,
                static_context,
                mut interpreter,
                mut context,
            } = request;
            let offset = unit.line_offset(line).ok_or_else(|| {
                InvalidExpressionError::Context(format!("line {line} is outside the file"))
            })?;
            let tree_path = unit.path_for(offset);
            context.set_trees(unit);
            context.set_tree_path(&tree_path);
            if interpreter.can_interpret(&snippet.statements, &mut context) {
                return interpreter.interpret(&snippet.statements, &mut context);
            }
            let file_name = source_file_name(unit);
            let class = compile_to_class(
                unit,
                &file_name,
                &snippet,
                line,
                &tree_path,
                static_context,
                compiler.as_ref(),
            )?;
            handler(class)
        })
    }
}

impl FileChangeListener for EditorContext {
    fn file_event(&self, event: &FileEvent) {
        let paths = match event {
            FileEvent::Changed(path) | FileEvent::Deleted(path) => vec![path],
            FileEvent::Renamed { from, to } => vec![from, to],
        };
        for path in paths {
            debug!(path = %path.display(), "purging caches");
            self.units.invalidate(path);
            self.field_lines.purge(path);
        }
    }
}

/// Innermost statement-like tree a line's calls are collected from.
fn find_statement_in_scope<'a>(path: &[&'a Tree]) -> Option<&'a Tree> {
    path.iter().rev().copied().find(|tree| {
        matches!(
            tree.kind,
            TreeKind::Block { .. }
                | TreeKind::ExpressionStatement { .. }
                | TreeKind::Lambda { .. }
                | TreeKind::Method(_)
        )
    })
}

/// First and last line spanned by `trees`, ignoring unpositioned ones.
fn line_span(unit: &CompilationUnit, trees: &[&Tree]) -> Option<(u32, u32)> {
    let mut span: Option<(u32, u32)> = None;
    for tree in trees {
        let (Some(start), Some(end)) = (unit.start_line(tree), unit.end_line(tree)) else {
            continue;
        };
        span = Some(match span {
            Some((first, last)) => (first.min(start), last.max(end)),
            None => (start, end),
        });
    }
    span
}

/// Operations of the calls on `line`, with next-operation links.
pub(crate) fn compute_operations(
    unit: &CompilationUnit,
    line: u32,
    bytecode: &dyn BytecodeProvider,
    description: &str,
) -> Result<Option<Vec<Operation>>> {
    let Some(offset) = unit.line_offset(line) else {
        return Ok(Some(Vec::new()));
    };
    let path = unit.path_for(offset);
    let Some(mut statement) = find_statement_in_scope(&path).or_else(|| enclosing_method(&path))
    else {
        return Ok(Some(Vec::new()));
    };
    if let TreeKind::Lambda { body, .. } = &statement.kind {
        statement = &**body;
    }
    let (Some(statement_start), Some(statement_end)) =
        (unit.start_line(statement), unit.end_line(statement))
    else {
        return Ok(None);
    };
    let mut info = ExpressionsInfo::default();
    let trees = ExpressionScanner::new(unit.line_map(), line, statement_start, statement_end)
        .scan(statement, &mut info);
    debug!(line, count = trees.len(), "expression trees");
    if trees.is_empty() {
        return Ok(Some(Vec::new()));
    }
    let Some((first_line, last_line)) = line_span(unit, &trees) else {
        return Ok(None);
    };
    let Some(windows) = bytecode.index_at_lines(first_line, last_line) else {
        return Ok(None);
    };
    let pool = bytecode
        .constant_pool()
        .map(|bytes| ConstantPool::parse(bytes, description));
    let mut node_operations = HashMap::new();
    let Some(mut operations) = match_source_tree_to_bytecode(
        unit,
        &trees,
        bytecode.byte_codes(),
        &windows,
        pool.as_ref(),
        &mut node_operations,
    )?
    else {
        return Ok(None);
    };
    assign_next_operations(
        unit,
        statement,
        bytecode,
        pool.as_ref(),
        &trees,
        &info,
        &node_operations,
        &mut operations,
    )?;
    Ok(Some(operations))
}

#[allow(clippy::too_many_arguments)]
fn assign_next_operations(
    unit: &CompilationUnit,
    root: &Tree,
    bytecode: &dyn BytecodeProvider,
    pool: Option<&ConstantPool>,
    trees: &[&Tree],
    info: &ExpressionsInfo<'_>,
    node_operations: &HashMap<TreeId, Operation>,
    operations: &mut [Operation],
) -> Result<()> {
    for (index, tree) in trees.iter().enumerate() {
        let successors = info.next_expressions(tree);
        if successors.is_empty() {
            continue;
        }
        // Unmatched trees hand their successors to the previous operation.
        let Some(from) = trees[..=index]
            .iter()
            .rev()
            .find_map(|tree| node_operations.get(&tree.id))
            .map(|operation| operation.bytecode_index)
        else {
            continue;
        };
        for successor in successors {
            let next = match node_operations.get(&successor.id) {
                Some(operation) => Some(operation.bytecode_index),
                None => match_successor(unit, root, bytecode, pool, successor)?,
            };
            let Some(next) = next else {
                warn!(from, "next operation not found");
                continue;
            };
            for operation in operations.iter_mut() {
                if operation.bytecode_index == from {
                    operation.add_next_operation(next);
                }
            }
        }
    }
    Ok(())
}

/// Bytecode index of `successor`, matched in a pass over its own lines.
fn match_successor(
    unit: &CompilationUnit,
    root: &Tree,
    bytecode: &dyn BytecodeProvider,
    pool: Option<&ConstantPool>,
    successor: &Tree,
) -> Result<Option<usize>> {
    let (Some(start), Some(end)) = (unit.start_line(successor), unit.end_line(successor)) else {
        return Ok(None);
    };
    let mut info = ExpressionsInfo::default();
    let trees = ExpressionScanner::new(unit.line_map(), start, start, end).scan(root, &mut info);
    let (Some(first), Some(last)) = (trees.first(), trees.last()) else {
        return Ok(None);
    };
    let (Some(first_line), Some(last_line)) = (unit.start_line(first), unit.end_line(last)) else {
        return Ok(None);
    };
    let Some(windows) = bytecode.index_at_lines(first_line, last_line) else {
        return Ok(None);
    };
    let mut node_operations = HashMap::new();
    match_source_tree_to_bytecode(
        unit,
        &trees,
        bytecode.byte_codes(),
        &windows,
        pool,
        &mut node_operations,
    )?;
    Ok(node_operations
        .get(&successor.id)
        .map(|operation| operation.bytecode_index))
}

fn class_members<'a>(
    unit: &'a CompilationUnit,
    class_name: &str,
    excludes: &[String],
) -> &'a [Tree] {
    match unit.find_class(class_name, excludes).map(|class| &class.kind) {
        Some(TreeKind::Class(declaration)) => &declaration.members,
        _ => &[],
    }
}

fn field_line(unit: &CompilationUnit, class_name: &str, field: Option<&str>) -> Option<u32> {
    let Some(field) = field else {
        let class = unit.find_class(class_name, &[])?;
        let TreeKind::Class(declaration) = &class.kind else {
            return None;
        };
        let from = declaration.header_end.or(class.start)?;
        let brace = from + unit.text.get(from..class.end?)?.find('{')?;
        return Some(unit.line_map().line_number(brace) + 1);
    };
    class_members(unit, class_name, &[])
        .iter()
        .find(|member| {
            matches!(&member.kind, TreeKind::Variable(variable) if variable.name == field)
        })
        .and_then(|member| name_line(unit, member, field))
}

fn method_lines(
    unit: &CompilationUnit,
    class_name: &str,
    excludes: &[String],
    method_name: &str,
    signature: Option<&str>,
) -> Vec<u32> {
    let simple_name = class_name
        .rsplit(['.', '/', '$'])
        .next()
        .unwrap_or(class_name);
    class_members(unit, class_name, excludes)
        .iter()
        .filter_map(|member| match &member.kind {
            TreeKind::Method(method) if method.name == method_name => Some((member, method)),
            _ => None,
        })
        .filter(|(_, method)| {
            signature.is_none_or(|signature| {
                parameters_part(&method_signature(method)) == parameters_part(signature)
            })
        })
        .filter_map(|(member, method)| {
            let name = if method.name == "<init>" {
                simple_name
            } else {
                method.name.as_str()
            };
            name_line(unit, member, name)
        })
        .collect()
}

/// Signature up to and including the closing parenthesis.
fn parameters_part(signature: &str) -> &str {
    signature
        .find(')')
        .map_or(signature, |end| &signature[..=end])
}

/// JNI signature of a declared method.
fn method_signature(method: &MethodDecl) -> String {
    if let Some(element) = &method.element {
        return element.signature();
    }
    let mut signature = String::from("(");
    for parameter in &method.parameters {
        match &parameter.ty {
            Some(ty) => signature.push_str(&ty.jni_signature()),
            None => signature.push_str("Ljava/lang/Object;"),
        }
    }
    signature.push(')');
    match method.return_type.as_ref().and_then(|ty| ty.ty.as_ref()) {
        Some(ty) => signature.push_str(&ty.jni_signature()),
        None => signature.push('V'),
    }
    signature
}

/// Line of the first whole-word occurrence of `name` inside `tree`.
fn name_line(unit: &CompilationUnit, tree: &Tree, name: &str) -> Option<u32> {
    let start = tree.start?;
    let text = unit.text.get(start..tree.end?)?;
    let is_ident = |c: char| c.is_alphanumeric() || c == '_' || c == '$';
    let position = text.match_indices(name).map(|(at, _)| at).find(|&at| {
        let before = text[..at].chars().next_back();
        let after = text[at + name.len()..].chars().next();
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })?;
    Some(unit.line_map().line_number(start + position))
}

/// File name javac expects for the unit's first top-level class.
fn source_file_name(unit: &CompilationUnit) -> String {
    unit.types
        .iter()
        .find_map(|tree| match &tree.kind {
            TreeKind::Class(class) => Some(format!("{}.java", class.name)),
            _ => None,
        })
        .unwrap_or_else(|| "Snippet.java".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::ast::tests::{Source, block, plain_call, statement};
    use crate::ast::{ClassDecl, JType, VariableDecl};
    use crate::constant_pool::tests::PoolBuilder;
    use crate::ir::{LineNumber, Method, MethodAccess, MethodBytecode};
    use crate::opcodes::{IFEQ, INVOKESTATIC, RETURN};
    use crate::snippet::{CompilerOutput, Severity};

    const TEXT: &str =
        "class App {\n  void go() {\n    if (check()) {\n      run();\n    }\n  }\n  int count;\n}\n";

    fn app_unit() -> CompilationUnit {
        let source = Source::new(TEXT);
        let check = plain_call(&source, "check()", 0, "check", Vec::new());
        let run = statement(plain_call(&source, "run()", 0, "run", Vec::new()));
        let then_block = block(vec![run], source.span("{", 2).0, source.span("}", 0).1);
        let if_tree = Tree::new(
            TreeKind::If {
                condition: Box::new(check),
                then_statement: Box::new(then_block),
                else_statement: None,
            },
            Some(source.span("if", 0).0),
            Some(source.span("}", 0).1),
        );
        let body = block(vec![if_tree], source.span("{", 1).0, source.span("}", 1).1);
        let method = Tree::new(
            TreeKind::Method(MethodDecl {
                name: "go".to_string(),
                modifiers: Vec::new(),
                annotations: Vec::new(),
                return_type: None,
                parameters: Vec::new(),
                throws: Vec::new(),
                body: Some(Box::new(body)),
                element: None,
            }),
            Some(source.span("void", 0).0),
            Some(source.span("}", 1).1),
        );
        let field = source
            .node(
                "int count;",
                0,
                TreeKind::Variable(VariableDecl {
                    name: "count".to_string(),
                    modifiers: Vec::new(),
                    var_type: None,
                    initializer: None,
                    symbol: None,
                }),
            )
            .with_type(JType::primitive("int"));
        let class = Tree::new(
            TreeKind::Class(ClassDecl {
                name: "App".to_string(),
                binary_name: "App".to_string(),
                modifiers: Vec::new(),
                annotations: Vec::new(),
                header_end: None,
                members: vec![method, field],
            }),
            Some(0),
            Some(TEXT.len() - 1),
        );
        CompilationUnit::new(TEXT, vec!["java.util.List".to_string()], vec![class])
    }

    struct MemoryLoader {
        modified: AtomicU64,
        loads: AtomicUsize,
    }

    impl MemoryLoader {
        fn new() -> Arc<Self> {
            Arc::new(MemoryLoader {
                modified: AtomicU64::new(1),
                loads: AtomicUsize::new(0),
            })
        }

        fn loads(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    impl UnitLoader for MemoryLoader {
        fn modified(&self, _path: &Path) -> Result<SystemTime> {
            Ok(SystemTime::UNIX_EPOCH + Duration::from_secs(self.modified.load(Ordering::SeqCst)))
        }

        fn load(&self, _path: &Path) -> Result<CompilationUnit> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(app_unit())
        }
    }

    fn app_bytecode() -> Arc<dyn BytecodeProvider> {
        let mut builder = PoolBuilder::new();
        let [check_hi, check_lo] = builder.method_ref("App", "check", "()Z").to_be_bytes();
        let [run_hi, run_lo] = builder.method_ref("App", "run", "()V").to_be_bytes();
        let code = vec![
            INVOKESTATIC,
            check_hi,
            check_lo,
            IFEQ,
            0,
            6,
            INVOKESTATIC,
            run_hi,
            run_lo,
            RETURN,
        ];
        let lines = [(0, 3), (6, 4), (9, 6)];
        Arc::new(MethodBytecode {
            constant_pool: Some(Arc::new(builder.bytes().to_vec())),
            method: Method {
                name: "go".to_string(),
                descriptor: "()V".to_string(),
                access: MethodAccess {
                    is_static: false,
                    is_native: false,
                    is_abstract: false,
                },
                bytecode: code,
                line_numbers: lines
                    .iter()
                    .map(|&(start_pc, line)| LineNumber { start_pc, line })
                    .collect(),
            },
        })
    }

    fn session() -> (EditorContext, Arc<MemoryLoader>) {
        let loader = MemoryLoader::new();
        let context = EditorContext::new(loader.clone()).expect("editor context");
        (context, loader)
    }

    const APP: &str = "App.json";

    #[test]
    fn condition_operation_links_to_branch_on_next_line() {
        let (context, _) = session();

        let operations = context
            .operations(Path::new(APP), 3, app_bytecode(), CallerContext::Worker)
            .expect("operations")
            .expect("matched");

        assert_eq!(1, operations.len());
        assert_eq!("check", operations[0].method_name);
        assert_eq!(0, operations[0].bytecode_index);
        assert_eq!(Some("()Z".to_string()), operations[0].method_descriptor);
        assert_eq!(vec![6], operations[0].next_operations);
        assert_eq!(3, operations[0].start.line);
    }

    #[test]
    fn branch_line_has_its_own_operation() {
        let (context, _) = session();

        let operations = context
            .operations(Path::new(APP), 4, app_bytecode(), CallerContext::Worker)
            .expect("operations")
            .expect("matched");

        assert_eq!(
            vec!["run"],
            operations
                .iter()
                .map(|op| op.method_name.as_str())
                .collect::<Vec<_>>()
        );
        assert_eq!(6, operations[0].bytecode_index);
        assert!(operations[0].next_operations.is_empty());
    }

    #[test]
    fn declarations_are_located() {
        let (context, _) = session();
        let path = Path::new(APP);
        let run_offset = TEXT.find("run").expect("run");

        assert_eq!(
            Some(7),
            context
                .field_line_number(path, "App", Some("count"), CallerContext::Worker)
                .expect("field line")
        );
        assert_eq!(
            Some(2),
            context
                .field_line_number(path, "App", None, CallerContext::Worker)
                .expect("class body line")
        );
        assert_eq!(
            vec![2],
            context
                .method_line_numbers(
                    path,
                    "App",
                    Vec::new(),
                    "go",
                    Some("()V"),
                    CallerContext::Worker
                )
                .expect("method lines")
        );
        assert!(
            context
                .method_line_numbers(
                    path,
                    "App",
                    Vec::new(),
                    "go",
                    Some("(I)V"),
                    CallerContext::Worker
                )
                .expect("method lines")
                .is_empty()
        );
        assert_eq!(
            Some("App".to_string()),
            context
                .class_declared_at(path, run_offset, CallerContext::Worker)
                .expect("class")
        );
        assert_eq!(
            Some(MethodDeclaration {
                class_name: "App".to_string(),
                name: "go".to_string(),
                signature: "()V".to_string(),
            }),
            context
                .method_declared_at(path, run_offset, CallerContext::Worker)
                .expect("method")
        );
        assert_eq!(
            vec!["java.util.List".to_string()],
            context.imports(path, CallerContext::Worker).expect("imports")
        );
    }

    #[test]
    fn field_lines_are_cached_until_the_file_changes() {
        let (context, loader) = session();
        let path = Path::new(APP);

        for _ in 0..2 {
            context
                .field_line_number(path, "App", Some("count"), CallerContext::Worker)
                .expect("field line");
        }
        assert_eq!(1, loader.loads());
        assert_eq!(Some(7), context.field_lines.get(path, "App", Some("count")));

        context.file_event(&FileEvent::Changed(path.to_path_buf()));
        assert_eq!(None, context.field_lines.get(path, "App", Some("count")));
        context.imports(path, CallerContext::Worker).expect("imports");
        assert_eq!(2, loader.loads());
    }

    #[test]
    fn units_reload_when_the_file_is_newer() {
        let (context, loader) = session();
        let path = Path::new(APP);

        context.imports(path, CallerContext::Worker).expect("imports");
        context.imports(path, CallerContext::Worker).expect("imports");
        loader.modified.store(5, Ordering::SeqCst);
        context.imports(path, CallerContext::Worker).expect("imports");

        assert_eq!(2, loader.loads());
    }

    #[test]
    fn processor_runs_jobs_in_submission_order() {
        let processor = ScanningProcessor::new().expect("processor");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let tasks: Vec<ScanTask<()>> = (0..5)
            .map(|index| {
                let seen = Arc::clone(&seen);
                processor.post(move || {
                    seen.lock().expect("lock").push(index);
                    Ok(())
                })
            })
            .collect();
        for task in tasks {
            task.wait().expect("task");
        }

        assert_eq!(vec![0, 1, 2, 3, 4], *seen.lock().expect("lock"));
    }

    #[test]
    fn cancelled_queued_task_never_runs() {
        let processor = ScanningProcessor::new().expect("processor");
        let (release, gate) = mpsc::channel::<()>();
        let ran = Arc::new(Mutex::new(false));

        let blocker = processor.post(move || {
            gate.recv().ok();
            Ok(1)
        });
        let flag = Arc::clone(&ran);
        let queued = processor.post(move || {
            *flag.lock().expect("lock") = true;
            Ok(2)
        });

        assert!(queued.cancel());
        release.send(()).expect("release");

        assert_eq!(1, blocker.wait().expect("blocker"));
        assert!(queued.wait().is_err());
        // A job posted afterwards runs once the cancelled one was skipped.
        assert_eq!(3, processor.post(|| Ok(3)).wait().expect("after"));
        assert!(!*ran.lock().expect("lock"));
    }

    #[test]
    fn event_callers_get_a_pending_scan() {
        let processor = ScanningProcessor::new().expect("processor");
        let (release, gate) = mpsc::channel::<()>();
        let task = processor.post(move || {
            gate.recv().ok();
            Ok(5)
        });

        let pending = match scan_really_lazy(CallerContext::EventDispatch, task) {
            Err(ContextError::Pending(pending)) => pending,
            other => panic!("expected pending scan, got {other:?}"),
        };
        assert!(!pending.is_done());
        assert!(!pending.wait_timeout(Duration::from_millis(20)));
        release.send(()).expect("release");

        assert_eq!(5, pending.wait().expect("result"));
    }

    #[test]
    fn worker_callers_block_past_the_timeout() {
        let processor = ScanningProcessor::new().expect("processor");
        let task = processor.post(|| {
            thread::sleep(LAZY_SCAN_TIMEOUT + Duration::from_millis(100));
            Ok("done")
        });

        assert_eq!("done", scan_really_lazy(CallerContext::Worker, task).expect("result"));
    }

    #[test]
    fn failures_inside_jobs_are_reported() {
        let processor = ScanningProcessor::new().expect("processor");
        let failed = processor.post(|| -> Result<()> { Err(anyhow!("broken unit")) });
        let panicked = processor.post(|| -> Result<()> { panic!("scanner bug") });

        let error = scan_really_lazy(CallerContext::Worker, failed).expect_err("failure");

        assert_eq!("broken unit", error.to_string());
        assert!(panicked.wait().is_err());
    }

    #[derive(Default)]
    struct RecordingContext {
        path_len: usize,
        imports: Vec<String>,
    }

    impl TreeContext for RecordingContext {
        fn set_trees(&mut self, unit: &CompilationUnit) {
            self.imports = unit.imports.clone();
        }

        fn set_tree_path(&mut self, path: &[&Tree]) {
            self.path_len = path.len();
        }
    }

    struct CountingInterpreter {
        accept: bool,
    }

    impl ExpressionInterpreter<RecordingContext> for CountingInterpreter {
        type Output = String;

        fn can_interpret(&mut self, _statements: &[Tree], context: &mut RecordingContext) -> bool {
            self.accept && context.path_len > 0
        }

        fn interpret(
            &mut self,
            statements: &[Tree],
            context: &mut RecordingContext,
        ) -> Result<String> {
            Ok(format!("{} statements, {}", statements.len(), context.imports.join(",")))
        }
    }

    struct StubCompiler;

    impl HostCompiler for StubCompiler {
        fn compile(&self, file_name: &str, text: &str) -> std::io::Result<CompilerOutput> {
            assert_eq!("App.java", file_name);
            assert!(text.contains("class StepSnippet4"));
            let mut output = CompilerOutput::default();
            output.classes.insert("App$StepSnippet4".to_string(), vec![0xca]);
            if text.contains("broken") {
                output.diagnostics.push(crate::snippet::Diagnostic {
                    severity: Severity::Error,
                    offset: None,
                    message: "StepSnippet4: broken".to_string(),
                });
            }
            Ok(output)
        }
    }

    fn request(
        code: &str,
        accept: bool,
    ) -> EvaluationRequest<RecordingContext, CountingInterpreter> {
        EvaluationRequest {
            snippet: Snippet {
                code: code.to_string(),
                code_offset: 0,
                statements: Vec::new(),
            },
            line: 4,
            static_context: false,
            interpreter: CountingInterpreter { accept },
            context: RecordingContext::default(),
        }
    }

    #[test]
    fn interpretable_snippets_are_not_compiled() {
        let (context, _) = session();

        let result = context
            .interpret_or_compile_code(
                Path::new(APP),
                request("count", true),
                Arc::new(StubCompiler),
                |_| Ok("compiled".to_string()),
                CallerContext::Worker,
            )
            .expect("interpreted");

        assert_eq!("0 statements, java.util.List", result);
    }

    #[test]
    fn other_snippets_are_compiled_and_handed_over() {
        let (context, _) = session();

        let result = context
            .interpret_or_compile_code(
                Path::new(APP),
                request("count++;", false),
                Arc::new(StubCompiler),
                |class| Ok(format!("{} {}", class.binary_name, class.method_signature)),
                CallerContext::Worker,
            )
            .expect("compiled");
        let failure = context
            .interpret_or_compile_code(
                Path::new(APP),
                request("broken;", false),
                Arc::new(StubCompiler),
                |class| Ok(class.binary_name),
                CallerContext::Worker,
            )
            .expect_err("compile error");

        assert_eq!("App$StepSnippet4 ()V", result);
        assert_eq!("StepSnippet4: broken", failure.to_string());
    }
}
