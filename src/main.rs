mod ast;
mod ast2bytecode;
mod constant_pool;
mod context;
mod error;
mod expression_scanner;
mod ir;
mod javac;
mod method_arguments;
mod opcodes;
mod operation;
mod scan;
mod snippet;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::ast::{CompilationUnit, Tree};
use crate::constant_pool::ConstantPool;
use crate::context::{
    CallerContext, EditorContext, EvaluationRequest, ExpressionInterpreter, JsonUnitLoader,
    MethodDeclaration, TreeContext,
};
use crate::error::{ContextError, ReloadFailure};
use crate::ir::{CallSite, Class, Method, MethodBytecode};
use crate::javac::JavacCompiler;
use crate::operation::{MethodArgument, Operation};
use crate::scan::{call_sites, load_class};
use crate::snippet::{CompiledClass, Snippet};

/// CLI arguments for stepmap execution.
#[derive(Parser, Debug)]
#[command(
    name = "stepmap",
    about = "Maps Java source call expressions to JVM bytecode offsets for debugger call stepping.",
    version
)]
struct Cli {
    #[arg(long, value_name = "PATH", global = true)]
    output: Option<PathBuf>,
    #[arg(long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    timing: bool,
    /// Run requests without blocking past the lazy scan timeout, then
    /// wait at most this long for deferred scans.
    #[arg(long, value_name = "MS", global = true)]
    deadline_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Operations of the calls on a source line.
    Operations(OperationsArgs),
    /// Call sites of every method in a class.
    Calls(ClassArgs),
    /// Formal parameters of the method declared on a line.
    Arguments(ArgumentsArgs),
    /// Declaration lines and enclosing declarations in a unit.
    Locate(LocateArgs),
    /// Compiles a snippet into a class nested at a source line.
    Compile(CompileArgs),
    /// User message for an exception thrown while redefining a class.
    ReloadMessage(ReloadArgs),
}

#[derive(Args, Debug)]
struct ClassArgs {
    /// `.class` file, or JAR together with `--class-name`.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    #[arg(long, value_name = "NAME")]
    class_name: Option<String>,
}

#[derive(Args, Debug)]
struct OperationsArgs {
    #[command(flatten)]
    class: ClassArgs,
    /// Attributed tree of the source file, as JSON.
    #[arg(long, value_name = "PATH")]
    ast: PathBuf,
    #[arg(long)]
    line: u32,
    /// Method to match against; defaults to the one covering the line.
    #[arg(long, value_name = "NAME")]
    method: Option<String>,
    /// Match without constant pool, by call order only.
    #[arg(long)]
    no_constant_pool: bool,
    /// Attach the arguments of each call.
    #[arg(long)]
    with_arguments: bool,
}

#[derive(Args, Debug)]
struct ArgumentsArgs {
    #[arg(long, value_name = "PATH")]
    ast: PathBuf,
    #[arg(long)]
    line: u32,
}

#[derive(Args, Debug)]
struct LocateArgs {
    #[arg(long, value_name = "PATH")]
    ast: PathBuf,
    /// Binary name of the class to search.
    #[arg(long = "class", value_name = "NAME")]
    class_name: Option<String>,
    #[arg(long, value_name = "NAME")]
    field: Option<String>,
    #[arg(long, value_name = "NAME")]
    method: Option<String>,
    /// JNI signature; only the parameter part is compared.
    #[arg(long, value_name = "SIGNATURE")]
    signature: Option<String>,
    /// Classes with the same binary name to skip.
    #[arg(long, value_name = "NAME")]
    exclude: Vec<String>,
    /// Byte offset to report the enclosing declarations of.
    #[arg(long)]
    offset: Option<usize>,
}

#[derive(Args, Debug)]
struct CompileArgs {
    #[arg(long, value_name = "PATH")]
    ast: PathBuf,
    /// Snippet text and attributed statements, as JSON.
    #[arg(long, value_name = "PATH")]
    snippet: PathBuf,
    #[arg(long)]
    line: u32,
    #[arg(long = "static")]
    static_context: bool,
    #[arg(long, value_name = "PATH")]
    classpath: Vec<PathBuf>,
    #[arg(long, value_name = "PATH", default_value = "javac")]
    javac: PathBuf,
    /// Directory the compiled class files are written to.
    #[arg(long, value_name = "DIR")]
    class_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ReloadArgs {
    /// Fully qualified exception class name.
    #[arg(long, value_name = "NAME")]
    exception: String,
    #[arg(long = "class", value_name = "NAME")]
    class_name: String,
    #[arg(long, default_value = "")]
    message: String,
}

#[derive(Debug, Serialize)]
struct LocatedOperation {
    #[serde(flatten)]
    operation: Operation,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<MethodArgument>>,
}

#[derive(Debug, Default, Serialize)]
struct Location {
    #[serde(skip_serializing_if = "Option::is_none")]
    field_line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method_lines: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<MethodDeclaration>,
    imports: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CompiledSummary {
    binary_name: String,
    method_name: String,
    method_signature: String,
    parameters: Vec<String>,
    is_static: bool,
    inner_classes: Vec<String>,
    size: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "stepmap=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let started_at = Instant::now();
    let mut writer = output_writer(cli.output.as_deref())?;
    let deadline = cli.deadline_ms.map(Duration::from_millis);
    match cli.command {
        Command::Operations(args) => {
            write_json(&mut writer, &operations(&Session::new(deadline)?, &args)?)?
        }
        Command::Calls(args) => write_json(&mut writer, &calls(&args)?)?,
        Command::Arguments(args) => {
            write_json(&mut writer, &arguments(&Session::new(deadline)?, &args)?)?
        }
        Command::Locate(args) => {
            write_json(&mut writer, &locate(&Session::new(deadline)?, &args)?)?
        }
        Command::Compile(args) => {
            write_json(&mut writer, &compile(&Session::new(deadline)?, &args)?)?
        }
        Command::ReloadMessage(args) => write_json(&mut writer, &reload_message(&args))?,
    }
    if cli.timing {
        eprintln!("timing: total_ms={}", started_at.elapsed().as_millis());
    }
    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}

fn write_json<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value).context("failed to serialize output")?;
    writer.write_all(b"\n").context("failed to write output")
}

fn require_file(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("input not found: {}", path.display());
    }
    Ok(())
}

/// Editor context plus the way its requests are waited for.
struct Session {
    context: EditorContext,
    deadline: Option<Duration>,
}

impl Session {
    fn new(deadline: Option<Duration>) -> Result<Self> {
        Ok(Session {
            context: EditorContext::new(Arc::new(JsonUnitLoader))?,
            deadline,
        })
    }

    fn caller(&self) -> CallerContext {
        match self.deadline {
            Some(_) => CallerContext::EventDispatch,
            None => CallerContext::Worker,
        }
    }

    fn finish<T: fmt::Debug>(&self, result: Result<T, ContextError<T>>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(ContextError::Failed(error)) => Err(error),
            Err(ContextError::Pending(pending)) => {
                let deadline = self.deadline.unwrap_or_default();
                debug!(deadline_ms = deadline.as_millis(), "scan deferred");
                if !pending.wait_timeout(deadline) {
                    pending.cancel();
                    anyhow::bail!("scan did not finish within {} ms", deadline.as_millis());
                }
                pending.wait()
            }
        }
    }
}

/// The method with bytecode covering `line`, optionally restricted by name.
fn select_method<'a>(class: &'a Class, line: u32, name: Option<&str>) -> Option<&'a Method> {
    class.methods.iter().find(|method| {
        !method.bytecode.is_empty()
            && !method.access.is_abstract
            && name.is_none_or(|name| method.name == name)
            && method
                .line_range()
                .is_some_and(|(first, last)| first <= line && line <= last)
    })
}

fn operations(session: &Session, args: &OperationsArgs) -> Result<Option<Vec<LocatedOperation>>> {
    require_file(&args.class.input)?;
    require_file(&args.ast)?;
    let class = load_class(&args.class.input, args.class.class_name.as_deref())?;
    let method = select_method(&class, args.line, args.method.as_deref())
        .with_context(|| format!("no method of {} covers line {}", class.name, args.line))?;
    debug!(
        class = %class.name,
        source = ?class.source_file,
        method = %method.name,
        "matching line"
    );
    let bytecode = MethodBytecode {
        constant_pool: (!args.no_constant_pool).then(|| Arc::clone(&class.constant_pool)),
        method: method.clone(),
    };

    let context = &session.context;
    let requested = context.operations(&args.ast, args.line, Arc::new(bytecode), session.caller());
    let Some(operations) = session.finish(requested)? else {
        return Ok(None);
    };
    let mut located = Vec::with_capacity(operations.len());
    for operation in operations {
        let arguments = if args.with_arguments {
            let requested = context.arguments_at_operation(&args.ast, &operation, session.caller());
            Some(session.finish(requested)?)
        } else {
            None
        };
        located.push(LocatedOperation {
            operation,
            arguments,
        });
    }
    Ok(Some(located))
}

fn calls(args: &ClassArgs) -> Result<BTreeMap<String, Vec<CallSite>>> {
    require_file(&args.input)?;
    let class = load_class(&args.input, args.class_name.as_deref())?;
    let pool = ConstantPool::parse(&class.constant_pool, class.name.clone());
    let mut sites = BTreeMap::new();
    for method in &class.methods {
        if method.bytecode.is_empty() {
            continue;
        }
        sites.insert(
            format!("{}{}", method.name, method.descriptor),
            call_sites(method, &pool)?,
        );
    }
    Ok(sites)
}

/// `null` when the failure needs no message.
fn reload_message(args: &ReloadArgs) -> serde_json::Value {
    let failure = ReloadFailure::from_exception(&args.exception, &args.class_name, &args.message);
    serde_json::json!({ "message": failure.user_message() })
}

fn arguments(session: &Session, args: &ArgumentsArgs) -> Result<Vec<MethodArgument>> {
    require_file(&args.ast)?;
    session.finish(
        session
            .context
            .arguments_at_line(&args.ast, args.line, session.caller()),
    )
}

fn locate(session: &Session, args: &LocateArgs) -> Result<Location> {
    require_file(&args.ast)?;
    let context = &session.context;
    let caller = session.caller();
    let path = args.ast.as_path();
    let mut location = Location {
        imports: session.finish(context.imports(path, caller))?,
        ..Location::default()
    };
    if let Some(class_name) = &args.class_name {
        if args.method.is_none() || args.field.is_some() {
            location.field_line = session.finish(context.field_line_number(
                path,
                class_name,
                args.field.as_deref(),
                caller,
            ))?;
        }
        if let Some(method) = &args.method {
            location.method_lines = Some(session.finish(context.method_line_numbers(
                path,
                class_name,
                args.exclude.clone(),
                method,
                args.signature.as_deref(),
                caller,
            ))?);
        }
    }
    if let Some(offset) = args.offset {
        location.class = session.finish(context.class_declared_at(path, offset, caller))?;
        location.method = session.finish(context.method_declared_at(path, offset, caller))?;
    }
    Ok(location)
}

/// Records the evaluation context for diagnostics.
#[derive(Debug, Default)]
struct LoggedContext;

impl TreeContext for LoggedContext {
    fn set_trees(&mut self, unit: &CompilationUnit) {
        debug!(package = ?unit.package, types = unit.types.len(), "evaluation unit");
    }

    fn set_tree_path(&mut self, path: &[&Tree]) {
        debug!(depth = path.len(), "evaluation path");
    }
}

/// Sends every snippet to the compiler.
struct CompileOnly;

impl ExpressionInterpreter<LoggedContext> for CompileOnly {
    type Output = CompiledSummary;

    fn can_interpret(&mut self, _statements: &[Tree], _context: &mut LoggedContext) -> bool {
        false
    }

    fn interpret(
        &mut self,
        _statements: &[Tree],
        _context: &mut LoggedContext,
    ) -> Result<CompiledSummary> {
        anyhow::bail!("snippets are only compiled")
    }
}

fn compile(session: &Session, args: &CompileArgs) -> Result<CompiledSummary> {
    require_file(&args.ast)?;
    require_file(&args.snippet)?;
    let json = fs::read_to_string(&args.snippet)
        .with_context(|| format!("failed to read {}", args.snippet.display()))?;
    let snippet = Snippet::from_json(&json)?;
    let request = EvaluationRequest {
        snippet,
        line: args.line,
        static_context: args.static_context,
        interpreter: CompileOnly,
        context: LoggedContext,
    };
    let compiler = JavacCompiler::new(args.javac.clone(), args.classpath.clone());
    let class_dir = args.class_dir.clone();
    session.finish(session.context.interpret_or_compile_code(
        &args.ast,
        request,
        Arc::new(compiler),
        move |class| {
            if let Some(dir) = &class_dir {
                write_classes(dir, &class)?;
            }
            Ok(summarize(class))
        },
        session.caller(),
    ))
}

fn write_classes(dir: &Path, class: &CompiledClass) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    let classes =
        std::iter::once((&class.binary_name, &class.bytecode)).chain(&class.inner_classes);
    for (binary_name, bytecode) in classes {
        let path = dir.join(format!("{binary_name}.class"));
        fs::write(&path, bytecode).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}

fn summarize(class: CompiledClass) -> CompiledSummary {
    CompiledSummary {
        size: class.bytecode.len(),
        inner_classes: class.inner_classes.into_keys().collect(),
        binary_name: class.binary_name,
        method_name: class.method_name,
        method_signature: class.method_signature,
        parameters: class.parameters,
        is_static: class.is_static,
    }
}
