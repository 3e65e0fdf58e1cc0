use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::ast::LineMap;
use crate::snippet::{CompilerOutput, Diagnostic, HostCompiler, Severity};

/// Compiles patched sources with an external `javac`.
#[derive(Clone, Debug)]
pub(crate) struct JavacCompiler {
    javac: PathBuf,
    classpath: Vec<PathBuf>,
}

impl JavacCompiler {
    pub(crate) fn new(javac: PathBuf, classpath: Vec<PathBuf>) -> Self {
        JavacCompiler { javac, classpath }
    }
}

impl HostCompiler for JavacCompiler {
    fn compile(&self, file_name: &str, text: &str) -> io::Result<CompilerOutput> {
        let work = tempfile::tempdir()?;
        let sources = work.path().join("src");
        let classes = work.path().join("classes");
        fs::create_dir_all(&sources)?;
        fs::create_dir_all(&classes)?;
        let source_path = sources.join(file_name);
        fs::write(&source_path, text)?;

        let mut command = Command::new(&self.javac);
        command
            .arg("-d")
            .arg(&classes)
            .args(["-g", "-proc:none", "-encoding", "UTF-8"]);
        if !self.classpath.is_empty() {
            command
                .arg("-cp")
                .arg(std::env::join_paths(&self.classpath).map_err(io::Error::other)?);
        }
        command.arg(&source_path);
        debug!(javac = %self.javac.display(), file_name, "running javac");
        let output = command.output()?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        let mut compiled = BTreeMap::new();
        collect_classes(&classes, &classes, &mut compiled)?;
        Ok(CompilerOutput {
            classes: compiled,
            diagnostics: parse_diagnostics(&stderr, file_name, text),
        })
    }
}

/// Reads every `.class` file under `dir`, keyed by dotted binary name.
fn collect_classes(
    root: &Path,
    dir: &Path,
    classes: &mut BTreeMap<String, Vec<u8>>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_classes(root, &path, classes)?;
            continue;
        }
        if path.extension().and_then(|ext| ext.to_str()) != Some("class") {
            continue;
        }
        let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf) else {
            continue;
        };
        let name: Vec<String> = relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect();
        classes.insert(name.join("."), fs::read(&path)?);
    }
    Ok(())
}

/// Parses `File.java:LINE: error: MESSAGE` lines, locating each at the
/// start of its line in `text`.
fn parse_diagnostics(stderr: &str, file_name: &str, text: &str) -> Vec<Diagnostic> {
    let line_map = LineMap::new(text);
    let mut diagnostics = Vec::new();
    for line in stderr.lines() {
        let Some(position) = line.find(file_name) else {
            continue;
        };
        let rest = &line[position + file_name.len()..];
        let Some(rest) = rest.strip_prefix(':') else {
            continue;
        };
        let Some((number, rest)) = rest.split_once(':') else {
            continue;
        };
        let Ok(number) = number.trim().parse::<u32>() else {
            continue;
        };
        let rest = rest.trim_start();
        let (severity, message) = if let Some(message) = rest.strip_prefix("error:") {
            (Severity::Error, message)
        } else if let Some(message) = rest.strip_prefix("warning:") {
            (Severity::Warning, message)
        } else if let Some(message) = rest.strip_prefix("note:") {
            (Severity::Note, message)
        } else {
            continue;
        };
        diagnostics.push(Diagnostic {
            severity,
            offset: line_map.line_start(number),
            message: message.trim().to_string(),
        });
    }
    diagnostics
}
