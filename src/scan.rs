use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use jclassfile::attributes::Attribute;
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool as PoolEntry;
use jclassfile::methods::{MethodFlags, MethodInfo};
use zip::ZipArchive;

use crate::constant_pool::ConstantPool;
use crate::ir::{CallSite, Class, LineNumber, Method, MethodAccess};
use crate::opcodes;

const POOL_COUNT_OFFSET: usize = 8;
const POOL_START: usize = 10;

/// Load a class from a `.class` file, or the `class_name` entry of a JAR.
pub(crate) fn load_class(input: &Path, class_name: Option<&str>) -> Result<Class> {
    let extension = input.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    let (data, description) = match extension {
        "class" => {
            let data =
                fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
            (data, input.display().to_string())
        }
        "jar" => {
            let class_name = class_name.context("a class name is required for JAR input")?;
            let entry_name = format!("{}.class", class_name.replace('.', "/"));
            let data = read_jar_entry(input, &entry_name)?;
            (data, jar_entry_uri(input, &entry_name))
        }
        _ => anyhow::bail!("unsupported input file: {}", input.display()),
    };

    parse_class(&data, &description)
}

fn read_jar_entry(path: &Path, entry_name: &str) -> Result<Vec<u8>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    let mut entry = archive
        .by_name(entry_name)
        .with_context(|| format!("failed to read {}:{}", path.display(), entry_name))?;
    let mut data = Vec::new();
    entry
        .read_to_end(&mut data)
        .with_context(|| format!("failed to read {}:{}", path.display(), entry_name))?;
    Ok(data)
}

fn jar_entry_uri(jar_path: &Path, entry_name: &str) -> String {
    format!("jar:{}!/{}", jar_path.to_string_lossy(), entry_name)
}

/// Read the parts of a class file needed for line matching: the constant
/// pool bytes and each method's code with its line number table.
pub(crate) fn parse_class(data: &[u8], description: &str) -> Result<Class> {
    let class_file =
        class_file::parse(data).with_context(|| format!("failed to parse {description}"))?;
    let constant_pool = class_file.constant_pool();
    let name = resolve_class_name(constant_pool, class_file.this_class())
        .with_context(|| format!("invalid this_class in {description}"))?;
    let source_file = class_file
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::SourceFile { sourcefile_index } => Some(*sourcefile_index),
            _ => None,
        })
        .map(|index| resolve_utf8(constant_pool, index))
        .transpose()
        .context("resolve source file")?;
    let methods = class_file
        .methods()
        .iter()
        .map(|method| parse_method(constant_pool, method))
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("failed to read methods of {description}"))?;

    Ok(Class {
        name,
        source_file,
        constant_pool: Arc::new(constant_pool_bytes(data, description)?),
        methods,
    })
}

/// The pool is kept as raw bytes for `ConstantPool::parse`, so it is sliced
/// out of the class file verbatim.
fn constant_pool_bytes(data: &[u8], description: &str) -> Result<Vec<u8>> {
    let count = data
        .get(POOL_COUNT_OFFSET..POOL_START)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
        .with_context(|| format!("truncated header in {description}"))?;
    let pool = &data[POOL_START..];
    let (_, len) = ConstantPool::read_counted(pool, count, description)
        .with_context(|| format!("invalid constant pool in {description}"))?;
    Ok(pool[..len].to_vec())
}

fn parse_method(constant_pool: &[PoolEntry], method: &MethodInfo) -> Result<Method> {
    let name = resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
    let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
        .context("resolve method descriptor")?;
    let access_flags = method.access_flags();
    let code = method
        .attributes()
        .iter()
        .find_map(|attribute| match attribute {
            Attribute::Code {
                code, attributes, ..
            } => Some((code, attributes)),
            _ => None,
        });
    let (bytecode, line_numbers) = match code {
        Some((code, attributes)) => (code.clone(), parse_line_numbers(attributes)),
        None => (Vec::new(), Vec::new()),
    };

    Ok(Method {
        name,
        descriptor,
        access: MethodAccess {
            is_static: access_flags.contains(MethodFlags::ACC_STATIC),
            is_native: access_flags.contains(MethodFlags::ACC_NATIVE),
            is_abstract: access_flags.contains(MethodFlags::ACC_ABSTRACT),
        },
        bytecode,
        line_numbers,
    })
}

fn parse_line_numbers(attributes: &[Attribute]) -> Vec<LineNumber> {
    attributes
        .iter()
        .filter_map(|attribute| match attribute {
            Attribute::LineNumberTable { line_number_table } => Some(line_number_table),
            _ => None,
        })
        .flatten()
        .map(|record| LineNumber {
            start_pc: record.start_pc() as usize,
            line: u32::from(record.line_number()),
        })
        .collect()
}

fn resolve_class_name(constant_pool: &[PoolEntry], index: u16) -> Result<String> {
    match constant_pool.get(index as usize) {
        Some(PoolEntry::Class { name_index }) => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("constant pool entry {index} is not a class"),
    }
}

fn resolve_utf8(constant_pool: &[PoolEntry], index: u16) -> Result<String> {
    match constant_pool.get(index as usize) {
        Some(PoolEntry::Utf8 { value }) => Ok(value.clone()),
        _ => anyhow::bail!("constant pool entry {index} is not utf8"),
    }
}

/// Every `invoke*` instruction of a method, resolved through the pool.
pub(crate) fn call_sites(method: &Method, pool: &ConstantPool) -> Result<Vec<CallSite>> {
    let code = &method.bytecode;
    let mut calls = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let opcode = code[offset];
        if let Some(kind) = opcodes::call_kind(opcode) {
            let index = opcodes::call_operand(code, offset)
                .with_context(|| format!("truncated call at {offset} in {}", method.name))?
                as usize;
            calls.push(CallSite {
                owner: pool.class_name(index)?.to_string(),
                name: pool.method_name(index)?.to_string(),
                descriptor: pool.method_descriptor(index)?.to_string(),
                kind,
                offset,
                line: method.line_at(offset),
            });
        }
        offset += opcodes::instruction_size(opcode, code, offset);
    }
    Ok(calls)
}
