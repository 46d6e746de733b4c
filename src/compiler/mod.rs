//! The graph compiler: JSON text in, [`Program`] out.
//!
//! Passes run in a fixed order, each against a shared [`Diagnostics`]
//! sink; a pass that records an error stops the pipeline at its end, so a
//! single run reports every problem the failing pass can see.

pub mod analyze;
pub mod codegen;
pub mod domain;
pub mod fuse;
pub mod inline;
pub mod json;
pub mod liveness;
pub mod lower;
pub mod topo;

use std::fs;
use std::io;
use std::path::PathBuf;

use fxhash::FxHashMap;

use crate::diag::{CompileError, DiagKind, Diagnostics};
use crate::ir::GraphIr;
use crate::program::Program;

/// File access used to resolve `Call` subgraphs; the windowing host and
/// the test suite provide their own implementations.
pub trait FileLoader {
    fn read(&self, path: &str) -> io::Result<String>;
}

/// Reads graphs from the filesystem, optionally under a fixed root.
pub struct FsLoader {
    pub root: Option<PathBuf>,
}

impl FsLoader {
    pub fn new() -> Self {
        FsLoader { root: None }
    }
}

impl Default for FsLoader {
    fn default() -> Self {
        FsLoader::new()
    }
}

impl FileLoader for FsLoader {
    fn read(&self, path: &str) -> io::Result<String> {
        match &self.root {
            Some(root) => fs::read_to_string(root.join(path)),
            None => fs::read_to_string(path),
        }
    }
}

/// In-memory loader for tests and for graphs embedded in cartridges.
#[derive(Default)]
pub struct MemLoader {
    files: FxHashMap<String, String>,
}

impl MemLoader {
    pub fn new() -> Self {
        MemLoader::default()
    }

    pub fn insert(&mut self, path: &str, source: &str) -> &mut Self {
        self.files.insert(path.to_string(), source.to_string());
        self
    }
}

impl FileLoader for MemLoader {
    fn read(&self, path: &str) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such graph: {}", path))
        })
    }
}

/// Directory part of a graph path, for resolving relative subgraphs.
pub(crate) fn dir_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Joins a directory and a relative path; absolute paths pass through.
pub(crate) fn join_path(dir: &str, file: &str) -> String {
    if dir.is_empty() || file.starts_with('/') {
        file.to_string()
    } else {
        format!("{}/{}", dir, file)
    }
}

/// Compiles a graph file through the loader.
pub fn compile_file(loader: &dyn FileLoader, path: &str) -> Result<Program, CompileError> {
    let mut diag = Diagnostics::new();
    let source = match loader.read(path) {
        Ok(s) => s,
        Err(e) => {
            diag.error(DiagKind::IoError, None, format!("{}: {}", path, e));
            return Err(diag.into_result().unwrap_err());
        }
    };
    compile_source(loader, &source, path)
}

/// Compiles graph JSON given inline; `name` labels diagnostics and anchors
/// relative subgraph paths.
pub fn compile_source(
    loader: &dyn FileLoader,
    source: &str,
    name: &str,
) -> Result<Program, CompileError> {
    let mut diag = Diagnostics::new();
    let program = run_pipeline(loader, source, name, &mut diag);
    if diag.has_errors() {
        return Err(diag.into_result().unwrap_err());
    }
    match program {
        Some(p) => Ok(p),
        None => {
            diag.error(DiagKind::ParseError, None, "compilation produced no program");
            Err(diag.into_result().unwrap_err())
        }
    }
}

/// Front end only: parse and lower one file. The inline pass re-enters
/// this for every subgraph it expands.
pub(crate) fn load_ir(source: &str, name: &str, diag: &mut Diagnostics) -> Option<GraphIr> {
    let ast = json::parse(source, name, diag)?;
    if diag.has_errors() {
        return None;
    }
    let ir = lower::run(&ast, name, diag);
    if diag.has_errors() {
        return None;
    }
    Some(ir)
}

fn run_pipeline(
    loader: &dyn FileLoader,
    source: &str,
    name: &str,
    diag: &mut Diagnostics,
) -> Option<Program> {
    let ir = load_ir(source, name, diag)?;

    let mut ir = inline::run(ir, loader, dir_of(name), diag);
    if diag.has_errors() {
        return None;
    }

    let order = topo::sort(&ir, diag)?;
    if diag.has_errors() {
        return None;
    }

    analyze::run(&mut ir, &order, diag);
    if diag.has_errors() {
        return None;
    }

    domain::run(&mut ir);

    fuse::run(&mut ir, diag);
    if diag.has_errors() {
        return None;
    }

    let register_count = liveness::run(&mut ir, &order, diag);
    if diag.has_errors() {
        return None;
    }

    let program = codegen::run(&ir, &order, register_count, diag);
    if diag.has_errors() {
        return None;
    }
    Some(program)
}
