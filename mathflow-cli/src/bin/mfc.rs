//! `mfc`: compiles a graph or application manifest into a cartridge.

use std::path::PathBuf;
use std::process;

use structopt::StructOpt;

use mathflow::cartridge::{CartridgeBuilder, SectionType, WindowConfig};
use mathflow::manifest::Manifest;
use mathflow::{compile_file, CompileError, FsLoader};

#[derive(StructOpt)]
#[structopt(name = "mfc", about = "MathFlow graph compiler")]
struct Opt {
    /// Input graph (.json) or application manifest (.mfapp).
    #[structopt(parse(from_os_str))]
    input: PathBuf,

    /// Output cartridge path; defaults to the input with an .mfc
    /// extension.
    #[structopt(parse(from_os_str))]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let opt = Opt::from_args();

    let output = opt
        .output
        .clone()
        .unwrap_or_else(|| opt.input.with_extension("mfc"));

    let result = match opt
        .input
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
    {
        "mfapp" => compile_manifest(&opt.input),
        "json" => compile_graph(&opt.input),
        other => {
            eprintln!("mfc: unsupported input extension '{}'", other);
            process::exit(1);
        }
    };

    let bytes = match result {
        Ok(bytes) => bytes,
        Err(MfcError::Compile(err)) => {
            // The first diagnostic with its source location is the
            // user-facing message.
            match err.first() {
                Some(diag) => eprintln!("mfc: {}", diag),
                None => eprintln!("mfc: {}", err),
            }
            process::exit(1);
        }
        Err(MfcError::Other(message)) => {
            eprintln!("mfc: {}", message);
            process::exit(1);
        }
    };

    if let Err(e) = std::fs::write(&output, &bytes) {
        eprintln!("mfc: cannot write {}: {}", output.display(), e);
        process::exit(1);
    }
    println!("{} ({} bytes)", output.display(), bytes.len());
}

enum MfcError {
    Compile(CompileError),
    Other(String),
}

impl From<CompileError> for MfcError {
    fn from(e: CompileError) -> Self {
        MfcError::Compile(e)
    }
}

fn compile_graph(input: &PathBuf) -> Result<Vec<u8>, MfcError> {
    let loader = FsLoader::new();
    let program = compile_file(&loader, &input.to_string_lossy())?;
    let mut builder = CartridgeBuilder::new();
    builder.add_program("main", &program, &WindowConfig::default());
    Ok(builder.finish())
}

fn compile_manifest(input: &PathBuf) -> Result<Vec<u8>, MfcError> {
    let manifest =
        Manifest::from_path(input).map_err(|e| MfcError::Other(e.to_string()))?;
    let base = input.parent().map(|p| p.to_path_buf()).unwrap_or_default();

    let mut builder = CartridgeBuilder::new();
    let loader = FsLoader { root: Some(base.clone()) };
    let window = manifest.window_config();

    // The runtime entry compiles even when no pipeline kernel names it.
    let mut compiled_entry = false;
    for kernel in &manifest.pipeline.kernels {
        let program = compile_file(&loader, &kernel.entry)?;
        compiled_entry |= kernel.entry == manifest.runtime.entry;
        builder.add_program(&kernel.id, &program, &window);
    }
    if !compiled_entry && !manifest.runtime.entry.is_empty() {
        let program = compile_file(&loader, &manifest.runtime.entry)?;
        builder.add_program("main", &program, &window);
    }

    // The manifest itself travels along for the host.
    let manifest_json = std::fs::read(input)
        .map_err(|e| MfcError::Other(format!("{}: {}", input.display(), e)))?;
    builder.add_section("app", SectionType::Manifest, manifest_json);

    for asset in &manifest.assets {
        let path = base.join(&asset.path);
        match std::fs::read(&path) {
            Ok(bytes) => {
                let ty = match asset.kind.as_str() {
                    "image" => SectionType::Image,
                    "font" => SectionType::Font,
                    _ => SectionType::Raw,
                };
                builder.add_section(&asset.name, ty, bytes);
            }
            Err(e) => {
                log::warn!("asset '{}' skipped: {}: {}", asset.name, path.display(), e)
            }
        }
    }

    Ok(builder.finish())
}
