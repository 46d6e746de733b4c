//! Shared plumbing for the MathFlow command-line tools.

use std::path::Path;
use std::sync::Arc;

use failure::{bail, Error};

use mathflow::cartridge::{Cartridge, SectionType};
use mathflow::vm::Vm;
use mathflow::{compile_file, FsLoader, Program};

/// Loads a program from a graph source (`.json`) or a compiled cartridge
/// (`.mfc`). A cartridge yields its first program section.
pub fn load_program(path: &Path) -> Result<Arc<Program>, Error> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "json" => {
            let loader = FsLoader::new();
            let program = compile_file(&loader, &path.to_string_lossy())?;
            Ok(Arc::new(program))
        }
        "mfc" | "bin" => {
            let bytes = std::fs::read(path)?;
            // Try a sectioned cartridge first, then a bare program image.
            match Cartridge::parse(bytes.clone()) {
                Ok(cart) => {
                    let names = cart.section_names(SectionType::Program);
                    match names.first() {
                        Some(name) => {
                            let (program, _) = cart.load_program(name)?;
                            Ok(Arc::new(program))
                        }
                        None => {
                            let (program, _) = mathflow::cartridge::load_program(&bytes)?;
                            Ok(Arc::new(program))
                        }
                    }
                }
                Err(_) => {
                    let (program, _) = mathflow::cartridge::load_program(&bytes)?;
                    Ok(Arc::new(program))
                }
            }
        }
        other => bail!("unsupported input extension '{}'", other),
    }
}

/// Dumps every register the way the headless runner reports results:
/// index, symbol name if any, shape, and up to 16 leading values.
pub fn dump_registers(vm: &Vm) {
    let program = vm.program().clone();
    for idx in 0..vm.register_count() as u32 {
        let tensor = match vm.tensor(idx) {
            Some(t) => t,
            None => continue,
        };
        let name = program
            .symbols
            .iter()
            .find(|s| s.register == idx)
            .map(|s| s.name.as_str());

        let mut line = format!("  [{}]", idx);
        if let Some(name) = name {
            line.push_str(&format!(" '{}'", name));
        }
        line.push_str(&format!(" shape {}", tensor.info));

        if !tensor.has_data() {
            println!("{} (empty)", line);
            continue;
        }
        let limit = tensor.len().min(16);
        let rendered: Vec<String> = match tensor.data() {
            mathflow::tensor::TensorData::F32(v) => {
                v[..limit].iter().map(|x| format!("{:.2}", x)).collect()
            }
            mathflow::tensor::TensorData::I32(v) => {
                v[..limit].iter().map(|x| x.to_string()).collect()
            }
            mathflow::tensor::TensorData::U8(v) => v[..limit]
                .iter()
                .map(|x| if *x != 0 { "true" } else { "false" }.to_string())
                .collect(),
            mathflow::tensor::TensorData::Empty => Vec::new(),
        };
        let suffix = if tensor.len() > limit {
            format!(" ... (+{})", tensor.len() - limit)
        } else {
            String::new()
        };
        println!("{} {{{}}}{}", line, rendered.join(", "), suffix);
    }
}
