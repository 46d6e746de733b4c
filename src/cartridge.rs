//! The binary container format: program images and sectioned cartridges.
//!
//! Everything is little-endian with fixed-size records, so a saved image
//! reloads byte-for-byte. A program image is a header followed by the
//! instruction, symbol, task, binding and tensor-descriptor tables, then
//! the constant data blob in tensor order. A cartridge wraps a section
//! table whose payloads are whole program images or raw assets.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use failure::Fail;

use crate::ops::Opcode;
use crate::program::{Instruction, Program, Symbol, Task, TaskBinding, MAX_SYMBOL_NAME};
use crate::tensor::{Dtype, Tensor, TypeInfo, MAX_DIMS};

pub const MAGIC: u32 = 0x4D46_4C57; // "MFLW"
pub const VERSION: u32 = 8;

pub const WINDOW_RESIZABLE: u32 = 1 << 0;
pub const WINDOW_VSYNC: u32 = 1 << 1;
pub const WINDOW_FULLSCREEN: u32 = 1 << 2;

/// Window configuration carried in the program header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub flags: u32,
}

#[derive(Debug, Fail)]
pub enum CartridgeError {
    #[fail(display = "bad magic {:#010x}", _0)]
    BadMagic(u32),
    #[fail(display = "unsupported version {}", _0)]
    BadVersion(u32),
    #[fail(display = "truncated image")]
    Truncated,
    #[fail(display = "invalid opcode {}", _0)]
    InvalidOpcode(u16),
}

impl From<std::io::Error> for CartridgeError {
    fn from(_: std::io::Error) -> Self {
        CartridgeError::Truncated
    }
}

// ---------------------------------------------------------------------------
// Program images.

/// Serialises a program image.
pub fn save_program(program: &Program, window: &WindowConfig) -> Vec<u8> {
    let mut out = Vec::new();

    out.write_u32::<LittleEndian>(MAGIC).unwrap();
    out.write_u32::<LittleEndian>(VERSION).unwrap();
    out.write_u32::<LittleEndian>(program.instructions.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(program.prototypes.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(program.symbols.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(program.tasks.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(program.bindings.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(window.width).unwrap();
    out.write_u32::<LittleEndian>(window.height).unwrap();
    out.write_u32::<LittleEndian>(window.flags).unwrap();
    for _ in 0..6 {
        out.write_u32::<LittleEndian>(0).unwrap();
    }

    for inst in &program.instructions {
        out.write_u16::<LittleEndian>(inst.opcode.to_u16()).unwrap();
        out.write_u16::<LittleEndian>(inst.dest).unwrap();
        out.write_u16::<LittleEndian>(inst.src1).unwrap();
        out.write_u16::<LittleEndian>(inst.src2).unwrap();
        out.write_u16::<LittleEndian>(inst.src3).unwrap();
        out.write_u16::<LittleEndian>(inst.padding).unwrap();
        for &s in &inst.strides {
            out.write_i32::<LittleEndian>(s).unwrap();
        }
    }

    for sym in &program.symbols {
        write_name(&mut out, &sym.name);
        out.write_u32::<LittleEndian>(sym.register).unwrap();
        out.push(sym.flags);
        out.extend_from_slice(&[0u8; 3]);
        out.write_u32::<LittleEndian>(sym.related_name_hash).unwrap();
    }

    for task in &program.tasks {
        out.write_u32::<LittleEndian>(task.first).unwrap();
        out.write_u32::<LittleEndian>(task.count).unwrap();
        out.write_u32::<LittleEndian>(task.domain.ndim as u32).unwrap();
        for k in 0..MAX_DIMS {
            out.write_i32::<LittleEndian>(task.domain.shape[k]).unwrap();
        }
    }

    for binding in &program.bindings {
        out.write_u32::<LittleEndian>(binding.task).unwrap();
        out.write_u32::<LittleEndian>(binding.register).unwrap();
        out.push(binding.flags);
        out.extend_from_slice(&[0u8; 3]);
    }

    for proto in &program.prototypes {
        out.push(proto.info.dtype.to_u8());
        out.push(proto.info.ndim as u8);
        out.push(proto.has_data() as u8);
        out.push(0);
        for k in 0..MAX_DIMS {
            out.write_i32::<LittleEndian>(proto.info.shape[k]).unwrap();
        }
        let size = if proto.has_data() {
            proto.byte_len() as u64
        } else {
            0
        };
        out.write_u64::<LittleEndian>(size).unwrap();
    }

    for proto in &program.prototypes {
        if proto.has_data() {
            out.extend_from_slice(&proto.to_le_bytes());
        }
    }

    out
}

/// Parses a program image, rejecting mismatched magic or version.
pub fn load_program(bytes: &[u8]) -> Result<(Program, WindowConfig), CartridgeError> {
    let mut r = Cursor::new(bytes);

    let magic = r.read_u32::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(CartridgeError::BadMagic(magic));
    }
    let version = r.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(CartridgeError::BadVersion(version));
    }
    let instr_count = r.read_u32::<LittleEndian>()? as usize;
    let tensor_count = r.read_u32::<LittleEndian>()? as usize;
    let symbol_count = r.read_u32::<LittleEndian>()? as usize;
    let task_count = r.read_u32::<LittleEndian>()? as usize;
    let binding_count = r.read_u32::<LittleEndian>()? as usize;
    let window = WindowConfig {
        width: r.read_u32::<LittleEndian>()?,
        height: r.read_u32::<LittleEndian>()?,
        flags: r.read_u32::<LittleEndian>()?,
    };
    for _ in 0..6 {
        r.read_u32::<LittleEndian>()?;
    }

    let mut program = Program::default();

    for _ in 0..instr_count {
        let raw_opcode = r.read_u16::<LittleEndian>()?;
        let opcode =
            Opcode::from_u16(raw_opcode).ok_or(CartridgeError::InvalidOpcode(raw_opcode))?;
        let mut inst = Instruction::new(
            opcode,
            r.read_u16::<LittleEndian>()?,
            r.read_u16::<LittleEndian>()?,
            r.read_u16::<LittleEndian>()?,
            r.read_u16::<LittleEndian>()?,
        );
        inst.padding = r.read_u16::<LittleEndian>()?;
        for s in inst.strides.iter_mut() {
            *s = r.read_i32::<LittleEndian>()?;
        }
        program.instructions.push(inst);
    }

    for _ in 0..symbol_count {
        let name = read_name(&mut r)?;
        let register = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u8()?;
        let mut pad = [0u8; 3];
        std::io::Read::read_exact(&mut r, &mut pad)?;
        let related_name_hash = r.read_u32::<LittleEndian>()?;
        program.symbols.push(Symbol {
            name,
            register,
            flags,
            related_name_hash,
        });
    }

    for _ in 0..task_count {
        let first = r.read_u32::<LittleEndian>()?;
        let count = r.read_u32::<LittleEndian>()?;
        let ndim = r.read_u32::<LittleEndian>()? as usize;
        let mut domain = TypeInfo::scalar(Dtype::Unknown);
        domain.ndim = ndim.min(MAX_DIMS);
        for k in 0..MAX_DIMS {
            domain.shape[k] = r.read_i32::<LittleEndian>()?;
        }
        domain.calc_strides();
        program.tasks.push(Task {
            first,
            count,
            domain,
        });
    }

    for _ in 0..binding_count {
        let task = r.read_u32::<LittleEndian>()?;
        let register = r.read_u32::<LittleEndian>()?;
        let flags = r.read_u8()?;
        let mut pad = [0u8; 3];
        std::io::Read::read_exact(&mut r, &mut pad)?;
        program.bindings.push(TaskBinding {
            task,
            register,
            flags,
        });
    }

    let mut descriptors = Vec::with_capacity(tensor_count);
    for _ in 0..tensor_count {
        let dtype = Dtype::from_u8(r.read_u8()?);
        let ndim = r.read_u8()? as usize;
        let is_constant = r.read_u8()? != 0;
        let _flags = r.read_u8()?;
        let mut info = TypeInfo::scalar(dtype);
        info.ndim = ndim.min(MAX_DIMS);
        for k in 0..MAX_DIMS {
            info.shape[k] = r.read_i32::<LittleEndian>()?;
        }
        info.calc_strides();
        let data_size = r.read_u64::<LittleEndian>()? as usize;
        descriptors.push((info, is_constant, data_size));
    }

    let mut offset = r.position() as usize;
    for (info, is_constant, data_size) in descriptors {
        if is_constant {
            let end = offset + data_size;
            if end > bytes.len() {
                return Err(CartridgeError::Truncated);
            }
            program
                .prototypes
                .push(Tensor::from_le_bytes(info, &bytes[offset..end]));
            offset = end;
        } else {
            program.prototypes.push(Tensor::empty(info));
        }
    }

    program.register_count = tensor_count as u32;
    Ok((program, window))
}

// ---------------------------------------------------------------------------
// Sectioned cartridges.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum SectionType {
    Program = 1,
    Image = 2,
    Font = 3,
    Manifest = 4,
    Raw = 5,
}

impl SectionType {
    pub fn from_u32(raw: u32) -> Option<SectionType> {
        match raw {
            1 => Some(SectionType::Program),
            2 => Some(SectionType::Image),
            3 => Some(SectionType::Font),
            4 => Some(SectionType::Manifest),
            5 => Some(SectionType::Raw),
            _ => None,
        }
    }
}

struct SectionEntry {
    name: String,
    ty: SectionType,
    offset: usize,
    size: usize,
}

/// Assembles a cartridge: named program images plus raw assets.
#[derive(Default)]
pub struct CartridgeBuilder {
    sections: Vec<(String, SectionType, Vec<u8>)>,
}

impl CartridgeBuilder {
    pub fn new() -> Self {
        CartridgeBuilder::default()
    }

    pub fn add_program(&mut self, name: &str, program: &Program, window: &WindowConfig) {
        self.add_section(name, SectionType::Program, save_program(program, window));
    }

    pub fn add_section(&mut self, name: &str, ty: SectionType, payload: Vec<u8>) {
        self.sections.push((name.to_string(), ty, payload));
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(MAGIC).unwrap();
        out.write_u32::<LittleEndian>(VERSION).unwrap();
        out.write_u32::<LittleEndian>(self.sections.len() as u32).unwrap();
        out.write_u32::<LittleEndian>(0).unwrap();

        let table_start = out.len();
        let entry_size = MAX_SYMBOL_NAME + 4 + 8 + 8;
        let mut payload_offset = table_start + entry_size * self.sections.len();
        for (name, ty, payload) in &self.sections {
            write_name(&mut out, name);
            out.write_u32::<LittleEndian>(*ty as u32).unwrap();
            out.write_u64::<LittleEndian>(payload_offset as u64).unwrap();
            out.write_u64::<LittleEndian>(payload.len() as u64).unwrap();
            payload_offset += payload.len();
        }
        for (_, _, payload) in &self.sections {
            out.extend_from_slice(payload);
        }
        out
    }
}

/// A parsed cartridge, borrowing nothing: payload lookups slice into the
/// owned byte buffer.
pub struct Cartridge {
    bytes: Vec<u8>,
    sections: Vec<SectionEntry>,
}

impl Cartridge {
    pub fn parse(bytes: Vec<u8>) -> Result<Cartridge, CartridgeError> {
        let mut r = Cursor::new(&bytes[..]);
        let magic = r.read_u32::<LittleEndian>()?;
        if magic != MAGIC {
            return Err(CartridgeError::BadMagic(magic));
        }
        let version = r.read_u32::<LittleEndian>()?;
        if version != VERSION {
            return Err(CartridgeError::BadVersion(version));
        }
        let count = r.read_u32::<LittleEndian>()? as usize;
        r.read_u32::<LittleEndian>()?;

        let mut sections = Vec::with_capacity(count);
        for _ in 0..count {
            let name = read_name(&mut r)?;
            let ty = SectionType::from_u32(r.read_u32::<LittleEndian>()?)
                .unwrap_or(SectionType::Raw);
            let offset = r.read_u64::<LittleEndian>()? as usize;
            let size = r.read_u64::<LittleEndian>()? as usize;
            if offset + size > bytes.len() {
                return Err(CartridgeError::Truncated);
            }
            sections.push(SectionEntry {
                name,
                ty,
                offset,
                size,
            });
        }
        Ok(Cartridge { bytes, sections })
    }

    /// Linear scan by name and type.
    pub fn find_section(&self, name: &str, ty: SectionType) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|s| s.ty == ty && s.name == name)
            .map(|s| &self.bytes[s.offset..s.offset + s.size])
    }

    /// Names of every section of a type, in file order.
    pub fn section_names(&self, ty: SectionType) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| s.ty == ty)
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn load_program(&self, name: &str) -> Result<(Program, WindowConfig), CartridgeError> {
        let payload = self
            .find_section(name, SectionType::Program)
            .ok_or(CartridgeError::Truncated)?;
        load_program(payload)
    }
}

fn write_name(out: &mut Vec<u8>, name: &str) {
    let mut fixed = [0u8; MAX_SYMBOL_NAME];
    let bytes = name.as_bytes();
    let len = bytes.len().min(MAX_SYMBOL_NAME - 1);
    fixed[..len].copy_from_slice(&bytes[..len]);
    out.extend_from_slice(&fixed);
}

fn read_name(r: &mut Cursor<&[u8]>) -> Result<String, CartridgeError> {
    let mut fixed = [0u8; MAX_SYMBOL_NAME];
    std::io::Read::read_exact(r, &mut fixed)?;
    let end = fixed.iter().position(|&b| b == 0).unwrap_or(MAX_SYMBOL_NAME);
    Ok(String::from_utf8_lossy(&fixed[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile_source, MemLoader};

    fn sample_program() -> Program {
        compile_source(
            &MemLoader::new(),
            r#"{ "nodes": [
                 {"id": "v", "type": "Const", "data": {"value": [1, 2, 3, 4]}},
                 {"id": "s", "type": "Const", "data": {"value": 10}},
                 {"id": "m", "type": "Mul"},
                 {"id": "out", "type": "Output"} ],
               "links": [
                 {"src": "v", "dst": "m", "dst_port": "a"},
                 {"src": "s", "dst": "m", "dst_port": "b"},
                 {"src": "m", "dst": "out", "dst_port": "in"} ] }"#,
            "sample.json",
        )
        .unwrap()
    }

    #[test]
    fn program_image_round_trips_bitwise() {
        let program = sample_program();
        let window = WindowConfig {
            width: 640,
            height: 480,
            flags: WINDOW_VSYNC,
        };
        let bytes = save_program(&program, &window);
        let (loaded, loaded_window) = load_program(&bytes).unwrap();
        assert_eq!(loaded_window, window);
        assert_eq!(save_program(&loaded, &loaded_window), bytes);
    }

    #[test]
    fn loaded_program_matches_the_original() {
        let program = sample_program();
        let bytes = save_program(&program, &WindowConfig::default());
        let (loaded, _) = load_program(&bytes).unwrap();
        assert_eq!(loaded.instructions, program.instructions);
        assert_eq!(loaded.symbols, program.symbols);
        assert_eq!(loaded.tasks, program.tasks);
        assert_eq!(loaded.bindings, program.bindings);
        assert_eq!(loaded.register_count, program.register_count);
        assert_eq!(loaded.prototypes, program.prototypes);
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let program = sample_program();
        let mut bytes = save_program(&program, &WindowConfig::default());
        bytes[0] ^= 0xff;
        match load_program(&bytes) {
            Err(CartridgeError::BadMagic(_)) => {}
            other => panic!("expected BadMagic, got ok={}", other.is_ok()),
        }
        let mut bytes = save_program(&program, &WindowConfig::default());
        bytes[4] = 99;
        match load_program(&bytes) {
            Err(CartridgeError::BadVersion(99)) => {}
            other => panic!("expected BadVersion, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn cartridge_sections_resolve_by_name_and_type() {
        let program = sample_program();
        let mut builder = CartridgeBuilder::new();
        builder.add_program("main", &program, &WindowConfig::default());
        builder.add_section("Font", SectionType::Font, vec![1, 2, 3]);
        builder.add_section("app", SectionType::Manifest, b"{}".to_vec());
        let bytes = builder.finish();

        let cart = Cartridge::parse(bytes).unwrap();
        assert_eq!(cart.find_section("Font", SectionType::Font), Some(&[1u8, 2, 3][..]));
        assert_eq!(cart.find_section("Font", SectionType::Image), None);
        assert_eq!(cart.section_names(SectionType::Program), vec!["main"]);
        let (loaded, _) = cart.load_program("main").unwrap();
        assert_eq!(loaded.instructions, program.instructions);
    }
}
