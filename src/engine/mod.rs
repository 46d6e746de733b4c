//! The pipeline engine: named global resources with ping-pong storage,
//! kernel instances bound to them, and per-frame orchestration.
//!
//! Resources live in the engine's free-list heap; the arena carries
//! engine-lifetime blobs such as embedded asset payloads. Each kernel
//! instance owns a resident VM. A frame copies front buffers into bound
//! input registers, executes, copies output registers into back buffers,
//! then swaps whatever was written.

use std::sync::Arc;

use failure::Fail;
use fxhash::FxHashSet;
use itertools::Itertools;
use log::{debug, info, warn};

use crate::backend::{Backend, ExecError};
use crate::mem::{Arena, Heap, HeapStats, OutOfMemory};
use crate::program::{fnv1a, Program, SYMBOL_INPUT, SYMBOL_OUTPUT};
use crate::tensor::{Dtype, TypeInfo};
use crate::vm::Vm;

/// Declared global resource.
#[derive(Clone, Debug)]
pub struct ResourceDesc {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<i32>,
}

/// One port-to-resource binding of a kernel.
#[derive(Clone, Debug)]
pub struct BindingDesc {
    pub port: String,
    pub resource: String,
}

/// Declared kernel: which program it runs, how often per frame, and how
/// its symbols map onto resources.
#[derive(Clone, Debug)]
pub struct KernelDesc {
    pub id: String,
    pub entry: String,
    pub frequency: u32,
    pub bindings: Vec<BindingDesc>,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineDesc {
    pub resources: Vec<ResourceDesc>,
    pub kernels: Vec<KernelDesc>,
}

#[derive(Debug, Fail)]
pub enum EngineError {
    #[fail(display = "kernel '{}': resource '{}' not found", kernel, resource)]
    MissingResource { kernel: String, resource: String },
    #[fail(display = "resource dependency cycle through kernel '{}'", _0)]
    ResourceCycle(String),
    #[fail(display = "engine heap exhausted ({} bytes requested)", _0)]
    OutOfMemory(usize),
    #[fail(display = "kernel '{}' failed: {:?}", kernel, error)]
    Exec { kernel: String, error: ExecError },
}

impl From<OutOfMemory> for EngineError {
    fn from(e: OutOfMemory) -> Self {
        EngineError::OutOfMemory(e.requested)
    }
}

/// A named global tensor with two heap buffers. The front buffer is read
/// during a frame, the back buffer written; a swap at frame end makes the
/// written data visible.
pub struct Resource {
    pub name: String,
    pub name_hash: u32,
    pub info: TypeInfo,
    buffers: [Option<usize>; 2],
    capacity: usize,
    front: usize,
    written: bool,
}

struct Binding {
    register: u32,
    resource: usize,
    flags: u8,
}

/// Pairs resources so that resizing the output propagates to the input
/// before the next frame.
struct ResizeTask {
    input: usize,
    output: usize,
}

pub struct KernelInstance {
    pub id: String,
    pub frequency: u32,
    vm: Vm,
    bindings: Vec<Binding>,
    resize_tasks: Vec<ResizeTask>,
}

impl KernelInstance {
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    pub heap_bytes: usize,
    pub arena_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            heap_bytes: 64 << 20,
            arena_bytes: 1 << 20,
        }
    }
}

pub struct Engine {
    heap: Heap,
    arena: Arena,
    resources: Vec<Resource>,
    kernels: Vec<KernelInstance>,
    frame: u64,
}

impl Engine {
    /// Builds an engine from a pipeline description and one compiled
    /// program per kernel, in pipeline order.
    pub fn new(
        desc: &PipelineDesc,
        programs: Vec<Arc<Program>>,
        config: EngineConfig,
    ) -> Result<Engine, EngineError> {
        assert_eq!(desc.kernels.len(), programs.len());
        info!(
            "binding pipeline: {} resources, {} kernels",
            desc.resources.len(),
            desc.kernels.len()
        );

        let mut heap = Heap::with_capacity(config.heap_bytes);
        let arena = Arena::with_capacity(config.arena_bytes);

        let mut resources = Vec::with_capacity(desc.resources.len());
        for r in &desc.resources {
            let info = TypeInfo::with_shape(r.dtype, &r.shape);
            let capacity = if info.is_dynamic() { 0 } else { info.byte_len() };
            let buffers = if capacity > 0 {
                [Some(heap.alloc(capacity)?), Some(heap.alloc(capacity)?)]
            } else {
                [None, None]
            };
            resources.push(Resource {
                name: r.name.clone(),
                name_hash: fnv1a(&r.name),
                info,
                buffers,
                capacity,
                front: 0,
                written: false,
            });
        }

        let mut kernels = Vec::with_capacity(desc.kernels.len());
        for (k, program) in desc.kernels.iter().zip(programs.into_iter()) {
            let instance = build_kernel(k, program, &resources)?;
            kernels.push(instance);
        }

        let mut engine = Engine {
            heap,
            arena,
            resources,
            kernels,
            frame: 0,
        };
        engine.reject_cycles(desc)?;
        engine.apply_initial_data();
        Ok(engine)
    }

    /// A single bare program becomes a one-kernel pipeline whose
    /// resources mirror its symbols.
    pub fn synthesize_pipeline(program: &Program, kernel_id: &str) -> PipelineDesc {
        let mut desc = PipelineDesc::default();
        let mut kernel = KernelDesc {
            id: kernel_id.to_string(),
            entry: String::new(),
            frequency: 1,
            bindings: Vec::new(),
        };
        for sym in &program.symbols {
            let proto = &program.prototypes[sym.register as usize];
            desc.resources.push(ResourceDesc {
                name: sym.name.clone(),
                dtype: proto.info.dtype,
                shape: proto.info.dims().to_vec(),
            });
            kernel.bindings.push(BindingDesc {
                port: sym.name.clone(),
                resource: sym.name.clone(),
            });
        }
        desc.kernels.push(kernel);
        desc
    }

    /// Runs one frame: every kernel at its frequency, then the ping-pong
    /// swap and auto-resize propagation.
    pub fn dispatch(&mut self, backend: &dyn Backend) -> Result<(), EngineError> {
        let heap = &mut self.heap;
        let resources = &mut self.resources;

        for kernel in &mut self.kernels {
            for _ in 0..kernel.frequency.max(1) {
                // Front buffers into bound input registers.
                for b in &kernel.bindings {
                    if b.flags & SYMBOL_INPUT == 0 {
                        continue;
                    }
                    let res = &resources[b.resource];
                    if let Some(offset) = res.buffers[res.front] {
                        let len = res.info.byte_len();
                        if let Some(t) = kernel.vm.map_tensor(b.register, crate::vm::AccessMode::Write) {
                            t.info = res.info;
                            t.copy_from_le_bytes(heap.bytes(offset, len));
                        }
                    }
                }

                kernel.vm.exec(backend).map_err(|error| {
                    kernel.vm.clear_error();
                    EngineError::Exec {
                        kernel: kernel.id.clone(),
                        error,
                    }
                })?;

                // Output registers into back buffers.
                for b in &kernel.bindings {
                    if b.flags & SYMBOL_OUTPUT == 0 {
                        continue;
                    }
                    let tensor = match kernel.vm.tensor(b.register) {
                        Some(t) if t.has_data() => t.clone(),
                        _ => continue,
                    };
                    let res = &mut resources[b.resource];
                    let bytes = tensor.to_le_bytes();
                    if bytes.len() != res.capacity || res.buffers[0].is_none() {
                        resize_resource(heap, res, tensor.info)?;
                    }
                    let back = 1 - res.front;
                    if let Some(offset) = res.buffers[back] {
                        heap.bytes_mut(offset, bytes.len()).copy_from_slice(&bytes);
                        res.written = true;
                    }
                }
            }
        }

        for res in resources.iter_mut() {
            if res.written {
                res.front = 1 - res.front;
                res.written = false;
            }
        }

        // Auto-resize: an output that changed size drags its paired input
        // along for the next frame.
        let pairs: Vec<(usize, usize)> = self
            .kernels
            .iter()
            .flat_map(|k| k.resize_tasks.iter().map(|t| (t.input, t.output)))
            .collect();
        for (input, output) in pairs {
            let target_info = resources[output].info;
            let target_cap = resources[output].capacity;
            if resources[input].capacity != target_cap {
                debug!(
                    "auto-resize: '{}' follows its paired output to {} bytes",
                    resources[input].name, target_cap
                );
                resize_resource(heap, &mut resources[input], target_info)?;
            }
        }

        self.frame += 1;
        Ok(())
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn kernels(&self) -> &[KernelInstance] {
        &self.kernels
    }

    pub fn kernel_mut(&mut self, idx: usize) -> &mut KernelInstance {
        &mut self.kernels[idx]
    }

    pub fn find_resource(&self, name: &str) -> Option<usize> {
        let hash = fnv1a(name);
        self.resources.iter().position(|r| r.name_hash == hash)
    }

    pub fn resource_info(&self, idx: usize) -> &TypeInfo {
        &self.resources[idx].info
    }

    /// Copy of a resource's current front buffer.
    pub fn read_front(&self, idx: usize) -> Vec<u8> {
        let res = &self.resources[idx];
        match res.buffers[res.front] {
            Some(offset) => self.heap.bytes(offset, res.info.byte_len()).to_vec(),
            None => Vec::new(),
        }
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// Stores an asset blob for the lifetime of the engine.
    pub fn store_asset(&mut self, bytes: &[u8]) -> Result<(usize, usize), EngineError> {
        let offset = self.arena.push_bytes(bytes)?;
        Ok((offset, bytes.len()))
    }

    pub fn asset_bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.arena.bytes(offset, len)
    }

    /// Rejects pipelines whose resource graph cycles across kernels.
    /// Self-feedback through ping-pong buffers is legal.
    fn reject_cycles(&self, desc: &PipelineDesc) -> Result<(), EngineError> {
        let n = self.kernels.len();
        let writes = self
            .kernels
            .iter()
            .map(|k| {
                k.bindings
                    .iter()
                    .filter(|x| x.flags & SYMBOL_OUTPUT != 0)
                    .map(|x| x.resource)
                    .collect_vec()
            })
            .collect_vec();
        let mut edges: FxHashSet<(usize, usize)> = FxHashSet::default();
        for (i, _) in self.kernels.iter().enumerate() {
            for (j, b) in self.kernels.iter().enumerate() {
                if i == j {
                    continue;
                }
                if b.bindings
                    .iter()
                    .any(|x| x.flags & SYMBOL_INPUT != 0 && writes[i].contains(&x.resource))
                {
                    edges.insert((i, j));
                }
            }
        }
        // DFS over the kernel graph.
        let mut state = vec![0u8; n];
        for start in 0..n {
            if !dfs(start, &edges, &mut state, n) {
                return Err(EngineError::ResourceCycle(
                    desc.kernels[start].id.clone(),
                ));
            }
        }
        Ok(())
    }

    /// Seeds resources from constant program tensors bound to them.
    fn apply_initial_data(&mut self) {
        let heap = &mut self.heap;
        for kernel in &self.kernels {
            let program = kernel.vm.program();
            for sym in &program.symbols {
                let proto = &program.prototypes[sym.register as usize];
                if !proto.has_data() {
                    continue;
                }
                let binding = kernel.bindings.iter().find(|b| b.register == sym.register);
                if let Some(binding) = binding {
                    let res = &mut self.resources[binding.resource];
                    let bytes = proto.to_le_bytes();
                    if bytes.len() == res.capacity {
                        debug!(
                            "seeding resource '{}' from kernel '{}' symbol '{}'",
                            res.name, kernel.id, sym.name
                        );
                        for buf in &res.buffers {
                            if let Some(offset) = *buf {
                                heap.bytes_mut(offset, bytes.len()).copy_from_slice(&bytes);
                            }
                        }
                    } else {
                        warn!(
                            "resource '{}': initial data size {} does not match capacity {}",
                            res.name,
                            bytes.len(),
                            res.capacity
                        );
                    }
                }
            }
        }
    }
}

fn dfs(node: usize, edges: &FxHashSet<(usize, usize)>, state: &mut [u8], n: usize) -> bool {
    if state[node] == 2 {
        return true;
    }
    if state[node] == 1 {
        return false;
    }
    state[node] = 1;
    for next in 0..n {
        if edges.contains(&(node, next)) && !dfs(next, edges, state, n) {
            return false;
        }
    }
    state[node] = 2;
    true
}

fn build_kernel(
    desc: &KernelDesc,
    program: Arc<Program>,
    resources: &[Resource],
) -> Result<KernelInstance, EngineError> {
    let mut bindings = Vec::new();
    let mut resize_tasks = Vec::new();

    for b in &desc.bindings {
        let symbol = match program.find_symbol(&b.port) {
            Some(s) => s.clone(),
            None => {
                warn!(
                    "kernel '{}': port '{}' not found in program symbols",
                    desc.id, b.port
                );
                continue;
            }
        };
        let res_hash = fnv1a(&b.resource);
        let resource = resources
            .iter()
            .position(|r| r.name_hash == res_hash)
            .ok_or_else(|| EngineError::MissingResource {
                kernel: desc.id.clone(),
                resource: b.resource.clone(),
            })?;
        bindings.push(Binding {
            register: symbol.register,
            resource,
            flags: symbol.flags,
        });

        // Auto-resize pairing through the related-name hash.
        if symbol.related_name_hash != 0 {
            let related = desc
                .bindings
                .iter()
                .find(|b2| fnv1a(&b2.port) == symbol.related_name_hash)
                .and_then(|b2| {
                    let hash = fnv1a(&b2.resource);
                    resources.iter().position(|r| r.name_hash == hash)
                });
            if let Some(output) = related {
                resize_tasks.push(ResizeTask {
                    input: resource,
                    output,
                });
            }
        }
    }

    Ok(KernelInstance {
        id: desc.id.clone(),
        frequency: desc.frequency,
        vm: Vm::new(program),
        bindings,
        resize_tasks,
    })
}

fn resize_resource(
    heap: &mut Heap,
    res: &mut Resource,
    info: TypeInfo,
) -> Result<(), EngineError> {
    let capacity = info.byte_len();
    for buf in res.buffers.iter_mut() {
        *buf = Some(match *buf {
            Some(offset) => heap.realloc(offset, capacity)?,
            None => heap.alloc(capacity)?,
        });
    }
    debug!(
        "resource '{}' resized: {} -> {} bytes",
        res.name, res.capacity, capacity
    );
    res.capacity = capacity;
    res.info = info;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::compiler::{compile_source, MemLoader};

    fn counter_program() -> Arc<Program> {
        Arc::new(
            compile_source(
                &MemLoader::new(),
                r#"{ "nodes": [
                     {"id": "u_State_in", "type": "Input", "data": {"shape": [1], "dtype": "F32"}},
                     {"id": "one", "type": "Const", "data": {"value": 1}},
                     {"id": "next", "type": "Add"},
                     {"id": "u_State_out", "type": "Output"} ],
                   "links": [
                     {"src": "u_State_in", "dst": "next", "dst_port": "a"},
                     {"src": "one", "dst": "next", "dst_port": "b"},
                     {"src": "next", "dst": "u_State_out", "dst_port": "in"} ] }"#,
                "counter.json",
            )
            .unwrap(),
        )
    }

    fn counter_pipeline() -> PipelineDesc {
        PipelineDesc {
            resources: vec![ResourceDesc {
                name: "State".to_string(),
                dtype: Dtype::F32,
                shape: vec![1],
            }],
            kernels: vec![KernelDesc {
                id: "count".to_string(),
                entry: "counter.json".to_string(),
                frequency: 1,
                bindings: vec![
                    BindingDesc {
                        port: "u_State_in".to_string(),
                        resource: "State".to_string(),
                    },
                    BindingDesc {
                        port: "u_State_out".to_string(),
                        resource: "State".to_string(),
                    },
                ],
            }],
        }
    }

    #[test]
    fn ping_pong_state_advances_per_frame() {
        let mut engine = Engine::new(
            &counter_pipeline(),
            vec![counter_program()],
            EngineConfig::default(),
        )
        .unwrap();
        for _ in 0..5 {
            engine.dispatch(&CpuBackend).unwrap();
        }
        let idx = engine.find_resource("State").unwrap();
        let bytes = engine.read_front(idx);
        let value = f32::from_bits(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]));
        assert_eq!(value, 5.0);
    }

    #[test]
    fn missing_resource_is_fatal() {
        let mut desc = counter_pipeline();
        desc.kernels[0].bindings[0].resource = "Nope".to_string();
        let err = Engine::new(&desc, vec![counter_program()], EngineConfig::default());
        match err {
            Err(EngineError::MissingResource { resource, .. }) => assert_eq!(resource, "Nope"),
            other => panic!("expected MissingResource, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn missing_port_only_warns() {
        let mut desc = counter_pipeline();
        desc.kernels[0].bindings.push(BindingDesc {
            port: "u_Ghost".to_string(),
            resource: "State".to_string(),
        });
        assert!(Engine::new(&desc, vec![counter_program()], EngineConfig::default()).is_ok());
    }

    #[test]
    fn cross_kernel_cycle_is_rejected() {
        let copy_graph = |input: &str, output: &str| {
            format!(
                r#"{{ "nodes": [
                     {{"id": "{}", "type": "Input", "data": {{"shape": [1], "dtype": "F32"}}}},
                     {{"id": "{}", "type": "Output"}} ],
                   "links": [{{"src": "{}", "dst": "{}", "dst_port": "in"}}] }}"#,
                input, output, input, output
            )
        };
        let a = Arc::new(
            compile_source(&MemLoader::new(), &copy_graph("u_X", "o_Y"), "a.json").unwrap(),
        );
        let b = Arc::new(
            compile_source(&MemLoader::new(), &copy_graph("u_Y", "o_X"), "b.json").unwrap(),
        );
        let desc = PipelineDesc {
            resources: vec![
                ResourceDesc {
                    name: "X".to_string(),
                    dtype: Dtype::F32,
                    shape: vec![1],
                },
                ResourceDesc {
                    name: "Y".to_string(),
                    dtype: Dtype::F32,
                    shape: vec![1],
                },
            ],
            kernels: vec![
                KernelDesc {
                    id: "a".to_string(),
                    entry: String::new(),
                    frequency: 1,
                    bindings: vec![
                        BindingDesc {
                            port: "u_X".to_string(),
                            resource: "X".to_string(),
                        },
                        BindingDesc {
                            port: "o_Y".to_string(),
                            resource: "Y".to_string(),
                        },
                    ],
                },
                KernelDesc {
                    id: "b".to_string(),
                    entry: String::new(),
                    frequency: 1,
                    bindings: vec![
                        BindingDesc {
                            port: "u_Y".to_string(),
                            resource: "Y".to_string(),
                        },
                        BindingDesc {
                            port: "o_X".to_string(),
                            resource: "X".to_string(),
                        },
                    ],
                },
            ],
        };
        match Engine::new(&desc, vec![a, b], EngineConfig::default()) {
            Err(EngineError::ResourceCycle(_)) => {}
            other => panic!("expected ResourceCycle, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn assets_persist_in_the_arena() {
        let mut engine = Engine::new(
            &counter_pipeline(),
            vec![counter_program()],
            EngineConfig::default(),
        )
        .unwrap();
        let (offset, len) = engine.store_asset(b"glyph atlas bytes").unwrap();
        engine.dispatch(&CpuBackend).unwrap();
        assert_eq!(engine.asset_bytes(offset, len), b"glyph atlas bytes");
    }

    #[test]
    fn dynamic_resource_allocates_on_first_write() {
        let program = Arc::new(
            compile_source(
                &MemLoader::new(),
                r#"{ "nodes": [
                     {"id": "v", "type": "Const", "data": {"value": [1, 2, 3, 4]}},
                     {"id": "out_Data", "type": "Output"} ],
                   "links": [{"src": "v", "dst": "out_Data", "dst_port": "in"}] }"#,
                "emit.json",
            )
            .unwrap(),
        );
        let desc = PipelineDesc {
            resources: vec![ResourceDesc {
                name: "Data".to_string(),
                dtype: Dtype::F32,
                shape: vec![-1],
            }],
            kernels: vec![KernelDesc {
                id: "emit".to_string(),
                entry: String::new(),
                frequency: 1,
                bindings: vec![BindingDesc {
                    port: "out_Data".to_string(),
                    resource: "Data".to_string(),
                }],
            }],
        };
        let mut engine = Engine::new(&desc, vec![program], EngineConfig::default()).unwrap();
        let idx = engine.find_resource("Data").unwrap();
        assert_eq!(engine.read_front(idx).len(), 0);
        engine.dispatch(&CpuBackend).unwrap();
        assert_eq!(engine.resource_info(idx).dims(), &[4]);
        assert_eq!(engine.read_front(idx).len(), 16);
    }
}
