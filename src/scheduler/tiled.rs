//! Tiled shader dispatch: fans a 2-D screen-space kernel across the
//! worker pool as row bands.
//!
//! Each tile stages the frame builtins plus its own coordinate gradients
//! into a worker-resident VM, executes the bytecode, and composes its
//! `out_Color` register into the shared framebuffer. Tiles cover
//! disjoint rows, so composition is order-independent and a frame is
//! bitwise identical for any worker count.

use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::backend::CpuBackend;
use crate::program::Program;
use crate::tensor::{Dtype, Tensor, TypeInfo};
use crate::vm::{AccessMode, Vm};

use super::WorkerPool;

/// Thread-local worker state: a resident VM staged against the shared
/// program, its error word shared across the whole pool.
pub struct WorkerVm {
    pub vm: Vm,
}

/// Per-frame uniform values.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameParams {
    pub width: u32,
    pub height: u32,
    pub time: f32,
    pub mouse: [f32; 4],
}

/// Cached symbol registers of the shader contract.
#[derive(Clone, Copy, Default)]
struct Uniforms {
    time: Option<u32>,
    resolution: Option<u32>,
    res_x: Option<u32>,
    res_y: Option<u32>,
    aspect: Option<u32>,
    mouse: Option<u32>,
    frag_x: Option<u32>,
    frag_y: Option<u32>,
    out_color: Option<u32>,
}

pub struct TiledRenderer {
    program: Arc<Program>,
    uniforms: Uniforms,
}

impl TiledRenderer {
    pub fn new(program: Arc<Program>) -> Self {
        let find = |name: &str| program.find_symbol(name).map(|s| s.register);
        let uniforms = Uniforms {
            time: find("u_Time"),
            resolution: find("u_Resolution"),
            res_x: find("u_ResX"),
            res_y: find("u_ResY"),
            aspect: find("u_Aspect"),
            mouse: find("u_Mouse"),
            frag_x: find("u_FragX"),
            frag_y: find("u_FragY"),
            out_color: find("out_Color"),
        };
        if uniforms.out_color.is_none() {
            warn!("shader program has no 'out_Color'; frames will stay black");
        }
        TiledRenderer { program, uniforms }
    }

    /// Builds a pool whose workers each hold a VM over this program. All
    /// workers share one error word, the batch kill switch.
    pub fn make_pool(&self, num_threads: usize) -> WorkerPool<WorkerVm> {
        let program = Arc::clone(&self.program);
        let error = Arc::new(AtomicU32::new(0));
        WorkerPool::new(num_threads, move |_| WorkerVm {
            vm: Vm::with_error_word(Arc::clone(&program), Arc::clone(&error)),
        })
    }

    /// Renders one frame into an RGBA8 framebuffer of
    /// `width * height * 4` bytes.
    pub fn render(
        &self,
        pool: &WorkerPool<WorkerVm>,
        params: FrameParams,
        framebuffer: &Arc<Mutex<Vec<u8>>>,
    ) {
        let tiles = (pool.thread_count() as u32).max(4).min(params.height.max(1));
        let tile_height = (params.height + tiles - 1) / tiles;
        let uniforms = self.uniforms;
        let fb = Arc::clone(framebuffer);

        pool.run(tiles, move |tile, worker| {
            let y_start = tile * tile_height;
            let y_end = (y_start + tile_height).min(params.height);
            if y_start >= y_end {
                return;
            }
            run_tile(&mut worker.vm, &uniforms, params, y_start, y_end, &fb);
        });
    }
}

fn run_tile(
    vm: &mut Vm,
    uniforms: &Uniforms,
    params: FrameParams,
    y_start: u32,
    y_end: u32,
    framebuffer: &Arc<Mutex<Vec<u8>>>,
) {
    let w = params.width as usize;
    let local_h = (y_end - y_start) as usize;

    vm.reset();
    vm.coords.global_offset = [y_start, 0, 0];
    vm.coords.local_size = [local_h as u32, params.width, 1];
    vm.coords.global_size = [params.height, params.width, 1];

    stage_scalar(vm, uniforms.time, params.time);
    stage_scalar(vm, uniforms.res_x, params.width as f32);
    stage_scalar(vm, uniforms.res_y, params.height as f32);
    stage_scalar(
        vm,
        uniforms.aspect,
        params.width as f32 / params.height.max(1) as f32,
    );
    stage_vec(
        vm,
        uniforms.resolution,
        &[params.width as f32, params.height as f32],
    );
    stage_vec(vm, uniforms.mouse, &params.mouse);

    // Coordinate gradients at pixel centres; frag_y is offset by the
    // tile's first row.
    if let Some(reg) = uniforms.frag_x {
        let mut values = Vec::with_capacity(local_h * w);
        for _ in 0..local_h {
            for x in 0..w {
                values.push(x as f32 + 0.5);
            }
        }
        stage_grid(vm, reg, local_h, w, values);
    }
    if let Some(reg) = uniforms.frag_y {
        let mut values = Vec::with_capacity(local_h * w);
        for y in 0..local_h {
            let v = (y_start + y as u32) as f32 + 0.5;
            values.extend(std::iter::repeat(v).take(w));
        }
        stage_grid(vm, reg, local_h, w, values);
    }

    if vm.exec(&CpuBackend).is_err() {
        // The shared error word already carries the code; abandon the
        // tile and let the batch die.
        return;
    }

    if let Some(out) = uniforms.out_color.and_then(|r| vm.tensor(r)) {
        let rgba = tile_to_rgba(out, w, local_h);
        let mut fb = framebuffer.lock().unwrap();
        let pitch = w * 4;
        let offset = y_start as usize * pitch;
        let end = offset + rgba.len();
        if end <= fb.len() {
            fb[offset..end].copy_from_slice(&rgba);
        }
    }
}

fn stage_scalar(vm: &mut Vm, reg: Option<u32>, value: f32) {
    if let Some(reg) = reg {
        if let Some(t) = vm.map_tensor(reg, AccessMode::Write) {
            *t = Tensor::scalar_f32(value);
        }
    }
}

fn stage_vec(vm: &mut Vm, reg: Option<u32>, values: &[f32]) {
    if let Some(reg) = reg {
        if let Some(t) = vm.map_tensor(reg, AccessMode::Write) {
            *t = Tensor::from_f32(&[values.len() as i32], values.to_vec());
        }
    }
}

fn stage_grid(vm: &mut Vm, reg: u32, h: usize, w: usize, values: Vec<f32>) {
    if let Some(t) = vm.map_tensor(reg, AccessMode::Write) {
        *t = Tensor::from_f32(&[h as i32, w as i32], values);
    }
}

/// Converts an `out_Color` register (1, 3 or 4 channels, [0,1] floats)
/// into RGBA8 rows for one tile.
fn tile_to_rgba(out: &Tensor, w: usize, h: usize) -> Vec<u8> {
    let channels = color_channels(&out.info);
    let src = out.f32();
    let mut rgba = vec![0u8; w * h * 4];
    let quantize = |v: f32| -> u8 { (v.max(0.0).min(1.0) * 255.0) as u8 };

    for p in 0..w * h {
        let (r, g, b, a) = match channels {
            4 => {
                let i = p * 4;
                (get(src, i), get(src, i + 1), get(src, i + 2), get(src, i + 3))
            }
            3 => {
                let i = p * 3;
                (get(src, i), get(src, i + 1), get(src, i + 2), 1.0)
            }
            _ => {
                let v = get(src, p);
                (v, v, v, 1.0)
            }
        };
        rgba[p * 4] = quantize(r);
        rgba[p * 4 + 1] = quantize(g);
        rgba[p * 4 + 2] = quantize(b);
        rgba[p * 4 + 3] = quantize(a);
    }
    rgba
}

fn color_channels(info: &TypeInfo) -> usize {
    if info.dtype != Dtype::F32 {
        return 1;
    }
    if info.ndim >= 3 {
        info.shape[info.ndim - 1].max(1) as usize
    } else {
        1
    }
}

fn get(src: &[f32], i: usize) -> f32 {
    src.get(i).copied().unwrap_or(0.0)
}
