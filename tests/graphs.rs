//! End-to-end scenarios: graph JSON in, executed register values out.

use std::sync::{Arc, Mutex};

use mathflow::backend::CpuBackend;
use mathflow::cartridge::{load_program, save_program, WindowConfig};
use mathflow::compiler::{compile_source, MemLoader};
use mathflow::scheduler::{FrameParams, TiledRenderer};
use mathflow::vm::Vm;
use mathflow::Program;

fn compile(source: &str) -> Program {
    let _ = env_logger::try_init();
    compile_source(&MemLoader::new(), source, "test.json").expect("compilation failed")
}

/// Compiles, runs one frame, and returns the `out` register's contents.
fn run_graph(source: &str) -> Vec<f32> {
    let program = compile(source);
    let out = program
        .find_symbol("out")
        .expect("graph must declare an 'out' output")
        .register;
    let mut vm = Vm::new(Arc::new(program));
    vm.exec(&CpuBackend).expect("execution failed");
    vm.tensor(out).unwrap().f32().to_vec()
}

macro_rules! graph_output {
    ($name:ident, $graph:expr, $expected:expr) => {
        #[test]
        fn $name() {
            let expected: &[f32] = $expected;
            assert_eq!(run_graph($graph), expected);
        }
    };
}

graph_output!(
    scalar_arithmetic,
    r#"{ "nodes": [
         {"id": "a", "type": "Const", "data": {"value": 3.0}},
         {"id": "b", "type": "Const", "data": {"value": 4.0}},
         {"id": "sum", "type": "Add"},
         {"id": "out", "type": "Output"} ],
       "links": [
         {"src": "a", "dst": "sum", "dst_port": "a"},
         {"src": "b", "dst": "sum", "dst_port": "b"},
         {"src": "sum", "dst": "out", "dst_port": "in"} ] }"#,
    &[7.0]
);

graph_output!(
    vector_scalar_broadcast,
    r#"{ "nodes": [
         {"id": "v", "type": "Const", "data": {"value": [1, 2, 3, 4]}},
         {"id": "ten", "type": "Const", "data": {"value": 10}},
         {"id": "prod", "type": "Mul"},
         {"id": "out", "type": "Output"} ],
       "links": [
         {"src": "v", "dst": "prod", "dst_port": "a"},
         {"src": "ten", "dst": "prod", "dst_port": "b"},
         {"src": "prod", "dst": "out", "dst_port": "in"} ] }"#,
    &[10.0, 20.0, 30.0, 40.0]
);

graph_output!(
    matrix_multiply,
    r#"{ "nodes": [
         {"id": "a", "type": "Const", "data": {"value": [[1, 2], [3, 4]]}},
         {"id": "b", "type": "Const", "data": {"value": [[5, 6], [7, 8]]}},
         {"id": "mm", "type": "MatMul"},
         {"id": "out", "type": "Output"} ],
       "links": [
         {"src": "a", "dst": "mm", "dst_port": "a"},
         {"src": "b", "dst": "mm", "dst_port": "b"},
         {"src": "mm", "dst": "out", "dst_port": "in"} ] }"#,
    &[19.0, 22.0, 43.0, 50.0]
);

graph_output!(
    select_by_mask,
    r#"{ "nodes": [
         {"id": "cond", "type": "Const", "data": {"value": [1, 0, 1], "dtype": "U8"}},
         {"id": "t", "type": "Const", "data": {"value": [10, 20, 30]}},
         {"id": "f", "type": "Const", "data": {"value": [-1, -2, -3]}},
         {"id": "sel", "type": "Select"},
         {"id": "out", "type": "Output"} ],
       "links": [
         {"src": "cond", "dst": "sel", "dst_port": "cond"},
         {"src": "t", "dst": "sel", "dst_port": "true"},
         {"src": "f", "dst": "sel", "dst_port": "false"},
         {"src": "sel", "dst": "out", "dst_port": "in"} ] }"#,
    &[10.0, -2.0, 30.0]
);

const COUNTER: &str = r#"{ "nodes": [
     {"id": "state", "type": "Memory", "data": {"init": 0}},
     {"id": "one", "type": "Const", "data": {"value": 1}},
     {"id": "next", "type": "Add"},
     {"id": "out", "type": "Output"} ],
   "links": [
     {"src": "state", "dst": "next", "dst_port": "a"},
     {"src": "one", "dst": "next", "dst_port": "b"},
     {"src": "next", "dst": "state", "dst_port": "in"},
     {"src": "next", "dst": "out", "dst_port": "in"} ] }"#;

#[test]
fn memory_feedback_counts_frames() {
    let program = compile(COUNTER);
    let state = program.find_symbol("state").unwrap().register;
    let mut vm = Vm::new(Arc::new(program));
    for _ in 0..7 {
        vm.exec(&CpuBackend).unwrap();
    }
    assert_eq!(vm.tensor(state).unwrap().f32(), &[7.0][..]);
}

#[test]
fn subgraph_call_computes_through_the_library() {
    let _ = env_logger::try_init();
    let mut loader = MemLoader::new();
    loader.insert(
        "scale.json",
        r#"{ "nodes": [
             {"id": "x", "type": "Input"},
             {"id": "k", "type": "Const", "data": {"value": 2.5}},
             {"id": "m", "type": "Mul"},
             {"id": "y", "type": "Output"} ],
           "links": [
             {"src": "x", "dst": "m", "dst_port": "a"},
             {"src": "k", "dst": "m", "dst_port": "b"},
             {"src": "m", "dst": "y", "dst_port": "in"} ] }"#,
    );
    let program = compile_source(
        &loader,
        r#"{ "nodes": [
             {"id": "v", "type": "Const", "data": {"value": [2, 4]}},
             {"id": "call", "type": "Call", "data": {"path": "scale.json"}},
             {"id": "out", "type": "Output"} ],
           "links": [
             {"src": "v", "dst": "call", "dst_port": "x"},
             {"src": "call", "dst": "out", "dst_port": "in", "src_port": "y"} ] }"#,
        "main.json",
    )
    .unwrap();
    let out = program.find_symbol("out").unwrap().register;
    let mut vm = Vm::new(Arc::new(program));
    vm.exec(&CpuBackend).unwrap();
    assert_eq!(vm.tensor(out).unwrap().f32(), &[5.0, 10.0][..]);
}

#[test]
fn cartridge_round_trip_executes_identically() {
    let program = compile(COUNTER);
    let bytes = save_program(&program, &WindowConfig::default());
    let (loaded, _) = load_program(&bytes).unwrap();

    let out = loaded.find_symbol("out").unwrap().register;
    let mut a = Vm::new(Arc::new(program));
    let mut b = Vm::new(Arc::new(loaded));
    for _ in 0..3 {
        a.exec(&CpuBackend).unwrap();
        b.exec(&CpuBackend).unwrap();
    }
    assert_eq!(a.tensor(out).unwrap(), b.tensor(out).unwrap());
}

const GRADIENT_SHADER: &str = r#"{ "nodes": [
     {"id": "u_FragX", "type": "Input", "data": {"shape": [-1, -1], "dtype": "F32"}},
     {"id": "u_ResX", "type": "Input", "data": {"shape": [], "dtype": "F32"}},
     {"id": "div", "type": "Div"},
     {"id": "out_Color", "type": "Output"} ],
   "links": [
     {"src": "u_FragX", "dst": "div", "dst_port": "a"},
     {"src": "u_ResX", "dst": "div", "dst_port": "b"},
     {"src": "div", "dst": "out_Color", "dst_port": "in"} ] }"#;

fn render_with_threads(threads: usize) -> Vec<u8> {
    let program = Arc::new(compile(GRADIENT_SHADER));
    let renderer = TiledRenderer::new(Arc::clone(&program));
    let pool = renderer.make_pool(threads);
    let params = FrameParams {
        width: 256,
        height: 256,
        time: 0.0,
        mouse: [0.0; 4],
    };
    let framebuffer = Arc::new(Mutex::new(vec![0u8; 256 * 256 * 4]));
    renderer.render(&pool, params, &framebuffer);
    let fb = framebuffer.lock().unwrap();
    fb.clone()
}

#[test]
fn tiled_dispatch_is_deterministic_across_thread_counts() {
    let _ = env_logger::try_init();
    let one = render_with_threads(1);
    let two = render_with_threads(2);
    let eight = render_with_threads(8);
    assert_eq!(one, two);
    assert_eq!(one, eight);
    // A horizontal gradient: leftmost column near 0, rightmost near 255.
    let first_red = one[0];
    let last_red = one[(255 * 4) as usize];
    assert!(first_red < 8, "left edge should be dark, got {}", first_red);
    assert!(last_red > 240, "right edge should be bright, got {}", last_red);
    // All rows are identical.
    let row = &one[..256 * 4];
    for y in 1..256 {
        assert_eq!(&one[y * 256 * 4..(y + 1) * 256 * 4], row);
    }
}

#[test]
fn runtime_errors_surface_through_the_error_word() {
    let _ = env_logger::try_init();
    // Shapes that pass static inference (dynamic dims) but collide at
    // runtime are caught by the kernels.
    let program = compile(
        r#"{ "nodes": [
             {"id": "a", "type": "Input", "data": {"shape": [-1, -1], "dtype": "F32"}},
             {"id": "b", "type": "Const", "data": {"value": [[1, 2], [3, 4]]}},
             {"id": "mm", "type": "MatMul"},
             {"id": "out", "type": "Output"} ],
           "links": [
             {"src": "a", "dst": "mm", "dst_port": "a"},
             {"src": "b", "dst": "mm", "dst_port": "b"},
             {"src": "mm", "dst": "out", "dst_port": "in"} ] }"#,
    );
    let mut vm = Vm::new(Arc::new(program));
    assert!(vm.exec(&CpuBackend).is_err());
    assert_ne!(vm.error_code(), 0);
}
