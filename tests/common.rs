use resumable::driver::{Config, transform_module};
use resumable::interp::{Fiber, FiberHost, Interpreter, Value, suspending};
use resumable::ir::{FuncIndex, Module, ValType};
use resumable::transform::TransformSummary;
use tracing_subscriber::EnvFilter;

/// The suspending import every test module calls: `[i32] -> [i32]`, echoing its argument.
pub const WAIT: &str = "env.wait";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn import_wait(module: &mut Module) -> FuncIndex {
    let signature = module.intern_signature(vec![ValType::I32], vec![ValType::I32]);
    module.import_function(WAIT, signature)
}

/// A host where `env.wait` suspends once per call and then answers with its argument.
#[allow(unused)] // false positive
pub fn echo_host(config: &Config) -> FiberHost {
    let mut host = FiberHost::new(config.runtime.clone());
    host.register(WAIT, suspending(|args| args.to_vec(), vec![Value::I32(0)]));
    host
}

#[allow(unused)] // false positive
#[track_caller]
pub fn transform(module: &mut Module) -> Vec<TransformSummary> {
    init_tracing();
    transform_module(module, &Config::default()).expect("failed to transform")
}

/// Runs `name` to completion in the transformed module.
///
/// Returns the results, the number of suspensions and the host calls that were made.
#[allow(unused)] // false positive
#[track_caller]
pub fn run_transformed(
    module: &Module,
    name: &str,
    args: &[Value],
) -> (Vec<Value>, usize, Vec<(String, Vec<Value>)>) {
    let function = module.find_function(name).expect("unknown function");
    let mut interpreter = Interpreter::new(module, echo_host(&Config::default()));
    let (results, suspensions) = interpreter
        .run_to_completion(function, args)
        .expect("failed to run");
    let host = interpreter.into_host();
    assert!(host.fiber.values.is_empty(), "fiber left values behind");
    (results, suspensions, host.calls().to_vec())
}

/// Runs `name` in an untransformed module, with every suspending import completing at once.
#[allow(unused)] // false positive
#[track_caller]
pub fn run_original(module: &Module, name: &str, args: &[Value]) -> Vec<Value> {
    let function = module.find_function(name).expect("unknown function");
    let mut host = echo_host(&Config::default());
    host.fiber = Fiber {
        can_suspend: false,
        ..Fiber::default()
    };
    let mut interpreter = Interpreter::new(module, host);
    interpreter.invoke(function, args).expect("failed to run")
}
